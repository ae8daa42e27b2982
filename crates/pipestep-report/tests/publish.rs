//! Report publication against a mock storage endpoint.

use std::sync::Arc;
use std::time::Duration;

use pipestep_exec::HttpClient;
use pipestep_report::{
    GcsUploader, Link, PipelineEnvironment, ReportPublisher, ReportRecord, read_links,
    read_manifest,
};
use pipestep_types::ReportOutput;
use tempfile::TempDir;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> HttpClient {
    HttpClient::builder()
        .max_retries(0)
        .initial_backoff(Duration::from_millis(1))
        .build()
        .unwrap()
}

fn sbom_pattern() -> Vec<ReportOutput> {
    vec![ReportOutput {
        file_pattern: "**/bom-*.xml".to_string(),
        report_type: "sbom".to_string(),
        sub_folder: "sbom".to_string(),
    }]
}

#[tokio::test]
async fn test_uploads_matching_reports_to_folder() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/reports-bucket/o"))
        .and(query_param("uploadType", "media"))
        .and(query_param("name", "run-42/sbom/target/bom-app.xml"))
        .and(body_string("<bom/>"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(work.path().join("target")).unwrap();
    std::fs::write(work.path().join("target/bom-app.xml"), "<bom/>").unwrap();
    std::fs::write(work.path().join("target/other.xml"), "<x/>").unwrap();

    let env = PipelineEnvironment::new(root.path());
    let uploader = GcsUploader::new(client(), server.uri(), "reports-bucket");
    let publisher =
        ReportPublisher::new(env.clone(), work.path()).with_uploader(Arc::new(uploader), "run-42");

    let summary = publisher
        .publish(&sbom_pattern(), &[], &[Link::new("Dashboard", "https://dash/1")])
        .await
        .unwrap();

    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.upload_failures, 0);
    assert!(summary.is_success());

    let manifest = read_manifest(&env).unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].target, "target/bom-app.xml");
    assert_eq!(read_links(&env).unwrap()[0].name, "Dashboard");
}

#[tokio::test]
async fn test_optional_upload_failure_does_not_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    std::fs::write(work.path().join("bom-a.xml"), "a").unwrap();

    let publisher = ReportPublisher::new(PipelineEnvironment::new(root.path()), work.path())
        .with_uploader(Arc::new(GcsUploader::new(client(), server.uri(), "b")), "");

    let summary = publisher.publish(&sbom_pattern(), &[], &[]).await.unwrap();
    assert_eq!(summary.upload_failures, 1);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_mandatory_upload_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let work = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    std::fs::write(work.path().join("bom-a.xml"), "a").unwrap();

    let publisher = ReportPublisher::new(PipelineEnvironment::new(root.path()), work.path())
        .with_uploader(Arc::new(GcsUploader::new(client(), server.uri(), "b")), "f");

    let records = [ReportRecord::new("bom-a.xml").named("SBOM").mandatory()];
    let summary = publisher.publish(&sbom_pattern(), &records, &[]).await.unwrap();

    assert_eq!(summary.records, 1);
    assert_eq!(summary.mandatory_failures, vec!["bom-a.xml".to_string()]);
    assert!(!summary.is_success());
}
