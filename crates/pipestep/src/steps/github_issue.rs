//! `githubCreateIssue`: opens an issue through the GitHub REST API.

use pipestep_exec::{ExecError, ensure_success};
use pipestep_lifecycle::{StepContext, StepEntry, typed};
use pipestep_report::Link;
use pipestep_types::{StepError, StepResult};
use serde::{Deserialize, Serialize};

const METADATA: &str = include_str!("../../metadata/githubCreateIssue.yaml");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueOptions {
    api_url: String,
    owner: String,
    repository: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_file_path: Option<String>,
    #[serde(default)]
    assignees: Vec<String>,
    token: String,
}

#[derive(Debug, Serialize)]
struct NewIssue<'a> {
    title: &'a str,
    body: &'a str,
    assignees: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    number: u64,
    html_url: String,
}

pub fn entry() -> anyhow::Result<StepEntry> {
    Ok(StepEntry::from_yaml(METADATA, typed(run))?)
}

async fn run(options: IssueOptions, ctx: StepContext) -> StepResult<()> {
    let body = issue_body(&options, &ctx)?;
    let url = format!(
        "{}/repos/{}/{}/issues",
        options.api_url.trim_end_matches('/'),
        options.owner,
        options.repository
    );
    let issue = NewIssue {
        title: &options.title,
        body: &body,
        assignees: options
            .assignees
            .iter()
            .map(String::as_str)
            .filter(|a| !a.is_empty())
            .collect(),
    };

    tracing::debug!(url = %url, "Creating GitHub issue");
    let request = ctx
        .http()
        .post(&url)
        .bearer_auth(&options.token)
        .header("Accept", "application/vnd.github+json")
        .json(&issue);
    let response = ensure_success(ctx.http().send(request).await?).await?;
    let created: CreatedIssue = response.json().await.map_err(ExecError::from)?;

    tracing::info!(number = created.number, url = %created.html_url, "Issue created");
    ctx.add_link(Link::new(format!("Issue #{}", created.number), created.html_url));
    Ok(())
}

fn issue_body(options: &IssueOptions, ctx: &StepContext) -> StepResult<String> {
    match (options.body_file_path.as_deref(), options.body.as_deref()) {
        (Some(path), _) if !path.is_empty() => std::fs::read_to_string(ctx.workdir().join(path))
            .map_err(|e| {
                StepError::configuration(format!("cannot read issue body from '{}': {}", path, e))
            }),
        (_, Some(body)) if !body.is_empty() => Ok(body.to_string()),
        _ => Err(StepError::configuration(
            "either body or bodyFilePath must be set",
        )),
    }
}
