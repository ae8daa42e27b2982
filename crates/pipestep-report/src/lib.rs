//! Persistence of step outputs.
//!
//! Two responsibilities:
//! - **Pipeline environment**: `(category, name, value)` outputs written to
//!   `<env-root>/<category>/<name>` so later steps can read them
//! - **Reports**: a manifest of report files and links at
//!   `<env-root>/reports.json` / `links.json`, plus optional upload of
//!   matching files to a bucket
//!
//! All reads and writes of the pipeline environment go through
//! [`PipelineEnvironment`] so encoding and error handling live in one place.

pub mod bucket;
pub mod env;
pub mod error;
pub mod outputs;
pub mod persist;
pub mod reports;

pub use bucket::{BucketUploader, GcsUploader};
pub use env::PipelineEnvironment;
pub use error::{ReportError, Result};
pub use outputs::{EnvEntry, Measurement, MeasurementKind, StepOutputs};
pub use persist::{PersistSummary, persist_environment};
pub use reports::{
    Link, PublishSummary, ReportPublisher, ReportRecord, read_links, read_manifest,
    write_manifest,
};
