//! `demo`: greets someone and leaves a note for later steps.

use pipestep_lifecycle::{StepContext, StepEntry, typed};
use pipestep_types::StepResult;
use serde::Deserialize;

const METADATA: &str = include_str!("../../metadata/demo.yaml");

#[derive(Debug, Deserialize)]
struct DemoOptions {
    name: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub fn entry() -> anyhow::Result<StepEntry> {
    Ok(StepEntry::from_yaml(METADATA, typed(run))?)
}

async fn run(options: DemoOptions, ctx: StepContext) -> StepResult<()> {
    tracing::info!("hello {}", options.name);
    if options.level.as_deref() == Some("debug") {
        tracing::debug!(name = %options.name, correlation_id = ctx.correlation_id(), "Greeting details");
    }
    if let Some(token) = &options.token {
        tracing::info!("authenticating with token {}", token);
    }

    ctx.set_env("greeting", "text", "hi");
    ctx.set_custom_data("greeted", options.name);
    Ok(())
}
