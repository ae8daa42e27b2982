//! `shellExecute`: runs scripts through the command runner.

use pipestep_exec::CommandSpec;
use pipestep_lifecycle::{StepContext, StepEntry, typed};
use pipestep_types::{StepError, StepResult};
use serde::Deserialize;

const METADATA: &str = include_str!("../../metadata/shellExecute.yaml");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellOptions {
    sources: Vec<String>,
    #[serde(default)]
    script_arguments: Vec<String>,
}

pub fn entry() -> anyhow::Result<StepEntry> {
    Ok(StepEntry::from_yaml(METADATA, typed(run))?)
}

async fn run(options: ShellOptions, ctx: StepContext) -> StepResult<()> {
    for (index, source) in options.sources.iter().enumerate() {
        ctx.check_cancelled()?;
        let path = ctx.workdir().join(source);
        if !path.is_file() {
            return Err(StepError::configuration(format!(
                "script '{}' does not exist",
                source
            )));
        }

        let mut spec = CommandSpec::new(path.display().to_string()).workdir(ctx.workdir());
        if let Some(arguments) = options.script_arguments.get(index) {
            spec = spec.args(
                arguments
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty()),
            );
        }

        tracing::info!(script = %source, "Executing script");
        ctx.runner().run_streaming(&spec).await?;
    }

    ctx.set_custom_data("scripts", options.sources.len().to_string());
    Ok(())
}
