use std::time::Duration;

use anyhow::Result;

use crate::cli::output::{OutputFormat, OutputOptions};
use crate::cli::renderer;
use crate::core::doctor;

/// Run the health probes. Returns whether the report came back healthy so
/// the caller can pick the exit code.
pub async fn run(timeout: Duration, opts: &OutputOptions) -> Result<bool> {
    let report = tokio::time::timeout(timeout, doctor::run_doctor())
        .await
        .map_err(|_| anyhow::anyhow!("doctor timed out after {}s", timeout.as_secs()))?;

    match opts.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("{}", renderer::render_doctor(&report, opts.use_color));
        }
    }
    Ok(report.healthy())
}
