use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use crate::cli::output::{OutputFormat, OutputOptions};
use crate::cli::renderer;
use crate::core::fetcher::Fetcher;

/// One-shot fetch: print the normalized summary and exit.
pub async fn run(timeout: Duration, opts: &OutputOptions) -> Result<()> {
    let mut fetcher = Fetcher::new_snapshot().await;
    let deadline = Instant::now() + timeout;

    let result = fetcher.fetch(deadline).await;
    let _ = fetcher.close().await;
    let summary = result?;

    match opts.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!("{}", renderer::render_summary(&summary, opts.use_color));
        }
    }
    Ok(())
}
