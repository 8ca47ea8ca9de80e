use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use tokio::time::Instant;

use crate::cli::output::OutputOptions;
use crate::cli::renderer;
use crate::core::fetcher::Fetcher;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Live mode: refetch on an interval and repaint the snapshot block.
/// Estimates warm up in the background, so early frames may show
/// "warming token estimate" until the journals have been replayed.
pub async fn run(interval: Duration, timeout: Duration, opts: &OutputOptions) -> Result<()> {
    let mut fetcher = Fetcher::new_default().await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }

        let deadline = Instant::now() + timeout;
        let frame = match fetcher.fetch(deadline).await {
            Ok(summary) => renderer::render_summary(&summary, opts.use_color),
            Err(err) => {
                if opts.use_color {
                    format!(" {} {err}", "fetch failed:".red())
                } else {
                    format!(" fetch failed: {err}")
                }
            }
        };

        let updated = Local::now().format("%H:%M:%S");
        print!(
            "{CLEAR_SCREEN}{frame}\n\n  updated {updated} · refresh {}s · ctrl-c to quit\n",
            interval.as_secs()
        );
        use std::io::Write;
        std::io::stdout().flush().ok();
    }

    let _ = fetcher.close().await;
    Ok(())
}
