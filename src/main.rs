mod cli;
mod core;

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cli::output::{detect_color, OutputFormat, OutputOptions};

#[derive(Parser)]
#[command(
    name = "codex-usage-monitor",
    about = "Terminal monitor for Codex subscription usage",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Continuously refetch and repaint usage (default)
    Watch {
        /// Poll interval in seconds
        #[arg(long, default_value_t = 60)]
        interval: u64,

        /// Per-poll fetch timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Fetch once and print the summary
    Snapshot {
        /// Output normalized JSON
        #[arg(short, long)]
        json: bool,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Run health probes against the codex binary and both sources
    Doctor {
        /// Output the doctor report as JSON
        #[arg(short, long)]
        json: bool,

        /// Doctor timeout in seconds
        #[arg(long, default_value_t = 20)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let use_color = detect_color(!cli.no_color);

    match cli.command.unwrap_or(Commands::Watch {
        interval: 60,
        timeout: 10,
    }) {
        Commands::Watch { interval, timeout } => {
            anyhow::ensure!(interval > 0, "--interval must be > 0");
            anyhow::ensure!(timeout > 0, "--timeout must be > 0");
            let opts = OutputOptions {
                format: OutputFormat::Text,
                use_color,
            };
            cli::watch_cmd::run(
                Duration::from_secs(interval),
                Duration::from_secs(timeout),
                &opts,
            )
            .await
        }
        Commands::Snapshot { json, timeout } => {
            anyhow::ensure!(timeout > 0, "--timeout must be > 0");
            let opts = OutputOptions {
                format: if json {
                    OutputFormat::Json
                } else {
                    OutputFormat::Text
                },
                use_color,
            };
            cli::snapshot_cmd::run(Duration::from_secs(timeout), &opts).await
        }
        Commands::Doctor { json, timeout } => {
            anyhow::ensure!(timeout > 0, "--timeout must be > 0");
            let opts = OutputOptions {
                format: if json {
                    OutputFormat::Json
                } else {
                    OutputFormat::Text
                },
                use_color,
            };
            let healthy = cli::doctor_cmd::run(Duration::from_secs(timeout), &opts).await?;
            if !healthy {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
