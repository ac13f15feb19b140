//! `flowrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — lint a flow-definition file and print every defect.
//! - `run`      — validate, then execute the flow locally against an input
//!                document, dispatching actions over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use actions::HttpInvoker;
use engine::{ExecutorConfig, Flow, FlowExecutor, RunConfig, RunStatus};

#[derive(Parser)]
#[command(
    name = "flowrun",
    about = "Validate and locally execute declarative flow definitions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow-definition file (JSON or YAML).
    Validate {
        /// Path to the definition file.
        path: PathBuf,
    },
    /// Validate and execute a flow locally.
    Run {
        /// Path to the definition file.
        path: PathBuf,
        /// Initial document, as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
        /// Per-run deadline in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Bearer token forwarded to action providers.
        #[arg(long, env = "FLOWRUN_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

fn load_flow(path: &Path) -> anyhow::Result<Flow> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;

    let result = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Flow::from_yaml_str(&source),
        _ => Flow::from_json_str(&source),
    };

    result.map_err(|errors| {
        for error in &errors {
            eprintln!("{error}");
        }
        anyhow::anyhow!("{} validation error(s) in {}", errors.len(), path.display())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let flow = load_flow(&path)?;
            println!(
                "{} is valid: {} states starting at '{}'",
                path.display(),
                flow.definition().states.len(),
                flow.start_at()
            );
        }
        Command::Run {
            path,
            input,
            timeout,
            token,
        } => {
            let flow = load_flow(&path)?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;

            let invoker = HttpInvoker::with_token(token)
                .map_err(|e| anyhow::anyhow!("failed to build HTTP invoker: {e}"))?;
            let executor = FlowExecutor::new(Arc::new(invoker), ExecutorConfig::default());

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; cancelling run");
                    ctrl_c_cancel.cancel();
                }
            });

            let run_config = RunConfig {
                deadline: timeout.map(Duration::from_secs),
                cancel,
            };

            info!(flow = %path.display(), "starting run");
            let outcome = executor.run(&flow, input, run_config).await;
            debug!(trail = ?outcome.trail, "visited states");

            println!("{}", serde_json::to_string_pretty(&outcome.document)?);
            match outcome.status {
                RunStatus::Succeeded => println!("run {} SUCCEEDED", outcome.run_id),
                status => {
                    if let Some(error) = &outcome.error {
                        eprintln!(
                            "run {} {status}: [{}] {} (state '{}')",
                            outcome.run_id, error.kind, error.message, error.state_name
                        );
                    }
                    bail!("run did not succeed");
                }
            }
        }
    }

    Ok(())
}
