//! Terminal client for human-in-the-loop runs.
//!
//! Starts a run on a relay server, prints every message as it arrives and
//! asks for an answer whenever the run is interrupted.

use anyhow::Context;
use clap::Parser;

use hitl_relay::client::{Client, OutcomeStatus, ResumeOrchestrator, StdinHuman};
use hitl_relay::config::LogFormat;
use hitl_relay::telemetry;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay server base URL
    #[arg(long, env = "HITL_URL", default_value = "http://localhost:8123")]
    url: String,

    /// Agent selector
    #[arg(short, long, default_value = "assistant_human_in_loop")]
    assistant: String,

    /// Rejected answers tolerated per question
    #[arg(long, default_value_t = hitl_relay::client::DEFAULT_MAX_REJECTIONS)]
    max_rejections: usize,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Initial query
    #[arg(required = true)]
    query: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    telemetry::init_with(args.log_format, "warn");

    let client = Client::new(&args.url).context("invalid server URL")?;
    let mut orchestrator = ResumeOrchestrator::new(client, StdinHuman::new())
        .with_max_rejections(args.max_rejections);

    let query = args.query.join(" ");
    let outcome = orchestrator.run(&args.assistant, &query).await?;

    match outcome.status {
        OutcomeStatus::Completed => {
            println!("\nrun {} completed", outcome.run_id);
            Ok(())
        }
        OutcomeStatus::Failed => {
            let message = outcome
                .error
                .map_or_else(|| "unknown error".to_string(), |e| e.message);
            anyhow::bail!("run {} failed: {message}", outcome.run_id)
        }
    }
}
