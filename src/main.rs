//! Human-in-the-loop relay server
//!
//! Entry point: loads configuration, initializes logging and serves the run
//! API.

use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;

use hitl_relay::config::{AppConfig, load_llm_settings};
use hitl_relay::{server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenvy::dotenv();

    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init(config.log.format);

    let llm = load_llm_settings().map_err(|msg| anyhow::anyhow!("Configuration error: {msg}"))?;

    server::start_server(Arc::new(config), llm).await
}
