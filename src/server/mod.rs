//! HTTP transport: axum router, run handlers and the SSE body.

mod error;
mod routes;
mod sse;

pub use error::{ApiError, ErrorBody};
pub use routes::{ContinueRequest, RunRequest, ThreadRequest, parse_input};
pub use sse::{frames, sse_response};

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::agent::{AgentRegistry, LlmSettings};
use crate::config::AppConfig;
use crate::run::RunController;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(routes::create_run))
        .route("/runs/wait", post(routes::create_run))
        .route("/runs/stream", post(routes::create_run_stream))
        .route("/runs/continue", post(routes::continue_run))
        .route("/runs/continue/stream", post(routes::continue_run_stream))
        .route(
            "/runs/{run_id}",
            get(routes::get_run).delete(routes::cancel_run),
        )
        .route("/threads", post(routes::create_thread))
        .route("/threads/{thread_id}/state", get(routes::thread_state))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, llm: Option<LlmSettings>) -> anyhow::Result<()> {
    match &llm {
        Some(settings) => info!(
            name: "llm.config.loaded",
            base_url = %settings.base_url,
            model = %settings.model,
            "LLM configuration loaded"
        ),
        None => info!("LLM_BASE_URL not set; only offline agents are available"),
    }

    let agents = AgentRegistry::from_config(&config.agents, llm);
    info!(
        selectors = ?agents.selectors().collect::<Vec<_>>(),
        "agents registered"
    );

    let controller = RunController::new(agents, &config.runs);
    let shutdown = CancellationToken::new();
    let sweeper = controller.spawn_sweeper(
        Duration::from_secs(config.runs.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let app = router(AppState {
        controller,
        config: Arc::clone(&config),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
