//! Run and thread handlers.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};

use super::error::ApiError;
use super::sse::sse_response;
use crate::AppState;
use crate::error::RunError;
use crate::run::{IfExists, RunSnapshot, StartRequest};

/// Body of `POST /runs` and `POST /runs/stream`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub assistant_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl RunRequest {
    fn into_start(self) -> Result<StartRequest, RunError> {
        let queries = parse_input(&self.input)?;
        Ok(StartRequest {
            assistant_id: self.assistant_id,
            queries,
            thread_id: self.thread_id,
            metadata: self.metadata,
        })
    }
}

/// Body of the continuation endpoints.
#[derive(Debug, Deserialize)]
pub struct ContinueRequest {
    pub run_id: Option<String>,
    pub answer: Option<String>,
}

impl ContinueRequest {
    fn into_parts(self) -> Result<(String, String), RunError> {
        let run_id = self
            .run_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| RunError::InvalidInput("run_id is required".into()))?;
        let answer = self
            .answer
            .ok_or_else(|| RunError::InvalidInput("answer is required".into()))?;
        Ok((run_id, answer))
    }
}

/// Body of `POST /threads`.
#[derive(Debug, Default, Deserialize)]
pub struct ThreadRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub if_exists: IfExists,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    /// Only return history appended at or after this index.
    #[serde(default)]
    pub since: Option<usize>,
}

/// Extract the initial human turns from a run input.
///
/// Accepted shapes:
/// - `"text"`
/// - `{"query": "text"}`
/// - `{"messages": [{"role": "user", "content": "text"}, ...]}` (first message)
/// - `[{"query": "text"}, ...]`
pub fn parse_input(input: &Value) -> Result<Vec<String>, RunError> {
    let queries: Vec<String> = match input {
        Value::String(text) => vec![text.clone()],
        Value::Object(map) => {
            if let Some(query) = map.get("query").and_then(Value::as_str) {
                vec![query.to_string()]
            } else {
                map.get("messages")
                    .and_then(Value::as_array)
                    .and_then(|messages| messages.first())
                    .and_then(|first| first.get("content"))
                    .and_then(Value::as_str)
                    .map(|content| vec![content.to_string()])
                    .unwrap_or_default()
            }
        }
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                other => other.get("query").and_then(Value::as_str).map(ToString::to_string),
            })
            .collect(),
        _ => Vec::new(),
    };

    if queries.iter().all(|q| q.trim().is_empty()) {
        return Err(RunError::InvalidInput(
            "input must contain a non-empty query".into(),
        ));
    }
    Ok(queries)
}

/// POST /runs - start a run and wait for its first segment to end.
pub async fn create_run(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let Json(request) = body?;
    let stream = state.controller.start(request.into_start()?)?;
    Ok(Json(state.controller.wait(stream).await?))
}

/// POST /runs/stream - start a run and stream its envelopes.
pub async fn create_run_stream(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let stream = state.controller.start(request.into_start()?)?;
    Ok(sse_response(state.controller.clone(), stream))
}

/// POST /runs/continue - answer a suspended run and wait.
pub async fn continue_run(
    State(state): State<AppState>,
    body: Result<Json<ContinueRequest>, JsonRejection>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let Json(request) = body?;
    let (run_id, answer) = request.into_parts()?;
    let stream = state.controller.resume(&run_id, &answer)?;
    Ok(Json(state.controller.wait(stream).await?))
}

/// POST /runs/continue/stream - answer a suspended run and stream.
pub async fn continue_run_stream(
    State(state): State<AppState>,
    body: Result<Json<ContinueRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let (run_id, answer) = request.into_parts()?;
    let stream = state.controller.resume(&run_id, &answer)?;
    Ok(sse_response(state.controller.clone(), stream))
}

/// GET /runs/{run_id}
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    query: Result<Query<SnapshotQuery>, QueryRejection>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let Query(query) = query?;
    let snapshot = state
        .controller
        .snapshot_since(&run_id, query.since.unwrap_or(0))?;
    Ok(Json(snapshot))
}

/// DELETE /runs/{run_id}
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.controller.cancel(&run_id)?))
}

/// POST /threads
pub async fn create_thread(
    State(state): State<AppState>,
    body: Result<Json<ThreadRequest>, JsonRejection>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let Json(request) = body?;
    let snapshot =
        state
            .controller
            .create_thread(request.thread_id, request.metadata, request.if_exists)?;
    Ok(Json(snapshot))
}

/// GET /threads/{thread_id}/state
pub async fn thread_state(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.controller.snapshot(&thread_id)?))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "runs": state.controller.run_count(),
        "suspended": state.controller.suspended_count(),
        "agents": state.controller.agents().selectors().collect::<Vec<_>>(),
    }))
}
