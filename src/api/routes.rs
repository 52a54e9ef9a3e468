//! API route definitions.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiError;
use super::live;
use super::state::AppState;
use crate::ruletest::{TestError, TestOptions, TestOptionsRequest, TestOutcome};
use crate::silence::{Silence, SilenceOptions};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/test", post(test_rule))
        .route("/test/ws", get(live::test_ws))
        .route("/silence/{*path}", post(silence_rule))
        .route("/silences", get(list_silences))
}

/// Body of a rule test request, over HTTP or as the first WebSocket frame.
#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub rule: String,
    #[serde(default)]
    pub options: TestOptionsRequest,
}

impl TestRequest {
    pub fn parse(body: &[u8]) -> Result<(String, TestOptions), ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ApiError::BodyNotSent);
        }
        let request: TestRequest = serde_json::from_slice(body).map_err(ApiError::from_body)?;
        if request.rule.trim().is_empty() {
            return Err(ApiError::InvalidRequest("rule not sent".to_string()));
        }
        let options = TestOptions::try_from(request.options)?;
        Ok((request.rule, options))
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn test_rule(State(state): State<AppState>, body: Bytes) -> Result<String, ApiError> {
    let (rule, options) = TestRequest::parse(&body)?;

    match state.tester.test_rule(&rule, &options, None).await? {
        TestOutcome::Succeeded(output) => Ok(output),
        // Without an observer a nonzero exit is always an error.
        TestOutcome::Cancelled { exit_code } => Err(TestError::RuntimeFailure {
            code: exit_code,
            stderr: String::new(),
        }
        .into()),
    }
}

async fn silence_rule(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<String, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BodyNotSent);
    }
    let options: SilenceOptions = serde_json::from_slice(&body).map_err(ApiError::from_body)?;

    let line = state.silences.silence_rule(&path, &options).await?;
    info!(path = %path, "silence request handled");
    Ok(line)
}

async fn list_silences(State(state): State<AppState>) -> Json<Value> {
    let silences: Vec<Silence> = state.silences.active().await;
    let total = silences.len();
    Json(json!({ "data": silences, "meta": { "total": total } }))
}
