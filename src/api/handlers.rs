//! Request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::ledger::{RepositoryBinding, SessionOptions, SessionRecord};
use crate::stream::sse_response;
use crate::worker::TurnRequest;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub prompt: String,
    #[serde(default)]
    pub repository: Option<RepositoryBinding>,
    #[serde(default)]
    pub options: Option<SessionOptions>,
    /// Named credential installation to resolve secrets against.
    #[serde(default)]
    pub installation: Option<String>,
}

/// `POST /interactive/start`
///
/// Admission order: validation, credentials, quota check; only an
/// approved request allocates anything. A denial is a structured JSON
/// response, never an SSE stream.
pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<Response> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    let credentials = state
        .secrets
        .resolve(request.installation.as_deref())
        .await
        .map_err(|e| ApiError::internal(format!("resolving credentials: {e}")))?;
    if credentials.agent_key.is_none() {
        return Err(ApiError::bad_request("no agent credentials configured"));
    }
    // A repository binding needs a scoped token; fail before any
    // resource is allocated rather than mid-stream at clone time.
    if request.repository.is_some() && credentials.repo_token.is_none() {
        return Err(ApiError::bad_request(
            "repository sessions require a repository access token",
        ));
    }

    let decision = state.quota.check();
    if !decision.allowed {
        let reason = decision
            .reason
            .unwrap_or_else(|| "quota exceeded".to_string());
        return Err(ApiError::AdmissionDenied(reason));
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let options = request.options.unwrap_or_default();

    state.quota.start_session(&session_id);

    let dispatched = async {
        state
            .ledger
            .create(&session_id, request.repository.clone(), options)
            .await?;
        state
            .workers
            .clone()
            .dispatch(TurnRequest {
                session_id: session_id.clone(),
                message: request.prompt.clone(),
                credentials,
            })
            .await
    }
    .await;

    match dispatched {
        Ok(rx) => {
            info!(session_id = %session_id, "session started");
            Ok(sse_response(rx).into_response())
        }
        Err(e) => {
            // Roll back the concurrency slot so a failed dispatch
            // consumes nothing.
            state.quota.end_session(&session_id);
            warn!(session_id = %session_id, "dispatch failed: {e:#}");
            Err(ApiError::internal(format!("failed to start session: {e}")))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// `GET /interactive/status?sessionId=`
pub async fn get_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<SessionRecord>> {
    let record = state
        .ledger
        .get(&query.session_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("session {}", query.session_id)))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub success: bool,
}

/// `DELETE /interactive/{session_id}`
///
/// Idempotent: ending an unknown or already-ended session succeeds.
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<EndSessionResponse>> {
    state
        .ledger
        .end(&session_id)
        .await
        .map_err(ApiError::from)?;
    state.workers.shutdown(&session_id);
    state.quota.end_session(&session_id);
    info!(session_id = %session_id, "session ended");
    Ok(Json(EndSessionResponse { success: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller-supplied session snapshot; wins over the local record.
    #[serde(default)]
    pub session: Option<SessionRecord>,
    #[serde(default)]
    pub installation: Option<String>,
}

/// `POST /message`
///
/// Continuation turn. The session id comes from the body, a caller
/// snapshot, or the `X-Session-Id` header, in that priority. A supplied
/// snapshot is restored into the ledger first so its turn count and
/// transcript win over whatever this instance remembers.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let header_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let session_id = request
        .session_id
        .clone()
        .or_else(|| request.session.as_ref().map(|s| s.id.clone()))
        .or(header_id)
        .ok_or_else(|| ApiError::bad_request("no session id provided"))?;

    let record = if let Some(snapshot) = &request.session {
        state
            .ledger
            .restore(snapshot)
            .await
            .map_err(ApiError::from)?;
        snapshot.clone()
    } else {
        state
            .ledger
            .get(&session_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found(format!("session {}", session_id)))?
    };

    let credentials = state
        .secrets
        .resolve(request.installation.as_deref())
        .await
        .map_err(|e| ApiError::internal(format!("resolving credentials: {e}")))?;
    if credentials.agent_key.is_none() {
        return Err(ApiError::bad_request("no agent credentials configured"));
    }
    if record.repository.is_some() && credentials.repo_token.is_none() {
        return Err(ApiError::bad_request(
            "repository sessions require a repository access token",
        ));
    }

    let rx = state
        .workers
        .clone()
        .dispatch(TurnRequest {
            session_id: session_id.clone(),
            message: request.message.clone(),
            credentials,
        })
        .await
        .map_err(|e| ApiError::internal(format!("failed to dispatch turn: {e}")))?;

    info!(session_id = %session_id, "continuation turn dispatched");
    Ok(sse_response(rx).into_response())
}
