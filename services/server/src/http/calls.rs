use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::auth::require_user;
use super::response::{bad_request, internal_error, not_found};
use crate::repo::calls;
use crate::state::AppState;
use glimpse_protocol::CallStatus;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallPayload {
    pub callee_ids: Vec<i64>,
    /// Optional SDP offer; kept on the in-memory call record only.
    #[serde(default)]
    pub offer: Option<Value>,
}

/// Persist a ringing call and hand its runtime session to the hub.  The
/// caller is the authenticated user, never taken from the body.
pub async fn create_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCallPayload>,
) -> Response {
    let caller = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    if payload.callee_ids.is_empty() {
        return bad_request("at least one callee is required");
    }
    if payload.callee_ids.contains(&caller.id) {
        return bad_request("caller cannot be a callee");
    }

    let mut call = match calls::create_call(&state.pool, caller.id, &payload.callee_ids).await {
        Ok(call) => call,
        Err(e) => return internal_error(e),
    };
    call.offer = payload.offer;

    state.hub.create_call_session(call.clone()).await;
    (StatusCode::CREATED, Json(call)).into_response()
}

pub async fn get_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<i64>,
) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match calls::get_call(&state.pool, call_id).await {
        Ok(Some(call)) => Json(call).into_response(),
        Ok(None) => not_found("call not found"),
        Err(e) => internal_error(e),
    }
}

pub async fn end_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(call_id): Path<i64>,
) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match calls::finish(&state.pool, call_id, CallStatus::Ended, Utc::now()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

/// Read-only presence snapshot from the hub.
pub async fn presence(State(state): State<AppState>) -> Response {
    Json(state.hub.online_users().await).into_response()
}
