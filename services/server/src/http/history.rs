use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::auth::require_user;
use super::response::internal_error;
use crate::repo::history;
use crate::state::AppState;

pub async fn list_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match history::list_for_user(&state.pool, user_id).await {
        Ok(rows) => {
            let entries: Vec<Value> = rows
                .iter()
                .map(|row| {
                    json!({
                        "id": row.id,
                        "userId": row.user_id,
                        "callId": row.call_id,
                        "callerId": row.caller_id,
                        "status": row.status,
                        "role": row.role,
                        "startTime": row.start_time.to_rfc3339(),
                        "endTime": row.end_time.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({ "history": entries })).into_response()
        }
        Err(e) => internal_error(e),
    }
}
