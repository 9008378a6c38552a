use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::response::{bad_request, internal_error, unauthorized};
use super::user_json;
use crate::auth;
use crate::repo::users::{self, UserRow};
use crate::state::AppState;

const MIN_PASSWORD_LEN: usize = 8;

/// Resolve the Bearer token in `headers` to a user row.
pub async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserRow, Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
        .ok_or_else(|| unauthorized("missing authorization"))?;
    let claims = auth::validate_token(&state.pool, token)
        .await
        .ok_or_else(|| unauthorized("invalid token"))?;
    match users::get_user(&state.pool, claims.user_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(unauthorized("user not found")),
        Err(e) => Err(internal_error(e)),
    }
}

#[derive(Deserialize)]
pub struct RegisterPayload {
    pub name: String,
    pub email: String,
    pub password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterPayload>,
) -> Response {
    if payload.name.trim().is_empty() || !payload.email.contains('@') {
        return bad_request("name and a valid email are required");
    }
    if payload.password.len() < MIN_PASSWORD_LEN {
        return bad_request("password must be at least 8 characters");
    }

    let hash = match auth::hash_password(&payload.password) {
        Ok(hash) => hash,
        Err(e) => {
            error!(error = %e, "password hash failed");
            return internal_error("failed to process password");
        }
    };

    let user = match users::create_user(&state.pool, payload.name.trim(), &payload.email, &hash)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            error!(error = %e, "user create failed");
            return internal_error("failed to create user");
        }
    };

    match auth::issue_token(&state.pool, user.id).await {
        Ok(token) => (
            StatusCode::CREATED,
            Json(json!({ "user": user_json(&user), "token": token })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> Response {
    let found = match users::find_by_email(&state.pool, &payload.email).await {
        Ok(found) => found,
        Err(e) => return internal_error(e),
    };
    let Some((user, password_hash)) = found else {
        return unauthorized("invalid credentials");
    };
    if !auth::verify_password(&payload.password, &password_hash) {
        return unauthorized("invalid credentials");
    }

    match auth::issue_token(&state.pool, user.id).await {
        Ok(token) => {
            Json(json!({ "user": user_json(&user), "token": token })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_user(&state, &headers).await {
        Ok(user) => Json(user_json(&user)).into_response(),
        Err(response) => response,
    }
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
    else {
        return unauthorized("missing authorization");
    };
    match auth::revoke_token(&state.pool, token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}
