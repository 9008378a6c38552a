use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::require_user;
use super::response::{bad_request, internal_error, not_found, unauthorized};
use super::user_json;
use crate::repo::{contacts, users};
use crate::state::AppState;

pub async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match users::list_users(&state.pool).await {
        Ok(rows) => {
            let users: Vec<Value> = rows.iter().map(user_json).collect();
            Json(json!({ "users": users })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match users::get_user(&state.pool, user_id).await {
        Ok(Some(user)) => Json(user_json(&user)).into_response(),
        Ok(None) => not_found("user not found"),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserPayload {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Users may only update their own profile.
pub async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Json(payload): Json<UpdateUserPayload>,
) -> Response {
    let auth_user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    if auth_user.id != user_id {
        return unauthorized("cannot update another user");
    }
    if payload.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return bad_request("name cannot be empty");
    }

    match users::update_profile(
        &state.pool,
        user_id,
        payload.name.as_deref().map(str::trim),
        payload.avatar_url.as_deref(),
    )
    .await
    {
        Ok(Some(user)) => Json(user_json(&user)).into_response(),
        Ok(None) => not_found("user not found"),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddContactPayload {
    pub contact_id: i64,
}

pub async fn add_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddContactPayload>,
) -> Response {
    let auth_user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    if payload.contact_id == auth_user.id {
        return bad_request("cannot add yourself as a contact");
    }
    match users::get_user(&state.pool, payload.contact_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("user not found"),
        Err(e) => return internal_error(e),
    }
    match contacts::add_contact(&state.pool, auth_user.id, payload.contact_id).await {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn list_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match contacts::list_contacts(&state.pool, user_id).await {
        Ok(rows) => {
            let contacts: Vec<Value> = rows.iter().map(user_json).collect();
            Json(json!({ "contacts": contacts })).into_response()
        }
        Err(e) => internal_error(e),
    }
}
