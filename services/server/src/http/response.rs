use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn internal_error(err: impl Display) -> Response {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

pub fn unauthorized(message: impl Into<String>) -> Response {
    json_error(StatusCode::UNAUTHORIZED, message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, message)
}
