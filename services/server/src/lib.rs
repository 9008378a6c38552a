pub mod auth;
pub mod call_session;
pub mod client;
pub mod db;
pub mod http;
pub mod hub;
pub mod media;
pub mod repo;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/auth/register", post(http::auth::register))
        .route("/api/auth/login", post(http::auth::login))
        .route("/api/auth/me", get(http::auth::me))
        .route("/api/auth/logout", post(http::auth::logout))
        .route("/api/users", get(http::users::list_users))
        .route(
            "/api/users/:id",
            get(http::users::get_user).put(http::users::update_user),
        )
        .route("/api/users/:id/contacts", get(http::users::list_contacts))
        .route("/api/users/:id/history", get(http::history::list_history))
        .route("/api/contacts", post(http::users::add_contact))
        .route("/api/calls", post(http::calls::create_call))
        .route("/api/calls/:id", get(http::calls::get_call))
        .route("/api/calls/:id/end", post(http::calls::end_call))
        .route("/api/presence", get(http::calls::presence))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
