//! Authenticated WebSocket upgrade: one socket becomes one `Client` bound
//! to its user, registered with the hub, with the two pumps running until
//! the socket dies.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{extract_bearer, validate_token};
use crate::client::{read_pump, write_pump, Client};
use crate::hub::HubCommand;
use crate::repo::users;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    // Browsers cannot set headers on WebSocket requests, so the token is
    // also accepted as a query parameter.
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
        .or_else(|| query.get("token").cloned());
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    let Some(token) = token else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let Some(claims) = validate_token(&state.pool, &token).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let user = match users::get_user(&state.pool, claims.user_id).await {
        Ok(Some(user)) => user,
        _ => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let (client, outbound) = Client::new(user.id, user.name, session_id);
    info!(user_id = client.user_id, username = %client.username, "websocket session opened");

    state
        .hub
        .submit(HubCommand::Register(client.clone()))
        .await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(client.clone(), outbound, sink));
    read_pump(client, Arc::clone(&state.hub), stream).await;
    writer.abort();
}
