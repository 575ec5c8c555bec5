//! Realtime channel (§4.5): "one persistent connection per
//! authenticated session. Client joins rooms on demand." Grounded on
//! `live.rs`'s `ws_upgrade`/`handle_ws` (split socket, forward a
//! broadcast receiver to the client in one task, drain incoming frames
//! in another, `tokio::select!` on whichever finishes first), widened
//! from one global channel to per-room `EventBus::join` subscriptions
//! added and dropped as the client asks for them.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use seg_core::events::Room;
use seg_core::UserId;

use crate::auth::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    /// Fallback for browser WebSocket clients, which cannot set custom
    /// headers on the upgrade request.
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum ClientMessage {
    JoinProject { project_id: seg_core::ProjectId },
    JoinExport { job_id: seg_core::ExportJobId },
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsAuthQuery>,
    current_user: Option<CurrentUser>,
) -> impl IntoResponse {
    let user_id = match current_user {
        Some(CurrentUser(id)) => Some(id),
        None => query.user_id,
    };
    let Some(user_id) = user_id else {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_ws(socket, state, user_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();

    // Every session auto-joins its own user room (§4.5); project/export
    // rooms are joined on demand as the client requests them.
    let (forward_tx, mut forward_rx) = mpsc::channel::<String>(64);
    let mut user_rx = state.bus.join(Room::User(user_id));
    let initial_tx = forward_tx.clone();
    tokio::spawn(async move {
        while let Ok(env) = user_rx.recv().await {
            if initial_tx.send(serde_json::to_string(&env).unwrap_or_default()).await.is_err() {
                break;
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = forward_rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let bus = state.bus.clone();
    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        let state = recv_state;
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Close(_) => break,
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::JoinProject { project_id }) => {
                        match seg_store::ProjectStore::user_can_access(&state.pool, project_id, user_id).await {
                            Ok(true) => spawn_room_forwarder(bus.clone(), Room::Project(project_id), forward_tx.clone()),
                            Ok(false) => debug!(%user_id, %project_id, "denied websocket join for inaccessible project"),
                            Err(e) => warn!(%user_id, %project_id, error = %e, "failed to check project access for websocket join"),
                        }
                    }
                    Ok(ClientMessage::JoinExport { job_id }) => {
                        let access = match seg_store::ExportJobStore::get(&state.pool, job_id).await {
                            Ok(job) => seg_store::ProjectStore::user_can_access(&state.pool, job.project_id, user_id).await,
                            Err(e) => Err(e),
                        };
                        match access {
                            Ok(true) => spawn_room_forwarder(bus.clone(), Room::Export(job_id), forward_tx.clone()),
                            Ok(false) => debug!(%user_id, %job_id, "denied websocket join for inaccessible export job"),
                            Err(e) => warn!(%user_id, %job_id, error = %e, "failed to check export job access for websocket join"),
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unrecognized websocket client message"),
                },
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

/// One room's receiver is forwarded for the lifetime of the connection;
/// rooms are never explicitly left, matching the bus's "a room is cheap
/// to keep subscribed to" design (§4.5).
fn spawn_room_forwarder(bus: Arc<seg_bus::EventBus>, room: Room, forward_tx: mpsc::Sender<String>) {
    let mut rx = bus.join(room.clone());
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(env) => {
                    if forward_tx.send(serde_json::to_string(&env).unwrap_or_default()).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%room, skipped = n, "websocket forwarder lagged, dropping buffered events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
