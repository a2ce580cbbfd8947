//! WebSocket event stream
//!
//! Clients connect to `/ws/events?keys=d1,d2&groups=g1` and receive every
//! event for those devices or groups plus broadcasts. Each connection gets
//! a bounded queue drained by one writer task, so per-client order matches
//! publish order.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::ApiState;
use super::identity::Caller;
use crate::notify::ChannelTransport;

/// Subscription filters, comma separated
#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    keys: Option<String>,
    #[serde(default)]
    groups: Option<String>,
}

/// First frame sent on a new connection
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsControl {
    Subscribed {
        subscription_id: String,
        keys: Vec<String>,
        groups: Vec<String>,
    },
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let keys = split_list(query.keys.as_deref());
    let groups = split_list(query.groups.as_deref());
    tracing::debug!(principal = %caller.id, ?keys, ?groups, "event stream requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, keys, groups))
}

/// Handle WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: Arc<ApiState>,
    keys: Vec<String>,
    groups: Vec<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let subscription_id = uuid::Uuid::new_v4().to_string();

    let ack = WsControl::Subscribed {
        subscription_id: subscription_id.clone(),
        keys: keys.clone(),
        groups: groups.clone(),
    };
    if let Ok(msg) = serde_json::to_string(&ack) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    let (transport, mut rx) = ChannelTransport::new(subscription_id.clone(), state.ws_queue_capacity);
    state.hub.subscribe(Arc::new(transport), keys, groups);
    tracing::info!(subscription_id = %subscription_id, "event stream connected");

    // Writer: drains the queue until the hub closes the transport
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Reader: only watches for the client going away
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(&subscription_id);
    tracing::info!(subscription_id = %subscription_id, "event stream disconnected");
}

/// Build event stream router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", get(ws_upgrade))
        .with_state(state)
}
