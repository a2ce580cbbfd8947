//! Agent node endpoints
//!
//! Agents register themselves with their devices and post heartbeats;
//! superusers list nodes and toggle probing.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use super::identity::Caller;
use crate::Result;
use crate::db::AgentNode;
use crate::nodes::{NodeRegistration, RegisteredNode};

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub node_id: String,
    pub restored: usize,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

async fn register_node(
    State(state): State<Arc<ApiState>>,
    Json(registration): Json<NodeRegistration>,
) -> Result<(StatusCode, Json<RegisteredNode>)> {
    let registered = state.registry.register(&registration).await?;
    tracing::info!(
        node_id = %registered.node.id,
        name = %registered.node.name,
        devices = registered.devices.len(),
        "agent registered"
    );
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
) -> Result<Json<HeartbeatResponse>> {
    let restored = state.tracker.record_heartbeat(&node_id).await?;
    Ok(Json(HeartbeatResponse { node_id, restored }))
}

async fn list_nodes(
    State(state): State<Arc<ApiState>>,
    Caller(_caller): Caller,
) -> Result<Json<Vec<AgentNode>>> {
    Ok(Json(state.registry.list()?))
}

async fn get_node(
    State(state): State<Arc<ApiState>>,
    Caller(_caller): Caller,
    Path(node_id): Path<String>,
) -> Result<Json<AgentNode>> {
    Ok(Json(state.registry.get(&node_id)?))
}

async fn set_active(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(node_id): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<AgentNode>> {
    Ok(Json(state.registry.set_active(&caller, &node_id, req.active)?))
}

/// Build node router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_nodes).post(register_node))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/heartbeat", post(heartbeat))
        .route("/{node_id}/active", put(set_active))
        .with_state(state)
}
