//! Device listing and lease endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;

use super::ApiState;
use super::identity::Caller;
use crate::Result;
use crate::db::{Device, DeviceUpdate};
use crate::lease::{AcquireOptions, DeviceStatus, Lease, ReleaseOutcome};

#[derive(Debug, Default, Deserialize)]
struct AvailableQuery {
    #[serde(default)]
    include_leased: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ReleaseBody {
    #[serde(default)]
    force: bool,
}

/// Devices the caller may see
async fn list_devices(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
) -> Result<Json<Vec<Device>>> {
    Ok(Json(state.coordinator.visible_devices(&caller)?))
}

/// Devices the caller may lease, best first
async fn available_devices(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(query): Query<AvailableQuery>,
) -> Result<Json<Vec<Device>>> {
    Ok(Json(
        state
            .coordinator
            .available_devices(&caller, query.include_leased)?,
    ))
}

async fn device_status(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceStatus>> {
    Ok(Json(state.coordinator.status_for(&device_id, &caller)?))
}

async fn acquire(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(device_id): Path<String>,
    Json(options): Json<AcquireOptions>,
) -> Result<Json<Lease>> {
    let lease = state
        .coordinator
        .acquire(&device_id, &caller, options)
        .await?;
    Ok(Json(lease))
}

async fn release(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(device_id): Path<String>,
    Json(body): Json<ReleaseBody>,
) -> Result<Json<ReleaseOutcome>> {
    let outcome = state
        .coordinator
        .release(&device_id, &caller, body.force)
        .await?;
    Ok(Json(outcome))
}

async fn update_device(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(device_id): Path<String>,
    Json(update): Json<DeviceUpdate>,
) -> Result<Json<Device>> {
    let device = state
        .coordinator
        .update_device(&device_id, &caller, &update)
        .await?;
    Ok(Json(device))
}

/// Build device router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_devices))
        .route("/available", get(available_devices))
        .route("/{device_id}", get(device_status).patch(update_device))
        .route("/{device_id}/acquire", post(acquire))
        .route("/{device_id}/release", post(release))
        .with_state(state)
}
