//! Reservation endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::ApiState;
use super::identity::Caller;
use crate::Result;
use crate::access::Action;
use crate::db::{Reservation, ReservationFilter};

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub device_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approve: bool,
    #[serde(default)]
    pub remarks: Option<String>,
}

async fn create_reservation(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Json(req): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>)> {
    let reservation = state
        .planner
        .create(
            &req.device_id,
            &caller,
            req.start,
            req.end,
            req.remarks.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// List reservations; non-superusers only see their own
async fn list_reservations(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(mut filter): Query<ReservationFilter>,
) -> Result<Json<Vec<Reservation>>> {
    if !caller.is_admin {
        filter.requester_id = Some(caller.id);
    }
    Ok(Json(state.planner.list(&filter)?))
}

async fn get_reservation(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(reservation_id): Path<String>,
) -> Result<Json<Reservation>> {
    let reservation = state.planner.get(&reservation_id)?;
    if reservation.requester_id != caller.id {
        let device = state.coordinator.status(&reservation.device_id)?.device;
        state
            .coordinator
            .evaluator()
            .require(&caller, &device, Action::Admin)?;
    }
    Ok(Json(reservation))
}

async fn decide_reservation(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(reservation_id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Reservation>> {
    let reservation = state
        .planner
        .handle(&reservation_id, &caller, req.approve, req.remarks.as_deref())
        .await?;
    Ok(Json(reservation))
}

async fn cancel_reservation(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(reservation_id): Path<String>,
) -> Result<Json<Reservation>> {
    Ok(Json(state.planner.cancel(&reservation_id, &caller).await?))
}

/// Build reservation router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", post(create_reservation).get(list_reservations))
        .route("/{reservation_id}", get(get_reservation))
        .route("/{reservation_id}/decision", post(decide_reservation))
        .route("/{reservation_id}/cancel", post(cancel_reservation))
        .with_state(state)
}
