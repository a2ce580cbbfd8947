//! Usage history and utilization endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::ApiState;
use super::identity::Caller;
use crate::access::{Action, Principal};
use crate::db::{UsageCorrection, UsageFilter, UsageSession};
use crate::ledger::{UsageScope, Utilization};
use crate::window::TimeWindow;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct UtilizationQuery {
    device_id: Option<String>,
    group_id: Option<String>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CompensateRequest {
    pub delta_ms: i64,
    pub remarks: String,
}

/// Narrow a history filter to what the caller may see
///
/// Superusers see everything. Device admins see a device's full history;
/// everyone else sees their own sessions.
fn scope_filter(state: &ApiState, caller: &Principal, mut filter: UsageFilter) -> Result<UsageFilter> {
    if caller.is_admin {
        return Ok(filter);
    }
    if let Some(device_id) = &filter.device_id {
        let device = state.coordinator.status(device_id)?.device;
        if state
            .coordinator
            .evaluator()
            .check(caller, &device, Action::Admin)
        {
            return Ok(filter);
        }
    }
    filter.user_id = Some(caller.id.clone());
    Ok(filter)
}

async fn history(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(filter): Query<UsageFilter>,
) -> Result<Json<Vec<UsageSession>>> {
    let filter = scope_filter(&state, &caller, filter)?;
    Ok(Json(state.coordinator.ledger().history(&filter)?))
}

async fn utilization(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(query): Query<UtilizationQuery>,
) -> Result<Json<Utilization>> {
    let window = TimeWindow::new(query.from, query.to)?;

    let scope = match (query.device_id, query.group_id) {
        (Some(device_id), None) => {
            let device = state.coordinator.status(&device_id)?.device;
            state
                .coordinator
                .evaluator()
                .require(&caller, &device, Action::Read)?;
            UsageScope::Device(device_id)
        }
        (None, Some(group_id)) => {
            if !caller.is_admin && caller.group_id != group_id {
                return Err(Error::PermissionDenied(format!(
                    "not a member of group '{group_id}'"
                )));
            }
            UsageScope::Group(group_id)
        }
        _ => {
            return Err(Error::Validation(
                "pass exactly one of device_id or group_id".to_string(),
            ));
        }
    };

    Ok(Json(state.coordinator.ledger().utilization(&scope, window)?))
}

/// Append a correction to a closed session (superusers only)
async fn compensate(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(session_id): Path<String>,
    Json(req): Json<CompensateRequest>,
) -> Result<(StatusCode, Json<UsageCorrection>)> {
    if !caller.is_admin {
        return Err(Error::PermissionDenied(
            "only superusers may correct usage".to_string(),
        ));
    }
    let correction = state
        .coordinator
        .ledger()
        .compensate(&session_id, req.delta_ms, &req.remarks)?;
    Ok((StatusCode::CREATED, Json(correction)))
}

async fn corrections(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<UsageCorrection>>> {
    if !caller.is_admin {
        return Err(Error::PermissionDenied(
            "only superusers may read corrections".to_string(),
        ));
    }
    Ok(Json(state.coordinator.ledger().corrections(&session_id)?))
}

/// Build usage router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sessions", get(history))
        .route("/utilization", get(utilization))
        .route(
            "/sessions/{session_id}/corrections",
            get(corrections).post(compensate),
        )
        .with_state(state)
}
