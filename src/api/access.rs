//! Grant and sharing endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, put},
};
use serde::Deserialize;

use super::ApiState;
use super::identity::Caller;
use crate::Result;
use crate::access::GrantRequest;
use crate::db::{Grant, SharingAgreement};

#[derive(Debug, Deserialize)]
struct GrantQuery {
    principal_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SharingRequest {
    pub allow_sharing: bool,
}

async fn create_grant(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Json(req): Json<GrantRequest>,
) -> Result<(StatusCode, Json<Grant>)> {
    let grant = state.access.grant(&caller, &req).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// Grants held by a principal; defaults to the caller
async fn list_grants(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Query(query): Query<GrantQuery>,
) -> Result<Json<Vec<Grant>>> {
    let principal_id = query.principal_id.unwrap_or_else(|| caller.id.clone());
    Ok(Json(state.access.list_grants(&caller, &principal_id)?))
}

async fn revoke_grant(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path(grant_id): Path<String>,
) -> Result<StatusCode> {
    state.access.revoke(&caller, &grant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sharing(
    State(state): State<Arc<ApiState>>,
    Caller(_caller): Caller,
) -> Result<Json<Vec<SharingAgreement>>> {
    Ok(Json(state.access.list_sharing()?))
}

async fn set_sharing(
    State(state): State<Arc<ApiState>>,
    Caller(caller): Caller,
    Path((source, target)): Path<(String, String)>,
    Json(req): Json<SharingRequest>,
) -> Result<Json<SharingAgreement>> {
    let agreement = state
        .access
        .set_sharing(&caller, &source, &target, req.allow_sharing)
        .await?;
    Ok(Json(agreement))
}

/// Build grant router
pub fn grants_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_grants).post(create_grant))
        .route("/{grant_id}", delete(revoke_grant))
        .with_state(state)
}

/// Build sharing router
pub fn sharing_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_sharing))
        .route("/{source}/{target}", put(set_sharing))
        .with_state(state)
}
