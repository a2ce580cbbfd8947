//! HTTP API server for the tether gateway

pub mod access;
mod auth;
pub mod devices;
pub mod error;
pub mod events;
pub mod health;
pub mod identity;
pub mod nodes;
pub mod reservations;
pub mod usage;

use std::sync::Arc;

use axum::{Router, middleware};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::access::AccessAdmin;
use crate::db::DbPool;
use crate::health::HealthTracker;
use crate::lease::LeaseCoordinator;
use crate::nodes::NodeRegistry;
use crate::notify::NotificationHub;
use crate::reservation::ReservationPlanner;

pub use error::ErrorResponse;
pub use identity::Caller;

/// Default per-connection event queue depth
pub const DEFAULT_WS_QUEUE: usize = 64;

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    pub api_key: Option<String>,
    pub coordinator: Arc<LeaseCoordinator>,
    pub planner: Arc<ReservationPlanner>,
    pub access: Arc<AccessAdmin>,
    pub registry: Arc<NodeRegistry>,
    pub tracker: Arc<HealthTracker>,
    pub hub: Arc<NotificationHub>,
    /// Queue depth for each event stream connection
    pub ws_queue_capacity: usize,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    port: u16,
    api_key: Option<String>,
    coordinator: Arc<LeaseCoordinator>,
    planner: Arc<ReservationPlanner>,
    access: Arc<AccessAdmin>,
    registry: Arc<NodeRegistry>,
    tracker: Arc<HealthTracker>,
    hub: Arc<NotificationHub>,
    ws_queue_capacity: usize,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbPool,
        port: u16,
        coordinator: Arc<LeaseCoordinator>,
        planner: Arc<ReservationPlanner>,
        access: Arc<AccessAdmin>,
        registry: Arc<NodeRegistry>,
        tracker: Arc<HealthTracker>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            db,
            port,
            api_key: None,
            coordinator,
            planner,
            access,
            registry,
            tracker,
            hub,
            ws_queue_capacity: DEFAULT_WS_QUEUE,
        }
    }

    /// Require this bearer key on every `/api` and `/ws` route
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Set the per-connection event queue depth
    #[must_use]
    pub fn ws_queue_capacity(mut self, capacity: usize) -> Self {
        self.ws_queue_capacity = capacity.max(1);
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            db: self.db,
            api_key: self.api_key,
            coordinator: self.coordinator,
            planner: self.planner,
            access: self.access,
            registry: self.registry,
            tracker: self.tracker,
            hub: self.hub,
            ws_queue_capacity: self.ws_queue_capacity,
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// Build the router with all routes
///
/// Everything except `/health` and `/ready` sits behind the API key
/// middleware when a key is configured.
pub fn router(state: Arc<ApiState>) -> Router {
    let protected = Router::new()
        .nest("/api/devices", devices::router(state.clone()))
        .nest("/api/reservations", reservations::router(state.clone()))
        .nest("/api/grants", access::grants_router(state.clone()))
        .nest("/api/sharing", access::sharing_router(state.clone()))
        .nest("/api/usage", usage::router(state.clone()))
        .nest("/api/nodes", nodes::router(state.clone()))
        .nest("/ws", events::router(state.clone()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    protected
        .merge(health::router())
        .merge(health::ready_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
