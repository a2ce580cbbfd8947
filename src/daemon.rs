//! Daemon - the main gateway service
//!
//! Wires the store, notification hub, lease coordinator, reservation
//! planner, access administration and health tracker behind the HTTP API.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::access::AccessAdmin;
use crate::api::ApiServerBuilder;
use crate::db::{self, DbPool, DeviceRepo, GrantRepo, SharingRepo};
use crate::health::{HealthTracker, HttpProbe, Liveness};
use crate::lease::LeaseCoordinator;
use crate::nodes::NodeRegistry;
use crate::notify::NotificationHub;
use crate::reservation::ReservationPlanner;
use crate::{Config, Result};

/// Core services sharing one store and one hub
pub struct Components {
    pub hub: Arc<NotificationHub>,
    pub coordinator: Arc<LeaseCoordinator>,
    pub planner: Arc<ReservationPlanner>,
    pub access: Arc<AccessAdmin>,
    pub registry: Arc<NodeRegistry>,
    pub tracker: Arc<HealthTracker>,
}

impl Components {
    /// Build every service over `db`
    ///
    /// The coordinator is not started.
    #[must_use]
    pub fn build(db: &DbPool, config: &Config) -> Self {
        let hub = Arc::new(NotificationHub::new(config.notify.send_timeout));
        let liveness = Liveness::from_secs(config.health.heartbeat_timeout.as_secs());
        let coordinator = Arc::new(
            LeaseCoordinator::new(db, Arc::clone(&hub), liveness)
                .with_lock_timeout(config.lease.lock_timeout)
                .with_scoring(config.lease.scoring.strategy()),
        );

        let planner = Arc::new(ReservationPlanner::new(
            db,
            coordinator.table(),
            Arc::clone(&hub),
        ));
        let access = Arc::new(AccessAdmin::new(
            coordinator.evaluator().clone(),
            GrantRepo::new(db.clone()),
            SharingRepo::new(db.clone()),
            DeviceRepo::new(db.clone()),
            Arc::clone(&hub),
        ));
        let registry = Arc::new(NodeRegistry::new(
            db,
            Arc::clone(&coordinator),
            Arc::clone(&hub),
        ));
        let tracker = Arc::new(HealthTracker::new(
            db,
            Arc::clone(&coordinator),
            Arc::clone(&hub),
            Arc::new(HttpProbe::new()),
            config.health.settings(),
        ));

        Self {
            hub,
            coordinator,
            planner,
            access,
            registry,
            tracker,
        }
    }
}

/// The tether daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Open the store for a daemon run
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or migrated
    pub fn new(config: Config) -> Result<Self> {
        let db = db::init(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "database ready");
        Ok(Self { config, db })
    }

    /// Store handle
    #[must_use]
    pub const fn db(&self) -> &DbPool {
        &self.db
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if lease recovery fails or the API server cannot bind
    pub async fn run(self) -> Result<()> {
        let components = Components::build(&self.db, &self.config);

        let restored = components.coordinator.start()?;
        tracing::info!(restored, "lease table started");

        let health = Arc::clone(&components.tracker).start();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(()).await;
            }
        });

        let server = ApiServerBuilder::new(
            self.db.clone(),
            self.config.api_server.port,
            Arc::clone(&components.coordinator),
            Arc::clone(&components.planner),
            Arc::clone(&components.access),
            Arc::clone(&components.registry),
            Arc::clone(&components.tracker),
            Arc::clone(&components.hub),
        )
        .api_key(self.config.api_server.api_key.clone())
        .ws_queue_capacity(self.config.notify.queue_capacity)
        .build();

        if self.config.api_server.api_key.is_none() {
            tracing::warn!("no API key configured, API routes are open");
        }

        let result = server
            .run(async move {
                shutdown_rx.recv().await;
            })
            .await;

        health.stop().await;
        components.hub.close_all().await;
        components.coordinator.stop();
        tracing::info!("tether stopped");

        result
    }
}
