//! Shared test utilities

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tether_gateway::api::{ApiState, DEFAULT_WS_QUEUE};
use tether_gateway::config::{ApiServerConfig, HealthConfig, LeaseConfig, NotifyConfig};
use tether_gateway::daemon::Components;
use tether_gateway::db::{self, Device, DeviceRepo};
use tether_gateway::{Config, DbPool};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Config suitable for in-process tests
#[must_use]
pub fn test_config() -> Config {
    Config {
        api_server: ApiServerConfig {
            port: 0,
            api_key: None,
        },
        db_path: PathBuf::from(":memory:"),
        health: HealthConfig::default(),
        notify: NotifyConfig::default(),
        lease: LeaseConfig::default(),
    }
}

/// Build started services over `db`
#[must_use]
pub fn start_components(db: &DbPool) -> Components {
    start_components_with(db, &test_config())
}

/// Build started services over `db` with a custom config
#[must_use]
pub fn start_components_with(db: &DbPool, config: &Config) -> Components {
    let components = Components::build(db, config);
    components
        .coordinator
        .start()
        .expect("failed to start coordinator");
    components
}

/// Register a device owned by `group` with a fresh heartbeat
pub fn announce_device(db: &DbPool, id: &str, group: &str) -> Device {
    DeviceRepo::new(db.clone())
        .upsert_announced(id, None, &format!("Device {id}"), group, Utc::now())
        .expect("failed to announce device")
}

/// Handler state over started services
#[allow(dead_code)]
#[must_use]
pub fn api_state(db: &DbPool, components: &Components, api_key: Option<&str>) -> Arc<ApiState> {
    Arc::new(ApiState {
        db: db.clone(),
        api_key: api_key.map(str::to_string),
        coordinator: Arc::clone(&components.coordinator),
        planner: Arc::clone(&components.planner),
        access: Arc::clone(&components.access),
        registry: Arc::clone(&components.registry),
        tracker: Arc::clone(&components.tracker),
        hub: Arc::clone(&components.hub),
        ws_queue_capacity: DEFAULT_WS_QUEUE,
    })
}
