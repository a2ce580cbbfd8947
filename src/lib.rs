//! Tether Gateway - lease coordinator for network-shared devices
//!
//! Agents on remote machines expose physical devices (USB and the like) to
//! the gateway. The gateway decides who may hold each device at a time:
//! - Exclusive leases with idempotent reconnect and forced takeover
//! - Grant, group and sharing based permissions
//! - Reservations over half-open time windows with an approval workflow
//! - Liveness sweeps that take stale devices offline
//! - Append-only usage accounting with compensating corrections
//! - Real-time event fan-out over WebSocket
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  HTTP / WebSocket API                │
//! │  devices │ reservations │ grants │ usage │ nodes     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   LeaseCoordinator  │  ReservationPlanner            │
//! │   PermissionEvaluator  │  UsageLedger                │
//! │   HealthTracker  │  NotificationHub                  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  SQLite store                        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod access;
pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod health;
pub mod ledger;
pub mod lease;
pub mod nodes;
pub mod notify;
pub mod reservation;
pub mod scoring;
pub mod window;

pub use access::{AccessAdmin, Action, Decision, GrantRequest, PermissionEvaluator, Principal};
pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, ErrorKind, Result};
pub use health::{HealthTracker, Liveness};
pub use ledger::{UsageLedger, UsageScope, Utilization};
pub use lease::{AcquireOptions, DeviceStatus, Lease, LeaseCoordinator, ReleaseOutcome};
pub use nodes::NodeRegistry;
pub use notify::{Event, EventType, NotificationHub};
pub use reservation::ReservationPlanner;
pub use scoring::ScoringStrategy;
pub use window::TimeWindow;
