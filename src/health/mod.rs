//! Node and device liveness
//!
//! The [`HealthTracker`] probes agent nodes, takes devices with stale
//! heartbeats offline, and runs a slower hygiene pass that purges expired
//! grants and evicts idle leases.

mod liveness;
mod probe;
mod tracker;

pub use liveness::Liveness;
pub use probe::{AgentProbe, HttpProbe, ProbeReport};
pub use tracker::{HealthHandle, HealthSettings, HealthTracker, HygieneReport, SweepReport};
