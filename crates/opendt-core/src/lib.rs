//! OpenDT Core Data Model
//!
//! Shared entities for the shadow-mode digital twin pipeline:
//! - Workload messages (tasks, heartbeats) and power samples as they arrive
//!   on the message plane
//! - Datacenter topology tree with a canonical SHA-256 fingerprint
//! - Simulation results and per-window reports
//! - Topology state cells (observed / calibrated) with generation tracking
//!
//! All timestamps are event time. Wire shapes follow the producer contract:
//! camelCase topology/task keys, `power_draw`/`energy_usage` on power samples.

pub mod fingerprint;
pub mod result;
pub mod state;
pub mod topology;
pub mod workload;

pub use fingerprint::{canonical_json, topology_fingerprint};
pub use result::{CacheKey, RunContext, SimStatus, SimulationReport, SimulationResult};
pub use state::{CellView, TopologyCell, TopologyState};
pub use topology::{Cluster, Cpu, CpuPowerModel, Host, Memory, PowerModelType, Topology, TopologySnapshot};
pub use workload::{Fragment, PowerSample, Task, WorkloadMessage};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
