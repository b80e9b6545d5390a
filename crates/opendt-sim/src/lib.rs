//! OpenDT Simulator Driver
//!
//! Turns `(Topology, [Task])` into one external simulator invocation:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      SIMULATOR DRIVER                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  1. allocate per-run scratch directory                          │
//! │  2. materialize topology.json / tasks.parquet /                 │
//! │     fragments.parquet / experiment.json                         │
//! │  3. launch <opendc> --experiment-path experiment.json           │
//! │     (timeout → SIGTERM → SIGKILL)                               │
//! │  4. parse output/powerSource.parquet + output/host.parquet      │
//! │  5. archive or release the scratch directory                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Simulator failures are not errors of the driver: they come back as
//! `SimulationResult { status: error }` so the pipeline keeps moving. Driver
//! errors (`SimError`) are reserved for local resource problems the caller
//! may retry.

pub mod artifacts;
pub mod config;
pub mod driver;
pub mod java;
pub mod outputs;
pub mod scope;
pub mod sink;

pub use config::SimConfig;
pub use driver::{SimulationRun, SimulatorDriver};
pub use scope::RunScope;
pub use sink::{AggRow, OutputSink};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Missing expected artifact: {0}")]
    MissingArtifact(PathBuf),

    #[error("Column {0} missing or mistyped in {1}")]
    BadColumn(String, PathBuf),

    #[error("Task id {0} does not fit the simulator's int32 id column")]
    IdOverflow(i64),

    #[error("Run id {0} already exists and strict mode is on")]
    DuplicateRun(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
