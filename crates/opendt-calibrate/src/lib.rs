//! OpenDT Calibration Engine
//!
//! Continuously tunes one numeric topology parameter so the simulator's
//! predicted power tracks measured power:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        CALIBRATION EPOCH                           │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  accumulate tasks + power samples over the alignment window        │
//! │  linspace(min, max, n) candidate values                            │
//! │  patch observed topology per candidate (deep copy)                 │
//! │  ≤ max_parallel_workers simulator runs, isolated scratch dirs      │
//! │  MAPE(simulated power, observed power) on a 1-minute grid          │
//! │  winner beats the published value ──▶ topology.calibrated          │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Epochs are serial. Candidate failures only exclude the candidate; a fully
//! failed epoch skips publication and the next epoch starts fresh.

pub mod config;
pub mod engine;
pub mod mape;
pub mod path;
pub mod power;

pub use config::CalibrationConfig;
pub use engine::{CalEvent, CalibrationEngine, CalibrationHandle, CalibrationMetrics, CalibrationStatus};
pub use mape::{mape, resample_to_minutes};
pub use path::ParamPath;
pub use power::PowerTracker;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parameter path error: {0}")]
    Path(String),

    #[error("Core error: {0}")]
    Core(#[from] opendt_core::CoreError),

    #[error("Simulator error: {0}")]
    Sim(#[from] opendt_sim::SimError),

    #[error("Bus error: {0}")]
    Bus(#[from] opendt_bus::BusError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CalibrateError>;
