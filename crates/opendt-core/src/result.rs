//! Simulation results and per-window reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimStatus {
    Ok,
    Error,
}

/// Parsed outcome of one simulator invocation.
///
/// Series points are `(offset_ms, value)` pairs in simulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub status: SimStatus,
    #[serde(rename = "energyKWh")]
    pub energy_kwh: f64,
    pub mean_cpu_util: f64,
    #[serde(rename = "maxPowerW")]
    pub max_power_w: f64,
    pub runtime_hours: f64,
    pub power_series: Vec<(i64, f64)>,
    pub cpu_series: Vec<(i64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl SimulationResult {
    /// Result for an empty workload: nothing to simulate, all metrics zero.
    pub fn empty() -> Self {
        Self {
            status: SimStatus::Ok,
            energy_kwh: 0.0,
            mean_cpu_util: 0.0,
            max_power_w: 0.0,
            runtime_hours: 0.0,
            power_series: Vec::new(),
            cpu_series: Vec::new(),
            error_msg: None,
        }
    }

    /// Error result carrying the failure description.
    ///
    /// Metrics are zeroed rather than NaN so the report stays JSON-encodable;
    /// the aggregate sink substitutes NaN for error rows on its side.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            status: SimStatus::Error,
            energy_kwh: 0.0,
            mean_cpu_util: 0.0,
            max_power_w: 0.0,
            runtime_hours: 0.0,
            power_series: Vec::new(),
            cpu_series: Vec::new(),
            error_msg: Some(msg.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SimStatus::Ok
    }
}

/// One message on the `results` stream, emitted per closed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub run_id: String,
    pub window_id: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub task_count: usize,
    pub topology_fingerprint: String,
    pub result: SimulationResult,
}

/// Cache discriminator: two windows share a key iff they would feed the
/// simulator bit-identical input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub topology_fingerprint: String,
    pub cumulative_task_count: u64,
}

/// Run-scoped settings threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub output_dir: PathBuf,
    pub window_width: Duration,
    pub first_window_anchor: Option<DateTime<Utc>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, output_dir: impl Into<PathBuf>, window_width: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            output_dir: output_dir.into(),
            window_width,
            first_window_anchor: None,
        }
    }
}
