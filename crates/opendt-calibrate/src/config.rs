//! Calibration configuration

use serde::{Deserialize, Serialize};

use crate::path::ParamPath;
use crate::{CalibrateError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Dotted path to the tuned numeric leaf (wildcards allowed)
    pub param_path: String,

    /// Search space bounds, inclusive
    pub min_value: f64,
    pub max_value: f64,

    /// Evenly spaced candidates in `[min_value, max_value]`
    pub linspace_points: usize,

    /// Concurrent simulator processes
    pub max_parallel_workers: usize,

    /// Event-time span of one calibration batch
    pub mape_window_minutes: u32,

    /// Required improvement over the published MAPE before re-publishing
    pub improvement_epsilon: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            param_path: String::new(),
            min_value: 0.0,
            max_value: 0.0,
            linspace_points: 10,
            max_parallel_workers: 4,
            mape_window_minutes: 60,
            improvement_epsilon: 0.0,
        }
    }
}

impl CalibrationConfig {
    /// Startup validation. Failures here disable calibration without
    /// touching the simulation pipeline.
    pub fn validate(&self) -> Result<ParamPath> {
        let path = ParamPath::parse(&self.param_path)?;
        if !self.min_value.is_finite() || !self.max_value.is_finite() {
            return Err(CalibrateError::Config("bounds must be finite".to_string()));
        }
        if self.min_value >= self.max_value {
            return Err(CalibrateError::Config(format!(
                "min_value {} must be below max_value {}",
                self.min_value, self.max_value
            )));
        }
        if self.linspace_points < 2 {
            return Err(CalibrateError::Config("linspace_points must be >= 2".to_string()));
        }
        if self.max_parallel_workers == 0 {
            return Err(CalibrateError::Config("max_parallel_workers must be >= 1".to_string()));
        }
        if self.mape_window_minutes == 0 {
            return Err(CalibrateError::Config("mape_window_minutes must be >= 1".to_string()));
        }
        Ok(path)
    }

    pub fn midpoint(&self) -> f64 {
        (self.min_value + self.max_value) / 2.0
    }

    /// Evenly spaced candidate values, bounds inclusive.
    pub fn candidates(&self) -> Vec<f64> {
        let n = self.linspace_points;
        let step = (self.max_value - self.min_value) / (n - 1) as f64;
        (0..n).map(|i| self.min_value + step * i as f64).collect()
    }
}
