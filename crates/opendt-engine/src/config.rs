//! Window engine configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of each time window in minutes
    pub window_width_minutes: u32,

    /// Expected inter-heartbeat spacing in minutes (advisory, sizes the
    /// closure backlog expectations)
    pub heartbeat_cadence_minutes: u32,

    /// Result cache entry bound
    pub cache_max_entries: usize,

    /// Closed-but-unsimulated windows tolerated before closure pauses
    pub max_pending_windows: usize,

    /// Explicit first window anchor; defaults to the first observed
    /// timestamp floored to the window width
    pub first_window_anchor: Option<DateTime<Utc>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_width_minutes: 5,
            heartbeat_cadence_minutes: 1,
            cache_max_entries: 1024,
            max_pending_windows: 32,
            first_window_anchor: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_width_minutes == 0 {
            return Err(EngineError::Config("window width must be > 0".to_string()));
        }
        if self.max_pending_windows == 0 {
            return Err(EngineError::Config("max pending windows must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn window_width_ms(&self) -> i64 {
        i64::from(self.window_width_minutes) * 60_000
    }
}
