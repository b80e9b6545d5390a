//! Simulator driver configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, SimError};

/// Configuration for driving the external simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Path to the simulator launcher binary
    pub opendc_bin: PathBuf,

    /// Root output directory; scratch and archives live under it
    pub output_dir: PathBuf,

    /// Per-invocation wall-clock timeout in seconds
    pub subprocess_timeout_seconds: u64,

    /// Grace between SIGTERM and SIGKILL in seconds
    pub kill_grace_seconds: u64,

    /// Export interval requested from the simulator, in seconds
    pub export_interval_seconds: u64,

    /// Keep per-run input/output archives
    pub archive_enabled: bool,

    /// Reject reused run ids instead of overwriting
    pub strict_runs: bool,

    /// Explicit Java home; discovered when unset
    pub java_home: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            opendc_bin: PathBuf::from("OpenDCExperimentRunner/bin/OpenDCExperimentRunner"),
            output_dir: PathBuf::from("output"),
            subprocess_timeout_seconds: 120,
            kill_grace_seconds: 10,
            export_interval_seconds: 150,
            archive_enabled: true,
            strict_runs: false,
            java_home: None,
        }
    }
}

impl SimConfig {
    /// Apply environment overrides (`JAVA_HOME`).
    pub fn from_env(mut self) -> Self {
        if self.java_home.is_none() {
            if let Ok(home) = std::env::var("JAVA_HOME") {
                self.java_home = Some(PathBuf::from(home));
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.subprocess_timeout_seconds == 0 {
            return Err(SimError::Config("subprocess timeout must be > 0".to_string()));
        }
        if self.export_interval_seconds == 0 {
            return Err(SimError::Config("export interval must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_seconds)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }
}
