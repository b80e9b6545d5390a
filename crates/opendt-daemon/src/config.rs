//! Daemon configuration
//!
//! One TOML file covering every component, each section deserialized into
//! the owning crate's config struct. Environment overrides follow the
//! deployment contract: `RUN_ID` suffixes the output directory, `WORKER_ID`
//! names this instance, `JAVA_HOME` reaches the simulator driver.

use std::path::Path;

use serde::{Deserialize, Serialize};

use opendt_calibrate::CalibrationConfig;
use opendt_engine::EngineConfig;
use opendt_sim::SimConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneConfig {
    /// "nats" for the broker-backed plane, "memory" for embedded replay
    pub mode: String,
    /// NATS server URL
    pub url: String,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            mode: "nats".to_string(),
            url: "nats://localhost:4222".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CalibrationSection {
    pub enabled: bool,
    #[serde(flatten)]
    pub config: CalibrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Port for the HTTP status surface (default: 18600)
    pub http_port: u16,

    /// Logical instance id, reported in status output
    pub worker_id: Option<String>,

    /// Seconds to wait for the engines to drain on shutdown
    pub shutdown_grace_seconds: u64,

    pub plane: PlaneConfig,
    pub sim: SimConfig,
    pub engine: EngineConfig,
    pub calibration: CalibrationSection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_port: 18600,
            worker_id: None,
            shutdown_grace_seconds: 30,
            plane: PlaneConfig::default(),
            sim: SimConfig::default(),
            engine: EngineConfig::default(),
            calibration: CalibrationSection::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Deployment environment overrides.
    fn apply_env(&mut self) {
        if let Ok(run_id) = std::env::var("RUN_ID") {
            if !run_id.is_empty() {
                self.sim.output_dir = self.sim.output_dir.join(run_id);
            }
        }
        if self.worker_id.is_none() {
            if let Ok(worker_id) = std::env::var("WORKER_ID") {
                self.worker_id = Some(worker_id);
            }
        }
        self.sim = self.sim.clone().from_env();
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.sim.validate()?;
        self.engine.validate()?;
        if self.plane.mode != "nats" && self.plane.mode != "memory" {
            anyhow::bail!("plane.mode must be \"nats\" or \"memory\", got {:?}", self.plane.mode);
        }
        // Calibration is validated where it starts: a bad section disables
        // C6 only
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        DaemonConfig::default().validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let raw = r#"
http_port = 19000

[plane]
mode = "memory"

[sim]
opendc_bin = "/opt/opendc/bin/OpenDCExperimentRunner"
output_dir = "/var/lib/opendt/output"
subprocess_timeout_seconds = 90

[engine]
window_width_minutes = 10
max_pending_windows = 16

[calibration]
enabled = true
param_path = "clusters[*].hosts[*].cpuPowerModel.asymUtil"
min_value = 0.1
max_value = 0.9
linspace_points = 5
"#;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.http_port, 19000);
        assert_eq!(config.plane.mode, "memory");
        assert_eq!(config.engine.window_width_minutes, 10);
        assert_eq!(config.sim.subprocess_timeout_seconds, 90);
        assert!(config.calibration.enabled);
        assert_eq!(config.calibration.config.linspace_points, 5);
        assert!(config.calibration.config.validate().is_ok());
    }

    #[test]
    fn test_bad_plane_mode_rejected() {
        let config = DaemonConfig {
            plane: PlaneConfig {
                mode: "carrier-pigeon".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
