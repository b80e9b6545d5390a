//! Datacenter topology tree
//!
//! The topology is the simulator's hardware and power model input. It is
//! deep-copied freely (calibration patches copies, never the observed cell)
//! and identified everywhere by its canonical fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// Root of the topology tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub name: String,
    pub count: u32,
    pub cpu: Cpu,
    pub memory: Memory,
    pub cpu_power_model: CpuPowerModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    pub core_count: u32,
    #[serde(rename = "coreSpeedMHz")]
    pub core_speed_mhz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub memory_size_bytes: i64,
}

/// Host CPU power model parameters.
///
/// `asym_util` is only meaningful for the asymptotic model but is carried for
/// all model types so calibration paths resolve uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuPowerModel {
    pub model_type: PowerModelType,
    pub power: f64,
    pub idle_power: f64,
    pub max_power: f64,
    pub asym_util: f64,
    pub dvfs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerModelType {
    Asymptotic,
    Linear,
    Mse,
    Square,
    Cubic,
    Sqrt,
}

/// Snapshot carried on the compacted topology channels, keyed by the
/// datacenter id so the broker retains only the latest per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub timestamp: DateTime<Utc>,
    pub topology: Topology,
}

impl Topology {
    pub fn validate(&self) -> Result<()> {
        for cluster in &self.clusters {
            for host in &cluster.hosts {
                if host.count < 1 {
                    return Err(CoreError::Validation(format!(
                        "host {}/{}: count must be >= 1",
                        cluster.name, host.name
                    )));
                }
                if host.cpu.core_count < 1 {
                    return Err(CoreError::Validation(format!(
                        "host {}/{}: coreCount must be >= 1",
                        cluster.name, host.name
                    )));
                }
                if host.cpu.core_speed_mhz <= 0.0 {
                    return Err(CoreError::Validation(format!(
                        "host {}/{}: coreSpeedMHz must be > 0",
                        cluster.name, host.name
                    )));
                }
                if host.memory.memory_size_bytes <= 0 {
                    return Err(CoreError::Validation(format!(
                        "host {}/{}: memorySizeBytes must be > 0",
                        cluster.name, host.name
                    )));
                }
                host.cpu_power_model.validate(&cluster.name, &host.name)?;
            }
        }
        Ok(())
    }
}

impl CpuPowerModel {
    fn validate(&self, cluster: &str, host: &str) -> Result<()> {
        if self.power <= 0.0 || self.max_power <= 0.0 {
            return Err(CoreError::Validation(format!(
                "host {cluster}/{host}: power and maxPower must be > 0"
            )));
        }
        if self.idle_power < 0.0 {
            return Err(CoreError::Validation(format!(
                "host {cluster}/{host}: idlePower must be >= 0"
            )));
        }
        if !(0.0..=1.0).contains(&self.asym_util) {
            return Err(CoreError::Validation(format!(
                "host {cluster}/{host}: asymUtil must be in [0, 1]"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_topology() -> Topology {
    Topology {
        clusters: vec![Cluster {
            name: "C01".to_string(),
            hosts: vec![Host {
                name: "H01".to_string(),
                count: 2,
                cpu: Cpu {
                    core_count: 32,
                    core_speed_mhz: 2400.0,
                },
                memory: Memory {
                    memory_size_bytes: 256_000_000_000,
                },
                cpu_power_model: CpuPowerModel {
                    model_type: PowerModelType::Asymptotic,
                    power: 400.0,
                    idle_power: 120.0,
                    max_power: 400.0,
                    asym_util: 0.3,
                    dvfs: false,
                },
            }],
        }],
    }
}
