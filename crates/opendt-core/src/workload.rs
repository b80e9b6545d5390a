//! Workload and power wire types
//!
//! Shapes match the replay producer exactly:
//!
//! ```text
//! workload  {"message_type":"task"|"heartbeat","timestamp":"<ISO-8601>","task":<Task|null>}
//! power     {"timestamp":"<ISO-8601>","power_draw":<W>,"energy_usage":<J>}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// A single workload task with its execution profile.
///
/// Immutable once accepted; unique by `id` within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub submission_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub cpu_count: i32,
    #[serde(rename = "cpuCapacityMHz")]
    pub cpu_capacity_mhz: f64,
    #[serde(rename = "memCapacityMB")]
    pub mem_capacity_mb: i64,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
}

/// One step of a task's execution profile.
///
/// Fragment durations need not sum to the task duration; the simulator
/// interprets them independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: i64,
    pub task_id: i64,
    pub duration_ms: i64,
    pub cpu_count: i32,
    pub cpu_usage: f64,
}

/// Inbound workload stream message.
///
/// Heartbeats carry only a timestamp and exist to advance the watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum WorkloadMessage {
    Task {
        timestamp: DateTime<Utc>,
        task: Task,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<serde_json::Value>,
    },
}

impl WorkloadMessage {
    /// Event timestamp regardless of kind.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WorkloadMessage::Task { timestamp, .. } | WorkloadMessage::Heartbeat { timestamp, .. } => *timestamp,
        }
    }
}

/// Ground-truth power measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "power_draw")]
    pub power_draw_w: f64,
    #[serde(rename = "energy_usage")]
    pub energy_j: f64,
}

impl Task {
    /// Ingress validation. Internal representations stay plain values;
    /// validation happens once at the boundary.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count < 1 {
            return Err(CoreError::Validation(format!(
                "task {}: cpuCount must be >= 1, got {}",
                self.id, self.cpu_count
            )));
        }
        if self.cpu_capacity_mhz < 0.0 {
            return Err(CoreError::Validation(format!(
                "task {}: cpuCapacityMHz must be >= 0",
                self.id
            )));
        }
        if self.mem_capacity_mb < 0 {
            return Err(CoreError::Validation(format!(
                "task {}: memCapacityMB must be >= 0",
                self.id
            )));
        }
        for fragment in &self.fragments {
            fragment.validate()?;
            if fragment.task_id != self.id {
                return Err(CoreError::Validation(format!(
                    "fragment {} references task {} but belongs to task {}",
                    fragment.id, fragment.task_id, self.id
                )));
            }
        }
        Ok(())
    }
}

impl Fragment {
    pub fn validate(&self) -> Result<()> {
        if self.duration_ms < 0 {
            return Err(CoreError::Validation(format!(
                "fragment {}: durationMs must be >= 0",
                self.id
            )));
        }
        if self.cpu_count < 1 {
            return Err(CoreError::Validation(format!(
                "fragment {}: cpuCount must be >= 1",
                self.id
            )));
        }
        if self.cpu_usage < 0.0 {
            return Err(CoreError::Validation(format!(
                "fragment {}: cpuUsage must be >= 0",
                self.id
            )));
        }
        Ok(())
    }
}

impl PowerSample {
    pub fn validate(&self) -> Result<()> {
        if self.power_draw_w < 0.0 || self.energy_j < 0.0 {
            return Err(CoreError::Validation(format!(
                "power sample at {}: negative power or energy",
                self.timestamp
            )));
        }
        Ok(())
    }
}
