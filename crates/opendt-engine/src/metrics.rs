//! Engine counters and the status snapshot served by the daemon

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Shared counters, updated by the engine loop and read by the status
/// endpoint.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub windows_open: AtomicU64,
    pub windows_closed: AtomicU64,
    pub windows_simulated: AtomicU64,
    pub windows_skipped: AtomicU64,
    /// Closed-but-unresolved windows (the backpressure gauge).
    pub backlog_depth: AtomicU64,
    pub invalid_events: AtomicU64,
    pub integrity_warnings: AtomicU64,
    pub cache_entries: AtomicU64,
    pub topology_generation: AtomicU64,
    /// Watermark in epoch milliseconds, -1 before the first message.
    pub watermark_ms: AtomicI64,
}

impl EngineMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            watermark_ms: AtomicI64::new(-1),
            ..Default::default()
        })
    }

    pub fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            windows_open: self.windows_open.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            windows_simulated: self.windows_simulated.load(Ordering::Relaxed),
            windows_skipped: self.windows_skipped.load(Ordering::Relaxed),
            backlog_depth: self.backlog_depth.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            integrity_warnings: self.integrity_warnings.load(Ordering::Relaxed),
            cache_entries: self.cache_entries.load(Ordering::Relaxed),
            topology_generation: self.topology_generation.load(Ordering::Relaxed),
            watermark_ms: self.watermark_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine status.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub windows_open: u64,
    pub windows_closed: u64,
    pub windows_simulated: u64,
    pub windows_skipped: u64,
    pub backlog_depth: u64,
    pub invalid_events: u64,
    pub integrity_warnings: u64,
    pub cache_entries: u64,
    pub topology_generation: u64,
    pub watermark_ms: i64,
}
