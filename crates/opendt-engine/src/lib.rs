#![allow(clippy::items_after_statements)]
#![allow(clippy::unused_async)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
//! OpenDT Window Engine
//!
//! Event-time windowing over the workload stream, heartbeat-driven closure,
//! and cumulative replay through the simulator driver:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         WINDOW ENGINE LOOP                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  workload ──▶ ingest ──▶ ring of windows [OPEN → CLOSED]            │
//! │  heartbeat ─▶ watermark ─▶ in-order closure                         │
//! │  closure ──▶ cumulative task list ──▶ cache lookup                  │
//! │      hit  ──▶ emit cached result           [CLOSED → SKIPPED]       │
//! │      miss ──▶ simulator invocation ──▶ emit [CLOSED → SIMULATED]    │
//! │  topology.calibrated change ──▶ cache clear + generation bump       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop is a single logical thread: every state transition happens on it,
//! simulator completions come back as events, and results leave in window-id
//! order.

pub mod cache;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod window;

pub use cache::ResultCache;
pub use config::EngineConfig;
pub use engine::{EngineEvent, EngineHandle, WindowEngine};
pub use metrics::{EngineMetrics, EngineStatus};
pub use window::{TimeWindow, WindowRing, WindowState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(#[from] opendt_bus::BusError),

    #[error("Simulator error: {0}")]
    Sim(#[from] opendt_sim::SimError),

    #[error("Core error: {0}")]
    Core(#[from] opendt_core::CoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
