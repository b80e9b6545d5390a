//! OpenDT Message Plane
//!
//! Abstract ordered pub/sub log with two channel semantics:
//!
//! - **stream**: append-only, retained by age. Consumers checkpoint offsets
//!   and resume from the committed position.
//! - **compacted**: key/value, broker keeps the latest value per key.
//!   Consumers read the latest on subscribe, then receive updates.
//!
//! Two planes implement the contract:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │         MemoryPlane          │   │          NatsPlane           │
//! ├──────────────────────────────┤   ├──────────────────────────────┤
//! │ In-process Vec log + fan-out │   │ JetStream stream per stream  │
//! │ Latest-per-key map           │   │ channel, KV bucket per       │
//! │ Tests, embedded replay       │   │ compacted channel            │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! Delivery is at-least-once; per channel, envelopes arrive in log order and
//! a subscription is consumed serially.

pub mod channel;
pub mod memory;
pub mod nats;
pub mod plane;

pub use channel::{channels, ChannelKind, ChannelSpec, DATACENTER_KEY};
pub use memory::MemoryPlane;
pub use nats::{NatsPlane, NatsPlaneConfig};
pub use plane::{Envelope, MessagePlane, Subscription};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Channel {0} requires a key for publish")]
    MissingKey(&'static str),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
