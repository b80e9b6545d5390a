//! Plane contract: publish, subscribe, checkpoint

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::ChannelSpec;
use crate::{BusError, Result};

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Log offset (stream sequence / KV revision). Monotonic per channel.
    pub offset: u64,
    /// Compaction key, present on compacted channels.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A serially consumed channel subscription.
///
/// `commit` checkpoints progress: on the NATS plane it acks every delivered
/// message up to the offset, on the memory plane it advances the channel's
/// resume position. Committing out of order is allowed but never moves the
/// checkpoint backwards.
pub struct Subscription {
    rx: mpsc::Receiver<Envelope>,
    ack_tx: mpsc::UnboundedSender<u64>,
    committed: Arc<AtomicU64>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::Receiver<Envelope>,
        ack_tx: mpsc::UnboundedSender<u64>,
        committed: Arc<AtomicU64>,
    ) -> Self {
        Self { rx, ack_tx, committed }
    }

    /// Next envelope in channel order. `None` once the plane shuts down.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Checkpoint all offsets `<= offset`.
    pub fn commit(&self, offset: u64) {
        self.committed.fetch_max(offset, Ordering::SeqCst);
        // Receiver side may already be gone during shutdown; ignore
        let _ = self.ack_tx.send(offset);
    }

    /// Highest committed offset observed by this subscription.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}

/// The message plane contract shared by all implementations.
#[async_trait]
pub trait MessagePlane: Send + Sync {
    /// Publish raw bytes. Compacted channels require a key.
    async fn publish(&self, channel: &ChannelSpec, key: Option<&str>, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a channel. Stream channels resume after the committed
    /// offset; compacted channels deliver the latest value per key first.
    async fn subscribe(&self, channel: &ChannelSpec) -> Result<Subscription>;

    /// Committed offset for a channel, 0 when nothing was ever committed.
    async fn committed_offset(&self, channel: &ChannelSpec) -> u64;
}

/// Publish a serializable value as JSON.
pub async fn publish_json<T: Serialize + Sync>(
    plane: &dyn MessagePlane,
    channel: &ChannelSpec,
    key: Option<&str>,
    value: &T,
) -> Result<()> {
    if channel.is_compacted() && key.is_none() {
        return Err(BusError::MissingKey(channel.name));
    }
    let payload = serde_json::to_vec(value)?;
    plane.publish(channel, key, payload).await
}
