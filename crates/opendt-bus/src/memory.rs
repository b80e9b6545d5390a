//! In-process message plane
//!
//! Backs embedded runs and tests. Single consumer group per channel: the
//! committed offset is channel-level, and a fresh subscription resumes after
//! it, which mirrors the restart behavior of the broker-backed plane.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::channel::{ChannelKind, ChannelSpec};
use crate::plane::{Envelope, MessagePlane, Subscription};
use crate::{BusError, Result};

const SUBSCRIBER_QUEUE: usize = 1024;

struct ChannelState {
    kind: ChannelKind,
    /// Append-only log (stream channels).
    log: Vec<Envelope>,
    /// Latest value per key (compacted channels).
    latest: BTreeMap<String, Envelope>,
    next_offset: u64,
    subscribers: Vec<mpsc::Sender<Envelope>>,
    committed: Arc<AtomicU64>,
}

impl ChannelState {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            log: Vec::new(),
            latest: BTreeMap::new(),
            next_offset: 1,
            subscribers: Vec::new(),
            committed: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// In-memory plane with per-channel logs and latest-per-key compaction.
#[derive(Clone, Default)]
pub struct MemoryPlane {
    inner: Arc<Mutex<HashMap<&'static str, ChannelState>>>,
}

impl MemoryPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries, for test assertions.
    pub async fn len(&self, channel: &ChannelSpec) -> usize {
        let inner = self.inner.lock().await;
        inner
            .get(channel.name)
            .map(|state| match state.kind {
                ChannelKind::Stream => state.log.len(),
                ChannelKind::Compacted => state.latest.len(),
            })
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, channel: &ChannelSpec) -> bool {
        self.len(channel).await == 0
    }
}

#[async_trait]
impl MessagePlane for MemoryPlane {
    async fn publish(&self, channel: &ChannelSpec, key: Option<&str>, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .entry(channel.name)
            .or_insert_with(|| ChannelState::new(channel.kind));

        let offset = state.next_offset;
        state.next_offset += 1;

        let envelope = Envelope {
            offset,
            key: key.map(str::to_string),
            payload,
        };

        match state.kind {
            ChannelKind::Stream => state.log.push(envelope.clone()),
            ChannelKind::Compacted => {
                let key = key.ok_or(BusError::MissingKey(channel.name))?;
                state.latest.insert(key.to_string(), envelope.clone());
            }
        }

        // Fan out in log order; drop subscribers that went away
        let mut alive = Vec::with_capacity(state.subscribers.len());
        for tx in state.subscribers.drain(..) {
            if tx.send(envelope.clone()).await.is_ok() {
                alive.push(tx);
            }
        }
        state.subscribers = alive;
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelSpec) -> Result<Subscription> {
        let mut inner = self.inner.lock().await;
        let state = inner
            .entry(channel.name)
            .or_insert_with(|| ChannelState::new(channel.kind));

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        match state.kind {
            ChannelKind::Stream => {
                let committed = state.committed.load(Ordering::SeqCst);
                for envelope in state.log.iter().filter(|e| e.offset > committed) {
                    // try_send: the subscriber has no reader yet, a blocking
                    // send here would hold the plane lock forever
                    tx.try_send(envelope.clone())
                        .map_err(|_| BusError::Subscribe("replay exceeds subscriber queue".to_string()))?;
                }
            }
            ChannelKind::Compacted => {
                for envelope in state.latest.values() {
                    tx.try_send(envelope.clone())
                        .map_err(|_| BusError::Subscribe("replay exceeds subscriber queue".to_string()))?;
                }
            }
        }

        state.subscribers.push(tx);

        // Commits land directly on the shared channel-level counter
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        Ok(Subscription::new(rx, ack_tx, state.committed.clone()))
    }

    async fn committed_offset(&self, channel: &ChannelSpec) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .get(channel.name)
            .map(|state| state.committed.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
