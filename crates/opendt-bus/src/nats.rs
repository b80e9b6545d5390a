//! NATS JetStream message plane
//!
//! Stream channels map to JetStream streams with durable pull consumers and
//! explicit offset checkpoints (AckPolicy::All, so one ack commits every
//! delivered message up to it). Compacted channels map to KV buckets with
//! history 1, which is the broker-side latest-per-key retention.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};

use crate::channel::{ChannelKind, ChannelSpec};
use crate::channel::channels;
use crate::plane::{Envelope, MessagePlane, Subscription};
use crate::{BusError, Result};

/// NATS plane configuration.
#[derive(Debug, Clone)]
pub struct NatsPlaneConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Durable consumer name prefix
    pub consumer_prefix: String,
    /// Stream retention age
    pub stream_max_age: Duration,
    /// Local delivery queue per subscription
    pub queue_depth: usize,
}

impl Default for NatsPlaneConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            consumer_prefix: "opendt".to_string(),
            stream_max_age: Duration::from_secs(24 * 3600),
            queue_depth: 1024,
        }
    }
}

/// JetStream-backed plane.
pub struct NatsPlane {
    config: NatsPlaneConfig,
    jetstream: jetstream::Context,
    committed: Mutex<HashMap<&'static str, Arc<AtomicU64>>>,
}

impl NatsPlane {
    /// Connect and ensure all core streams exist.
    pub async fn connect(config: NatsPlaneConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client);

        let plane = Self {
            config,
            jetstream,
            committed: Mutex::new(HashMap::new()),
        };
        plane.init_streams().await?;
        Ok(plane)
    }

    /// Create the JetStream streams for all stream channels up front.
    async fn init_streams(&self) -> Result<()> {
        for channel in &channels::ALL {
            if channel.kind != ChannelKind::Stream {
                continue;
            }
            self.jetstream
                .get_or_create_stream(jetstream::stream::Config {
                    name: channel.store.to_string(),
                    subjects: vec![channel.subject.to_string()],
                    max_age: self.config.stream_max_age,
                    ..Default::default()
                })
                .await
                .map_err(|e| BusError::Connect(format!("stream {}: {e}", channel.store)))?;
        }
        tracing::info!("JetStream streams initialized");
        Ok(())
    }

    async fn bucket(&self, channel: &ChannelSpec) -> Result<kv::Store> {
        match self.jetstream.get_key_value(channel.store).await {
            Ok(store) => Ok(store),
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: channel.store.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| BusError::Connect(format!("bucket {}: {e}", channel.store))),
        }
    }

    async fn committed_cell(&self, channel: &ChannelSpec) -> Arc<AtomicU64> {
        let mut committed = self.committed.lock().await;
        committed
            .entry(channel.name)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    async fn subscribe_stream(&self, channel: &ChannelSpec) -> Result<Subscription> {
        let stream = self
            .jetstream
            .get_stream(channel.store)
            .await
            .map_err(|e| BusError::Subscribe(format!("stream {}: {e}", channel.store)))?;

        let durable = format!("{}-{}", self.config.consumer_prefix, channel.name);
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                durable_name: Some(durable.clone()),
                ack_policy: AckPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {durable}: {e}")))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(format!("consumer {durable}: {e}")))?;

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<u64>();
        let committed = self.committed_cell(channel).await;
        let channel_name = channel.name;

        tokio::spawn(async move {
            // Delivered-but-uncommitted messages, in stream order
            let mut pending: VecDeque<(u64, jetstream::Message)> = VecDeque::new();
            loop {
                tokio::select! {
                    delivered = messages.next() => match delivered {
                        Some(Ok(message)) => {
                            let offset = message.info().map(|i| i.stream_sequence).unwrap_or(0);
                            let envelope = Envelope {
                                offset,
                                key: None,
                                payload: message.payload.to_vec(),
                            };
                            if tx.send(envelope).await.is_err() {
                                break; // subscription dropped
                            }
                            pending.push_back((offset, message));
                        }
                        Some(Err(e)) => {
                            tracing::warn!("consumer {channel_name}: {e}, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => break,
                    },
                    committed_to = ack_rx.recv() => match committed_to {
                        Some(offset) => {
                            let mut last = None;
                            while pending.front().is_some_and(|(seq, _)| *seq <= offset) {
                                last = pending.pop_front();
                            }
                            if let Some((_, message)) = last {
                                // AckPolicy::All: acks everything up to here
                                if let Err(e) = message.ack().await {
                                    tracing::warn!("ack on {channel_name} failed: {e}");
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Subscription::new(rx, ack_tx, committed))
    }

    async fn subscribe_compacted(&self, channel: &ChannelSpec) -> Result<Subscription> {
        let store = self.bucket(channel).await?;

        // Watch before the initial read so no update is missed; duplicates
        // are fine, compacted consumers apply latest-wins
        let mut watch = store
            .watch_all()
            .await
            .map_err(|e| BusError::Subscribe(format!("watch {}: {e}", channel.store)))?;

        let (tx, rx) = mpsc::channel(self.config.queue_depth);

        let mut keys = store
            .keys()
            .await
            .map_err(|e| BusError::Subscribe(format!("keys {}: {e}", channel.store)))?;
        while let Some(key) = keys.next().await {
            let Ok(key) = key else { continue };
            let entry = store
                .entry(&key)
                .await
                .map_err(|e| BusError::Subscribe(format!("entry {key}: {e}")))?;
            if let Some(entry) = entry {
                let envelope = Envelope {
                    offset: entry.revision,
                    key: Some(entry.key),
                    payload: entry.value.to_vec(),
                };
                tx.try_send(envelope)
                    .map_err(|_| BusError::Subscribe("replay exceeds subscriber queue".to_string()))?;
            }
        }

        let committed = self.committed_cell(channel).await;
        let channel_name = channel.name;

        tokio::spawn(async move {
            while let Some(entry) = watch.next().await {
                match entry {
                    Ok(entry) if entry.operation == kv::Operation::Put => {
                        let envelope = Envelope {
                            offset: entry.revision,
                            key: Some(entry.key),
                            payload: entry.value.to_vec(),
                        };
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {} // deletes/purges are not part of the contract
                    Err(e) => {
                        tracing::warn!("watch {channel_name}: {e}, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Compacted progress is positional only; commits just move the local marker
        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        Ok(Subscription::new(rx, ack_tx, committed))
    }
}

#[async_trait]
impl MessagePlane for NatsPlane {
    async fn publish(&self, channel: &ChannelSpec, key: Option<&str>, payload: Vec<u8>) -> Result<()> {
        match channel.kind {
            ChannelKind::Stream => {
                let ack = self
                    .jetstream
                    .publish(channel.subject.to_string(), payload.into())
                    .await
                    .map_err(|e| BusError::Publish(format!("{}: {e}", channel.name)))?;
                ack.await
                    .map_err(|e| BusError::Publish(format!("{} ack: {e}", channel.name)))?;
            }
            ChannelKind::Compacted => {
                let key = key.ok_or(BusError::MissingKey(channel.name))?;
                let store = self.bucket(channel).await?;
                store
                    .put(key, payload.into())
                    .await
                    .map_err(|e| BusError::Publish(format!("{}: {e}", channel.name)))?;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelSpec) -> Result<Subscription> {
        match channel.kind {
            ChannelKind::Stream => self.subscribe_stream(channel).await,
            ChannelKind::Compacted => self.subscribe_compacted(channel).await,
        }
    }

    async fn committed_offset(&self, channel: &ChannelSpec) -> u64 {
        self.committed_cell(channel)
            .await
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}
