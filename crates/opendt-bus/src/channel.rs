//! Logical channel descriptors
//!
//! Every channel the pipeline uses is declared here once, with its broker
//! mapping (NATS subject + JetStream stream name for streams, KV bucket for
//! compacted channels). Consumers and producers refer to these constants,
//! never to raw subjects.

/// Channel retention semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Append-only log, retention by age, offset checkpoints.
    Stream,
    /// Latest value per key, read-latest-on-subscribe.
    Compacted,
}

/// Static description of one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Logical name, used as the map key on the in-memory plane.
    pub name: &'static str,
    pub kind: ChannelKind,
    /// NATS subject (stream channels).
    pub subject: &'static str,
    /// JetStream stream name or KV bucket name.
    pub store: &'static str,
}

impl ChannelSpec {
    pub const fn stream(name: &'static str, subject: &'static str, store: &'static str) -> Self {
        Self {
            name,
            kind: ChannelKind::Stream,
            subject,
            store,
        }
    }

    pub const fn compacted(name: &'static str, store: &'static str) -> Self {
        Self {
            name,
            kind: ChannelKind::Compacted,
            subject: "",
            store,
        }
    }

    pub fn is_compacted(&self) -> bool {
        self.kind == ChannelKind::Compacted
    }
}

/// Compaction key for single-datacenter deployments.
pub const DATACENTER_KEY: &str = "datacenter";

/// The channels used by the core pipeline.
pub mod channels {
    use super::ChannelSpec;

    /// Tasks and heartbeats from the replay producer.
    pub const WORKLOAD: ChannelSpec = ChannelSpec::stream("workload", "opendt.workload", "OPENDT_WORKLOAD");

    /// Ground-truth power samples.
    pub const POWER: ChannelSpec = ChannelSpec::stream("power", "opendt.power", "OPENDT_POWER");

    /// One simulation report per closed window.
    pub const RESULTS: ChannelSpec = ChannelSpec::stream("results", "opendt.results", "OPENDT_RESULTS");

    /// Latest observed (real) topology per datacenter.
    pub const TOPOLOGY_OBSERVED: ChannelSpec = ChannelSpec::compacted("topology.observed", "opendt-topology-observed");

    /// Latest calibrated topology per datacenter, published by calibration.
    pub const TOPOLOGY_CALIBRATED: ChannelSpec =
        ChannelSpec::compacted("topology.calibrated", "opendt-topology-calibrated");

    pub const ALL: [ChannelSpec; 5] = [WORKLOAD, POWER, RESULTS, TOPOLOGY_OBSERVED, TOPOLOGY_CALIBRATED];
}
