//! Power sample tracker
//!
//! Event-time bounded buffer of measured power. Samples arrive roughly in
//! order; the tracker keeps them sorted, serves range queries for batch
//! scoring, and drops history behind the retention horizon.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use opendt_core::PowerSample;

pub struct PowerTracker {
    samples: VecDeque<PowerSample>,
    max_retention: Duration,
    /// Start of the oldest live calibration batch; nothing at or after it is
    /// dropped regardless of age.
    pinned_start: Option<DateTime<Utc>>,
}

impl PowerTracker {
    pub fn new(max_retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            max_retention,
            pinned_start: None,
        }
    }

    /// Default retention: 24 hours.
    pub fn with_default_retention() -> Self {
        Self::new(Duration::hours(24))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }

    /// Insert keeping timestamp order; slightly late samples are tolerated.
    pub fn push(&mut self, sample: PowerSample) {
        match self.samples.back() {
            Some(last) if sample.timestamp < last.timestamp => {
                let at = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(at, sample);
            }
            _ => self.samples.push_back(sample),
        }
        self.evict();
    }

    /// Samples with `timestamp ∈ [start, end)` in timestamp order.
    pub fn samples_in(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PowerSample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .copied()
            .collect()
    }

    /// Protect everything at or after `start` from retention.
    pub fn pin(&mut self, start: DateTime<Utc>) {
        self.pinned_start = Some(start);
    }

    pub fn release_pin(&mut self) {
        self.pinned_start = None;
        self.evict();
    }

    fn evict(&mut self) {
        let Some(latest) = self.latest_timestamp() else { return };
        let mut horizon = latest - self.max_retention;
        if let Some(pin) = self.pinned_start {
            horizon = horizon.min(pin);
        }
        while self.samples.front().map_or(false, |s| s.timestamp < horizon) {
            self.samples.pop_front();
        }
    }
}
