//! The calibration loop
//!
//! Consumes its own copies of the workload and power streams plus the
//! observed topology, and runs serial epochs: accumulate a batch, fan out
//! one simulator run per candidate value, score by MAPE, publish the winner
//! on the calibrated channel when it beats the published value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use opendt_bus::plane::publish_json;
use opendt_bus::{channels, MessagePlane, DATACENTER_KEY};
use opendt_core::{CellView, PowerSample, Task, Topology, TopologySnapshot, WorkloadMessage};
use opendt_core::topology_fingerprint;
use opendt_sim::{AggRow, OutputSink, SimulatorDriver};

use crate::config::CalibrationConfig;
use crate::mape::mape;
use crate::path::ParamPath;
use crate::power::PowerTracker;
use crate::Result;

const EVENT_QUEUE: usize = 4096;

pub enum CalEvent {
    Workload(WorkloadMessage),
    Power(PowerSample),
    TopologyObserved(Arc<CellView>),
    Shutdown,
}

#[derive(Clone)]
pub struct CalibrationHandle {
    tx: mpsc::Sender<CalEvent>,
}

impl CalibrationHandle {
    pub async fn workload(&self, message: WorkloadMessage) {
        let _ = self.tx.send(CalEvent::Workload(message)).await;
    }

    pub async fn power(&self, sample: PowerSample) {
        let _ = self.tx.send(CalEvent::Power(sample)).await;
    }

    pub async fn topology_observed(&self, view: Arc<CellView>) {
        let _ = self.tx.send(CalEvent::TopologyObserved(view)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CalEvent::Shutdown).await;
    }
}

/// Shared calibration counters. f64 cells are stored as bit patterns with
/// NaN meaning "not yet".
#[derive(Debug)]
pub struct CalibrationMetrics {
    pub epochs_completed: AtomicU64,
    pub candidates_failed: AtomicU64,
    pub published_updates: AtomicU64,
    last_winner_value: AtomicU64,
    last_winner_mape: AtomicU64,
}

impl CalibrationMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            epochs_completed: AtomicU64::new(0),
            candidates_failed: AtomicU64::new(0),
            published_updates: AtomicU64::new(0),
            last_winner_value: AtomicU64::new(f64::NAN.to_bits()),
            last_winner_mape: AtomicU64::new(f64::NAN.to_bits()),
        })
    }

    fn record_winner(&self, value: f64, score: f64) {
        self.last_winner_value.store(value.to_bits(), Ordering::Relaxed);
        self.last_winner_mape.store(score.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CalibrationStatus {
        let value = f64::from_bits(self.last_winner_value.load(Ordering::Relaxed));
        let score = f64::from_bits(self.last_winner_mape.load(Ordering::Relaxed));
        CalibrationStatus {
            epochs_completed: self.epochs_completed.load(Ordering::Relaxed),
            candidates_failed: self.candidates_failed.load(Ordering::Relaxed),
            published_updates: self.published_updates.load(Ordering::Relaxed),
            last_winner_value: (!value.is_nan()).then_some(value),
            last_winner_mape: (!score.is_nan()).then_some(score),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationStatus {
    pub epochs_completed: u64,
    pub candidates_failed: u64,
    pub published_updates: u64,
    pub last_winner_value: Option<f64>,
    pub last_winner_mape: Option<f64>,
}

struct CandidateOutcome {
    index: usize,
    value: f64,
    topology: Option<Topology>,
    result: Option<opendt_core::SimulationResult>,
    score: Option<f64>,
    error: Option<String>,
    scope: Option<opendt_sim::RunScope>,
}

/// The calibration engine (C6). Owns its own worker pool; epochs never
/// overlap.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    path: ParamPath,
    driver: Arc<SimulatorDriver>,
    sink: Arc<OutputSink>,
    plane: Arc<dyn MessagePlane>,
    observed: Option<Arc<CellView>>,
    tracker: PowerTracker,
    tasks: Vec<Task>,
    batch_start: Option<DateTime<Utc>>,
    workload_high: Option<DateTime<Utc>>,
    power_high: Option<DateTime<Utc>>,
    epoch: u64,
    published_value: Option<f64>,
    published_mape: Option<f64>,
    metrics: Arc<CalibrationMetrics>,
}

impl CalibrationEngine {
    /// Validates the configuration up front; a bad config disables
    /// calibration without affecting the simulation side.
    pub fn new(
        config: CalibrationConfig,
        driver: Arc<SimulatorDriver>,
        sink: Arc<OutputSink>,
        plane: Arc<dyn MessagePlane>,
        metrics: Arc<CalibrationMetrics>,
    ) -> Result<(Self, CalibrationHandle, mpsc::Receiver<CalEvent>)> {
        let path = config.validate()?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let engine = Self {
            path,
            driver,
            sink,
            plane,
            observed: None,
            tracker: PowerTracker::with_default_retention(),
            tasks: Vec::new(),
            batch_start: None,
            workload_high: None,
            power_high: None,
            epoch: 0,
            published_value: None,
            published_mape: None,
            metrics,
            config,
        };
        Ok((engine, CalibrationHandle { tx }, rx))
    }

    fn batch_span(&self) -> Duration {
        Duration::minutes(i64::from(self.config.mape_window_minutes))
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<CalEvent>) {
        tracing::info!(
            param_path = %self.config.param_path,
            min = self.config.min_value,
            max = self.config.max_value,
            points = self.config.linspace_points,
            workers = self.config.max_parallel_workers,
            "calibration engine started"
        );
        while let Some(event) = events.recv().await {
            match event {
                CalEvent::Workload(message) => self.on_workload(message),
                CalEvent::Power(sample) => self.on_power(sample),
                CalEvent::TopologyObserved(view) => {
                    tracing::info!(generation = view.generation, "observed topology updated");
                    self.observed = Some(view);
                }
                CalEvent::Shutdown => break,
            }
            while self.batch_ready() {
                if let Err(e) = self.run_epoch().await {
                    tracing::warn!(epoch = self.epoch, "epoch aborted: {e}");
                    self.advance_batch();
                }
            }
        }
        tracing::info!("calibration engine stopped");
    }

    fn on_workload(&mut self, message: WorkloadMessage) {
        let timestamp = message.timestamp();
        if self.workload_high.map_or(true, |t| timestamp > t) {
            self.workload_high = Some(timestamp);
        }
        if let WorkloadMessage::Task { task, .. } = message {
            if task.validate().is_ok() {
                self.note_batch_start(task.submission_time);
                self.tasks.push(task);
            }
        }
    }

    fn on_power(&mut self, sample: PowerSample) {
        if sample.validate().is_err() {
            return;
        }
        if self.power_high.map_or(true, |t| sample.timestamp > t) {
            self.power_high = Some(sample.timestamp);
        }
        self.note_batch_start(sample.timestamp);
        self.tracker.push(sample);
    }

    /// Before the first epoch the batch anchors on the earliest observed
    /// timestamp; afterwards it advances strictly by the span.
    fn note_batch_start(&mut self, timestamp: DateTime<Utc>) {
        if self.epoch > 0 {
            return;
        }
        let anchored = self.batch_start.map_or(timestamp, |s| s.min(timestamp));
        if self.batch_start != Some(anchored) {
            self.batch_start = Some(anchored);
            self.tracker.pin(anchored);
        }
    }

    /// Both streams must have watermarked past the batch end, and a base
    /// topology must be known.
    fn batch_ready(&self) -> bool {
        let (Some(start), Some(wl), Some(pw)) = (self.batch_start, self.workload_high, self.power_high) else {
            return false;
        };
        self.observed.is_some() && wl.min(pw) >= start + self.batch_span()
    }

    fn advance_batch(&mut self) {
        let Some(start) = self.batch_start else { return };
        let end = start + self.batch_span();
        self.tasks.retain(|t| t.submission_time >= end);
        self.batch_start = Some(end);
        self.tracker.pin(end);
        self.epoch += 1;
    }

    async fn run_epoch(&mut self) -> Result<()> {
        let start = self.batch_start.expect("batch_ready checked start");
        let end = start + self.batch_span();
        let epoch = self.epoch;
        let observed = self.observed.clone().expect("batch_ready checked topology");

        let samples = self.tracker.samples_in(start, end);
        let observed_series: Vec<(i64, f64)> = samples
            .iter()
            .map(|s| (s.timestamp.timestamp_millis(), s.power_draw_w))
            .collect();
        let batch_tasks: Arc<Vec<Task>> = Arc::new(
            self.tasks
                .iter()
                .filter(|t| t.submission_time >= start && t.submission_time < end)
                .cloned()
                .collect(),
        );

        if observed_series.is_empty() || batch_tasks.is_empty() {
            tracing::debug!(epoch, "batch has no overlap of tasks and power, skipping");
            self.advance_batch();
            return Ok(());
        }

        tracing::info!(
            epoch,
            tasks = batch_tasks.len(),
            samples = observed_series.len(),
            "starting calibration epoch"
        );

        let base = serde_json::to_value(observed.topology.as_ref())?;
        let candidates = self.config.candidates();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_workers));
        let mut joins = Vec::with_capacity(candidates.len());

        for (index, value) in candidates.iter().copied().enumerate() {
            let mut patched = base.clone();
            self.path.patch(&mut patched, value)?;
            let topology: Topology = serde_json::from_value(patched)?;

            let driver = self.driver.clone();
            let semaphore = semaphore.clone();
            let tasks = batch_tasks.clone();
            let run_id = format!("epoch-{epoch}-candidate-{index}");
            let observed_series = observed_series.clone();

            joins.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match driver.invoke(&topology, &tasks, &run_id).await {
                    Ok(run) if run.result.is_ok() => {
                        let score = mape(&observed_series, &run.result.power_series);
                        CandidateOutcome {
                            index,
                            value,
                            topology: Some(topology),
                            score,
                            error: score.is_none().then(|| "no aligned power samples".to_string()),
                            result: Some(run.result),
                            scope: run.scope,
                        }
                    }
                    Ok(run) => CandidateOutcome {
                        index,
                        value,
                        topology: None,
                        result: None,
                        score: None,
                        error: run.result.error_msg,
                        scope: run.scope,
                    },
                    Err(e) => CandidateOutcome {
                        index,
                        value,
                        topology: None,
                        result: None,
                        score: None,
                        error: Some(e.to_string()),
                        scope: None,
                    },
                }
            }));
        }

        let mut outcomes = Vec::with_capacity(joins.len());
        for join in joins {
            match join.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(epoch, "candidate task panicked: {e}"),
            }
        }

        self.record_candidates(epoch, start, end, batch_tasks.len(), &mut outcomes)
            .await;

        let midpoint = self.config.midpoint();
        let winner = outcomes
            .iter()
            .filter_map(|o| {
                let score = o.score?;
                o.topology.as_ref().map(|t| (o.value, score, t))
            })
            .min_by(|(va, sa, _), (vb, sb, _)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        (va - midpoint)
                            .abs()
                            .partial_cmp(&(vb - midpoint).abs())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });

        match winner {
            Some((value, score, topology)) => {
                tracing::info!(epoch, value, score, "epoch winner elected");
                self.metrics.record_winner(value, score);
                self.append_epoch_row(epoch, start, end, batch_tasks.len(), Some((value, score, topology)))
                    .await;
                if self.improves(score) {
                    self.publish_winner(end, value, score, topology.clone()).await;
                } else {
                    tracing::debug!(epoch, "winner does not beat the published value");
                }
            }
            None => {
                tracing::warn!(epoch, "all candidates failed, skipping publication");
                self.append_epoch_row(epoch, start, end, batch_tasks.len(), None).await;
            }
        }

        self.metrics.epochs_completed.fetch_add(1, Ordering::Relaxed);
        self.advance_batch();
        Ok(())
    }

    fn improves(&self, score: f64) -> bool {
        match self.published_mape {
            None => true,
            Some(current) => score < current && current - score >= self.config.improvement_epsilon,
        }
    }

    async fn publish_winner(&mut self, timestamp: DateTime<Utc>, value: f64, score: f64, topology: Topology) {
        let snapshot = TopologySnapshot {
            timestamp,
            topology,
        };
        match publish_json(
            self.plane.as_ref(),
            &channels::TOPOLOGY_CALIBRATED,
            Some(DATACENTER_KEY),
            &snapshot,
        )
        .await
        {
            Ok(()) => {
                tracing::info!(value, score, "published calibrated topology");
                self.published_value = Some(value);
                self.published_mape = Some(score);
                self.metrics.published_updates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!("calibrated topology publish failed: {e}"),
        }
    }

    async fn record_candidates(
        &self,
        epoch: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        task_count: usize,
        outcomes: &mut Vec<CandidateOutcome>,
    ) {
        for outcome in outcomes.iter_mut() {
            if outcome.error.is_some() {
                self.metrics.candidates_failed.fetch_add(1, Ordering::Relaxed);
            }
            let run_id = format!("epoch-{epoch}-candidate-{}", outcome.index);
            let fingerprint = outcome
                .topology
                .as_ref()
                .and_then(|t| topology_fingerprint(t).ok())
                .unwrap_or_default();
            let metric = |f: fn(&opendt_core::SimulationResult) -> f64| {
                outcome.result.as_ref().map_or(f64::NAN, f)
            };
            let row = AggRow {
                run_id: run_id.clone(),
                kind: "candidate".to_string(),
                window_id: None,
                window_start_ms: Some(start.timestamp_millis()),
                window_end_ms: Some(end.timestamp_millis()),
                task_count: task_count as i64,
                topology_fingerprint: fingerprint,
                status: if outcome.error.is_some() { "error" } else { "ok" }.to_string(),
                energy_kwh: metric(|r| r.energy_kwh),
                mean_cpu_util: metric(|r| r.mean_cpu_util),
                max_power_w: metric(|r| r.max_power_w),
                runtime_hours: metric(|r| r.runtime_hours),
                error_msg: outcome.error.clone(),
                param_value: Some(outcome.value),
                mape: outcome.score,
            };
            if let Err(e) = self.sink.append(row).await {
                tracing::warn!(%run_id, "candidate row append failed: {e}");
            }
            if let Some(scope) = outcome.scope.take() {
                if let Err(e) = self.sink.archive(&run_id, scope).await {
                    tracing::warn!(%run_id, "candidate archive failed: {e}");
                }
            }
        }
    }

    async fn append_epoch_row(
        &self,
        epoch: u64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        task_count: usize,
        winner: Option<(f64, f64, &Topology)>,
    ) {
        let row = AggRow {
            run_id: format!("epoch-{epoch}"),
            kind: "epoch".to_string(),
            window_id: None,
            window_start_ms: Some(start.timestamp_millis()),
            window_end_ms: Some(end.timestamp_millis()),
            task_count: task_count as i64,
            topology_fingerprint: winner
                .map(|(_, _, t)| topology_fingerprint(t).ok().unwrap_or_default())
                .unwrap_or_default(),
            status: if winner.is_some() { "ok" } else { "error" }.to_string(),
            energy_kwh: f64::NAN,
            mean_cpu_util: f64::NAN,
            max_power_w: f64::NAN,
            runtime_hours: f64::NAN,
            error_msg: winner.is_none().then(|| "all candidates failed".to_string()),
            param_value: winner.map(|(v, _, _)| v),
            mape: winner.map(|(_, s, _)| s),
        };
        if let Err(e) = self.sink.append(row).await {
            tracing::warn!(epoch, "epoch row append failed: {e}");
        }
    }
}
