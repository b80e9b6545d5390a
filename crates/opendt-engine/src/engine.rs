//! The window engine event loop
//!
//! A single task owns every piece of window state. Messages, topology
//! changes, and simulator completions all arrive as events on one queue, so
//! state transitions never race and results leave in window-id order:
//! window k+1 is not even looked up in the cache until window k resolved,
//! which is what lets an empty window ride on its predecessor's result.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use opendt_bus::plane::publish_json;
use opendt_bus::{channels, MessagePlane};
use opendt_core::{CacheKey, CellView, SimulationReport, SimulationResult, WorkloadMessage};
use opendt_sim::{AggRow, OutputSink, SimulationRun, SimulatorDriver};

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::window::{WindowRing, WindowState};
use crate::EngineError;

const EVENT_QUEUE: usize = 4096;
const INVOKE_RETRIES: u32 = 3;
const PUBLISH_RETRIES: u32 = 3;

/// Events consumed by the engine loop.
pub enum EngineEvent {
    Workload(WorkloadMessage),
    /// New calibrated topology generation from the topology state.
    TopologyCalibrated(Arc<CellView>),
    /// Completion of a spawned simulator invocation.
    SimulationDone {
        window_id: u64,
        generation: u64,
        key: CacheKey,
        fingerprint: String,
        run: SimulationRun,
    },
    /// Drain in-flight work and stop.
    Shutdown,
}

/// Cloneable sender half for feeding the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn workload(&self, message: WorkloadMessage) {
        let _ = self.tx.send(EngineEvent::Workload(message)).await;
    }

    pub async fn topology_calibrated(&self, view: Arc<CellView>) {
        let _ = self.tx.send(EngineEvent::TopologyCalibrated(view)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineEvent::Shutdown).await;
    }
}

/// The window engine (C3). Owns the ring, the cumulative task list, and the
/// result cache; drives the simulator driver and the output sink.
pub struct WindowEngine {
    config: EngineConfig,
    ring: WindowRing,
    cumulative: Vec<opendt_core::Task>,
    cache: Arc<ResultCache>,
    topology: Option<Arc<CellView>>,
    dispatch_queue: VecDeque<u64>,
    in_flight: Option<u64>,
    draining: bool,
    driver: Arc<SimulatorDriver>,
    sink: Arc<OutputSink>,
    plane: Arc<dyn MessagePlane>,
    metrics: Arc<EngineMetrics>,
    events_tx: mpsc::Sender<EngineEvent>,
}

impl WindowEngine {
    pub fn new(
        config: EngineConfig,
        driver: Arc<SimulatorDriver>,
        sink: Arc<OutputSink>,
        plane: Arc<dyn MessagePlane>,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let engine = Self {
            ring: WindowRing::new(config.window_width_ms(), config.first_window_anchor),
            cumulative: Vec::new(),
            cache: Arc::new(ResultCache::new(config.cache_max_entries)),
            topology: None,
            dispatch_queue: VecDeque::new(),
            in_flight: None,
            draining: false,
            driver,
            sink,
            plane,
            metrics,
            events_tx: tx.clone(),
            config,
        };
        (engine, EngineHandle { tx }, rx)
    }

    pub fn cache(&self) -> Arc<ResultCache> {
        self.cache.clone()
    }

    /// Run the loop until shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) {
        tracing::info!(
            window_width_minutes = self.config.window_width_minutes,
            max_pending_windows = self.config.max_pending_windows,
            "window engine started"
        );
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Workload(message) => self.on_workload(message),
                EngineEvent::TopologyCalibrated(view) => self.on_topology(view),
                EngineEvent::SimulationDone {
                    window_id,
                    generation,
                    key,
                    fingerprint,
                    run,
                } => {
                    self.on_simulation_done(window_id, generation, key, fingerprint, run)
                        .await;
                }
                EngineEvent::Shutdown => {
                    self.draining = true;
                    tracing::info!("window engine draining");
                }
            }
            self.pump().await;
            self.refresh_metrics();
            if self.draining && self.in_flight.is_none() {
                break;
            }
        }
        tracing::info!("window engine stopped");
    }

    fn on_workload(&mut self, message: WorkloadMessage) {
        if self.draining {
            return;
        }
        match message {
            WorkloadMessage::Task { timestamp, task } => {
                if let Err(e) = task.validate() {
                    self.metrics.invalid_events.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("dropping invalid task: {e}");
                    return;
                }
                match self.ring.ingest_task(timestamp, task) {
                    Ok(_) => {}
                    Err(EngineError::InvalidEvent(reason)) => {
                        self.metrics.invalid_events.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("dropping late task: {reason}");
                    }
                    Err(e) => tracing::warn!("task ingest failed: {e}"),
                }
            }
            WorkloadMessage::Heartbeat { timestamp, .. } => {
                self.ring.ingest_heartbeat(timestamp);
            }
        }
    }

    fn on_topology(&mut self, view: Arc<CellView>) {
        tracing::info!(
            generation = view.generation,
            fingerprint = %&view.fingerprint[..12.min(view.fingerprint.len())],
            "calibrated topology updated, clearing result cache"
        );
        self.cache.clear(view.generation);
        self.metrics
            .topology_generation
            .store(view.generation, Ordering::Relaxed);
        self.topology = Some(view);
    }

    async fn on_simulation_done(
        &mut self,
        window_id: u64,
        generation: u64,
        key: CacheKey,
        fingerprint: String,
        run: SimulationRun,
    ) {
        if run.result.is_ok() {
            // put() drops the write itself when the generation moved on
            self.cache.put(key, run.result.clone(), generation);
        }
        self.emit(window_id, &fingerprint, run.result, run.scope).await;
        self.ring.finish(window_id, WindowState::Simulated);
        self.metrics.windows_simulated.fetch_add(1, Ordering::Relaxed);
        self.in_flight = None;
    }

    /// Close eligible windows (bounded by backpressure) and resolve queued
    /// ones until a simulation goes in flight or the queue runs dry.
    async fn pump(&mut self) {
        loop {
            while self.backlog() < self.config.max_pending_windows {
                match self.ring.close_next() {
                    Some(window_id) => self.dispatch_queue.push_back(window_id),
                    None => break,
                }
            }

            if self.in_flight.is_some() {
                return;
            }
            let Some(topology) = self.topology.clone() else {
                // Nothing can simulate before the first topology snapshot
                return;
            };
            let Some(window_id) = self.dispatch_queue.pop_front() else {
                return;
            };

            // Cumulative replay: this window's tasks join the full history
            if let Some(window) = self.ring.window(window_id) {
                self.cumulative.extend(window.tasks.iter().cloned());
            }
            let key = CacheKey {
                topology_fingerprint: topology.fingerprint.clone(),
                cumulative_task_count: self.cumulative.len() as u64,
            };

            if let Some(result) = self.cache.lookup(&key) {
                tracing::debug!(window_id, "cache hit, skipping simulation");
                self.emit(window_id, &topology.fingerprint, result, None).await;
                self.ring.finish(window_id, WindowState::Skipped);
                self.metrics.windows_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.launch(window_id, &topology, key);
            return;
        }
    }

    fn launch(&mut self, window_id: u64, topology: &Arc<CellView>, key: CacheKey) {
        self.in_flight = Some(window_id);
        let driver = self.driver.clone();
        let events = self.events_tx.clone();
        let tasks = self.cumulative.clone();
        let topo = topology.topology.clone();
        let generation = topology.generation;
        let fingerprint = topology.fingerprint.clone();
        let run_id = format!("window-{window_id}");

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let mut attempt = 0;
            let run = loop {
                match driver.invoke(&topo, &tasks, &run_id).await {
                    Ok(run) => break run,
                    Err(e) if attempt < INVOKE_RETRIES => {
                        attempt += 1;
                        tracing::warn!(%run_id, attempt, "driver resource error: {e}, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    Err(e) => {
                        break SimulationRun {
                            result: SimulationResult::failed(format!("driver gave up: {e}")),
                            scope: None,
                        }
                    }
                }
            };
            let _ = events
                .send(EngineEvent::SimulationDone {
                    window_id,
                    generation,
                    key,
                    fingerprint,
                    run,
                })
                .await;
        });
    }

    async fn emit(
        &self,
        window_id: u64,
        fingerprint: &str,
        result: SimulationResult,
        scope: Option<opendt_sim::RunScope>,
    ) {
        let Some(window) = self.ring.window(window_id) else { return };
        let report = SimulationReport {
            run_id: format!("window-{window_id}"),
            window_id,
            window_start: window.start,
            window_end: window.end,
            task_count: window.tasks.len(),
            topology_fingerprint: fingerprint.to_string(),
            result,
        };

        let mut published = false;
        for attempt in 0..PUBLISH_RETRIES {
            match publish_json(self.plane.as_ref(), &channels::RESULTS, None, &report).await {
                Ok(()) => {
                    published = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(window_id, attempt, "result publish failed: {e}");
                    tokio::time::sleep(Duration::from_millis(500 << attempt)).await;
                }
            }
        }
        if !published {
            tracing::error!(window_id, "result dropped after {PUBLISH_RETRIES} publish attempts");
        }

        if let Err(e) = self.sink.append(AggRow::window(&report)).await {
            tracing::warn!(window_id, "aggregate append failed: {e}");
        }
        if let Some(scope) = scope {
            if let Err(e) = self.sink.archive(&report.run_id, scope).await {
                tracing::warn!(window_id, "archive failed: {e}");
            }
        }
    }

    fn backlog(&self) -> usize {
        self.dispatch_queue.len() + usize::from(self.in_flight.is_some())
    }

    fn refresh_metrics(&self) {
        self.metrics
            .windows_open
            .store(self.ring.count_in_state(WindowState::Open) as u64, Ordering::Relaxed);
        self.metrics
            .windows_closed
            .store(self.ring.count_in_state(WindowState::Closed) as u64, Ordering::Relaxed);
        self.metrics
            .backlog_depth
            .store(self.backlog() as u64, Ordering::Relaxed);
        self.metrics
            .cache_entries
            .store(self.cache.len() as u64, Ordering::Relaxed);
        self.metrics
            .integrity_warnings
            .store(self.driver.integrity_warnings(), Ordering::Relaxed);
        if let Some(watermark) = self.ring.watermark() {
            self.metrics
                .watermark_ms
                .store(watermark.timestamp_millis(), Ordering::Relaxed);
        }
    }
}
