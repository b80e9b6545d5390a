//! Service wiring
//!
//! One consumer task per inbound channel, the window engine loop, the
//! optional calibration loop, the topology state in between, and the HTTP
//! status surface. Shutdown drains the engines within the configured grace.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use opendt_bus::{channels, MemoryPlane, MessagePlane, NatsPlane, NatsPlaneConfig};
use opendt_calibrate::{CalibrationEngine, CalibrationHandle, CalibrationMetrics};
use opendt_core::{PowerSample, TopologyCell, TopologySnapshot, TopologyState, WorkloadMessage};
use opendt_engine::{EngineHandle, EngineMetrics, WindowEngine};
use opendt_sim::{OutputSink, SimulatorDriver};

use crate::config::DaemonConfig;
use crate::http::{router, AppState};

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    config.validate()?;

    let plane: Arc<dyn MessagePlane> = match config.plane.mode.as_str() {
        "memory" => Arc::new(MemoryPlane::new()),
        _ => Arc::new(
            NatsPlane::connect(NatsPlaneConfig {
                url: config.plane.url.clone(),
                ..Default::default()
            })
            .await?,
        ),
    };
    tracing::info!(mode = %config.plane.mode, "message plane ready");

    let driver = Arc::new(SimulatorDriver::new(config.sim.clone()));
    let sink = Arc::new(OutputSink::new(&config.sim));
    let engine_metrics = EngineMetrics::shared();
    let topology_state = Arc::new(Mutex::new(TopologyState::new()));

    // Window engine loop
    let (engine, engine_handle, engine_events) = WindowEngine::new(
        config.engine.clone(),
        driver.clone(),
        sink.clone(),
        plane.clone(),
        engine_metrics.clone(),
    );
    let engine_task = tokio::spawn(engine.run(engine_events));

    // Calibration loop; a bad calibration config disables C6 only
    let mut calibration_handle: Option<CalibrationHandle> = None;
    let mut calibration_metrics: Option<Arc<CalibrationMetrics>> = None;
    let mut calibration_task: Option<JoinHandle<()>> = None;
    if config.calibration.enabled {
        let metrics = CalibrationMetrics::shared();
        match CalibrationEngine::new(
            config.calibration.config.clone(),
            driver.clone(),
            sink.clone(),
            plane.clone(),
            metrics.clone(),
        ) {
            Ok((engine, handle, events)) => {
                calibration_task = Some(tokio::spawn(engine.run(events)));
                calibration_handle = Some(handle);
                calibration_metrics = Some(metrics);
            }
            Err(e) => {
                tracing::error!("calibration configuration rejected, running without it: {e}");
            }
        }
    }

    spawn_workload_consumer(
        plane.clone(),
        engine_handle.clone(),
        calibration_handle.clone(),
        engine_metrics.clone(),
    );
    if let Some(handle) = calibration_handle.clone() {
        spawn_power_consumer(plane.clone(), handle, engine_metrics.clone());
    }
    spawn_observed_consumer(plane.clone(), topology_state.clone(), calibration_handle.clone());
    spawn_calibrated_consumer(plane.clone(), topology_state.clone());
    spawn_calibrated_forwarder(topology_state.clone(), engine_handle.clone()).await;

    // HTTP status surface
    let app = router(AppState {
        started: Instant::now(),
        worker_id: config.worker_id.clone(),
        engine: engine_metrics,
        calibration: calibration_metrics,
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "status endpoints listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("status server failed: {e}");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown requested, draining engines");

    engine_handle.shutdown().await;
    if let Some(handle) = &calibration_handle {
        handle.shutdown().await;
    }

    let grace = Duration::from_secs(config.shutdown_grace_seconds);
    if tokio::time::timeout(grace, async {
        let _ = engine_task.await;
        if let Some(task) = calibration_task {
            let _ = task.await;
        }
    })
    .await
    .is_err()
    {
        tracing::warn!("engines did not drain within {}s, exiting anyway", grace.as_secs());
    }

    Ok(())
}

fn spawn_workload_consumer(
    plane: Arc<dyn MessagePlane>,
    engine: EngineHandle,
    calibration: Option<CalibrationHandle>,
    metrics: Arc<EngineMetrics>,
) {
    tokio::spawn(async move {
        let mut subscription = match plane.subscribe(&channels::WORKLOAD).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("workload subscribe failed: {e}");
                return;
            }
        };
        while let Some(envelope) = subscription.recv().await {
            match envelope.decode::<WorkloadMessage>() {
                Ok(message) => {
                    if let Some(calibration) = &calibration {
                        calibration.workload(message.clone()).await;
                    }
                    engine.workload(message).await;
                }
                Err(e) => {
                    metrics.invalid_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("malformed workload message dropped: {e}");
                }
            }
            subscription.commit(envelope.offset);
        }
        tracing::info!("workload consumer stopped");
    });
}

fn spawn_power_consumer(plane: Arc<dyn MessagePlane>, calibration: CalibrationHandle, metrics: Arc<EngineMetrics>) {
    tokio::spawn(async move {
        let mut subscription = match plane.subscribe(&channels::POWER).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("power subscribe failed: {e}");
                return;
            }
        };
        while let Some(envelope) = subscription.recv().await {
            match envelope.decode::<PowerSample>() {
                Ok(sample) => calibration.power(sample).await,
                Err(e) => {
                    metrics.invalid_events.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("malformed power sample dropped: {e}");
                }
            }
            subscription.commit(envelope.offset);
        }
        tracing::info!("power consumer stopped");
    });
}

fn spawn_observed_consumer(
    plane: Arc<dyn MessagePlane>,
    state: Arc<Mutex<TopologyState>>,
    calibration: Option<CalibrationHandle>,
) {
    tokio::spawn(async move {
        let mut subscription = match plane.subscribe(&channels::TOPOLOGY_OBSERVED).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("topology.observed subscribe failed: {e}");
                return;
            }
        };
        while let Some(envelope) = subscription.recv().await {
            let snapshot: TopologySnapshot = match envelope.decode() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("malformed observed topology dropped: {e}");
                    continue;
                }
            };
            if let Err(e) = snapshot.topology.validate() {
                tracing::warn!("invalid observed topology dropped: {e}");
                continue;
            }
            let view = {
                let mut state = state.lock().await;
                match state.set(TopologyCell::Observed, snapshot.topology) {
                    Ok(Some(_)) => state.current(TopologyCell::Observed),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("observed topology rejected: {e}");
                        None
                    }
                }
            };
            if let (Some(view), Some(calibration)) = (view, &calibration) {
                calibration.topology_observed(view).await;
            }
        }
    });
}

fn spawn_calibrated_consumer(plane: Arc<dyn MessagePlane>, state: Arc<Mutex<TopologyState>>) {
    tokio::spawn(async move {
        let mut subscription = match plane.subscribe(&channels::TOPOLOGY_CALIBRATED).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("topology.calibrated subscribe failed: {e}");
                return;
            }
        };
        while let Some(envelope) = subscription.recv().await {
            let snapshot: TopologySnapshot = match envelope.decode() {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("malformed calibrated topology dropped: {e}");
                    continue;
                }
            };
            if let Err(e) = snapshot.topology.validate() {
                tracing::warn!("invalid calibrated topology dropped: {e}");
                continue;
            }
            let mut state = state.lock().await;
            if let Err(e) = state.set(TopologyCell::Calibrated, snapshot.topology) {
                tracing::warn!("calibrated topology rejected: {e}");
            }
        }
    });
}

/// Forward calibrated cell changes (including the seed from the first
/// observed topology) onto the engine loop, where the cache clear happens.
async fn spawn_calibrated_forwarder(state: Arc<Mutex<TopologyState>>, engine: EngineHandle) {
    let mut receiver = state.lock().await.subscribe(TopologyCell::Calibrated);
    tokio::spawn(async move {
        loop {
            let view = receiver.borrow_and_update().clone();
            if let Some(view) = view {
                engine.topology_calibrated(view).await;
            }
            if receiver.changed().await.is_err() {
                break;
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {e}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => tracing::info!("got SIGINT"),
            _ = sigterm.recv() => tracing::info!("got SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
