//! End-to-end window pipeline scenarios against a scripted simulator.

#![cfg(unix)]

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{ArrayRef, Float64Array, RecordBatch, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, TimeZone, Utc};
use parquet::arrow::ArrowWriter;

use opendt_bus::{channels, MemoryPlane, MessagePlane, Subscription};
use opendt_core::{
    topology_fingerprint, CellView, SimStatus, SimulationReport, Task, Topology, WorkloadMessage,
};
use opendt_engine::{EngineConfig, EngineHandle, EngineMetrics, WindowEngine};
use opendt_sim::{OutputSink, SimConfig, SimulatorDriver};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn task(id: i64, secs: i64) -> WorkloadMessage {
    WorkloadMessage::Task {
        timestamp: ts(secs),
        task: Task {
            id,
            submission_time: ts(secs),
            duration_ms: 60_000,
            cpu_count: 1,
            cpu_capacity_mhz: 2000.0,
            mem_capacity_mb: 1024,
            fragments: vec![],
        },
    }
}

fn heartbeat(secs: i64) -> WorkloadMessage {
    WorkloadMessage::Heartbeat {
        timestamp: ts(secs),
        task: None,
    }
}

fn topology(asym_util: f64) -> Topology {
    serde_json::from_value(serde_json::json!({
        "clusters": [{
            "name": "C01",
            "hosts": [{
                "name": "H01",
                "count": 1,
                "cpu": { "coreCount": 8, "coreSpeedMHz": 2000.0 },
                "memory": { "memorySizeBytes": 64000000000i64 },
                "cpuPowerModel": {
                    "modelType": "asymptotic",
                    "power": 300.0,
                    "idlePower": 90.0,
                    "maxPower": 300.0,
                    "asymUtil": asym_util,
                    "dvfs": false
                }
            }]
        }]
    }))
    .unwrap()
}

fn cell_view(topology: &Topology, generation: u64) -> Arc<CellView> {
    Arc::new(CellView {
        generation,
        fingerprint: topology_fingerprint(topology).unwrap(),
        topology: Arc::new(topology.clone()),
    })
}

fn write_fixture_outputs(dir: &Path) {
    let power_schema = Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("power_draw", DataType::Float64, false),
        Field::new("energy_usage", DataType::Float64, false),
    ]));
    let power_columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(vec![0_i64, 150_000])),
        Arc::new(Float64Array::from(vec![18_000.0, 19_000.0])),
        Arc::new(Float64Array::from(vec![2_700_000.0, 2_850_000.0])),
    ];
    let batch = RecordBatch::try_new(power_schema.clone(), power_columns).unwrap();
    let mut writer = ArrowWriter::try_new(
        File::create(dir.join("powerSource.parquet")).unwrap(),
        power_schema,
        None,
    )
    .unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let host_schema = Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("cpu_utilization", DataType::Float64, false),
    ]));
    let host_columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(vec![0_i64, 150_000])),
        Arc::new(Float64Array::from(vec![0.4, 0.6])),
    ];
    let batch = RecordBatch::try_new(host_schema.clone(), host_columns).unwrap();
    let mut writer = ArrowWriter::try_new(
        File::create(dir.join("host.parquet")).unwrap(),
        host_schema,
        None,
    )
    .unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

struct Harness {
    _dir: tempfile::TempDir,
    handle: EngineHandle,
    results: Subscription,
    metrics: Arc<EngineMetrics>,
    invocation_log: std::path::PathBuf,
    plane: Arc<MemoryPlane>,
}

impl Harness {
    /// `ok` controls whether the scripted simulator succeeds or exits 1.
    async fn start(ok: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = dir.path().join("fixtures");
        std::fs::create_dir_all(&fixtures).unwrap();
        write_fixture_outputs(&fixtures);

        let invocation_log = dir.path().join("invocations.log");
        let bin = dir.path().join("fake-opendc.sh");
        let body = if ok {
            format!(
                "#!/bin/sh\necho run >> {log}\ncp {fix}/*.parquet \"$(dirname \"$2\")/output/\"\nexit 0\n",
                log = invocation_log.display(),
                fix = fixtures.display()
            )
        } else {
            format!(
                "#!/bin/sh\necho run >> {log}\necho 'model blew up' >&2\nexit 1\n",
                log = invocation_log.display()
            )
        };
        std::fs::write(&bin, body).unwrap();
        let mut permissions = std::fs::metadata(&bin).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&bin, permissions).unwrap();

        let sim_config = SimConfig {
            opendc_bin: bin,
            output_dir: dir.path().join("runs"),
            subprocess_timeout_seconds: 10,
            ..Default::default()
        };
        let driver = Arc::new(SimulatorDriver::new(sim_config.clone()));
        let sink = Arc::new(OutputSink::new(&sim_config));
        let plane = Arc::new(MemoryPlane::new());
        let metrics = EngineMetrics::shared();

        let results = plane.subscribe(&channels::RESULTS).await.unwrap();

        let (engine, handle, events) = WindowEngine::new(
            EngineConfig::default(),
            driver,
            sink,
            plane.clone(),
            metrics.clone(),
        );
        tokio::spawn(engine.run(events));

        Self {
            _dir: dir,
            handle,
            results,
            metrics,
            invocation_log,
            plane,
        }
    }

    async fn next_report(&mut self) -> SimulationReport {
        let envelope = tokio::time::timeout(Duration::from_secs(10), self.results.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("results channel closed");
        envelope.decode().unwrap()
    }

    fn invocations(&self) -> usize {
        std::fs::read_to_string(&self.invocation_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

#[tokio::test]
async fn test_single_window_happy_path() {
    let mut harness = Harness::start(true).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 120)).await;
    harness.handle.workload(task(2, 270)).await;
    harness.handle.workload(heartbeat(300)).await;

    let report = harness.next_report().await;
    assert_eq!(report.window_id, 0);
    assert_eq!(report.run_id, "window-0");
    assert_eq!(report.task_count, 2);
    assert_eq!(report.window_start, ts(0));
    assert_eq!(report.window_end, ts(300));
    assert_eq!(report.result.status, SimStatus::Ok);
    assert_eq!(harness.invocations(), 1, "exactly one simulator invocation");
}

#[tokio::test]
async fn test_gap_heartbeats_ride_the_cache() {
    let mut harness = Harness::start(true).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 60)).await;
    harness.handle.workload(heartbeat(300)).await;
    harness.handle.workload(heartbeat(600)).await;
    harness.handle.workload(heartbeat(900)).await;

    let first = harness.next_report().await;
    let second = harness.next_report().await;
    let third = harness.next_report().await;

    assert_eq!(
        (first.window_id, second.window_id, third.window_id),
        (0, 1, 2),
        "results must arrive in window order"
    );
    assert_eq!(first.task_count, 1);
    assert_eq!(second.task_count, 0);
    assert_eq!(third.task_count, 0);
    assert_eq!(second.result, first.result, "window 1 must reuse window 0's result");
    assert_eq!(third.result, first.result);
    assert_eq!(harness.invocations(), 1, "empty windows must be cache hits");
}

#[tokio::test]
async fn test_topology_change_clears_cache_and_resimulates() {
    let mut harness = Harness::start(true).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 120)).await;
    harness.handle.workload(heartbeat(300)).await;
    let first = harness.next_report().await;
    assert_eq!(first.window_id, 0);
    assert_eq!(harness.invocations(), 1);

    // Calibration publishes a new topology between windows
    let recalibrated = topology(0.5);
    harness.handle.topology_calibrated(cell_view(&recalibrated, 2)).await;

    harness.handle.workload(task(2, 330)).await;
    harness.handle.workload(task(3, 360)).await;
    harness.handle.workload(heartbeat(600)).await;

    let second = harness.next_report().await;
    assert_eq!(second.window_id, 1);
    assert_eq!(second.task_count, 2);
    assert_eq!(
        second.topology_fingerprint,
        topology_fingerprint(&recalibrated).unwrap()
    );
    assert_eq!(harness.invocations(), 2, "new generation must re-simulate");
}

#[tokio::test]
async fn test_late_task_is_dropped() {
    let mut harness = Harness::start(true).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 60)).await;
    harness.handle.workload(heartbeat(300)).await;
    let first = harness.next_report().await;
    assert_eq!(first.task_count, 1);

    // Window 0 is closed; a task from inside it arrives late
    harness.handle.workload(task(99, 180)).await;
    harness.handle.workload(heartbeat(600)).await;

    let second = harness.next_report().await;
    assert_eq!(second.window_id, 1);
    assert_eq!(second.task_count, 0, "late task must not reach any window");
    assert_eq!(
        harness.metrics.snapshot().invalid_events,
        1,
        "late task must bump the invalid-event counter"
    );
    // Cumulative count unchanged, so window 1 rides window 0's cache entry
    assert_eq!(harness.invocations(), 1);
}

#[tokio::test]
async fn test_subprocess_failure_does_not_stall_pipeline() {
    let mut harness = Harness::start(false).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 120)).await;
    harness.handle.workload(heartbeat(300)).await;

    let first = harness.next_report().await;
    assert_eq!(first.window_id, 0);
    assert_eq!(first.result.status, SimStatus::Error);
    assert!(first.result.error_msg.as_deref().unwrap().contains("model blew up"));

    // Next window: the error was not cached, the simulator runs again
    harness.handle.workload(task(2, 330)).await;
    harness.handle.workload(heartbeat(600)).await;

    let second = harness.next_report().await;
    assert_eq!(second.window_id, 1);
    assert_eq!(second.result.status, SimStatus::Error);
    assert_eq!(
        harness.invocations(),
        2,
        "failed results must not populate the cache"
    );
}

#[tokio::test]
async fn test_reports_also_land_in_aggregate_sink() {
    let mut harness = Harness::start(true).await;
    harness.handle.topology_calibrated(cell_view(&topology(0.3), 1)).await;

    harness.handle.workload(task(1, 120)).await;
    harness.handle.workload(heartbeat(300)).await;
    let _ = harness.next_report().await;

    // The results stream and the aggregate table see the same window
    assert_eq!(harness.plane.len(&channels::RESULTS).await, 1);
}
