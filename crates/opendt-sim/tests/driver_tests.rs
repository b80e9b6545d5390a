//! Driver lifecycle tests against scripted stand-ins for the simulator.

#![cfg(unix)]

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{ArrayRef, Float64Array, RecordBatch, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{TimeZone, Utc};
use parquet::arrow::ArrowWriter;

use opendt_core::{SimStatus, Task, Topology};
use opendt_sim::{SimConfig, SimulatorDriver};

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}

fn sample_topology() -> Topology {
    serde_json::from_value(serde_json::json!({
        "clusters": [{
            "name": "C01",
            "hosts": [{
                "name": "H01",
                "count": 1,
                "cpu": { "coreCount": 16, "coreSpeedMHz": 2100.0 },
                "memory": { "memorySizeBytes": 128000000000i64 },
                "cpuPowerModel": {
                    "modelType": "asymptotic",
                    "power": 350.0,
                    "idlePower": 100.0,
                    "maxPower": 350.0,
                    "asymUtil": 0.3,
                    "dvfs": false
                }
            }]
        }]
    }))
    .unwrap()
}

fn sample_tasks() -> Vec<Task> {
    vec![Task {
        id: 1,
        submission_time: Utc.timestamp_opt(120, 0).unwrap(),
        duration_ms: 60_000,
        cpu_count: 2,
        cpu_capacity_mhz: 2100.0,
        mem_capacity_mb: 2048,
        fragments: vec![],
    }]
}

fn config(dir: &Path, bin: &Path) -> SimConfig {
    SimConfig {
        opendc_bin: bin.to_path_buf(),
        output_dir: dir.join("runs"),
        subprocess_timeout_seconds: 5,
        kill_grace_seconds: 1,
        ..Default::default()
    }
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
        Arc::new(Float64Array::from(vec![0.5, 0.7])),
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

#[tokio::test]
async fn test_successful_invocation_parses_outputs() {
    let dir = tempfile::tempdir().unwrap();

    // Pre-bake output parquet files; the stand-in copies them into the
    // run's output folder next to the experiment file
    let fixtures = dir.path().join("fixtures");
    std::fs::create_dir_all(&fixtures).unwrap();
    write_fixture_outputs(&fixtures);

    let bin = dir.path().join("fake-opendc.sh");
    write_script(
        &bin,
        &format!(
            "#!/bin/sh\ncp {}/*.parquet \"$(dirname \"$2\")/output/\"\nexit 0\n",
            fixtures.display()
        ),
    );

    let driver = SimulatorDriver::new(config(dir.path(), &bin));
    let run = driver
        .invoke(&sample_topology(), &sample_tasks(), "window-0")
        .await
        .unwrap();

    assert_eq!(run.result.status, SimStatus::Ok);
    assert!((run.result.max_power_w - 19_000.0).abs() < 1e-9);
    assert_eq!(run.result.power_series.len(), 2);
    assert!(run.scope.is_some());

    // Inputs were materialized for the subprocess
    let scope = run.scope.unwrap();
    assert!(scope.input_dir().join("topology.json").is_file());
    assert!(scope.input_dir().join("tasks.parquet").is_file());
    assert!(scope.input_dir().join("fragments.parquet").is_file());
    assert!(scope.path().join("experiment.json").is_file());
}

#[tokio::test]
async fn test_nonzero_exit_becomes_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("fake-opendc.sh");
    write_script(&bin, "#!/bin/sh\necho 'no topology loaded' >&2\nexit 3\n");

    let driver = SimulatorDriver::new(config(dir.path(), &bin));
    let run = driver
        .invoke(&sample_topology(), &sample_tasks(), "window-1")
        .await
        .unwrap();

    assert_eq!(run.result.status, SimStatus::Error);
    let msg = run.result.error_msg.unwrap();
    assert!(msg.contains("no topology loaded"), "stderr tail missing: {msg}");
}

#[tokio::test]
async fn test_clean_exit_without_outputs_reports_missing_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("fake-opendc.sh");
    write_script(&bin, "#!/bin/sh\nexit 0\n");

    let driver = SimulatorDriver::new(config(dir.path(), &bin));
    let run = driver
        .invoke(&sample_topology(), &sample_tasks(), "window-2")
        .await
        .unwrap();

    assert_eq!(run.result.status, SimStatus::Error);
    assert!(run
        .result
        .error_msg
        .unwrap()
        .contains("missing expected artifact"));
}

#[tokio::test]
async fn test_timeout_escalates_and_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("fake-opendc.sh");
    write_script(&bin, "#!/bin/sh\nsleep 60\n");

    let mut cfg = config(dir.path(), &bin);
    cfg.subprocess_timeout_seconds = 1;
    cfg.kill_grace_seconds = 1;

    let driver = SimulatorDriver::new(cfg);
    let run = driver
        .invoke(&sample_topology(), &sample_tasks(), "window-3")
        .await
        .unwrap();

    assert_eq!(run.result.status, SimStatus::Error);
    assert!(run.result.error_msg.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_empty_workload_skips_subprocess() {
    let dir = tempfile::tempdir().unwrap();
    // Deliberately missing binary: it must never be launched
    let driver = SimulatorDriver::new(config(dir.path(), Path::new("/nonexistent/opendc")));
    let run = driver.invoke(&sample_topology(), &[], "window-4").await.unwrap();

    assert_eq!(run.result.status, SimStatus::Ok);
    assert_eq!(run.result.energy_kwh, 0.0);
    assert!(run.result.power_series.is_empty());
    assert!(run.scope.is_none());
}
