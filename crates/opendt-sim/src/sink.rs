//! Output sink: aggregate results table and per-run archives
//!
//! The aggregate `agg_results.parquet` holds one row per completed window
//! plus one per calibration epoch. Parquet files cannot be appended in
//! place, so an append reads the current table, drops any row with the same
//! run id (restart replay), and atomically renames a rewritten file over the
//! old one. Archives promote a run's scratch directory into
//! `<out_dir>/<run_id>/` by rename.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tokio::sync::Mutex;

use opendt_core::{SimStatus, SimulationReport};

use crate::config::SimConfig;
use crate::scope::RunScope;
use crate::{Result, SimError};

const AGG_FILE: &str = "agg_results.parquet";

/// One row of the aggregate table.
#[derive(Debug, Clone, PartialEq)]
pub struct AggRow {
    pub run_id: String,
    pub kind: String,
    pub window_id: Option<i64>,
    pub window_start_ms: Option<i64>,
    pub window_end_ms: Option<i64>,
    pub task_count: i64,
    pub topology_fingerprint: String,
    pub status: String,
    pub energy_kwh: f64,
    pub mean_cpu_util: f64,
    pub max_power_w: f64,
    pub runtime_hours: f64,
    pub error_msg: Option<String>,
    /// Winning candidate value (epoch rows).
    pub param_value: Option<f64>,
    /// Winning candidate MAPE (epoch rows).
    pub mape: Option<f64>,
}

impl AggRow {
    /// Row for a completed window simulation. Error results carry NaN
    /// metrics and the message column.
    pub fn window(report: &SimulationReport) -> Self {
        let errored = report.result.status == SimStatus::Error;
        let metric = |v: f64| if errored { f64::NAN } else { v };
        Self {
            run_id: report.run_id.clone(),
            kind: "window".to_string(),
            window_id: Some(report.window_id as i64),
            window_start_ms: Some(report.window_start.timestamp_millis()),
            window_end_ms: Some(report.window_end.timestamp_millis()),
            task_count: report.task_count as i64,
            topology_fingerprint: report.topology_fingerprint.clone(),
            status: if errored { "error" } else { "ok" }.to_string(),
            energy_kwh: metric(report.result.energy_kwh),
            mean_cpu_util: metric(report.result.mean_cpu_util),
            max_power_w: metric(report.result.max_power_w),
            runtime_hours: metric(report.result.runtime_hours),
            error_msg: report.result.error_msg.clone(),
            param_value: None,
            mape: None,
        }
    }
}

fn agg_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("run_id", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("window_id", DataType::Int64, true),
        Field::new("window_start", DataType::Int64, true),
        Field::new("window_end", DataType::Int64, true),
        Field::new("task_count", DataType::Int64, false),
        Field::new("topology_fingerprint", DataType::Utf8, false),
        Field::new("status", DataType::Utf8, false),
        Field::new("energy_kwh", DataType::Float64, false),
        Field::new("mean_cpu_util", DataType::Float64, false),
        Field::new("max_power_w", DataType::Float64, false),
        Field::new("runtime_hours", DataType::Float64, false),
        Field::new("error_msg", DataType::Utf8, true),
        Field::new("param_value", DataType::Float64, true),
        Field::new("mape", DataType::Float64, true),
    ]))
}

/// Writes aggregated results and promotes per-run archives.
pub struct OutputSink {
    out_dir: PathBuf,
    archive_enabled: bool,
    strict_runs: bool,
    append_lock: Mutex<()>,
}

impl OutputSink {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            out_dir: config.output_dir.clone(),
            archive_enabled: config.archive_enabled,
            strict_runs: config.strict_runs,
            append_lock: Mutex::new(()),
        }
    }

    pub fn aggregate_path(&self) -> PathBuf {
        self.out_dir.join(AGG_FILE)
    }

    /// Append a row, replacing any previous row with the same run id.
    pub async fn append(&self, row: AggRow) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        let path = self.aggregate_path();
        std::fs::create_dir_all(&self.out_dir)?;

        let mut rows = if path.exists() { read_rows(&path)? } else { Vec::new() };
        rows.retain(|existing| existing.run_id != row.run_id);
        rows.push(row);

        let tmp = path.with_extension("parquet.tmp");
        write_rows(&tmp, &rows)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the current aggregate, empty when none was written yet.
    pub async fn read_aggregate(&self) -> Result<Vec<AggRow>> {
        let _guard = self.append_lock.lock().await;
        let path = self.aggregate_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_rows(&path)
    }

    /// Promote a run's scratch directory into the archive. Returns the final
    /// location, or `None` when archiving is disabled (the scratch is
    /// released).
    pub async fn archive(&self, run_id: &str, scope: RunScope) -> Result<Option<PathBuf>> {
        if !self.archive_enabled {
            drop(scope);
            return Ok(None);
        }
        let target = self.out_dir.join(run_id);
        if target.exists() {
            if self.strict_runs {
                return Err(SimError::DuplicateRun(run_id.to_string()));
            }
            std::fs::remove_dir_all(&target)?;
        }
        let staged = scope.into_path();
        std::fs::rename(&staged, &target)?;
        tracing::debug!(run_id, "archived to {}", target.display());
        Ok(Some(target))
    }
}

fn write_rows(path: &Path, rows: &[AggRow]) -> Result<()> {
    let schema = agg_schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(rows.iter().map(|r| r.run_id.as_str()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.window_id).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.window_start_ms).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.window_end_ms).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(rows.iter().map(|r| r.task_count).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.topology_fingerprint.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(rows.iter().map(|r| r.status.as_str()).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.energy_kwh).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.mean_cpu_util).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.max_power_w).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.runtime_hours).collect::<Vec<_>>())),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.error_msg.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.param_value).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.mape).collect::<Vec<_>>())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn read_rows(path: &Path) -> Result<Vec<AggRow>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let utf8 = |name: &str| -> Result<&StringArray> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| SimError::BadColumn(name.to_string(), path.to_path_buf()))
        };
        let i64s = |name: &str| -> Result<&Int64Array> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| SimError::BadColumn(name.to_string(), path.to_path_buf()))
        };
        let f64s = |name: &str| -> Result<&Float64Array> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                .ok_or_else(|| SimError::BadColumn(name.to_string(), path.to_path_buf()))
        };

        let run_id = utf8("run_id")?;
        let kind = utf8("kind")?;
        let window_id = i64s("window_id")?;
        let window_start = i64s("window_start")?;
        let window_end = i64s("window_end")?;
        let task_count = i64s("task_count")?;
        let fingerprint = utf8("topology_fingerprint")?;
        let status = utf8("status")?;
        let energy = f64s("energy_kwh")?;
        let util = f64s("mean_cpu_util")?;
        let max_power = f64s("max_power_w")?;
        let runtime = f64s("runtime_hours")?;
        let error_msg = utf8("error_msg")?;
        let param_value = f64s("param_value")?;
        let mape = f64s("mape")?;

        let opt_i64 = |a: &Int64Array, i: usize| if a.is_null(i) { None } else { Some(a.value(i)) };
        let opt_f64 = |a: &Float64Array, i: usize| if a.is_null(i) { None } else { Some(a.value(i)) };

        for i in 0..batch.num_rows() {
            rows.push(AggRow {
                run_id: run_id.value(i).to_string(),
                kind: kind.value(i).to_string(),
                window_id: opt_i64(window_id, i),
                window_start_ms: opt_i64(window_start, i),
                window_end_ms: opt_i64(window_end, i),
                task_count: task_count.value(i),
                topology_fingerprint: fingerprint.value(i).to_string(),
                status: status.value(i).to_string(),
                energy_kwh: energy.value(i),
                mean_cpu_util: util.value(i),
                max_power_w: max_power.value(i),
                runtime_hours: runtime.value(i),
                error_msg: if error_msg.is_null(i) {
                    None
                } else {
                    Some(error_msg.value(i).to_string())
                },
                param_value: opt_f64(param_value, i),
                mape: opt_f64(mape, i),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendt_core::SimulationResult;

    fn report(run_id: &str, window_id: u64, energy: f64) -> SimulationReport {
        SimulationReport {
            run_id: run_id.to_string(),
            window_id,
            window_start: "2024-01-01T00:00:00Z".parse().unwrap(),
            window_end: "2024-01-01T00:05:00Z".parse().unwrap(),
            task_count: 2,
            topology_fingerprint: "f".repeat(64),
            result: SimulationResult {
                energy_kwh: energy,
                ..SimulationResult::empty()
            },
        }
    }

    fn sink(dir: &Path, strict: bool) -> OutputSink {
        OutputSink::new(&SimConfig {
            output_dir: dir.to_path_buf(),
            strict_runs: strict,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_append_accumulates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), false);

        sink.append(AggRow::window(&report("window-0", 0, 1.0))).await.unwrap();
        sink.append(AggRow::window(&report("window-1", 1, 2.0))).await.unwrap();

        let rows = sink.read_aggregate().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].run_id, "window-0");
        assert_eq!(rows[1].energy_kwh, 2.0);
    }

    #[tokio::test]
    async fn test_append_replaces_duplicate_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), false);

        sink.append(AggRow::window(&report("window-0", 0, 1.0))).await.unwrap();
        sink.append(AggRow::window(&report("window-0", 0, 9.0))).await.unwrap();

        let rows = sink.read_aggregate().await.unwrap();
        assert_eq!(rows.len(), 1, "replayed run id must replace the partial row");
        assert_eq!(rows[0].energy_kwh, 9.0);
    }

    #[tokio::test]
    async fn test_error_rows_carry_nan_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), false);

        let mut failed = report("window-3", 3, 0.0);
        failed.result = SimulationResult::failed("exit 1: boom");
        sink.append(AggRow::window(&failed)).await.unwrap();

        let rows = sink.read_aggregate().await.unwrap();
        assert_eq!(rows[0].status, "error");
        assert!(rows[0].energy_kwh.is_nan());
        assert_eq!(rows[0].error_msg.as_deref(), Some("exit 1: boom"));
    }

    #[tokio::test]
    async fn test_archive_promotes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), false);

        let scope = RunScope::allocate(dir.path(), "window-0").unwrap();
        std::fs::write(scope.input_dir().join("topology.json"), b"{}").unwrap();

        let target = sink.archive("window-0", scope).await.unwrap().unwrap();
        assert_eq!(target, dir.path().join("window-0"));
        assert!(target.join("input").join("topology.json").is_file());
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_reused_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), true);

        let first = RunScope::allocate(dir.path(), "window-0").unwrap();
        sink.archive("window-0", first).await.unwrap();

        let second = RunScope::allocate(dir.path(), "window-0").unwrap();
        let err = sink.archive("window-0", second).await.unwrap_err();
        assert!(matches!(err, SimError::DuplicateRun(_)));
    }
}
