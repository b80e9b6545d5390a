//! Simulator output parsing
//!
//! Reads `powerSource.parquet` and `host.parquet` from a run's output folder
//! and derives the result metrics. Timestamp columns are accepted either as
//! timestamp[ms] or as raw int64 milliseconds; the simulator has shipped both.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use arrow_array::{Array, Float32Array, Float64Array, Int64Array, RecordBatch, TimestampMillisecondArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use opendt_core::{SimStatus, SimulationResult};

use crate::{Result, SimError};

const MS_PER_HOUR: f64 = 3_600_000.0;
const J_PER_KWH: f64 = 3_600_000.0;

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    if !path.exists() {
        return Err(SimError::MissingArtifact(path.to_path_buf()));
    }
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

fn ms_column(batch: &RecordBatch, name: &str, path: &Path) -> Result<Vec<i64>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| SimError::BadColumn(name.to_string(), path.to_path_buf()))?;
    if let Some(ts) = column.as_any().downcast_ref::<TimestampMillisecondArray>() {
        return Ok((0..ts.len()).map(|i| ts.value(i)).collect());
    }
    if let Some(raw) = column.as_any().downcast_ref::<Int64Array>() {
        return Ok((0..raw.len()).map(|i| raw.value(i)).collect());
    }
    Err(SimError::BadColumn(name.to_string(), path.to_path_buf()))
}

fn f64_column(batch: &RecordBatch, name: &str, path: &Path) -> Result<Vec<f64>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| SimError::BadColumn(name.to_string(), path.to_path_buf()))?;
    if let Some(values) = column.as_any().downcast_ref::<Float64Array>() {
        return Ok((0..values.len()).map(|i| values.value(i)).collect());
    }
    if let Some(values) = column.as_any().downcast_ref::<Float32Array>() {
        return Ok((0..values.len()).map(|i| f64::from(values.value(i))).collect());
    }
    Err(SimError::BadColumn(name.to_string(), path.to_path_buf()))
}

/// Parse a completed run's output folder into a result.
pub fn parse_outputs(output_dir: &Path) -> Result<SimulationResult> {
    let power_path = output_dir.join("powerSource.parquet");
    let host_path = output_dir.join("host.parquet");

    let mut power_series: Vec<(i64, f64)> = Vec::new();
    let mut energy_j = 0.0_f64;
    let mut max_power_w = 0.0_f64;

    for batch in read_batches(&power_path)? {
        let timestamps = ms_column(&batch, "timestamp", &power_path)?;
        let draws = f64_column(&batch, "power_draw", &power_path)?;
        let energies = f64_column(&batch, "energy_usage", &power_path)?;
        for ((t, w), e) in timestamps.iter().zip(draws.iter()).zip(energies.iter()) {
            power_series.push((*t, *w));
            energy_j += e;
            if *w > max_power_w {
                max_power_w = *w;
            }
        }
    }
    power_series.sort_by_key(|(t, _)| *t);

    // host.parquet has one row per host per interval; collapse to a mean
    // utilization per timestamp
    let mut by_ts: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    let mut util_sum = 0.0_f64;
    let mut util_count = 0_u64;
    for batch in read_batches(&host_path)? {
        let timestamps = ms_column(&batch, "timestamp", &host_path)?;
        let utils = f64_column(&batch, "cpu_utilization", &host_path)?;
        for (t, u) in timestamps.iter().zip(utils.iter()) {
            let slot = by_ts.entry(*t).or_insert((0.0, 0));
            slot.0 += u;
            slot.1 += 1;
            util_sum += u;
            util_count += 1;
        }
    }
    let cpu_series: Vec<(i64, f64)> = by_ts
        .into_iter()
        .map(|(t, (sum, n))| (t, sum / f64::from(n)))
        .collect();

    let runtime_hours = match (cpu_series.first(), cpu_series.last()) {
        (Some((first, _)), Some((last, _))) => (*last - *first) as f64 / MS_PER_HOUR,
        _ => 0.0,
    };
    let mean_cpu_util = if util_count > 0 {
        util_sum / util_count as f64
    } else {
        0.0
    };

    Ok(SimulationResult {
        status: SimStatus::Ok,
        energy_kwh: energy_j / J_PER_KWH,
        mean_cpu_util,
        max_power_w,
        runtime_hours,
        power_series,
        cpu_series,
        error_msg: None,
    })
}
