//! Simulator input materialization
//!
//! File contract with the simulator:
//!
//! - `topology.json`     canonical JSON of the topology
//! - `tasks.parquet`     id:int32 not null, submission_time:timestamp[ms],
//!                       duration:int64, cpu_count:int32,
//!                       cpu_capacity:float64, mem_capacity:int64
//! - `fragments.parquet` id:int32, task_id:int32, duration:int64,
//!                       cpu_count:int32, cpu_usage:float64
//! - `experiment.json`   experiment descriptor pointing at the above

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{ArrayRef, Float64Array, Int32Array, Int64Array, RecordBatch, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use parquet::arrow::ArrowWriter;
use serde_json::json;

use opendt_core::{canonical_json, Task, Topology};

use crate::{Result, SimError};

fn int32_id(id: i64) -> Result<i32> {
    i32::try_from(id).map_err(|_| SimError::IdOverflow(id))
}

/// Write the canonical topology JSON.
pub fn write_topology_json(path: &Path, topology: &Topology) -> Result<()> {
    let value = serde_json::to_value(topology)?;
    std::fs::write(path, canonical_json(&value))?;
    Ok(())
}

pub fn tasks_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, false),
        Field::new("submission_time", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        Field::new("duration", DataType::Int64, false),
        Field::new("cpu_count", DataType::Int32, false),
        Field::new("cpu_capacity", DataType::Float64, false),
        Field::new("mem_capacity", DataType::Int64, false),
    ]))
}

pub fn fragments_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, false),
        Field::new("task_id", DataType::Int32, false),
        Field::new("duration", DataType::Int64, false),
        Field::new("cpu_count", DataType::Int32, false),
        Field::new("cpu_usage", DataType::Float64, false),
    ]))
}

/// Write the flat task table.
pub fn write_tasks_parquet(path: &Path, tasks: &[Task]) -> Result<()> {
    let ids = tasks.iter().map(|t| int32_id(t.id)).collect::<Result<Vec<_>>>()?;
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(ids)),
        Arc::new(TimestampMillisecondArray::from(
            tasks.iter().map(|t| t.submission_time.timestamp_millis()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(tasks.iter().map(|t| t.duration_ms).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(tasks.iter().map(|t| t.cpu_count).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(
            tasks.iter().map(|t| t.cpu_capacity_mhz).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(tasks.iter().map(|t| t.mem_capacity_mb).collect::<Vec<_>>())),
    ];
    write_batch(path, tasks_schema(), columns)
}

/// Write the flat fragment table, flattening every task's profile in task
/// order.
pub fn write_fragments_parquet(path: &Path, tasks: &[Task]) -> Result<()> {
    let fragments: Vec<_> = tasks.iter().flat_map(|t| t.fragments.iter()).collect();
    let ids = fragments.iter().map(|f| int32_id(f.id)).collect::<Result<Vec<_>>>()?;
    let task_ids = fragments.iter().map(|f| int32_id(f.task_id)).collect::<Result<Vec<_>>>()?;
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(ids)),
        Arc::new(Int32Array::from(task_ids)),
        Arc::new(Int64Array::from(fragments.iter().map(|f| f.duration_ms).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(fragments.iter().map(|f| f.cpu_count).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(fragments.iter().map(|f| f.cpu_usage).collect::<Vec<_>>())),
    ];
    write_batch(path, fragments_schema(), columns)
}

fn write_batch(path: &Path, schema: Arc<Schema>, columns: Vec<ArrayRef>) -> Result<()> {
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

/// Write the experiment descriptor the simulator launcher expects.
pub fn write_experiment_json(
    path: &Path,
    run_id: &str,
    topology_path: &Path,
    workload_dir: &Path,
    output_dir: &Path,
    export_interval_seconds: u64,
) -> Result<()> {
    let experiment = json!({
        "name": run_id,
        "topologies": [{ "pathToFile": topology_path }],
        "workloads": [{ "pathToFile": workload_dir, "type": "ComputeWorkload" }],
        "exportModels": [{
            "exportInterval": export_interval_seconds,
            "filesToExport": ["powerSource", "host", "service"],
        }],
        "outputFolder": output_dir,
    });
    std::fs::write(path, serde_json::to_string_pretty(&experiment)?)?;
    Ok(())
}
