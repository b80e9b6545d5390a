//! Subprocess lifecycle for one simulator invocation

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use opendt_core::{SimulationResult, Task, Topology};

use crate::artifacts;
use crate::config::SimConfig;
use crate::java::discover_java_home;
use crate::scope::RunScope;
use crate::{Result, SimError};

const STDERR_TAIL_BYTES: usize = 4096;

/// A finished invocation: the parsed result plus the scratch scope, which the
/// caller either archives or drops (dropping releases the directory).
pub struct SimulationRun {
    pub result: SimulationResult,
    pub scope: Option<RunScope>,
}

/// Drives the external simulator binary.
pub struct SimulatorDriver {
    config: SimConfig,
    integrity_warnings: AtomicU64,
}

impl SimulatorDriver {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            integrity_warnings: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Output files that parsed as garbage after a clean exit.
    pub fn integrity_warnings(&self) -> u64 {
        self.integrity_warnings.load(Ordering::Relaxed)
    }

    /// Run one cumulative simulation.
    ///
    /// Simulator-side failures (bad exit, timeout, unparseable output) come
    /// back as `Ok` with `status: error`; `Err` is reserved for local
    /// resource problems (scratch allocation) that the caller may retry.
    pub async fn invoke(&self, topology: &Topology, tasks: &[Task], run_id: &str) -> Result<SimulationRun> {
        if tasks.is_empty() {
            tracing::debug!(run_id, "empty workload, skipping simulator");
            return Ok(SimulationRun {
                result: SimulationResult::empty(),
                scope: None,
            });
        }

        let scope = RunScope::allocate(&self.config.output_dir, run_id)?;

        let result = match self.materialize(&scope, topology, tasks, run_id) {
            Ok(experiment_path) => self.run_subprocess(&scope, &experiment_path, run_id).await,
            // Workload data the simulator cannot represent: fail the run,
            // not the pipeline
            Err(SimError::IdOverflow(id)) => SimulationResult::failed(format!(
                "task id {id} does not fit the simulator's int32 id column"
            )),
            Err(e) => return Err(e),
        };

        Ok(SimulationRun {
            result,
            scope: Some(scope),
        })
    }

    fn materialize(
        &self,
        scope: &RunScope,
        topology: &Topology,
        tasks: &[Task],
        run_id: &str,
    ) -> Result<std::path::PathBuf> {
        let input = scope.input_dir();
        let topology_path = input.join("topology.json");
        artifacts::write_topology_json(&topology_path, topology)?;
        artifacts::write_tasks_parquet(&input.join("tasks.parquet"), tasks)?;
        artifacts::write_fragments_parquet(&input.join("fragments.parquet"), tasks)?;

        let experiment_path = scope.path().join("experiment.json");
        artifacts::write_experiment_json(
            &experiment_path,
            run_id,
            &topology_path,
            &input,
            &scope.output_dir(),
            self.config.export_interval_seconds,
        )?;
        Ok(experiment_path)
    }

    async fn run_subprocess(
        &self,
        scope: &RunScope,
        experiment_path: &std::path::Path,
        run_id: &str,
    ) -> SimulationResult {
        let stdout_path = scope.path().join("stdout.log");
        let stderr_path = scope.path().join("stderr.log");
        let (stdout, stderr) = match (std::fs::File::create(&stdout_path), std::fs::File::create(&stderr_path)) {
            (Ok(out), Ok(err)) => (out, err),
            _ => return SimulationResult::failed("cannot capture subprocess output"),
        };

        let mut command = Command::new(&self.config.opendc_bin);
        command
            .arg("--experiment-path")
            .arg(experiment_path)
            .current_dir(scope.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(java_home) = discover_java_home(self.config.java_home.as_deref()) {
            command.env("JAVA_HOME", java_home);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return SimulationResult::failed(format!(
                    "cannot launch {}: {e}",
                    self.config.opendc_bin.display()
                ))
            }
        };

        tracing::info!(run_id, "simulator launched");

        let status = match tokio::time::timeout(self.config.subprocess_timeout(), child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return SimulationResult::failed(format!("wait failed: {e}")),
            Err(_) => {
                self.escalate(&mut child, run_id).await;
                return SimulationResult::failed(format!(
                    "timed out after {}s",
                    self.config.subprocess_timeout_seconds
                ));
            }
        };

        if !status.success() {
            let tail = stderr_tail(&stderr_path);
            tracing::warn!(run_id, ?status, "simulator exited abnormally");
            return SimulationResult::failed(format!("exit {status}: {tail}"));
        }

        match crate::outputs::parse_outputs(&scope.output_dir()) {
            Ok(result) => result,
            Err(SimError::MissingArtifact(path)) => {
                SimulationResult::failed(format!("missing expected artifact: {}", path.display()))
            }
            Err(e) => {
                // Clean exit but unreadable output
                self.integrity_warnings.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(run_id, "output parse failed after clean exit: {e}");
                SimulationResult::failed(format!("output parse failed: {e}"))
            }
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn escalate(&self, child: &mut Child, run_id: &str) {
        if let Some(pid) = child.id() {
            tracing::warn!(run_id, pid, "simulator timeout, sending SIGTERM");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.config.kill_grace(), child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(run_id, pid, "grace expired, sending SIGKILL");
        }
        let _ = child.kill().await;
    }
}

fn stderr_tail(path: &std::path::Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).trim().to_string()
        }
        Err(_) => String::new(),
    }
}
