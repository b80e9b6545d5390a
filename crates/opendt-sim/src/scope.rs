//! Per-invocation scratch directories
//!
//! Every simulator run gets its own directory under `<output_dir>/.scratch/`.
//! The scope guard removes it on every exit path, including cancellation and
//! panics, unless the run was promoted into the archive (which takes the
//! directory with it via rename).

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::Result;

/// Owned scratch directory for one simulator invocation.
#[derive(Debug)]
pub struct RunScope {
    path: PathBuf,
    persist: bool,
}

impl RunScope {
    /// Allocate `<output_dir>/.scratch/<run_id>-<uuid>/` with an `input/` and
    /// `output/` layout.
    pub fn allocate(output_dir: &Path, run_id: &str) -> Result<Self> {
        let path = output_dir
            .join(".scratch")
            .join(format!("{}-{}", run_id, Uuid::now_v7()));
        std::fs::create_dir_all(path.join("input"))?;
        std::fs::create_dir_all(path.join("output"))?;
        Ok(Self { path, persist: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_dir(&self) -> PathBuf {
        self.path.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.path.join("output")
    }

    /// Hand the directory over to the archive; the guard stops cleaning it.
    pub fn into_path(mut self) -> PathBuf {
        self.persist = true;
        self.path.clone()
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if !self.persist && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!("failed to release scratch {}: {e}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_releases_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scope = RunScope::allocate(root.path(), "window-0").unwrap();
            assert!(scope.input_dir().is_dir());
            assert!(scope.output_dir().is_dir());
            scope.path().to_path_buf()
        };
        assert!(!path.exists(), "scratch must be removed when the scope drops");
    }

    #[test]
    fn test_into_path_persists() {
        let root = tempfile::tempdir().unwrap();
        let scope = RunScope::allocate(root.path(), "window-1").unwrap();
        let path = scope.into_path();
        assert!(path.exists(), "persisted scratch must survive the guard");
    }
}
