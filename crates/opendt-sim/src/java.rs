//! Java home discovery
//!
//! The simulator launcher is a JVM wrapper script; it honors `JAVA_HOME` when
//! present. Discovery order: explicit config, `JAVA_HOME` from the
//! environment, then the usual JVM install roots.

use std::path::{Path, PathBuf};

const JVM_ROOTS: [&str; 3] = ["/usr/lib/jvm", "/opt/java", "/Library/Java/JavaVirtualMachines"];

fn looks_like_java_home(path: &Path) -> bool {
    path.join("bin").join("java").is_file()
}

/// Best-effort Java home lookup. `None` means "let PATH resolve java".
pub fn discover_java_home(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return Some(path.to_path_buf());
    }
    if let Ok(home) = std::env::var("JAVA_HOME") {
        let path = PathBuf::from(home);
        if looks_like_java_home(&path) {
            return Some(path);
        }
    }
    for root in JVM_ROOTS {
        let Ok(entries) = std::fs::read_dir(root) else { continue };
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| looks_like_java_home(p))
            .collect();
        // Prefer the lexically last entry, which sorts newer JDKs first
        candidates.sort();
        if let Some(found) = candidates.pop() {
            return Some(found);
        }
    }
    None
}
