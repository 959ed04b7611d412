//! Scoped staging directory.
//!
//! The staging tree mirrors the host layout (`etc/`, `var/...`) plus two
//! engine-owned entries: [`COMMANDS_DIR`] for command output snapshots and
//! [`MANIFEST_FILE`] at the root.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Compact command output reports.
pub const COMMANDS_DIR: &str = "commands";

/// Richer per-subsystem state files.
pub const STATE_DIR: &str = "var/lib/proxsave-info";

/// Manifest written at the staging root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Exclusively owned staging directory, deleted on drop unless retained.
#[derive(Debug)]
pub struct StagingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagingDir {
    /// Create a staging directory under the system temp root.
    pub fn acquire(hostname: &str, now: DateTime<Utc>) -> std::io::Result<Self> {
        Self::acquire_in(&std::env::temp_dir(), hostname, now)
    }

    /// Create a staging directory under `parent`.
    pub fn acquire_in(parent: &Path, hostname: &str, now: DateTime<Utc>) -> std::io::Result<Self> {
        let prefix = format!(
            "proxsave-{}-{}-",
            sanitize_component(hostname),
            now.format("%Y%m%dT%H%M%SZ")
        );
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(parent)?;
        let path = dir.path().to_path_buf();
        debug!("Acquired staging directory {}", path.display());

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Keep the directory on disk after this value is dropped.
    pub fn retain(mut self) -> PathBuf {
        if let Some(dir) = self.dir.take() {
            let kept = dir.keep();
            warn!("Staging directory retained at {}", kept.display());
        }
        self.path.clone()
    }

    /// Delete the directory now, reporting errors instead of ignoring them.
    pub fn release(mut self) -> std::io::Result<()> {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            debug!("Released staging directory {}", path.display());
        }
        Ok(())
    }
}

/// Keep `[A-Za-z0-9._-]`, replace anything else with `_`.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
