//! Snapshot manifest.
//!
//! The manifest records every file the collectors considered, with its
//! outcome, grouped by source class. It is written as `manifest.json` at the
//! staging root and copied next to the archive as the `.metadata` sidecar.

use crate::fs::stats::{Counter, StatsSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Current manifest layout version.
pub const MANIFEST_VERSION: u32 = 1;

/// Outcome of one file considered by a collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Collected,
    NotFound,
    Failed,
    /// Excluded by a pattern, or an expected unprivileged-mode failure
    Skipped,
    /// Turned off by a feature flag; not part of the file counters
    Disabled,
}

impl FileStatus {
    /// Statistics counter this status is tallied under.
    pub fn counter(&self) -> Option<Counter> {
        match self {
            FileStatus::Collected => Some(Counter::Processed),
            FileStatus::NotFound => Some(Counter::NotFound),
            FileStatus::Failed => Some(Counter::Failed),
            FileStatus::Skipped => Some(Counter::Skipped),
            FileStatus::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    pub fn collected(size: u64) -> Self {
        Self {
            status: FileStatus::Collected,
            size: Some(size),
            error: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: FileStatus::NotFound,
            size: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: FileStatus::Failed,
            size: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: FileStatus::Skipped,
            size: None,
            error: Some(reason.into()),
        }
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            status: FileStatus::Disabled,
            size: None,
            error: Some(reason.into()),
        }
    }
}

/// Host flavour detected from its configuration roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxmoxType {
    Pve,
    Pbs,
    Unknown,
}

impl ProxmoxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxmoxType::Pve => "pve",
            ProxmoxType::Pbs => "pbs",
            ProxmoxType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ProxmoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested versus effective compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub requested: String,
    pub effective: String,
    pub level: i32,
}

pub type EntryMap = BTreeMap<String, ManifestEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub proxmox_type: ProxmoxType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
    /// `age` or `plain`
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbs_configs: Option<EntryMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pve_configs: Option<EntryMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_files: Option<EntryMap>,
    pub stats: StatsSnapshot,
}

fn default_encryption() -> String {
    "plain".to_string()
}

impl Manifest {
    pub fn new(created_at: DateTime<Utc>, hostname: &str, proxmox_type: ProxmoxType) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at,
            hostname: hostname.to_string(),
            proxmox_type,
            compression: None,
            encryption: default_encryption(),
            pbs_configs: None,
            pve_configs: None,
            system_files: None,
            stats: StatsSnapshot::default(),
        }
    }

    fn maps(&self) -> impl Iterator<Item = &EntryMap> {
        [&self.pbs_configs, &self.pve_configs, &self.system_files]
            .into_iter()
            .flatten()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.maps().flat_map(|m| m.iter())
    }

    /// Number of entries with `status`.
    pub fn count(&self, status: FileStatus) -> u64 {
        self.entries().filter(|(_, e)| e.status == status).count() as u64
    }

    /// True when the summary counters agree with the per-entry statuses.
    pub fn is_consistent(&self) -> bool {
        self.stats.files_processed == self.count(FileStatus::Collected)
            && self.stats.files_failed == self.count(FileStatus::Failed)
            && self.stats.files_not_found == self.count(FileStatus::NotFound)
            && self.stats.files_skipped == self.count(FileStatus::Skipped)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Write the manifest to `path`, replacing it atomically.
    ///
    /// Output is byte-identical for identical manifests.
    pub fn write_to(&self, path: &Path) -> crate::Result<()> {
        let bytes = self.to_json()?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
