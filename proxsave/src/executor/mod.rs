//! Snapshot executor - orchestrates one configuration snapshot.
//!
//! Sequence: validate, acquire staging, detect the host type, run the
//! hypervisor collector and the system collector, chunk large files, write
//! the manifest, archive, release staging. Collector and chunker errors are
//! logged and never stop the run; archive errors are fatal.

pub mod manifest;
pub mod metadata;

use crate::archive::compression::CompressionPlan;
use crate::archive::{archive_file_name, ArchiveOutcome, ArchiveRequest, Archiver};
use crate::chunker::{chunk_tree, ChunkSummary};
use crate::collect::Collector;
use crate::config::Config;
use crate::fs::staging::StagingDir;
use crate::process::Capabilities;
use crate::utils::{EngineError, Result};
use chrono::{Local, Utc};
use manifest::{CompressionInfo, Manifest, ProxmoxType};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of a snapshot run
#[derive(Debug)]
pub struct SnapshotReport {
    pub proxmox_type: ProxmoxType,
    pub manifest: Manifest,
    /// `None` for dry runs
    pub archive: Option<ArchiveOutcome>,
    pub chunks: ChunkSummary,
    pub duration_secs: u64,
}

/// Main snapshot executor
pub struct SnapshotExecutor {
    config: Arc<Config>,
    caps: Capabilities,
    cancel_token: CancellationToken,
    hostname: String,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl SnapshotExecutor {
    pub fn new(config: Config, caps: Capabilities, cancel_token: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            caps,
            cancel_token,
            hostname: local_hostname(),
        }
    }

    /// Override the detected hostname used for naming.
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// PVE and PBS are recognized by their configuration roots.
    pub fn detect_type(&self) -> ProxmoxType {
        let fs = &self.caps.fs;
        if fs.is_dir(&self.config.root_path(&self.config.paths.pve_config_root)) {
            ProxmoxType::Pve
        } else if fs.is_dir(&self.config.root_path(&self.config.paths.pbs_config_root)) {
            ProxmoxType::Pbs
        } else {
            ProxmoxType::Unknown
        }
    }

    /// Run one snapshot.
    pub async fn execute(&self) -> Result<SnapshotReport> {
        let start_time = Instant::now();
        let config = &self.config;

        config.validate()?;
        let recipients = if config.encryption.enabled {
            config.encryption.parse_recipients()?
        } else {
            Vec::new()
        };

        let now = Utc::now();
        let staging = match &config.output.staging_parent {
            Some(parent) => StagingDir::acquire_in(parent, &self.hostname, now)?,
            None => StagingDir::acquire(&self.hostname, now)?,
        };

        let proxmox_type = self.detect_type();
        info!(
            "Starting snapshot of {} ({}) in {}",
            self.hostname,
            proxmox_type,
            staging.path().display()
        );

        let collector = Collector::new(
            Arc::clone(config),
            self.caps.clone(),
            staging.path(),
            self.cancel_token.clone(),
        );

        let hypervisor = match proxmox_type {
            ProxmoxType::Pve => Some(("PVE", collector.collect_pve().await)),
            ProxmoxType::Pbs => Some(("PBS", collector.collect_pbs().await)),
            ProxmoxType::Unknown => None,
        };
        if let Some((name, result)) = hypervisor {
            self.tolerate(name, result)?;
        }
        let system = collector.collect_system().await;
        self.tolerate("system", system)?;

        let chunks = self.chunk_staging(&staging).await?;

        let plan = CompressionPlan::from_tuning(&config.tuning).resolve(self.caps.runner.as_ref());
        let mut manifest = Manifest::new(now, &self.hostname, proxmox_type);
        collector.fill_manifest(&mut manifest);
        manifest.compression = Some(CompressionInfo {
            requested: plan.requested.to_string(),
            effective: plan.effective.to_string(),
            level: plan.level,
        });
        manifest.encryption = if recipients.is_empty() { "plain" } else { "age" }.to_string();
        if let Err(e) = manifest.write_to(&staging.manifest_path()) {
            error!("Failed to write manifest: {}", e);
        }

        let stats = &manifest.stats;
        info!(
            "Collected {} files ({} bytes): {} failed, {} not found, {} skipped",
            stats.files_processed,
            stats.bytes_collected,
            stats.files_failed,
            stats.files_not_found,
            stats.files_skipped
        );

        if config.output.dry_run {
            info!("Dry run: no archive written");
            self.release(staging);
            return Ok(SnapshotReport {
                proxmox_type,
                manifest,
                archive: None,
                chunks,
                duration_secs: start_time.elapsed().as_secs(),
            });
        }

        let name = archive_file_name(
            &self.hostname,
            proxmox_type,
            now.with_timezone(&Local),
            plan.effective,
            !recipients.is_empty(),
        );
        let output = config.output.dir.join(name);
        let request = ArchiveRequest {
            staging: staging.path().to_path_buf(),
            output: output.clone(),
            plan,
            recipients,
        };

        let archived = match std::fs::create_dir_all(&config.output.dir) {
            Ok(()) => {
                let archiver = Archiver::new(Arc::clone(&self.caps.runner), self.cancel_token.clone());
                archiver.create(&request, &manifest).await
            }
            Err(e) => Err(EngineError::from(e).into()),
        };

        match archived {
            Ok(outcome) => {
                self.release(staging);
                let duration_secs = start_time.elapsed().as_secs();
                info!(
                    "Snapshot completed in {}s: {} ({} bytes)",
                    duration_secs,
                    outcome.path.display(),
                    outcome.size
                );
                Ok(SnapshotReport {
                    proxmox_type,
                    manifest,
                    archive: Some(outcome),
                    chunks,
                    duration_secs,
                })
            }
            Err(failure) => {
                if failure.verification_failed {
                    warn!("Keeping unverified archive {} for inspection", output.display());
                } else {
                    remove_partial(&output);
                }
                if config.output.keep_staging_on_failure {
                    staging.retain();
                } else {
                    self.release(staging);
                }
                Err(failure.error)
            }
        }
    }

    /// Log a collector error unless it is a cancellation.
    fn tolerate(&self, collector: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                error!("{} collector failed: {}", collector, e);
                Ok(())
            }
        }
    }

    async fn chunk_staging(&self, staging: &StagingDir) -> Result<ChunkSummary> {
        let Some(threshold) = self.config.tuning.chunk_threshold() else {
            return Ok(ChunkSummary::default());
        };
        let root = staging.path().to_path_buf();
        let chunk_size = self.config.tuning.chunk_size_bytes();
        let cancel = self.cancel_token.clone();

        let result = tokio::task::spawn_blocking(move || chunk_tree(&root, threshold, chunk_size, Some(cancel)))
            .await
            .map_err(|e| EngineError::Chunk(e.to_string()))
            .and_then(|r| r);
        match result {
            Ok(summary) => Ok(summary),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                error!("Chunking failed: {}", e);
                Ok(ChunkSummary::default())
            }
        }
    }

    fn release(&self, staging: StagingDir) {
        if let Err(e) = staging.release() {
            warn!("Failed to remove staging directory: {}", e);
        }
    }
}

fn remove_partial(output: &Path) {
    match std::fs::remove_file(output) {
        Ok(()) => info!("Removed partial archive {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial archive {}: {}", output.display(), e),
    }
}
