//! PBS datastore discovery, namespace enumeration and PXAR metadata.
//!
//! Datastores are only enumerated, never copied. Each datastore is processed
//! concurrently up to `datastore_concurrency`; inside one datastore the
//! top-level group directories are scanned up to `intra_concurrency` at a
//! time.

use super::command::CommandSpec;
use super::{Collector, SourceClass};
use crate::executor::manifest::ManifestEntry;
use crate::fs::staging::STATE_DIR;
use crate::fs::walker::{walk_directory_with_callback, WalkOptions};
use crate::utils::env::pbs_passthrough;
use crate::utils::{summarize_output, EngineError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLASS: SourceClass = SourceClass::Pbs;

/// Deepest namespace nesting PBS allows.
const MAX_NAMESPACE_DEPTH: usize = 7;

/// File name suffixes recorded by the PXAR scan.
pub const PXAR_SUFFIXES: &[&str] = &[".pxar", ".pxar.didx", ".mpxar.didx", ".ppxar.didx"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub ns: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PxarFile {
    /// Path relative to the datastore root
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PxarReport {
    pub datastore: String,
    pub path: PathBuf,
    pub file_count: usize,
    pub total_size: u64,
    pub files: Vec<PxarFile>,
}

/// Parse `datastore.cfg` section config.
pub fn parse_datastore_cfg(text: &str) -> Vec<Datastore> {
    let mut stores = Vec::new();
    let mut current: Option<Datastore> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(name) = trimmed.strip_prefix("datastore:") {
            if let Some(done) = current.take() {
                stores.push(done);
            }
            current = Some(Datastore {
                name: name.trim().to_string(),
                path: PathBuf::new(),
                comment: None,
            });
            continue;
        }
        let Some(store) = current.as_mut() else {
            continue;
        };
        let (key, value) = trimmed
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((trimmed, ""));
        match key {
            "path" => store.path = PathBuf::from(value),
            "comment" => store.comment = Some(value.to_string()),
            _ => {}
        }
    }
    if let Some(done) = current {
        stores.push(done);
    }
    stores.retain(|s| !s.name.is_empty() && !s.path.as_os_str().is_empty());
    stores
}

/// Parse `proxmox-backup-manager datastore list --output-format=json`.
pub fn parse_datastore_list(json: &[u8]) -> serde_json::Result<Vec<Datastore>> {
    let stores: Vec<Datastore> = serde_json::from_slice(json)?;
    Ok(stores
        .into_iter()
        .filter(|s| !s.name.is_empty())
        .collect())
}

/// Name for an override path: its last component reduced to
/// `[A-Za-z0-9_-]`, or `datastore_<index>` when nothing is left.
pub fn synthetic_name(path: &str, index: usize) -> String {
    let last = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if cleaned.chars().any(|c| c.is_ascii_alphanumeric()) {
        cleaned
    } else {
        format!("datastore_{}", index)
    }
}

/// Append configured override paths to the detected datastores.
///
/// Paths are trimmed; empty entries and paths already known are ignored.
pub fn merge_overrides(mut stores: Vec<Datastore>, overrides: &[String]) -> Vec<Datastore> {
    for (i, raw) in overrides.iter().enumerate() {
        let path = raw.trim();
        if path.is_empty() || stores.iter().any(|s| s.path == Path::new(path)) {
            continue;
        }
        let mut name = synthetic_name(path, i + 1);
        if stores.iter().any(|s| s.name == name) {
            name = format!("{}_{}", name, i + 1);
        }
        stores.push(Datastore {
            name,
            path: PathBuf::from(path),
            comment: Some("configured override".to_string()),
        });
    }
    stores
}

/// Namespaces stored under `root`, including the root namespace `""`.
pub fn scan_namespaces(root: &Path) -> io::Result<Vec<String>> {
    std::fs::read_dir(root)?;
    let mut found = vec![String::new()];
    scan_namespace_level(&root.join("ns"), "", 1, &mut found)?;
    found.sort();
    Ok(found)
}

fn scan_namespace_level(dir: &Path, prefix: &str, depth: usize, found: &mut Vec<String>) -> io::Result<()> {
    if depth > MAX_NAMESPACE_DEPTH {
        return Ok(());
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let ns = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        scan_namespace_level(&entry.path().join("ns"), &ns, depth + 1, found)?;
        found.push(ns);
    }
    Ok(())
}

fn is_pxar_file(name: &str) -> bool {
    PXAR_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Top-level directories of a datastore that may hold backup groups.
///
/// Hidden entries are left out, `.chunks` among them.
pub fn pxar_scan_roots(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_dir() {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}

/// PXAR files under `dir`, with paths relative to `datastore_root`.
pub fn scan_pxar_dir(
    datastore_root: &Path,
    dir: &Path,
    cancel: Option<CancellationToken>,
) -> io::Result<Vec<PxarFile>> {
    let mut files = Vec::new();
    let options = WalkOptions {
        cancel,
        ..Default::default()
    };
    walk_directory_with_callback(dir, options, |info| {
        let name = info
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if info.is_dir || info.is_symlink || !is_pxar_file(&name) {
            return Ok(());
        }
        let mtime = std::fs::symlink_metadata(&info.path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let relative = info.path.strip_prefix(datastore_root).unwrap_or(&info.path);
        files.push(PxarFile {
            path: relative.to_string_lossy().into_owned(),
            size: info.size,
            mtime,
        });
        Ok(())
    })?;
    Ok(files)
}

/// Repository string for `datastore`, reusing the user and host of
/// `PBS_REPOSITORY` when it is set.
pub fn repository_for(datastore: &str, env: &[(String, String)]) -> String {
    let base = env
        .iter()
        .find(|(k, _)| k == "PBS_REPOSITORY")
        .and_then(|(_, v)| v.rsplit_once(':').map(|(head, _)| head.to_string()))
        .unwrap_or_else(|| "root@pam@localhost".to_string());
    format!("{}:{}", base, datastore)
}

fn datastore_output(name: &str, suffix: &str) -> PathBuf {
    Path::new(STATE_DIR)
        .join("pbs")
        .join("datastores")
        .join(format!("{}{}", name, suffix))
}

impl Collector {
    /// Datastores known to PBS plus configured overrides.
    pub async fn discover_datastores(&self) -> Result<Vec<Datastore>> {
        let cmd = CommandSpec::new(
            "proxmox-backup-manager",
            &["datastore", "list", "--output-format=json"],
        );
        let mut stores = None;
        match self.run_command(&cmd).await {
            Ok(Some(out)) if out.success() => match parse_datastore_list(&out.stdout) {
                Ok(list) => stores = Some(list),
                Err(e) => warn!("Unexpected datastore listing: {}", e),
            },
            Ok(Some(out)) => warn!(
                "{} failed: {}",
                cmd.command_line(),
                summarize_output(&out.combined())
            ),
            Ok(None) => debug!("proxmox-backup-manager not found, reading datastore.cfg"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!("{}: {}", cmd.command_line(), e),
        }

        let stores = match stores {
            Some(stores) => stores,
            None => {
                let cfg = self
                    .config()
                    .root_path(self.config().paths.pbs_config_root.join("datastore.cfg"));
                match std::fs::read_to_string(&cfg) {
                    Ok(text) => parse_datastore_cfg(&text),
                    Err(e) => {
                        debug!("Cannot read {}: {}", cfg.display(), e);
                        Vec::new()
                    }
                }
            }
        };

        let stores = merge_overrides(stores, &self.config().paths.pbs_datastore_paths);
        info!("Found {} datastore(s)", stores.len());
        Ok(stores)
    }

    /// Namespaces of one datastore, from disk or from the PBS client.
    pub async fn list_namespaces(&self, store: &Datastore) -> Result<Vec<NamespaceEntry>> {
        self.check_cancelled()?;
        let root = self.config().root_path(&store.path);
        let scanned = tokio::task::spawn_blocking(move || scan_namespaces(&root))
            .await
            .map_err(|e| EngineError::Io(io::Error::other(e)))?;

        match scanned {
            Ok(names) => Ok(names.into_iter().map(|ns| NamespaceEntry { ns }).collect()),
            Err(e) => {
                debug!(
                    "Cannot scan {} on disk ({}), asking proxmox-backup-client",
                    store.path.display(),
                    e
                );
                let env = pbs_passthrough();
                let repository = repository_for(&store.name, &env);
                let cmd = CommandSpec::new(
                    "proxmox-backup-client",
                    &["namespace", "list", "--repository", &repository, "--output-format=json"],
                )
                .with_env(env);
                match self.run_command(&cmd).await? {
                    Some(out) if out.success() => Ok(serde_json::from_slice(&out.stdout)?),
                    Some(out) => Err(EngineError::Command {
                        command: cmd.command_line(),
                        code: out.exit_code,
                        summary: summarize_output(&out.combined()),
                    }),
                    None => Err(EngineError::Io(e)),
                }
            }
        }
    }

    /// Write `<datastore>_namespaces.json` for every datastore.
    ///
    /// Returns one result per datastore; a failure for one datastore does
    /// not stop the others.
    pub async fn collect_namespaces(&self, stores: &[Datastore]) -> Result<Vec<(String, Result<()>)>> {
        let semaphore = Arc::new(Semaphore::new(self.config().tuning.datastore_concurrency.max(1)));

        let tasks = stores.iter().map(|store| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| EngineError::Io(io::Error::other(e)))?;
                let target = datastore_output(&store.name, "_namespaces.json");
                match self.list_namespaces(store).await {
                    Ok(namespaces) => {
                        self.write_json(CLASS, &target, &namespaces)?;
                        Ok(())
                    }
                    Err(e) if e.is_cancelled() => Err(e),
                    Err(e) => {
                        warn!("Namespace listing failed for datastore {}: {}", store.name, e);
                        let key = self.manifest_key(&self.staging_root().join(&target));
                        self.record(CLASS, &key, ManifestEntry::failed(e.to_string()));
                        Err(e)
                    }
                }
            }
        });

        let results: Vec<Result<()>> = join_all(tasks).await;
        if results.iter().any(|r| matches!(r, Err(e) if e.is_cancelled())) {
            return Err(EngineError::Cancelled);
        }
        Ok(stores
            .iter()
            .map(|s| s.name.clone())
            .zip(results)
            .collect())
    }

    /// Scan one datastore for PXAR archives and write its report.
    pub async fn scan_pxar(&self, store: &Datastore) -> Result<PxarReport> {
        let root = self.config().root_path(&store.path);
        let listed = root.clone();
        let top_level = tokio::task::spawn_blocking(move || pxar_scan_roots(&listed))
            .await
            .map_err(|e| EngineError::Io(io::Error::other(e)))??;

        let limit = self.config().tuning.intra_concurrency_for(true);
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let tasks = top_level.into_iter().map(|dir| {
            let semaphore = Arc::clone(&semaphore);
            let root = root.clone();
            let cancel = self.cancel_token().clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Io(io::Error::other(e)))?;
                let files = tokio::task::spawn_blocking(move || scan_pxar_dir(&root, &dir, Some(cancel)))
                    .await
                    .map_err(|e| EngineError::Io(io::Error::other(e)))?;
                files.map_err(EngineError::from)
            }
        });

        let mut files = Vec::new();
        for result in join_all(tasks).await {
            match result {
                Ok(mut found) => files.append(&mut found),
                Err(EngineError::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    return Err(EngineError::Cancelled)
                }
                Err(e) => return Err(e),
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(PxarReport {
            datastore: store.name.clone(),
            path: store.path.clone(),
            file_count: files.len(),
            total_size: files.iter().map(|f| f.size).sum(),
            files,
        })
    }

    /// Write PXAR metadata (and optional listings) for every datastore.
    pub async fn collect_pxar_metadata(&self, stores: &[Datastore]) -> Result<()> {
        let listings = self.config().features.backup_pxar_listings;
        let semaphore = Arc::new(Semaphore::new(self.config().tuning.datastore_concurrency.max(1)));

        let tasks = stores.iter().map(|store| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| EngineError::Io(io::Error::other(e)))?;
                let metadata_path = datastore_output(&store.name, "_pxar_metadata.json");
                let listing_path = datastore_output(&store.name, "_pxar_files.txt");

                match self.scan_pxar(store).await {
                    Ok(report) => {
                        self.write_json(CLASS, &metadata_path, &report)?;
                        if listings {
                            let mut text = String::new();
                            for file in &report.files {
                                text.push_str(&file.path);
                                text.push('\n');
                            }
                            self.write_output(CLASS, &listing_path, text.as_bytes())?;
                        } else {
                            self.record_disabled(CLASS, &listing_path, "backup_pxar_listings disabled");
                        }
                        Ok(())
                    }
                    Err(e) if e.is_cancelled() => Err(e),
                    Err(e) => {
                        warn!("PXAR scan failed for datastore {}: {}", store.name, e);
                        let key = self.manifest_key(&self.staging_root().join(&metadata_path));
                        match &e {
                            EngineError::Io(io) if io.kind() == io::ErrorKind::NotFound => {
                                self.record(CLASS, &key, ManifestEntry::not_found())
                            }
                            _ => self.record(CLASS, &key, ManifestEntry::failed(e.to_string())),
                        }
                        Ok(())
                    }
                }
            }
        });

        for result in join_all(tasks).await {
            result?;
        }
        Ok(())
    }
}
