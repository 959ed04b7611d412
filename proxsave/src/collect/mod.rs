//! Source collectors.
//!
//! A [`Collector`] owns everything the individual collectors share: the
//! engine config, the capability struct, the staging root, the statistics
//! counters, the exclusion pattern list and the per-class manifest maps.
//! Every file outcome goes through [`Collector::record`], which keeps the
//! counters and the manifest in step.

pub mod command;
pub mod datastore;
pub mod inventory;
pub mod pbs;
pub mod pve;
pub mod system;
pub mod tokens;

use crate::config::Config;
use crate::executor::manifest::{EntryMap, FileStatus, Manifest, ManifestEntry};
use crate::fs::copy::{copy_dir, copy_file, write_report, CopyOutcome, DirCopyEvent, DirCopyFilter};
use crate::fs::exclude::{ExcludeSet, MatchRoots};
use crate::fs::stats::CollectionStats;
use crate::privilege::Classifier;
use crate::process::{CommandRunner, Capabilities};
use crate::utils::{EngineError, Result};
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Manifest map a file outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceClass {
    Pve,
    Pbs,
    System,
}

#[derive(Debug, Default)]
struct ManifestMaps {
    pve: Option<EntryMap>,
    pbs: Option<EntryMap>,
    system: Option<EntryMap>,
}

impl ManifestMaps {
    fn slot(&mut self, class: SourceClass) -> &mut Option<EntryMap> {
        match class {
            SourceClass::Pve => &mut self.pve,
            SourceClass::Pbs => &mut self.pbs,
            SourceClass::System => &mut self.system,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ExclusionState {
    patterns: Vec<String>,
    /// Patterns installed for disabled features, with the reason to record
    disabled: HashMap<String, String>,
}

/// Shared state for one collection run.
pub struct Collector {
    config: Arc<Config>,
    caps: Capabilities,
    classifier: Classifier,
    staging: PathBuf,
    stats: Arc<CollectionStats>,
    exclusions: Mutex<ExclusionState>,
    maps: Mutex<ManifestMaps>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Collector {
    pub fn new(
        config: Arc<Config>,
        caps: Capabilities,
        staging: &Path,
        cancel: CancellationToken,
    ) -> Self {
        let exclusions = ExclusionState {
            patterns: config.tuning.exclude_patterns.clone(),
            disabled: HashMap::new(),
        };
        Self {
            classifier: Classifier::new(Arc::clone(&caps.detector)),
            config,
            caps,
            staging: staging.to_path_buf(),
            stats: Arc::new(CollectionStats::new()),
            exclusions: Mutex::new(exclusions),
            maps: Mutex::new(ManifestMaps::default()),
            cancel,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.caps.runner.as_ref()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging
    }

    pub fn stats(&self) -> &Arc<CollectionStats> {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Make sure the manifest map for `class` exists even if nothing is recorded.
    pub fn begin(&self, class: SourceClass) {
        lock(&self.maps).slot(class).get_or_insert_with(EntryMap::new);
    }

    /// Record the outcome for `key` and update the counters.
    ///
    /// Replacing an existing entry first takes back the old entry's count, so
    /// each key contributes to exactly one counter.
    pub fn record(&self, class: SourceClass, key: &str, entry: ManifestEntry) {
        let mut maps = lock(&self.maps);
        let map = maps.slot(class).get_or_insert_with(EntryMap::new);

        if let Some(counter) = entry.status.counter() {
            self.stats.increment(counter);
        }
        if entry.status == FileStatus::Collected {
            self.stats.add_bytes(entry.size.unwrap_or(0));
        }

        if let Some(previous) = map.insert(key.to_string(), entry) {
            if let Some(counter) = previous.status.counter() {
                self.stats.decrement(counter);
            }
            if previous.status == FileStatus::Collected {
                self.stats.sub_bytes(previous.size.unwrap_or(0));
            }
        }
    }

    pub fn entry(&self, class: SourceClass, key: &str) -> Option<ManifestEntry> {
        let mut maps = lock(&self.maps);
        maps.slot(class).as_ref().and_then(|m| m.get(key).cloned())
    }

    /// Copy the maps and counters into `manifest`.
    pub fn fill_manifest(&self, manifest: &mut Manifest) {
        let maps = lock(&self.maps);
        manifest.pve_configs = maps.pve.clone();
        manifest.pbs_configs = maps.pbs.clone();
        manifest.system_files = maps.system.clone();
        manifest.stats = self.stats.snapshot();
    }

    /// Current exclusion patterns.
    pub fn exclude_patterns(&self) -> Vec<String> {
        lock(&self.exclusions).patterns.clone()
    }

    /// Install extra exclusions for feature flags that are turned off.
    ///
    /// Each pair is `(pattern, reason)`. Files skipped because of one of these
    /// patterns are recorded as `disabled`. The previous list comes back
    /// when the returned guard is dropped, including during unwinding.
    pub fn exclude_temporarily<S: AsRef<str>>(&self, disabled: &[(S, S)]) -> ExclusionScope<'_> {
        let mut state = lock(&self.exclusions);
        let saved = state.clone();
        for (pattern, reason) in disabled {
            let pattern = pattern.as_ref().to_string();
            if !state.patterns.contains(&pattern) {
                state.patterns.push(pattern.clone());
            }
            state.disabled.insert(pattern, reason.as_ref().to_string());
        }
        ExclusionScope {
            state: &self.exclusions,
            saved: Some(saved),
        }
    }

    fn match_roots(&self) -> MatchRoots {
        MatchRoots::new(Some(&self.staging), self.config.paths.system_root.as_deref())
    }

    /// Pattern excluding `path` (host or staging form), with its disabled reason.
    pub fn excluded_by(&self, path: &Path) -> Option<(String, Option<String>)> {
        let state = lock(&self.exclusions);
        let set = ExcludeSet::compile(&state.patterns);
        let pattern = set.matching_pattern(path, &self.match_roots())?.to_string();
        let reason = state.disabled.get(&pattern).cloned();
        Some((pattern, reason))
    }

    /// Destination in the staging tree for an absolute host path.
    pub fn staged_path(&self, host_path: &Path) -> PathBuf {
        self.staging.join(strip_root(host_path))
    }

    /// Manifest key for a staging-tree path.
    pub fn manifest_key(&self, staged: &Path) -> String {
        staged
            .strip_prefix(&self.staging)
            .unwrap_or(staged)
            .to_string_lossy()
            .into_owned()
    }

    fn record_exclusion(&self, class: SourceClass, key: &str, pattern: &str, reason: Option<String>) {
        match reason {
            Some(reason) => {
                debug!("{} disabled ({})", key, reason);
                self.record(class, key, ManifestEntry::disabled(reason));
            }
            None => {
                crate::skip!("{} excluded by pattern {}", key, pattern);
                self.record(class, key, ManifestEntry::skipped(format!("excluded by pattern {}", pattern)));
            }
        }
    }

    /// Copy one host file into the staging tree and record the outcome.
    pub fn collect_file(&self, class: SourceClass, host_path: &Path) -> Result<FileStatus> {
        self.check_cancelled()?;
        let source = self.config.root_path(host_path);
        let dest = self.staged_path(host_path);
        let key = self.manifest_key(&dest);

        if let Some((pattern, reason)) = self
            .excluded_by(&source)
            .or_else(|| self.excluded_by(&dest))
        {
            self.record_exclusion(class, &key, &pattern, reason);
            return Ok(self.status_of(class, &key));
        }

        let entry = match copy_file(&source, &dest, &self.stats) {
            Ok(outcome) => outcome_entry(&outcome),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not present on this host", source.display());
                ManifestEntry::not_found()
            }
            Err(e) => {
                warn!("Failed to copy {}: {}", source.display(), e);
                ManifestEntry::failed(e.to_string())
            }
        };
        let status = entry.status;
        self.record(class, &key, entry);
        Ok(status)
    }

    /// Copy a host directory tree into the staging tree.
    ///
    /// A missing directory is recorded as a single `not_found` entry.
    pub fn collect_dir(&self, class: SourceClass, host_dir: &Path) -> Result<()> {
        self.check_cancelled()?;
        let source = self.config.root_path(host_dir);
        let dest = self.staged_path(host_dir);

        match std::fs::symlink_metadata(&source) {
            Ok(meta) if !meta.is_dir() => {
                self.collect_file(class, host_dir)?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not present on this host", source.display());
                self.record(class, &self.manifest_key(&dest), ManifestEntry::not_found());
                return Ok(());
            }
            Err(e) => {
                warn!("Cannot access {}: {}", source.display(), e);
                self.record(class, &self.manifest_key(&dest), ManifestEntry::failed(e.to_string()));
                return Ok(());
            }
        }

        let (set, disabled) = {
            let state = lock(&self.exclusions);
            (ExcludeSet::compile(&state.patterns), state.disabled.clone())
        };
        let roots = self.match_roots();
        let filter = DirCopyFilter {
            excludes: &set,
            roots: &roots,
        };

        let result = copy_dir(&source, &dest, &filter, &self.stats, &self.cancel, |event| match event {
            DirCopyEvent::Copied { dest, outcome, .. } => {
                self.record(class, &self.manifest_key(&dest), outcome_entry(&outcome));
            }
            DirCopyEvent::Excluded {
                dest,
                pattern,
                is_dir,
                ..
            } => {
                let mut key = self.manifest_key(&dest);
                if is_dir {
                    key.push('/');
                }
                let reason = disabled.get(&pattern).cloned();
                self.record_exclusion(class, &key, &pattern, reason);
            }
            DirCopyEvent::Failed { dest, error, .. } => {
                self.record(class, &self.manifest_key(&dest), ManifestEntry::failed(error.to_string()));
            }
        });

        match result {
            Err(e) if e.kind() == io::ErrorKind::Interrupted && self.cancel.is_cancelled() => {
                Err(EngineError::Cancelled)
            }
            Err(e) => {
                warn!("Copy of {} stopped: {}", source.display(), e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Write generated content at a staging-relative path and record it.
    pub fn write_output(&self, class: SourceClass, relative: &Path, content: &[u8]) -> Result<FileStatus> {
        self.check_cancelled()?;
        let dest = self.staging.join(relative);
        let key = self.manifest_key(&dest);

        if let Some((pattern, reason)) = self.excluded_by(&dest) {
            self.record_exclusion(class, &key, &pattern, reason);
            return Ok(self.status_of(class, &key));
        }

        let entry = match write_report(&dest, content, &self.stats) {
            Ok(size) => ManifestEntry::collected(size),
            Err(e) => {
                warn!("Failed to write {}: {}", dest.display(), e);
                ManifestEntry::failed(e.to_string())
            }
        };
        let status = entry.status;
        self.record(class, &key, entry);
        Ok(status)
    }

    /// Serialize `value` as pretty JSON into the staging tree.
    pub fn write_json<T: serde::Serialize>(
        &self,
        class: SourceClass,
        relative: &Path,
        value: &T,
    ) -> Result<FileStatus> {
        let mut bytes = serde_json::to_vec_pretty(value)?;
        bytes.push(b'\n');
        self.write_output(class, relative, &bytes)
    }

    /// Record a staging-relative output as turned off by a feature flag.
    pub fn record_disabled(&self, class: SourceClass, relative: &Path, reason: &str) {
        let key = self.manifest_key(&self.staging.join(relative));
        debug!("{} disabled ({})", key, reason);
        self.record(class, &key, ManifestEntry::disabled(reason));
    }

    fn status_of(&self, class: SourceClass, key: &str) -> FileStatus {
        self.entry(class, key)
            .map(|e| e.status)
            .unwrap_or(FileStatus::Skipped)
    }
}

fn outcome_entry(outcome: &CopyOutcome) -> ManifestEntry {
    match outcome {
        CopyOutcome::Copied { bytes } => ManifestEntry::collected(*bytes),
        CopyOutcome::Symlink { .. } => ManifestEntry::collected(0),
        CopyOutcome::Unsupported => ManifestEntry::skipped("not a regular file"),
    }
}

/// Drop the root and any `..` from an absolute host path.
pub fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Restores the exclusion list on drop.
pub struct ExclusionScope<'a> {
    state: &'a Mutex<ExclusionState>,
    saved: Option<ExclusionState>,
}

impl Drop for ExclusionScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *lock(self.state) = saved;
        }
    }
}

/// Disabled-feature exclusions: `(flag enabled, patterns, flag name)`.
pub(crate) fn disabled_exclusions(rules: &[(bool, &[&str], &str)]) -> Vec<(String, String)> {
    rules
        .iter()
        .filter(|(enabled, _, _)| !enabled)
        .flat_map(|(_, patterns, flag)| {
            patterns
                .iter()
                .map(move |p| (p.to_string(), format!("{} disabled", flag)))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::privilege::StaticDetector;
    use crate::process::fake::FakeRunner;
    use crate::process::OsFs;
    use tempfile::TempDir;

    /// Host fixture plus a collector wired to a scripted runner.
    pub struct Fixture {
        pub host: TempDir,
        pub staging: TempDir,
        pub runner: Arc<FakeRunner>,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                host: TempDir::new().unwrap(),
                staging: TempDir::new().unwrap(),
                runner: Arc::new(FakeRunner::new()),
            }
        }

        pub fn write(&self, host_path: &str, content: &str) {
            let path = self.host.path().join(host_path.trim_start_matches('/'));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        pub fn config(&self) -> Config {
            let mut config = Config::default();
            config.paths.system_root = Some(self.host.path().to_path_buf());
            config
        }

        pub fn collector(&self, config: Config) -> Collector {
            self.collector_with(config, StaticDetector::privileged())
        }

        pub fn collector_with(&self, config: Config, detector: StaticDetector) -> Collector {
            let caps = Capabilities {
                runner: self.runner.clone(),
                fs: Arc::new(OsFs),
                detector: Arc::new(detector),
            };
            Collector::new(Arc::new(config), caps, self.staging.path(), CancellationToken::new())
        }

        pub fn staged(&self, relative: &str) -> PathBuf {
            self.staging.path().join(relative)
        }
    }

    /// Counter conservation over everything recorded so far.
    pub fn assert_conserved(collector: &Collector) {
        let mut manifest = Manifest::new(chrono::Utc::now(), "test", crate::executor::manifest::ProxmoxType::Unknown);
        collector.fill_manifest(&mut manifest);
        let considered = manifest
            .entries()
            .filter(|(_, e)| e.status != FileStatus::Disabled)
            .count() as u64;
        assert_eq!(manifest.stats.files_considered(), considered);
        assert!(manifest.is_consistent());
    }
}
