//! Engine configuration.
//!
//! Loaded from a TOML file; every table and key is optional and falls back to
//! the defaults below. CLI flags are applied on top by the binary.

use crate::fs::exclude::validate_pattern;
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub features: FeatureFlags,
    pub paths: PathConfig,
    pub tuning: TuningConfig,
    pub output: OutputConfig,
    pub encryption: EncryptionConfig,
    pub log: LogConfig,
}

/// Which classes of state to capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    // PVE
    pub backup_pve_configs: bool,
    pub backup_vm_configs: bool,
    pub backup_pve_firewall: bool,
    pub backup_cluster_config: bool,
    pub backup_pve_jobs: bool,

    // PBS
    pub backup_pbs_configs: bool,
    pub backup_datastore_configs: bool,
    pub backup_user_configs: bool,
    pub backup_remote_configs: bool,
    pub backup_sync_jobs: bool,
    pub backup_verify_jobs: bool,
    pub backup_prune_jobs: bool,
    pub backup_tape_configs: bool,
    pub backup_datastore_namespaces: bool,
    pub backup_pxar_metadata: bool,
    /// Full per-file listings of every pxar archive; large
    pub backup_pxar_listings: bool,
    pub backup_user_tokens: bool,

    // System
    pub backup_network_configs: bool,
    /// Private keys under /etc/ssl/private
    pub backup_ssl_keys: bool,
    pub backup_ssh_keys: bool,
    pub backup_cron: bool,
    pub backup_apt_sources: bool,
    pub backup_system_configs: bool,
    pub backup_hardware_info: bool,
    pub backup_zfs_info: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            backup_pve_configs: true,
            backup_vm_configs: true,
            backup_pve_firewall: true,
            backup_cluster_config: true,
            backup_pve_jobs: true,
            backup_pbs_configs: true,
            backup_datastore_configs: true,
            backup_user_configs: true,
            backup_remote_configs: true,
            backup_sync_jobs: true,
            backup_verify_jobs: true,
            backup_prune_jobs: true,
            backup_tape_configs: true,
            backup_datastore_namespaces: true,
            backup_pxar_metadata: true,
            backup_pxar_listings: false,
            backup_user_tokens: true,
            backup_network_configs: true,
            backup_ssl_keys: false,
            backup_ssh_keys: false,
            backup_cron: true,
            backup_apt_sources: true,
            backup_system_configs: true,
            backup_hardware_info: true,
            backup_zfs_info: true,
        }
    }
}

impl FeatureFlags {
    fn all(&self) -> [bool; 25] {
        [
            self.backup_pve_configs,
            self.backup_vm_configs,
            self.backup_pve_firewall,
            self.backup_cluster_config,
            self.backup_pve_jobs,
            self.backup_pbs_configs,
            self.backup_datastore_configs,
            self.backup_user_configs,
            self.backup_remote_configs,
            self.backup_sync_jobs,
            self.backup_verify_jobs,
            self.backup_prune_jobs,
            self.backup_tape_configs,
            self.backup_datastore_namespaces,
            self.backup_pxar_metadata,
            self.backup_pxar_listings,
            self.backup_user_tokens,
            self.backup_network_configs,
            self.backup_ssl_keys,
            self.backup_ssh_keys,
            self.backup_cron,
            self.backup_apt_sources,
            self.backup_system_configs,
            self.backup_hardware_info,
            self.backup_zfs_info,
        ]
    }

    pub fn any_enabled(&self) -> bool {
        self.all().iter().any(|f| *f)
    }
}

/// Locations of the Proxmox configuration roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Prefix under which every absolute host path is resolved (tests, chroots)
    pub system_root: Option<PathBuf>,
    pub pve_config_root: PathBuf,
    pub pve_cluster_db: PathBuf,
    pub corosync_root: PathBuf,
    pub pbs_config_root: PathBuf,
    /// Datastore roots appended to the detected list
    pub pbs_datastore_paths: Vec<String>,
    /// Additional absolute paths captured by the system collector
    pub extra_files: Vec<PathBuf>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            system_root: None,
            pve_config_root: PathBuf::from("/etc/pve"),
            pve_cluster_db: PathBuf::from("/var/lib/pve-cluster"),
            corosync_root: PathBuf::from("/etc/corosync"),
            pbs_config_root: PathBuf::from("/etc/proxmox-backup"),
            pbs_datastore_paths: Vec::new(),
            extra_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Pigz,
    Bzip2,
    Xz,
    Lzma,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Pigz => "pigz",
            CompressionAlgorithm::Bzip2 => "bzip2",
            CompressionAlgorithm::Xz => "xz",
            CompressionAlgorithm::Lzma => "lzma",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// Archive file extension, without `.age`.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => ".tar",
            CompressionAlgorithm::Gzip | CompressionAlgorithm::Pigz => ".tar.gz",
            CompressionAlgorithm::Bzip2 => ".tar.bz2",
            CompressionAlgorithm::Xz => ".tar.xz",
            CompressionAlgorithm::Lzma => ".tar.lzma",
            CompressionAlgorithm::Zstd => ".tar.zst",
        }
    }

    /// External program needed, if any.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            CompressionAlgorithm::None | CompressionAlgorithm::Gzip => None,
            other => Some(other.as_str()),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "tar" => Ok(CompressionAlgorithm::None),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "pigz" => Ok(CompressionAlgorithm::Pigz),
            "bzip2" | "bz2" => Ok(CompressionAlgorithm::Bzip2),
            "xz" => Ok(CompressionAlgorithm::Xz),
            "lzma" => Ok(CompressionAlgorithm::Lzma),
            "zstd" | "zst" => Ok(CompressionAlgorithm::Zstd),
            other => Err(format!("unknown compression algorithm '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    Fast,
    #[default]
    Standard,
    Maximum,
    Ultra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub compression: CompressionAlgorithm,
    /// Explicit level; derived from `compression_mode` when absent
    pub compression_level: Option<i32>,
    pub compression_mode: CompressionMode,
    /// Compressor threads, 0 = let the compressor decide
    pub compression_threads: u32,
    /// Async runtime worker threads, 0 = number of CPUs
    pub worker_threads: usize,
    pub datastore_concurrency: usize,
    /// Per-datastore scan parallelism; 4 on PBS and 1 elsewhere when unset
    pub intra_concurrency: Option<usize>,
    pub pvesh_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Files larger than this are chunked, 0 disables chunking
    pub max_file_size: i64,
    pub chunk_size: i64,
    pub exclude_patterns: Vec<String>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            compression_level: None,
            compression_mode: CompressionMode::Standard,
            compression_threads: 0,
            worker_threads: 0,
            datastore_concurrency: default_datastore_concurrency(),
            intra_concurrency: None,
            pvesh_timeout_secs: default_pvesh_timeout(),
            command_timeout_secs: default_command_timeout(),
            max_file_size: 0,
            chunk_size: default_chunk_size(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl TuningConfig {
    pub fn intra_concurrency_for(&self, is_pbs: bool) -> usize {
        match self.intra_concurrency {
            Some(n) if n > 0 => n,
            _ if is_pbs => 4,
            _ => 1,
        }
    }

    /// Chunking threshold in bytes, `None` when disabled.
    pub fn chunk_threshold(&self) -> Option<u64> {
        (self.max_file_size > 0).then_some(self.max_file_size as u64)
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        if self.chunk_size > 0 {
            self.chunk_size as u64
        } else {
            default_chunk_size() as u64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving the archive and its sidecars
    pub dir: PathBuf,
    /// Parent for the staging directory; system temp dir when unset
    pub staging_parent: Option<PathBuf>,
    pub keep_staging_on_failure: bool,
    /// Collect and write the manifest, but produce no archive
    pub dry_run: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/proxsave/backup"),
            staging_parent: None,
            keep_staging_on_failure: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// age X25519 public keys (`age1...`)
    pub recipients: Vec<String>,
}

impl EncryptionConfig {
    pub fn parse_recipients(&self) -> Result<Vec<age::x25519::Recipient>> {
        self.recipients
            .iter()
            .map(|r| {
                r.trim().parse::<age::x25519::Recipient>().map_err(|e| {
                    EngineError::Config(format!("invalid age recipient '{}': {}", r, e))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_compression() -> CompressionAlgorithm {
    CompressionAlgorithm::Xz
}

fn default_datastore_concurrency() -> usize {
    3
}

fn default_pvesh_timeout() -> u64 {
    15
}

fn default_command_timeout() -> u64 {
    60
}

fn default_chunk_size() -> i64 {
    50 * 1024 * 1024 // 50MB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject invalid combinations before anything is collected.
    pub fn validate(&self) -> Result<()> {
        if !self.features.any_enabled() {
            return Err(EngineError::Config("no backup feature is enabled".into()));
        }

        if self.tuning.max_file_size < 0 {
            return Err(EngineError::Config(format!(
                "max_file_size must not be negative (got {})",
                self.tuning.max_file_size
            )));
        }
        if self.tuning.chunk_size < 0 {
            return Err(EngineError::Config(format!(
                "chunk_size must not be negative (got {})",
                self.tuning.chunk_size
            )));
        }

        if let Some(root) = &self.paths.system_root {
            if !root.is_absolute() {
                return Err(EngineError::Config(format!(
                    "system_root must be absolute: {}",
                    root.display()
                )));
            }
        }

        for pattern in &self.tuning.exclude_patterns {
            validate_pattern(pattern).map_err(|e| {
                EngineError::Config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }

        if self.tuning.datastore_concurrency == 0 {
            return Err(EngineError::Config(
                "datastore_concurrency must be at least 1".into(),
            ));
        }
        if self.tuning.pvesh_timeout_secs == 0 {
            return Err(EngineError::Config(
                "pvesh_timeout_secs must be at least 1".into(),
            ));
        }

        if self.encryption.enabled {
            if self.encryption.recipients.is_empty() {
                return Err(EngineError::Config(
                    "encryption is enabled but no recipients are configured".into(),
                ));
            }
            self.encryption.parse_recipients()?;
        }

        Ok(())
    }

    /// Resolve an absolute host path under `system_root`.
    pub fn root_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.paths.system_root {
            Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
            None => path.to_path_buf(),
        }
    }

    pub fn system_root(&self) -> &Path {
        self.paths
            .system_root
            .as_deref()
            .unwrap_or_else(|| Path::new("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.tuning.datastore_concurrency, 3);
        assert_eq!(config.tuning.pvesh_timeout_secs, 15);
        assert!(!config.features.backup_ssl_keys);
        assert!(!config.features.backup_pxar_listings);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [features]
            backup_user_configs = false

            [tuning]
            compression = "zstd"
            compression_mode = "ultra"
            exclude_patterns = ["**/*.log", "tmp?"]

            [paths]
            system_root = "/srv/fixture"
            "#,
        )
        .unwrap();

        assert!(!config.features.backup_user_configs);
        assert!(config.features.backup_datastore_configs);
        assert_eq!(config.tuning.compression, CompressionAlgorithm::Zstd);
        assert_eq!(config.tuning.compression_mode, CompressionMode::Ultra);
        assert_eq!(config.paths.pbs_config_root, PathBuf::from("/etc/proxmox-backup"));
        config.validate().unwrap();
    }

    #[test]
    fn test_no_feature_enabled_is_rejected() {
        let mut config = Config::default();
        config.features = toml::from_str(
            r#"
            backup_pve_configs = false
            backup_vm_configs = false
            backup_pve_firewall = false
            backup_cluster_config = false
            backup_pve_jobs = false
            backup_pbs_configs = false
            backup_datastore_configs = false
            backup_user_configs = false
            backup_remote_configs = false
            backup_sync_jobs = false
            backup_verify_jobs = false
            backup_prune_jobs = false
            backup_tape_configs = false
            backup_datastore_namespaces = false
            backup_pxar_metadata = false
            backup_user_tokens = false
            backup_network_configs = false
            backup_cron = false
            backup_apt_sources = false
            backup_system_configs = false
            backup_hardware_info = false
            backup_zfs_info = false
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.tuning.max_file_size = -1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.paths.system_root = Some(PathBuf::from("relative/root"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tuning.exclude_patterns = vec!["[abc".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tuning.datastore_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encryption_without_recipients_is_rejected() {
        let mut config = Config::default();
        config.encryption.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no recipients"));

        config.encryption.recipients = vec!["not-a-key".to_string()];
        assert!(config.validate().is_err());

        let identity = age::x25519::Identity::generate();
        config.encryption.recipients = vec![identity.to_public().to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_recipients_ignored_when_encryption_disabled() {
        let mut config = Config::default();
        config.encryption.recipients = vec!["garbage".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_root_path() {
        let mut config = Config::default();
        assert_eq!(config.root_path("/etc/pve"), PathBuf::from("/etc/pve"));

        config.paths.system_root = Some(PathBuf::from("/tmp/fixture"));
        assert_eq!(
            config.root_path("/etc/pve/user.cfg"),
            PathBuf::from("/tmp/fixture/etc/pve/user.cfg")
        );
    }

    #[test]
    fn test_intra_concurrency_defaults() {
        let tuning = TuningConfig::default();
        assert_eq!(tuning.intra_concurrency_for(true), 4);
        assert_eq!(tuning.intra_concurrency_for(false), 1);
        assert_eq!(tuning.chunk_threshold(), None);
    }

    #[test]
    fn test_algorithm_parsing_and_extensions() {
        assert_eq!("ZSTD".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Zstd);
        assert!("rar".parse::<CompressionAlgorithm>().is_err());
        assert_eq!(CompressionAlgorithm::Pigz.extension(), ".tar.gz");
        assert_eq!(CompressionAlgorithm::None.extension(), ".tar");
        assert_eq!(CompressionAlgorithm::Gzip.binary(), None);
        assert_eq!(CompressionAlgorithm::Lzma.binary(), Some("lzma"));
    }
}
