//! Reader for archive `.metadata` sidecars.
//!
//! New archives carry the JSON manifest. Older archives carry a line-based
//! `KEY=VALUE` file, which is still accepted when inspecting them.

use super::manifest::{Manifest, ProxmoxType};
use crate::archive::{checksum::sidecar, AGE_SUFFIX, METADATA_SUFFIX};
use crate::config::CompressionAlgorithm;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

const LEGACY_REQUIRED: [&str; 5] = [
    "COMPRESSION_TYPE",
    "COMPRESSION_LEVEL",
    "PROXMOX_TYPE",
    "HOSTNAME",
    "SCRIPT_VERSION",
];

/// Summary of a previously written archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    pub hostname: String,
    pub proxmox_type: ProxmoxType,
    pub compression: Option<CompressionAlgorithm>,
    pub compression_level: Option<i32>,
    /// `age` or `plain`
    pub encryption: String,
    pub created_at: Option<DateTime<Utc>>,
    pub script_version: Option<String>,
    /// Present when the sidecar is a JSON manifest
    pub manifest: Option<Manifest>,
}

fn parse_type(value: &str) -> ProxmoxType {
    match value.trim().to_ascii_lowercase().as_str() {
        "pve" => ProxmoxType::Pve,
        "pbs" => ProxmoxType::Pbs,
        _ => ProxmoxType::Unknown,
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn from_manifest(manifest: Manifest) -> ArchiveInfo {
    let compression = manifest
        .compression
        .as_ref()
        .and_then(|c| c.effective.parse().ok());
    ArchiveInfo {
        hostname: manifest.hostname.clone(),
        proxmox_type: manifest.proxmox_type,
        compression,
        compression_level: manifest.compression.as_ref().map(|c| c.level),
        encryption: manifest.encryption.clone(),
        created_at: Some(manifest.created_at),
        script_version: None,
        manifest: Some(manifest),
    }
}

fn from_legacy(text: &str) -> Result<ArchiveInfo> {
    let values: HashMap<&str, &str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim(), unquote(v)))
        .collect();

    if let Some(missing) = LEGACY_REQUIRED.iter().find(|k| !values.contains_key(*k)) {
        return Err(EngineError::Verification(format!(
            "legacy metadata is missing {}",
            missing
        )));
    }

    Ok(ArchiveInfo {
        hostname: values["HOSTNAME"].to_string(),
        proxmox_type: parse_type(values["PROXMOX_TYPE"]),
        compression: values["COMPRESSION_TYPE"].parse().ok(),
        compression_level: values["COMPRESSION_LEVEL"].parse().ok(),
        encryption: values
            .get("ENCRYPTION_MODE")
            .filter(|v| !v.is_empty())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_else(|| "plain".to_string()),
        created_at: None,
        script_version: Some(values["SCRIPT_VERSION"].to_string()),
        manifest: None,
    })
}

/// Parse sidecar content; `archive_name` decides the `.age` override.
pub fn parse_archive_info(content: &str, archive_name: &str) -> Result<ArchiveInfo> {
    let mut info = if content.trim_start().starts_with('{') {
        from_manifest(serde_json::from_str(content)?)
    } else {
        from_legacy(content)?
    };
    if archive_name.ends_with(AGE_SUFFIX) {
        info.encryption = "age".to_string();
    }
    Ok(info)
}

/// Read `<archive>.metadata`.
pub fn read_archive_info(archive: &Path) -> Result<ArchiveInfo> {
    let content = std::fs::read_to_string(sidecar(archive, METADATA_SUFFIX))?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_archive_info(&content, &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::CompressionInfo;
    use tempfile::TempDir;

    const LEGACY: &str = "\
# legacy sidecar
COMPRESSION_TYPE=xz
COMPRESSION_LEVEL=9
PROXMOX_TYPE=pve
HOSTNAME=\"pve01\"
SCRIPT_VERSION=0.9.2
";

    #[test]
    fn test_legacy_defaults_to_plain() -> Result<()> {
        let info = parse_archive_info(LEGACY, "pve01-pve-backup-20240501-030405.tar.xz")?;
        assert_eq!(info.hostname, "pve01");
        assert_eq!(info.proxmox_type, ProxmoxType::Pve);
        assert_eq!(info.compression, Some(CompressionAlgorithm::Xz));
        assert_eq!(info.compression_level, Some(9));
        assert_eq!(info.script_version.as_deref(), Some("0.9.2"));
        assert_eq!(info.encryption, "plain");
        Ok(())
    }

    #[test]
    fn test_age_suffix_overrides_mode() -> Result<()> {
        let text = format!("{}ENCRYPTION_MODE=plain\n", LEGACY);
        let info = parse_archive_info(&text, "pve01-pve-backup.tar.xz.age")?;
        assert_eq!(info.encryption, "age");
        Ok(())
    }

    #[test]
    fn test_legacy_missing_key() {
        let err = parse_archive_info("HOSTNAME=pve01\n", "x.tar").unwrap_err();
        assert!(err.to_string().contains("COMPRESSION_TYPE"));
    }

    #[test]
    fn test_reads_json_sidecar() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("pbs01-pbs-backup-20240501-030405.tar.zst");
        let mut manifest = Manifest::new(Utc::now(), "pbs01", ProxmoxType::Pbs);
        manifest.compression = Some(CompressionInfo {
            requested: "zstd".to_string(),
            effective: "zstd".to_string(),
            level: 3,
        });
        manifest.write_to(&dir.path().join("pbs01-pbs-backup-20240501-030405.tar.zst.metadata"))?;

        let info = read_archive_info(&archive)?;
        assert_eq!(info.hostname, "pbs01");
        assert_eq!(info.proxmox_type, ProxmoxType::Pbs);
        assert_eq!(info.compression, Some(CompressionAlgorithm::Zstd));
        assert_eq!(info.compression_level, Some(3));
        assert_eq!(info.encryption, "plain");
        assert_eq!(info.manifest, Some(manifest));
        Ok(())
    }
}
