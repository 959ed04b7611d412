//! SHA-256 sidecar (`<archive>.sha256`).

use crate::utils::{EngineError, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Path with `suffix` appended to the file name.
pub fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Hash `archive` and write `<hex>  <basename>\n` next to it.
pub fn write_checksum(archive: &Path) -> Result<(PathBuf, String)> {
    let digest = sha256_file(archive)?;
    let path = sidecar(archive, CHECKSUM_SUFFIX);
    std::fs::write(&path, format!("{}  {}\n", digest, basename(archive)))?;
    Ok((path, digest))
}

/// Compare `archive` against its sidecar.
pub fn verify_checksum(archive: &Path) -> Result<()> {
    let content = std::fs::read_to_string(sidecar(archive, CHECKSUM_SUFFIX))?;
    let expected = content
        .split_whitespace()
        .next()
        .ok_or_else(|| EngineError::Verification("empty checksum file".to_string()))?;
    let actual = sha256_file(archive)?;
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(EngineError::Verification(format!(
            "checksum mismatch for {}: expected {}, got {}",
            archive.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_format() -> Result<()> {
        let dir = TempDir::new()?;
        let archive = dir.path().join("backup.tar");
        std::fs::write(&archive, b"hello")?;

        let (path, digest) = write_checksum(&archive)?;
        assert_eq!(path, dir.path().join("backup.tar.sha256"));
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            std::fs::read_to_string(&path)?,
            format!("{}  backup.tar\n", digest)
        );
        verify_checksum(&archive)?;

        std::fs::write(&archive, b"tampered")?;
        assert!(matches!(
            verify_checksum(&archive),
            Err(EngineError::Verification(_))
        ));
        Ok(())
    }
}
