//! File metadata capture and re-application.
//!
//! This module preserves file metadata (permissions, ownership, timestamps)
//! when files are staged, chunked and reassembled.

use nix::unistd::Uid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, FileTimes};
use std::io;
use std::os::unix::fs::{fchown, MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Permission bits plus setuid, setgid and sticky.
pub const MODE_MASK: u32 = 0o7777;

/// Complete file metadata for staging operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Mode bits, masked with [`MODE_MASK`]
    pub mode: u32,

    pub uid: u32,
    pub gid: u32,

    /// Timestamps in nanoseconds since the Unix epoch
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileMetadata {
    /// Extract metadata from a path without following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let mtime_ns = join_ns(metadata.mtime(), metadata.mtime_nsec());
        Self {
            size: metadata.len(),
            mode: metadata.mode() & MODE_MASK,
            uid: metadata.uid(),
            gid: metadata.gid(),
            atime_ns: join_ns(metadata.atime(), metadata.atime_nsec()),
            mtime_ns,
            ctime_ns: join_ns(metadata.ctime(), metadata.ctime_nsec()),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
        }
    }

    /// Apply mode, ownership (when privileged) and timestamps to an open file.
    pub fn apply_to_file(&self, file: &File) -> io::Result<()> {
        file.set_permissions(fs::Permissions::from_mode(self.mode & MODE_MASK))?;

        if has_privilege() {
            fchown(file, Some(self.uid), Some(self.gid))?;
        }

        let times = FileTimes::new()
            .set_accessed(ns_to_system_time(self.atime_ns))
            .set_modified(ns_to_system_time(self.mtime_ns));
        file.set_times(times)?;

        Ok(())
    }

    /// Apply this metadata to a regular file by path
    pub fn apply_to_path(&self, path: &Path) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        self.apply_to_file(&file)
    }
}

/// True when the process can change file ownership.
pub fn has_privilege() -> bool {
    Uid::effective().is_root()
}

fn join_ns(secs: i64, nsec: i64) -> i64 {
    secs.saturating_mul(1_000_000_000).saturating_add(nsec)
}

/// Convert nanoseconds since the epoch to a `SystemTime`.
pub fn ns_to_system_time(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(ns.unsigned_abs())
    }
}

/// Split nanoseconds into whole seconds and the sub-second remainder.
pub fn split_ns(ns: i64) -> (i64, u32) {
    (ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_metadata() -> io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert!(!metadata.is_dir);
        assert!(!metadata.is_symlink);
        assert!(metadata.mtime_ns > 0);

        Ok(())
    }

    #[test]
    fn test_symlink_is_not_followed() -> io::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("target"), b"data")?;
        std::os::unix::fs::symlink("target", dir.path().join("link"))?;

        let metadata = FileMetadata::from_path(&dir.path().join("link"))?;
        assert!(metadata.is_symlink);

        Ok(())
    }

    #[test]
    fn test_apply_mode_and_mtime() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("f");
        fs::write(&path, b"x")?;

        let mut meta = FileMetadata::from_path(&path)?;
        meta.mode = 0o640;
        meta.mtime_ns = 1_600_000_000_123_456_789;
        meta.atime_ns = meta.mtime_ns;
        meta.apply_to_path(&path)?;

        let after = FileMetadata::from_path(&path)?;
        assert_eq!(after.mode, 0o640);
        assert_eq!(after.mtime_ns, 1_600_000_000_123_456_789);

        Ok(())
    }

    #[test]
    fn test_split_ns() {
        assert_eq!(split_ns(1_500_000_000), (1, 500_000_000));
        assert_eq!(split_ns(-1), (-1, 999_999_999));
    }
}
