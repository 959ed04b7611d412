//! Safe file and directory copies into the staging tree.
//!
//! Symlinks are re-created from their target text and never followed.
//! Regular files are created 0600, filled, then given the source's mode,
//! ownership (when privileged) and timestamps. Devices, sockets and FIFOs
//! are skipped. Parent directories are created lazily and each one created
//! is counted once in [`CollectionStats`].

use crate::fs::exclude::{ExcludeSet, MatchRoots};
use crate::fs::metadata::{has_privilege, FileMetadata, MODE_MASK};
use crate::fs::stats::CollectionStats;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{lchown, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a single-file copy did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Regular file copied
    Copied { bytes: u64 },
    /// Symlink re-created pointing at `target`
    Symlink { target: PathBuf },
    /// Device, socket or FIFO left behind
    Unsupported,
}

/// Event reported for each entry visited by [`copy_dir`].
#[derive(Debug)]
pub enum DirCopyEvent {
    Copied {
        source: PathBuf,
        dest: PathBuf,
        outcome: CopyOutcome,
    },
    Excluded {
        source: PathBuf,
        dest: PathBuf,
        pattern: String,
        is_dir: bool,
    },
    Failed {
        source: PathBuf,
        dest: PathBuf,
        error: io::Error,
    },
}

/// Create `dir` and any missing ancestors, counting each one created.
pub fn create_dirs(dir: &Path, stats: &CollectionStats) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        create_dirs(parent, stats)?;
    }
    match fs::create_dir(dir) {
        Ok(()) => {
            stats.dir_created();
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

fn ensure_parent(dest: &Path, stats: &CollectionStats) -> io::Result<()> {
    match dest.parent() {
        Some(parent) => create_dirs(parent, stats),
        None => Ok(()),
    }
}

/// Remove whatever occupies `dest` (file, symlink or directory).
fn clear_destination(dest: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest),
        Ok(_) => fs::remove_file(dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy one file system entry from `source` to `dest`.
///
/// A missing source surfaces as `io::ErrorKind::NotFound`.
pub fn copy_file(source: &Path, dest: &Path, stats: &CollectionStats) -> io::Result<CopyOutcome> {
    let meta = fs::symlink_metadata(source)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(source)?;
        ensure_parent(dest, stats)?;
        clear_destination(dest)?;
        std::os::unix::fs::symlink(&target, dest)?;
        if has_privilege() {
            let info = FileMetadata::from_metadata(&meta);
            lchown(dest, Some(info.uid), Some(info.gid))?;
        }
        return Ok(CopyOutcome::Symlink { target });
    }

    if !file_type.is_file() {
        debug!("Skipping non-regular file {}", source.display());
        return Ok(CopyOutcome::Unsupported);
    }

    ensure_parent(dest, stats)?;
    clear_destination(dest)?;

    let mut reader = fs::File::open(source)?;
    let bytes = fill_new_file(dest, &mut reader, &FileMetadata::from_metadata(&meta))?;
    Ok(CopyOutcome::Copied { bytes })
}

/// Create `dest` at 0600, stream `reader` into it and apply `meta`.
///
/// Any failure after the file exists removes it again.
fn fill_new_file(dest: &Path, reader: &mut impl Read, meta: &FileMetadata) -> io::Result<u64> {
    let mut writer = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dest)?;

    let filled = io::copy(reader, &mut writer).and_then(|bytes| {
        writer.flush()?;
        meta.apply_to_file(&writer)?;
        Ok(bytes)
    });

    if filled.is_err() {
        drop(writer);
        if let Err(e) = fs::remove_file(dest) {
            warn!("Failed to remove partial copy {}: {}", dest.display(), e);
        }
    }
    filled
}

/// Write generated content (command output, JSON reports) into the staging tree.
pub fn write_report(dest: &Path, content: &[u8], stats: &CollectionStats) -> io::Result<u64> {
    ensure_parent(dest, stats)?;
    clear_destination(dest)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o640)
        .open(dest)?;
    file.write_all(content)?;
    file.flush()?;
    Ok(content.len() as u64)
}

/// Exclusion context for [`copy_dir`].
pub struct DirCopyFilter<'a> {
    pub excludes: &'a ExcludeSet,
    pub roots: &'a MatchRoots,
}

/// Recursively copy `source` into `dest`.
///
/// Each entry is checked against the exclusion set in both its source and
/// destination forms; excluded directories are pruned. Per-entry errors are
/// logged and reported through `on_event` without stopping the walk. Only
/// cancellation aborts, as `io::ErrorKind::Interrupted`.
pub fn copy_dir<F>(
    source: &Path,
    dest: &Path,
    filter: &DirCopyFilter<'_>,
    stats: &CollectionStats,
    cancel: &CancellationToken,
    mut on_event: F,
) -> io::Result<()>
where
    F: FnMut(DirCopyEvent),
{
    let mut walker = walkdir::WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "copy cancelled"));
        }

        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                let failed = err.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                warn!("Cannot access {}: {}", failed.display(), err);
                let target = dest.join(failed.strip_prefix(source).unwrap_or(&failed));
                on_event(DirCopyEvent::Failed {
                    source: failed,
                    dest: target,
                    error: io::Error::from(err),
                });
                continue;
            }
        };

        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        let is_dir = entry.file_type().is_dir();

        if entry.depth() > 0 {
            let pattern = filter
                .excludes
                .matching_pattern(entry.path(), filter.roots)
                .or_else(|| filter.excludes.matching_pattern(&target, filter.roots));
            if let Some(pattern) = pattern {
                debug!("Excluded {} (pattern {})", entry.path().display(), pattern);
                if is_dir {
                    walker.skip_current_dir();
                }
                on_event(DirCopyEvent::Excluded {
                    source: entry.path().to_path_buf(),
                    dest: target,
                    pattern: pattern.to_string(),
                    is_dir,
                });
                continue;
            }
        }

        if is_dir {
            let created = create_dirs(&target, stats).and_then(|_| {
                let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
                fs::set_permissions(&target, fs::Permissions::from_mode((mode & MODE_MASK) | 0o700))
            });
            if let Err(error) = created {
                warn!("Cannot create {}: {}", target.display(), error);
                walker.skip_current_dir();
                on_event(DirCopyEvent::Failed {
                    source: entry.path().to_path_buf(),
                    dest: target,
                    error,
                });
            }
            continue;
        }

        match copy_file(entry.path(), &target, stats) {
            Ok(outcome) => on_event(DirCopyEvent::Copied {
                source: entry.path().to_path_buf(),
                dest: target,
                outcome,
            }),
            Err(error) => {
                warn!("Failed to copy {}: {}", entry.path().display(), error);
                on_event(DirCopyEvent::Failed {
                    source: entry.path().to_path_buf(),
                    dest: target,
                    error,
                });
            }
        }
    }

    Ok(())
}
