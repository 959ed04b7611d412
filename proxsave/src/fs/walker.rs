//! Directory traversal over the staging tree.
//!
//! Symlinks are reported as links and never followed. Walks are sorted by
//! file name so two walks of the same tree visit entries in the same order.

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Report directories as well as files and links
    pub include_dirs: bool,

    /// Checked before every entry
    pub cancel: Option<CancellationToken>,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Size in bytes (link itself for symlinks)
    pub size: u64,

    pub is_dir: bool,
    pub is_symlink: bool,

    /// Depth from root
    pub depth: usize,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata().map_err(std::io::Error::from)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            is_symlink: entry.path_is_symlink(),
            depth: entry.depth(),
        })
    }
}

/// Walk a directory tree and collect its entries (the root itself excluded).
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |info| {
        files.push(info.clone());
        Ok(())
    })?;
    Ok(files)
}

/// Walk a directory tree with a callback for each entry.
///
/// The first error from the walk, the callback, or cancellation stops it.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo) -> std::io::Result<()>,
{
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        if let Some(cancel) = &options.cancel {
            if cancel.is_cancelled() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "walk cancelled",
                ));
            }
        }

        let entry = entry.map_err(std::io::Error::from)?;

        if entry.file_type().is_dir() && !options.include_dirs {
            continue;
        }

        let info = FileInfo::from_entry(&entry, root)?;
        callback(&info)?;
    }

    Ok(())
}
