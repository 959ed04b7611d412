//! Large-file chunking for the staging tree.
//!
//! A file above the size threshold is split into fixed-size chunks stored in
//! a sibling `<name>.chunks/` directory as `<name>.<index>.chunk` (1-based,
//! zero-padded to four digits). The original is replaced by a JSON sidecar
//! `<name>.chunked` describing how to put it back together.

use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{walk_directory_with_callback, WalkOptions};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CHUNK_FORMAT_VERSION: u32 = 1;
pub const SIDECAR_SUFFIX: &str = ".chunked";
pub const CHUNK_DIR_SUFFIX: &str = ".chunks";
pub const CHUNK_SUFFIX: &str = ".chunk";

/// Contents of a `.chunked` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedFile {
    pub version: u32,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_ns: i64,
    /// Hex SHA-256 of the original content
    pub sha256: String,
}

/// Totals from one [`chunk_tree`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    pub files: u64,
    pub chunks: u64,
    pub bytes: u64,
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::Chunk(format!("{} has no file name", path.display())))
}

fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    Ok(path.with_file_name(format!("{}{}", file_name(path)?, suffix)))
}

pub fn sidecar_path(original: &Path) -> Result<PathBuf> {
    sibling(original, SIDECAR_SUFFIX)
}

pub fn chunk_dir(original: &Path) -> Result<PathBuf> {
    sibling(original, CHUNK_DIR_SUFFIX)
}

pub fn chunk_name(basename: &str, index: u64) -> String {
    format!("{}.{:04}{}", basename, index, CHUNK_SUFFIX)
}

/// Index encoded in a chunk file name, if it belongs to `basename`.
pub fn parse_chunk_index(name: &str, basename: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(basename)?
        .strip_prefix('.')?
        .strip_suffix(CHUNK_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Chunks of `basename` in `dir`, sorted by numeric index.
pub fn discover_chunks(dir: &Path, basename: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut chunks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = parse_chunk_index(&name, basename) {
            chunks.push((index, entry.path()));
        }
    }
    chunks.sort_by_key(|(index, _)| *index);
    Ok(chunks)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read until `buf` is full or EOF; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Chunks and the directory holding them are private; the original mode
/// lives in the sidecar and comes back on reassembly.
const CHUNK_MODE: u32 = 0o600;
const CHUNK_DIR_MODE: u32 = 0o700;

/// Create an empty chunk directory, replacing any stale one.
fn fresh_chunk_dir(dir: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dir)?,
        Ok(_) => fs::remove_file(dir)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    DirBuilder::new().mode(CHUNK_DIR_MODE).create(dir)
}

fn create_chunk(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(CHUNK_MODE)
        .open(path)
}

/// Stream `path` into numbered chunks under `dir`.
///
/// Returns the chunk count, the total size and the hex SHA-256.
fn write_chunks(path: &Path, dir: &Path, basename: &str, chunk_size: u64) -> io::Result<(u64, u64, String)> {
    let mut source = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.min(8 * 1024 * 1024) as usize];
    let mut count = 0u64;
    let mut total = 0u64;

    loop {
        let mut chunk_bytes = 0u64;
        let mut out: Option<File> = None;
        while chunk_bytes < chunk_size {
            let want = (chunk_size - chunk_bytes).min(buf.len() as u64) as usize;
            let n = read_full(&mut source, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            if out.is_none() {
                count += 1;
                out = Some(create_chunk(&dir.join(chunk_name(basename, count)))?);
            }
            if let Some(file) = out.as_mut() {
                file.write_all(&buf[..n])?;
            }
            hasher.update(&buf[..n]);
            chunk_bytes += n as u64;
        }
        total += chunk_bytes;
        if let Some(mut file) = out {
            file.flush()?;
        }
        if chunk_bytes < chunk_size {
            break;
        }
    }

    Ok((count, total, format!("{:x}", hasher.finalize())))
}

/// Split `path` into chunks of `chunk_size` bytes and replace it with a sidecar.
///
/// On failure the chunk directory is removed and the original stays in place.
pub fn chunk_file(path: &Path, chunk_size: u64) -> Result<ChunkedFile> {
    if chunk_size == 0 {
        return Err(EngineError::Chunk("chunk size must be positive".into()));
    }
    let meta = FileMetadata::from_path(path)?;
    let basename = file_name(path)?;
    let dir = chunk_dir(path)?;
    fresh_chunk_dir(&dir)?;

    let written = write_chunks(path, &dir, &basename, chunk_size)
        .map_err(EngineError::from)
        .and_then(|(count, total, sha256)| {
            let chunked = ChunkedFile {
                version: CHUNK_FORMAT_VERSION,
                total_size: total,
                chunk_size,
                chunk_count: count,
                mode: meta.mode,
                uid: meta.uid,
                gid: meta.gid,
                mtime_ns: meta.mtime_ns,
                sha256,
            };
            write_atomic(&sidecar_path(path)?, &serde_json::to_vec_pretty(&chunked)?)?;
            Ok(chunked)
        });

    let chunked = match written {
        Ok(chunked) => chunked,
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove partial chunks {}: {}", dir.display(), cleanup);
            }
            return Err(e);
        }
    };

    fs::remove_file(path)?;
    debug!("Chunked {} into {} chunk(s)", path.display(), chunked.chunk_count);
    Ok(chunked)
}

/// Chunk every regular file under `root` larger than `threshold` bytes.
pub fn chunk_tree(
    root: &Path,
    threshold: u64,
    chunk_size: u64,
    cancel: Option<CancellationToken>,
) -> Result<ChunkSummary> {
    let mut large = Vec::new();
    let options = WalkOptions {
        cancel: cancel.clone(),
        ..Default::default()
    };
    walk_directory_with_callback(root, options, |info| {
        if !info.is_symlink && !info.is_dir && info.size > threshold {
            large.push((info.path.clone(), info.size));
        }
        Ok(())
    })
    .map_err(|e| match e.kind() {
        io::ErrorKind::Interrupted => EngineError::Cancelled,
        _ => EngineError::Io(e),
    })?;

    let mut summary = ChunkSummary::default();
    for (path, size) in large {
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(EngineError::Cancelled);
        }
        let chunked = chunk_file(&path, chunk_size)?;
        summary.files += 1;
        summary.chunks += chunked.chunk_count;
        summary.bytes += size;
    }

    if summary.files > 0 {
        info!(
            "Chunked {} file(s) into {} chunk(s), {} bytes",
            summary.files, summary.chunks, summary.bytes
        );
    }
    Ok(summary)
}

/// Rebuild the original file described by `sidecar`.
///
/// Every check happens before anything is written at the original path: on
/// failure the sidecar and chunks are left untouched.
pub fn reassemble(sidecar: &Path) -> Result<PathBuf> {
    let name = file_name(sidecar)?;
    let basename = name
        .strip_suffix(SIDECAR_SUFFIX)
        .ok_or_else(|| EngineError::Chunk(format!("{} is not a sidecar", sidecar.display())))?
        .to_string();
    let original = sidecar.with_file_name(&basename);
    let info: ChunkedFile = serde_json::from_slice(&fs::read(sidecar)?)?;
    if info.version != CHUNK_FORMAT_VERSION {
        return Err(EngineError::Chunk(format!(
            "unsupported chunk format version {}",
            info.version
        )));
    }

    let dir = chunk_dir(&original)?;
    let chunks = discover_chunks(&dir, &basename)?;
    if chunks.len() as u64 != info.chunk_count {
        return Err(EngineError::Chunk(format!(
            "{}: expected {} chunk(s), found {}",
            original.display(),
            info.chunk_count,
            chunks.len()
        )));
    }
    for (expected, (index, _)) in (1u64..).zip(&chunks) {
        if *index != expected {
            return Err(EngineError::Chunk(format!(
                "{}: chunk {} missing",
                original.display(),
                expected
            )));
        }
    }

    let parent = original.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; 1024 * 1024];
    for (_, chunk) in &chunks {
        let mut reader = File::open(chunk)?;
        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
    tmp.flush()?;

    let digest = format!("{:x}", hasher.finalize());
    if total != info.total_size || digest != info.sha256 {
        return Err(EngineError::Chunk(format!(
            "{}: reassembled content does not match (size {} vs {}, sha256 {} vs {})",
            original.display(),
            total,
            info.total_size,
            digest,
            info.sha256
        )));
    }

    let meta = FileMetadata {
        size: info.total_size,
        mode: info.mode,
        uid: info.uid,
        gid: info.gid,
        atime_ns: info.mtime_ns,
        mtime_ns: info.mtime_ns,
        ctime_ns: info.mtime_ns,
        is_dir: false,
        is_symlink: false,
    };
    meta.apply_to_file(tmp.as_file())?;
    tmp.persist(&original).map_err(|e| e.error)?;

    fs::remove_file(sidecar)?;
    fs::remove_dir_all(&dir)?;
    Ok(original)
}

/// Reassemble every sidecar under `root`.
pub fn reassemble_tree(root: &Path) -> Result<Vec<PathBuf>> {
    let mut sidecars = Vec::new();
    walk_directory_with_callback(root, WalkOptions::default(), |info| {
        if !info.is_dir && info.path.to_string_lossy().ends_with(SIDECAR_SUFFIX) {
            sidecars.push(info.path.clone());
        }
        Ok(())
    })?;
    sidecars.iter().map(|s| reassemble(s)).collect()
}
