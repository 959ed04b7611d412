//! Archive assembly.
//!
//! The staging tree is streamed as PAX tar through the compressor into the
//! output sink:
//!
//! ```text
//! tar worker -> compressor (in-process gzip or external child) -> [age] -> file
//! ```
//!
//! External compressors read the tar stream from a pipe fed by a dedicated
//! worker thread while this thread copies the child's stdout into the sink.

pub mod checksum;
pub mod compression;
pub mod sink;
pub mod tar_stream;
pub mod verify;

use crate::config::CompressionAlgorithm;
use crate::executor::manifest::{Manifest, ProxmoxType};
use crate::process::CommandRunner;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Local};
use compression::CompressionPlan;
use flate2::write::GzEncoder;
use flate2::Compression;
use sink::ArchiveSink;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tar_stream::{write_tar, TarSummary};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const METADATA_SUFFIX: &str = ".metadata";
pub const AGE_SUFFIX: &str = ".age";

/// `<hostname>-<type>-backup-<YYYYMMDD-HHMMSS><ext>[.age]`
pub fn archive_file_name(
    hostname: &str,
    proxmox_type: ProxmoxType,
    at: DateTime<Local>,
    effective: CompressionAlgorithm,
    encrypted: bool,
) -> String {
    let mut name = format!(
        "{}-{}-backup-{}{}",
        hostname,
        proxmox_type,
        at.format("%Y%m%d-%H%M%S"),
        effective.extension()
    );
    if encrypted {
        name.push_str(AGE_SUFFIX);
    }
    name
}

/// What to archive and where.
#[derive(Clone)]
pub struct ArchiveRequest {
    pub staging: PathBuf,
    pub output: PathBuf,
    pub plan: CompressionPlan,
    pub recipients: Vec<age::x25519::Recipient>,
}

/// A finished, verified archive.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub checksum_path: PathBuf,
    pub metadata_path: PathBuf,
    pub entries: u64,
}

/// Failure of the build step, telling the caller whether verification ran.
#[derive(Debug)]
pub struct ArchiveFailure {
    pub error: EngineError,
    pub verification_failed: bool,
}

impl From<EngineError> for ArchiveFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            verification_failed: false,
        }
    }
}

fn cancelled_or(cancel: &CancellationToken, err: io::Error) -> EngineError {
    if cancel.is_cancelled() {
        EngineError::Cancelled
    } else {
        EngineError::Io(err)
    }
}

/// Keep the first error; a later finalization error only gets logged.
fn finish_sink(sink: ArchiveSink, earlier: Result<()>) -> Result<()> {
    let finished = sink.finish();
    match (earlier, finished) {
        (Err(e), Err(fin)) => {
            warn!("Ignoring archive finalization error after failure: {}", fin);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), result) => result,
    }
}

fn gzip_into(
    staging: &Path,
    sink: &mut ArchiveSink,
    level: i32,
    cancel: &CancellationToken,
) -> Result<TarSummary> {
    let level = u32::try_from(level).unwrap_or(6);
    let encoder = GzEncoder::new(sink, Compression::new(level));
    let (encoder, summary) =
        write_tar(staging, encoder, Some(cancel)).map_err(|e| cancelled_or(cancel, e))?;
    encoder.finish()?;
    Ok(summary)
}

fn plain_into(
    staging: &Path,
    sink: &mut ArchiveSink,
    cancel: &CancellationToken,
) -> Result<TarSummary> {
    let (_, summary) =
        write_tar(staging, &mut *sink, Some(cancel)).map_err(|e| cancelled_or(cancel, e))?;
    Ok(summary)
}

/// Run the external compressor with the tar stream on its stdin.
fn pipe_through(
    program: &Path,
    plan: &CompressionPlan,
    staging: &Path,
    sink: &mut ArchiveSink,
    cancel: &CancellationToken,
) -> Result<TarSummary> {
    let algorithm = plan.effective.as_str();
    let args = plan.args();
    info!("Compressing with {} {}", program.display(), args.join(" "));

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::CommandSpawn {
            command: program.display().to_string(),
            source: e,
        })?;

    let (Some(stdin), Some(mut stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(EngineError::Compressor {
            algorithm: algorithm.to_string(),
            message: "child pipes unavailable".to_string(),
        });
    };

    let tag = algorithm.to_uppercase();
    let (tar_result, copy_result) = std::thread::scope(|scope| {
        let tar_worker = scope.spawn(move || {
            // Dropping stdin on return closes the pipe, on success and on error
            let mut stdin = stdin;
            write_tar(staging, &mut stdin, Some(cancel)).map(|(_, summary)| summary)
        });
        scope.spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                info!("[{}] {}", tag, line);
            }
        });

        let copied = io::copy(&mut stdout, &mut *sink);
        if copied.is_err() {
            // Unblocks the tar worker if it is stuck on a full pipe
            let _ = child.kill();
        }
        let tar_result = tar_worker
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("tar worker panicked")));
        (tar_result, copied)
    });

    let compressor_failed = |status: std::process::ExitStatus| EngineError::Compressor {
        algorithm: algorithm.to_string(),
        message: format!("exited with {}", status),
    };

    let summary = match tar_result {
        Ok(summary) => summary,
        Err(e) => {
            let _ = child.kill();
            let status = child.wait();
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            // A child that died on its own closes the pipe under the worker
            if let Ok(status) = status {
                if status.code().is_some_and(|code| code != 0) {
                    return Err(compressor_failed(status));
                }
            }
            return Err(EngineError::Io(e));
        }
    };
    if let Err(e) = copy_result {
        let _ = child.wait();
        return Err(EngineError::Io(e));
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(compressor_failed(status));
    }
    Ok(summary)
}

/// Write the archive file; blocking.
pub fn build_archive(request: &ArchiveRequest, cancel: &CancellationToken) -> Result<TarSummary> {
    let mut sink = ArchiveSink::create(&request.output, &request.recipients)?;
    let plan = &request.plan;

    let result = match (plan.effective, &plan.program) {
        (CompressionAlgorithm::None, _) => plain_into(&request.staging, &mut sink, cancel),
        (_, Some(program)) => pipe_through(program, plan, &request.staging, &mut sink, cancel),
        (_, None) => gzip_into(&request.staging, &mut sink, plan.level, cancel),
    };

    match result {
        Ok(summary) => finish_sink(sink, Ok(())).map(|()| summary),
        Err(e) => finish_sink(sink, Err(e)).map(|()| TarSummary::default()),
    }
}

/// Builds, verifies and checksums archives.
pub struct Archiver {
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl Archiver {
    pub fn new(runner: Arc<dyn CommandRunner>, cancel: CancellationToken) -> Self {
        Self { runner, cancel }
    }

    /// Produce the archive plus its `.sha256` and `.metadata` sidecars.
    ///
    /// Partial output is left for the caller to remove; after a
    /// verification failure the archive is kept for inspection.
    pub async fn create(
        &self,
        request: &ArchiveRequest,
        manifest: &Manifest,
    ) -> std::result::Result<ArchiveOutcome, ArchiveFailure> {
        let encrypted = !request.recipients.is_empty();
        info!(
            "Creating archive {} ({}{})",
            request.output.display(),
            request.plan.effective,
            if encrypted { ", age encrypted" } else { "" }
        );

        let blocking_request = request.clone();
        let token = self.cancel.clone();
        let summary = tokio::task::spawn_blocking(move || build_archive(&blocking_request, &token))
            .await
            .map_err(|e| EngineError::Io(io::Error::other(e)))??;

        if let Err(error) = verify::verify_archive(
            self.runner.as_ref(),
            &self.cancel,
            &request.output,
            &request.plan,
            encrypted,
        )
        .await
        {
            return Err(ArchiveFailure {
                error,
                verification_failed: true,
            });
        }

        let (checksum_path, sha256) = checksum::write_checksum(&request.output)?;
        let metadata_path = checksum::sidecar(&request.output, METADATA_SUFFIX);
        manifest.write_to(&metadata_path)?;

        let size = std::fs::metadata(&request.output)
            .map_err(EngineError::from)?
            .len();
        info!(
            "Archive {} ready: {} entries, {} bytes, sha256 {}",
            request.output.display(),
            summary.entries,
            size,
            sha256
        );

        Ok(ArchiveOutcome {
            path: request.output.clone(),
            size,
            sha256,
            checksum_path,
            metadata_path,
            entries: summary.entries,
        })
    }
}
