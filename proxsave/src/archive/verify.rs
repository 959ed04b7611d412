//! Post-archival integrity checks.

use super::compression::CompressionPlan;
use crate::config::CompressionAlgorithm;
use crate::process::CommandRunner;
use crate::utils::{summarize_output, EngineError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tool invocation that checks an archive of the given algorithm.
fn check_command(algorithm: CompressionAlgorithm, archive: &str) -> (&'static str, Vec<String>) {
    let archive = archive.to_string();
    match algorithm {
        CompressionAlgorithm::None => ("tar", vec!["-tf".to_string(), archive]),
        CompressionAlgorithm::Gzip => ("tar", vec!["-tzf".to_string(), archive]),
        CompressionAlgorithm::Pigz => ("pigz", vec!["--test".to_string(), archive]),
        CompressionAlgorithm::Bzip2 => ("bzip2", vec!["--test".to_string(), archive]),
        CompressionAlgorithm::Xz => ("xz", vec!["--test".to_string(), archive]),
        CompressionAlgorithm::Lzma => ("lzma", vec!["--test".to_string(), archive]),
        CompressionAlgorithm::Zstd => ("zstd", vec!["--test".to_string(), "-q".to_string(), archive]),
    }
}

/// Read every entry of a plain or gzip tar without an external tool.
fn list_in_process(path: &Path, gzip: bool) -> std::io::Result<u64> {
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        std::io::copy(&mut entry, &mut std::io::sink())?;
        count += 1;
    }
    Ok(count)
}

/// Check the finished archive.
///
/// Encrypted archives only get an existence and size check since nothing
/// can be read without the identity.
pub async fn verify_archive(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    path: &Path,
    plan: &CompressionPlan,
    encrypted: bool,
) -> Result<()> {
    let size = std::fs::metadata(path)
        .map_err(|e| EngineError::Verification(format!("{}: {}", path.display(), e)))?
        .len();
    if size == 0 {
        return Err(EngineError::Verification(format!(
            "{} is empty",
            path.display()
        )));
    }
    if encrypted {
        debug!("Encrypted archive {} has {} bytes", path.display(), size);
        return Ok(());
    }

    let (tool, args) = check_command(plan.effective, &path.to_string_lossy());
    if runner.locate(tool).is_none() {
        return match plan.effective {
            CompressionAlgorithm::None | CompressionAlgorithm::Gzip => {
                let gzip = plan.effective == CompressionAlgorithm::Gzip;
                let owned = path.to_path_buf();
                let entries = tokio::task::spawn_blocking(move || list_in_process(&owned, gzip))
                    .await
                    .map_err(|e| EngineError::Verification(e.to_string()))?
                    .map_err(|e| EngineError::Verification(e.to_string()))?;
                info!("Archive verified in-process ({} entries)", entries);
                Ok(())
            }
            _ => {
                warn!("{} not available, skipping archive verification", tool);
                Ok(())
            }
        };
    }

    let output = runner
        .execute(cancel, tool, &args, &Default::default())
        .await?;
    if !output.success() {
        return Err(EngineError::Verification(format!(
            "{} {} exited with {}: {}",
            tool,
            args.join(" "),
            output.exit_code,
            summarize_output(&output.combined())
        )));
    }
    info!("Archive verified with {} {}", tool, args[0]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionMode;
    use crate::process::fake::FakeRunner;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn plan(algorithm: CompressionAlgorithm) -> CompressionPlan {
        CompressionPlan::new(algorithm, None, CompressionMode::Standard, 0)
    }

    fn gzip_tar(path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_ustar();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "./foo.txt", &b"hello"[..])?;
        builder.into_inner()?.finish()?.flush()
    }

    #[tokio::test]
    async fn test_in_process_gzip_verification() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("backup.tar.gz");
        gzip_tar(&path)?;

        let runner = FakeRunner::new();
        let cancel = CancellationToken::new();
        verify_archive(&runner, &cancel, &path, &plan(CompressionAlgorithm::Gzip), false).await?;

        std::fs::write(&path, b"definitely not gzip")?;
        let err = verify_archive(&runner, &cancel, &path, &plan(CompressionAlgorithm::Gzip), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Verification(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_failure_is_verification_error() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("backup.tar.xz");
        std::fs::write(&path, b"garbage")?;

        let runner = FakeRunner::new();
        runner.respond_any("xz", FakeRunner::fail(1, "xz: File format not recognized"));
        let cancel = CancellationToken::new();
        let err = verify_archive(&runner, &cancel, &path, &plan(CompressionAlgorithm::Xz), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File format not recognized"));
        assert!(runner.was_called("xz --test"));
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_only_checks_size() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("backup.tar.age");
        let runner = FakeRunner::new();
        let cancel = CancellationToken::new();

        std::fs::write(&path, b"")?;
        assert!(verify_archive(&runner, &cancel, &path, &plan(CompressionAlgorithm::None), true)
            .await
            .is_err());

        std::fs::write(&path, b"age-encryption.org/v1\n...")?;
        verify_archive(&runner, &cancel, &path, &plan(CompressionAlgorithm::None), true).await?;
        assert!(runner.calls().is_empty());
        Ok(())
    }
}
