//! Output file sink, optionally wrapped in age encryption.

use crate::utils::{EngineError, Result};
use age::stream::StreamWriter;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Permissions of the finished archive.
pub const ARCHIVE_MODE: u32 = 0o640;

/// Final stage of the archive pipeline.
pub enum ArchiveSink {
    Plain(BufWriter<File>),
    Encrypted(StreamWriter<BufWriter<File>>),
}

impl ArchiveSink {
    /// Create (or truncate) `path` with mode 0640. With recipients the
    /// file receives an age stream addressed to all of them.
    pub fn create(path: &Path, recipients: &[age::x25519::Recipient]) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(ARCHIVE_MODE)
            .open(path)?;
        let out = BufWriter::new(file);

        if recipients.is_empty() {
            return Ok(ArchiveSink::Plain(out));
        }

        let encryptor =
            age::Encryptor::with_recipients(recipients.iter().map(|r| r as &dyn age::Recipient))
                .map_err(|e| EngineError::Encryption(format!("Failed to create encryptor: {}", e)))?;
        let writer = encryptor
            .wrap_output(out)
            .map_err(|e| EngineError::Encryption(format!("Failed to start age stream: {}", e)))?;
        Ok(ArchiveSink::Encrypted(writer))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, ArchiveSink::Encrypted(_))
    }

    /// Finalize encryption, flush and sync the file.
    pub fn finish(self) -> Result<()> {
        let out = match self {
            ArchiveSink::Plain(out) => out,
            ArchiveSink::Encrypted(writer) => writer
                .finish()
                .map_err(|e| EngineError::Encryption(format!("Failed to finalize age stream: {}", e)))?,
        };
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveSink::Plain(out) => out.write(buf),
            ArchiveSink::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveSink::Plain(out) => out.flush(),
            ArchiveSink::Encrypted(writer) => writer.flush(),
        }
    }
}
