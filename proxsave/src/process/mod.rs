//! External command execution.
//!
//! Every call to a Proxmox CLI or system tool goes through [`CommandRunner`],
//! so collectors never touch `std::process` directly and tests can script
//! results with a fake.

pub mod system;

#[cfg(test)]
pub mod fake;

use crate::privilege::ContainerDetector;
use crate::utils::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use system::SystemRunner;

/// Buffered result of one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }

    pub fn combined_text(&self) -> String {
        String::from_utf8_lossy(&self.combined()).into_owned()
    }
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra environment variables on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Kill the command when it runs longer than this
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            env: Vec::new(),
            timeout: Some(timeout),
        }
    }
}

/// Locates and runs external programs.
///
/// A non-zero exit is not an error here; callers inspect
/// [`CommandOutput::exit_code`]. Errors mean the command could not be run to
/// completion: spawn failure, timeout or cancellation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Resolve `name` on `PATH`.
    fn locate(&self, name: &str) -> Option<PathBuf>;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[String],
        options: &RunOptions,
    ) -> Result<CommandOutput>;

    async fn run(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.execute(cancel, name, &args, &RunOptions::default()).await
    }

    async fn run_with_env(
        &self,
        cancel: &CancellationToken,
        env: &[(String, String)],
        name: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let options = RunOptions {
            env: env.to_vec(),
            timeout: None,
        };
        self.execute(cancel, name, &args, &options).await
    }
}

/// Read-only view of the host file system used for detection.
pub trait HostFs: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
}

/// [`HostFs`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl HostFs for OsFs {
    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// Capabilities handed to the engine at construction time.
#[derive(Clone)]
pub struct Capabilities {
    pub runner: Arc<dyn CommandRunner>,
    pub fs: Arc<dyn HostFs>,
    pub detector: Arc<dyn ContainerDetector>,
}

impl Capabilities {
    /// Production wiring: real processes, real files, `/proc` detection.
    pub fn system() -> Self {
        let fs: Arc<dyn HostFs> = Arc::new(OsFs);
        Self {
            runner: Arc::new(SystemRunner::new()),
            detector: Arc::new(crate::privilege::ProcDetector::new(Arc::clone(&fs))),
            fs,
        }
    }
}

/// Basename of a command, as used for classification and report names.
pub fn command_basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_order() {
        let out = CommandOutput {
            stdout: b"out\n".to_vec(),
            stderr: b"err\n".to_vec(),
            exit_code: 1,
        };
        assert_eq!(out.combined_text(), "out\nerr\n");
        assert!(!out.success());
    }

    #[test]
    fn test_command_basename() {
        assert_eq!(command_basename("/usr/sbin/dmidecode"), "dmidecode");
        assert_eq!(command_basename("blkid"), "blkid");
    }
}
