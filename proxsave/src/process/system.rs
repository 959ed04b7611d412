//! [`CommandRunner`] backed by real processes.

use super::{CommandOutput, CommandRunner, RunOptions};
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs commands with `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so abandoning the wait on
/// cancellation or timeout delivers SIGKILL.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        name: &str,
        args: &[String],
        options: &RunOptions,
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        debug!("Running: {} {}", name, args.join(" "));

        let mut cmd = Command::new(name);
        cmd.args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| EngineError::CommandSpawn {
            command: name.to_string(),
            source,
        })?;

        let wait = child.wait_with_output();
        let output = match options.timeout {
            Some(limit) => {
                tokio::select! {
                    result = tokio::time::timeout(limit, wait) => match result {
                        Ok(output) => output?,
                        Err(_) => {
                            return Err(EngineError::Timeout {
                                command: name.to_string(),
                                secs: limit.as_secs(),
                            })
                        }
                    },
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
            None => {
                tokio::select! {
                    result = wait => result?,
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                }
            }
        };

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: exit_code(&output.status),
        })
    }
}

/// Exit code, or 128 + signal number for signalled children.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
