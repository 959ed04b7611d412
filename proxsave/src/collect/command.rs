//! Command output capture.

use super::{Collector, SourceClass};
use crate::executor::manifest::ManifestEntry;
use crate::process::{command_basename, CommandOutput, RunOptions};
use crate::utils::{summarize_output, EngineError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Overrides the configured command timeout
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn basename(&self) -> &str {
        command_basename(&self.name)
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.args.join(" "))
        }
    }
}

impl Collector {
    /// `pvesh get <path> --output-format=json` with the pvesh timeout.
    pub fn pvesh(&self, path: &str) -> CommandSpec {
        CommandSpec::new("pvesh", &["get", path, "--output-format=json"])
            .with_timeout(Duration::from_secs(self.config().tuning.pvesh_timeout_secs))
    }

    /// Run a command and return its output, without writing anything.
    ///
    /// `Ok(None)` means the program is not installed.
    pub async fn run_command(&self, cmd: &CommandSpec) -> Result<Option<CommandOutput>> {
        self.check_cancelled()?;
        if self.runner().locate(&cmd.name).is_none() {
            return Ok(None);
        }
        let options = RunOptions {
            env: cmd.env.clone(),
            timeout: Some(cmd.timeout.unwrap_or_else(|| {
                Duration::from_secs(self.config().tuning.command_timeout_secs)
            })),
        };
        let output = self
            .runner()
            .execute(self.cancel_token(), &cmd.name, &cmd.args, &options)
            .await?;
        Ok(Some(output))
    }

    /// Run `cmd` once, write stdout to `primary` and mirror it to `mirrors`.
    ///
    /// Paths are relative to the staging root; only `primary` gets a manifest
    /// entry. With `critical` set any failure is returned; otherwise failures
    /// are logged and recorded, and the call succeeds. Returns the captured
    /// stdout when the command succeeded.
    pub async fn collect_command(
        &self,
        class: SourceClass,
        cmd: &CommandSpec,
        primary: &Path,
        mirrors: &[PathBuf],
        critical: bool,
    ) -> Result<Option<Vec<u8>>> {
        let key = self.manifest_key(&self.staging_root().join(primary));

        if let Some((pattern, reason)) = self.excluded_by(&self.staging_root().join(primary)) {
            match reason {
                Some(reason) => self.record(class, &key, ManifestEntry::disabled(reason)),
                None => {
                    crate::skip!("{} excluded by pattern {}", key, pattern);
                    self.record(
                        class,
                        &key,
                        ManifestEntry::skipped(format!("excluded by pattern {}", pattern)),
                    );
                }
            }
            return Ok(None);
        }

        let output = match self.run_command(cmd).await {
            Ok(Some(output)) => output,
            Ok(None) => {
                self.record(class, &key, ManifestEntry::not_found());
                if critical {
                    return Err(EngineError::CommandSpawn {
                        command: cmd.name.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found in PATH"),
                    });
                }
                debug!("{} not installed, skipping {}", cmd.name, key);
                return Ok(None);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                self.record(class, &key, ManifestEntry::failed(e.to_string()));
                if critical {
                    return Err(e);
                }
                warn!("{}: {}", cmd.command_line(), e);
                return Ok(None);
            }
        };

        if !output.success() {
            let summary = summarize_output(&output.combined());

            if !critical {
                if let Some(reason) = self.classifier().downgrade(
                    cmd.basename(),
                    output.exit_code,
                    &output.combined_text(),
                ) {
                    crate::skip!("{}: {}", cmd.command_line(), reason);
                    self.record(class, &key, ManifestEntry::skipped(reason));
                    return Ok(None);
                }
            }

            let error = EngineError::Command {
                command: cmd.command_line(),
                code: output.exit_code,
                summary,
            };
            self.record(class, &key, ManifestEntry::failed(error.to_string()));
            if critical {
                return Err(error);
            }
            warn!("{}", error);
            return Ok(None);
        }

        if self.write_output(class, primary, &output.stdout)? == crate::executor::manifest::FileStatus::Collected {
            for mirror in mirrors {
                let dest = self.staging_root().join(mirror);
                if let Err(e) = crate::fs::copy::write_report(&dest, &output.stdout, self.stats()) {
                    warn!("Failed to mirror {} to {}: {}", key, dest.display(), e);
                }
            }
        }

        Ok(Some(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::executor::manifest::FileStatus;
    use crate::privilege::StaticDetector;
    use crate::process::fake::FakeRunner;

    fn uname() -> CommandSpec {
        CommandSpec::new("uname", &["-a"])
    }

    #[tokio::test]
    async fn test_output_is_mirrored() -> Result<()> {
        let fx = Fixture::new();
        fx.runner.respond("uname -a", FakeRunner::ok("Linux pve01 6.8.12\n"));
        let collector = fx.collector(fx.config());

        let out = collector
            .collect_command(
                SourceClass::System,
                &uname(),
                Path::new("commands/uname.txt"),
                &[PathBuf::from("var/lib/proxsave-info/system/uname.txt")],
                true,
            )
            .await?;

        assert_eq!(out.as_deref(), Some(&b"Linux pve01 6.8.12\n"[..]));
        assert_eq!(std::fs::read(fx.staged("commands/uname.txt"))?, b"Linux pve01 6.8.12\n");
        assert_eq!(
            std::fs::read(fx.staged("var/lib/proxsave-info/system/uname.txt"))?,
            b"Linux pve01 6.8.12\n"
        );
        assert_eq!(collector.stats().snapshot().files_processed, 1);
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_critical_failure_propagates() {
        let fx = Fixture::new();
        fx.runner.respond("uname -a", FakeRunner::fail(1, "uname: broken\n"));
        let collector = fx.collector(fx.config());

        let err = collector
            .collect_command(SourceClass::System, &uname(), Path::new("commands/uname.txt"), &[], true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Command { code: 1, .. }));
        assert_eq!(
            collector.entry(SourceClass::System, "commands/uname.txt").map(|e| e.status),
            Some(FileStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_non_critical_failure_is_recorded() -> Result<()> {
        let fx = Fixture::new();
        fx.runner.respond_any("lspci", FakeRunner::fail(1, "lspci: cannot open\nsecond line\n"));
        let collector = fx.collector(fx.config());

        let out = collector
            .collect_command(
                SourceClass::System,
                &CommandSpec::new("lspci", &["-nn"]),
                Path::new("commands/lspci.txt"),
                &[],
                false,
            )
            .await?;
        assert!(out.is_none());
        let entry = collector.entry(SourceClass::System, "commands/lspci.txt").unwrap();
        assert_eq!(entry.status, FileStatus::Failed);
        assert!(entry.error.unwrap().contains("lspci: cannot open | second line"));
        assert!(!fx.staged("commands/lspci.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_tool_is_not_found() -> Result<()> {
        let fx = Fixture::new();
        let collector = fx.collector(fx.config());
        let out = collector
            .collect_command(
                SourceClass::System,
                &CommandSpec::new("sensors", &[]),
                Path::new("commands/sensors.txt"),
                &[],
                false,
            )
            .await?;
        assert!(out.is_none());
        assert_eq!(
            collector.entry(SourceClass::System, "commands/sensors.txt").map(|e| e.status),
            Some(FileStatus::NotFound)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unprivileged_dmidecode_is_skipped() -> Result<()> {
        let fx = Fixture::new();
        fx.runner
            .respond_any("dmidecode", FakeRunner::fail(1, "/dev/mem: Operation not permitted\n"));
        let collector = fx.collector_with(fx.config(), StaticDetector::unprivileged());

        collector
            .collect_command(
                SourceClass::System,
                &CommandSpec::new("dmidecode", &[]),
                Path::new("commands/dmidecode.txt"),
                &[],
                false,
            )
            .await?;

        let entry = collector.entry(SourceClass::System, "commands/dmidecode.txt").unwrap();
        assert_eq!(entry.status, FileStatus::Skipped);
        assert_eq!(entry.error.as_deref(), Some("DMI tables not accessible"));
        assert!(!fx.staged("commands/dmidecode.txt").exists());
        assert!(!fx.staged("commands").exists());
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_pvesh_carries_timeout() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.tuning.pvesh_timeout_secs = 7;
        let collector = fx.collector(config);
        let spec = collector.pvesh("/nodes");
        assert_eq!(spec.command_line(), "pvesh get /nodes --output-format=json");
        assert_eq!(spec.timeout, Some(Duration::from_secs(7)));
    }
}
