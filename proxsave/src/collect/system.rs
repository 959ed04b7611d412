//! Host system collector shared by PVE and PBS nodes.

use super::command::CommandSpec;
use super::{Collector, SourceClass};
use crate::fs::staging::{COMMANDS_DIR, STATE_DIR};
use crate::utils::Result;
use std::path::{Path, PathBuf};
use tracing::info;

const CLASS: SourceClass = SourceClass::System;

/// One feature-gated group of host paths.
struct PathGroup {
    flag: &'static str,
    enabled: bool,
    files: &'static [&'static str],
    dirs: &'static [&'static str],
}

pub(super) fn command_path(name: &str) -> PathBuf {
    Path::new(COMMANDS_DIR).join(name)
}

pub(super) fn state_path(name: &str) -> PathBuf {
    Path::new(STATE_DIR).join("system").join(name)
}

impl Collector {
    /// Capture system configuration files, the identity commands and the
    /// hardware, network and storage inventories.
    ///
    /// `uname` and `/etc/os-release` are required; everything else is
    /// best effort.
    pub async fn collect_system(&self) -> Result<()> {
        self.begin(CLASS);
        info!("Collecting system configuration");

        self.collect_command(
            CLASS,
            &CommandSpec::new("uname", &["-a"]),
            &command_path("uname.txt"),
            &[state_path("uname.txt")],
            true,
        )
        .await?;

        let os_release = self
            .config()
            .root_path("/etc/os-release")
            .to_string_lossy()
            .into_owned();
        self.collect_command(
            CLASS,
            &CommandSpec::new("cat", &[os_release.as_str()]),
            &command_path("os_release.txt"),
            &[state_path("os_release.txt")],
            true,
        )
        .await?;

        for group in self.path_groups() {
            for file in group.files {
                if group.enabled {
                    self.collect_file(CLASS, Path::new(file))?;
                } else {
                    self.record_disabled(
                        CLASS,
                        &super::strip_root(Path::new(file)),
                        &format!("{} disabled", group.flag),
                    );
                }
            }
            for dir in group.dirs {
                if group.enabled {
                    self.collect_dir(CLASS, Path::new(dir))?;
                } else {
                    self.record_disabled(
                        CLASS,
                        &super::strip_root(Path::new(dir)),
                        &format!("{} disabled", group.flag),
                    );
                }
            }
        }

        for extra in &self.config().paths.extra_files {
            if !extra.is_absolute() {
                tracing::warn!("Ignoring relative extra file {}", extra.display());
                continue;
            }
            self.collect_dir(CLASS, extra)?;
        }

        let features = &self.config().features;
        if features.backup_system_configs {
            let units = CommandSpec::new("systemctl", &["list-unit-files", "--no-pager"]);
            self.collect_command(CLASS, &units, &command_path("systemd_units.txt"), &[], false)
                .await?;
        }
        if features.backup_apt_sources {
            let packages = CommandSpec::new("dpkg", &["-l"]);
            self.collect_command(
                CLASS,
                &packages,
                &command_path("packages.txt"),
                &[state_path("packages.txt")],
                false,
            )
            .await?;
        }

        self.collect_inventory().await
    }

    fn path_groups(&self) -> Vec<PathGroup> {
        let features = &self.config().features;
        vec![
            PathGroup {
                flag: "backup_system_configs",
                enabled: features.backup_system_configs,
                files: &[
                    "/etc/hostname",
                    "/etc/hosts",
                    "/etc/fstab",
                    "/etc/timezone",
                    "/etc/resolv.conf",
                    "/etc/sysctl.conf",
                    "/etc/modules",
                    "/etc/default/grub",
                    "/etc/vzdump.conf",
                    "/etc/ssh/sshd_config",
                    "/etc/postfix/main.cf",
                    "/etc/aliases",
                ],
                dirs: &["/etc/sysctl.d", "/etc/modprobe.d", "/etc/udev/rules.d", "/etc/systemd/system"],
            },
            PathGroup {
                flag: "backup_network_configs",
                enabled: features.backup_network_configs,
                files: &["/etc/network/interfaces"],
                dirs: &["/etc/network/interfaces.d"],
            },
            PathGroup {
                flag: "backup_apt_sources",
                enabled: features.backup_apt_sources,
                files: &["/etc/apt/sources.list"],
                dirs: &["/etc/apt/sources.list.d", "/etc/apt/preferences.d", "/etc/apt/trusted.gpg.d"],
            },
            PathGroup {
                flag: "backup_cron",
                enabled: features.backup_cron,
                files: &["/etc/crontab"],
                dirs: &["/etc/cron.d", "/var/spool/cron/crontabs"],
            },
            PathGroup {
                flag: "backup_ssh_keys",
                enabled: features.backup_ssh_keys,
                files: &[],
                dirs: &["/etc/ssh", "/root/.ssh"],
            },
            PathGroup {
                flag: "backup_ssl_keys",
                enabled: features.backup_ssl_keys,
                files: &[],
                dirs: &["/etc/ssl/private"],
            },
            PathGroup {
                flag: "backup_zfs_info",
                enabled: features.backup_zfs_info,
                files: &["/etc/zfs/zpool.cache"],
                dirs: &[],
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::executor::manifest::FileStatus;
    use crate::process::fake::FakeRunner;
    use crate::utils::EngineError;

    fn system_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.write("/etc/hostname", "pve01\n");
        fx.write("/etc/hosts", "127.0.0.1 localhost\n");
        fx.write("/etc/os-release", "ID=debian\n");
        fx.write("/etc/cron.d/backup", "0 3 * * * root proxsave\n");
        fx.write("/etc/ssh/ssh_host_ed25519_key", "PRIVATE");
        fx.write("/srv/app/settings.ini", "[app]\n");
        fx.runner
            .respond("uname -a", FakeRunner::ok("Linux pve01 6.8.12-1-pve\n"))
            .respond_any("cat", FakeRunner::ok("ID=debian\n"));
        fx
    }

    #[tokio::test]
    async fn test_collects_system_files() -> Result<()> {
        let fx = system_fixture();
        let mut config = fx.config();
        config.paths.extra_files = vec![PathBuf::from("/srv/app")];
        let collector = fx.collector(config);
        collector.collect_system().await?;

        assert_eq!(std::fs::read_to_string(fx.staged("etc/hostname"))?, "pve01\n");
        assert!(fx.staged("etc/cron.d/backup").is_file());
        assert!(fx.staged("srv/app/settings.ini").is_file());
        assert_eq!(
            std::fs::read_to_string(fx.staged("commands/os_release.txt"))?,
            "ID=debian\n"
        );
        assert_eq!(
            collector.entry(CLASS, "etc/fstab").map(|e| e.status),
            Some(FileStatus::NotFound)
        );
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_ssh_keys_disabled_by_default() -> Result<()> {
        let fx = system_fixture();
        let collector = fx.collector(fx.config());
        collector.collect_system().await?;

        assert!(!fx.staged("etc/ssh/ssh_host_ed25519_key").exists());
        assert_eq!(
            collector.entry(CLASS, "etc/ssh").map(|e| e.status),
            Some(FileStatus::Disabled)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_uname_is_critical() {
        let fx = Fixture::new();
        let collector = fx.collector(fx.config());
        let err = collector.collect_system().await.unwrap_err();
        assert!(matches!(err, EngineError::CommandSpawn { .. }));
    }
}
