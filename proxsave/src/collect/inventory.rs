//! Hardware, kernel, network and storage inventories.
//!
//! Pure command captures; none of them is critical. Hardware tools are the
//! ones most likely to fail inside unprivileged containers, where
//! [`Collector::collect_command`] reports them as skipped.

use super::command::CommandSpec;
use super::system::{command_path, state_path};
use super::{Collector, SourceClass};
use crate::utils::Result;

const CLASS: SourceClass = SourceClass::System;

/// `(program, args, output file)`
type Capture = (&'static str, &'static [&'static str], &'static str);

const HARDWARE: &[Capture] = &[
    ("dmidecode", &[], "dmidecode.txt"),
    ("lscpu", &[], "lscpu.txt"),
    ("lspci", &["-nn"], "lspci.txt"),
    ("lsusb", &[], "lsusb.txt"),
    (
        "lsblk",
        &["--json", "-o", "NAME,SIZE,TYPE,FSTYPE,MOUNTPOINT,UUID,MODEL,SERIAL"],
        "lsblk.json",
    ),
    ("blkid", &[], "blkid.txt"),
    ("sensors", &[], "sensors.txt"),
    ("smartctl", &["--scan"], "smartctl_scan.txt"),
];

const KERNEL: &[Capture] = &[
    ("lsmod", &[], "lsmod.txt"),
    ("cat", &["/proc/cmdline"], "kernel_cmdline.txt"),
    ("free", &["-b"], "memory.txt"),
    ("df", &["-hT"], "df.txt"),
];

const NETWORK: &[Capture] = &[
    ("ip", &["-j", "addr", "show"], "ip_addr.json"),
    ("ip", &["-j", "route", "show"], "ip_route.json"),
    ("ip", &["-j", "link", "show"], "ip_link.json"),
    ("ss", &["-tulpn"], "listening_sockets.txt"),
    ("nft", &["list", "ruleset"], "nft_ruleset.txt"),
];

const ZFS: &[Capture] = &[
    ("zpool", &["status"], "zpool_status.txt"),
    ("zpool", &["list"], "zpool_list.txt"),
    (
        "zfs",
        &["list", "-o", "name,used,avail,refer,mountpoint"],
        "zfs_list.txt",
    ),
    ("zpool", &["get", "all"], "zpool_properties.txt"),
];

impl Collector {
    pub async fn collect_inventory(&self) -> Result<()> {
        let features = &self.config().features;
        let groups: [(&str, bool, &[Capture]); 4] = [
            ("backup_hardware_info", features.backup_hardware_info, HARDWARE),
            ("backup_system_configs", features.backup_system_configs, KERNEL),
            ("backup_network_configs", features.backup_network_configs, NETWORK),
            ("backup_zfs_info", features.backup_zfs_info, ZFS),
        ];

        for (flag, enabled, captures) in groups {
            for (program, args, output) in captures {
                let primary = command_path(output);
                if !enabled {
                    self.record_disabled(CLASS, &primary, &format!("{} disabled", flag));
                    continue;
                }
                self.collect_command(
                    CLASS,
                    &CommandSpec::new(program, args),
                    &primary,
                    &[state_path(output)],
                    false,
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::executor::manifest::FileStatus;
    use crate::privilege::StaticDetector;
    use crate::process::fake::FakeRunner;

    #[tokio::test]
    async fn test_unprivileged_container_inventory() -> Result<()> {
        let fx = Fixture::new();
        fx.runner
            .respond_any("dmidecode", FakeRunner::fail(1, "/dev/mem: Operation not permitted\n"))
            .respond_any("blkid", FakeRunner::fail(2, ""))
            .respond_any("sensors", FakeRunner::fail(1, "No sensors found!\n"))
            .respond_any("lspci", FakeRunner::fail(1, "pcilib: Cannot open /proc/bus/pci\n"))
            .respond("ip -j addr show", FakeRunner::ok("[]"));
        let collector = fx.collector_with(fx.config(), StaticDetector::unprivileged());
        collector.collect_inventory().await?;

        let entry = |k: &str| collector.entry(CLASS, k).unwrap();
        assert_eq!(entry("commands/dmidecode.txt").status, FileStatus::Skipped);
        assert_eq!(entry("commands/blkid.txt").status, FileStatus::Skipped);
        assert_eq!(entry("commands/sensors.txt").status, FileStatus::Skipped);
        // Not on the allowlist, so still a failure
        assert_eq!(entry("commands/lspci.txt").status, FileStatus::Failed);
        assert_eq!(entry("commands/ip_addr.json").status, FileStatus::Collected);
        assert!(!fx.staged("commands/dmidecode.txt").exists());
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_privileged_host_reports_failures() -> Result<()> {
        let fx = Fixture::new();
        fx.runner
            .respond_any("dmidecode", FakeRunner::fail(1, "/dev/mem: Permission denied\n"));
        let collector = fx.collector(fx.config());
        collector.collect_inventory().await?;

        assert_eq!(
            collector.entry(CLASS, "commands/dmidecode.txt").map(|e| e.status),
            Some(FileStatus::Failed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_zfs_disabled() -> Result<()> {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.features.backup_zfs_info = false;
        let collector = fx.collector(config);
        collector.collect_inventory().await?;

        assert_eq!(
            collector.entry(CLASS, "commands/zpool_status.txt").map(|e| e.status),
            Some(FileStatus::Disabled)
        );
        assert!(!fx.runner.was_called("zpool"));
        Ok(())
    }
}
