//! Proxmox VE configuration collector.

use super::command::CommandSpec;
use super::{disabled_exclusions, Collector, SourceClass};
use crate::fs::staging::{COMMANDS_DIR, STATE_DIR};
use crate::utils::{EngineError, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const CLASS: SourceClass = SourceClass::Pve;

fn command_path(name: &str) -> PathBuf {
    Path::new(COMMANDS_DIR).join(name)
}

fn state_path(name: &str) -> PathBuf {
    Path::new(STATE_DIR).join("pve").join(name)
}

impl Collector {
    /// Snapshot `/etc/pve`, cluster state and PVE command output.
    ///
    /// Fails only when this is not a PVE host or a critical command fails.
    pub async fn collect_pve(&self) -> Result<()> {
        let config = self.config();
        let pve_root = config.paths.pve_config_root.clone();
        if !config.root_path(&pve_root).is_dir() {
            return Err(EngineError::Precondition(format!(
                "{} does not exist; not a Proxmox VE host",
                pve_root.display()
            )));
        }

        self.begin(CLASS);
        info!("Collecting Proxmox VE configuration");

        self.collect_command(
            CLASS,
            &CommandSpec::new("pveversion", &["-v"]),
            &command_path("pveversion.txt"),
            &[state_path("pveversion.txt")],
            true,
        )
        .await?;

        let features = &config.features;
        if features.backup_pve_configs {
            let rules = disabled_exclusions(&[
                (features.backup_vm_configs, &["qemu-server", "lxc"][..], "backup_vm_configs"),
                (
                    features.backup_pve_firewall,
                    &["firewall", "*.fw"][..],
                    "backup_pve_firewall",
                ),
                (
                    features.backup_cluster_config,
                    &["corosync.conf"][..],
                    "backup_cluster_config",
                ),
                (
                    features.backup_pve_jobs,
                    &["jobs.cfg", "vzdump.cron", "replication.cfg"][..],
                    "backup_pve_jobs",
                ),
                (
                    features.backup_ssl_keys,
                    &["pve-ssl.key", "pveproxy-ssl.key", "pve-root-ca.key"][..],
                    "backup_ssl_keys",
                ),
            ]);
            let _scope = self.exclude_temporarily(&rules);
            self.collect_dir(CLASS, &pve_root)?;
        } else {
            self.record_disabled(CLASS, &super::strip_root(&pve_root), "backup_pve_configs disabled");
        }

        if features.backup_cluster_config {
            self.collect_dir(CLASS, &config.paths.corosync_root)?;
            self.collect_file(CLASS, &config.paths.pve_cluster_db.join("config.db"))?;
        }

        self.collect_pve_commands().await?;

        if features.backup_user_tokens {
            self.collect_pve_tokens().await?;
        } else {
            self.record_disabled(CLASS, &state_path("user_tokens.json"), "backup_user_tokens disabled");
        }

        Ok(())
    }

    async fn collect_pve_commands(&self) -> Result<()> {
        let features = &self.config().features;

        let mut plan: Vec<(CommandSpec, &str, bool)> = vec![
            (self.pvesh("/version"), "pve_version.json", true),
            (self.pvesh("/nodes"), "nodes.json", true),
            (self.pvesh("/storage"), "storage.json", true),
            (CommandSpec::new("pvesm", &["status"]), "pvesm_status.txt", true),
            (self.pvesh("/cluster/status"), "cluster_status.json", features.backup_cluster_config),
            (CommandSpec::new("pvecm", &["status"]), "pvecm_status.txt", features.backup_cluster_config),
            (CommandSpec::new("pvecm", &["nodes"]), "pvecm_nodes.txt", features.backup_cluster_config),
            (CommandSpec::new("ha-manager", &["status"]), "ha_status.txt", features.backup_cluster_config),
            (self.pvesh("/cluster/backup"), "backup_jobs.json", features.backup_pve_jobs),
            (self.pvesh("/cluster/replication"), "replication.json", features.backup_pve_jobs),
            (self.pvesh("/cluster/firewall/options"), "firewall_options.json", features.backup_pve_firewall),
            (CommandSpec::new("pve-firewall", &["status"]), "firewall_status.txt", features.backup_pve_firewall),
            (CommandSpec::new("qm", &["list"]), "qm_list.txt", features.backup_vm_configs),
            (CommandSpec::new("pct", &["list"]), "pct_list.txt", features.backup_vm_configs),
        ];
        if features.backup_vm_configs {
            let mut resources = self.pvesh("/cluster/resources");
            resources.args.extend(["--type".to_string(), "vm".to_string()]);
            plan.push((resources, "vm_resources.json", true));
        }

        for (cmd, name, enabled) in plan {
            if !enabled {
                self.record_disabled(CLASS, &command_path(name), "feature disabled");
                continue;
            }
            self.collect_command(CLASS, &cmd, &command_path(name), &[state_path(name)], false)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::executor::manifest::FileStatus;
    use crate::process::fake::FakeRunner;

    fn pve_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.write("/etc/pve/storage.cfg", "dir: local\n\tpath /var/lib/vz\n");
        fx.write("/etc/pve/qemu-server/100.conf", "memory: 2048\n");
        fx.write("/etc/pve/firewall/cluster.fw", "[OPTIONS]\nenable: 1\n");
        fx.write("/etc/pve/corosync.conf", "totem {}\n");
        fx.write("/etc/corosync/authkey", "secret");
        fx.write("/var/lib/pve-cluster/config.db", "sqlite");
        fx.runner.respond("pveversion -v", FakeRunner::ok("pve-manager: 8.2.4\n"));
        fx.runner.respond_any("pvesh", FakeRunner::ok("[]"));
        fx
    }

    #[tokio::test]
    async fn test_not_a_pve_host() {
        let fx = Fixture::new();
        let collector = fx.collector(fx.config());
        let err = collector.collect_pve().await.unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_collects_pve_tree_and_commands() -> Result<()> {
        let fx = pve_fixture();
        let collector = fx.collector(fx.config());
        collector.collect_pve().await?;

        assert!(fx.staged("etc/pve/storage.cfg").is_file());
        assert!(fx.staged("etc/pve/qemu-server/100.conf").is_file());
        assert!(fx.staged("etc/corosync/authkey").is_file());
        assert!(fx.staged("var/lib/pve-cluster/config.db").is_file());
        assert_eq!(std::fs::read_to_string(fx.staged("commands/nodes.json"))?, "[]");
        assert!(fx.staged("var/lib/proxsave-info/pve/nodes.json").is_file());
        assert!(fx.runner.was_called("pvesh get /cluster/resources --output-format=json --type vm"));
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_vm_and_firewall_configs() -> Result<()> {
        let fx = pve_fixture();
        let mut config = fx.config();
        config.features.backup_vm_configs = false;
        config.features.backup_pve_firewall = false;
        let collector = fx.collector(config);
        collector.collect_pve().await?;

        assert!(!fx.staged("etc/pve/qemu-server").exists());
        assert!(!fx.staged("etc/pve/firewall").exists());
        assert!(fx.staged("etc/pve/storage.cfg").is_file());
        assert_eq!(
            collector.entry(CLASS, "etc/pve/qemu-server/").map(|e| e.status),
            Some(FileStatus::Disabled)
        );
        assert_eq!(
            collector.entry(CLASS, "commands/qm_list.txt").map(|e| e.status),
            Some(FileStatus::Disabled)
        );
        assert!(!fx.runner.was_called("qm list"));
        assert!(collector.exclude_patterns().is_empty());
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_pveversion_is_critical() {
        let fx = Fixture::new();
        fx.write("/etc/pve/storage.cfg", "");
        fx.runner.respond("pveversion -v", FakeRunner::fail(2, "broken"));
        let collector = fx.collector(fx.config());
        assert!(matches!(
            collector.collect_pve().await,
            Err(EngineError::Command { .. })
        ));
    }
}
