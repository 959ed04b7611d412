//! Proxmox Backup Server configuration collector.

use super::command::CommandSpec;
use super::{disabled_exclusions, Collector, SourceClass};
use crate::fs::staging::{COMMANDS_DIR, STATE_DIR};
use crate::utils::{EngineError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CLASS: SourceClass = SourceClass::Pbs;
const MANAGER: &str = "proxmox-backup-manager";

fn command_path(name: &str) -> PathBuf {
    Path::new(COMMANDS_DIR).join(name)
}

fn state_path(name: &str) -> PathBuf {
    Path::new(STATE_DIR).join("pbs").join(name)
}

fn manager(args: &[&str]) -> CommandSpec {
    let mut all: Vec<&str> = args.to_vec();
    all.push("--output-format=json");
    CommandSpec::new(MANAGER, &all)
}

impl Collector {
    /// Snapshot `/etc/proxmox-backup`, PBS command output and datastore
    /// inventories.
    pub async fn collect_pbs(&self) -> Result<()> {
        let config = self.config();
        let pbs_root = config.paths.pbs_config_root.clone();
        if !config.root_path(&pbs_root).is_dir() {
            return Err(EngineError::Precondition(format!(
                "{} does not exist; not a Proxmox Backup Server host",
                pbs_root.display()
            )));
        }

        self.begin(CLASS);
        info!("Collecting Proxmox Backup Server configuration");

        self.collect_command(
            CLASS,
            &manager(&["version"]),
            &command_path("pbs_version.json"),
            &[state_path("version.json")],
            true,
        )
        .await?;

        let features = &config.features;
        let rules = disabled_exclusions(&[
            (
                features.backup_datastore_configs,
                &["datastore.cfg"][..],
                "backup_datastore_configs",
            ),
            (
                features.backup_user_configs,
                &["user.cfg", "acl.cfg", "token.cfg", "token.shadow", "shadow.json", "tfa.json", "domains.cfg"][..],
                "backup_user_configs",
            ),
            (features.backup_remote_configs, &["remote.cfg"][..], "backup_remote_configs"),
            (features.backup_sync_jobs, &["sync.cfg"][..], "backup_sync_jobs"),
            (
                features.backup_verify_jobs,
                &["verification.cfg"][..],
                "backup_verify_jobs",
            ),
            (features.backup_prune_jobs, &["prune.cfg"][..], "backup_prune_jobs"),
            (
                features.backup_tape_configs,
                &["tape.cfg", "tape-job.cfg", "media-pool.cfg", "tape-encryption-keys.json"][..],
                "backup_tape_configs",
            ),
            (
                features.backup_network_configs,
                &["node.cfg", "traffic-control.cfg"][..],
                "backup_network_configs",
            ),
            (features.backup_ssl_keys, &["proxy.key"][..], "backup_ssl_keys"),
        ]);
        let rules: Vec<(String, String)> = rules
            .iter()
            .flat_map(|(pattern, reason)| {
                [
                    (pattern.clone(), reason.clone()),
                    (format!("{}.json", pattern), reason.clone()),
                ]
            })
            .collect();

        {
            // The disabled patterns also cover the matching command outputs below
            let _scope = self.exclude_temporarily(&rules);
            if features.backup_pbs_configs {
                self.collect_dir(CLASS, &pbs_root)?;
            } else {
                self.record_disabled(CLASS, &super::strip_root(&pbs_root), "backup_pbs_configs disabled");
            }
            self.collect_pbs_commands().await?;
        }

        if features.backup_datastore_configs
            && (features.backup_datastore_namespaces || features.backup_pxar_metadata)
        {
            let stores = self.discover_datastores().await?;
            self.write_json(CLASS, &state_path("datastores.json"), &stores)?;

            if features.backup_datastore_namespaces {
                for (name, result) in self.collect_namespaces(&stores).await? {
                    if let Err(e) = result {
                        warn!("Datastore {}: {}", name, e);
                    }
                }
            }
            if features.backup_pxar_metadata {
                self.collect_pxar_metadata(&stores).await?;
            }
        }

        if features.backup_user_tokens && features.backup_user_configs {
            self.collect_pbs_tokens().await?;
        } else {
            self.record_disabled(CLASS, &state_path("user_tokens.json"), "backup_user_tokens disabled");
        }

        Ok(())
    }

    async fn collect_pbs_commands(&self) -> Result<()> {
        let features = &self.config().features;

        // Output names are `<config file>.json`, so a disabled feature's
        // exclusion suppresses its command output too
        let plan: Vec<(CommandSpec, &str)> = vec![
            (manager(&["datastore", "list"]), "datastore.cfg.json"),
            (manager(&["user", "list"]), "user.cfg.json"),
            (manager(&["acl", "list"]), "acl.cfg.json"),
            (manager(&["remote", "list"]), "remote.cfg.json"),
            (manager(&["sync-job", "list"]), "sync.cfg.json"),
            (manager(&["verify-job", "list"]), "verification.cfg.json"),
            (manager(&["prune-job", "list"]), "prune.cfg.json"),
            (manager(&["network", "list"]), "node.cfg.json"),
            (manager(&["cert", "info"]), "cert_info.json"),
            (manager(&["subscription", "get"]), "subscription.json"),
            (manager(&["disk", "list"]), "disk_list.json"),
            (
                CommandSpec::new("proxmox-tape", &["drive", "list", "--output-format=json"]),
                "tape.cfg.json",
            ),
            (
                CommandSpec::new("proxmox-tape", &["pool", "list", "--output-format=json"]),
                "media-pool.cfg.json",
            ),
        ];

        for (cmd, name) in plan {
            if name == "disk_list.json" && !features.backup_hardware_info {
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

    fn pbs_fixture() -> Fixture {
        let fx = Fixture::new();
        fx.write("/etc/proxmox-backup/datastore.cfg", "datastore: store1\n\tpath /mnt/store1\n");
        fx.write("/etc/proxmox-backup/user.cfg", "user: root@pam\n\tenable true\n");
        fx.write("/etc/proxmox-backup/new_feature.cfg", "feature: x\n");
        fx.write("/mnt/store1/vm/100/2024-05-01T10:00:00Z/root.pxar.didx", "didx");
        fx.runner
            .respond(
                "proxmox-backup-manager version --output-format=json",
                FakeRunner::ok(r#"{"version":"3.2"}"#),
            )
            .respond(
                "proxmox-backup-manager datastore list --output-format=json",
                FakeRunner::ok(r#"[{"name":"store1","path":"/mnt/store1"}]"#),
            )
            .respond_any("proxmox-backup-manager", FakeRunner::ok("[]"));
        fx
    }

    #[tokio::test]
    async fn test_not_a_pbs_host() {
        let fx = Fixture::new();
        let collector = fx.collector(fx.config());
        assert!(matches!(
            collector.collect_pbs().await,
            Err(EngineError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_feature_disabled_exclusion() -> Result<()> {
        let fx = pbs_fixture();
        let mut config = fx.config();
        config.features.backup_datastore_configs = false;
        config.features.backup_user_configs = false;
        let collector = fx.collector(config);
        collector.collect_pbs().await?;

        assert!(fx.staged("etc/proxmox-backup/new_feature.cfg").is_file());
        assert!(!fx.staged("etc/proxmox-backup/datastore.cfg").exists());
        assert!(!fx.staged("etc/proxmox-backup/user.cfg").exists());

        let status = |k: &str| collector.entry(CLASS, k).map(|e| e.status);
        assert_eq!(status("etc/proxmox-backup/datastore.cfg"), Some(FileStatus::Disabled));
        assert_eq!(status("etc/proxmox-backup/user.cfg"), Some(FileStatus::Disabled));
        assert_eq!(status("etc/proxmox-backup/new_feature.cfg"), Some(FileStatus::Collected));

        // Matching command output is suppressed as well
        assert_eq!(status("commands/user.cfg.json"), Some(FileStatus::Disabled));
        assert!(!fx.runner.was_called("proxmox-backup-manager user list"));
        assert!(!fx.runner.was_called("proxmox-backup-manager datastore list"));
        assert!(fx.runner.was_called("proxmox-backup-manager remote list"));

        assert!(collector.exclude_patterns().is_empty());
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_datastore_inventory() -> Result<()> {
        let fx = pbs_fixture();
        let collector = fx.collector(fx.config());
        collector.collect_pbs().await?;

        assert!(fx.staged("etc/proxmox-backup/datastore.cfg").is_file());
        assert!(fx.staged("var/lib/proxsave-info/pbs/datastores.json").is_file());
        assert!(fx
            .staged("var/lib/proxsave-info/pbs/datastores/store1_namespaces.json")
            .is_file());
        assert!(fx
            .staged("var/lib/proxsave-info/pbs/datastores/store1_pxar_metadata.json")
            .is_file());
        assert_eq!(
            collector
                .entry(CLASS, "var/lib/proxsave-info/pbs/datastores/store1_pxar_files.txt")
                .map(|e| e.status),
            Some(FileStatus::Disabled)
        );
        assert!(fx.staged("var/lib/proxsave-info/pbs/user_tokens.json").is_file());
        assert_conserved(&collector);
        Ok(())
    }

    #[tokio::test]
    async fn test_version_is_critical() {
        let fx = Fixture::new();
        fx.write("/etc/proxmox-backup/datastore.cfg", "");
        fx.runner.respond_any(MANAGER, FakeRunner::fail(1, "connection refused"));
        let collector = fx.collector(fx.config());
        assert!(matches!(
            collector.collect_pbs().await,
            Err(EngineError::Command { .. })
        ));
    }
}
