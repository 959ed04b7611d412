//! API token aggregation.
//!
//! Users and their tokens are listed through the management CLI and merged
//! into a single `user_tokens.json`. Token secrets are never exposed by these
//! listings; only ids, expiry and comments.

use super::command::CommandSpec;
use super::{Collector, SourceClass};
use crate::executor::manifest::ManifestEntry;
use crate::fs::staging::STATE_DIR;
use crate::utils::{summarize_output, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTokens {
    pub userid: String,
    pub tokens: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenReport {
    pub source: String,
    pub users: Vec<UserTokens>,
}

/// User ids from a JSON user listing (`[{"userid": ...}, ...]`).
pub fn parse_user_ids(json: &[u8]) -> serde_json::Result<Vec<String>> {
    let users: Vec<Value> = serde_json::from_slice(json)?;
    let mut ids: Vec<String> = users
        .iter()
        .filter_map(|u| u.get("userid").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    ids.sort();
    ids.dedup();
    Ok(ids)
}

fn tokens_path(flavour: &str) -> PathBuf {
    Path::new(STATE_DIR).join(flavour).join("user_tokens.json")
}

impl Collector {
    pub async fn collect_pbs_tokens(&self) -> Result<()> {
        let list = CommandSpec::new("proxmox-backup-manager", &["user", "list", "--output-format=json"]);
        self.aggregate_tokens(SourceClass::Pbs, "pbs", &list, |userid| {
            CommandSpec::new(
                "proxmox-backup-manager",
                &["user", "list-tokens", userid, "--output-format=json"],
            )
        })
        .await
    }

    pub async fn collect_pve_tokens(&self) -> Result<()> {
        let list = self.pvesh("/access/users");
        self.aggregate_tokens(SourceClass::Pve, "pve", &list, |userid| {
            self.pvesh(&format!("/access/users/{}/token", userid))
        })
        .await
    }

    async fn aggregate_tokens<F>(
        &self,
        class: SourceClass,
        flavour: &str,
        list: &CommandSpec,
        per_user: F,
    ) -> Result<()>
    where
        F: Fn(&str) -> CommandSpec,
    {
        let target = tokens_path(flavour);
        let key = self.manifest_key(&self.staging_root().join(&target));

        let output = match self.run_command(list).await {
            Ok(Some(output)) => output,
            Ok(None) => {
                self.record(class, &key, ManifestEntry::not_found());
                return Ok(());
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("Cannot list users: {}", e);
                self.record(class, &key, ManifestEntry::failed(e.to_string()));
                return Ok(());
            }
        };
        if !output.success() {
            let summary = summarize_output(&output.combined());
            warn!("{} failed: {}", list.command_line(), summary);
            self.record(class, &key, ManifestEntry::failed(summary));
            return Ok(());
        }

        let ids = match parse_user_ids(&output.stdout) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Unexpected user listing from {}: {}", list.command_line(), e);
                self.record(class, &key, ManifestEntry::failed(e.to_string()));
                return Ok(());
            }
        };

        let mut users = Vec::with_capacity(ids.len());
        for userid in ids {
            let cmd = per_user(&userid);
            let mut entry = UserTokens {
                userid,
                tokens: Vec::new(),
                error: None,
            };
            match self.run_command(&cmd).await {
                Ok(Some(out)) if out.success() => {
                    match serde_json::from_slice::<Vec<Value>>(&out.stdout) {
                        Ok(tokens) => entry.tokens = tokens,
                        Err(e) => entry.error = Some(e.to_string()),
                    }
                }
                Ok(Some(out)) => entry.error = Some(summarize_output(&out.combined())),
                Ok(None) => entry.error = Some(format!("{} not found", cmd.name)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => entry.error = Some(e.to_string()),
            }
            if let Some(error) = &entry.error {
                warn!("Cannot list tokens of {}: {}", entry.userid, error);
            }
            users.push(entry);
        }

        let report = TokenReport {
            source: flavour.to_string(),
            users,
        };
        self.write_json(class, &target, &report)?;
        Ok(())
    }
}
