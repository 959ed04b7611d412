//! Scripted [`CommandRunner`] for tests.

use super::{command_basename, CommandOutput, CommandRunner, RunOptions};
use crate::utils::{EngineError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.args.join(" "))
        }
    }
}

/// Answers commands from a script.
///
/// Responses are looked up by full command line first, then by command
/// name. Unknown commands behave like a missing binary.
#[derive(Default)]
pub struct FakeRunner {
    by_line: Mutex<HashMap<String, CommandOutput>>,
    by_name: Mutex<HashMap<String, CommandOutput>>,
    missing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: code,
        }
    }

    /// Answer an exact command line such as `"pvesh get /version"`.
    pub fn respond(&self, line: &str, output: CommandOutput) -> &Self {
        self.by_line.lock().unwrap().insert(line.to_string(), output);
        self
    }

    /// Answer any invocation of `name`.
    pub fn respond_any(&self, name: &str, output: CommandOutput) -> &Self {
        self.by_name.lock().unwrap().insert(name.to_string(), output);
        self
    }

    /// Make `locate(name)` fail even if a response exists.
    pub fn hide(&self, name: &str) -> &Self {
        self.missing.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called(&self, line_prefix: &str) -> bool {
        self.calls()
            .iter()
            .any(|c| c.command_line().starts_with(line_prefix))
    }

    fn lookup(&self, name: &str, args: &[String]) -> Option<CommandOutput> {
        let base = command_basename(name);
        let line = if args.is_empty() {
            base.to_string()
        } else {
            format!("{} {}", base, args.join(" "))
        };
        if let Some(out) = self.by_line.lock().unwrap().get(&line) {
            return Some(out.clone());
        }
        self.by_name.lock().unwrap().get(base).cloned()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let base = command_basename(name);
        if self.missing.lock().unwrap().contains(base) {
            return None;
        }
        let known = self.by_name.lock().unwrap().contains_key(base)
            || self
                .by_line
                .lock()
                .unwrap()
                .keys()
                .any(|k| k.split_whitespace().next() == Some(base));
        known.then(|| PathBuf::from(format!("/usr/bin/{}", base)))
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
        self.calls.lock().unwrap().push(Invocation {
            name: command_basename(name).to_string(),
            args: args.to_vec(),
            env: options.env.clone(),
        });
        self.lookup(name, args).ok_or_else(|| EngineError::CommandSpawn {
            command: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
        })
    }
}
