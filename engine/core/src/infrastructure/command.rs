// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! External command execution
//!
//! Every kernel-facing tool (`losetup`, LVM, `mount`, `restic`) is driven
//! through [`CommandRunner`] so the block and backup layers can be exercised
//! without root by swapping in [`ScriptedCommandRunner`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments joined for logs and error messages. Environment
    /// values are never rendered.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is not an error here; callers map
    /// it into their own error type.
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(command = %spec.display(), "Running command");

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        let output = match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!(
                            "`{}` timed out after {} seconds",
                            spec.display(),
                            timeout.as_secs()
                        ),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

type Responder = Box<dyn Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync>;

/// Test double that records every invocation and answers from a list of
/// responders. The first responder returning `Some` wins; unmatched commands
/// succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedCommandRunner {
    responders: Arc<Mutex<Vec<Responder>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose rendered form starts with `prefix`
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        let prefix = prefix.to_string();
        self.respond_with(move |spec| spec.display().starts_with(&prefix).then(|| output.clone()));
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync + 'static,
    {
        self.responders.lock().push(Box::new(responder));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Rendered command lines, in call order
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.lock().iter().map(CommandSpec::display).collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.calls.lock().push(spec.clone());
        let responders = self.responders.lock();
        Ok(responders
            .iter()
            .find_map(|r| r(spec))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_omits_env() {
        let spec = CommandSpec::new("restic")
            .args(["backup", "--json"])
            .env("RESTIC_PASSWORD", "secret");
        assert_eq!(spec.display(), "restic backup --json");
    }

    #[tokio::test]
    async fn test_scripted_runner_matches_first_prefix() {
        let runner = ScriptedCommandRunner::new();
        runner.respond("losetup --find", CommandOutput::ok("/dev/loop7\n"));
        runner.respond("losetup", CommandOutput::failed(1, "nope"));

        let out = runner
            .run(&CommandSpec::new("losetup").args(["--find", "--show", "/x"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "/dev/loop7");

        let out = runner.run(&CommandSpec::new("losetup").arg("-d")).await.unwrap();
        assert!(!out.success());

        let out = runner.run(&CommandSpec::new("vgs")).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_code() {
        let out = SystemCommandRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo hi; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let err = SystemCommandRunner
            .run(
                &CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
