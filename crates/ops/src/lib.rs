//! kres ops: running control-plane commands.
//!
//! kubectl and the cloud CLI are black boxes invoked by command line. [`CommandRunner`] is
//! the seam: [`LocalRunner`] spawns processes, [`ScriptedRunner`] replays canned output in
//! tests. Connectivity failures are retried by [`run_with_retry`]; nothing else is.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kres_core::{CommandError, Settings};
use metrics::{counter, histogram};
use tracing::{debug, warn};

/// Runs one command line and returns its stdout.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// On a non-zero exit the error carries the combined stdout and stderr.
    async fn run(&self, command: &str) -> Result<String, CommandError>;
}

/// Spawns commands as child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    kubeconfig: Option<PathBuf>,
    bin_dir: Option<PathBuf>,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self { kubeconfig: Some(settings.kubeconfig.clone()), bin_dir: settings.bin_dir.clone() }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Search `dir` before the inherited `PATH` for executables.
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    fn search_path(&self) -> Option<OsString> {
        let bin = self.bin_dir.as_ref()?;
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(bin.clone()).chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).ok()
    }
}

#[async_trait::async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str) -> Result<String, CommandError> {
        if command.trim().is_empty() {
            return Err(CommandError::new(None, "empty command line"));
        }
        // Command lines are built with POSIX shell quoting.
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        if let Some(kc) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kc);
        }
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }

        let t0 = Instant::now();
        debug!(command = %command, "ops: run");
        let out = cmd
            .output()
            .await
            .map_err(|e| CommandError::new(None, format!("failed to execute sh: {}", e)))?;
        histogram!("command_ms", t0.elapsed().as_secs_f64() * 1000.0);

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr);
        if out.status.success() {
            counter!("command_runs_total", 1u64, "outcome" => "ok");
            if !stderr.trim().is_empty() {
                debug!(command = %command, stderr = %stderr.trim(), "ops: stderr");
            }
            Ok(stdout)
        } else {
            counter!("command_runs_total", 1u64, "outcome" => "error");
            Err(CommandError::new(out.status.code(), format!("{}{}", stdout, stderr)))
        }
    }
}

/// Local retry of commands that could not reach the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 5, delay: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self { retries: settings.cmd_retries, delay: settings.cmd_retry_delay }
    }
}

/// Run `command`, retrying only [`CommandError::is_unreachable`] failures.
pub async fn run_with_retry(runner: &dyn CommandRunner, command: &str, policy: &RetryPolicy) -> Result<String, CommandError> {
    let mut retries = 0u32;
    loop {
        match runner.run(command).await {
            Err(e) if e.is_unreachable() && retries < policy.retries => {
                retries += 1;
                counter!("command_retries_total", 1u64);
                warn!(command = %command, retry = retries, delay_ms = policy.delay.as_millis() as u64, "ops: API server unreachable, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            other => return other,
        }
    }
}

type Scripted = Result<String, CommandError>;

/// In-memory runner replaying canned results.
///
/// Each entry pairs a needle with a queue of results. A command takes the queue of the first
/// entry whose needle it contains; the queue pops until one result is left, which then repeats.
/// Unscripted commands fail with exit code 127.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<Vec<(String, VecDeque<Scripted>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ScriptedRunner::push`].
    pub fn on(self, needle: &str, result: Scripted) -> Self {
        self.push(needle, result);
        self
    }

    pub fn push(&self, needle: &str, result: Scripted) {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        match script.iter_mut().find(|(n, _)| n == needle) {
            Some((_, queue)) => queue.push_back(result),
            None => script.push((needle.to_string(), VecDeque::from([result]))),
        }
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<String, CommandError> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(command.to_string());
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        let queue = script.iter_mut().find(|(n, _)| command.contains(n.as_str())).map(|(_, q)| q);
        match queue {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or_else(|| Err(CommandError::new(Some(127), "script exhausted"))),
            Some(q) => q.front().cloned().unwrap_or_else(|| Err(CommandError::new(Some(127), "script exhausted"))),
            None => Err(CommandError::new(Some(127), format!("unscripted command: {}", command))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy { retries, delay: Duration::ZERO }
    }

    #[tokio::test]
    async fn unreachable_is_retried_five_times() {
        let runner = ScriptedRunner::new().on("kubectl", Err(CommandError::new(Some(1), "Unable to connect to the server: dial tcp: i/o timeout")));
        let err = run_with_retry(&runner, "kubectl get ns", &fast(5)).await.unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(runner.calls().len(), 6);
    }

    #[tokio::test]
    async fn other_errors_propagate_immediately() {
        let runner = ScriptedRunner::new().on("kubectl", Err(CommandError::new(Some(1), "Error from server (Forbidden): nope")));
        let err = run_with_retry(&runner, "kubectl get ns", &fast(5)).await.unwrap_err();
        assert!(err.output.contains("Forbidden"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn recovers_when_server_comes_back() {
        let runner = ScriptedRunner::new()
            .on("kubectl", Err(CommandError::new(Some(1), "Unable to connect to the server: EOF")))
            .on("kubectl", Err(CommandError::new(Some(1), "Unable to connect to the server: EOF")))
            .on("kubectl", Ok("{\"items\":[]}".into()));
        let out = run_with_retry(&runner, "kubectl get jobs -o json", &fast(5)).await.unwrap();
        assert_eq!(out, "{\"items\":[]}");
        assert_eq!(runner.count("kubectl get jobs"), 3);
    }

    #[tokio::test]
    async fn scripted_runner_repeats_last_result_and_rejects_unknown() {
        let runner = ScriptedRunner::new().on("get", Ok("a".into())).on("get", Ok("b".into()));
        assert_eq!(runner.run("kubectl get x").await.unwrap(), "a");
        assert_eq!(runner.run("kubectl get x").await.unwrap(), "b");
        assert_eq!(runner.run("kubectl get x").await.unwrap(), "b");
        let err = runner.run("kubectl delete x").await.unwrap_err();
        assert_eq!(err.exit_code, Some(127));
    }

    #[test]
    fn policy_defaults() {
        assert_eq!(RetryPolicy::default(), RetryPolicy { retries: 5, delay: Duration::from_secs(5) });
        let s = Settings { cmd_retries: 2, cmd_retry_delay: Duration::from_secs(1), ..Default::default() };
        assert_eq!(RetryPolicy::from_settings(&s), RetryPolicy { retries: 2, delay: Duration::from_secs(1) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_runner_captures_output_and_failures() {
        let runner = LocalRunner::new().with_kubeconfig("/tmp/kres-test.config");
        let out = runner.run("printf %s \"$KUBECONFIG\"").await.unwrap();
        assert_eq!(out, "/tmp/kres-test.config");

        let err = runner.run("echo out; echo Unable to connect to the server >&2; exit 3").await.unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert!(err.output.starts_with("out\n"));
        assert!(err.is_unreachable());

        let err = runner.run("definitely-not-a-real-binary-kres").await.unwrap_err();
        assert_eq!(err.exit_code, Some(127));
        assert_eq!(runner.run("  ").await.unwrap_err().exit_code, None);
    }
}
