// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Subprocess execution for the Sandbox Executor.
//!
//! A skill is written to a scratch file, launched with a from-scratch
//! environment (no inheritance from this process — see [`SandboxExecutor::run`]),
//! given a wall-clock timeout, and has its stdout/stderr captured up to a
//! bound. The scratch directory is removed on every exit path, including
//! timeout and launch failure.

use broker_config::SandboxMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::warn;

/// Bound on captured stdout/stderr, per stream. Matches the stderr-drain
/// idiom of logging lines as they arrive rather than buffering unbounded.
const CAPTURE_LIMIT_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n...[truncated]\n";

/// Everything the executor needs to run one skill invocation.
#[derive(Debug, Clone)]
pub struct SandboxInput {
    /// The skill's source bytes, written to a scratch file before exec.
    pub code: Vec<u8>,
    /// Secret values resolved by the vault, keyed by name. Become
    /// environment variables.
    pub secrets: BTreeMap<String, Vec<u8>>,
    /// Caller-supplied arguments. Also become environment variables.
    pub args: BTreeMap<String, String>,
    /// Wall-clock budget for the whole invocation.
    pub timeout_secs: u32,
    /// Hostnames the skill is permitted to reach; empty means no network.
    /// Enforcement is the outer runtime's job (see [`SandboxMode::Containerized`]);
    /// this executor's contribution is to pass the declared list through as
    /// `BROKER_NETWORK_ALLOW` so a cooperating runtime can apply it.
    pub network_allow: Vec<String>,
}

impl SandboxInput {
    /// Build the child's environment: `{secrets} ∪ {args}` plus the minimal
    /// `HOME`/`PATH` a runtime needs to resolve shared libraries and a shell
    /// interpreter line. Nothing else from this process's own environment
    /// is forwarded — chat-bot credentials and other ambient secrets held by
    /// the broker process itself must never reach the child.
    fn child_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.secrets.len() + self.args.len() + 2);
        for (k, v) in &self.secrets {
            env.push((k.clone(), String::from_utf8_lossy(v).into_owned()));
        }
        for (k, v) in &self.args {
            env.push((k.clone(), v.clone()));
        }
        if let Ok(home) = std::env::var("HOME") {
            env.push(("HOME".to_string(), home));
        }
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".to_string(), path));
        }
        env.push(("BROKER_NETWORK_ALLOW".to_string(), self.network_allow.join(",")));
        env
    }
}

/// Outcome of one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    /// `true` iff the process exited zero within the timeout.
    pub success: bool,
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    /// Captured stderr, possibly truncated.
    pub stderr: String,
    /// Exit code, or `None` if killed for timeout or never started.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Whether the timeout fired.
    pub timed_out: bool,
}

/// Errors launching or supervising a sandboxed process.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The child process could not be spawned at all.
    #[error("failed to launch sandboxed process: {0}")]
    Launch(#[source] std::io::Error),
    /// Writing the skill to its scratch file failed.
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
    /// A containerized mode was configured with an empty runtime command.
    #[error("containerized sandbox mode has an empty runtime_command")]
    EmptyRuntimeCommand,
}

/// Runs one skill invocation per [`SandboxExecutor::run`] call.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    mode: SandboxMode,
    scratch_root: PathBuf,
}

impl SandboxExecutor {
    /// Build an executor. `scratch_root` is created on first use if absent.
    pub fn new(mode: SandboxMode, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            scratch_root: scratch_root.into(),
        }
    }

    /// Execute one skill invocation to completion.
    ///
    /// The command line is built per [`SandboxMode`]: `Direct` executes the
    /// scratch file itself; `Containerized` wraps it with the configured
    /// runtime command and arguments. In both cases the child's environment
    /// is constructed from scratch (see [`SandboxInput::child_env`]) rather
    /// than inherited, so nothing this broker process holds — chat tokens,
    /// its own config secrets — reaches the child unless it was explicitly
    /// declared as a skill secret or argument.
    pub async fn run(&self, input: SandboxInput) -> Result<SandboxOutcome, SandboxError> {
        let run_dir = self.scratch_root.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(SandboxError::Scratch)?;
        let code_path = run_dir.join("skill");

        let result = self.run_in(&run_dir, &code_path, &input).await;

        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            warn!(target: "broker.sandbox", error = %e, "failed to clean up scratch directory");
        }

        result
    }

    async fn run_in(
        &self,
        run_dir: &Path,
        code_path: &Path,
        input: &SandboxInput,
    ) -> Result<SandboxOutcome, SandboxError> {
        write_executable(code_path, &input.code)
            .await
            .map_err(SandboxError::Scratch)?;

        let mut cmd = match &self.mode {
            SandboxMode::Direct => Command::new(code_path),
            SandboxMode::Containerized {
                runtime_command,
                runtime_args,
            } => {
                if runtime_command.is_empty() {
                    return Err(SandboxError::EmptyRuntimeCommand);
                }
                let mut cmd = Command::new(runtime_command);
                cmd.args(runtime_args);
                cmd.arg(code_path);
                cmd
            }
        };

        cmd.current_dir(run_dir);
        cmd.env_clear();
        for (k, v) in input.child_env() {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().map_err(SandboxError::Launch)?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdout_task = tokio::spawn(drain_bounded(stdout));
        let stderr_task = tokio::spawn(drain_bounded(stderr));

        let timeout = Duration::from_secs(u64::from(input.timeout_secs));
        let wait_result = tokio::time::timeout(timeout, child.wait()).await;

        let (exit_code, timed_out) = match wait_result {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                warn!(target: "broker.sandbox", error = %e, "failed waiting on sandboxed process");
                (None, false)
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(target: "broker.sandbox", error = %e, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                (None, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(SandboxOutcome {
            success: !timed_out && exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            duration_ms,
            timed_out,
        })
    }
}

async fn write_executable(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

async fn drain_bounded(reader: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > CAPTURE_LIMIT_BYTES {
                    let remaining = CAPTURE_LIMIT_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..remaining.min(n)]);
                    buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
                    // Drain the rest of the stream without retaining it, so
                    // the child never blocks on a full pipe buffer.
                    let mut sink = [0u8; 8192];
                    while reader.read(&mut sink).await.unwrap_or(0) > 0 {}
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn executor() -> (SandboxExecutor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let exec = SandboxExecutor::new(SandboxMode::Direct, dir.path());
        (exec, dir)
    }

    fn script(body: &str) -> Vec<u8> {
        format!("#!/bin/sh\n{body}\n").into_bytes()
    }

    #[tokio::test]
    async fn successful_run_reports_exit_zero() {
        let (exec, _dir) = executor();
        let input = SandboxInput {
            code: script("echo hello; exit 0"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        let outcome = exec.run(input).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("hello"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let (exec, _dir) = executor();
        let input = SandboxInput {
            code: script("exit 7"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        let outcome = exec.run(input).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(7));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let (exec, _dir) = executor();
        let input = SandboxInput {
            code: script("sleep 30"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 1,
            network_allow: Vec::new(),
        };
        let outcome = exec.run(input).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn environment_is_not_inherited_from_parent() {
        // SAFETY-adjacent note: this only sets an env var on the *test*
        // process, to prove the child never sees it.
        std::env::set_var("BROKER_TEST_AMBIENT_SECRET", "should-not-leak");
        let (exec, _dir) = executor();
        let input = SandboxInput {
            code: script("env"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        let outcome = exec.run(input).await.unwrap();
        std::env::remove_var("BROKER_TEST_AMBIENT_SECRET");
        assert!(!outcome.stdout.contains("BROKER_TEST_AMBIENT_SECRET"));
        assert!(!outcome.stdout.contains("should-not-leak"));
    }

    #[tokio::test]
    async fn declared_secrets_and_args_reach_the_child() {
        let (exec, _dir) = executor();
        let mut secrets = BTreeMap::new();
        secrets.insert("API_TOKEN".to_string(), b"tok-123".to_vec());
        let mut args = BTreeMap::new();
        args.insert("MODE".to_string(), "fast".to_string());
        let input = SandboxInput {
            code: script("env"),
            secrets,
            args,
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        let outcome = exec.run(input).await.unwrap();
        assert!(outcome.stdout.contains("API_TOKEN=tok-123"));
        assert!(outcome.stdout.contains("MODE=fast"));
    }

    #[tokio::test]
    async fn scratch_directory_is_removed_after_run() {
        let (exec, dir) = executor();
        let input = SandboxInput {
            code: script("exit 0"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        exec.run(input).await.unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn containerized_mode_with_empty_runtime_command_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = SandboxExecutor::new(
            SandboxMode::Containerized {
                runtime_command: String::new(),
                runtime_args: Vec::new(),
            },
            dir.path(),
        );
        let input = SandboxInput {
            code: script("exit 0"),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs: 5,
            network_allow: Vec::new(),
        };
        let err = exec.run(input).await.unwrap_err();
        assert!(matches!(err, SandboxError::EmptyRuntimeCommand));
    }
}
