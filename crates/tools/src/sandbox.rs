//! Sandboxed execution backends.
//!
//! Each sandboxed tool call runs inside an acquired environment: a writable
//! temp workspace, a scrubbed environment, no host network by default, and a
//! wall-clock timeout. The environment is released on every exit path,
//! including timeout and crash. A handle is leased to one concurrent call at
//! a time, which also covers the long-lived per-session configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use rv_domain::config::SandboxConfig;
use rv_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque reference to an acquired sandbox environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(pub String);

/// Result of one command execution inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// The sandbox capability.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Acquire an isolated environment configured by `spec`.
    async fn acquire(&self, spec: &SandboxConfig) -> Result<SandboxHandle>;

    /// Run a command in the environment. At most one call runs per handle at
    /// a time; concurrent callers wait their turn.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<ExecOutcome>;

    /// Tear the environment down. Idempotent.
    async fn release(&self, handle: &SandboxHandle) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProcessSandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Environment {
    workspace: tempfile::TempDir,
    timeout_seconds: u64,
    /// One concurrent call per handle.
    lease: Arc<Semaphore>,
}

/// Process-backed sandbox: temp-dir workspace, scrubbed environment, and
/// kill-on-timeout. Memory/CPU quotas in [`SandboxConfig`] are meaningful
/// to container backends; this backend enforces the wall clock and leaves
/// resource limits to the host.
#[derive(Default)]
pub struct ProcessSandbox {
    environments: Mutex<HashMap<String, Arc<Environment>>>,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn environment(&self, handle: &SandboxHandle) -> Result<Arc<Environment>> {
        self.environments
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| Error::ToolFailed(format!("sandbox {} is not acquired", handle.0)))
    }

    pub fn active_count(&self) -> usize {
        self.environments.lock().len()
    }

    /// Workspace path for a handle (tests and file-staging callers).
    pub fn workspace_path(&self, handle: &SandboxHandle) -> Result<std::path::PathBuf> {
        Ok(self.environment(handle)?.workspace.path().to_path_buf())
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn acquire(&self, spec: &SandboxConfig) -> Result<SandboxHandle> {
        let workspace = tempfile::TempDir::new().map_err(Error::Io)?;
        let id = format!("sbx_{}", uuid::Uuid::new_v4().simple());

        tracing::debug!(
            id = %id,
            workspace = %workspace.path().display(),
            timeout = spec.timeout_seconds,
            "sandbox acquired"
        );

        self.environments.lock().insert(
            id.clone(),
            Arc::new(Environment {
                workspace,
                timeout_seconds: spec.timeout_seconds,
                lease: Arc::new(Semaphore::new(1)),
            }),
        );
        Ok(SandboxHandle(id))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<ExecOutcome> {
        let env = self.environment(handle)?;

        // Serialize concurrent calls on the same handle.
        let _lease = env
            .lease
            .acquire()
            .await
            .map_err(|_| Error::ToolFailed("sandbox lease closed".into()))?;

        let started = std::time::Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(env.workspace.path());
        // Scrubbed environment: nothing from the host leaks in.
        cmd.env_clear();
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        cmd.env("HOME", env.workspace.path());
        cmd.env("TMPDIR", env.workspace.path());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ToolFailed(format!("failed to spawn: {e}")))?;

        if let Some(input) = stdin {
            if let Some(mut child_stdin) = child.stdin.take() {
                let bytes = input.as_bytes().to_vec();
                let _ = child_stdin.write_all(&bytes).await;
                // Dropping closes the pipe so the child sees EOF.
            }
        } else {
            drop(child.stdin.take());
        }

        let timeout = std::time::Duration::from_secs(env.timeout_seconds);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutcome {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit: output.status.code(),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            }),
            Ok(Err(e)) => Err(Error::ToolFailed(format!("sandbox exec failed: {e}"))),
            Err(_) => {
                // kill_on_drop reaps the child; report the timeout.
                tracing::warn!(
                    handle = %handle.0,
                    timeout_s = env.timeout_seconds,
                    "sandboxed command timed out"
                );
                Ok(ExecOutcome {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<()> {
        // TempDir cleanup happens on drop.
        if self.environments.lock().remove(&handle.0).is_some() {
            tracing::debug!(id = %handle.0, "sandbox released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(timeout: u64) -> SandboxConfig {
        SandboxConfig {
            timeout_seconds: timeout,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(10)).await.unwrap();

        let outcome = sandbox.exec(&handle, "echo sandboxed", None).await.unwrap();
        assert_eq!(outcome.stdout.trim(), "sandboxed");
        assert_eq!(outcome.exit, Some(0));
        assert!(!outcome.timed_out);

        sandbox.release(&handle).await.unwrap();
        assert_eq!(sandbox.active_count(), 0);
    }

    #[tokio::test]
    async fn workspace_is_isolated_and_writable() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(10)).await.unwrap();
        let workspace = sandbox.workspace_path(&handle).unwrap();

        sandbox
            .exec(&handle, "echo data > out.txt", None)
            .await
            .unwrap();
        assert!(workspace.join("out.txt").exists());

        sandbox.release(&handle).await.unwrap();
        // Workspace is gone after release.
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn host_env_does_not_leak() {
        std::env::set_var("RV_SANDBOX_CANARY", "leaked");
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(10)).await.unwrap();

        let outcome = sandbox
            .exec(&handle, "printenv RV_SANDBOX_CANARY; true", None)
            .await
            .unwrap();
        assert!(outcome.stdout.trim().is_empty());

        sandbox.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn stdin_reaches_the_command() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(10)).await.unwrap();

        let outcome = sandbox.exec(&handle, "cat", Some("pipe me")).await.unwrap();
        assert_eq!(outcome.stdout, "pipe me");

        sandbox.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(1)).await.unwrap();

        let outcome = sandbox.exec(&handle, "sleep 30", None).await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.exit.is_none());

        sandbox.release(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent_and_exec_after_release_errors() {
        let sandbox = ProcessSandbox::new();
        let handle = sandbox.acquire(&spec(10)).await.unwrap();
        sandbox.release(&handle).await.unwrap();
        sandbox.release(&handle).await.unwrap();
        assert!(sandbox.exec(&handle, "true", None).await.is_err());
    }
}
