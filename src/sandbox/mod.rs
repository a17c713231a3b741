mod docker;
mod process;

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    process::Child,
    sync::{mpsc, oneshot},
};

use crate::{
    command::Language,
    config::{EngineConfig, SandboxBackendKind},
    models::SourceFile,
    stream::{self, StreamEvent},
};

pub use docker::DockerProvisioner;
pub use process::ProcessProvisioner;

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitSummary {
    pub exit_code: i32,
    pub killed: bool,
}

/// The live stream connection to a process running inside a sandbox. At most
/// one is active per sandbox.
pub struct ExecutionHandle {
    stdin: mpsc::Sender<String>,
    kill: Option<oneshot::Sender<()>>,
    done: oneshot::Receiver<ExitSummary>,
}

impl ExecutionHandle {
    pub fn from_parts(
        stdin: mpsc::Sender<String>,
        kill: oneshot::Sender<()>,
        done: oneshot::Receiver<ExitSummary>,
    ) -> Self {
        Self {
            stdin,
            kill: Some(kill),
            done,
        }
    }

    pub fn stdin(&self) -> mpsc::Sender<String> {
        self.stdin.clone()
    }

    pub fn take_kill(&mut self) -> Option<oneshot::Sender<()>> {
        self.kill.take()
    }

    /// Resolves once the process has exited and both output pumps have
    /// drained.
    pub async fn wait(self) -> ExitSummary {
        self.done.await.unwrap_or(ExitSummary {
            exit_code: -1,
            killed: true,
        })
    }
}

/// An isolated execution environment bound to exactly one session.
/// `destroy` is idempotent: implementations latch the first call and treat
/// every later one as a successful no-op.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;

    async fn write_files(&self, files: &[SourceFile]) -> anyhow::Result<()>;

    /// Runs a command to completion inside the scratch directory. Used for
    /// dependency installs, not for user programs.
    async fn exec(&self, command: &str) -> anyhow::Result<ExecOutput>;

    /// Copies a host directory into the scratch directory.
    async fn copy_in(&self, host_src: &Path, scratch_dst: &str) -> anyhow::Result<()>;

    /// Copies a scratch directory out to the host.
    async fn copy_out(&self, scratch_src: &str, host_dst: &Path) -> anyhow::Result<()>;

    /// Drops network access after an online dependency install. No-op for
    /// backends without a network boundary.
    async fn seal_network(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ExecutionHandle>;

    async fn destroy(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Creates and starts a sandbox for the session. `online` is set only
    /// when a declared-dependency cache miss needs an in-sandbox install;
    /// the session manager seals the network again before the user program
    /// runs.
    async fn provision(
        &self,
        session_id: &str,
        language: Language,
        online: bool,
    ) -> anyhow::Result<Arc<dyn Sandbox>>;
}

pub struct ProvisionerFactory;

impl ProvisionerFactory {
    pub fn from_config(config: &EngineConfig) -> Arc<dyn Provisioner> {
        match config.sandbox_backend {
            SandboxBackendKind::Docker => Arc::new(DockerProvisioner::new(config.clone())),
            SandboxBackendKind::Process => Arc::new(ProcessProvisioner::new(config.clone())),
        }
    }
}

/// Wires a spawned child process up as an [`ExecutionHandle`]: stdin relay
/// task (each submitted chunk is newline-terminated), one pump per output
/// pipe, and a driver that waits for exit or a kill signal and reports only
/// after both pumps drained.
pub(crate) fn attach_child(
    mut child: Child,
    events: mpsc::Sender<StreamEvent>,
    max_output_bytes: usize,
) -> ExecutionHandle {
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(16);
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(chunk) = stdin_rx.recv().await {
                let mut bytes = chunk.into_bytes();
                bytes.push(b'\n');
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });
    }

    let stdout_pump = child.stdout.take().map(|pipe| {
        tokio::spawn(stream::pump_reader(
            pipe,
            events.clone(),
            StreamEvent::Output,
            max_output_bytes,
        ))
    });
    let stderr_pump = child.stderr.take().map(|pipe| {
        tokio::spawn(stream::pump_reader(
            pipe,
            events.clone(),
            StreamEvent::Error,
            max_output_bytes,
        ))
    });

    let (done_tx, done_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = kill_rx => {
                let _ = child.kill().await;
                None
            }
        };
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }
        let summary = match status {
            Some(status) => ExitSummary {
                exit_code: status.code().unwrap_or(-1),
                killed: false,
            },
            None => ExitSummary {
                exit_code: -1,
                killed: true,
            },
        };
        let _ = done_tx.send(summary);
    });

    ExecutionHandle::from_parts(stdin_tx, kill_tx, done_rx)
}

/// Sandbox names must be valid container names; anything outside the safe
/// alphabet collapses to '-'. Deterministic per session id, so a stale
/// sandbox from a crashed prior run can be found and removed.
pub(crate) fn sandbox_name(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("runbox-{sanitized}")
}

#[cfg(test)]
mod tests {
    use super::sandbox_name;

    #[test]
    fn sandbox_names_are_deterministic_and_safe() {
        assert_eq!(sandbox_name("user-1"), "runbox-user-1");
        assert_eq!(sandbox_name("user-1"), sandbox_name("user-1"));
        assert_eq!(sandbox_name("a b/c"), "runbox-a-b-c");
    }
}
