use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{process::Command, sync::mpsc};

use crate::{
    cache::copy_tree,
    command::Language,
    config::EngineConfig,
    models::SourceFile,
    sandbox::{
        ExecOutput, ExecutionHandle, Provisioner, Sandbox, attach_child, sandbox_name,
    },
    stream::StreamEvent,
};

/// Runs programs directly on the host in a throwaway scratch directory.
/// No memory or network isolation; exists for development and tests, the
/// docker backend is the default.
pub struct ProcessProvisioner {
    config: EngineConfig,
}

impl ProcessProvisioner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provisioner for ProcessProvisioner {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn provision(
        &self,
        session_id: &str,
        _language: Language,
        _online: bool,
    ) -> anyhow::Result<Arc<dyn Sandbox>> {
        let name = sandbox_name(session_id);
        let scratch = std::env::temp_dir().join(&name);

        // Deterministic path per session id; clear out anything a crashed
        // prior run left behind.
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        tokio::fs::create_dir_all(&scratch)
            .await
            .context("failed to create scratch directory")?;

        Ok(Arc::new(ProcessSandbox {
            name,
            scratch,
            destroyed: AtomicBool::new(false),
            max_output_bytes: self.config.max_output_bytes,
        }))
    }
}

pub struct ProcessSandbox {
    name: String,
    scratch: PathBuf,
    destroyed: AtomicBool,
    max_output_bytes: usize,
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_files(&self, files: &[SourceFile]) -> anyhow::Result<()> {
        for file in files {
            tokio::fs::write(self.scratch.join(&file.name), file.content.as_bytes())
                .await
                .with_context(|| format!("writing {} into scratch", file.name))?;
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> anyhow::Result<ExecOutput> {
        let output = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.scratch)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run command in scratch")?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn copy_in(&self, host_src: &Path, scratch_dst: &str) -> anyhow::Result<()> {
        copy_tree(host_src, &self.scratch.join(scratch_dst))
            .await
            .context("copying dependency tree into scratch")?;
        Ok(())
    }

    async fn copy_out(&self, scratch_src: &str, host_dst: &Path) -> anyhow::Result<()> {
        copy_tree(&self.scratch.join(scratch_src), host_dst)
            .await
            .context("copying dependency tree out of scratch")?;
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ExecutionHandle> {
        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.scratch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn process in scratch")?;
        Ok(attach_child(child, events, self.max_output_bytes))
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = tokio::fs::remove_dir_all(&self.scratch).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(sandbox = %self.name, error = %err, "scratch removal failed");
            }
        }
        Ok(())
    }
}
