use std::{
    path::Path,
    process::Stdio,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::{io::AsyncWriteExt, process::Command, sync::mpsc};

use crate::{
    command::Language,
    config::EngineConfig,
    models::SourceFile,
    sandbox::{
        ExecOutput, ExecutionHandle, Provisioner, Sandbox, attach_child, sandbox_name,
    },
    stream::StreamEvent,
};

const SCRATCH_DIR: &str = "/workspace";

pub struct DockerProvisioner {
    config: EngineConfig,
}

impl DockerProvisioner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn provision(
        &self,
        session_id: &str,
        language: Language,
        online: bool,
    ) -> anyhow::Result<Arc<dyn Sandbox>> {
        let name = sandbox_name(session_id);

        // A crashed prior run may have left a container under this name.
        let _ = docker(&["rm", "-f", name.as_str()]).await;

        let memory = format!("{}m", self.config.memory_limit_mb);
        let cpus = format!("{}", self.config.cpu_limit);
        let pids = format!("{}", self.config.pids_limit);
        let tmpfs = format!(
            "{SCRATCH_DIR}:rw,exec,size={}m",
            self.config.scratch_size_mb
        );

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--cpus".into(),
            cpus,
            "--pids-limit".into(),
            pids,
            "--tmpfs".into(),
            tmpfs,
            "-w".into(),
            SCRATCH_DIR.into(),
        ];
        if !online {
            args.push("--network=none".into());
        }
        args.push(self.config.docker_image(language).to_string());
        // Idle command keeps the container alive between the write-files and
        // run phases.
        args.extend(["sleep".into(), "infinity".into()]);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = docker(&arg_refs)
            .await
            .context("docker is not available")?;
        if output.exit_code != 0 {
            anyhow::bail!("docker run failed: {}", output.stderr.trim());
        }

        tracing::debug!(container = %name, language = language.as_str(), online, "sandbox started");
        Ok(Arc::new(DockerSandbox {
            name,
            destroyed: AtomicBool::new(false),
            max_output_bytes: self.config.max_output_bytes,
        }))
    }
}

pub struct DockerSandbox {
    name: String,
    destroyed: AtomicBool,
    max_output_bytes: usize,
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_files(&self, files: &[SourceFile]) -> anyhow::Result<()> {
        for file in files {
            self.write_file(file).await?;
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> anyhow::Result<ExecOutput> {
        let output = docker(&["exec", self.name.as_str(), "sh", "-c", command]).await?;
        Ok(output)
    }

    async fn copy_in(&self, host_src: &Path, scratch_dst: &str) -> anyhow::Result<()> {
        let dst_dir = format!("{SCRATCH_DIR}/{scratch_dst}");
        let mkdir = self.exec(&format!("mkdir -p '{dst_dir}'")).await?;
        if mkdir.exit_code != 0 {
            anyhow::bail!("mkdir in sandbox failed: {}", mkdir.stderr.trim());
        }
        let src = format!("{}/.", host_src.display());
        let target = format!("{}:{dst_dir}", self.name);
        let output = docker(&["cp", src.as_str(), target.as_str()]).await?;
        if output.exit_code != 0 {
            anyhow::bail!("docker cp into sandbox failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn copy_out(&self, scratch_src: &str, host_dst: &Path) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(host_dst).await?;
        let src = format!("{}:{SCRATCH_DIR}/{scratch_src}/.", self.name);
        let dst = host_dst.display().to_string();
        let output = docker(&["cp", src.as_str(), dst.as_str()]).await?;
        if output.exit_code != 0 {
            anyhow::bail!("docker cp out of sandbox failed: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn seal_network(&self) -> anyhow::Result<()> {
        let output = docker(&["network", "disconnect", "bridge", self.name.as_str()]).await?;
        if output.exit_code != 0 {
            anyhow::bail!(
                "failed to disconnect sandbox network: {}",
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        events: mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ExecutionHandle> {
        let child = Command::new("docker")
            .args(["exec", "-i", "-w", SCRATCH_DIR, self.name.as_str(), "sh", "-c", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker exec")?;
        Ok(attach_child(child, events, self.max_output_bytes))
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match docker(&["rm", "-f", self.name.as_str()]).await {
            Ok(output) if output.exit_code != 0 => {
                tracing::warn!(container = %self.name, stderr = %output.stderr.trim(), "sandbox removal reported an error");
            }
            Err(err) => {
                tracing::warn!(container = %self.name, error = %err, "sandbox removal failed");
            }
            Ok(_) => {}
        }
        Ok(())
    }
}

impl DockerSandbox {
    /// Content crosses the container boundary as a base64 blob piped through
    /// stdin and decoded inside, never as literal shell text.
    async fn write_file(&self, file: &SourceFile) -> anyhow::Result<()> {
        let decode = format!("base64 -d > '{SCRATCH_DIR}/{}'", file.name);
        let mut child = Command::new("docker")
            .args(["exec", "-i", self.name.as_str(), "sh", "-c", decode.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker exec for file transfer")?;

        let encoded = BASE64.encode(file.content.as_bytes());
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(encoded.as_bytes())
                .await
                .context("writing encoded source into sandbox")?;
            stdin.shutdown().await.ok();
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "writing {} into sandbox failed: {}",
                file.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

async fn docker(args: &[&str]) -> anyhow::Result<ExecOutput> {
    let output = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to invoke docker CLI")?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
