use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
};

use crate::command::Language;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub sandbox_backend: SandboxBackendKind,
    pub memory_limit_mb: u64,
    pub cpu_limit: f32,
    pub pids_limit: u64,
    pub scratch_size_mb: u64,
    pub run_timeout_ms: u64,
    pub install_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub event_channel_capacity: usize,
    pub cache_root: PathBuf,
    pub image_python: String,
    pub image_javascript: String,
    pub image_c: String,
    pub image_cpp: String,
    pub image_java: String,
    pub log_level: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            sandbox_backend: env_parse("SANDBOX_BACKEND", SandboxBackendKind::Docker),
            memory_limit_mb: env_parse("MEMORY_LIMIT_MB", 256u64),
            cpu_limit: env_parse("CPU_LIMIT", 0.5f32),
            pids_limit: env_parse("PIDS_LIMIT", 64u64),
            scratch_size_mb: env_parse("SCRATCH_SIZE_MB", 64u64),
            run_timeout_ms: env_parse("RUN_TIMEOUT_MS", 15_000u64),
            install_timeout_ms: env_parse("INSTALL_TIMEOUT_MS", 120_000u64),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", 256 * 1024usize),
            event_channel_capacity: env_parse("EVENT_CHANNEL_CAPACITY", 256usize).max(2),
            cache_root: env::var("DEPENDENCY_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("runbox-dep-cache")),
            image_python: env_string("IMAGE_PYTHON", "python:3.12-alpine"),
            image_javascript: env_string("IMAGE_JAVASCRIPT", "node:22-alpine"),
            image_c: env_string("IMAGE_C", "gcc:14"),
            image_cpp: env_string("IMAGE_CPP", "gcc:14"),
            image_java: env_string("IMAGE_JAVA", "eclipse-temurin:21"),
            log_level: env_string("LOG_LEVEL", "info"),
        }
    }

    pub fn docker_image(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.image_python,
            Language::JavaScript => &self.image_javascript,
            Language::C => &self.image_c,
            Language::Cpp => &self.image_cpp,
            Language::Java => &self.image_java,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
