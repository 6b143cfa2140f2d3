use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::engine::sandbox::ExecutorLimits;

const MIN_MEMORY_MB: u64 = 32;
const MAX_MEMORY_MB: u64 = 8 * 1024;
const MAX_TIMEOUT_SECS: u64 = 180;
const MAX_LOG_LINES: usize = 1000;
const MIN_OUTPUT_BYTES: usize = 1024;
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub max_concurrent_evaluations: usize,
    pub workspace_root: PathBuf,
    pub sandbox: SandboxLimits,
    pub docker_socket: Option<String>,
    pub prepull_images: Vec<String>,
    pub persistence_path: Option<PathBuf>,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub log_lines: usize,
    /// Cap on bytes read back from any sandbox artifact.
    pub max_output_bytes: usize,
    pub log_file: String,
    pub user_label: String,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            timeout_secs: 120,
            log_lines: 50,
            max_output_bytes: 64 * 1024,
            log_file: "logs.txt".to_string(),
            user_label: "grader.user".to_string(),
        }
    }
}

impl SandboxLimits {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.memory_mb = self.memory_mb.clamp(MIN_MEMORY_MB, MAX_MEMORY_MB);
        self.timeout_secs = self.timeout_secs.clamp(1, MAX_TIMEOUT_SECS);
        self.log_lines = self.log_lines.clamp(1, MAX_LOG_LINES);
        self.max_output_bytes = self
            .max_output_bytes
            .clamp(MIN_OUTPUT_BYTES, MAX_OUTPUT_BYTES);
        if self.log_file.trim().is_empty() || self.log_file.contains('/') {
            self.log_file = defaults.log_file;
        }
        if self.user_label.trim().is_empty() {
            self.user_label = defaults.user_label;
        }
        self
    }

    pub fn executor_limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            memory_bytes: (self.memory_mb * 1024 * 1024) as i64,
            timeout: Duration::from_secs(self.timeout_secs),
            log_file: self.log_file.clone(),
            log_lines: self.log_lines,
            max_output_bytes: self.max_output_bytes,
            user_label: self.user_label.clone(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = SandboxLimits::default();
        Self {
            bind_addr: env_parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            max_concurrent_evaluations: env_parse("MAX_CONCURRENT_EVALUATIONS", 8usize).max(1),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("grader-submissions")),
            sandbox: SandboxLimits {
                memory_mb: env_parse("SANDBOX_MEMORY_MB", defaults.memory_mb),
                timeout_secs: env_parse("SANDBOX_TIMEOUT_SECS", defaults.timeout_secs),
                log_lines: env_parse("SANDBOX_LOG_LINES", defaults.log_lines),
                max_output_bytes: env_parse("SANDBOX_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
                log_file: env::var("SANDBOX_LOG_FILE").unwrap_or(defaults.log_file),
                user_label: env::var("SANDBOX_USER_LABEL").unwrap_or(defaults.user_label),
            }
            .normalized(),
            docker_socket: env::var("DOCKER_SOCKET").ok().filter(|s| !s.trim().is_empty()),
            prepull_images: parse_list(&env::var("PREPULL_IMAGES").unwrap_or_default()),
            persistence_path: env::var("PERSIST_SUBMISSIONS_PATH").ok().map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
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
