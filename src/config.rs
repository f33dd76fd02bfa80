//! Service and sandbox backend configuration.

use crate::validator::DEFAULT_SANDBOX_USER;
use std::time::Duration;

/// Sessions idle longer than this are reaped (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
/// Janitor sweep period (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;
/// Wall-clock bound on a single command.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;
/// Captured bytes kept per output stream (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

pub const DEFAULT_IMAGE: &str = "alpine:latest";
pub const DEFAULT_CONTAINER_PREFIX: &str = "webshell";

/// Settings for the session registry, janitor and command path.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub command_timeout: Duration,
    /// Account inside the sandbox. `chown` is confined to its home directory.
    pub sandbox_user: String,
    /// Browser origins allowed by the CORS layer.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            sandbox_user: DEFAULT_SANDBOX_USER.to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

/// Docker backend settings. One container per session.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub docker_bin: String,
    pub image: String,
    pub container_prefix: String,
    /// Passed through as `--memory`, e.g. `256m`.
    pub memory: Option<String>,
    pub pids_limit: Option<u32>,
    /// Start containers with `--network none`.
    pub no_network: bool,
    /// Per-stream capture limit for `exec`; longer output is truncated.
    pub max_output_bytes: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            memory: None,
            pids_limit: None,
            no_network: true,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}
