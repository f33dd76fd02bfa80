//! Sandbox provider capability and the Docker backend.
//!
//! The registry and the command path only see [`SandboxProvider`]; the
//! isolation mechanism behind it can be swapped without touching either.

use crate::config::DockerConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Appended to a stream cut off at the output limit.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Bound on the best-effort cleanup exec after a timeout or overflow.
const STRAY_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque reference to one live sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox {0} not found")]
    NotFound(SandboxHandle),
    #[error("command timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle operations of an isolation backend.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Provisions a fresh sandbox. Never retried by callers.
    async fn create(&self) -> Result<SandboxHandle, ProviderError>;

    /// Runs `command` inside the sandbox, bounded by `timeout`.
    ///
    /// On expiry the backend returns [`ProviderError::TimedOut`] and should
    /// stop whatever the command left running in the sandbox before
    /// returning, so the next command on the handle does not run alongside
    /// it. Backends may cap captured output; see [`DockerProvider`].
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ProviderError>;

    /// Releases the sandbox. Returns [`ProviderError::NotFound`] when the
    /// handle is already gone, which callers treat as a no-op.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError>;
}

/// One detached container per session, driven through the docker CLI.
///
/// `exec` captures at most `max_output_bytes` of each stream. When a stream
/// goes past the limit the docker client is killed, the captured text is
/// truncated with [`TRUNCATION_MARKER`] appended, and the exit code is
/// whatever the killed client reports (137 for SIGKILL). After a timeout or an overflow every process in the
/// container except its init is killed with `kill -9 -1`. This is best
/// effort: a failure is logged and does not change the result.
pub struct DockerProvider {
    config: DockerConfig,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn container_name(&self) -> String {
        format!("{}-{}", self.config.container_prefix, uuid::Uuid::new_v4())
    }

    fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if self.config.no_network {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if let Some(ref memory) = self.config.memory {
            args.extend(["--memory".to_string(), memory.clone()]);
        }
        if let Some(pids) = self.config.pids_limit {
            args.extend(["--pids-limit".to_string(), pids.to_string()]);
        }
        args.push(self.config.image.clone());
        args.extend(["tail", "-f", "/dev/null"].map(String::from));
        args
    }

    /// Kills everything in the container except its init process.
    async fn kill_stray_processes(&self, handle: &SandboxHandle) {
        let kill = self
            .docker()
            .args(["exec", handle.as_str(), "kill", "-9", "-1"])
            .output();
        match tokio::time::timeout(STRAY_KILL_TIMEOUT, kill).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(container = %handle, "Killed stray processes")
            }
            Ok(Ok(output)) => debug!(
                container = %handle,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "No stray processes killed"
            ),
            Ok(Err(e)) => warn!(container = %handle, error = %e, "Failed to kill stray processes"),
            Err(_) => warn!(container = %handle, "Killing stray processes timed out"),
        }
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self) -> Result<SandboxHandle, ProviderError> {
        let name = self.container_name();
        let output = self
            .docker()
            .args(self.run_args(&name))
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("spawn docker: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Unavailable(format!(
                "docker run failed: {}",
                stderr.trim()
            )));
        }

        info!(container = %name, image = %self.config.image, "Container started");
        Ok(SandboxHandle::new(name))
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ProviderError> {
        // The command reaches `sh` inside the container as a single argv
        // element; the host never interprets it.
        let mut child = self
            .docker()
            .args(["exec", handle.as_str(), "sh", "-c", command])
            .spawn()
            .map_err(|e| ProviderError::Exec(format!("spawn docker exec: {e}")))?;

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let overflow = Notify::new();

        let capture = async {
            let readers = async {
                tokio::join!(
                    read_capped(stdout, limit, &overflow),
                    read_capped(stderr, limit, &overflow)
                )
            };
            tokio::pin!(readers);
            let (out, err) = tokio::select! {
                streams = &mut readers => streams,
                _ = overflow.notified() => {
                    let _ = child.start_kill();
                    (&mut readers).await
                }
            };
            let (out, err) = (out?, err?);
            if out.1 || err.1 {
                let _ = child.start_kill();
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, err, status))
        };

        let captured = tokio::time::timeout(timeout, capture).await;
        let ((stdout, stdout_cut), (stderr, stderr_cut), status) = match captured {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.start_kill();
                self.kill_stray_processes(handle).await;
                return Err(ProviderError::TimedOut(timeout));
            }
        };

        if stdout_cut || stderr_cut {
            warn!(container = %handle, limit, "Command output exceeded limit, truncated");
            self.kill_stray_processes(handle).await;
        }

        Ok(ExecOutput {
            stdout: captured_text(&stdout, stdout_cut),
            stderr: captured_text(&stderr, stderr_cut),
            exit_code: exit_code(status),
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), ProviderError> {
        let output = self
            .docker()
            .args(["rm", "-f", handle.as_str()])
            .output()
            .await?;

        if output.status.success() {
            debug!(container = %handle, "Container removed");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Err(ProviderError::NotFound(handle.clone()))
        } else {
            Err(ProviderError::Teardown(stderr.trim().to_string()))
        }
    }
}

/// Reads up to `limit` bytes. Stops early with the flag set, and signals
/// `overflow`, once the stream has more than that.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
    overflow: &Notify,
) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        buf.truncate(limit);
        overflow.notify_one();
        return Ok((buf, true));
    }
    Ok((buf, false))
}

fn captured_text(bytes: &[u8], truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> DockerProvider {
        DockerProvider::new(DockerConfig {
            memory: Some("128m".to_string()),
            pids_limit: Some(64),
            ..DockerConfig::default()
        })
    }

    #[test]
    fn container_names_are_prefixed_and_unique() {
        let provider = provider();
        let a = provider.container_name();
        let b = provider.container_name();
        assert!(a.starts_with("webshell-"));
        assert_ne!(a, b);
    }

    #[test]
    fn run_args_isolate_network_and_apply_limits() {
        let args = provider().run_args("webshell-test");
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name webshell-test"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 128m"));
        assert!(joined.contains("--pids-limit 64"));
        assert!(joined.ends_with("alpine:latest tail -f /dev/null"));
    }

    #[test]
    fn run_args_without_network_isolation() {
        let provider = DockerProvider::new(DockerConfig {
            no_network: false,
            ..DockerConfig::default()
        });
        let args = provider.run_args("c");
        assert!(!args.contains(&"--network".to_string()));
    }

    #[tokio::test]
    async fn missing_docker_binary_is_a_provision_failure() {
        let provider = DockerProvider::new(DockerConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..DockerConfig::default()
        });
        let err = provider.create().await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_docker_binary_fails_exec() {
        let provider = DockerProvider::new(DockerConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..DockerConfig::default()
        });
        let handle = SandboxHandle::new("webshell-x");
        let err = provider
            .exec(&handle, "ls", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exec(_)));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_maps_to_shell_convention() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        // Exit code 2 is encoded in the high byte of the wait status.
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
        // Killed by SIGKILL.
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    /// Stands in for the docker CLI: logs its argv and runs `exec NAME sh -c
    /// CMD` as a local `sh -c CMD`. Any other invocation is only logged.
    #[cfg(unix)]
    struct FakeDocker {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    impl FakeDocker {
        fn new() -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let script = format!(
                "#!/bin/sh\n\
                 echo \"$@\" >> '{}'\n\
                 if [ \"$1\" = exec ] && [ \"$3\" = sh ] && [ \"$4\" = -c ]; then\n\
                 \x20 exec sh -c \"$5\"\n\
                 fi\n\
                 exit 0\n",
                log.display()
            );
            let bin = dir.path().join("docker");
            std::fs::write(&bin, script).unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        fn provider(&self, max_output_bytes: usize) -> DockerProvider {
            DockerProvider::new(DockerConfig {
                docker_bin: self.dir.path().join("docker").display().to_string(),
                max_output_bytes,
                ..DockerConfig::default()
            })
        }

        fn calls(&self) -> String {
            std::fs::read_to_string(self.dir.path().join("calls.log")).unwrap_or_default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_captures_both_streams_and_exit_code() {
        let docker = FakeDocker::new();
        let provider = docker.provider(1024);
        let handle = SandboxHandle::new("webshell-a");

        let output = provider
            .exec(&handle, "echo out; echo err >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        assert!(!docker.calls().contains("kill -9 -1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_truncates_output_past_the_limit() {
        let docker = FakeDocker::new();
        let provider = docker.provider(1024);
        let handle = SandboxHandle::new("webshell-b");

        let output = provider
            .exec(
                &handle,
                "head -c 16777216 /dev/zero | tr '\\0' a",
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.len(), 1024 + TRUNCATION_MARKER.len());
        assert!(output.stdout.starts_with("aaaa"));
        assert!(output.stdout.ends_with(TRUNCATION_MARKER));
        assert!(output.stderr.is_empty());
        assert!(docker.calls().contains("exec webshell-b kill -9 -1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_output_at_the_limit_is_kept_whole() {
        let docker = FakeDocker::new();
        let provider = docker.provider(8);

        let output = provider
            .exec(&SandboxHandle::new("webshell-c"), "printf 12345678", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, "12345678");
        assert_eq!(output.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_timeout_kills_processes_left_in_the_container() {
        let docker = FakeDocker::new();
        let provider = docker.provider(1024);
        let handle = SandboxHandle::new("webshell-d");

        let started = std::time::Instant::now();
        let err = provider
            .exec(&handle, "sleep 5", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(docker.calls().contains("exec webshell-d kill -9 -1"));
    }

    #[tokio::test]
    async fn recording_provider_destroy_is_idempotent() {
        let provider = testing::RecordingProvider::new();
        let handle = provider.create().await.unwrap();
        provider.destroy(&handle).await.unwrap();
        let second = provider.destroy(&handle).await;
        assert!(matches!(second, Err(ProviderError::NotFound(_))));
        assert_eq!(provider.destroy_count(&handle), 2);
    }
}
