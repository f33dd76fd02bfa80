//! The command execution path: registry, validator and provider composed.

use crate::config::ServiceConfig;
use crate::error::{Result, ShellError};
use crate::sandbox::{ExecOutput, ProviderError, SandboxProvider};
use crate::state::SessionRegistry;
use crate::validator::CommandValidator;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Slack past the command timeout for the provider to clean up after an
/// expired command before the service stops waiting on it.
const TIMEOUT_CLEANUP_GRACE: Duration = Duration::from_secs(3);

/// Liveness report for the validator and registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub message: &'static str,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub active_sessions: usize,
    pub backend: &'static str,
}

/// Entry point used by the request gateway.
#[derive(Clone)]
pub struct ShellService {
    registry: SessionRegistry,
    validator: Arc<CommandValidator>,
    command_timeout: Duration,
}

impl ShellService {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: &ServiceConfig) -> Self {
        Self {
            registry: SessionRegistry::new(provider),
            validator: Arc::new(CommandValidator::new(&config.sandbox_user)),
            command_timeout: config.command_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn start_session(&self) -> Result<String> {
        Ok(self.registry.start().await?.id)
    }

    /// Runs one command in the session's sandbox.
    ///
    /// The idle clock is reset before classification, so a rejected command
    /// still counts as activity. Rejected commands never reach the provider.
    pub async fn run_command(&self, session_id: &str, command: &str) -> Result<ExecOutput> {
        let session = self.registry.touch(session_id).await?;

        let verdict = self.validator.classify(command);
        if !verdict.allowed {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "Command not allowed".to_string());
            warn!(session_id, command, reason = %reason, "Command rejected");
            return Err(ShellError::Rejected { reason });
        }
        let command = verdict.normalized_command.as_deref().unwrap_or(command);

        let lock = session.exec_lock();
        let _guard = lock.lock().await;

        // The session may have been ended while this request waited its turn.
        match self.registry.lookup(session_id).await {
            Ok(current) if current.handle == session.handle => {}
            _ => return Err(ShellError::SessionNotFound),
        }

        info!(session_id, command, "Executing command");
        let provider = self.registry.provider();
        let result = tokio::time::timeout(
            self.command_timeout + TIMEOUT_CLEANUP_GRACE,
            provider.exec(&session.handle, command, self.command_timeout),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                info!(session_id, exit_code = output.exit_code, "Command finished");
                Ok(output)
            }
            Ok(Err(ProviderError::TimedOut(_))) | Err(_) => {
                warn!(session_id, command, timeout_ms = self.command_timeout.as_millis() as u64, "Command timed out");
                Err(ShellError::Timeout(self.command_timeout))
            }
            Ok(Err(e)) => Err(ShellError::Execution(e)),
        }
    }

    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.registry.end(session_id).await
    }

    pub async fn status(&self) -> StatusReport {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        StatusReport {
            status: "ok",
            message: "Server is running",
            timestamp,
            active_sessions: self.registry.len().await,
            backend: self.registry.provider().backend_name(),
        }
    }

    /// Tears down every session. Call once the gateway has stopped.
    pub async fn shutdown(&self) -> usize {
        self.registry.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::RecordingProvider;
    use std::time::Instant;

    fn service_with(timeout: Duration) -> (Arc<RecordingProvider>, ShellService) {
        let provider = Arc::new(RecordingProvider::new());
        let config = ServiceConfig {
            command_timeout: timeout,
            ..ServiceConfig::default()
        };
        (provider.clone(), ShellService::new(provider, &config))
    }

    fn service() -> (Arc<RecordingProvider>, ShellService) {
        service_with(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn allowed_command_returns_sandbox_output_verbatim() {
        let (provider, service) = service();
        let id = service.start_session().await.unwrap();

        let output = service.run_command(&id, "ls -la | sort").await.unwrap();
        assert_eq!(output.stdout, "ran: ls -la | sort\n");
        assert_eq!(output.exit_code, 0);
        assert_eq!(provider.executed()[0].1, "ls -la | sort");
    }

    #[tokio::test]
    async fn rejected_command_never_reaches_provider() {
        let (provider, service) = service();
        let id = service.start_session().await.unwrap();

        let err = service.run_command(&id, "sudo rm -rf /").await.unwrap_err();
        match err {
            ShellError::Rejected { reason } => assert!(reason.contains("sudo")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(provider.exec_count(), 0);
    }

    #[tokio::test]
    async fn rejected_command_still_counts_as_activity() {
        let (_, service) = service();
        let id = service.start_session().await.unwrap();
        let before = service.registry().lookup(&id).await.unwrap().last_activity;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _ = service.run_command(&id, "ls; reboot").await;
        let after = service.registry().lookup(&id).await.unwrap().last_activity;
        assert!(after > before);
    }

    #[tokio::test]
    async fn unknown_session_is_distinct_from_rejection() {
        let (provider, service) = service();
        let err = service.run_command("missing", "sudo ls").await.unwrap_err();
        assert!(matches!(err, ShellError::SessionNotFound));
        assert_eq!(provider.exec_count(), 0);
    }

    #[tokio::test]
    async fn timeout_fails_only_the_command() {
        let (provider, service) = service_with(Duration::from_millis(50));
        provider.set_exec_delay(Duration::from_secs(10));
        let id = service.start_session().await.unwrap();

        let started = Instant::now();
        let err = service.run_command(&id, "sleep 100").await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let session = service.registry().lookup(&id).await.unwrap();
        assert!(provider.is_live(&session.handle));
    }

    #[tokio::test]
    async fn timeout_waits_for_provider_cleanup() {
        let (provider, service) = service_with(Duration::from_millis(50));
        provider.set_exec_delay(Duration::from_secs(10));
        provider.set_timeout_cleanup(Duration::from_millis(200));
        let id = service.start_session().await.unwrap();

        let err = service.run_command(&id, "sleep 100").await.unwrap_err();
        assert!(matches!(err, ShellError::Timeout(_)));
        assert_eq!(provider.timeout_cleanups(), 1);
    }

    #[tokio::test]
    async fn end_session_then_command_is_session_not_found() {
        let (_, service) = service();
        let id = service.start_session().await.unwrap();
        service.end_session(&id).await.unwrap();

        assert!(matches!(
            service.run_command(&id, "ls").await,
            Err(ShellError::SessionNotFound)
        ));
        assert!(matches!(
            service.end_session(&id).await,
            Err(ShellError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn commands_in_one_session_are_serialized() {
        let (provider, service) = service();
        provider.set_exec_delay(Duration::from_millis(50));
        let id = service.start_session().await.unwrap();

        let started = Instant::now();
        let (a, b) = tokio::join!(
            service.run_command(&id, "echo a"),
            service.run_command(&id, "echo b")
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn end_waits_for_in_flight_command() {
        let (provider, service) = service();
        provider.set_exec_delay(Duration::from_millis(50));
        let id = service.start_session().await.unwrap();

        let runner = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.run_command(&id, "echo slow").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.end_session(&id).await.unwrap();

        let output = runner.await.unwrap().unwrap();
        assert_eq!(output.stdout, "ran: echo slow\n");
    }

    #[tokio::test]
    async fn provision_failure_surfaces() {
        let (provider, service) = service();
        provider.set_fail_create(true);
        assert!(matches!(
            service.start_session().await,
            Err(ShellError::Provision(_))
        ));
    }

    #[tokio::test]
    async fn status_reports_live_sessions() {
        let (_, service) = service();
        service.start_session().await.unwrap();
        service.start_session().await.unwrap();

        let status = service.status().await;
        assert_eq!(status.status, "ok");
        assert_eq!(status.active_sessions, 2);
        assert_eq!(status.backend, "recording");
        assert!(status.timestamp > 0);
    }

    #[tokio::test]
    async fn shutdown_drains_sandboxes() {
        let (provider, service) = service();
        service.start_session().await.unwrap();
        assert_eq!(service.shutdown().await, 1);
        assert_eq!(provider.live_count(), 0);
    }
}
