//! Session registry: binds session ids to sandbox handles.

use crate::error::{Result, ShellError};
use crate::sandbox::{ProviderError, SandboxHandle, SandboxProvider};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// A live session. Snapshots handed out by the registry are clones; the
/// registry's own copy is the one that owns the sandbox.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub handle: SandboxHandle,
    pub created_at: Instant,
    pub last_activity: Instant,
    exec_lock: Arc<Mutex<()>>,
}

impl Session {
    fn new(id: String, handle: SandboxHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            last_activity: now,
            exec_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Serializes sandbox calls for this session.
    pub(crate) fn exec_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.exec_lock)
    }
}

type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// Shared, cloneable registry of live sessions.
///
/// Every mutation of a given id happens under the table's write lock, so
/// start, touch and end are atomic with respect to each other and to the
/// janitor. Removal from the table decides who tears a sandbox down: only the
/// caller that removed the entry ever calls `destroy`.
#[derive(Clone)]
pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    sessions: Sessions,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    /// Provisions a sandbox and registers a session for it under a fresh
    /// random id.
    pub async fn start(&self) -> Result<Session> {
        let handle = self.provider.create().await.map_err(|e| {
            error!(error = %e, "Sandbox provisioning failed");
            ShellError::Provision(e)
        })?;

        let mut sessions = self.sessions.write().await;
        if sessions.values().any(|s| s.handle == handle) {
            // The handle belongs to a live session, so it must not be destroyed here.
            error!(handle = %handle, "Backend returned a handle that is already in use");
            return Err(ShellError::Provision(ProviderError::Unavailable(format!(
                "duplicate sandbox handle {handle}"
            ))));
        }

        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Session::new(id.clone(), handle);
        info!(session_id = %id, handle = %session.handle, "Session created");
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn lookup(&self, id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(ShellError::SessionNotFound)
    }

    /// Refreshes the idle clock of a live session. Never creates one.
    pub async fn touch(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or(ShellError::SessionNotFound)?;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    /// Removes the session and destroys its sandbox. A second caller for the
    /// same id gets `SessionNotFound`.
    pub async fn end(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or(ShellError::SessionNotFound)?;
        self.teardown(session).await;
        info!(session_id = %id, "Session ended");
        Ok(())
    }

    /// Removes every session idle for longer than `idle_timeout` as of `now`
    /// and tears each one down. Returns the reaped ids.
    pub async fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<String> {
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.idle_for(now) > idle_timeout)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let ids: Vec<String> = expired.iter().map(|s| s.id.clone()).collect();
        join_all(expired.into_iter().map(|session| async move {
            info!(session_id = %session.id, idle_secs = session.idle_for(now).as_secs(), "Reaping idle session");
            self.teardown(session).await;
        }))
        .await;
        ids
    }

    /// Tears down every live session. Used at shutdown.
    pub async fn drain(&self) -> usize {
        let all: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = all.len();
        join_all(all.into_iter().map(|session| self.teardown(session))).await;
        if count > 0 {
            info!(count, "Drained sessions");
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Shared by `end`, the janitor and `drain`. Waits for an in-flight
    /// command on the session, then destroys the sandbox. Failures are logged
    /// and swallowed.
    async fn teardown(&self, session: Session) {
        let lock = session.exec_lock();
        let _guard = lock.lock().await;
        match self.provider.destroy(&session.handle).await {
            Ok(()) => debug!(session_id = %session.id, handle = %session.handle, "Sandbox destroyed"),
            Err(ProviderError::NotFound(_)) => {
                debug!(session_id = %session.id, handle = %session.handle, "Sandbox already gone")
            }
            Err(e) => warn!(
                session_id = %session.id,
                handle = %session.handle,
                error = %e,
                "Sandbox teardown failed"
            ),
        }
    }
}
