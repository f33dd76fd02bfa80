//! Periodic reaping of idle sessions.

use crate::state::SessionRegistry;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub struct SessionJanitor {
    registry: SessionRegistry,
    interval: Duration,
    idle_timeout: Duration,
}

impl SessionJanitor {
    pub fn new(registry: SessionRegistry, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// Runs one sweep now. Returns the number of sessions reaped.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let reaped = self.registry.reap_idle(now, self.idle_timeout).await;
        if reaped.is_empty() {
            debug!("Janitor sweep found no idle sessions");
        } else {
            info!(count = reaped.len(), "Janitor reaped idle sessions");
        }
        reaped.len()
    }

    /// Spawns the sweep loop. Abort the returned handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Starting session janitor"
        );
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
