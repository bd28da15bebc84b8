//! Live per-service state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Operational state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Not running
    Cold,
    /// Startup in progress; exclusive per service
    Starting,
    /// Running
    Hot,
    /// Shutdown in progress; treated as Cold for admission
    Stopping,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Cold => write!(f, "cold"),
            Lifecycle::Starting => write!(f, "starting"),
            Lifecycle::Hot => write!(f, "hot"),
            Lifecycle::Stopping => write!(f, "stopping"),
        }
    }
}

/// Whether a Hot service is believed to accept traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    Ready,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::NotReady => write!(f, "not_ready"),
            Readiness::Ready => write!(f, "ready"),
        }
    }
}

/// Mutable in-memory state of one service, guarded by its per-service lock.
#[derive(Debug)]
pub struct ServiceState {
    pub lifecycle: Lifecycle,
    pub readiness: Readiness,
    /// Monotonic activity marker; only ever moves forward
    last_activity_at: Instant,
    /// Incremented on each Cold→Starting transition; fences stale completions
    pub startup_epoch: u64,
    /// Last terminal startup failure, kept for the status endpoint
    pub startup_error: Option<String>,
    /// Effective base URL after a fallback success; cleared on Cold
    pub active_base_url: Option<String>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Cold,
            readiness: Readiness::NotReady,
            last_activity_at: Instant::now(),
            startup_epoch: 0,
            startup_error: None,
            active_base_url: None,
        }
    }

    /// Record activity now. Updates are monotonic per service.
    pub fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }

    /// True when requests may bypass the queue.
    pub fn is_ready(&self) -> bool {
        self.lifecycle == Lifecycle::Hot && self.readiness == Readiness::Ready
    }

    /// Transition out of Hot: readiness is cleared in the same lock scope.
    pub fn begin_stopping(&mut self) {
        self.lifecycle = Lifecycle::Stopping;
        self.readiness = Readiness::NotReady;
    }

    /// Complete a shutdown or failed startup.
    pub fn settle_cold(&mut self) {
        self.lifecycle = Lifecycle::Cold;
        self.readiness = Readiness::NotReady;
        self.active_base_url = None;
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a service for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub service_id: String,
    pub state: Lifecycle,
    pub readiness: Readiness,
    pub queue_pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}
