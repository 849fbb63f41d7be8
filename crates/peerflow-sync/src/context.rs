//! Activity context: cancellation, heartbeats and structured logging.
//!
//! Every sync activity receives an [`ActivityContext`] from the workflow
//! host. The context carries the cooperative cancellation token observed at
//! every suspension point and a heartbeat sink the host uses to detect
//! stalls. Heartbeat emission is non-blocking.

use crate::error::{Result, SyncError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Interval between heartbeats during staging and merge.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Non-blocking heartbeat sink provided by the workflow host.
pub trait Heartbeat: Send + Sync {
    /// Record one heartbeat with a one-line status.
    fn beat(&self, status: &str);
}

/// Default sink: heartbeats land in the structured log.
#[derive(Debug, Default)]
pub struct LogHeartbeat;

impl Heartbeat for LogHeartbeat {
    fn beat(&self, status: &str) {
        info!(heartbeat = status, "activity heartbeat");
    }
}

/// Per-invocation context for a sync activity.
#[derive(Clone)]
pub struct ActivityContext {
    /// Flow this activity belongs to
    pub flow_job_name: String,
    /// Cooperative cancellation signal
    pub cancel: CancellationToken,
    heartbeat: Arc<dyn Heartbeat>,
}

impl ActivityContext {
    /// Create a context with a fresh cancellation token and the log sink.
    pub fn new(flow_job_name: impl Into<String>) -> Self {
        Self {
            flow_job_name: flow_job_name.into(),
            cancel: CancellationToken::new(),
            heartbeat: Arc::new(LogHeartbeat),
        }
    }

    /// Replace the heartbeat sink.
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Replace the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Emit one heartbeat.
    pub fn heartbeat(&self, status: impl AsRef<str>) {
        self.heartbeat.beat(status.as_ref());
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Error out if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::cancelled(format!(
                "activity for flow {} cancelled",
                self.flow_job_name
            )))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("flow_job_name", &self.flow_job_name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Background ticker that emits a heartbeat on a fixed interval for as long
/// as it is held. Dropping the routine stops it.
pub struct HeartbeatRoutine {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatRoutine {
    /// Spawn a ticker that emits `status()` every `interval`.
    pub fn spawn<F>(ctx: &ActivityContext, interval: Duration, status: F) -> Self
    where
        F: Fn() -> String + Send + 'static,
    {
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the routine only
            // reports elapsed wall time.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = ticker.tick() => ctx.heartbeat(status()),
                }
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatRoutine {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
