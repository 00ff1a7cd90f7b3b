//! Process-wide shutdown signal.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancels the listener, the liveness sweep and every open session.
#[derive(Clone, Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinator that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by every task that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the signal. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the signal and wait up to `timeout` for `handles` to finish.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining tasks"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}");
        }
    }
}
