//! Shutdown coordination via `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::errors::SupervisorError;

/// Default time allowed for the consume loop to finish after shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancellation flag shared by the consume loop, backoff sleep and resync
/// task, plus a one-shot start guard.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Claim the right to start. Succeeds at most once, and never after
    /// [`Self::shutdown`].
    pub fn begin(&self) -> Result<(), SupervisorError> {
        if self.token.is_cancelled() {
            return Err(SupervisorError::ShutDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::AlreadyStarted);
        }
        Ok(())
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Child token, cancelled with this coordinator or on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait up to `timeout` for `handle`; abort it on timeout.
    /// Returns `true` if the task finished on its own.
    pub async fn shutdown_and_join(&self, handle: JoinHandle<()>, timeout: Duration) -> bool {
        self.shutdown();
        info!(timeout_ms = timeout.as_millis() as u64, "waiting for supervisor loop to exit");

        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "supervisor loop ended abnormally");
                true
            }
            Err(_) => {
                warn!("shutdown timed out after {timeout:?}, aborting supervisor loop");
                abort.abort();
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
