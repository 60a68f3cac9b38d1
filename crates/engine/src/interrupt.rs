//! Interruption controller.
//!
//! A run moves forward through `Running -> Draining -> Flushing -> Stopped`
//! and never back. The first interrupt request cancels the shared token, which
//! stops admission of new work and kills must-terminate tools. Cooperative
//! actions finish. A second Ctrl-C aborts the process without flushing; the
//! last flushed store stays valid on disk.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Exit status used when a second interrupt aborts the process.
pub const ABORT_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Admitting new work.
    Running,
    /// No new work; running actions wind down.
    Draining,
    /// Every worker has exited; the store is being persisted.
    Flushing,
    /// No further store mutation happens.
    Stopped,
}

/// Shared handle to one run's interruption state.
#[derive(Debug, Clone)]
pub struct InterruptController {
    token: CancellationToken,
    phase: Arc<Mutex<Phase>>,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            phase: Arc::new(Mutex::new(Phase::Running)),
        }
    }

    /// Token cancelled on the first interrupt.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if it lies ahead of the current phase.
    pub fn advance(&self, next: Phase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if next <= *phase {
            return false;
        }
        debug!(from = ?*phase, to = ?next, "Run phase change");
        *phase = next;
        true
    }

    /// Stop admitting work and cancel must-terminate actions.
    pub fn request_drain(&self) {
        self.token.cancel();
        self.advance(Phase::Draining);
    }

    /// Listen for Ctrl-C (and SIGTERM/SIGHUP on unix) for the rest of the run.
    ///
    /// The caller aborts the returned task once the run is over.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_interrupt().await {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
            warn!("Interrupted: finishing running actions, press Ctrl-C again to abort");
            controller.request_drain();

            if tokio::signal::ctrl_c().await.is_ok() {
                error!("Aborted without saving progress of this run");
                std::process::exit(ABORT_EXIT_CODE);
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_interrupt() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
        _ = hangup.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_phases_only_move_forward() {
        let controller = InterruptController::new();
        assert_eq!(controller.phase(), Phase::Running);

        assert!(controller.advance(Phase::Flushing));
        assert!(!controller.advance(Phase::Draining));
        assert!(!controller.advance(Phase::Flushing));
        assert_eq!(controller.phase(), Phase::Flushing);

        assert!(controller.advance(Phase::Stopped));
        assert!(!controller.advance(Phase::Running));
        assert_eq!(controller.phase(), Phase::Stopped);
    }

    #[test]
    fn test_drain_cancels_token() {
        let controller = InterruptController::new();
        let token = controller.token();
        assert!(!token.is_cancelled());

        controller.request_drain();
        assert!(token.is_cancelled());
        assert!(controller.is_interrupted());
        assert_eq!(controller.phase(), Phase::Draining);

        // Repeated requests are harmless
        controller.request_drain();
        assert_eq!(controller.phase(), Phase::Draining);
    }

    #[test]
    fn test_clones_share_state() {
        let controller = InterruptController::new();
        let other = controller.clone();
        other.request_drain();
        assert!(controller.is_interrupted());
        assert_eq!(controller.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes_waiters() {
        let controller = InterruptController::new();
        let token = controller.token();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.request_drain();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_listener_can_be_aborted() {
        let controller = InterruptController::new();
        let handle = controller.spawn_signal_listener();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(controller.phase(), Phase::Running);
    }
}
