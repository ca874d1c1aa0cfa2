//! Handshake latch
//!
//! Latch for waiting on the daemon's `server.connected` handshake. Once
//! triggered (connected or failed) it stays triggered, so a waiter that
//! arrives after the handshake returns immediately. Enforces a single waiter.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum LatchError {
    #[error("Multiple waiters not allowed - only one waiter can wait at a time")]
    MultipleWaiters,

    #[error("Timeout waiting for daemon handshake")]
    Timeout,

    #[error("Latch was cancelled")]
    Cancelled,

    #[error("Daemon startup failed: {0}")]
    StartupFailed(String),
}

#[derive(Debug, Default)]
struct LatchState {
    connected: bool,
    error: Option<String>,
    has_waiter: bool,
}

/// Latch tracking the startup handshake
#[derive(Clone)]
pub struct ReadyLatch {
    state: Arc<Mutex<LatchState>>,
    notify: Arc<Notify>,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LatchState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Wait until the daemon has completed its handshake
    ///
    /// Returns an error if another waiter is already registered, the timeout
    /// elapses, or the daemon died before connecting.
    pub async fn wait(&self, timeout: Duration) -> Result<(), LatchError> {
        let mut state = self.state.lock().await;

        // Handshake may have completed before the waiter arrived
        if state.connected {
            trace!("ReadyLatch: already connected");
            return Ok(());
        }

        if let Some(error) = &state.error {
            return Err(LatchError::StartupFailed(error.clone()));
        }

        if state.has_waiter {
            warn!("ReadyLatch: multiple waiters not allowed");
            return Err(LatchError::MultipleWaiters);
        }

        state.has_waiter = true;
        drop(state);

        let result = tokio::time::timeout(timeout, self.notify.notified()).await;

        {
            let mut state = self.state.lock().await;
            state.has_waiter = false;
        }

        match result {
            Ok(_) => {
                let state = self.state.lock().await;
                if state.connected {
                    Ok(())
                } else if let Some(error) = &state.error {
                    Err(LatchError::StartupFailed(error.clone()))
                } else {
                    warn!("ReadyLatch: notified without a final state");
                    Err(LatchError::Cancelled)
                }
            }
            Err(_) => {
                debug!("ReadyLatch: timeout after {:?}", timeout);
                Err(LatchError::Timeout)
            }
        }
    }

    /// Mark the handshake complete
    pub async fn trigger_connected(&self) {
        let mut state = self.state.lock().await;
        if !state.connected && state.error.is_none() {
            state.connected = true;
            debug!("ReadyLatch: daemon connected");
            self.notify.notify_waiters();
        } else {
            trace!("ReadyLatch: already triggered, ignoring");
        }
    }

    /// Mark the startup failed (process died before the handshake)
    pub async fn trigger_failure(&self, error: String) {
        let mut state = self.state.lock().await;
        if !state.connected && state.error.is_none() {
            debug!("ReadyLatch: startup failed: {}", error);
            state.error = Some(error);
            self.notify.notify_waiters();
        } else {
            trace!("ReadyLatch: already triggered, ignoring");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadyLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyLatch").finish()
    }
}
