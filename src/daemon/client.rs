//! Typed formatter daemon client
//!
//! `FormatterClient` is the façade over the RPC dispatcher: it owns the
//! startup handshake, derives capabilities from the reported version, exposes
//! the `edit.format` operation and re-raises dispatcher termination as its
//! own event. Per instance the state machine is
//! `Starting -> Idle/Formatting -> Terminated`, with `Terminated` absorbing;
//! a terminated client is replaced wholesale, never reconnected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::daemon::capabilities::FormatterCapabilities;
use crate::daemon::error::FormatterError;
use crate::daemon::latch::{LatchError, ReadyLatch};
use crate::daemon::types::{
    EditFormatRequest, EditFormatResponse, ServerConnectedNotification, ServerErrorNotification,
    ServerStatusNotification,
};
use crate::rpc::events::{SubscriberList, Subscription};
use crate::rpc::{RpcDispatcher, RpcError, TerminatedEvent};

// ============================================================================
// Protocol Profile
// ============================================================================

/// Method and event names for one daemon protocol generation
///
/// Daemon variants differ only in these names; selecting a profile at
/// construction configures the client for a variant without subclassing.
#[derive(Debug, Clone)]
pub struct ProtocolProfile {
    pub format_method: &'static str,
    pub connected_event: &'static str,
    pub error_event: &'static str,
    pub status_event: &'static str,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self {
            format_method: "edit.format",
            connected_event: "server.connected",
            error_event: "server.error",
            status_event: "server.status",
        }
    }
}

// ============================================================================
// Client State
// ============================================================================

/// Observable client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Process spawned, handshake not yet received
    Starting,
    /// Connected and idle
    Idle,
    /// Connected, the daemon reports formatting in progress
    Formatting,
    /// Connection is gone; absorbing
    Terminated,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Starting => write!(f, "starting"),
            ClientState::Idle => write!(f, "idle"),
            ClientState::Formatting => write!(f, "formatting"),
            ClientState::Terminated => write!(f, "terminated"),
        }
    }
}

// ============================================================================
// Formatter Client
// ============================================================================

pub struct FormatterClient {
    dispatcher: Arc<RpcDispatcher>,
    profile: ProtocolProfile,

    ready: ReadyLatch,
    connected: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    formatting: Arc<AtomicBool>,

    capabilities: Arc<StdMutex<FormatterCapabilities>>,
    connected_info: Arc<StdMutex<Option<ServerConnectedNotification>>>,

    /// Woken whenever the daemon reports formatting finished
    format_idle: Arc<Notify>,

    server_error_subscribers: Arc<SubscriberList<FormatterError>>,
    terminated_subscribers: Arc<SubscriberList<TerminatedEvent>>,

    // Dropped with the client, unregistering everything it subscribed
    _notification_subscriptions: Vec<Subscription<Value>>,
    _terminated_subscription: Subscription<TerminatedEvent>,
}

impl FormatterClient {
    /// Build a client over a dispatcher using the given protocol profile
    pub fn new(dispatcher: Arc<RpcDispatcher>, profile: ProtocolProfile) -> Self {
        let ready = ReadyLatch::new();
        let connected = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let formatting = Arc::new(AtomicBool::new(false));
        let capabilities = Arc::new(StdMutex::new(FormatterCapabilities::empty()));
        let connected_info = Arc::new(StdMutex::new(None));
        let format_idle = Arc::new(Notify::new());
        let server_error_subscribers = Arc::new(SubscriberList::new());
        let terminated_subscribers = Arc::new(SubscriberList::new());

        let mut subscriptions = Vec::new();

        // server.connected: the sole readiness signal; capabilities are set
        // exactly once and read-only afterward
        {
            let ready = ready.clone();
            let connected = Arc::clone(&connected);
            let capabilities = Arc::clone(&capabilities);
            let connected_info = Arc::clone(&connected_info);
            subscriptions.push(dispatcher.subscribe_notification(
                profile.connected_event,
                move |params| {
                    let notification: ServerConnectedNotification =
                        match serde_json::from_value(params.clone()) {
                            Ok(notification) => notification,
                            Err(e) => {
                                warn!("Malformed server.connected payload: {}", e);
                                return;
                            }
                        };

                    if connected.swap(true, Ordering::SeqCst) {
                        warn!("Duplicate server.connected notification ignored");
                        return;
                    }

                    info!(
                        "Formatter daemon connected: version {} (pid {})",
                        notification.version, notification.pid
                    );

                    // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
                    *capabilities.lock().unwrap() =
                        FormatterCapabilities::from_version(&notification.version);
                    // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
                    *connected_info.lock().unwrap() = Some(notification);

                    let ready = ready.clone();
                    tokio::spawn(async move { ready.trigger_connected().await });
                },
            ));
        }

        // server.error: normalized to the same error shape as request-level
        // failures so subscribers handle one type
        {
            let server_error_subscribers = Arc::clone(&server_error_subscribers);
            subscriptions.push(dispatcher.subscribe_notification(
                profile.error_event,
                move |params| {
                    let notification: ServerErrorNotification =
                        match serde_json::from_value(params.clone()) {
                            Ok(notification) => notification,
                            Err(e) => {
                                warn!("Malformed server.error payload: {}", e);
                                return;
                            }
                        };

                    error!(
                        "Formatter daemon reported {} error: {}",
                        if notification.is_fatal { "fatal" } else { "non-fatal" },
                        notification.message
                    );

                    server_error_subscribers.fire(&FormatterError::Daemon {
                        code: if notification.is_fatal {
                            "SERVER_FATAL_ERROR".to_string()
                        } else {
                            "SERVER_ERROR".to_string()
                        },
                        message: notification.message,
                        stack_trace: notification.stack_trace,
                    });
                },
            ));
        }

        // server.status: drives the formatting flag and wakes
        // currently_formatting waiters when the daemon goes idle
        {
            let formatting = Arc::clone(&formatting);
            let format_idle = Arc::clone(&format_idle);
            subscriptions.push(dispatcher.subscribe_notification(
                profile.status_event,
                move |params| {
                    let notification: ServerStatusNotification =
                        match serde_json::from_value(params.clone()) {
                            Ok(notification) => notification,
                            Err(e) => {
                                warn!("Malformed server.status payload: {}", e);
                                return;
                            }
                        };

                    if let Some(status) = notification.format {
                        formatting.store(status.is_formatting, Ordering::SeqCst);
                        if !status.is_formatting {
                            format_idle.notify_waiters();
                        }
                    }
                },
            ));
        }

        // Dispatcher termination is re-raised as the client's own event
        let terminated_subscription = {
            let ready = ready.clone();
            let terminated = Arc::clone(&terminated);
            let formatting = Arc::clone(&formatting);
            let format_idle = Arc::clone(&format_idle);
            let terminated_subscribers = Arc::clone(&terminated_subscribers);
            dispatcher.subscribe_terminated(move |event| {
                debug!(
                    "FormatterClient: daemon terminated (with_error: {})",
                    event.with_error
                );
                terminated.store(true, Ordering::SeqCst);
                formatting.store(false, Ordering::SeqCst);
                format_idle.notify_waiters();

                let ready = ready.clone();
                tokio::spawn(async move {
                    ready
                        .trigger_failure("daemon terminated before connecting".to_string())
                        .await;
                });

                terminated_subscribers.fire(event);
            })
        };

        Self {
            dispatcher,
            profile,
            ready,
            connected,
            terminated,
            formatting,
            capabilities,
            connected_info,
            format_idle,
            server_error_subscribers,
            terminated_subscribers,
            _notification_subscriptions: subscriptions,
            _terminated_subscription: terminated_subscription,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Wait for the startup handshake
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), FormatterError> {
        match self.ready.wait(timeout).await {
            Ok(()) => Ok(()),
            Err(LatchError::Timeout) => Err(FormatterError::operation_timeout(
                "startup handshake",
                timeout,
            )),
            Err(e) => Err(FormatterError::startup_failed(e.to_string())),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        if self.terminated.load(Ordering::SeqCst) {
            ClientState::Terminated
        } else if !self.connected.load(Ordering::SeqCst) {
            ClientState::Starting
        } else if self.formatting.load(Ordering::SeqCst) {
            ClientState::Formatting
        } else {
            ClientState::Idle
        }
    }

    /// Whether the startup handshake has been received
    pub fn has_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Capabilities derived from the handshake (empty before it)
    pub fn capabilities(&self) -> FormatterCapabilities {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.capabilities.lock().unwrap().clone()
    }

    /// Handshake payload, when received
    pub fn connected_info(&self) -> Option<ServerConnectedNotification> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.connected_info.lock().unwrap().clone()
    }

    /// Propagate a termination decision into the dispatcher
    ///
    /// Called by the session's process-exit observer; `with_error` reflects a
    /// nonzero exit code or death before the handshake.
    pub async fn handle_termination(&self, with_error: bool) {
        self.dispatcher.handle_termination(with_error).await;
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Format a file or selection
    ///
    /// Offsets are validated as non-negative here; range validity against the
    /// file content is the daemon's job and comes back as a typed
    /// `FORMAT_RANGE_ERROR`. Daemon error codes pass through verbatim.
    pub async fn format(
        &self,
        request: EditFormatRequest,
    ) -> Result<EditFormatResponse, FormatterError> {
        self.validate(&request)?;

        let response = self
            .dispatcher
            .send_request(self.profile.format_method, Some(request))
            .await?;
        Ok(response)
    }

    /// Format with a caller-supplied timeout
    pub async fn format_with_timeout(
        &self,
        request: EditFormatRequest,
        timeout: Duration,
    ) -> Result<EditFormatResponse, FormatterError> {
        self.validate(&request)?;

        match self
            .dispatcher
            .send_request_with_timeout(self.profile.format_method, Some(request), timeout)
            .await
        {
            Ok(response) => Ok(response),
            Err(RpcError::Timeout) => Err(FormatterError::operation_timeout(
                self.profile.format_method,
                timeout,
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn validate(&self, request: &EditFormatRequest) -> Result<(), FormatterError> {
        if self.is_terminated() {
            return Err(FormatterError::ServerTerminated);
        }
        if request.selection_offset < 0 {
            return Err(FormatterError::invalid_request(
                "selection offset must be non-negative",
            ));
        }
        if request.selection_length < 0 {
            return Err(FormatterError::invalid_request(
                "selection length must be non-negative",
            ));
        }
        Ok(())
    }

    /// Resolve when the daemon is not formatting
    ///
    /// Immediate when idle; otherwise waits for the next `server.status`
    /// reporting formatting finished (or termination).
    pub async fn currently_formatting(&self) {
        loop {
            if !self.formatting.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.format_idle.notified();
            // Status may have flipped between the check and registration
            if !self.formatting.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to normalized daemon-reported server errors
    pub fn subscribe_server_error<F>(&self, callback: F) -> Subscription<FormatterError>
    where
        F: Fn(&FormatterError) + Send + Sync + 'static,
    {
        self.server_error_subscribers.subscribe(callback)
    }

    /// Subscribe to the client's terminated event
    pub fn subscribe_terminated<F>(&self, callback: F) -> Subscription<TerminatedEvent>
    where
        F: Fn(&TerminatedEvent) + Send + Sync + 'static,
    {
        self.terminated_subscribers.subscribe(callback)
    }
}

// ============================================================================
// Tests
// ============================================================================
