//! RPC dispatcher - request/response/notification correlation core
//!
//! Assigns monotonic request ids, keeps the pending-request table, matches
//! incoming responses by id and routes unsolicited notifications to
//! per-event subscriber lists. Termination (process exit, write failure,
//! explicit close) resolves every pending request with a uniform error and
//! rejects later sends synchronously.

use crate::io::Transport;
use crate::rpc::events::{SubscriberList, Subscription};
use crate::rpc::framing::{is_protocol_message, truncate_for_log};
use crate::rpc::types::{
    InboundMessage, RpcRequest, RpcResponse, canonical_id, epoch_millis,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

// ============================================================================
// Errors
// ============================================================================

/// RPC layer errors
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Daemon request error ({code}): {message}")]
    Request {
        code: String,
        message: String,
        stack_trace: Option<String>,
    },

    #[error("Server terminated")]
    ServerTerminated,

    #[error("Request timeout")]
    Timeout,

    #[error("Request was cancelled")]
    Cancelled,
}

// ============================================================================
// Internal state shared with the transport task
// ============================================================================

/// Single-assignment result slot for one in-flight request
type ResultSlot = oneshot::Sender<Result<Value, RpcError>>;

/// Pending-request table, the only shared mutable structure in one client
type PendingTable = Arc<Mutex<HashMap<String, ResultSlot>>>;

/// Notification subscriber lists keyed by event name
struct NotificationRegistry {
    lists: StdMutex<HashMap<String, Arc<SubscriberList<Value>>>>,
}

impl NotificationRegistry {
    fn new() -> Self {
        Self {
            lists: StdMutex::new(HashMap::new()),
        }
    }

    fn list_for(&self, event: &str) -> Arc<SubscriberList<Value>> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut lists = self.lists.lock().unwrap();
        Arc::clone(
            lists
                .entry(event.to_string())
                .or_insert_with(|| Arc::new(SubscriberList::new())),
        )
    }

    fn existing(&self, event: &str) -> Option<Arc<SubscriberList<Value>>> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let lists = self.lists.lock().unwrap();
        lists.get(event).map(Arc::clone)
    }
}

/// Payload delivered to terminated-event subscribers
#[derive(Debug, Clone, Copy)]
pub struct TerminatedEvent {
    /// True when the daemon exited abnormally (nonzero code, write failure,
    /// or death before the startup handshake)
    pub with_error: bool,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Request/response correlation core over one transport
///
/// The transport is consumed by [`RpcDispatcher::start`] and driven by a
/// single task, so outbound lines are serialized and the pending table is
/// only mutated under its mutex from the task, senders and the termination
/// path. Construction and start are separate steps so lifecycle subscribers
/// can register before the first daemon line is processed.
pub struct RpcDispatcher {
    /// Channel feeding the transport task with serialized request lines
    outbound_sender: mpsc::UnboundedSender<String>,

    /// Writer-side receiver, handed to the transport task by `start`
    outbound_receiver: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,

    /// Next request id; ids start at 1 and are never reused
    next_id: AtomicU64,

    /// In-flight requests keyed by canonical id string
    pending: PendingTable,

    /// Notification routing by event name
    notifications: Arc<NotificationRegistry>,

    /// Terminated-event subscribers
    terminated_subscribers: Arc<SubscriberList<TerminatedEvent>>,

    /// Set once on termination; absorbing
    terminated: Arc<AtomicBool>,

    /// Truncation limit for raw wire-traffic logging
    max_log_line_length: Option<usize>,
}

impl RpcDispatcher {
    /// Create a dispatcher
    ///
    /// The transport task does not run until [`RpcDispatcher::start`];
    /// register subscribers in between so an eager daemon cannot slip its
    /// first notification past them. `max_log_line_length` bounds raw traffic
    /// logging; None logs whole lines.
    pub fn new(max_log_line_length: Option<usize>) -> Self {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();

        Self {
            outbound_sender,
            outbound_receiver: StdMutex::new(Some(outbound_receiver)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications: Arc::new(NotificationRegistry::new()),
            terminated_subscribers: Arc::new(SubscriberList::new()),
            terminated: Arc::new(AtomicBool::new(false)),
            max_log_line_length,
        }
    }

    /// Consume the transport and run the reader/writer task
    ///
    /// Lines the transport buffered before this call are processed once the
    /// task runs, after every subscriber registered so far. A second call is
    /// ignored.
    pub fn start<T: Transport + 'static>(&self, transport: T) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let receiver = self.outbound_receiver.lock().unwrap().take();
        let Some(mut outbound_receiver) = receiver else {
            warn!("RpcDispatcher: start called twice, ignoring");
            return;
        };

        let transport = Arc::new(Mutex::new(transport));
        let transport_clone = Arc::clone(&transport);
        let pending_clone = Arc::clone(&self.pending);
        let notifications_clone = Arc::clone(&self.notifications);
        let terminated_clone = Arc::clone(&self.terminated);
        let terminated_subscribers_clone = Arc::clone(&self.terminated_subscribers);
        let max_log_line_length = self.max_log_line_length;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Outbound lines (prioritized)
                    maybe_line = outbound_receiver.recv() => {
                        match maybe_line {
                            Some(line) => {
                                let mut transport = transport_clone.lock().await;
                                if let Err(e) = transport.send(&line).await {
                                    error!("Failed to write to daemon: {}", e);
                                    drop(transport);
                                    // A failed write means the process is gone
                                    Self::terminate(
                                        &pending_clone,
                                        &terminated_clone,
                                        &terminated_subscribers_clone,
                                        true,
                                    )
                                    .await;
                                    break;
                                }
                            }
                            None => {
                                trace!("RpcDispatcher: outbound channel closed, stopping task");
                                break;
                            }
                        }
                    }
                    // Inbound lines
                    result = async {
                        let mut transport = transport_clone.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(line) => {
                                Self::process_line(
                                    &line,
                                    &pending_clone,
                                    &notifications_clone,
                                    max_log_line_length,
                                )
                                .await;
                            }
                            Err(e) => {
                                // EOF alone is not termination; the process
                                // exit observer decides with_error and calls
                                // handle_termination
                                trace!("RpcDispatcher: daemon stdout closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            trace!("RpcDispatcher: transport task finished");
        });
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Handle one raw stdout line: classify, parse, correlate or route
    async fn process_line(
        line: &str,
        pending: &PendingTable,
        notifications: &Arc<NotificationRegistry>,
        max_log_line_length: Option<usize>,
    ) {
        crate::log_wire_message!(
            tracing::Level::TRACE,
            "recv",
            truncate_for_log(line.trim_end(), max_log_line_length)
        );

        if !is_protocol_message(line) {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                debug!("Unhandled daemon output: {}", trimmed);
            }
            return;
        }

        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(e) => {
                // Passed the shape check but is not valid JSON; protocol
                // error, non-fatal
                warn!("Dropping malformed protocol line: {}", e);
                return;
            }
        };

        match value {
            Value::Array(items) => {
                for item in items {
                    Self::process_message(&item, pending, notifications).await;
                }
            }
            other => Self::process_message(&other, pending, notifications).await,
        }
    }

    /// Handle one decoded JSON object from the wire
    async fn process_message(
        value: &Value,
        pending: &PendingTable,
        notifications: &Arc<NotificationRegistry>,
    ) {
        match InboundMessage::classify(value) {
            Some(InboundMessage::Response(response)) => {
                Self::resolve_response(response, pending).await;
            }
            Some(InboundMessage::Notification(notification)) => {
                // Unknown event names are silently ignored so newer daemons
                // do not break older clients
                if let Some(list) = notifications.existing(&notification.event) {
                    trace!("RpcDispatcher: notification '{}'", notification.event);
                    list.fire(&notification.params);
                } else {
                    trace!(
                        "RpcDispatcher: no subscribers for notification '{}'",
                        notification.event
                    );
                }
            }
            None => {
                warn!("Dropping unrecognized protocol message: {}", value);
            }
        }
    }

    /// Match a response to its pending request and resolve the slot
    async fn resolve_response(response: RpcResponse, pending: &PendingTable) {
        let id = match canonical_id(&response.id) {
            Some(id) => id,
            None => {
                warn!("Dropping response with non-scalar id: {:?}", response.id);
                return;
            }
        };

        let slot = {
            let mut pending = pending.lock().await;
            pending.remove(&id)
        };

        let Some(slot) = slot else {
            // Orphan response: protocol error, logged and dropped
            warn!("Received response for unknown request id {}", id);
            return;
        };

        let outcome = match response.error {
            Some(error) => Err(RpcError::Request {
                code: error.code,
                message: error.message,
                stack_trace: error.stack_trace,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };

        if slot.send(outcome).is_err() {
            // Caller stopped awaiting; fire-and-forget semantics
            debug!("Result receiver dropped for request {}", id);
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Send a request and await its result as a raw JSON value
    pub async fn send_request_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let receiver = self.submit(method, params).await?;

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Cancelled),
        }
    }

    /// Send a typed request and await its deserialized result
    pub async fn send_request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, RpcError>
    where
        P: serde::Serialize,
        R: for<'de> serde::Deserialize<'de>,
    {
        let params = params
            .map(|p| serde_json::to_value(p).map_err(RpcError::Serialization))
            .transpose()?;

        let result = self.send_request_raw(method, params).await?;
        serde_json::from_value(result).map_err(RpcError::Deserialization)
    }

    /// Send a typed request with a caller-supplied timeout
    ///
    /// On timeout the pending entry is removed so nothing is leaked; a late
    /// response for that id is then treated as an orphan.
    pub async fn send_request_with_timeout<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: std::time::Duration,
    ) -> Result<R, RpcError>
    where
        P: serde::Serialize,
        R: for<'de> serde::Deserialize<'de>,
    {
        let params = params
            .map(|p| serde_json::to_value(p).map_err(RpcError::Serialization))
            .transpose()?;

        let (id, receiver) = self.submit_with_id(method, params).await?;

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                return Err(RpcError::Timeout);
            }
        };

        let result = outcome?;
        serde_json::from_value(result).map_err(RpcError::Deserialization)
    }

    async fn submit(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<Result<Value, RpcError>>, RpcError> {
        let (_, receiver) = self.submit_with_id(method, params).await?;
        Ok(receiver)
    }

    /// Register a pending entry and hand the serialized line to the writer
    async fn submit_with_id(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(String, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (sender, receiver) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            // Rejected synchronously once terminated; no I/O is attempted.
            // Checked under the pending lock so a concurrent termination
            // either observes this entry when draining or is observed here
            // before the insert; an entry can never slip in after the drain.
            if self.terminated.load(Ordering::SeqCst) {
                return Err(RpcError::ServerTerminated);
            }
            pending.insert(id.clone(), sender);
        }

        let request = RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
            client_request_time: epoch_millis(),
        };

        let line = match serde_json::to_string(&request) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                return Err(RpcError::Serialization(e));
            }
        };

        debug!("RpcDispatcher: sending {} (id {})", method, id);
        crate::log_wire_message!(
            tracing::Level::TRACE,
            "send",
            truncate_for_log(line.trim_end(), self.max_log_line_length)
        );

        if self.outbound_sender.send(line).is_err() {
            // Writer task is gone; same as a write to a dead process
            {
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
            }
            self.handle_termination(true).await;
            return Err(RpcError::Transport("Outbound channel closed".to_string()));
        }

        Ok((id, receiver))
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Mark the connection terminated
    ///
    /// Resolves every pending request with a uniform server-terminated
    /// error, then fires the terminated event. Idempotent: only the first
    /// call has any effect.
    pub async fn handle_termination(&self, with_error: bool) {
        Self::terminate(
            &self.pending,
            &self.terminated,
            &self.terminated_subscribers,
            with_error,
        )
        .await;
    }

    async fn terminate(
        pending: &PendingTable,
        terminated: &Arc<AtomicBool>,
        subscribers: &Arc<SubscriberList<TerminatedEvent>>,
        with_error: bool,
    ) {
        // The flag flips under the pending lock; see submit_with_id
        let drained: Vec<(String, ResultSlot)> = {
            let mut pending = pending.lock().await;
            if terminated.swap(true, Ordering::SeqCst) {
                return;
            }
            pending.drain().collect()
        };

        debug!(
            "RpcDispatcher: connection terminated (with_error: {}), failing {} pending request(s)",
            with_error,
            drained.len()
        );

        for (id, slot) in drained {
            if slot.send(Err(RpcError::ServerTerminated)).is_err() {
                trace!("Result receiver already dropped for request {}", id);
            }
        }

        subscribers.fire(&TerminatedEvent { with_error });
    }

    /// Whether the connection has terminated
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to an unsolicited notification by event name
    pub fn subscribe_notification<F>(&self, event: &str, callback: F) -> Subscription<Value>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.notifications.list_for(event).subscribe(callback)
    }

    /// Subscribe to the terminated event
    pub fn subscribe_terminated<F>(&self, callback: F) -> Subscription<TerminatedEvent>
    where
        F: Fn(&TerminatedEvent) + Send + Sync + 'static,
    {
        self.terminated_subscribers.subscribe(callback)
    }

    /// Number of requests currently awaiting a response
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::ChannelTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    /// Pull the next request line the dispatcher wrote and return its JSON
    async fn next_request_json(
        daemon: &mut crate::rpc::testing::StubDaemonHandle,
    ) -> Value {
        let line = daemon.next_request().await.expect("no request written");
        serde_json::from_str(line.trim()).expect("request line is not JSON")
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_monotonic() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                let _result: Result<Value, _> =
                    dispatcher.send_request("server.ping", None::<Value>).await;
            }));
        }

        let mut ids = Vec::new();
        for _ in 0..8 {
            let request = next_request_json(&mut daemon).await;
            let id: u64 = request["id"].as_str().unwrap().parse().unwrap();
            ids.push(id);
            // Answer so the senders can finish
            daemon.send_line(&format!("{{\"id\":\"{id}\",\"result\":{{}}}}"));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 8, "ids must be pairwise distinct");
        assert_eq!(*sorted.first().unwrap(), 1, "ids start at 1");
    }

    #[tokio::test]
    async fn test_response_correlation() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send_request_raw("edit.format", Some(json!({"file": "a"})))
                    .await
            })
        };
        let second = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send_request_raw("edit.format", Some(json!({"file": "b"})))
                    .await
            })
        };

        let request_a = next_request_json(&mut daemon).await;
        let request_b = next_request_json(&mut daemon).await;
        let id_a = request_a["id"].as_str().unwrap().to_string();
        let id_b = request_b["id"].as_str().unwrap().to_string();

        // Respond out of submission order; correlation is by id only
        daemon.send_line(&format!("{{\"id\":\"{id_b}\",\"result\":{{\"tag\":\"b\"}}}}"));
        daemon.send_line(&format!("{{\"id\":\"{id_a}\",\"result\":{{\"tag\":\"a\"}}}}"));

        let results = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

        let tag_of = |request: &Value| request["params"]["file"].as_str().unwrap().to_string();
        assert_eq!(results[0]["tag"], tag_of(&request_a));
        assert_eq!(results[1]["tag"], tag_of(&request_b));
    }

    #[tokio::test]
    async fn test_orphan_response_is_tolerated() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        // Orphan first; must be dropped without affecting anything
        daemon.send_line("{\"id\":\"999\",\"result\":{}}");

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", None).await
            })
        };

        let request = next_request_json(&mut daemon).await;
        let id = request["id"].as_str().unwrap();
        daemon.send_line(&format!("{{\"id\":\"{id}\",\"result\":{{\"ok\":true}}}}"));

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_numeric_response_id_matches_string_request_id() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", None).await
            })
        };

        let request = next_request_json(&mut daemon).await;
        let id: u64 = request["id"].as_str().unwrap().parse().unwrap();
        // Older daemons echo the id back as a JSON number
        daemon.send_line(&format!("{{\"id\":{id},\"result\":{{\"ok\":1}}}}"));

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result["ok"], 1);
    }

    #[tokio::test]
    async fn test_termination_fails_all_pending() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", None).await
            }));
        }
        for _ in 0..3 {
            let _ = next_request_json(&mut daemon).await;
        }
        assert_eq!(dispatcher.pending_count().await, 3);

        dispatcher.handle_termination(true).await;

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(RpcError::ServerTerminated)));
        }
        assert_eq!(dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_after_termination_rejects_immediately() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = RpcDispatcher::new(None);
        dispatcher.start(transport);

        dispatcher.handle_termination(false).await;
        assert!(dispatcher.is_terminated());

        let result = dispatcher.send_request_raw("edit.format", None).await;
        assert!(matches!(result, Err(RpcError::ServerTerminated)));

        // Nothing reached the wire
        assert!(daemon.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminated_event_fires_once() {
        let (transport, _daemon) = ChannelTransport::pair();
        let dispatcher = RpcDispatcher::new(None);
        dispatcher.start(transport);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _subscription = dispatcher.subscribe_terminated(move |event| {
            assert!(event.with_error);
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.handle_termination(true).await;
        dispatcher.handle_termination(false).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notification_routing_and_unknown_events() {
        let (transport, daemon) = ChannelTransport::pair();
        let dispatcher = RpcDispatcher::new(None);
        dispatcher.start(transport);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _subscription =
            dispatcher.subscribe_notification("server.status", move |params| {
                seen_clone.lock().unwrap().push(params.clone());
            });

        // Unknown events and daemon noise must both be ignored silently
        daemon.send_line("Daemon listening on stdin");
        daemon.send_line("{\"event\":\"server.unknownFutureEvent\",\"params\":{}}");
        daemon.send_line(
            "{\"event\":\"server.status\",\"params\":{\"format\":{\"isFormatting\":true}}}",
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["format"]["isFormatting"], true);
    }

    #[tokio::test]
    async fn test_batched_messages_dispatch_individually() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _subscription = dispatcher.subscribe_notification("server.status", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", None).await
            })
        };

        let request = next_request_json(&mut daemon).await;
        let id = request["id"].as_str().unwrap();

        // One wire line carrying a notification and the response together
        daemon.send_line(&format!(
            "[{{\"event\":\"server.status\",\"params\":{{}}}},{{\"id\":\"{id}\",\"result\":{{}}}}]"
        ));

        assert!(pending.await.unwrap().is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_error_surfaces_code() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", None).await
            })
        };

        let request = next_request_json(&mut daemon).await;
        let id = request["id"].as_str().unwrap();
        daemon.send_line(&format!(
            "{{\"id\":\"{id}\",\"error\":{{\"code\":\"FORMAT_RANGE_ERROR\",\"message\":\"bad range\"}}}}"
        ));

        match pending.await.unwrap() {
            Err(RpcError::Request { code, message, .. }) => {
                assert_eq!(code, "FORMAT_RANGE_ERROR");
                assert_eq!(message, "bad range");
            }
            other => panic!("Expected request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_pending_entry() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = RpcDispatcher::new(None);
        dispatcher.start(transport);

        let result: Result<Value, RpcError> = dispatcher
            .send_request_with_timeout(
                "edit.format",
                None::<Value>,
                std::time::Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(RpcError::Timeout)));
        assert_eq!(dispatcher.pending_count().await, 0);

        // The request did reach the wire before timing out
        assert!(daemon.next_request().await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sends_racing_termination_never_leak() {
        // Submissions interleaving with termination must all resolve; a
        // pending entry inserted after the drain would hang its caller
        for _ in 0..200 {
            let (transport, _daemon) = ChannelTransport::pair();
            let dispatcher = Arc::new(RpcDispatcher::new(None));
            dispatcher.start(transport);

            let mut senders = Vec::new();
            for _ in 0..4 {
                let dispatcher = Arc::clone(&dispatcher);
                senders.push(tokio::spawn(async move {
                    dispatcher.send_request_raw("edit.format", None).await
                }));
            }
            let terminator = {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { dispatcher.handle_termination(true).await })
            };

            terminator.await.unwrap();
            for sender in senders {
                let result = tokio::time::timeout(std::time::Duration::from_secs(2), sender)
                    .await
                    .expect("request future hung after termination")
                    .unwrap();
                assert!(matches!(result, Err(RpcError::ServerTerminated)));
            }
            assert_eq!(dispatcher.pending_count().await, 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribers_registered_before_start_see_first_line() {
        let (transport, daemon) = ChannelTransport::pair();
        // Daemon output arrives before the client stack is wired up
        daemon.send_line(
            "{\"event\":\"server.connected\",\"params\":{\"version\":\"0.9.0\",\"pid\":1}}",
        );

        let dispatcher = RpcDispatcher::new(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _subscription = dispatcher.subscribe_notification("server.connected", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.start(transport);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_carries_client_request_time() {
        let (transport, mut daemon) = ChannelTransport::pair();
        let dispatcher = Arc::new(RpcDispatcher::new(None));
        dispatcher.start(transport);

        let _pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher.send_request_raw("edit.format", Some(json!({}))).await
            })
        };

        let request = next_request_json(&mut daemon).await;
        assert!(request["clientRequestTime"].as_i64().unwrap() > 0);
        assert_eq!(request["method"], "edit.format");
    }
}
