//! Wire-level message types
//!
//! The daemon speaks line-delimited JSON. Three message shapes exist:
//! requests (sent by this side only, string ids), responses (received only,
//! correlated by id) and notifications (received, unsolicited, no id).
//!
//! Response ids may arrive as strings or integers depending on daemon
//! version; they are canonicalized to strings before pending-table lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound request message
///
/// `client_request_time` is the submission wall clock in epoch milliseconds;
/// the daemon uses it for latency diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Request identifier (monotonic, never reused, canonical string form)
    pub id: String,

    /// Method name, e.g. "edit.format"
    pub method: String,

    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Submission timestamp in epoch milliseconds
    pub client_request_time: i64,
}

/// Inbound response message
///
/// Exactly one of `result` / `error` is present. The id may be a JSON string
/// or number on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    /// Identifier matching a previously sent request
    pub id: Value,

    /// Result payload (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestErrorObject>,
}

/// Inbound notification message (unsolicited, no id)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcNotification {
    /// Event name, e.g. "server.connected"
    pub event: String,

    /// Event parameters
    #[serde(default)]
    pub params: Value,
}

/// Request-level error object reported by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestErrorObject {
    /// Symbolic error code, e.g. "FORMAT_WITH_ERRORS"
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Daemon-side stack trace, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// A decoded inbound protocol message
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl InboundMessage {
    /// Classify one JSON object from the wire
    ///
    /// Objects carrying an `id` are responses; objects carrying an `event`
    /// are notifications. Anything else is a protocol error and yields None.
    pub fn classify(value: &Value) -> Option<InboundMessage> {
        let obj = value.as_object()?;

        if obj.contains_key("id") {
            serde_json::from_value(value.clone())
                .ok()
                .map(InboundMessage::Response)
        } else if obj.contains_key("event") {
            serde_json::from_value(value.clone())
                .ok()
                .map(InboundMessage::Notification)
        } else {
            None
        }
    }
}

/// Canonicalize a wire id to the string form used in the pending table
///
/// Requests always carry string ids, but some daemon versions echo them back
/// as JSON numbers. Both forms must match the same pending entry.
pub fn canonical_id(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Current wall clock in epoch milliseconds, for `clientRequestTime`
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
