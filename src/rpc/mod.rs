//! JSON-RPC protocol layer
//!
//! Line-delimited JSON over a [`crate::io::Transport`]: wire types, framing
//! predicate, subscriber registry and the dispatcher that correlates
//! responses and routes notifications.

pub mod dispatcher;
pub mod events;
pub mod framing;
#[cfg(test)]
pub mod testing;
pub mod types;

pub use dispatcher::{RpcDispatcher, RpcError, TerminatedEvent};
pub use events::{SubscriberList, Subscription};
pub use framing::{is_protocol_message, truncate_for_log};
pub use types::{
    InboundMessage, RequestErrorObject, RpcNotification, RpcRequest, RpcResponse, canonical_id,
    epoch_millis,
};
