//! Formatter daemon client stack
//!
//! Configuration, capabilities, the typed lifecycle client and the session
//! that owns one daemon process end to end.

pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod latch;
pub mod session;
pub mod types;

pub use capabilities::{FormatterCapabilities, FormatterVersion};
pub use client::{ClientState, FormatterClient, ProtocolProfile};
pub use config::{FormatterConfig, FormatterConfigBuilder, escape_shell};
pub use error::{FormatterConfigError, FormatterError};
pub use latch::ReadyLatch;
pub use session::{
    FormatterSession, MAX_ABNORMAL_TERMINATIONS, TerminationReport, TerminationReporter,
};
pub use types::{
    CodeStyle, EditFormatRequest, EditFormatResponse, FormatStatus, ServerConnectedNotification,
    ServerErrorNotification, ServerStatusNotification, SourceEdit, TabSize,
};
