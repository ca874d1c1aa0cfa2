//! Error types for the formatter daemon client
//!
//! Two enums: `FormatterConfigError` for construction-time validation failures
//! (fatal, nothing was spawned) and `FormatterError` for everything that can
//! go wrong once a session is running. Request-level daemon errors and fatal
//! `server.error` notifications both normalize to `FormatterError::Daemon` so
//! callers have a single error path.

use std::path::PathBuf;
use std::time::Duration;

use crate::io::ProcessError;
use crate::rpc::RpcError;

// ============================================================================
// Session / Request Errors
// ============================================================================

/// Errors surfaced by a running formatter session
#[derive(Debug, thiserror::Error)]
pub enum FormatterError {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] FormatterConfigError),

    /// Process management errors (spawn, stop)
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Error reported by the daemon, either against one request or via a
    /// `server.error` notification
    #[error("Formatter daemon error ({code}): {message}")]
    Daemon {
        code: String,
        message: String,
        stack_trace: Option<String>,
    },

    /// The daemon process terminated; no further requests are possible
    #[error("Formatter daemon terminated")]
    ServerTerminated,

    /// Transport or serialization failure below the request layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid request shape caught before it reaches the wire
    #[error("Invalid format request: {reason}")]
    InvalidRequest { reason: String },

    /// Caller-supplied timeout elapsed
    #[error("Operation timeout: {operation} took longer than {timeout:?}")]
    OperationTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Startup handshake never arrived
    #[error("Daemon startup failed: {reason}")]
    StartupFailed { reason: String },
}

impl FormatterError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    pub fn operation_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::OperationTimeout {
            operation: operation.into(),
            timeout,
        }
    }
}

impl From<RpcError> for FormatterError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Request {
                code,
                message,
                stack_trace,
            } => Self::Daemon {
                code,
                message,
                stack_trace,
            },
            RpcError::ServerTerminated => Self::ServerTerminated,
            RpcError::Timeout => Self::OperationTimeout {
                operation: "request".to_string(),
                timeout: Duration::ZERO,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum FormatterConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Daemon binary does not exist locally and no SSH host is configured
    #[error("Formatter daemon binary not found: {path}")]
    BinaryNotFound { path: PathBuf },

    /// Invalid path format or value
    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },

    /// Invalid launch arguments
    #[error("Invalid daemon arguments: {args:?} - {reason}")]
    InvalidArguments { args: Vec<String>, reason: String },

    /// Invalid environment override
    #[error("Invalid environment variable {key:?} - {reason}")]
    InvalidEnvironment { key: String, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },
}

impl FormatterConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_arguments(args: Vec<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            args,
            reason: reason.into(),
        }
    }

    pub fn invalid_environment(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEnvironment {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
