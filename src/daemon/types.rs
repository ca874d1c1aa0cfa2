//! Typed payloads for the formatter daemon protocol
//!
//! Wire shapes for the `edit.format` request/response and the `server.*`
//! notifications. Field names follow the daemon's camelCase convention.

use serde::{Deserialize, Serialize};

// ============================================================================
// edit.format
// ============================================================================

/// Parameters of the `edit.format` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFormatRequest {
    /// File containing the code to be formatted
    pub file: String,

    /// Offset of the current selection in the file
    pub selection_offset: i64,

    /// Length of the current selection in the file
    pub selection_length: i64,

    /// Line length the formatter should wrap at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_length: Option<u32>,

    /// Format only the selected region instead of the whole file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_only: Option<bool>,

    /// Indent widths per construct
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_size: Option<TabSize>,

    /// Use spaces for indentation (daemon defaults to true when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_spaces: Option<bool>,

    /// Code style profile selector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_style: Option<CodeStyle>,
}

impl EditFormatRequest {
    /// Whole-file format request with daemon defaults for everything else
    pub fn whole_file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            selection_offset: 0,
            selection_length: 0,
            line_length: None,
            selection_only: None,
            tab_size: None,
            insert_spaces: None,
            code_style: None,
        }
    }
}

/// Indent widths per syntactic construct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSize {
    /// Spaces in a block or collection body
    pub block: u32,

    /// How much wrapped cascade sections indent
    pub cascade: u32,

    /// Spaces in a single level of expression nesting
    pub expression: u32,

    /// Indent of a wrapped constructor initialization list
    pub constructor_initializer: u32,
}

impl Default for TabSize {
    fn default() -> Self {
        Self {
            block: 4,
            cascade: 4,
            expression: 4,
            constructor_initializer: 4,
        }
    }
}

/// Code style profile selector (0 = daemon default style)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStyle {
    pub code: u32,
}

/// One change to apply to the original source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEdit {
    /// Offset of the region to be modified
    pub offset: i64,

    /// Length of the region to be modified
    pub length: i64,

    /// Code replacing the specified region
    pub replacement: String,

    /// Edit group identifier, when the daemon assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Result of the `edit.format` request
///
/// `edits` is empty when the file was already formatted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFormatResponse {
    pub edits: Vec<SourceEdit>,

    /// Selection offset after formatting
    pub selection_offset: i64,

    /// Selection length after formatting
    pub selection_length: i64,
}

// ============================================================================
// server.* notifications
// ============================================================================

/// `server.connected` handshake payload, the daemon's readiness signal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConnectedNotification {
    /// Version number of the formatting daemon
    pub version: String,

    /// Process id of the daemon process
    pub pid: i64,

    /// Session identifier, when the daemon assigns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// `server.error` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorNotification {
    /// True when the daemon will shut itself down after sending this
    pub is_fatal: bool,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// `server.status` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatStatus>,
}

/// Formatting progress inside a `server.status` notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatStatus {
    /// True while formatting is being performed
    pub is_formatting: bool,

    /// Current format target; omitted when idle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_target: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
