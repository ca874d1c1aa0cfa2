//! Configuration for formatter daemon sessions
//!
//! `FormatterConfig` is built once, validated at build time, and immutable
//! for the life of one session; a settings change means disposing the session
//! and constructing a new one. The config also derives the launch command,
//! including the `ssh -q <host> "<escaped command>"` rewrite for remote
//! daemons.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::daemon::error::FormatterConfigError;
use crate::daemon::types::{CodeStyle, TabSize};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for the startup handshake (30 seconds)
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Maximum allowed startup timeout (5 minutes)
pub const MAX_STARTUP_TIMEOUT_SECS: u64 = 300;

/// Client id reported to a locally launched daemon
pub const CLIENT_ID_LOCAL: &str = "fmtd-cli";

/// Client id reported when the daemon runs behind SSH
pub const CLIENT_ID_REMOTE: &str = "fmtd-cli-remote";

// ============================================================================
// Core Configuration Type
// ============================================================================

/// Complete formatter session configuration
#[derive(Debug, Clone)]
pub struct FormatterConfig {
    /// Path to the formatter daemon binary
    pub binary_path: PathBuf,

    /// SSH host for remote launch; when set, the binary path is resolved on
    /// the remote machine and not validated locally
    pub ssh_host: Option<String>,

    /// Client version reported via `--client-version`
    pub client_version: String,

    /// Daemon-side instrumentation log file
    pub instrumentation_log_file: Option<PathBuf>,

    /// Additional daemon command-line arguments
    pub extra_args: Vec<String>,

    /// Environment overrides applied on top of the inherited environment.
    /// With an SSH host these apply to the local ssh process, not the remote
    /// daemon.
    pub env: HashMap<String, String>,

    /// Default line length for format requests
    pub line_length: Option<u32>,

    /// Default indent widths for format requests
    pub tab_size: Option<TabSize>,

    /// Default indentation mode for format requests
    pub insert_spaces: Option<bool>,

    /// Default style profile for format requests
    pub code_style: Option<CodeStyle>,

    /// Truncation limit for raw wire-traffic logging
    pub max_log_line_length: Option<usize>,

    /// Timeout for the `server.connected` handshake
    pub startup_timeout: Duration,

    /// Per-request timeout; None waits indefinitely
    pub request_timeout: Option<Duration>,
}

impl FormatterConfig {
    /// Client id reported to the daemon, distinguishing local from remote
    pub fn client_id(&self) -> &'static str {
        if self.ssh_host.is_some() {
            CLIENT_ID_REMOTE
        } else {
            CLIENT_ID_LOCAL
        }
    }

    /// Daemon arguments excluding the binary path
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "listen".to_string(),
            format!("--client-id={}", self.client_id()),
            format!("--client-version={}", self.client_version),
        ];

        if let Some(path) = &self.instrumentation_log_file {
            args.push(format!(
                "--instrumentation-log-file={}",
                path.to_string_lossy()
            ));
        }

        args.extend(self.extra_args.clone());
        args
    }

    /// Resolve the program and argv to spawn
    ///
    /// Local: the binary itself with `daemon_args`. Remote: `ssh -q <host>`
    /// with the whole original invocation shell-escaped into one argument, so
    /// stdio passthrough works transparently over the tunnel.
    pub fn launch_command(&self) -> (String, Vec<String>) {
        let binary = self.binary_path.to_string_lossy().to_string();
        let args = self.daemon_args();

        match &self.ssh_host {
            Some(host) => {
                let mut remote_command = vec![binary];
                remote_command.extend(args);
                (
                    "ssh".to_string(),
                    vec![
                        // Quiet mode keeps SSH from polluting the stdio
                        // channel the protocol runs over
                        "-q".to_string(),
                        host.clone(),
                        escape_shell(&remote_command),
                    ],
                )
            }
            None => (binary, args),
        }
    }
}

// ============================================================================
// Shell Escaping
// ============================================================================

/// Escape an argv for use as a single remote shell command
///
/// Arguments containing characters outside `[A-Za-z0-9_/:=-]` are
/// single-quoted with embedded quotes rewritten to `'\''`; redundant leading
/// `''` pairs are stripped and `\'''` sequences collapse to `\'`. The daemon
/// re-splits the remote command with a POSIX shell, so this transformation
/// must stay exactly as it is.
pub fn escape_shell(args: &[String]) -> String {
    let escaped: Vec<String> = args
        .iter()
        .map(|arg| {
            let needs_quoting = arg.chars().any(|c| {
                !(c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | ':' | '=' | '-'))
            });

            if !needs_quoting {
                return arg.clone();
            }

            let mut quoted = format!("'{}'", arg.replace('\'', "'\\''"));
            while let Some(rest) = quoted.strip_prefix("''") {
                quoted = rest.to_string();
            }
            quoted.replace("\\'''", "\\'")
        })
        .collect();

    escaped.join(" ")
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for FormatterConfig with validation and defaults
#[derive(Debug, Default)]
pub struct FormatterConfigBuilder {
    binary_path: Option<PathBuf>,
    ssh_host: Option<String>,
    client_version: Option<String>,
    instrumentation_log_file: Option<PathBuf>,
    extra_args: Vec<String>,
    env: HashMap<String, String>,
    line_length: Option<u32>,
    tab_size: Option<TabSize>,
    insert_spaces: Option<bool>,
    code_style: Option<CodeStyle>,
    max_log_line_length: Option<usize>,
    startup_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl FormatterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to the formatter daemon binary
    pub fn binary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Launch the daemon on a remote host over SSH
    pub fn ssh_host(mut self, host: impl Into<String>) -> Self {
        self.ssh_host = Some(host.into());
        self
    }

    /// Set the client version reported to the daemon
    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    /// Enable the daemon-side instrumentation log
    pub fn instrumentation_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.instrumentation_log_file = Some(path.into());
        self
    }

    /// Add an extra daemon command-line argument
    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Add multiple extra daemon command-line arguments
    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args
            .extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Set one environment variable for the daemon process
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge environment overrides for the daemon process
    pub fn env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Set the default line length for format requests
    pub fn line_length(mut self, length: u32) -> Self {
        self.line_length = Some(length);
        self
    }

    /// Set the default indent widths for format requests
    pub fn tab_size(mut self, tab_size: TabSize) -> Self {
        self.tab_size = Some(tab_size);
        self
    }

    /// Set the default indentation mode for format requests
    pub fn insert_spaces(mut self, enabled: bool) -> Self {
        self.insert_spaces = Some(enabled);
        self
    }

    /// Set the default style profile for format requests
    pub fn code_style(mut self, style: CodeStyle) -> Self {
        self.code_style = Some(style);
        self
    }

    /// Bound raw wire-traffic log lines to this many bytes
    pub fn max_log_line_length(mut self, length: usize) -> Self {
        self.max_log_line_length = Some(length);
        self
    }

    /// Set the startup handshake timeout
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Set a per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<FormatterConfig, FormatterConfigError> {
        let binary_path = self
            .binary_path
            .ok_or_else(|| FormatterConfigError::missing_field("binary_path"))?;

        let client_version = self
            .client_version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        let startup_timeout = self
            .startup_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS));

        Self::validate_binary_path(&binary_path, self.ssh_host.as_deref())?;
        Self::validate_arguments(&self.extra_args)?;
        Self::validate_environment(&self.env)?;
        Self::validate_timeouts(startup_timeout, self.request_timeout)?;

        Ok(FormatterConfig {
            binary_path,
            ssh_host: self.ssh_host,
            client_version,
            instrumentation_log_file: self.instrumentation_log_file,
            extra_args: self.extra_args,
            env: self.env,
            line_length: self.line_length,
            tab_size: self.tab_size,
            insert_spaces: self.insert_spaces,
            code_style: self.code_style,
            max_log_line_length: self.max_log_line_length,
            startup_timeout,
            request_timeout: self.request_timeout,
        })
    }

    /// Validate the binary path
    ///
    /// With an SSH host the binary lives on the remote machine and may not
    /// exist locally; without one, a missing binary is a fatal configuration
    /// error surfaced before any process is spawned.
    fn validate_binary_path(path: &Path, ssh_host: Option<&str>) -> Result<(), FormatterConfigError> {
        let display = path.to_string_lossy();

        if display.is_empty() {
            return Err(FormatterConfigError::invalid_path(
                display,
                "Binary path cannot be empty",
            ));
        }

        if display.contains('\0') {
            return Err(FormatterConfigError::invalid_path(
                display,
                "Binary path contains null character",
            ));
        }

        if ssh_host.is_none() && !path.exists() {
            return Err(FormatterConfigError::BinaryNotFound {
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    fn validate_arguments(args: &[String]) -> Result<(), FormatterConfigError> {
        for arg in args {
            if arg.contains('\0') {
                return Err(FormatterConfigError::invalid_arguments(
                    args.to_vec(),
                    "Arguments cannot contain null characters",
                ));
            }
        }

        Ok(())
    }

    fn validate_environment(env: &HashMap<String, String>) -> Result<(), FormatterConfigError> {
        for (key, value) in env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(FormatterConfigError::invalid_environment(
                    key,
                    "Environment variable names cannot be empty or contain '=' or null characters",
                ));
            }
            if value.contains('\0') {
                return Err(FormatterConfigError::invalid_environment(
                    key,
                    "Environment variable values cannot contain null characters",
                ));
            }
        }

        Ok(())
    }

    fn validate_timeouts(
        startup: Duration,
        request: Option<Duration>,
    ) -> Result<(), FormatterConfigError> {
        if startup.is_zero() {
            return Err(FormatterConfigError::invalid_timeout(
                startup,
                "Startup timeout must be greater than zero",
            ));
        }

        if startup > Duration::from_secs(MAX_STARTUP_TIMEOUT_SECS) {
            return Err(FormatterConfigError::invalid_timeout(
                startup,
                "Startup timeout too long (max 5 minutes)",
            ));
        }

        if let Some(request) = request
            && request.is_zero()
        {
            return Err(FormatterConfigError::invalid_timeout(
                request,
                "Request timeout must be greater than zero",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
