//! Formatter session lifecycle
//!
//! `FormatterSession` wires the pieces together: it spawns the daemon process
//! from a validated config, builds the dispatcher over the process stdio,
//! constructs the typed client and bridges process exit into the client's
//! termination handling. One session owns exactly one process; a settings
//! change or a terminated daemon means closing the session and building a
//! new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::daemon::client::{FormatterClient, ProtocolProfile};
use crate::daemon::config::FormatterConfig;
use crate::daemon::error::FormatterError;
use crate::daemon::types::{EditFormatRequest, EditFormatResponse};
use crate::io::{
    DaemonProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StopMode,
};
use crate::rpc::RpcDispatcher;
use crate::rpc::events::{SubscriberList, Subscription};

// ============================================================================
// Termination Reporting
// ============================================================================

/// Abnormal terminations tolerated before the report escalates
pub const MAX_ABNORMAL_TERMINATIONS: usize = 10;

/// One user-facing termination report
#[derive(Debug, Clone)]
pub struct TerminationReport {
    /// The daemon died before completing its startup handshake
    pub during_startup: bool,

    /// Set once the abnormal-termination count passes the threshold
    pub escalated: bool,

    /// Abnormal terminations observed so far on this reporter
    pub occurrences: usize,
}

/// De-duplicating reporter for abnormal daemon terminations
///
/// The first abnormal termination produces one report; repeats are counted
/// silently until the threshold, where a single escalated report fires.
/// State lives on this object, owned by the session's creator, so two
/// sessions never share a count.
pub struct TerminationReporter {
    reported: AtomicBool,
    escalation_reported: AtomicBool,
    abnormal_terminations: AtomicUsize,
    subscribers: SubscriberList<TerminationReport>,
}

impl TerminationReporter {
    pub fn new() -> Self {
        Self {
            reported: AtomicBool::new(false),
            escalation_reported: AtomicBool::new(false),
            abnormal_terminations: AtomicUsize::new(0),
            subscribers: SubscriberList::new(),
        }
    }

    /// Record one abnormal termination, firing a report when warranted
    pub fn record_abnormal(&self, during_startup: bool) {
        let occurrences = self.abnormal_terminations.fetch_add(1, Ordering::SeqCst) + 1;

        if occurrences >= MAX_ABNORMAL_TERMINATIONS {
            if !self.escalation_reported.swap(true, Ordering::SeqCst) {
                error!(
                    "Formatter daemon terminated abnormally {} times; giving up on automatic restarts",
                    occurrences
                );
                self.subscribers.fire(&TerminationReport {
                    during_startup,
                    escalated: true,
                    occurrences,
                });
            }
        } else if !self.reported.swap(true, Ordering::SeqCst) {
            warn!(
                "Formatter daemon {}",
                if during_startup {
                    "could not be started"
                } else {
                    "has terminated"
                }
            );
            self.subscribers.fire(&TerminationReport {
                during_startup,
                escalated: false,
                occurrences,
            });
        } else {
            debug!(
                "Suppressing repeat termination report (occurrence {})",
                occurrences
            );
        }
    }

    pub fn abnormal_terminations(&self) -> usize {
        self.abnormal_terminations.load(Ordering::SeqCst)
    }

    /// Subscribe to termination reports
    pub fn subscribe<F>(&self, callback: F) -> Subscription<TerminationReport>
    where
        F: Fn(&TerminationReport) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }
}

impl Default for TerminationReporter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Exit Bridge
// ============================================================================

/// Forwards process exit events into a channel consumed by the session
struct ChannelExitHandler {
    sender: mpsc::UnboundedSender<ProcessExitEvent>,
}

#[async_trait]
impl ProcessExitHandler for ChannelExitHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let _ = self.sender.send(event);
    }
}

// ============================================================================
// Formatter Session
// ============================================================================

pub struct FormatterSession {
    config: FormatterConfig,
    process: DaemonProcessManager,
    client: Arc<FormatterClient>,
    reporter: Arc<TerminationReporter>,
}

impl FormatterSession {
    /// Spawn the daemon and assemble the client stack
    ///
    /// The config was already validated at build time; a missing local binary
    /// never reaches this point.
    pub async fn spawn(
        config: FormatterConfig,
        reporter: Arc<TerminationReporter>,
    ) -> Result<Self, FormatterError> {
        let (program, args) = config.launch_command();
        info!("Starting formatter daemon: {} {:?}", program, args);

        let (exit_sender, mut exit_receiver) = mpsc::unbounded_channel();
        let mut process =
            DaemonProcessManager::new(program, args).with_env(config.env.clone());
        process.on_process_exit(Arc::new(ChannelExitHandler {
            sender: exit_sender,
        }));

        process.start().await?;

        // The client registers its server.* subscribers before the dispatcher
        // starts pumping stdout, so even an instant handshake is seen
        let transport = process.create_stdio_transport()?;
        let dispatcher = Arc::new(RpcDispatcher::new(config.max_log_line_length));
        let client = Arc::new(FormatterClient::new(
            Arc::clone(&dispatcher),
            ProtocolProfile::default(),
        ));
        dispatcher.start(transport);

        // Bridge process exit into protocol termination. with_error covers a
        // nonzero exit code and death before the startup handshake.
        {
            let client = Arc::clone(&client);
            let reporter = Arc::clone(&reporter);
            tokio::spawn(async move {
                if let Some(event) = exit_receiver.recv().await {
                    let during_startup = !client.has_connected();
                    let with_error = !event.success || during_startup;
                    debug!(
                        "Daemon process exited (code: {:?}, with_error: {})",
                        event.exit_code, with_error
                    );
                    if with_error && !client.is_terminated() {
                        reporter.record_abnormal(during_startup);
                    }
                    client.handle_termination(with_error).await;
                }
            });
        }

        Ok(Self {
            config,
            process,
            client,
            reporter,
        })
    }

    /// Wait for the daemon handshake using the configured timeout
    pub async fn wait_ready(&self) -> Result<(), FormatterError> {
        self.client.wait_ready(self.config.startup_timeout).await
    }

    /// The typed client for this session
    pub fn client(&self) -> &Arc<FormatterClient> {
        &self.client
    }

    /// The reporter shared across this session's restarts
    pub fn reporter(&self) -> &Arc<TerminationReporter> {
        &self.reporter
    }

    /// Format with the session's configured defaults applied
    ///
    /// Request fields left unset inherit the config's line length, tab sizes,
    /// indentation mode and style profile; the configured request timeout
    /// applies when present.
    pub async fn format(
        &self,
        mut request: EditFormatRequest,
    ) -> Result<EditFormatResponse, FormatterError> {
        if request.line_length.is_none() {
            request.line_length = self.config.line_length;
        }
        if request.tab_size.is_none() {
            request.tab_size = self.config.tab_size.clone();
        }
        if request.insert_spaces.is_none() {
            request.insert_spaces = self.config.insert_spaces;
        }
        if request.code_style.is_none() {
            request.code_style = self.config.code_style.clone();
        }

        match self.config.request_timeout {
            Some(timeout) => self.client.format_with_timeout(request, timeout).await,
            None => self.client.format(request).await,
        }
    }

    /// Dispose the session: resolve pending work, then stop the process
    ///
    /// Termination is flagged as clean first so the exit bridge does not
    /// report the stop as an abnormal death.
    pub async fn close(mut self) -> Result<(), FormatterError> {
        info!("Closing formatter session");
        self.client.handle_termination(false).await;
        self.process.stop(StopMode::Graceful).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::config::FormatterConfigBuilder;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    /// Write an executable stub daemon script
    fn stub_daemon(script: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fmtd-stub");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    fn config_for(binary: &PathBuf) -> FormatterConfig {
        FormatterConfigBuilder::new()
            .binary_path(binary)
            .startup_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    const CONNECTED_LINE: &str =
        r#"{"event":"server.connected","params":{"version":"0.9.0","pid":1}}"#;

    #[tokio::test]
    async fn test_session_handshake_with_stub_daemon() {
        let (_dir, binary) = stub_daemon(&format!("echo '{CONNECTED_LINE}'\nsleep 5"));
        let session = FormatterSession::spawn(
            config_for(&binary),
            Arc::new(TerminationReporter::new()),
        )
        .await
        .unwrap();

        session.wait_ready().await.unwrap();
        assert!(session.client().has_connected());
        assert!(session.client().capabilities().has_custom_format1());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_format_round_trip() {
        // First request id is always 1, so the stub can hardcode it
        let (_dir, binary) = stub_daemon(&format!(
            "echo '{CONNECTED_LINE}'\nread line\necho '{{\"id\":\"1\",\"result\":{{\"edits\":[{{\"offset\":0,\"length\":3,\"replacement\":\"foo\"}}],\"selectionOffset\":0,\"selectionLength\":0}}}}'\nsleep 5"
        ));
        let session = FormatterSession::spawn(
            config_for(&binary),
            Arc::new(TerminationReporter::new()),
        )
        .await
        .unwrap();
        session.wait_ready().await.unwrap();

        let response = session
            .format(EditFormatRequest::whole_file("/src/a.c"))
            .await
            .unwrap();
        assert_eq!(response.edits.len(), 1);
        assert_eq!(response.edits[0].replacement, "foo");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_overrides_reach_the_daemon() {
        // The stub reports whatever version the override names
        let (_dir, binary) = stub_daemon(
            r#"echo "{\"event\":\"server.connected\",\"params\":{\"version\":\"$FMTD_STUB_VERSION\",\"pid\":1}}"
sleep 5"#,
        );
        let config = FormatterConfigBuilder::new()
            .binary_path(&binary)
            .env_var("FMTD_STUB_VERSION", "0.2.0")
            .startup_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let session = FormatterSession::spawn(config, Arc::new(TerminationReporter::new()))
            .await
            .unwrap();
        session.wait_ready().await.unwrap();

        assert_eq!(
            session.client().capabilities().version().to_string(),
            "0.2.0"
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_crash_mid_request_flags_error() {
        // Exits 1 after the first request instead of answering it
        let (_dir, binary) = stub_daemon(&format!("echo '{CONNECTED_LINE}'\nread line\nexit 1"));
        let reporter = Arc::new(TerminationReporter::new());
        let session = FormatterSession::spawn(config_for(&binary), Arc::clone(&reporter))
            .await
            .unwrap();
        session.wait_ready().await.unwrap();

        let saw_error = Arc::new(AtomicBool::new(false));
        let saw_error_clone = Arc::clone(&saw_error);
        let _subscription = session.client().subscribe_terminated(move |event| {
            saw_error_clone.store(event.with_error, Ordering::SeqCst);
        });

        let result = session
            .format(EditFormatRequest::whole_file("/src/a.c"))
            .await;
        assert!(matches!(result, Err(FormatterError::ServerTerminated)));
        assert!(saw_error.load(Ordering::SeqCst));
        assert_eq!(reporter.abnormal_terminations(), 1);
    }

    #[tokio::test]
    async fn test_death_before_handshake_is_startup_failure() {
        let (_dir, binary) = stub_daemon("exit 0");
        let reporter = Arc::new(TerminationReporter::new());
        let session = FormatterSession::spawn(config_for(&binary), Arc::clone(&reporter))
            .await
            .unwrap();

        // Exit code 0, but death before server.connected still counts as an
        // abnormal startup termination
        let result = session.wait_ready().await;
        assert!(matches!(result, Err(FormatterError::StartupFailed { .. })));
        assert_eq!(reporter.abnormal_terminations(), 1);
    }

    #[tokio::test]
    async fn test_clean_close_reports_nothing() {
        let (_dir, binary) = stub_daemon(&format!("echo '{CONNECTED_LINE}'\nsleep 5"));
        let reporter = Arc::new(TerminationReporter::new());
        let session = FormatterSession::spawn(config_for(&binary), Arc::clone(&reporter))
            .await
            .unwrap();
        session.wait_ready().await.unwrap();

        session.close().await.unwrap();
        // Let the exit bridge observe the stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reporter.abnormal_terminations(), 0);
    }

    #[test]
    fn test_reporter_deduplicates_and_escalates() {
        let reporter = TerminationReporter::new();
        let reports = Arc::new(std::sync::Mutex::new(Vec::new()));
        let reports_clone = Arc::clone(&reports);
        let _subscription = reporter.subscribe(move |report| {
            reports_clone.lock().unwrap().push(report.clone());
        });

        for _ in 0..MAX_ABNORMAL_TERMINATIONS {
            reporter.record_abnormal(false);
        }

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2, "one initial report plus one escalation");
        assert!(!reports[0].escalated);
        assert_eq!(reports[0].occurrences, 1);
        assert!(reports[1].escalated);
        assert_eq!(reports[1].occurrences, MAX_ABNORMAL_TERMINATIONS);
    }
}
