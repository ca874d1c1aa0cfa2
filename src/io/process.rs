//! Process supervision layer
//!
//! Owns the daemon child process: spawn, stop, exit observation and stderr
//! monitoring. Transport concerns are handled separately in
//! `crate::io::transport`; this module only hands out the stdio pipes.

use crate::io::transport::{StdioTransport, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
// warn! is used in Windows-specific code blocks
use tracing::{error, info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Try graceful shutdown first (SIGTERM), then force kill if needed
    Graceful,
    /// Force kill immediately (SIGKILL)
    #[allow(dead_code)]
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or been stopped
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired exactly once when the daemon process exits
///
/// `exit_code` is None when the process was killed by a signal (or the exit
/// status could not be collected). `success` is true only for a clean zero
/// exit; the lifecycle layer combines this with handshake state to decide
/// whether the termination counts as abnormal.
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called when the process exits, for any reason
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from the daemon process
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// The handler will be called for each line received from stderr.
    /// Only one handler can be active at a time - installing a new handler
    /// will replace the previous one.
    ///
    /// Note: Monitoring starts automatically when the process starts if a handler is installed.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing the daemon process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the daemon process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the daemon process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Create a stdio transport for communicating with the process
    /// This consumes the stdin/stdout from the process
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous force kill for Drop trait implementations
    fn kill_sync(&mut self);
}

/// Manages the daemon child process spawned via Command
///
/// The launch argv (including any SSH wrapping) is resolved by the
/// configuration layer before this manager is constructed; the manager
/// itself treats the command as opaque.
pub struct DaemonProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Environment variable overrides applied on top of the inherited env
    env_overrides: HashMap<String, String>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when process starts)
    stdio_transport: Option<StdioTransport>,

    /// Stderr handler
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,

    /// Stderr monitoring task handle
    stderr_task: Option<JoinHandle<()>>,

    /// Process wait task handle (waits for child to exit)
    wait_task: Option<JoinHandle<()>>,

    /// Process exit event handler
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl DaemonProcessManager {
    /// Create a new daemon process manager
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            env_overrides: HashMap::new(),
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    /// Apply environment variable overrides when spawning
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env_overrides = env;
        self
    }

    /// Install the exit event handler
    ///
    /// Must be installed before `start()`; the handler is moved into the
    /// wait task when the process spawns.
    pub fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Spawn the stderr monitoring task with a provided stderr pipe
    ///
    /// Always drains stderr to prevent the daemon from blocking on a full
    /// pipe. If a handler is installed, lines are forwarded to it.
    async fn spawn_stderr_monitor_with_pipe(
        &mut self,
        stderr: tokio::process::ChildStderr,
    ) -> Result<(), ProcessError> {
        if self.stderr_task.is_some() {
            return Ok(());
        }

        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "DaemonProcessManager: starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("DaemonProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim().to_string();
                        if !line_content.is_empty() {
                            if let Some(ref handler) = handler {
                                trace!("DaemonProcessManager: stderr line: {}", line_content);
                                handler(line_content);
                            } else {
                                trace!("DaemonProcessManager: stderr drained: {}", line_content);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("DaemonProcessManager: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
        Ok(())
    }

    /// Spawn the wait task that observes daemon exit
    ///
    /// The exit event fires at most once per process; the wait task is the
    /// only place that constructs it.
    async fn spawn_wait_task(&mut self, mut child: Child) -> Result<(), ProcessError> {
        let current_pid = self.get_state().pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            trace!(
                "DaemonProcessManager: starting wait task for PID {:?}",
                current_pid
            );

            let event = match child.wait().await {
                Ok(exit_status) => {
                    info!(
                        "Daemon PID {:?} exited with status: {}",
                        current_pid, exit_status
                    );

                    ProcessExitEvent {
                        exit_code: exit_status.code(),
                        success: exit_status.success(),
                    }
                }
                Err(e) => {
                    error!("Error waiting for daemon process: {}", e);

                    ProcessExitEvent {
                        exit_code: None,
                        success: false,
                    }
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            if let Some(handler) = &exit_handler {
                handler.on_process_exit(event).await;
            }

            trace!(
                "DaemonProcessManager: wait task finished for PID {:?}",
                current_pid
            );
        });

        self.wait_task = Some(task);
        Ok(())
    }
}

#[async_trait]
impl ProcessManager for DaemonProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting daemon process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &self.env_overrides {
            command_builder.env(key, value);
        }

        let mut child = command_builder.spawn()?;

        let pid = child.id();
        info!("Daemon process started with PID: {:?}", pid);

        if let Some(pid) = pid {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            *self.state.lock().unwrap() = ProcessState::Running { pid };
        } else {
            return Err(ProcessError::Io(std::io::Error::other(
                "Failed to get process ID",
            )));
        }

        // Extract stdio streams immediately before moving child to wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));

        // Always drain stderr so the daemon cannot block on a full pipe
        self.spawn_stderr_monitor_with_pipe(stderr).await?;

        // Wait task consumes the child and fires the single exit event
        self.spawn_wait_task(child).await?;

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping daemon with PID: {}", pid),
            StopMode::Force => info!("Force killing daemon with PID: {}", pid),
        }

        // Close stdio transport first; closing stdin signals the daemon to exit
        if let Some(mut transport) = self.stdio_transport.take() {
            let _ = transport.close().await; // Ignore errors during shutdown
        }

        #[cfg(unix)]
        {
            unsafe {
                match mode {
                    StopMode::Graceful => {
                        if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                            info!("Sent SIGTERM to daemon {}", pid);
                        }
                        // The wait task detects the exit; callers escalate to
                        // stop(Force) if the daemon lingers.
                    }
                    StopMode::Force => {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        info!("Sent SIGKILL to daemon {}", pid);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Windows process termination not fully implemented");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Update state immediately for API consistency; the wait task also
        // updates it when the actual exit is observed.
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Stopped;

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return, // Already stopped
        };

        info!("Synchronously force killing daemon with PID: {}", pid);

        #[cfg(unix)]
        {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
                info!("Sent SIGKILL to daemon {}", pid);
            }
        }

        #[cfg(not(unix))]
        {
            warn!("Windows sync process kill not implemented - process may remain");
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }
}

impl StderrMonitor for DaemonProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl Drop for DaemonProcessManager {
    fn drop(&mut self) {
        // Release the OS process exactly once even if close() was never called
        self.kill_sync();
    }
}
