//! Transport layer - raw line exchange with the daemon process
//!
//! Provides the transport abstraction used by the RPC dispatcher. A transport
//! moves whole lines in both directions and knows nothing about the message
//! format; framing and classification live in `crate::rpc::framing`.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Core transport trait for bidirectional line exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one line (the caller includes the trailing newline)
    async fn send(&mut self, line: &str) -> Result<(), Self::Error>;

    /// Receive the next line from the daemon
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if the transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a child process's stdin/stdout pipes
///
/// Writes are funneled through a single writer task so that two concurrent
/// requests can never interleave their bytes on the daemon's stdin.
pub struct StdioTransport {
    /// Channel feeding the stdin writer task
    stdin_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the stdout reader task
    stdout_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes queued lines to the daemon's stdin
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(line) = receiver.recv().await {
            trace!("StdioTransport: writing to daemon stdin: {}", line.trim());

            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!("Failed to write to daemon stdin: {}", e);
                break;
            }

            if let Err(e) = stdin.flush().await {
                error!("Failed to flush daemon stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads lines from the daemon's stdout
    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    trace!("StdioTransport: daemon stdout reached EOF");
                    break;
                }
                Ok(_) => {
                    trace!("StdioTransport: read from daemon stdout: {}", line.trim());

                    if sender.send(line.clone()).is_err() {
                        trace!("StdioTransport: stdout receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from daemon stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, line: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(line.to_string())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
    #[error("No more scripted lines available")]
    NoMoreLines,
}

/// Mock transport for testing - records sent lines, replays scripted ones
pub struct MockTransport {
    /// Lines that were sent via this transport
    sent_lines: Arc<Mutex<Vec<String>>>,

    /// Scripted daemon output returned by receive()
    scripted_lines: Arc<Mutex<VecDeque<String>>>,

    /// Connection status
    connected: bool,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent_lines: Arc::new(Mutex::new(Vec::new())),
            scripted_lines: Arc::new(Mutex::new(VecDeque::new())),
            connected: true,
        }
    }

    /// Create a mock transport with scripted daemon output
    pub fn with_lines(lines: Vec<String>) -> Self {
        let transport = Self::new();
        {
            let mut scripted = transport.scripted_lines.lock().unwrap();
            scripted.extend(lines);
        }
        transport
    }

    /// Queue a line to be returned by the next receive() call
    pub fn push_line(&mut self, line: String) {
        let mut scripted = self.scripted_lines.lock().unwrap();
        scripted.push_back(line);
    }

    /// Get all lines that were sent via this transport
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent_lines.lock().unwrap().clone()
    }

    /// Check if there are more scripted lines available
    pub fn has_lines(&self) -> bool {
        !self.scripted_lines.lock().unwrap().is_empty()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, line: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_lines.lock().unwrap().push(line.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let mut scripted = self.scripted_lines.lock().unwrap();
        scripted.pop_front().ok_or(MockTransportError::NoMoreLines)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_echo() {
        let mut child = Command::new("echo")
            .arg("hello daemon")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo command");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(output.trim(), "hello daemon");

        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport =
            MockTransport::with_lines(vec!["line1".to_string(), "line2".to_string()]);

        transport.send("out1\n").await.unwrap();
        transport.send("out2\n").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "line1");
        assert_eq!(transport.receive().await.unwrap(), "line2");

        let sent = transport.sent_lines();
        assert_eq!(sent, vec!["out1\n", "out2\n"]);

        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();

        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("test\n").await.is_err());
        assert!(transport.receive().await.is_err());
    }
}
