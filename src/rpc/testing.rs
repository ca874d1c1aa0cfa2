//! Test doubles for the RPC layer
//!
//! `ChannelTransport` lets a test play the daemon side of the wire with full
//! control over timing: the test observes every line the dispatcher writes
//! and injects stdout lines whenever it chooses, unlike the replay-only
//! `MockTransport`.

use crate::io::Transport;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error type for the channel transport
#[derive(Debug, thiserror::Error)]
pub enum ChannelTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
}

/// Transport backed by a pair of in-memory channels
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    connected: bool,
}

/// The daemon side of a [`ChannelTransport`]
///
/// Held by the test: read what the client sent, write what the stub daemon
/// answers. Dropping the handle closes the transport like a process exit
/// closes the pipes.
pub struct StubDaemonHandle {
    /// Lines written by the dispatcher (client -> daemon)
    pub from_client: mpsc::UnboundedReceiver<String>,

    /// Lines injected as daemon stdout (daemon -> client)
    pub to_client: mpsc::UnboundedSender<String>,
}

impl StubDaemonHandle {
    /// Inject one daemon stdout line (newline appended)
    pub fn send_line(&self, line: &str) {
        let _ = self.to_client.send(format!("{line}\n"));
    }

    /// Await the next line the client wrote to the daemon's stdin
    pub async fn next_request(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}

impl ChannelTransport {
    /// Create a connected transport / stub-daemon pair
    pub fn pair() -> (Self, StubDaemonHandle) {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();

        let transport = Self {
            outbound: outbound_sender,
            inbound: inbound_receiver,
            connected: true,
        };

        let handle = StubDaemonHandle {
            from_client: outbound_receiver,
            to_client: inbound_sender,
        };

        (transport, handle)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    type Error = ChannelTransportError;

    async fn send(&mut self, line: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(ChannelTransportError::Disconnected);
        }

        self.outbound
            .send(line.to_string())
            .map_err(|_| ChannelTransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(ChannelTransportError::Disconnected);
        }

        self.inbound
            .recv()
            .await
            .ok_or(ChannelTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_round_trip() {
        let (mut transport, mut daemon) = ChannelTransport::pair();

        transport.send("{\"id\":\"1\"}\n").await.unwrap();
        assert_eq!(daemon.next_request().await.unwrap(), "{\"id\":\"1\"}\n");

        daemon.send_line("{\"id\":\"1\",\"result\":{}}");
        let line = transport.receive().await.unwrap();
        assert_eq!(line.trim(), "{\"id\":\"1\",\"result\":{}}");
    }

    #[tokio::test]
    async fn test_dropping_handle_disconnects() {
        let (mut transport, daemon) = ChannelTransport::pair();
        drop(daemon);

        assert!(transport.receive().await.is_err());
    }
}
