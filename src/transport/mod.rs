//! Transport channel - duplex frame stream to the exchange front
//!
//! ```text
//!                 ┌──────────── reader task ────────────┐
//! socket ──read──▶│ header → payload_len() → body       │──mpsc──▶ receive()
//!                 └─────────────────────────────────────┘
//! send() ──write_all (bounded by timeout)──▶ socket
//! ```
//!
//! Each connection spawns one reader task that owns the read half and pushes
//! complete frames into a bounded channel. `receive()` only awaits that
//! channel, so it can be raced inside `tokio::select!` without losing bytes.
//! The task is aborted on `close()` and on drop.
//!
//! A peer that stops reading eventually fills the socket buffer; `send()`
//! then fails with `Timeout` instead of blocking the caller. The frame may
//! be half written at that point, so the connection must be dropped.

pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use tcp::TcpTransport;
pub use ws::WsTransport;

/// Frames buffered between the reader task and `receive()`
pub(crate) const READ_QUEUE_SIZE: usize = 1024;

// ============================================================
// ERRORS
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Frame of {len} bytes exceeds max {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    /// Whether the connection is still usable after this error
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

// ============================================================
// ENDPOINT
// ============================================================

/// Exchange front address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `ws://...` or `wss://...`
    WebSocket(String),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() || !addr.contains(':') {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.starts_with("ws://") || s.starts_with("wss://") {
            return Ok(Endpoint::WebSocket(s.to_string()));
        }
        Err(TransportError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::WebSocket(url) => f.write_str(url),
        }
    }
}

// ============================================================
// TRAIT
// ============================================================

/// One connected duplex frame channel.
///
/// Frames are opaque byte sequences (header + payload, see the codec).
#[async_trait]
pub trait Transport: Send {
    /// Write one complete frame, at most `timeout`.
    ///
    /// After a `Timeout` the stream position is undefined; close it.
    async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Wait for the next complete frame, at most `timeout`
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the connection. Idempotent; never fails.
    async fn close(&mut self);

    fn peer(&self) -> &str;
}

/// Opens transports; swapped out in tests
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Dispatches on the endpoint scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let t = TcpTransport::connect(addr, timeout, max_frame_bytes).await?;
                Ok(Box::new(t))
            }
            Endpoint::WebSocket(url) => {
                let t = WsTransport::connect(url, timeout, max_frame_bytes).await?;
                Ok(Box::new(t))
            }
        }
    }
}

/// Bound one write; both transports map their I/O errors to `Send`
pub(crate) async fn send_within<F, E>(timeout: Duration, write: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(timeout, write).await {
        Err(_) => Err(TransportError::Timeout(timeout)),
        Ok(Err(e)) => Err(TransportError::Send(e.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}

/// Shared receive path for the channel-backed transports
pub(crate) async fn recv_from_reader(
    rx: &mut tokio::sync::mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    match tokio::time::timeout(timeout, rx.recv()).await {
        Err(_) => Err(TransportError::Timeout(timeout)),
        Ok(None) => Err(TransportError::Closed),
        Ok(Some(result)) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            "tcp://127.0.0.1:41205".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("127.0.0.1:41205".to_string()))
        );
        assert_eq!(
            "wss://front.example.com/trade".parse::<Endpoint>(),
            Ok(Endpoint::WebSocket("wss://front.example.com/trade".to_string()))
        );
        assert!("tcp://".parse::<Endpoint>().is_err());
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
        assert!("http://x:1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let ep: Endpoint = "tcp://10.0.0.1:17001".parse().unwrap();
        assert_eq!(ep.to_string(), "tcp://10.0.0.1:17001");
    }

    #[test]
    fn test_timeout_is_recoverable() {
        assert!(TransportError::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(!TransportError::Closed.is_timeout());
    }
}
