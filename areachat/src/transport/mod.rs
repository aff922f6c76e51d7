//! Transport layer abstraction for the area channel.
//!
//! A [`Connector`] opens fresh [`Channel`]s; the connection manager calls it
//! once per (re)connect attempt. Channels carry JSON text frames and never
//! inspect them. Implementations:
//! - [`ws::WsConnector`]: WebSocket channel to the backend
//! - [`loopback::LoopbackConnector`]: in-process channel pair for testing

pub mod loopback;
pub mod ws;

use std::fmt;
use std::future::Future;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket to the backend.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel has been closed by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// The outbound queue is full; the frame was not queued.
    #[error("outbound queue full")]
    Backpressure,

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional text-frame channel.
///
/// `recv` must be cancel-safe: the connection manager polls it inside
/// `tokio::select!` alongside heartbeats and outbound frames.
pub trait Channel: Send + Sync + 'static {
    /// Send one text frame.
    ///
    /// Returns `Ok(())` once the frame is handed to the underlying
    /// transport. This does NOT guarantee the server processed it.
    fn send(&self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next text frame.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the remote side
    /// has gone away.
    fn recv(&self) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Whether the channel still looks open.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens channels to one fixed endpoint.
pub trait Connector: Send + Sync + 'static {
    /// The channel type produced by this connector.
    type Channel: Channel;

    /// Open a new channel. No authentication happens here.
    fn open(&self) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}
