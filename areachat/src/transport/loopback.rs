//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a channel
//! between a client and a server. [`LoopbackChannel::create_pair`] returns two
//! connected ends; [`endpoint`] returns a [`LoopbackConnector`] whose opens
//! surface on a [`LoopbackListener`] so a test can script the server side.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{Channel, Connector, TransportError, TransportType};

/// In-process channel end backed by `tokio::sync::mpsc`.
pub struct LoopbackChannel {
    /// Sender toward the other end. `None` once closed locally.
    tx: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    /// Frames sent by the other end.
    rx: Mutex<mpsc::Receiver<String>>,
}

impl LoopbackChannel {
    /// Create a pair of connected loopback channels.
    ///
    /// Frames sent on one end are received by the other. `buffer` is the
    /// capacity of each direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);

        let a = Self {
            tx: parking_lot::Mutex::new(Some(tx_b)), // A sends into B's receiver
            rx: Mutex::new(rx_a),
        };
        let b = Self {
            tx: parking_lot::Mutex::new(Some(tx_a)), // B sends into A's receiver
            rx: Mutex::new(rx_b),
        };
        (a, b)
    }

    /// Close the sending direction. The other end sees
    /// [`TransportError::ConnectionClosed`] once it drains pending frames.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

impl Channel for LoopbackChannel {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(text)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

struct ConnectorInner {
    accepted: mpsc::UnboundedSender<LoopbackChannel>,
    fail_remaining: AtomicUsize,
    opens: AtomicUsize,
    buffer: usize,
}

/// Connector whose opened channels are handed to a [`LoopbackListener`].
///
/// Cloning shares the same endpoint, so a test can keep a clone to script
/// open failures while the connection manager owns another.
#[derive(Clone)]
pub struct LoopbackConnector {
    inner: Arc<ConnectorInner>,
}

impl LoopbackConnector {
    /// Make the next `n` opens fail with [`TransportError::Unreachable`].
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of open attempts so far, including failed ones.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    type Channel = LoopbackChannel;

    async fn open(&self) -> Result<LoopbackChannel, TransportError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let scripted_failure = self
            .inner
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(TransportError::Unreachable("loopback".to_string()));
        }

        let (client, server) = LoopbackChannel::create_pair(self.inner.buffer);
        self.inner
            .accepted
            .send(server)
            .map_err(|_| TransportError::Unreachable("loopback".to_string()))?;
        Ok(client)
    }
}

/// Server side of a loopback endpoint.
pub struct LoopbackListener {
    accepted: mpsc::UnboundedReceiver<LoopbackChannel>,
}

impl LoopbackListener {
    /// Wait for the next channel opened by the connector.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<LoopbackChannel> {
        self.accepted.recv().await
    }
}

/// Create a connected loopback connector/listener pair.
#[must_use]
pub fn endpoint(buffer: usize) -> (LoopbackConnector, LoopbackListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = LoopbackConnector {
        inner: Arc::new(ConnectorInner {
            accepted: tx,
            fail_remaining: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            buffer,
        }),
    };
    (connector, LoopbackListener { accepted: rx })
}
