//! Connection manager: one long-lived channel per (team, area, user).
//!
//! [`ConnectionManager::connect`] opens the channel and authenticates it,
//! then hands the channel to a background supervisor task which owns it for
//! the rest of its life:
//!
//! ```text
//!            ┌─────────── heartbeat silence / close / read error ───────────┐
//!            ▼                                                               │
//! Reconnecting ──backoff──► establish ──auth:ok──► Connected ── session ────┘
//!            │                  │
//!            │             auth:error ──► Disconnected + Fatal event
//!            └── shutdown ──► Disconnected
//! ```
//!
//! State is published through a watch channel on the [`ConnectionHandle`] and
//! mirrored as [`ChannelEvent::StateChanged`]. Inbound area events flow out as
//! [`ChannelEvent::Inbound`] in arrival order; the transport may deliver an
//! event twice, so consumers apply them idempotently.

pub mod backoff;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use areachat_proto::event::InboundEvent;
use areachat_proto::frame::{self, AuthErrorCode, ClientFrame, ControlFrame, ServerFrame};
use areachat_proto::message::{AreaRef, UserId};

use crate::config::ReconnectConfig;
use crate::transport::{Channel, Connector, TransportError};

/// Lifecycle state of the area channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connect in progress.
    Connecting,
    /// Authenticated and live.
    Connected,
    /// Torn down, or given up after a fatal error.
    Disconnected,
    /// Dropped unexpectedly; retrying with backoff.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Who is connecting, and to which area.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Area to subscribe to.
    pub area: AreaRef,
    /// Authenticated user.
    pub user_id: UserId,
    /// Bearer credential from the session provider.
    pub token: Option<String>,
}

/// Errors establishing the channel.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// No credential was supplied. Fatal; no I/O is attempted.
    #[error("no credential available for the session")]
    MissingCredential,

    /// The server refused the handshake. Fatal.
    #[error("handshake rejected ({code}): {reason}")]
    Rejected {
        /// Machine-readable reason.
        code: AuthErrorCode,
        /// Human-readable reason.
        reason: String,
    },

    /// No `auth:ok` arrived in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectError {
    /// Whether retrying cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingCredential | Self::Rejected { .. })
    }
}

/// Events emitted by the connection manager.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An area event from the server.
    Inbound(InboundEvent),
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// The channel came back after a drop; late messages may be missing.
    Reconnected {
        /// Attempts it took, including the successful one.
        attempts: u32,
    },
    /// Re-authentication was refused; the supervisor stopped.
    Fatal(ConnectError),
}

/// Cloneable sender for outbound frames.
///
/// Frames queued while the channel is down are discarded on reconnect.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<ClientFrame>,
}

impl FrameSender {
    /// Queue a frame for the live channel.
    ///
    /// # Errors
    ///
    /// [`TransportError::Backpressure`] if the queue is full, and
    /// [`TransportError::ConnectionClosed`] once the supervisor has stopped.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }
}

/// Handle to a managed channel. Dropping it disconnects.
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    outbound: FrameSender,
    shutdown: watch::Sender<bool>,
    area: AreaRef,
}

impl ConnectionHandle {
    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the channel is authenticated and live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A cloneable outbound sender.
    #[must_use]
    pub fn sender(&self) -> FrameSender {
        self.outbound.clone()
    }

    /// Queue a frame for the live channel.
    ///
    /// # Errors
    ///
    /// See [`FrameSender::send`].
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.outbound.send(frame)
    }

    /// Tear down the channel and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!(area = %self.area, "channel disconnected");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Establishes and supervises area channels over a [`Connector`].
pub struct ConnectionManager<C: Connector> {
    connector: C,
    settings: ReconnectConfig,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager for the given connector.
    pub const fn new(connector: C, settings: ReconnectConfig) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Connect and authenticate, then supervise the channel in the background.
    ///
    /// A transient failure of the first attempt is not an error: the handle
    /// is returned in the `Reconnecting` state and retries continue.
    ///
    /// # Errors
    ///
    /// Fatal errors only: [`ConnectError::MissingCredential`] and
    /// [`ConnectError::Rejected`].
    pub async fn connect(
        self,
        credentials: Credentials,
        event_buffer: usize,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<ChannelEvent>), ConnectError> {
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (out_tx, out_rx) = mpsc::channel(self.settings.outbound_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_tx = Arc::new(state_tx);

        let initial = match establish(&self.connector, &credentials, &self.settings).await {
            Ok(channel) => {
                state_tx.send_replace(ConnectionState::Connected);
                let _ = event_tx.try_send(ChannelEvent::StateChanged(ConnectionState::Connected));
                Some(channel)
            }
            Err(e) if e.is_fatal() => {
                tracing::warn!(area = %credentials.area, err = %e, "connect failed");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    area = %credentials.area,
                    err = %e,
                    "initial connect failed, retrying in background"
                );
                None
            }
        };

        let handle = ConnectionHandle {
            state: state_rx,
            state_tx: Arc::clone(&state_tx),
            outbound: FrameSender { tx: out_tx },
            shutdown: shutdown_tx,
            area: credentials.area.clone(),
        };

        let supervisor = Supervisor {
            connector: self.connector,
            credentials,
            settings: self.settings,
            state_tx,
            events: event_tx,
            outbound: out_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(supervisor.run(initial));

        Ok((handle, event_rx))
    }

    /// Tear down a channel. Same as [`ConnectionHandle::disconnect`].
    pub fn disconnect(handle: &ConnectionHandle) {
        handle.disconnect();
    }
}

/// How a live session ended.
enum SessionEnd {
    /// Shutdown was requested or the handle is gone.
    Shutdown,
    /// The channel dropped; reconnect.
    Dropped(String),
}

struct Supervisor<C: Connector> {
    connector: C,
    credentials: Credentials,
    settings: ReconnectConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::Sender<ChannelEvent>,
    outbound: mpsc::Receiver<ClientFrame>,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, mut channel: Option<C::Channel>) {
        let backoff = self.settings.backoff();
        let mut attempt: u32 = 0;

        loop {
            if let Some(live) = channel.take() {
                match self.run_session(&live).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => {
                        tracing::warn!(area = %self.credentials.area, %reason, "channel dropped");
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            self.set_state(ConnectionState::Reconnecting).await;
            let delay = backoff.delay(attempt);
            tracing::debug!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnect scheduled"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wait_shutdown(&mut self.shutdown) => break,
            }
            let result = tokio::select! {
                r = establish(&self.connector, &self.credentials, &self.settings) => r,
                () = wait_shutdown(&mut self.shutdown) => break,
            };

            match result {
                Ok(live) => {
                    let stale = self.discard_stale_outbound();
                    tracing::info!(
                        area = %self.credentials.area,
                        attempt,
                        stale,
                        "channel re-established"
                    );
                    self.set_state(ConnectionState::Connected).await;
                    let _ = self
                        .events
                        .send(ChannelEvent::Reconnected { attempts: attempt })
                        .await;
                    attempt = 0;
                    channel = Some(live);
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(area = %self.credentials.area, err = %e, "re-authentication refused");
                    self.set_state(ConnectionState::Disconnected).await;
                    let _ = self.events.send(ChannelEvent::Fatal(e)).await;
                    return;
                }
                Err(e) => {
                    tracing::debug!(attempt, err = %e, "reconnect attempt failed");
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::debug!(area = %self.credentials.area, "connection supervisor exiting");
    }

    /// Drive one authenticated channel until it drops or shutdown.
    async fn run_session(&mut self, channel: &C::Channel) -> SessionEnd {
        let interval = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            let silence_deadline = last_seen + self.settings.heartbeat_timeout;
            tokio::select! {
                () = wait_shutdown(&mut self.shutdown) => return SessionEnd::Shutdown,
                received = channel.recv() => {
                    let text = match received {
                        Ok(text) => text,
                        Err(e) => return SessionEnd::Dropped(e.to_string()),
                    };
                    last_seen = Instant::now();
                    if let Some(end) = self.dispatch_frame(&text).await {
                        return end;
                    }
                }
                outbound = self.outbound.recv() => {
                    let Some(frame) = outbound else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = send_frame(channel, &frame).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    tracing::trace!("heartbeat ping");
                    if let Err(e) = send_frame(channel, &ClientFrame::Ping).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                () = tokio::time::sleep_until(silence_deadline) => {
                    return SessionEnd::Dropped(format!(
                        "no frames for {}s",
                        self.settings.heartbeat_timeout.as_secs()
                    ));
                }
            }
        }
    }

    async fn dispatch_frame(&self, text: &str) -> Option<SessionEnd> {
        match frame::decode_server_frame(text) {
            Ok(ServerFrame::Event(event)) => {
                if self.events.send(ChannelEvent::Inbound(event)).await.is_err() {
                    return Some(SessionEnd::Shutdown);
                }
            }
            Ok(ServerFrame::Control(ControlFrame::Pong)) => tracing::trace!("heartbeat pong"),
            Ok(ServerFrame::Control(ControlFrame::AuthError { code, reason })) => {
                tracing::warn!(%code, %reason, "session revoked by server");
                return Some(SessionEnd::Dropped(format!("session revoked: {reason}")));
            }
            Ok(ServerFrame::Control(ControlFrame::AuthOk { .. })) => {
                tracing::debug!("repeated auth:ok ignored");
            }
            Err(e) => {
                // Malformed frame: log and skip, keep the channel.
                tracing::warn!(err = %e, "malformed channel frame, skipping");
            }
        }
        None
    }

    fn discard_stale_outbound(&mut self) -> usize {
        let mut discarded = 0;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    async fn set_state(&self, state: ConnectionState) {
        if *self.shutdown.borrow() {
            return;
        }
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(area = %self.credentials.area, %state, "connection state changed");
            let _ = self.events.send(ChannelEvent::StateChanged(state)).await;
        }
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Open a channel and complete the `auth` handshake on it.
async fn establish<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    settings: &ReconnectConfig,
) -> Result<C::Channel, ConnectError> {
    let token = credentials
        .token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or(ConnectError::MissingCredential)?;

    let channel = tokio::time::timeout(settings.connect_timeout, connector.open())
        .await
        .map_err(|_| ConnectError::Transport(TransportError::Timeout))??;

    let auth = ClientFrame::Auth {
        token: token.to_string(),
        team_id: credentials.area.team_id.to_string(),
        area_id: credentials.area.area_id.to_string(),
        user_id: credentials.user_id.to_string(),
    };
    send_frame(&channel, &auth).await?;

    let session_id = tokio::time::timeout(settings.handshake_timeout, await_auth_reply(&channel))
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;

    tracing::info!(
        area = %credentials.area,
        session = session_id.as_deref().unwrap_or("-"),
        transport = %channel.transport_type(),
        "channel authenticated"
    );
    Ok(channel)
}

async fn await_auth_reply<Ch: Channel>(channel: &Ch) -> Result<Option<String>, ConnectError> {
    loop {
        let text = channel.recv().await?;
        match frame::decode_server_frame(&text) {
            Ok(ServerFrame::Control(ControlFrame::AuthOk { session_id })) => return Ok(session_id),
            Ok(ServerFrame::Control(ControlFrame::AuthError { code, reason })) => {
                return Err(ConnectError::Rejected { code, reason });
            }
            Ok(other) => tracing::debug!(?other, "frame before auth:ok ignored"),
            Err(e) => tracing::warn!(err = %e, "malformed frame during handshake, skipping"),
        }
    }
}

async fn send_frame<Ch: Channel>(channel: &Ch, frame: &ClientFrame) -> Result<(), ConnectError> {
    let text = frame::encode_client(frame).map_err(|e| ConnectError::Protocol(e.to_string()))?;
    channel.send(text).await?;
    Ok(())
}
