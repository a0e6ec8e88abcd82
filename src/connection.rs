#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::FrameCodec;
use crate::config::Config;
use crate::error::{Error, Kind, TransportError};
use crate::Result;
use crate::message::Envelope;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming envelopes.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket lifecycle is active. `attempts` is non-zero only when
    /// reconnection gave up at the configured ceiling.
    Disconnected {
        /// Reconnection attempts made before stopping
        attempts: u32,
    },
    /// First connection attempt in flight
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after an abnormal close or a failed attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if a reconnection attempt is scheduled or in flight.
    #[must_use]
    pub const fn is_reconnecting(self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

/// Point-in-time view of the connection lifecycle for status observers.
///
/// At most one of `is_connected`/`is_reconnecting` is true; both are false in
/// the initial state, after an explicit disconnect, and after reconnection
/// attempts are exhausted (in which case `reconnect_attempts` holds the
/// configured maximum).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub is_reconnecting: bool,
    pub reconnect_attempts: u32,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected { attempts } => Self {
                is_connected: false,
                is_reconnecting: false,
                reconnect_attempts: attempts,
            },
            ConnectionState::Connecting => Self::default(),
            ConnectionState::Connected { .. } => Self {
                is_connected: true,
                ..Self::default()
            },
            ConnectionState::Reconnecting { attempt } => Self {
                is_connected: false,
                is_reconnecting: true,
                reconnect_attempts: attempt,
            },
        }
    }
}

/// Manages the single physical WebSocket, its lifecycle, reconnection, and
/// heartbeat.
///
/// A background connection loop owns the socket. It publishes
/// [`ConnectionState`] on a watch channel and fans decoded envelopes out on a
/// broadcast channel; consumers never touch the socket directly.
///
/// `disconnect` is the single authoritative cancellation point: every timer
/// and select arm in the loop races against the cancellation token, so a
/// reconnect delay or heartbeat tick that was already queued cannot act after
/// `disconnect` returns.
pub struct ConnectionManager<C: FrameCodec> {
    config: Config,
    codec: Arc<C>,
    /// Token for the next (re)connection URL, refreshed by `connect`
    token: Arc<RwLock<Option<String>>>,
    /// Writer handle of the live connection, `None` while not open
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>,
    broadcast_tx: broadcast::Sender<Envelope>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<C: FrameCodec> ConnectionManager<C> {
    /// Create a manager without opening the socket; call
    /// [`connect`](Self::connect) to start the lifecycle.
    pub fn new(config: Config, codec: C) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation("url must use the ws or wss scheme"));
        }

        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected { attempts: 0 });

        Ok(Self {
            config,
            codec: Arc::new(codec),
            token: Arc::new(RwLock::new(None)),
            outbound: Arc::new(RwLock::new(None)),
            broadcast_tx,
            state_tx,
            state_rx,
            cancel: Mutex::new(None),
        })
    }

    /// Open the connection, resolving once the socket is open.
    ///
    /// Only the initial attempt propagates its failure; after that the
    /// background loop keeps retrying with exponential backoff up to the
    /// configured ceiling, surfacing progress through the state channel.
    ///
    /// Calling this while a lifecycle is already active (connected or mid
    /// reconnection) only refreshes the stored token for future reconnects
    /// and returns `Ok` immediately without waiting for the socket. The live
    /// socket is left untouched and an in-progress reconnection keeps
    /// running toward the configured ceiling.
    pub async fn connect(&self, token: Option<&str>) -> Result<()> {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token.map(str::to_owned);

        let cancel = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            let lifecycle_active = slot.as_ref().is_some_and(|t| !t.is_cancelled())
                && !matches!(*self.state_rx.borrow(), ConnectionState::Disconnected { .. });
            if lifecycle_active {
                return Ok(());
            }
            if let Some(stale) = slot.take() {
                stale.cancel();
            }
            let fresh = CancellationToken::new();
            *slot = Some(fresh.clone());
            fresh
        };

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Self::connection_loop(
            self.config.clone(),
            Arc::clone(&self.codec),
            Arc::clone(&self.token),
            Arc::clone(&self.outbound),
            self.broadcast_tx.clone(),
            self.state_tx.clone(),
            cancel,
            first_tx,
        ));

        match first_rx.await {
            Ok(result) => result,
            // Loop was cancelled before the first attempt completed
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    /// Permanently halt the lifecycle: cancel any pending reconnect or
    /// heartbeat, close the socket, and reset status. Idempotent.
    pub fn disconnect(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = cancel {
            token.cancel();
        }
        // Cleared synchronously so a send racing the loop teardown fails fast
        *self.outbound.write().unwrap_or_else(PoisonError::into_inner) = None;
        _ = self
            .state_tx
            .send(ConnectionState::Disconnected { attempts: 0 });
    }

    /// Send an envelope with the given routing key, stamping the current
    /// wall-clock timestamp.
    ///
    /// Fails with [`TransportError::NotConnected`] unless the connection is
    /// open; frames are never buffered while offline.
    pub fn send(&self, event_type: &str, data: Value) -> Result<()> {
        self.send_envelope(Envelope::new(event_type, data))
    }

    /// Send a pre-built envelope.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        if !self.state_rx.borrow().is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let frame = self.codec.encode(&envelope)?;

        let outbound = self.outbound.read().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_e| TransportError::ConnectionClosed.into()),
            None => Err(TransportError::NotConnected.into()),
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Get a status snapshot derived from the current state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state().into()
    }

    /// Subscribe to decoded inbound envelopes.
    ///
    /// Each call returns a new independent receiver. Multiple subscribers can
    /// receive envelopes concurrently without blocking each other.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcast_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    ///
    /// Useful for status observers reacting to reconnection or terminal
    /// exhaustion without polling.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Main connection loop with automatic reconnection.
    #[expect(
        clippy::too_many_arguments,
        reason = "The spawned loop owns clones of every shared handle"
    )]
    async fn connection_loop(
        config: Config,
        codec: Arc<C>,
        token: Arc<RwLock<Option<String>>>,
        outbound: Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>,
        broadcast_tx: broadcast::Sender<Envelope>,
        state_tx: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
        first_attempt_tx: oneshot::Sender<Result<()>>,
    ) {
        let mut attempt = 0_u32;
        let mut backoff: ExponentialBackoff = config.reconnect.clone().into();
        let mut first_attempt = Some(first_attempt_tx);

        loop {
            if attempt == 0 {
                _ = state_tx.send(ConnectionState::Connecting);
            }

            let session_token = token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let endpoint = match endpoint_url(&config.url, session_token.as_deref()) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    // Not retryable; the base URL was validated at construction
                    tracing::error!(error = %e, "unable to build connection url");
                    if let Some(tx) = first_attempt.take() {
                        _ = tx.send(Err(e));
                    }
                    _ = state_tx.send(ConnectionState::Disconnected { attempts: 0 });
                    return;
                }
            };

            // On cancellation the loop exits without touching the state
            // channel; `disconnect` already published the final state and a
            // replacement lifecycle may have started since.
            let connected = tokio::select! {
                () = cancel.cancelled() => return,
                connected = connect_async(endpoint.as_str()) => connected,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    attempt = 0;
                    backoff.reset();

                    // The writer must be installed before Connected is
                    // announced: a caller resuming from connect() on another
                    // worker may send() immediately
                    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
                    let own_tx = out_tx.clone();
                    *outbound.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(out_tx.clone());

                    _ = state_tx.send(ConnectionState::Connected {
                        since: Instant::now(),
                    });
                    if let Some(tx) = first_attempt.take() {
                        _ = tx.send(Ok(()));
                    }
                    tracing::debug!(url = %config.url, "connection open");

                    Self::handle_connection(
                        ws_stream,
                        out_tx,
                        out_rx,
                        &codec,
                        &broadcast_tx,
                        state_tx.subscribe(),
                        config.heartbeat_interval,
                        &cancel,
                    )
                    .await;

                    // Clear the writer slot only if it is still ours; a
                    // replacement lifecycle may have installed its own sender
                    {
                        let mut slot =
                            outbound.write().unwrap_or_else(PoisonError::into_inner);
                        if slot.as_ref().is_some_and(|tx| tx.same_channel(&own_tx)) {
                            *slot = None;
                        }
                    }

                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!("connection closed unexpectedly");
                }
                Err(e) => {
                    let error = Error::with_source(Kind::WebSocket, TransportError::Connection(e));
                    tracing::warn!(error = %error, "unable to connect");
                    if let Some(tx) = first_attempt.take() {
                        _ = tx.send(Err(error));
                    }
                }
            }

            // Schedule the next attempt, or give up at the ceiling.
            attempt = attempt.saturating_add(1);
            if let Some(max) = config.reconnect.max_attempts
                && attempt > max
            {
                tracing::warn!(attempts = max, "reconnection attempts exhausted");
                _ = state_tx.send(ConnectionState::Disconnected { attempts: max });
                return;
            }
            _ = state_tx.send(ConnectionState::Reconnecting { attempt });

            let delay = backoff
                .next_backoff()
                .unwrap_or(config.reconnect.max_backoff);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = sleep(delay) => {}
            }
        }
    }

    /// Handle an active WebSocket connection until it closes or is cancelled.
    /// The caller installs the writer slot and publishes `Connected` before
    /// entry, and clears the slot after return.
    #[expect(
        clippy::too_many_arguments,
        reason = "The connection handler receives every channel end it services"
    )]
    async fn handle_connection(
        ws_stream: WsStream,
        out_tx: mpsc::UnboundedSender<String>,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        codec: &Arc<C>,
        broadcast_tx: &broadcast::Sender<Envelope>,
        state_rx: watch::Receiver<ConnectionState>,
        heartbeat_interval: Duration,
        cancel: &CancellationToken,
    ) {
        let (mut write, mut read) = ws_stream.split();

        let heartbeat_handle = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(codec),
            out_tx,
            state_rx,
            heartbeat_interval,
        ));

        loop {
            tokio::select! {
                // Inbound frames
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match codec.decode(text.as_bytes()) {
                                Ok(envelopes) => {
                                    for envelope in envelopes {
                                        _ = broadcast_tx.send(envelope);
                                    }
                                }
                                Err(e) => {
                                    // Malformed frame: drop it, keep the connection
                                    tracing::warn!(error = %e, "dropping undecodable frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Ignore binary and protocol-level control frames
                        }
                        Some(Err(e)) => {
                            // The stream terminates after an error; recovery is
                            // driven here so errors are never double-scheduled
                            tracing::warn!(error = %e, "websocket read error");
                            break;
                        }
                    }
                }

                // Outgoing frames from send() and the heartbeat
                Some(frame) = out_rx.recv() => {
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }

                () = cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        heartbeat_handle.abort();
    }

    /// Heartbeat loop: one per live connection, aborted when it ends.
    async fn heartbeat_loop(
        codec: Arc<C>,
        out_tx: mpsc::UnboundedSender<String>,
        state_rx: watch::Receiver<ConnectionState>,
        period: Duration,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the first ping is due one full
        // period after the connection opened
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !state_rx.borrow().is_connected() {
                break;
            }

            match codec.encode(&Envelope::ping()) {
                Ok(frame) => {
                    if out_tx.send(frame).is_err() {
                        // Connection handler has terminated
                        break;
                    }
                    tracing::trace!("sent heartbeat ping");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unable to encode heartbeat");
                    break;
                }
            }
        }
    }
}

/// Build the connection URL, appending the session token when present.
fn endpoint_url(base: &str, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(base)?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    #[test]
    fn endpoint_url_appends_token() {
        let url = endpoint_url("wss://realtime.example.com/ws", Some("abc123")).unwrap();
        assert_eq!(url.as_str(), "wss://realtime.example.com/ws?token=abc123");
    }

    #[test]
    fn endpoint_url_without_token_is_unchanged() {
        let url = endpoint_url("wss://realtime.example.com/ws", None).unwrap();
        assert_eq!(url.as_str(), "wss://realtime.example.com/ws");
    }

    #[test]
    fn endpoint_url_escapes_token() {
        let url = endpoint_url("ws://localhost:4000/ws", Some("a b&c")).unwrap();
        assert_eq!(url.query(), Some("token=a+b%26c"));
    }

    #[test]
    fn status_maps_connected() {
        let status: ConnectionStatus = ConnectionState::Connected {
            since: Instant::now(),
        }
        .into();

        assert!(status.is_connected);
        assert!(!status.is_reconnecting);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[test]
    fn status_maps_reconnecting_with_attempt() {
        let status: ConnectionStatus = ConnectionState::Reconnecting { attempt: 2 }.into();

        assert!(!status.is_connected);
        assert!(status.is_reconnecting);
        assert_eq!(status.reconnect_attempts, 2);
    }

    #[test]
    fn status_maps_exhaustion_as_terminal() {
        let status: ConnectionStatus = ConnectionState::Disconnected { attempts: 3 }.into();

        assert!(!status.is_connected);
        assert!(!status.is_reconnecting);
        assert_eq!(status.reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn rejects_non_websocket_scheme() {
        let manager = ConnectionManager::new(Config::new("https://example.com"), JsonCodec);
        assert!(manager.is_err());
    }

    #[tokio::test]
    async fn send_before_connect_is_refused() {
        let manager =
            ConnectionManager::new(Config::new("ws://localhost:4000/ws"), JsonCodec).unwrap();

        let error = manager.send("ping", Value::Null).unwrap_err();
        let inner = error.downcast_ref::<TransportError>().unwrap();
        assert!(matches!(inner, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop() {
        let manager =
            ConnectionManager::new(Config::new("ws://localhost:4000/ws"), JsonCodec).unwrap();

        manager.disconnect();
        manager.disconnect();

        let status = manager.status();
        assert!(!status.is_connected);
        assert!(!status.is_reconnecting);
        assert_eq!(status.reconnect_attempts, 0);
    }
}
