//! High-level realtime client: connection management plus typed dispatch
//! behind one handle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::Result;
use crate::codec::JsonCodec;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::TransportError;
use crate::message::Envelope;
use crate::router::{DispatchRouter, Subscription};

/// Realtime client for the JSON envelope protocol.
///
/// Wraps a [`ConnectionManager`] and a [`DispatchRouter`]: a background pump
/// feeds every decoded envelope from the connection into the router, so
/// handlers registered with [`subscribe`](Self::subscribe) fire for matching
/// events regardless of connection churn. Subscriptions are independent of
/// the socket lifecycle and survive reconnection untouched.
///
/// Cloning is cheap; all clones share the same connection and registry.
///
/// # Example
///
/// ```rust,no_run
/// use realtime_client_sdk::{Client, Config, event_types};
///
/// # async fn run() -> anyhow::Result<()> {
/// let client = Client::new(Config::new("wss://realtime.example.com/ws"))?;
///
/// let _sub = client.subscribe(event_types::DRAW_RESULT, |envelope| {
///     println!("draw result: {}", envelope.data);
/// });
///
/// client.connect(Some("session-token")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: ConnectionManager<JsonCodec>,
    router: DispatchRouter,
}

impl Client {
    /// Create a client for the given configuration.
    ///
    /// Validates the endpoint URL and starts the dispatch pump; the socket is
    /// not opened until [`connect`](Self::connect).
    pub fn new(config: Config) -> Result<Self> {
        let connection = ConnectionManager::new(config, JsonCodec)?;
        let router = DispatchRouter::new();

        // The pump holds only the receiver and a router clone, so dropping
        // the last Client closes the broadcast channel and ends the task.
        tokio::spawn(Self::dispatch_pump(connection.subscribe(), router.clone()));

        Ok(Self {
            inner: Arc::new(ClientInner { connection, router }),
        })
    }

    /// Open the connection, optionally authenticating with a session token.
    ///
    /// Resolves once the socket is open, or with the first attempt's error.
    /// Reconnection after a later drop happens in the background. Calling
    /// this while a lifecycle is already active (connected or reconnecting)
    /// only refreshes the stored token and returns `Ok` without waiting for
    /// the socket to be open.
    pub async fn connect(&self, token: Option<&str>) -> Result<()> {
        self.inner.connection.connect(token).await
    }

    /// Close the connection and stop all reconnection. Handlers stay
    /// registered and fire again after a later [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    /// Send an event with the given routing key and payload.
    ///
    /// Fails immediately when not connected; frames are never queued while
    /// offline.
    pub fn send(&self, event_type: &str, data: Value) -> Result<()> {
        self.inner.connection.send(event_type, data)
    }

    /// Send a pre-built envelope, for callers that set `user_id` themselves.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.inner.connection.send_envelope(envelope)
    }

    /// Register a handler for an event type.
    ///
    /// Handlers for the same type fire in registration order. The returned
    /// handle removes the handler via [`Subscription::unsubscribe`].
    #[must_use = "dropping the subscription handle forfeits the ability to unsubscribe"]
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(event_type, handler)
    }

    /// Remove every handler for an event type.
    pub fn unsubscribe_all(&self, event_type: &str) {
        self.inner.router.unsubscribe_all(event_type);
    }

    /// Snapshot of the connection lifecycle.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch connection state changes without polling.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Raw envelope stream, bypassing the router. Each call returns an
    /// independent receiver starting at the current position.
    #[must_use]
    pub fn raw_receiver(&self) -> broadcast::Receiver<Envelope> {
        self.inner.connection.subscribe()
    }

    async fn dispatch_pump(mut rx: broadcast::Receiver<Envelope>, router: DispatchRouter) {
        loop {
            match rx.recv().await {
                Ok(envelope) => router.dispatch(&envelope),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    let lag = TransportError::Lagged { count };
                    tracing::warn!(error = %lag, "dispatch pump fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
