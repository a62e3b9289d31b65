#![forbid(unsafe_code)]

// Simulated client - one emulated user's persistent connection and inbox

pub mod inbox;

pub use inbox::Inbox;

use crate::protocol::ServerMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Subprotocol prefix carrying the bearer token on the upgrade request.
pub const TOKEN_SUBPROTOCOL_PREFIX: &str = "access_token|";

/// Connection state of a simulated client.
///
/// `Disconnected -> Connecting -> Connected -> Disconnected`; failures and
/// peer-initiated closes go straight back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// One emulated end user.
///
/// The controlling caller drives `connect` / `send` / `disconnect`; the listen
/// task appends to the inbox and only touches the state on terminal
/// conditions.
pub struct SimulatedClient {
    username: String,
    url: String,
    token: String,
    connect_timeout: Duration,
    state: AtomicU8,
    /// Run-flag for the listen loop; cleared by `disconnect`
    running: AtomicBool,
    /// Set once `disconnect` has been called; the client is not reusable after
    closed: AtomicBool,
    inbox: Arc<Inbox>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    stop: Notify,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedClient {
    pub fn new(username: impl Into<String>, url: impl Into<String>, token: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            username: username.into(),
            url: url.into(),
            token: token.into(),
            connect_timeout,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbox: Arc::new(Inbox::new()),
            sink: tokio::sync::Mutex::new(None),
            source: Mutex::new(None),
            stop: Notify::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Everything received so far, in arrival order.
    pub fn received_messages(&self) -> Vec<ServerMessage> {
        self.inbox.snapshot()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Opens the persistent connection, authenticating with the bearer token
    /// in the `access_token|<token>` subprotocol.
    ///
    /// Only valid from `Disconnected` on a client that has not been
    /// disconnected explicitly; any other call returns false untouched.
    pub async fn connect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            warn!("{}: connect on a closed client", self.username);
            return false;
        }
        if self
            .state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            warn!("{}: connect called while {:?}", self.username, self.state());
            return false;
        }

        let mut request = match self.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                error!("WebSocket connection failed for {}: {}", self.username, e);
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };
        let protocol = format!("{TOKEN_SUBPROTOCOL_PREFIX}{}", self.token);
        match HeaderValue::from_str(&protocol) {
            Ok(value) => {
                request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
            }
            Err(e) => {
                error!("WebSocket connection failed for {}: bad token header: {}", self.username, e);
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        }

        let (stream, _response) = match tokio::time::timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!("WebSocket connection failed for {}: {}", self.username, e);
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
            Err(_) => {
                error!("WebSocket connection failed for {}: timed out after {:?}", self.username, self.connect_timeout);
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
        };

        let (write, read) = stream.split();
        *self.sink.lock().await = Some(write);
        *self.source.lock().unwrap_or_else(|e| e.into_inner()) = Some(read);
        self.running.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        info!("{}: WebSocket connected", self.username);
        true
    }

    /// Sends one text frame. Fire-and-forget: returns false if not connected
    /// or the write fails, never waits for delivery.
    pub async fn send(&self, content: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut sink = self.sink.lock().await;
        let Some(write) = sink.as_mut() else {
            return false;
        };
        match write.send(Message::text(content.to_string())).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send message for {}: {}", self.username, e);
                false
            }
        }
    }

    /// Spawns the listen task for a freshly connected client.
    ///
    /// Returns false if there is no connection to listen on or a listener is
    /// already running.
    pub fn spawn_listener(self: &Arc<Self>) -> bool {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if self.source.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return false;
        }
        *slot = Some(tokio::spawn(Arc::clone(self).listen()));
        true
    }

    /// Receive loop: decodes every inbound frame and appends it to the inbox.
    ///
    /// Ends on stop signal, peer close, transport error or an undecodable
    /// frame. Every ending other than the stop signal leaves the client
    /// `Disconnected`. Never returns an error.
    pub async fn listen(self: Arc<Self>) {
        let Some(mut read) = self.source.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };

        while self.running.load(Ordering::SeqCst) {
            let frame = tokio::select! {
                _ = self.stop.notified() => {
                    debug!("{}: listener stopped", self.username);
                    return;
                }
                frame = read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(&text) {
                    Ok(ServerMessage::Unknown(kind)) => {
                        debug!("{}: skipping unknown {} message", self.username, kind);
                    }
                    Ok(msg) => {
                        debug!("{}: received {} message", self.username, msg.kind());
                        self.inbox.push(msg);
                    }
                    Err(e) => {
                        error!("Error in WebSocket listener for {}: {}", self.username, e);
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed for {}", self.username);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Error in WebSocket listener for {}: {}", self.username, e);
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Stops the listen task, then closes the connection. Safe to call in any
    /// state, any number of times.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();

        // Stop signal before close: the listener must not observe a
        // half-torn-down connection.
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                warn!("{}: listener task ended abnormally: {}", self.username, e);
            }
        }
        self.source.lock().unwrap_or_else(|e| e.into_inner()).take();

        let sink = self.sink.lock().await.take();
        if let Some(mut write) = sink {
            if let Err(e) = write.close().await {
                debug!("{}: close handshake failed: {}", self.username, e);
            }
        }

        if self.state() != ConnectionState::Disconnected {
            info!("{}: disconnected", self.username);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// True once a `join` for `username` has been received.
    pub fn saw_join(&self, username: &str) -> bool {
        self.inbox
            .contains(|msg| matches!(msg, ServerMessage::Join(p) if p.username == username))
    }

    /// Most recent `users` roster received, if any.
    pub fn latest_roster(&self) -> Option<Vec<String>> {
        self.inbox.snapshot().into_iter().rev().find_map(|msg| match msg {
            ServerMessage::Users(users) => Some(users),
            _ => None,
        })
    }
}
