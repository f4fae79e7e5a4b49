//! Thin client over the authoritative session server.
//!
//! Owns the single logical connection and the inbound pump task; everything
//! above it (presence, signaling, voice, screen) registers a message handler
//! and sends through `send`.

use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::errors::VerseError;
use crate::events::{ConnectionState, EventEmitter, Subscription, VerseEvent, VerseEventListener};
use crate::wire::{ClientMessage, ServerMessage};

/// Join parameters supplied by the caller.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub name: String,
    pub avatar_ref: String,
    pub env_key: Option<String>,
}

/// Live link handed back by a connector: the assigned session id plus the
/// two halves of the ordered message channel.
pub struct SessionLink {
    pub session_id: String,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Transport seam to the session server.
///
/// Production connectors dial the real server; tests and the loopback
/// harness hand out in-process links.
pub trait SessionConnector: Send + Sync {
    fn connect(
        &self,
        space_id: &str,
        join: JoinInfo,
    ) -> BoxFuture<'static, Result<SessionLink, VerseError>>;
}

/// Receives every inbound server message, in arrival order.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, msg: &ServerMessage);
    /// Called once when the link goes down, before the state change event.
    fn on_disconnect(&self) {}
}

struct ChannelInner {
    connector: Arc<dyn SessionConnector>,
    emitter: EventEmitter,
    state: Mutex<ConnectionState>,
    session_id: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    last_error: Mutex<Option<String>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Manages the lifecycle of the session connection.
///
/// State machine: DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED.
/// There is no automatic reconnect; callers re-invoke `join`.
#[derive(Clone)]
pub struct SessionChannel {
    inner: Arc<ChannelInner>,
}

impl SessionChannel {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                emitter: EventEmitter::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                session_id: Mutex::new(None),
                outbound: Mutex::new(None),
                last_error: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    /// The emitter shared by every component bound to this channel.
    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    /// Register a handler for inbound server messages.
    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().unwrap().push(handler);
    }

    /// Register an event listener.
    ///
    /// The current connection state is replayed to the listener before it
    /// is registered, so a late subscriber never misses the join.
    pub fn add_listener(&self, listener: Arc<dyn VerseEventListener>) -> Subscription {
        listener.on_event(VerseEvent::ConnectionStateChanged(self.state()));
        self.inner.emitter.add_listener(listener)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().unwrap().clone()
    }

    /// The reason the last `join` returned `false`, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Establish the logical connection.
    ///
    /// Returns `false` and records the failure in `last_error` instead of
    /// propagating; callers decide whether to re-attempt.
    pub async fn join(&self, space_id: &str, join: JoinInfo) -> bool {
        match self.state() {
            ConnectionState::Connecting => {
                self.inner.record_error("join already in progress");
                return false;
            }
            ConnectionState::Connected => {
                self.inner.record_error("already connected; leave first");
                return false;
            }
            ConnectionState::Disconnected => {}
        }

        if join.name.trim().is_empty() {
            self.inner.record_error("join requires a non-empty name");
            return false;
        }

        self.inner.set_state(ConnectionState::Connecting);
        tracing::info!("joining space {space_id} as {}", join.name);

        let link = match self.inner.connector.connect(space_id, join).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("join failed: {e}");
                self.inner.record_error(&e.to_string());
                self.inner.set_state(ConnectionState::Disconnected);
                return false;
            }
        };

        *self.inner.session_id.lock().unwrap() = Some(link.session_id.clone());
        *self.inner.outbound.lock().unwrap() = Some(link.outbound);
        *self.inner.last_error.lock().unwrap() = None;
        self.inner.set_state(ConnectionState::Connected);
        tracing::info!("joined space {space_id} with session id {}", link.session_id);

        let inner = self.inner.clone();
        let handle = tokio::spawn(Self::pump(inner, link.inbound));
        *self.inner.pump.lock().unwrap() = Some(handle);

        true
    }

    /// Close the connection. Idempotent if already disconnected.
    pub fn leave(&self) {
        self.inner.teardown(true, "leave requested");
    }

    /// Fire-and-forget send. Logged no-op when disconnected.
    pub fn send(&self, msg: ClientMessage) {
        if self.state() != ConnectionState::Connected {
            tracing::debug!("dropping outbound message while disconnected");
            return;
        }
        let outbound = self.inner.outbound.lock().unwrap();
        match outbound.as_ref() {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    tracing::debug!("dropping outbound message: link closed");
                }
            }
            None => tracing::debug!("dropping outbound message: no link"),
        }
    }

    async fn pump(inner: Arc<ChannelInner>, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
        while let Some(msg) = inbound.recv().await {
            let handlers = inner.handlers.read().unwrap().clone();
            for handler in handlers {
                handler.on_message(&msg);
            }
        }
        // Server-initiated close or network failure.
        inner.teardown(false, "link closed");
    }
}

impl ChannelInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        self.emitter.emit(VerseEvent::ConnectionStateChanged(state));
    }

    fn record_error(&self, reason: &str) {
        tracing::warn!("session channel: {reason}");
        *self.last_error.lock().unwrap() = Some(reason.to_string());
    }

    fn teardown(&self, abort_pump: bool, reason: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        tracing::info!("session channel disconnected: {reason}");

        self.outbound.lock().unwrap().take();
        self.session_id.lock().unwrap().take();
        if let Some(handle) = self.pump.lock().unwrap().take() {
            if abort_pump {
                handle.abort();
            }
        }

        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            handler.on_disconnect();
        }
        self.emitter
            .emit(VerseEvent::ConnectionStateChanged(ConnectionState::Disconnected));
    }
}
