use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::wire::{ChatMessage, EmoteEvent, PlayerState, ScreenPose};

/// Events emitted by the core to registered listeners.
///
/// Rendering, chat panels and media UI all consume the same stream;
/// each subscriber picks the variants it cares about.
#[derive(Debug, Clone)]
pub enum VerseEvent {
    ConnectionStateChanged(ConnectionState),
    PlayerJoined(PlayerState),
    PlayerLeft(String), // session id
    PlayerMoved(PlayerState),
    ChatMessageReceived(ChatMessage),
    EmoteReceived(EmoteEvent),
    VoicePeerConnected { peer_id: String },
    VoicePeerDisconnected { peer_id: String },
    SpeakingChanged { peer_id: String, speaking: bool },
    ScreenShareStarted { presenter_id: String },
    ScreenShareEnded,
    ScreenTransformChanged(ScreenPose),
    /// User-facing media failure (capture denied, presenter slot taken).
    MediaError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait VerseEventListener: Send + Sync {
    fn on_event(&self, event: VerseEvent);
}

/// Handle returned by `EventEmitter::add_listener`.
///
/// Call `dispose` to unregister. Dropping the handle without disposing
/// leaves the listener registered for the emitter's lifetime.
pub struct Subscription {
    emitter: Weak<EmitterShared>,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {
        if let Some(shared) = self.emitter.upgrade() {
            shared
                .listeners
                .write()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

struct EmitterShared {
    listeners: RwLock<Vec<(u64, Arc<dyn VerseEventListener>)>>,
    next_id: AtomicU64,
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<EmitterShared>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EmitterShared {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn VerseEventListener>) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.write().unwrap().push((id, listener));
        Subscription {
            emitter: Arc::downgrade(&self.shared),
            id,
        }
    }

    pub fn emit(&self, event: VerseEvent) {
        let listeners = self.shared.listeners.read().unwrap();
        for (_, listener) in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
