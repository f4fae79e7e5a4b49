//! Replicated presence: the local player's authoritative state plus
//! read-only mirrors of every remote participant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::channel::{MessageHandler, SessionChannel};
use crate::errors::VerseError;
use crate::events::{
    ConnectionState, EventEmitter, Subscription, VerseEvent, VerseEventListener,
};
use crate::throttle::{Clock, SendGate};
use crate::util::best_effort;
use crate::wire::{ChatMessage, ClientMessage, PlayerState, ServerMessage};

/// Minimum interval between accepted position broadcasts. Calls arriving
/// faster are dropped, bounding upstream volume independent of the
/// caller's frame rate.
pub const MOVE_MIN_INTERVAL: Duration = Duration::from_millis(16);

/// Bounded chat history; oldest entries fall off.
pub const CHAT_HISTORY_CAP: usize = 100;

/// Budget for non-critical companion writes (profile sync).
pub const PROFILE_SYNC_BUDGET: Duration = Duration::from_secs(2);

/// Display profile pushed through a [`ProfileStore`] on a best-effort basis.
#[derive(Debug, Clone)]
pub struct PlayerProfile {
    pub display_name: String,
    pub avatar_ref: String,
}

/// Companion store for profile writes. Outcomes never block or fail the
/// primary session flow.
pub trait ProfileStore: Send + Sync {
    fn save_profile(&self, profile: PlayerProfile) -> BoxFuture<'static, Result<(), VerseError>>;
}

struct PresenceInner {
    channel: SessionChannel,
    emitter: EventEmitter,
    players: Mutex<HashMap<String, PlayerState>>,
    chat_log: Mutex<VecDeque<ChatMessage>>,
    gate: SendGate,
}

/// Maintains the presence map, throttles outbound movement, and fans
/// chat/emote traffic in and out.
#[derive(Clone)]
pub struct PresenceReplicator {
    inner: Arc<PresenceInner>,
}

impl PresenceReplicator {
    pub fn new(channel: &SessionChannel, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(PresenceInner {
            channel: channel.clone(),
            emitter: channel.emitter().clone(),
            players: Mutex::new(HashMap::new()),
            chat_log: Mutex::new(VecDeque::new()),
            gate: SendGate::new(clock, MOVE_MIN_INTERVAL),
        });
        channel.add_handler(inner.clone());
        Self { inner }
    }

    /// Broadcast the local position. Rate-limited: calls inside the
    /// minimum interval are dropped silently, last wins on the next
    /// permitted tick. Silent no-op while disconnected.
    pub fn move_to(&self, x: f32, y: f32, z: f32, ry: f32, is_moving: bool) {
        if !self.inner.gate.permit() {
            return;
        }
        self.inner.channel.send(ClientMessage::Move {
            x,
            y,
            z,
            ry,
            is_moving,
        });
    }

    /// Send a chat message. Emitted immediately (not rate-limited) with a
    /// client-generated id, so the local echo and the server fan-out
    /// de-duplicate exactly. Silent no-op while disconnected.
    pub fn chat(&self, text: &str) {
        if self.inner.channel.state() != ConnectionState::Connected {
            tracing::debug!("chat dropped while disconnected");
            return;
        }
        let sender_id = self.inner.channel.session_id().unwrap_or_default();
        let sender_name = self
            .inner
            .players
            .lock()
            .unwrap()
            .get(&sender_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();

        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            sender_name,
            text: text.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };

        // Optimistic local echo; the server fan-out carries the same id.
        self.inner.record_chat(msg.clone());
        self.inner.channel.send(ClientMessage::Chat {
            id: msg.id,
            text: msg.text,
        });
    }

    /// Fire-and-forget emote. The server fans it out to everyone,
    /// including the sender; nothing is retained here.
    pub fn emote(&self, name: &str) {
        self.inner.channel.send(ClientMessage::Emote {
            name: name.to_string(),
        });
    }

    /// Administrative recovery: drop every known remote entry except
    /// `caller_id`'s own.
    ///
    /// Blunt instrument — no staleness check is performed, so live
    /// players are removed too and will reappear only on their next
    /// server broadcast. Intended for operator cleanup of ghost entries,
    /// not automated use.
    pub fn purge_ghosts(&self, caller_id: &str) {
        let removed: Vec<String> = {
            let mut players = self.inner.players.lock().unwrap();
            let ids: Vec<String> = players
                .keys()
                .filter(|id| id.as_str() != caller_id)
                .cloned()
                .collect();
            for id in &ids {
                players.remove(id);
            }
            ids
        };
        tracing::warn!("purging {} presence entries (keeping {caller_id})", removed.len());
        for id in removed {
            self.inner.emitter.emit(VerseEvent::PlayerLeft(id));
        }
        // Best-effort server-side cleanup; fire-and-forget like the rest.
        self.inner.channel.send(ClientMessage::PurgeGhosts {
            keep: caller_id.to_string(),
        });
    }

    /// Best-effort profile write, raced against a fixed budget. The
    /// outcome is logged and swallowed; callers proceed regardless.
    pub async fn push_profile(&self, store: &dyn ProfileStore, profile: PlayerProfile) {
        best_effort(
            "profile sync",
            PROFILE_SYNC_BUDGET,
            store.save_profile(profile),
        )
        .await;
    }

    /// Register an event listener.
    ///
    /// Every currently-present player is replayed as `PlayerJoined` to
    /// the listener before registration, so a late subscriber observes
    /// the full roster before any incremental update.
    pub fn add_listener(&self, listener: Arc<dyn VerseEventListener>) -> Subscription {
        {
            let players = self.inner.players.lock().unwrap();
            let mut present: Vec<&PlayerState> = players.values().collect();
            present.sort_by(|a, b| a.id.cmp(&b.id));
            for player in present {
                listener.on_event(VerseEvent::PlayerJoined(player.clone()));
            }
        }
        self.inner.emitter.add_listener(listener)
    }

    pub fn players(&self) -> Vec<PlayerState> {
        self.inner.players.lock().unwrap().values().cloned().collect()
    }

    pub fn player(&self, id: &str) -> Option<PlayerState> {
        self.inner.players.lock().unwrap().get(id).cloned()
    }

    /// Everyone except the local player.
    pub fn remote_players(&self) -> Vec<PlayerState> {
        let local = self.inner.channel.session_id();
        self.inner
            .players
            .lock()
            .unwrap()
            .values()
            .filter(|p| Some(p.id.as_str()) != local.as_deref())
            .cloned()
            .collect()
    }

    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.inner.chat_log.lock().unwrap().iter().cloned().collect()
    }

    pub fn local_id(&self) -> Option<String> {
        self.inner.channel.session_id()
    }
}

impl PresenceInner {
    fn upsert(&self, player: PlayerState) {
        let event = {
            let mut players = self.players.lock().unwrap();
            match players.get(&player.id) {
                None => {
                    players.insert(player.id.clone(), player.clone());
                    Some(VerseEvent::PlayerJoined(player))
                }
                Some(existing) if *existing != player => {
                    players.insert(player.id.clone(), player.clone());
                    Some(VerseEvent::PlayerMoved(player))
                }
                Some(_) => None, // no state transition, no event
            }
        };
        if let Some(event) = event {
            self.emitter.emit(event);
        }
    }

    fn remove(&self, id: &str) {
        let was_present = self.players.lock().unwrap().remove(id).is_some();
        if was_present {
            self.emitter.emit(VerseEvent::PlayerLeft(id.to_string()));
        }
    }

    /// Returns false when the id was already in the history (local echo).
    /// The duplicate still overwrites the stored entry: the server copy
    /// carries the authoritative sender name and timestamp, which the
    /// optimistic echo may lack before the roster arrives.
    fn record_chat(&self, msg: ChatMessage) -> bool {
        let mut log = self.chat_log.lock().unwrap();
        if let Some(existing) = log.iter_mut().find(|m| m.id == msg.id) {
            tracing::debug!("duplicate chat {} merged", msg.id);
            *existing = msg;
            return false;
        }
        log.push_back(msg);
        while log.len() > CHAT_HISTORY_CAP {
            log.pop_front();
        }
        true
    }
}

impl MessageHandler for PresenceInner {
    fn on_message(&self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Snapshot { players, .. } => {
                for player in players {
                    self.upsert(player.clone());
                }
            }
            ServerMessage::PlayerAdded(player) | ServerMessage::PlayerUpdated(player) => {
                self.upsert(player.clone());
            }
            ServerMessage::PlayerRemoved { id } | ServerMessage::PlayerLeft { id } => {
                self.remove(id);
            }
            ServerMessage::Chat(msg) => {
                if self.record_chat(msg.clone()) {
                    self.emitter.emit(VerseEvent::ChatMessageReceived(msg.clone()));
                }
            }
            ServerMessage::Emote(event) => {
                self.emitter.emit(VerseEvent::EmoteReceived(event.clone()));
            }
            _ => {}
        }
    }

    fn on_disconnect(&self) {
        self.players.lock().unwrap().clear();
        self.chat_log.lock().unwrap().clear();
    }
}
