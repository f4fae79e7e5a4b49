//! Wire vocabulary shared between clients and the session server.
//!
//! Messages are JSON objects tagged with a `type` field. Signaling payloads
//! (`voice-signal` / `screen-signal`) are opaque to this layer and carried
//! as raw JSON values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replicated spatial state of one participant, keyed by session id.
///
/// The local entry is writer-owned (each client is authoritative for
/// itself); remote entries are read-only mirrors of server broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_ref: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub ry: f32,
    #[serde(default)]
    pub is_moving: bool,
}

/// Ephemeral chat entry. The id is generated client-side so the local
/// echo and the server fan-out de-duplicate exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp_ms: u64,
}

/// Fire-and-forget emote trigger. Not retained; consumers expire it
/// after their own display window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmoteEvent {
    pub sender_id: String,
    pub name: String,
}

/// Position, rotation and scale of the shared screen object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenPose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
    pub scale: f32,
}

impl Default for ScreenPose {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            rx: 0.0,
            ry: 0.0,
            rz: 0.0,
            scale: 1.0,
        }
    }
}

impl ScreenPose {
    /// Spawn placement used when a share starts: eye height, one meter
    /// in front of the origin.
    pub fn spawn_placement() -> Self {
        Self {
            y: 1.5,
            z: -1.0,
            ..Self::default()
        }
    }
}

/// Singleton per-session screen share state.
///
/// Invariant: at most one presenter at a time; only the client whose id
/// equals `presenter_id` may emit transform updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareState {
    pub presenter_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub pose: ScreenPose,
}

/// Transport-agnostic signaling relay unit. Never persisted.
///
/// On the client→server leg `peer_id` is the target; on the
/// server→client leg it is the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub kind: String,
    pub peer_id: String,
    pub payload: Value,
}

/// Voice roster entry carried in the join snapshot so a late joiner
/// knows who is already in voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceRosterEntry {
    pub id: String,
    pub name: String,
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Move {
        x: f32,
        y: f32,
        z: f32,
        ry: f32,
        #[serde(rename = "isMoving", default)]
        is_moving: bool,
    },
    Chat {
        id: String,
        text: String,
    },
    Emote {
        name: String,
    },
    VoiceJoin,
    VoiceLeave,
    VoiceSignal(SignalEnvelope),
    ScreenStart,
    ScreenStop,
    ScreenUpdateTransform {
        #[serde(flatten)]
        pose: ScreenPose,
    },
    ScreenSignal(SignalEnvelope),
    /// Administrative recovery: drop every presence entry except `keep`.
    PurgeGhosts {
        keep: String,
    },
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full state replay delivered on join, before any incremental update.
    Snapshot {
        players: Vec<PlayerState>,
        #[serde(default)]
        screen: Option<ScreenShareState>,
        #[serde(default, rename = "voicePeers")]
        voice_peers: Vec<VoiceRosterEntry>,
    },
    PlayerAdded(PlayerState),
    PlayerUpdated(PlayerState),
    PlayerRemoved {
        id: String,
    },
    /// Explicit leave broadcast, a stronger signal than passive removal.
    PlayerLeft {
        id: String,
    },
    Chat(ChatMessage),
    Emote(EmoteEvent),
    VoicePeerJoined {
        id: String,
        name: String,
    },
    VoicePeerLeft {
        id: String,
    },
    VoiceSignal(SignalEnvelope),
    ScreenState(ScreenShareState),
    ScreenPresenter {
        id: String,
        name: String,
    },
    ScreenEnded {
        id: String,
    },
    /// Presenter transform fan-out; `from` lets clients verify authority.
    ScreenTransform {
        from: String,
        #[serde(flatten)]
        pose: ScreenPose,
    },
    ScreenSignal(SignalEnvelope),
}
