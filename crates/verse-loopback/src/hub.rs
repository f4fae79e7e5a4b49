//! In-process session server with the same authority rules as the real
//! one: spawn placement, movement clamping, targeted signal relay with
//! sender substitution, and presenter checks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use verse_core::VerseError;
use verse_core::channel::{JoinInfo, SessionConnector, SessionLink};
use verse_core::wire::{
    ChatMessage, ClientMessage, PlayerState, ScreenPose, ScreenShareState, ServerMessage,
    SignalEnvelope, VoiceRosterEntry,
};

pub const MAX_CLIENTS: usize = 32;

/// Positions are clamped into this cube half-extent.
const POSITION_BOUND: f32 = 50.0;
const NAME_MAX: usize = 32;
const CHAT_MAX: usize = 500;

struct Room {
    players: HashMap<String, PlayerState>,
    voice: HashMap<String, String>,
    screen: ScreenShareState,
    clients: HashMap<String, mpsc::UnboundedSender<ServerMessage>>,
}

impl Room {
    fn new() -> Self {
        Self {
            players: HashMap::new(),
            voice: HashMap::new(),
            screen: ScreenShareState::default(),
            clients: HashMap::new(),
        }
    }
}

/// Connector that hosts rooms in-process. Every client built on the same
/// hub and space id shares one authoritative room state.
pub struct LoopbackHub {
    rooms: Mutex<HashMap<String, Arc<Mutex<Room>>>>,
    next_session: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        })
    }

    fn room(&self, space_id: &str) -> Arc<Mutex<Room>> {
        self.rooms
            .lock()
            .unwrap()
            .entry(space_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new())))
            .clone()
    }
}

impl SessionConnector for LoopbackHub {
    fn connect(
        &self,
        space_id: &str,
        join: JoinInfo,
    ) -> BoxFuture<'static, Result<SessionLink, VerseError>> {
        let room = self.room(space_id);
        let session_id = format!("s{}", self.next_session.fetch_add(1, Ordering::SeqCst) + 1);
        let space_id = space_id.to_string();

        Box::pin(async move {
            let (c2s_tx, mut c2s_rx) = mpsc::unbounded_channel::<ClientMessage>();
            let (s2c_tx, s2c_rx) = mpsc::unbounded_channel::<ServerMessage>();

            {
                let mut r = room.lock().unwrap();
                if r.clients.len() >= MAX_CLIENTS {
                    return Err(VerseError::Connection(format!(
                        "space {space_id} is full"
                    )));
                }

                let name: String = join.name.trim().chars().take(NAME_MAX).collect();
                let player = PlayerState {
                    id: session_id.clone(),
                    name,
                    avatar_ref: join.avatar_ref,
                    x: 0.0,
                    y: 1.0,
                    z: -2.0,
                    ry: std::f32::consts::PI,
                    is_moving: false,
                };
                tracing::info!("{} joined {space_id} as {}", session_id, player.name);

                broadcast(&r, &ServerMessage::PlayerAdded(player.clone()), None);
                r.players.insert(session_id.clone(), player);
                r.clients.insert(session_id.clone(), s2c_tx.clone());

                let snapshot = ServerMessage::Snapshot {
                    players: r.players.values().cloned().collect(),
                    screen: r.screen.active.then(|| r.screen.clone()),
                    voice_peers: r
                        .voice
                        .iter()
                        .map(|(id, name)| VoiceRosterEntry {
                            id: id.clone(),
                            name: name.clone(),
                        })
                        .collect(),
                };
                let _ = s2c_tx.send(snapshot);
            }

            let pump_room = room.clone();
            let pump_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = c2s_rx.recv().await {
                    handle_message(&pump_room, &pump_id, msg);
                }
                handle_leave(&pump_room, &pump_id);
            });

            Ok(SessionLink {
                session_id,
                outbound: c2s_tx,
                inbound: s2c_rx,
            })
        })
    }
}

fn broadcast(room: &Room, msg: &ServerMessage, except: Option<&str>) {
    for (id, tx) in &room.clients {
        if Some(id.as_str()) == except {
            continue;
        }
        let _ = tx.send(msg.clone());
    }
}

fn send_to(room: &Room, target: &str, msg: ServerMessage) {
    match room.clients.get(target) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => tracing::debug!("dropping message for absent client {target}"),
    }
}

fn clamp(v: f32) -> f32 {
    v.clamp(-POSITION_BOUND, POSITION_BOUND)
}

fn handle_message(room: &Arc<Mutex<Room>>, sender: &str, msg: ClientMessage) {
    let mut r = room.lock().unwrap();
    match msg {
        ClientMessage::Move {
            x,
            y,
            z,
            ry,
            is_moving,
        } => {
            let updated = match r.players.get_mut(sender) {
                Some(player) => {
                    player.x = clamp(x);
                    player.y = clamp(y);
                    player.z = clamp(z);
                    player.ry = ry;
                    player.is_moving = is_moving;
                    Some(player.clone())
                }
                None => None,
            };
            if let Some(player) = updated {
                broadcast(&r, &ServerMessage::PlayerUpdated(player), Some(sender));
            }
        }
        ClientMessage::Chat { id, text } => {
            let text: String = text.trim().chars().take(CHAT_MAX).collect();
            if text.is_empty() {
                return;
            }
            let sender_name = r
                .players
                .get(sender)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            let msg = ServerMessage::Chat(ChatMessage {
                id,
                sender_id: sender.to_string(),
                sender_name,
                text,
                timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            });
            broadcast(&r, &msg, None);
        }
        ClientMessage::Emote { name } => {
            let msg = ServerMessage::Emote(verse_core::wire::EmoteEvent {
                sender_id: sender.to_string(),
                name,
            });
            broadcast(&r, &msg, None);
        }
        ClientMessage::VoiceJoin => {
            let name = r
                .players
                .get(sender)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            r.voice.insert(sender.to_string(), name.clone());
            broadcast(
                &r,
                &ServerMessage::VoicePeerJoined {
                    id: sender.to_string(),
                    name,
                },
                Some(sender),
            );
        }
        ClientMessage::VoiceLeave => {
            if r.voice.remove(sender).is_some() {
                broadcast(
                    &r,
                    &ServerMessage::VoicePeerLeft {
                        id: sender.to_string(),
                    },
                    Some(sender),
                );
            }
        }
        ClientMessage::VoiceSignal(env) => {
            relay_signal(&r, sender, env, false);
        }
        ClientMessage::ScreenSignal(env) => {
            relay_signal(&r, sender, env, true);
        }
        ClientMessage::ScreenStart => {
            if r.screen.active && r.screen.presenter_id.as_deref() != Some(sender) {
                tracing::warn!("{sender} tried to present over an active share");
                return;
            }
            r.screen = ScreenShareState {
                presenter_id: Some(sender.to_string()),
                active: true,
                pose: ScreenPose::spawn_placement(),
            };
            let name = r
                .players
                .get(sender)
                .map(|p| p.name.clone())
                .unwrap_or_default();
            broadcast(&r, &ServerMessage::ScreenState(r.screen.clone()), None);
            broadcast(
                &r,
                &ServerMessage::ScreenPresenter {
                    id: sender.to_string(),
                    name,
                },
                Some(sender),
            );
        }
        ClientMessage::ScreenStop => {
            if r.screen.presenter_id.as_deref() != Some(sender) {
                tracing::warn!("{sender} tried to stop a share they do not own");
                return;
            }
            r.screen = ScreenShareState::default();
            broadcast(
                &r,
                &ServerMessage::ScreenEnded {
                    id: sender.to_string(),
                },
                None,
            );
        }
        ClientMessage::ScreenUpdateTransform { pose } => {
            if !r.screen.active || r.screen.presenter_id.as_deref() != Some(sender) {
                tracing::warn!("{sender} tried to move a screen they do not present");
                return;
            }
            r.screen.pose = pose.clone();
            broadcast(
                &r,
                &ServerMessage::ScreenTransform {
                    from: sender.to_string(),
                    pose,
                },
                None,
            );
        }
        ClientMessage::PurgeGhosts { keep } => {
            let doomed: Vec<String> = r
                .players
                .keys()
                .filter(|id| id.as_str() != keep)
                .cloned()
                .collect();
            tracing::warn!("{sender} purged {} entries from the room", doomed.len());
            for id in doomed {
                r.players.remove(&id);
                if r.voice.remove(&id).is_some() {
                    broadcast(&r, &ServerMessage::VoicePeerLeft { id: id.clone() }, None);
                }
                broadcast(&r, &ServerMessage::PlayerLeft { id }, None);
            }
        }
    }
}

/// Targeted relay: the envelope addresses the target on the way in and
/// names the sender on the way out.
fn relay_signal(room: &Room, sender: &str, env: SignalEnvelope, screen: bool) {
    let target = env.peer_id.clone();
    let out = SignalEnvelope {
        kind: env.kind,
        peer_id: sender.to_string(),
        payload: env.payload,
    };
    let msg = if screen {
        ServerMessage::ScreenSignal(out)
    } else {
        ServerMessage::VoiceSignal(out)
    };
    send_to(room, &target, msg);
}

fn handle_leave(room: &Arc<Mutex<Room>>, sender: &str) {
    let mut r = room.lock().unwrap();
    r.clients.remove(sender);
    if r.players.remove(sender).is_none() {
        return;
    }
    tracing::info!("{sender} left");

    if r.voice.remove(sender).is_some() {
        broadcast(
            &r,
            &ServerMessage::VoicePeerLeft {
                id: sender.to_string(),
            },
            None,
        );
    }
    if r.screen.presenter_id.as_deref() == Some(sender) {
        r.screen = ScreenShareState::default();
        broadcast(
            &r,
            &ServerMessage::ScreenEnded {
                id: sender.to_string(),
            },
            None,
        );
    }
    broadcast(
        &r,
        &ServerMessage::PlayerLeft {
            id: sender.to_string(),
        },
        None,
    );
}
