//! Full-mesh voice: one peer transport per remote participant in voice,
//! negotiated over the signaling relay.
//!
//! The joiner initiates: on enable we offer to everyone already in voice
//! (seeded from the join snapshot), and later joiners offer to us. Both
//! sides never offer to each other at once, so negotiation glare cannot
//! occur in the steady state; a duplicate inbound offer is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{MessageHandler, SessionChannel};
use crate::errors::VerseError;
use crate::events::{ConnectionState, EventEmitter, VerseEvent};
use crate::media::{CaptureHandle, MediaBackend, PeerRole, PeerTransport, TransportState};
use crate::signaling::{SignalSink, SignalingRelay};
use crate::wire::{ClientMessage, ServerMessage};

/// Remote audio level at or above which a peer counts as speaking.
pub const SPEAKING_THRESHOLD: f32 = 0.08;

/// Poll cadence of the voice-activity loop.
pub const VAD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on simultaneous mesh legs (room capacity minus self).
pub const MESH_PEER_CEILING: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    /// We sent an offer and wait for the answer.
    AwaitingAnswer,
    /// Offer/answer exchanged in either direction; ICE in progress.
    AnswerExchanged,
    Connected,
}

struct VoicePeer {
    transport: Arc<dyn PeerTransport>,
    negotiation: NegotiationState,
    tasks: Vec<JoinHandle<()>>,
}

struct VoiceInner {
    channel: SessionChannel,
    relay: SignalingRelay,
    backend: Arc<dyn MediaBackend>,
    emitter: EventEmitter,
    peers: Mutex<HashMap<String, VoicePeer>>,
    /// Who is currently in voice (id -> name), tracked whether or not we
    /// are, so enable can offer to the existing roster.
    roster: Mutex<HashMap<String, String>>,
    mic: Mutex<Option<Arc<dyn CaptureHandle>>>,
    enabled: AtomicBool,
    muted: AtomicBool,
    deafened: AtomicBool,
}

/// Coordinates the voice mesh: microphone lifecycle, per-peer transports,
/// mute/deafen, and voice-activity events.
#[derive(Clone)]
pub struct VoiceMeshCoordinator {
    inner: Arc<VoiceInner>,
}

impl VoiceMeshCoordinator {
    pub fn new(
        channel: &SessionChannel,
        relay: &SignalingRelay,
        backend: Arc<dyn MediaBackend>,
    ) -> Self {
        let inner = Arc::new(VoiceInner {
            channel: channel.clone(),
            relay: relay.clone(),
            backend,
            emitter: channel.emitter().clone(),
            peers: Mutex::new(HashMap::new()),
            roster: Mutex::new(HashMap::new()),
            mic: Mutex::new(None),
            enabled: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            deafened: AtomicBool::new(false),
        });
        channel.add_handler(inner.clone());
        relay.add_sink(Arc::new(VoiceSink(inner.clone())));
        Self { inner }
    }

    /// Join voice: acquire the microphone, announce ourselves, and offer
    /// to everyone already in the roster.
    ///
    /// Capture denial is surfaced both as the returned error and as a
    /// `MediaError` event; no announcement is sent in that case.
    pub async fn enable(&self) -> Result<(), VerseError> {
        if self.inner.channel.state() != ConnectionState::Connected {
            return Err(VerseError::Session("not connected to a space".into()));
        }
        if self.inner.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mic = match self.inner.backend.open_microphone().await {
            Ok(mic) => mic,
            Err(e) => {
                tracing::warn!("microphone acquisition failed: {e}");
                self.inner.emitter.emit(VerseEvent::MediaError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        mic.set_enabled(!self.inner.muted.load(Ordering::SeqCst));
        *self.inner.mic.lock().unwrap() = Some(mic);
        self.inner.enabled.store(true, Ordering::SeqCst);

        self.inner.channel.send(ClientMessage::VoiceJoin);

        let existing: Vec<String> = {
            let roster = self.inner.roster.lock().unwrap();
            let mut ids: Vec<String> = roster.keys().cloned().collect();
            ids.sort();
            ids
        };
        tracing::info!("voice enabled, offering to {} existing peers", existing.len());
        for peer_id in existing {
            self.inner.offer_to(&peer_id);
        }
        Ok(())
    }

    /// Leave voice: announce, tear down every mesh leg, release the mic.
    /// Idempotent.
    pub fn disable(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("voice disabled");
        self.inner.channel.send(ClientMessage::VoiceLeave);
        self.inner.teardown_all_peers();
        if let Some(mic) = self.inner.mic.lock().unwrap().take() {
            mic.stop();
        }
    }

    /// Mute stops the outbound audio only; inbound audio is unaffected.
    /// Applied at the capture and on every mesh leg.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
        if let Some(mic) = self.inner.mic.lock().unwrap().as_ref() {
            mic.set_enabled(!muted);
        }
        let peers = self.inner.peers.lock().unwrap();
        for peer in peers.values() {
            peer.transport.set_outbound_enabled(!muted);
        }
    }

    /// Deafen stops playback of every remote track; our outbound track
    /// is unaffected.
    pub fn set_deafened(&self, deafened: bool) {
        self.inner.deafened.store(deafened, Ordering::SeqCst);
        let peers = self.inner.peers.lock().unwrap();
        for peer in peers.values() {
            peer.transport.set_playback_enabled(!deafened);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    pub fn is_deafened(&self) -> bool {
        self.inner.deafened.load(Ordering::SeqCst)
    }

    /// Ids of peers with an established mesh leg.
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.negotiation == NegotiationState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Everyone currently in voice, whether or not we are.
    pub fn roster(&self) -> Vec<(String, String)> {
        let roster = self.inner.roster.lock().unwrap();
        let mut entries: Vec<(String, String)> =
            roster.iter().map(|(id, name)| (id.clone(), name.clone())).collect();
        entries.sort();
        entries
    }
}

impl VoiceInner {
    fn offer_to(self: &Arc<Self>, peer_id: &str) {
        {
            let peers = self.peers.lock().unwrap();
            if peers.contains_key(peer_id) {
                return;
            }
            if peers.len() >= MESH_PEER_CEILING {
                tracing::warn!("mesh at capacity ({MESH_PEER_CEILING}), not offering to {peer_id}");
                return;
            }
        }

        let transport = match self.backend.create_peer(PeerRole::VoiceMesh, peer_id) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("peer transport for {peer_id} failed: {e}");
                return;
            }
        };
        // Subscribe before negotiating so a state change fired during the
        // exchange is not lost.
        let states = transport.state_changes();
        let offer = match transport.create_offer() {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("offer for {peer_id} failed: {e}");
                transport.close();
                return;
            }
        };
        transport.set_outbound_enabled(!self.muted.load(Ordering::SeqCst));
        transport.set_playback_enabled(!self.deafened.load(Ordering::SeqCst));

        self.relay.relay("offer", peer_id, offer);
        for candidate in transport.take_local_candidates() {
            self.relay.relay("ice-candidate", peer_id, candidate);
        }
        self.install_peer(peer_id, transport, states, NegotiationState::AwaitingAnswer);
    }

    fn accept_inbound_offer(self: &Arc<Self>, peer_id: &str, offer: &Value) {
        if self.peers.lock().unwrap().contains_key(peer_id) {
            tracing::warn!("duplicate offer from {peer_id} dropped");
            return;
        }
        let transport = match self.backend.create_peer(PeerRole::VoiceMesh, peer_id) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("peer transport for {peer_id} failed: {e}");
                return;
            }
        };
        // Applying the offer can settle the transport immediately; hold a
        // receiver from before so the watcher still observes it.
        let states = transport.state_changes();
        let answer = match transport.accept_offer(offer) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("answer for {peer_id} failed: {e}");
                transport.close();
                return;
            }
        };
        transport.set_outbound_enabled(!self.muted.load(Ordering::SeqCst));
        transport.set_playback_enabled(!self.deafened.load(Ordering::SeqCst));

        self.relay.relay("answer", peer_id, answer);
        for candidate in transport.take_local_candidates() {
            self.relay.relay("ice-candidate", peer_id, candidate);
        }
        self.install_peer(peer_id, transport, states, NegotiationState::AnswerExchanged);
    }

    /// Insert the peer before spawning its watcher tasks so a transport
    /// that settles immediately still finds its map entry.
    fn install_peer(
        self: &Arc<Self>,
        peer_id: &str,
        transport: Arc<dyn PeerTransport>,
        states: watch::Receiver<TransportState>,
        negotiation: NegotiationState,
    ) {
        self.peers.lock().unwrap().insert(
            peer_id.to_string(),
            VoicePeer {
                transport: transport.clone(),
                negotiation,
                tasks: Vec::new(),
            },
        );

        let tasks = vec![
            tokio::spawn(Self::watch_transport(
                self.clone(),
                peer_id.to_string(),
                states,
            )),
            tokio::spawn(Self::vad_loop(self.clone(), peer_id.to_string(), transport)),
        ];
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(peer_id) {
            Some(peer) => peer.tasks = tasks,
            // Torn down between the two locks; reap the orphans.
            None => {
                for task in tasks {
                    task.abort();
                }
            }
        }
    }

    async fn watch_transport(
        inner: Arc<Self>,
        peer_id: String,
        mut rx: watch::Receiver<TransportState>,
    ) {
        loop {
            let state = *rx.borrow_and_update();
            match state {
                TransportState::Connected => inner.mark_connected(&peer_id),
                TransportState::Disconnected
                | TransportState::Failed
                | TransportState::Closed => {
                    tracing::debug!("voice leg to {peer_id} ended: {state:?}");
                    inner.teardown_peer(&peer_id);
                    return;
                }
                TransportState::New | TransportState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Edge-detects the remote audio level against the speaking threshold.
    async fn vad_loop(inner: Arc<Self>, peer_id: String, transport: Arc<dyn PeerTransport>) {
        let mut interval = tokio::time::interval(VAD_POLL_INTERVAL);
        let mut speaking = false;
        loop {
            interval.tick().await;
            let now = transport.audio_level() >= SPEAKING_THRESHOLD;
            if now != speaking {
                speaking = now;
                inner.emitter.emit(VerseEvent::SpeakingChanged {
                    peer_id: peer_id.clone(),
                    speaking,
                });
            }
        }
    }

    fn mark_connected(&self, peer_id: &str) {
        let newly = {
            let mut peers = self.peers.lock().unwrap();
            match peers.get_mut(peer_id) {
                Some(peer) if peer.negotiation != NegotiationState::Connected => {
                    peer.negotiation = NegotiationState::Connected;
                    true
                }
                _ => false,
            }
        };
        if newly {
            tracing::info!("voice leg to {peer_id} connected");
            self.emitter.emit(VerseEvent::VoicePeerConnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn teardown_peer(&self, peer_id: &str) {
        let removed = self.peers.lock().unwrap().remove(peer_id);
        if let Some(peer) = removed {
            for task in peer.tasks {
                task.abort();
            }
            peer.transport.close();
            if peer.negotiation == NegotiationState::Connected {
                self.emitter.emit(VerseEvent::VoicePeerDisconnected {
                    peer_id: peer_id.to_string(),
                });
            }
        }
    }

    fn teardown_all_peers(&self) {
        let ids: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.teardown_peer(&id);
        }
    }

    fn is_self(&self, id: &str) -> bool {
        self.channel.session_id().as_deref() == Some(id)
    }
}

/// Sink registered with the relay; carries the `Arc` that peer
/// installation needs for task spawning.
struct VoiceSink(Arc<VoiceInner>);

impl SignalSink for VoiceSink {
    fn on_signal(&self, kind: &str, from_peer: &str, payload: &Value) {
        let inner = &self.0;
        if !inner.enabled.load(Ordering::SeqCst) {
            tracing::debug!("voice signal {kind} from {from_peer} dropped while disabled");
            return;
        }
        match kind {
            "offer" => inner.accept_inbound_offer(from_peer, payload),
            "answer" => {
                let stale = {
                    let mut peers = inner.peers.lock().unwrap();
                    match peers.get_mut(from_peer) {
                        Some(peer) if peer.negotiation == NegotiationState::AwaitingAnswer => {
                            if let Err(e) = peer.transport.accept_answer(payload) {
                                tracing::warn!("answer from {from_peer} rejected: {e}");
                            } else {
                                peer.negotiation = NegotiationState::AnswerExchanged;
                            }
                            false
                        }
                        _ => true,
                    }
                };
                if stale {
                    tracing::warn!("stale answer from {from_peer} dropped");
                }
            }
            "ice-candidate" => {
                let transport = inner
                    .peers
                    .lock()
                    .unwrap()
                    .get(from_peer)
                    .map(|p| p.transport.clone());
                match transport {
                    Some(transport) => {
                        if let Err(e) = transport.add_remote_candidate(payload) {
                            tracing::warn!("candidate from {from_peer} rejected: {e}");
                        }
                    }
                    None => tracing::debug!("candidate from unknown peer {from_peer} dropped"),
                }
            }
            other => tracing::debug!("unknown voice signal kind {other} from {from_peer}"),
        }
    }
}

impl MessageHandler for VoiceInner {
    fn on_message(&self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Snapshot { voice_peers, .. } => {
                let mut roster = self.roster.lock().unwrap();
                roster.clear();
                for entry in voice_peers {
                    if !self.is_self(&entry.id) {
                        roster.insert(entry.id.clone(), entry.name.clone());
                    }
                }
            }
            ServerMessage::VoicePeerJoined { id, name } => {
                if !self.is_self(id) {
                    self.roster.lock().unwrap().insert(id.clone(), name.clone());
                }
            }
            ServerMessage::VoicePeerLeft { id } => {
                self.roster.lock().unwrap().remove(id);
                self.teardown_peer(id);
            }
            ServerMessage::PlayerLeft { id } | ServerMessage::PlayerRemoved { id } => {
                self.roster.lock().unwrap().remove(id);
                self.teardown_peer(id);
            }
            _ => {}
        }
    }

    fn on_disconnect(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.teardown_all_peers();
        self.roster.lock().unwrap().clear();
        if let Some(mic) = self.mic.lock().unwrap().take() {
            mic.stop();
        }
    }
}
