//! Screen share: a single presenter streaming to every other participant
//! over a star of one-way transports.
//!
//! The presenter initiates one outbound leg per viewer and keeps offering
//! as new players join. Viewers hold at most one inbound leg. Only the
//! presenter may move the shared screen; transform fan-outs from anyone
//! else are discarded. A leg that fails is torn down alone; the share
//! survives for everyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{MessageHandler, SessionChannel};
use crate::errors::VerseError;
use crate::events::{ConnectionState, EventEmitter, VerseEvent};
use crate::media::{CaptureHandle, MediaBackend, PeerRole, PeerTransport, TransportState};
use crate::presence::PresenceReplicator;
use crate::signaling::{SignalSink, SignalingRelay};
use crate::wire::{ClientMessage, ScreenPose, ScreenShareState, ServerMessage};

/// One transport plus its connection-state watcher.
struct ScreenLeg {
    peer_id: String,
    transport: Arc<dyn PeerTransport>,
    watcher: JoinHandle<()>,
}

impl ScreenLeg {
    fn shut_down(self) {
        self.watcher.abort();
        self.transport.close();
    }
}

struct ScreenInner {
    weak_self: Weak<ScreenInner>,
    channel: SessionChannel,
    relay: SignalingRelay,
    backend: Arc<dyn MediaBackend>,
    emitter: EventEmitter,
    presence: PresenceReplicator,
    state: Mutex<ScreenShareState>,
    /// Presenter side: one outbound leg per viewer id.
    outbound: Mutex<HashMap<String, ScreenLeg>>,
    /// Viewer side: the single inbound leg.
    inbound: Mutex<Option<ScreenLeg>>,
    capture: Mutex<Option<Arc<dyn CaptureHandle>>>,
    capture_watcher: Mutex<Option<JoinHandle<()>>>,
    sharing: AtomicBool,
}

/// Coordinates the shared screen: capture lifecycle, presenter star
/// topology, and the placement of the screen object in the space.
#[derive(Clone)]
pub struct ScreenShareCoordinator {
    inner: Arc<ScreenInner>,
}

impl ScreenShareCoordinator {
    pub fn new(
        channel: &SessionChannel,
        relay: &SignalingRelay,
        backend: Arc<dyn MediaBackend>,
        presence: &PresenceReplicator,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| ScreenInner {
            weak_self: weak.clone(),
            channel: channel.clone(),
            relay: relay.clone(),
            backend,
            emitter: channel.emitter().clone(),
            presence: presence.clone(),
            state: Mutex::new(ScreenShareState::default()),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
            capture: Mutex::new(None),
            capture_watcher: Mutex::new(None),
            sharing: AtomicBool::new(false),
        });
        channel.add_handler(inner.clone());
        relay.add_sink(Arc::new(ScreenSink(inner.clone())));
        Self { inner }
    }

    /// Become the presenter: acquire display capture, claim the slot, and
    /// offer a stream to every current participant.
    ///
    /// Fails without side effects when someone else is already presenting
    /// or capture is denied; both are also surfaced as `MediaError`.
    pub async fn start_sharing(&self) -> Result<(), VerseError> {
        if self.inner.channel.state() != ConnectionState::Connected {
            return Err(VerseError::Session("not connected to a space".into()));
        }
        let local_id = self
            .inner
            .channel
            .session_id()
            .ok_or_else(|| VerseError::Session("no session id".into()))?;

        {
            let state = self.inner.state.lock().unwrap();
            if state.active && state.presenter_id.as_deref() != Some(local_id.as_str()) {
                let message = "screen share already active".to_string();
                tracing::warn!("{message}");
                self.inner.emitter.emit(VerseEvent::MediaError {
                    message: message.clone(),
                });
                return Err(VerseError::Media(message));
            }
        }
        if self.inner.sharing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let capture = match self.inner.backend.open_display().await {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!("display capture failed: {e}");
                self.inner.emitter.emit(VerseEvent::MediaError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.inner.sharing.store(true, Ordering::SeqCst);
        *self.inner.capture.lock().unwrap() = Some(capture.clone());
        self.inner.channel.send(ClientMessage::ScreenStart);

        // Optimistic local claim; the server echo confirms it.
        *self.inner.state.lock().unwrap() = ScreenShareState {
            presenter_id: Some(local_id.clone()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        };
        self.inner.emitter.emit(VerseEvent::ScreenShareStarted {
            presenter_id: local_id.clone(),
        });

        let mut ended = capture.ended();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            // Fires when the OS ends the capture out from under us.
            while ended.changed().await.is_ok() {
                if *ended.borrow() {
                    tracing::info!("display capture ended externally");
                    inner.stop_sharing();
                    return;
                }
            }
        });
        *self.inner.capture_watcher.lock().unwrap() = Some(handle);

        let viewers = self.inner.presence.remote_players();
        tracing::info!("screen share started, offering to {} viewers", viewers.len());
        for viewer in viewers {
            self.inner.offer_to_viewer(&viewer.id);
        }
        Ok(())
    }

    /// Stop presenting. Idempotent; teardown runs exactly once.
    pub fn stop_sharing(&self) {
        self.inner.stop_sharing();
    }

    /// Move or resize the shared screen. Presenter only.
    pub fn update_transform(&self, pose: ScreenPose) -> Result<(), VerseError> {
        let local_id = self.inner.channel.session_id();
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.active || state.presenter_id.as_deref() != local_id.as_deref() {
                return Err(VerseError::NotPresenter);
            }
            state.pose = pose.clone();
        }
        // No local emit; the server fan-out reaches everyone, us included.
        self.inner
            .channel
            .send(ClientMessage::ScreenUpdateTransform { pose });
        Ok(())
    }

    pub fn is_sharing(&self) -> bool {
        self.inner.sharing.load(Ordering::SeqCst)
    }

    pub fn screen_state(&self) -> ScreenShareState {
        self.inner.state.lock().unwrap().clone()
    }
}

impl ScreenInner {
    fn offer_to_viewer(&self, viewer_id: &str) {
        if Some(viewer_id) == self.channel.session_id().as_deref() {
            return;
        }
        if self.outbound.lock().unwrap().contains_key(viewer_id) {
            return;
        }
        let transport = match self.backend.create_peer(PeerRole::ScreenSender, viewer_id) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("screen transport for {viewer_id} failed: {e}");
                return;
            }
        };
        // Subscribe before negotiating so a state change fired during the
        // exchange is not lost.
        let states = transport.state_changes();
        let offer = match transport.create_offer() {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("screen offer for {viewer_id} failed: {e}");
                transport.close();
                return;
            }
        };
        self.relay.relay("offer", viewer_id, offer);
        for candidate in transport.take_local_candidates() {
            self.relay.relay("ice-candidate", viewer_id, candidate);
        }
        let watcher = self.spawn_leg_watcher(viewer_id.to_string(), states, false);
        self.outbound.lock().unwrap().insert(
            viewer_id.to_string(),
            ScreenLeg {
                peer_id: viewer_id.to_string(),
                transport,
                watcher,
            },
        );
    }

    fn accept_presenter_offer(&self, presenter_id: &str, offer: &Value) {
        if self.sharing.load(Ordering::SeqCst) {
            tracing::warn!("screen offer from {presenter_id} dropped while presenting");
            return;
        }
        let transport = match self.backend.create_peer(PeerRole::ScreenReceiver, presenter_id) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("screen transport from {presenter_id} failed: {e}");
                return;
            }
        };
        let states = transport.state_changes();
        let answer = match transport.accept_offer(offer) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("screen answer to {presenter_id} failed: {e}");
                transport.close();
                return;
            }
        };
        self.relay.relay("answer", presenter_id, answer);
        for candidate in transport.take_local_candidates() {
            self.relay.relay("ice-candidate", presenter_id, candidate);
        }
        let watcher = self.spawn_leg_watcher(presenter_id.to_string(), states, true);
        // A replacement offer supersedes any previous inbound leg.
        if let Some(old) = self.inbound.lock().unwrap().replace(ScreenLeg {
            peer_id: presenter_id.to_string(),
            transport,
            watcher,
        }) {
            tracing::debug!("replacing inbound screen leg from {}", old.peer_id);
            old.shut_down();
        }
    }

    /// Tears down one leg when its transport degrades; the rest of the
    /// star is untouched.
    fn spawn_leg_watcher(
        &self,
        peer_id: String,
        mut rx: watch::Receiver<TransportState>,
        inbound_leg: bool,
    ) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    TransportState::Disconnected
                    | TransportState::Failed
                    | TransportState::Closed => {
                        if let Some(inner) = weak.upgrade() {
                            tracing::warn!("screen leg to {peer_id} ended: {state:?}");
                            if inbound_leg {
                                inner.drop_inbound(&peer_id);
                            } else {
                                inner.drop_outbound(&peer_id);
                            }
                        }
                        return;
                    }
                    TransportState::New
                    | TransportState::Connecting
                    | TransportState::Connected => {}
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn drop_outbound(&self, viewer_id: &str) {
        if let Some(leg) = self.outbound.lock().unwrap().remove(viewer_id) {
            leg.shut_down();
        }
    }

    fn drop_inbound(&self, from: &str) {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.as_ref().is_some_and(|leg| leg.peer_id == from) {
            if let Some(leg) = inbound.take() {
                leg.shut_down();
            }
        }
    }

    /// Release the presenter-side resources exactly once. Returns whether
    /// this call did the release.
    fn release_presenter_resources(&self) -> bool {
        if !self.sharing.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = self.capture_watcher.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(capture) = self.capture.lock().unwrap().take() {
            capture.stop();
        }
        let legs: Vec<ScreenLeg> = self
            .outbound
            .lock()
            .unwrap()
            .drain()
            .map(|(_, leg)| leg)
            .collect();
        for leg in legs {
            leg.shut_down();
        }
        true
    }

    fn stop_sharing(&self) {
        if !self.release_presenter_resources() {
            return;
        }
        tracing::info!("screen share stopped");
        self.channel.send(ClientMessage::ScreenStop);
        *self.state.lock().unwrap() = ScreenShareState::default();
        self.emitter.emit(VerseEvent::ScreenShareEnded);
    }

    fn clear_inbound(&self) {
        if let Some(leg) = self.inbound.lock().unwrap().take() {
            leg.shut_down();
        }
    }

    /// Replace local screen state, emitting on activity edges. A state
    /// naming another presenter while we hold an optimistic claim means we
    /// lost a simultaneous start race; the local claim is released.
    fn apply_state(&self, next: ScreenShareState) {
        let local_id = self.channel.session_id();
        let lost_race = self.sharing.load(Ordering::SeqCst)
            && next.presenter_id.is_some()
            && next.presenter_id.as_deref() != local_id.as_deref();
        if lost_race {
            tracing::warn!(
                "presenter slot won by {:?}, releasing local claim",
                next.presenter_id
            );
            self.release_presenter_resources();
            *self.state.lock().unwrap() = ScreenShareState::default();
            self.emitter.emit(VerseEvent::ScreenShareEnded);
        }

        let (started_by, ended) = {
            let mut state = self.state.lock().unwrap();
            let started = next.active && !state.active;
            let ended = !next.active && state.active;
            let presenter = next.presenter_id.clone();
            *state = next;
            (started.then_some(presenter).flatten(), ended)
        };
        if let Some(presenter_id) = started_by {
            self.emitter
                .emit(VerseEvent::ScreenShareStarted { presenter_id });
        }
        if ended {
            self.clear_inbound();
            self.emitter.emit(VerseEvent::ScreenShareEnded);
        }
    }

    fn screen_ended(&self) {
        // Covers a server-side end of our own share too.
        self.release_presenter_resources();
        let was_active = {
            let mut state = self.state.lock().unwrap();
            let was = state.active;
            *state = ScreenShareState::default();
            was
        };
        self.clear_inbound();
        if was_active {
            self.emitter.emit(VerseEvent::ScreenShareEnded);
        }
    }

    fn local_cleanup(&self) {
        self.release_presenter_resources();
        self.clear_inbound();
        *self.state.lock().unwrap() = ScreenShareState::default();
    }
}

struct ScreenSink(Arc<ScreenInner>);

impl SignalSink for ScreenSink {
    fn on_signal(&self, kind: &str, from_peer: &str, payload: &Value) {
        let inner = &self.0;
        match kind {
            "offer" => inner.accept_presenter_offer(from_peer, payload),
            "answer" => {
                let transport = inner
                    .outbound
                    .lock()
                    .unwrap()
                    .get(from_peer)
                    .map(|leg| leg.transport.clone());
                match transport {
                    Some(transport) => {
                        if let Err(e) = transport.accept_answer(payload) {
                            tracing::warn!("screen answer from {from_peer} rejected: {e}");
                        }
                    }
                    None => tracing::debug!("screen answer from unknown viewer {from_peer}"),
                }
            }
            "ice-candidate" => {
                let transport = inner
                    .outbound
                    .lock()
                    .unwrap()
                    .get(from_peer)
                    .map(|leg| leg.transport.clone())
                    .or_else(|| {
                        inner
                            .inbound
                            .lock()
                            .unwrap()
                            .as_ref()
                            .filter(|leg| leg.peer_id == from_peer)
                            .map(|leg| leg.transport.clone())
                    });
                match transport {
                    Some(transport) => {
                        if let Err(e) = transport.add_remote_candidate(payload) {
                            tracing::warn!("screen candidate from {from_peer} rejected: {e}");
                        }
                    }
                    None => {
                        tracing::debug!("screen candidate from unknown peer {from_peer} dropped")
                    }
                }
            }
            other => tracing::debug!("unknown screen signal kind {other} from {from_peer}"),
        }
    }
}

impl MessageHandler for ScreenInner {
    fn on_message(&self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Snapshot {
                screen: Some(screen),
                ..
            } => {
                self.apply_state(screen.clone());
            }
            ServerMessage::ScreenState(screen) => {
                self.apply_state(screen.clone());
            }
            ServerMessage::ScreenPresenter { id, .. } => {
                let next = ScreenShareState {
                    presenter_id: Some(id.clone()),
                    active: true,
                    pose: self.state.lock().unwrap().pose.clone(),
                };
                self.apply_state(next);
            }
            ServerMessage::ScreenEnded { .. } => {
                self.screen_ended();
            }
            ServerMessage::ScreenTransform { from, pose } => {
                let applied = {
                    let mut state = self.state.lock().unwrap();
                    // Presenter authority check; spoofed transforms are
                    // dropped even if the server relayed them.
                    if state.active && state.presenter_id.as_deref() == Some(from.as_str()) {
                        state.pose = pose.clone();
                        true
                    } else {
                        false
                    }
                };
                if applied {
                    self.emitter
                        .emit(VerseEvent::ScreenTransformChanged(pose.clone()));
                } else {
                    tracing::warn!("screen transform from non-presenter {from} dropped");
                }
            }
            ServerMessage::PlayerAdded(player) => {
                if self.sharing.load(Ordering::SeqCst) {
                    self.offer_to_viewer(&player.id);
                }
            }
            ServerMessage::PlayerLeft { id } | ServerMessage::PlayerRemoved { id } => {
                self.drop_outbound(id);
                let presenter_left = self
                    .inbound
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|leg| leg.peer_id == *id);
                if presenter_left {
                    self.screen_ended();
                }
            }
            _ => {}
        }
    }

    fn on_disconnect(&self) {
        self.local_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::JoinInfo;
    use crate::signaling::SignalScope;
    use crate::test_util::{
        CapturingListener, TestBackend, TestClock, TestConnector, player, settle,
    };
    use crate::throttle::Clock;
    use crate::wire::SignalEnvelope;
    use serde_json::json;

    struct Harness {
        connector: Arc<TestConnector>,
        channel: SessionChannel,
        backend: Arc<TestBackend>,
        screen: ScreenShareCoordinator,
        listener: Arc<CapturingListener>,
    }

    async fn setup_with(backend: Arc<TestBackend>) -> Harness {
        let connector = Arc::new(TestConnector::with_session_id("self-id"));
        let channel = SessionChannel::new(connector.clone());
        let relay = SignalingRelay::new(&channel, SignalScope::Screen);
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let presence = PresenceReplicator::new(&channel, clock);
        let screen = ScreenShareCoordinator::new(&channel, &relay, backend.clone(), &presence);
        assert!(
            channel
                .join(
                    "room-1",
                    JoinInfo {
                        name: "Alice".into(),
                        avatar_ref: "a1".into(),
                        env_key: None,
                    },
                )
                .await
        );
        connector.push(ServerMessage::Snapshot {
            players: vec![
                player("self-id", "Alice"),
                player("p2", "Bob"),
                player("p3", "Carol"),
            ],
            screen: None,
            voice_peers: vec![],
        });
        settle().await;
        let listener = Arc::new(CapturingListener::new());
        let _ = channel.emitter().add_listener(listener.clone());
        Harness {
            connector,
            channel,
            backend,
            screen,
            listener,
        }
    }

    async fn setup() -> Harness {
        setup_with(Arc::new(TestBackend::new())).await
    }

    fn screen_signals(sent: &[ClientMessage]) -> Vec<SignalEnvelope> {
        sent.iter()
            .filter_map(|m| match m {
                ClientMessage::ScreenSignal(env) => Some(env.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn start_claims_slot_and_offers_to_every_viewer() {
        let h = setup().await;
        h.connector.sent();

        h.screen.start_sharing().await.unwrap();

        let sent = h.connector.sent();
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::ScreenStart)));
        let offers: Vec<_> = screen_signals(&sent)
            .into_iter()
            .filter(|env| env.kind == "offer")
            .collect();
        assert_eq!(offers.len(), 2);

        let state = h.screen.screen_state();
        assert!(state.active);
        assert_eq!(state.presenter_id.as_deref(), Some("self-id"));
        assert_eq!(state.pose.y, 1.5);
        assert!(h.listener.events().iter().any(
            |e| matches!(e, VerseEvent::ScreenShareStarted { presenter_id } if presenter_id == "self-id")
        ));
    }

    #[tokio::test]
    async fn start_is_rejected_while_someone_else_presents() {
        let h = setup().await;
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        settle().await;
        h.connector.sent();

        assert!(h.screen.start_sharing().await.is_err());
        assert!(!h.screen.is_sharing());
        assert!(
            !h.connector
                .sent()
                .iter()
                .any(|m| matches!(m, ClientMessage::ScreenStart))
        );
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::MediaError { .. })));
    }

    #[tokio::test]
    async fn capture_denial_surfaces_error_without_claiming() {
        let h = setup().await;
        h.backend.deny_display.store(true, Ordering::SeqCst);
        h.connector.sent();

        assert!(h.screen.start_sharing().await.is_err());
        assert!(!h.screen.is_sharing());
        assert!(
            !h.connector
                .sent()
                .iter()
                .any(|m| matches!(m, ClientMessage::ScreenStart))
        );
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::MediaError { .. })));
    }

    #[tokio::test]
    async fn stop_tears_down_exactly_once() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();

        h.screen.stop_sharing();
        h.screen.stop_sharing();

        let stops = h
            .connector
            .sent()
            .iter()
            .filter(|m| matches!(m, ClientMessage::ScreenStop))
            .count();
        assert_eq!(stops, 1);
        assert!(h.backend.captures()[0].is_stopped());
        assert!(h.backend.transports().iter().all(|t| t.is_closed()));
        assert!(!h.screen.screen_state().active);
        let ended = h
            .listener
            .events()
            .iter()
            .filter(|e| matches!(e, VerseEvent::ScreenShareEnded))
            .count();
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn external_capture_end_stops_the_share() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();

        h.backend.captures()[0].end_stream();
        settle().await;

        assert!(!h.screen.is_sharing());
        assert!(
            h.connector
                .sent()
                .iter()
                .any(|m| matches!(m, ClientMessage::ScreenStop))
        );
    }

    #[tokio::test]
    async fn late_joiner_gets_an_offer() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();

        h.connector
            .push(ServerMessage::PlayerAdded(player("p4", "Dave")));
        settle().await;

        let offers: Vec<_> = screen_signals(&h.connector.sent())
            .into_iter()
            .filter(|env| env.kind == "offer" && env.peer_id == "p4")
            .collect();
        assert_eq!(offers.len(), 1);
    }

    #[tokio::test]
    async fn viewer_answers_presenter_offer() {
        let h = setup().await;
        h.connector.sent();

        h.connector.push(ServerMessage::ScreenSignal(SignalEnvelope {
            kind: "offer".into(),
            peer_id: "p2".into(),
            payload: json!({"sdp": "offer"}),
        }));
        settle().await;

        let answers: Vec<_> = screen_signals(&h.connector.sent())
            .into_iter()
            .filter(|env| env.kind == "answer" && env.peer_id == "p2")
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(h.backend.transports().len(), 1);
        assert_eq!(h.backend.transports()[0].role, PeerRole::ScreenReceiver);
    }

    #[tokio::test]
    async fn failed_outbound_leg_is_dropped_alone() {
        let h = setup_with(Arc::new(TestBackend::manual())).await;
        h.screen.start_sharing().await.unwrap();
        settle().await;

        h.backend
            .transport_for("p2")
            .unwrap()
            .set_state(TransportState::Failed);
        settle().await;

        assert!(h.backend.transport_for("p2").unwrap().is_closed());
        assert!(!h.backend.transport_for("p3").unwrap().is_closed());
        // The share itself survives.
        assert!(h.screen.is_sharing());
        assert!(h.screen.screen_state().active);
    }

    #[tokio::test]
    async fn failed_inbound_leg_is_closed() {
        let h = setup_with(Arc::new(TestBackend::manual())).await;
        h.connector.push(ServerMessage::ScreenSignal(SignalEnvelope {
            kind: "offer".into(),
            peer_id: "p2".into(),
            payload: json!({"sdp": "offer"}),
        }));
        settle().await;
        assert_eq!(h.backend.transports().len(), 1);

        h.backend
            .transport_for("p2")
            .unwrap()
            .set_state(TransportState::Failed);
        settle().await;

        assert!(h.backend.transport_for("p2").unwrap().is_closed());
    }

    #[tokio::test]
    async fn losing_a_start_race_releases_the_local_claim() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();
        h.listener.clear();

        // The authority sided with p2's simultaneous start.
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        settle().await;

        assert!(!h.screen.is_sharing());
        assert!(h.backend.captures()[0].is_stopped());
        assert!(h.backend.transports().iter().all(|t| t.is_closed()));
        // The winner's share is what we now mirror.
        let state = h.screen.screen_state();
        assert!(state.active);
        assert_eq!(state.presenter_id.as_deref(), Some("p2"));
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::ScreenShareEnded)));
        assert!(h.listener.events().iter().any(
            |e| matches!(e, VerseEvent::ScreenShareStarted { presenter_id } if presenter_id == "p2")
        ));
        // No stop announcement; we never really held the slot.
        assert!(
            !h.connector
                .sent()
                .iter()
                .any(|m| matches!(m, ClientMessage::ScreenStop))
        );
    }

    #[tokio::test]
    async fn transform_requires_the_presenter_slot() {
        let h = setup().await;

        // Not presenting at all.
        assert!(matches!(
            h.screen.update_transform(ScreenPose::default()),
            Err(VerseError::NotPresenter)
        ));

        // Someone else presents.
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        settle().await;
        assert!(matches!(
            h.screen.update_transform(ScreenPose::default()),
            Err(VerseError::NotPresenter)
        ));
    }

    #[tokio::test]
    async fn presenter_transform_is_sent_without_local_echo() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();
        h.listener.clear();

        let pose = ScreenPose {
            x: 2.0,
            scale: 1.5,
            ..ScreenPose::spawn_placement()
        };
        h.screen.update_transform(pose.clone()).unwrap();

        assert!(h.connector.sent().iter().any(
            |m| matches!(m, ClientMessage::ScreenUpdateTransform { pose: p } if *p == pose)
        ));
        assert_eq!(h.screen.screen_state().pose, pose);
        // The server fan-out, not the local call, produces the event.
        assert!(!h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::ScreenTransformChanged(_))));
    }

    #[tokio::test]
    async fn transform_fanout_from_presenter_applies() {
        let h = setup().await;
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        settle().await;
        h.listener.clear();

        let pose = ScreenPose {
            x: 3.0,
            ..ScreenPose::spawn_placement()
        };
        h.connector.push(ServerMessage::ScreenTransform {
            from: "p2".into(),
            pose: pose.clone(),
        });
        settle().await;

        assert_eq!(h.screen.screen_state().pose, pose);
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::ScreenTransformChanged(_))));
    }

    #[tokio::test]
    async fn transform_fanout_from_non_presenter_is_dropped() {
        let h = setup().await;
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        settle().await;
        h.listener.clear();

        h.connector.push(ServerMessage::ScreenTransform {
            from: "p3".into(),
            pose: ScreenPose {
                x: 9.0,
                ..ScreenPose::default()
            },
        });
        settle().await;

        assert_eq!(h.screen.screen_state().pose, ScreenPose::spawn_placement());
        assert!(!h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::ScreenTransformChanged(_))));
    }

    #[tokio::test]
    async fn presenter_leaving_ends_the_viewer_side() {
        let h = setup().await;
        h.connector.push(ServerMessage::ScreenState(ScreenShareState {
            presenter_id: Some("p2".into()),
            active: true,
            pose: ScreenPose::spawn_placement(),
        }));
        h.connector.push(ServerMessage::ScreenSignal(SignalEnvelope {
            kind: "offer".into(),
            peer_id: "p2".into(),
            payload: json!({"sdp": "offer"}),
        }));
        settle().await;
        h.listener.clear();

        h.connector.push(ServerMessage::ScreenEnded { id: "p2".into() });
        settle().await;

        assert!(!h.screen.screen_state().active);
        assert!(h.backend.transports()[0].is_closed());
        assert!(h
            .listener
            .events()
            .iter()
            .any(|e| matches!(e, VerseEvent::ScreenShareEnded)));
    }

    #[tokio::test]
    async fn disconnect_cleans_up_without_sending() {
        let h = setup().await;
        h.screen.start_sharing().await.unwrap();
        h.connector.sent();

        h.channel.leave();
        settle().await;

        assert!(!h.screen.is_sharing());
        assert!(!h.screen.screen_state().active);
        assert!(h.backend.captures()[0].is_stopped());
        assert!(
            !h.connector
                .sent()
                .iter()
                .any(|m| matches!(m, ClientMessage::ScreenStop))
        );
    }
}
