//! Shared fakes for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use crate::channel::{JoinInfo, SessionConnector, SessionLink};
use crate::errors::VerseError;
use crate::events::{VerseEvent, VerseEventListener};
use crate::media::{CaptureHandle, MediaBackend, PeerRole, PeerTransport, TransportState};
use crate::throttle::Clock;
use crate::wire::{ClientMessage, ServerMessage};

/// Let spawned pump/watcher tasks run before asserting.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ── connector ────────────────────────────────────────────────────────

pub struct TestConnector {
    session_id: Mutex<String>,
    fail_reason: Mutex<Option<String>>,
    sent_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self {
            session_id: Mutex::new("local-1".to_string()),
            fail_reason: Mutex::new(None),
            sent_rx: Mutex::new(None),
            inbound_tx: Mutex::new(None),
        }
    }

    pub fn with_session_id(id: &str) -> Self {
        let c = Self::new();
        *c.session_id.lock().unwrap() = id.to_string();
        c
    }

    pub fn fail_next_connect(&self, reason: &str) {
        *self.fail_reason.lock().unwrap() = Some(reason.to_string());
    }

    /// Drain everything the client has sent so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        if let Some(rx) = self.sent_rx.lock().unwrap().as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }

    /// Push a server message into the client's inbound pump.
    pub fn push(&self, msg: ServerMessage) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }

    /// Simulate a server-initiated close.
    pub fn close_link(&self) {
        self.inbound_tx.lock().unwrap().take();
    }
}

impl SessionConnector for TestConnector {
    fn connect(
        &self,
        _space_id: &str,
        _join: JoinInfo,
    ) -> BoxFuture<'static, Result<SessionLink, VerseError>> {
        if let Some(reason) = self.fail_reason.lock().unwrap().take() {
            return Box::pin(async move { Err(VerseError::Connection(reason)) });
        }

        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        *self.sent_rx.lock().unwrap() = Some(c2s_rx);
        *self.inbound_tx.lock().unwrap() = Some(s2c_tx);
        let session_id = self.session_id.lock().unwrap().clone();

        Box::pin(async move {
            Ok(SessionLink {
                session_id,
                outbound: c2s_tx,
                inbound: s2c_rx,
            })
        })
    }
}

// ── clock ────────────────────────────────────────────────────────────

pub struct TestClock {
    millis: AtomicU64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicU64::new(0),
        }
    }

    pub fn set_millis(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

// ── listener ─────────────────────────────────────────────────────────

pub struct CapturingListener {
    events: Mutex<Vec<VerseEvent>>,
}

impl CapturingListener {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<VerseEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl VerseEventListener for CapturingListener {
    fn on_event(&self, event: VerseEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ── media backend ────────────────────────────────────────────────────

pub struct TestTransport {
    pub peer_id: String,
    pub role: PeerRole,
    state_tx: watch::Sender<TransportState>,
    level: Mutex<f32>,
    pub outbound_enabled: AtomicBool,
    pub playback_enabled: AtomicBool,
    pub closed: AtomicBool,
    candidates: Mutex<Vec<Value>>,
    auto_connect: bool,
}

impl TestTransport {
    fn new(role: PeerRole, peer_id: &str, auto_connect: bool) -> Self {
        let (state_tx, _) = watch::channel(TransportState::New);
        Self {
            peer_id: peer_id.to_string(),
            role,
            state_tx,
            level: Mutex::new(0.0),
            outbound_enabled: AtomicBool::new(true),
            playback_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            auto_connect,
        }
    }

    pub fn set_state(&self, state: TransportState) {
        self.state_tx.send_replace(state);
    }

    pub fn set_level(&self, level: f32) {
        *self.level.lock().unwrap() = level;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PeerTransport for TestTransport {
    fn create_offer(&self) -> Result<Value, VerseError> {
        self.state_tx.send_replace(TransportState::Connecting);
        self.candidates
            .lock()
            .unwrap()
            .push(json!({"candidate": format!("cand-{}", self.peer_id)}));
        Ok(json!({"sdp": "offer", "to": self.peer_id}))
    }

    fn accept_offer(&self, _offer: &Value) -> Result<Value, VerseError> {
        if self.auto_connect {
            // Retained even with no subscriber yet, like a real stack
            // whose state is observable after the fact.
            self.state_tx.send_replace(TransportState::Connected);
        }
        Ok(json!({"sdp": "answer", "to": self.peer_id}))
    }

    fn accept_answer(&self, _answer: &Value) -> Result<(), VerseError> {
        if self.auto_connect {
            self.state_tx.send_replace(TransportState::Connected);
        }
        Ok(())
    }

    fn add_remote_candidate(&self, _candidate: &Value) -> Result<(), VerseError> {
        Ok(())
    }

    fn take_local_candidates(&self) -> Vec<Value> {
        std::mem::take(&mut self.candidates.lock().unwrap())
    }

    fn state_changes(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn set_outbound_enabled(&self, enabled: bool) {
        self.outbound_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_playback_enabled(&self, enabled: bool) {
        self.playback_enabled.store(enabled, Ordering::SeqCst);
    }

    fn audio_level(&self) -> f32 {
        *self.level.lock().unwrap()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(TransportState::Closed);
    }
}

pub struct TestCapture {
    pub enabled: AtomicBool,
    pub stopped: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

impl TestCapture {
    fn new() -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended_tx,
        }
    }

    /// Simulate the OS ending the stream out from under us.
    pub fn end_stream(&self) {
        let _ = self.ended_tx.send(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl CaptureHandle for TestCapture {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct TestBackend {
    pub deny_microphone: AtomicBool,
    pub deny_display: AtomicBool,
    auto_connect: bool,
    transports: Mutex<Vec<Arc<TestTransport>>>,
    captures: Mutex<Vec<Arc<TestCapture>>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            deny_microphone: AtomicBool::new(false),
            deny_display: AtomicBool::new(false),
            auto_connect: true,
            transports: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
        }
    }

    /// A backend whose transports never settle on their own; tests drive
    /// `TestTransport::set_state` explicitly.
    pub fn manual() -> Self {
        let mut b = Self::new();
        b.auto_connect = false;
        b
    }

    pub fn transports(&self) -> Vec<Arc<TestTransport>> {
        self.transports.lock().unwrap().clone()
    }

    pub fn transport_for(&self, peer_id: &str) -> Option<Arc<TestTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.peer_id == peer_id)
            .cloned()
    }

    pub fn captures(&self) -> Vec<Arc<TestCapture>> {
        self.captures.lock().unwrap().clone()
    }
}

impl MediaBackend for TestBackend {
    fn open_microphone(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(VerseError::PermissionDenied("microphone access".into()))
            });
        }
        let capture = Arc::new(TestCapture::new());
        self.captures.lock().unwrap().push(capture.clone());
        Box::pin(async move { Ok(capture as Arc<dyn CaptureHandle>) })
    }

    fn open_display(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(VerseError::PermissionDenied("display capture".into()))
            });
        }
        let capture = Arc::new(TestCapture::new());
        self.captures.lock().unwrap().push(capture.clone());
        Box::pin(async move { Ok(capture as Arc<dyn CaptureHandle>) })
    }

    fn create_peer(
        &self,
        role: PeerRole,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, VerseError> {
        let transport = Arc::new(TestTransport::new(role, peer_id, self.auto_connect));
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// A minimal remote player for presence tests.
pub fn player(id: &str, name: &str) -> crate::wire::PlayerState {
    crate::wire::PlayerState {
        id: id.to_string(),
        name: name.to_string(),
        avatar_ref: "a1".to_string(),
        x: 0.0,
        y: 1.0,
        z: -2.0,
        ry: 0.0,
        is_moving: false,
    }
}
