//! In-process media backend. Transports settle as soon as offer/answer
//! complete; no bytes flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::watch;

use verse_core::VerseError;
use verse_core::media::{CaptureHandle, MediaBackend, PeerRole, PeerTransport, TransportState};

pub struct LoopbackTransport {
    pub peer_id: String,
    pub role: PeerRole,
    state_tx: watch::Sender<TransportState>,
    level: Mutex<f32>,
    playback_enabled: AtomicBool,
    outbound_enabled: AtomicBool,
    closed: AtomicBool,
    candidates: Mutex<Vec<Value>>,
}

impl LoopbackTransport {
    fn new(role: PeerRole, peer_id: &str) -> Self {
        let (state_tx, _) = watch::channel(TransportState::New);
        Self {
            peer_id: peer_id.to_string(),
            role,
            state_tx,
            level: Mutex::new(0.0),
            playback_enabled: AtomicBool::new(true),
            outbound_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
        }
    }

    /// Drive the simulated remote audio level.
    pub fn set_level(&self, level: f32) {
        *self.level.lock().unwrap() = level;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn playback_on(&self) -> bool {
        self.playback_enabled.load(Ordering::SeqCst)
    }
}

impl PeerTransport for LoopbackTransport {
    fn create_offer(&self) -> Result<Value, VerseError> {
        self.state_tx.send_replace(TransportState::Connecting);
        self.candidates
            .lock()
            .unwrap()
            .push(json!({"candidate": format!("loopback-{}", self.peer_id)}));
        Ok(json!({"sdp": "offer", "to": self.peer_id}))
    }

    fn accept_offer(&self, _offer: &Value) -> Result<Value, VerseError> {
        // Retained even with no subscriber yet; watchers that attach
        // later still observe the settled state.
        self.state_tx.send_replace(TransportState::Connected);
        Ok(json!({"sdp": "answer", "to": self.peer_id}))
    }

    fn accept_answer(&self, _answer: &Value) -> Result<(), VerseError> {
        self.state_tx.send_replace(TransportState::Connected);
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

pub struct LoopbackCapture {
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

impl LoopbackCapture {
    fn new() -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended_tx,
        }
    }

    /// Simulate the OS ending the stream.
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

impl CaptureHandle for LoopbackCapture {
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

/// One backend per simulated client.
pub struct LoopbackMedia {
    deny_microphone: AtomicBool,
    deny_display: AtomicBool,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    captures: Mutex<Vec<Arc<LoopbackCapture>>>,
}

impl LoopbackMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_microphone: AtomicBool::new(false),
            deny_display: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
        })
    }

    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn deny_display(&self) {
        self.deny_display.store(true, Ordering::SeqCst);
    }

    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.transports.lock().unwrap().clone()
    }

    pub fn transport_for(&self, peer_id: &str) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.peer_id == peer_id)
            .cloned()
    }

    pub fn captures(&self) -> Vec<Arc<LoopbackCapture>> {
        self.captures.lock().unwrap().clone()
    }
}

impl MediaBackend for LoopbackMedia {
    fn open_microphone(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(VerseError::PermissionDenied("microphone access".into()))
            });
        }
        let capture = Arc::new(LoopbackCapture::new());
        self.captures.lock().unwrap().push(capture.clone());
        Box::pin(async move { Ok(capture as Arc<dyn CaptureHandle>) })
    }

    fn open_display(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(VerseError::PermissionDenied("display capture".into()))
            });
        }
        let capture = Arc::new(LoopbackCapture::new());
        self.captures.lock().unwrap().push(capture.clone());
        Box::pin(async move { Ok(capture as Arc<dyn CaptureHandle>) })
    }

    fn create_peer(
        &self,
        role: PeerRole,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, VerseError> {
        let transport = Arc::new(LoopbackTransport::new(role, peer_id));
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
