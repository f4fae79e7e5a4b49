//! Seams to the platform media layer.
//!
//! This core never touches audio or video bytes; it drives negotiation and
//! lifecycle through these traits. Platform shells bind them to a real
//! WebRTC stack; tests and the loopback harness provide in-process fakes.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use crate::errors::VerseError;

/// Transport-level connection state reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What a peer transport is carrying, which the platform layer may use to
/// pick codecs and directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Bidirectional voice leg of the full mesh.
    VoiceMesh,
    /// Presenter-side outbound screen leg (one per viewer).
    ScreenSender,
    /// Viewer-side inbound screen leg (one per session).
    ScreenReceiver,
}

/// One negotiated connection to a single remote peer.
///
/// Offers, answers and candidates are opaque JSON blobs produced and
/// consumed by the platform layer; this core only ferries them through
/// the signaling relay.
pub trait PeerTransport: Send + Sync {
    fn create_offer(&self) -> Result<Value, VerseError>;
    /// Apply a remote offer and produce the local answer.
    fn accept_offer(&self, offer: &Value) -> Result<Value, VerseError>;
    fn accept_answer(&self, answer: &Value) -> Result<(), VerseError>;
    fn add_remote_candidate(&self, candidate: &Value) -> Result<(), VerseError>;
    /// Drain locally gathered candidates accumulated since the last call.
    fn take_local_candidates(&self) -> Vec<Value>;
    fn state_changes(&self) -> watch::Receiver<TransportState>;
    /// Toggle the local outbound track (mute).
    fn set_outbound_enabled(&self, enabled: bool);
    /// Toggle local playback of the remote track (deafen).
    fn set_playback_enabled(&self, enabled: bool);
    /// Current remote audio level in `0.0..=1.0`, polled by the
    /// voice-activity loop.
    fn audio_level(&self) -> f32;
    fn close(&self);
}

/// A held capture device (microphone or display).
pub trait CaptureHandle: Send + Sync {
    /// Enable or disable the captured track without releasing the device.
    fn set_enabled(&self, enabled: bool);
    /// Fires `true` when the stream ends outside our control, e.g. the
    /// user stops sharing from the OS chrome.
    fn ended(&self) -> watch::Receiver<bool>;
    /// Release the device.
    fn stop(&self);
}

/// Factory for capture devices and peer transports.
///
/// Capture acquisition is async because it may prompt the user; denial
/// surfaces as `VerseError::PermissionDenied`.
pub trait MediaBackend: Send + Sync {
    fn open_microphone(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>>;
    fn open_display(&self) -> BoxFuture<'static, Result<Arc<dyn CaptureHandle>, VerseError>>;
    fn create_peer(
        &self,
        role: PeerRole,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, VerseError>;
}
