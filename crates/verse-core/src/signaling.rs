//! Generic pass-through of signaling envelopes over the session channel.
//!
//! Voice and screen coordinators share this one relay path without knowing
//! about each other; payloads are opaque here. Delivery is fire-and-forget:
//! envelopes addressed to a peer that has left are silently lost.

use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::channel::{MessageHandler, SessionChannel};
use crate::wire::{ClientMessage, ServerMessage, SignalEnvelope};

/// Which coordinator a relay serves. Scopes are routed independently so
/// voice and screen negotiation never see each other's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    Voice,
    Screen,
}

/// Receives inbound signals for one scope.
pub trait SignalSink: Send + Sync {
    fn on_signal(&self, kind: &str, from_peer: &str, payload: &Value);
}

struct RelayInner {
    channel: SessionChannel,
    scope: SignalScope,
    sinks: RwLock<Vec<Arc<dyn SignalSink>>>,
}

#[derive(Clone)]
pub struct SignalingRelay {
    inner: Arc<RelayInner>,
}

impl SignalingRelay {
    pub fn new(channel: &SessionChannel, scope: SignalScope) -> Self {
        let inner = Arc::new(RelayInner {
            channel: channel.clone(),
            scope,
            sinks: RwLock::new(Vec::new()),
        });
        channel.add_handler(inner.clone());
        Self { inner }
    }

    /// Fire-and-forget envelope to `target_peer`. The payload is not
    /// inspected.
    pub fn relay(&self, kind: &str, target_peer: &str, payload: Value) {
        let envelope = SignalEnvelope {
            kind: kind.to_string(),
            peer_id: target_peer.to_string(),
            payload,
        };
        let msg = match self.inner.scope {
            SignalScope::Voice => ClientMessage::VoiceSignal(envelope),
            SignalScope::Screen => ClientMessage::ScreenSignal(envelope),
        };
        self.inner.channel.send(msg);
    }

    pub fn add_sink(&self, sink: Arc<dyn SignalSink>) {
        self.inner.sinks.write().unwrap().push(sink);
    }
}

impl MessageHandler for RelayInner {
    fn on_message(&self, msg: &ServerMessage) {
        let envelope = match (self.scope, msg) {
            (SignalScope::Voice, ServerMessage::VoiceSignal(env)) => env,
            (SignalScope::Screen, ServerMessage::ScreenSignal(env)) => env,
            _ => return,
        };
        tracing::debug!(
            "signal {:?}/{} from {}",
            self.scope,
            envelope.kind,
            envelope.peer_id
        );
        let sinks = self.sinks.read().unwrap().clone();
        for sink in sinks {
            sink.on_signal(&envelope.kind, &envelope.peer_id, &envelope.payload);
        }
    }
}
