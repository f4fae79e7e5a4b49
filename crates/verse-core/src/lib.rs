//! Verse client core: presence replication and media signaling for a
//! shared 3D space.
//!
//! Pure Rust crate with no platform dependencies. Rendering shells bind
//! the connector and media seams and consume the event stream.

pub mod channel;
pub mod errors;
pub mod events;
pub mod media;
pub mod presence;
pub mod screen;
pub mod signaling;
pub mod throttle;
pub mod util;
pub mod voice;
pub mod wire;

#[cfg(test)]
mod test_util;

pub use channel::{JoinInfo, SessionChannel, SessionConnector, SessionLink};
pub use errors::VerseError;
pub use events::{ConnectionState, Subscription, VerseEvent, VerseEventListener};
pub use media::{CaptureHandle, MediaBackend, PeerRole, PeerTransport, TransportState};
pub use presence::PresenceReplicator;
pub use screen::ScreenShareCoordinator;
pub use signaling::{SignalScope, SignalingRelay};
pub use voice::VoiceMeshCoordinator;
