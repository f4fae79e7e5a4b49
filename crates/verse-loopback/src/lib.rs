//! In-process space server and media plane for exercising the client
//! core end to end without a network or a real WebRTC stack.

pub mod hub;
pub mod media;

pub use hub::{LoopbackHub, MAX_CLIENTS};
pub use media::{LoopbackCapture, LoopbackMedia, LoopbackTransport};
