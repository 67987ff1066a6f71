//! Wire codecs for the backend's real-time endpoint.
//!
//! The backend runs a Socket.IO v4 server. Every frame on the wire is an
//! engine.io packet; engine.io `message` packets carry Socket.IO packets.
//!
//! - [`engineio`]: open/ping/pong/message framing and polling payloads
//! - [`socketio`]: connect, event, ack and connect-error packets
//!
//! Binary attachments are not used by the backend and are rejected.

pub mod engineio;
pub mod socketio;

pub use engineio::{EnginePacket, EnginePacketType, OpenHandshake};
pub use socketio::SocketPacket;
