//! Signaling relay
//!
//! Text messages over persistent WebSocket channels. Clients send `offer` and
//! `ice-candidate`; the bridge replies with `answer` and its own `ice-candidate`s.
//! Messages are parsed into closed enums at the socket boundary; anything that fails
//! validation is logged and dropped without closing the channel.

mod message;
mod relay;
mod server;

pub use message::{ClientMessage, ServerMessage, SignalError};
pub use relay::handle_connection;
pub use server::SignalingServer;
