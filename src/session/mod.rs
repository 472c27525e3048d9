//! Client-side push session with reconnect, resubscribe and resync.

pub mod backoff;
pub mod client;
pub mod resync;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{ClientSession, SessionNotice, SessionState};
pub use resync::{HttpStateSource, StateSnapshot, StateSource};
pub use transport::{PushConnection, Transport, WsTransport};
