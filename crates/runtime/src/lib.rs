//! Transport, connection and session layer for the DevTools protocol.
//!
//! This crate turns a raw message transport (WebSocket, browser pipe,
//! or an in-process bridge) into correlated request/response calls and
//! routed event streams:
//!
//! - [`transport`]: framing over the underlying byte/message channel
//! - [`connection`]: the root [`Connection`] multiplexing everything
//! - [`session`]: per-target [`CdpSession`]s with their own callbacks
//! - [`events`]: the internal broadcast-plus-waiters event bus
//!
//! Higher-level concepts (targets, frames, evaluation) live in the
//! `cdp` crate and are built entirely on this one.

pub mod callback_registry;
pub mod connection;
pub mod error;
pub mod events;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionEvent, ProtocolEvent};
pub use error::{Error, Result};
pub use session::{CdpSession, SessionEvent};
pub use transport::{PipeTransport, TransportParts, WebSocketTransport};
