//! A session engine for the path computation element protocol.
//!
//! Peers exchange length prefixed messages over TCP. The engine frames the byte stream,
//! negotiates each session through the OPEN / KEEPALIVE exchange, supervises it with
//! keepalive and dead timers, and hands data messages to a local collaborator through
//! [`SessionListener`].

pub mod network;
pub mod protocol;
pub mod service;
pub mod session;
pub mod utils;

pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Node, PceeConfig, SessionEngine,
    Shutdown,
};
pub use session::{ChannelListener, CloseReason, ListenerEvent, Role, SessionListener};

/// A remote endpoint. Sessions and connections are keyed by it.
pub type PeerAddress = std::net::SocketAddr;
