//! Transport side of the engine.
//!
//! A single dispatcher task owns the listener and every connection. Per-connection reader
//! and writer tasks only move bytes, the dispatcher frames what is read with the
//! demultiplexer and hands complete messages to the session workers.
//!
//! - `frame`: length checks and extraction of one message from a buffer
//! - `demux`: per-peer reassembly of messages split across reads
//! - `connection`: reader and writer tasks of one socket
//! - `dispatcher`: accept, connect, write and close on behalf of sessions

pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionLoss, ReadSettings,
};
pub use demux::Demultiplexer;
pub use dispatcher::{Dispatcher, DispatcherCommand, DispatcherHandle, DispatcherSettings};
pub use frame::PcepFrame;

mod connection;
mod demux;
mod dispatcher;
mod frame;
