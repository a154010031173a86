//! Per-peer session establishment and maintenance.
//!
//! - `machine`: the sans-I/O state machine of one session
//! - `policy`: which session characteristics are acceptable, and counter proposals
//! - `timer`: the shared timer task
//! - `registry`: session ownership, worker routing and action execution
//! - `listener`: callbacks toward the local collaborator

pub use listener::{ChannelListener, ListenerEvent, LoggingListener, SessionListener};
pub use machine::{Action, Session, SessionEvent, SessionSnapshot};
pub use policy::{Characteristics, SessionPolicy, SessionSettings};
pub use registry::{EventSink, SessionHandler, SessionRegistry, SessionRouter, SessionTask};
pub use state::{CloseReason, Role, SessionState};
pub use timer::{TimerHandle, TimerKind, TimerOp, TimerService};

mod listener;
mod machine;
mod policy;
mod registry;
mod state;
mod timer;
