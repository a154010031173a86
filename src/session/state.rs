use std::fmt;

use serde::{Deserialize, Serialize};

// session states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport and no negotiation in progress
    ///
    /// action: an initiating session arms the connect timer and asks for a transport connect
    ///         an accepting session sends its OPEN and arms the open-wait timer
    /// transition: session initiated the connection => TcpPending
    ///             session accepted the connection => OpenWait
    ///             also the terminal point of release, the session is destroyed afterwards
    Idle = 0,

    /// Waiting for an outbound TCP connect to complete
    ///
    /// action: retry the connect on failure or connect timer expiry
    /// transition: transport established => OpenWait (OPEN sent, open-wait armed)
    ///             retries exhausted => Idle (released)
    TcpPending = 1,

    /// Waiting for the peer's OPEN
    ///
    /// action: validate the OPEN format and the proposed session characteristics
    ///         answer acceptable proposals with KEEPALIVE
    ///         answer a first negotiable mismatch with ERROR(1,4) and a counter proposal
    /// transition: acceptable and localOk => SessionUp
    ///             acceptable and not localOk => KeepWait
    ///             first negotiable mismatch and not localOk => KeepWait
    ///             first negotiable mismatch and localOk => OpenWait (timer restarted)
    ///             any other message, malformed OPEN, unacceptable OPEN, timer expiry => Idle
    OpenWait = 2,

    /// Waiting for the peer to accept our OPEN
    ///
    /// action: accept only KEEPALIVE or ERROR
    ///         adopt a negotiable counter proposal from ERROR(1,4) and resend OPEN
    /// transition: KEEPALIVE and remoteOk => SessionUp
    ///             KEEPALIVE and not remoteOk => OpenWait
    ///             negotiable ERROR and remoteOk => KeepWait (timer restarted)
    ///             negotiable ERROR and not remoteOk => OpenWait
    ///             any other message, unacceptable ERROR, timer expiry => Idle
    KeepWait = 3,

    /// Both sides accepted each other's characteristics
    ///
    /// action: every received message restarts the dead timer
    ///         keepalive timer sends KEEPALIVE periodically
    ///         data messages are routed by role
    /// transition: CLOSE received, malformed message, dead timer expiry, transport loss => Idle
    SessionUp = 4,
}

impl SessionState {
    pub const fn can_transition_to(current: SessionState, target: SessionState) -> bool {
        match (current, target) {
            (_, SessionState::Idle) => true, // release is allowed from anywhere
            (SessionState::Idle, SessionState::TcpPending) => true,
            (SessionState::Idle, SessionState::OpenWait) => true,
            (SessionState::TcpPending, SessionState::TcpPending) => true,
            (SessionState::TcpPending, SessionState::OpenWait) => true,
            (SessionState::OpenWait, SessionState::OpenWait) => true,
            (SessionState::OpenWait, SessionState::KeepWait) => true,
            (SessionState::OpenWait, SessionState::SessionUp) => true,
            (SessionState::KeepWait, SessionState::KeepWait) => true,
            (SessionState::KeepWait, SessionState::OpenWait) => true,
            (SessionState::KeepWait, SessionState::SessionUp) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::TcpPending => "TCP_PENDING",
            SessionState::OpenWait => "OPEN_WAIT",
            SessionState::KeepWait => "KEEP_WAIT",
            SessionState::SessionUp => "SESSION_UP",
        };
        f.write_str(name)
    }
}

/// Which side of the protocol a node plays. Only affects routing in the up state and
/// buffering of local messages before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// path computation client, sends REQUEST and receives RESPONSE
    Client,
    /// path computation element, receives REQUEST and sends RESPONSE
    Server,
}

/// Why a session ended, reported to collaborators through `on_connection_closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// a message or the byte stream itself was malformed
    FramingError,
    /// the peer sent a message not allowed in the current state
    ProtocolSequence,
    /// session characteristics could not be agreed on
    NegotiationFailed,
    OpenWaitExpired,
    KeepWaitExpired,
    DeadTimerExpired,
    ConnectRetriesExhausted,
    /// reset, end of stream or write failure
    TransportFailure,
    /// the peer sent CLOSE
    PeerClosed,
    /// a collaborator asked for the close, or the node shuts down
    LocalClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
