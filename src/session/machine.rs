use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::policy::{Characteristics, SessionSettings};
use super::state::{CloseReason, Role, SessionState};
use super::timer::TimerKind;
use crate::protocol::{
    check_message_format, close_message, error_message, keepalive_message, open_message,
    CloseCause, ErrorObject, EstablishmentError, MessageContent, MessageType, OpenObject,
    PcepMessage,
};
use crate::utils::{TimerToken, TimerTokenGenerator};
use crate::PeerAddress;

/// Input of a session, delivered in order by the session's worker.
#[derive(Debug)]
pub enum SessionEvent {
    /// a peer connected to our listener
    Accepted,
    /// a collaborator asked for a session to this peer
    ConnectRequested,
    /// the outbound TCP connect completed
    TransportUp,
    /// the outbound TCP connect failed
    TransportFailed,
    /// end of stream, reset or write failure on an established connection
    ConnectionLost,
    /// the byte stream could not be framed, reading has stopped
    FramingFailed,
    /// a message received from the peer
    Network(PcepMessage),
    /// a message handed over by a local collaborator
    Local(PcepMessage),
    TimerExpired { kind: TimerKind, token: TimerToken },
    /// a collaborator asked to tear the session down
    CloseRequested,
}

/// Output of a session, executed in order by the worker.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// open a TCP connection to the peer
    Connect,
    /// write a message to the peer
    Send(PcepMessage),
    /// hand a data message to the local collaborator
    Deliver(PcepMessage),
    ArmTimer {
        kind: TimerKind,
        token: TimerToken,
        after: Duration,
    },
    CancelTimer {
        kind: TimerKind,
        token: TimerToken,
    },
    /// the session reached the up state
    Established,
    /// close the connection and forget the session
    Close(CloseReason),
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer: PeerAddress,
    pub role: Role,
    pub state: SessionState,
    pub connection_initiated: bool,
    pub local_ok: bool,
    pub remote_ok: bool,
    pub armed_timers: Vec<TimerKind>,
    /// keepalive interval we run with
    pub keepalive: u8,
    /// keepalive interval the peer announced
    pub peer_keepalive: u8,
    /// dead timer the peer asked us to run
    pub peer_dead_timer: u8,
    pub queued_messages: usize,
}

/// Protocol state of one peer.
///
/// The session does no I/O. Each event produces a list of [`Action`]s that the owning
/// worker executes. Timers are referenced by token, an expiry whose token no longer
/// matches the armed slot is stale and ignored.
#[derive(Debug)]
pub struct Session {
    peer: PeerAddress,
    role: Role,
    state: SessionState,
    connection_initiated: bool,
    connection_established: bool,
    local_ok: bool,
    remote_ok: bool,
    open_retry_count: u32,
    connect_retry_count: u32,
    /// our proposal, may be adjusted by a counter proposal
    keepalive: u8,
    dead_timer: u8,
    /// the peer's accepted proposal
    peer_keepalive: u8,
    peer_dead_timer: u8,
    session_id: u8,
    keepalive_started: bool,
    closed: bool,
    timers: [Option<TimerToken>; TimerKind::COUNT],
    outbound: VecDeque<PcepMessage>,
    settings: Arc<SessionSettings>,
    tokens: Arc<TimerTokenGenerator>,
    actions: Vec<Action>,
}

impl Session {
    pub fn new(
        peer: PeerAddress,
        role: Role,
        connection_initiated: bool,
        session_id: u8,
        settings: Arc<SessionSettings>,
        tokens: Arc<TimerTokenGenerator>,
    ) -> Self {
        Session {
            peer,
            role,
            state: SessionState::Idle,
            connection_initiated,
            connection_established: false,
            local_ok: false,
            remote_ok: false,
            open_retry_count: 0,
            connect_retry_count: 0,
            keepalive: settings.keepalive,
            dead_timer: settings.dead_timer,
            peer_keepalive: 0,
            peer_dead_timer: 0,
            session_id,
            keepalive_started: false,
            closed: false,
            timers: [None; TimerKind::COUNT],
            outbound: VecDeque::new(),
            settings,
            tokens,
            actions: Vec::new(),
        }
    }

    /// Leaves IDLE: an initiator starts connecting, an acceptor sends its OPEN.
    pub fn start(&mut self) -> Vec<Action> {
        if self.connection_initiated {
            self.arm(TimerKind::Connect, self.settings.connect_timeout);
            self.actions.push(Action::Connect);
            self.set_state(SessionState::TcpPending);
        } else {
            self.connection_established = true;
            self.send_open();
            self.arm(TimerKind::OpenWait, self.settings.open_wait);
            self.set_state(SessionState::OpenWait);
        }
        self.take_actions()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        if self.closed {
            trace!(peer = %self.peer, "session closed, dropping {:?}", event);
            return Vec::new();
        }
        match event {
            SessionEvent::Accepted | SessionEvent::ConnectRequested => {
                warn!(peer = %self.peer, "session already exists, ignoring {:?}", event);
            }
            SessionEvent::TransportUp => self.on_transport_up(),
            SessionEvent::TransportFailed => {
                if self.state == SessionState::TcpPending {
                    self.on_connect_failed();
                }
            }
            SessionEvent::ConnectionLost => {
                if self.state == SessionState::TcpPending {
                    self.on_connect_failed();
                } else {
                    self.close(CloseReason::TransportFailure);
                }
            }
            SessionEvent::FramingFailed => {
                warn!(peer = %self.peer, state = %self.state, "unframeable byte stream");
                self.on_format_error();
            }
            SessionEvent::Network(message) => self.on_network_message(message),
            SessionEvent::Local(message) => self.on_local_message(message),
            SessionEvent::TimerExpired { kind, token } => {
                if self.timers[kind.index()] == Some(token) {
                    self.timers[kind.index()] = None;
                    self.on_timer(kind);
                } else {
                    trace!(peer = %self.peer, ?kind, token, "stale timer expiry");
                }
            }
            SessionEvent::CloseRequested => {
                if self.connection_established {
                    self.send(close_message(CloseCause::NoExplanation));
                }
                self.close(CloseReason::LocalClose);
            }
        }
        self.take_actions()
    }

    /// Cancels every armed timer and returns to IDLE. Safe to call repeatedly.
    pub fn release(&mut self) -> Vec<Action> {
        self.release_resources();
        self.take_actions()
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_ok(&self) -> bool {
        self.local_ok
    }

    pub fn remote_ok(&self) -> bool {
        self.remote_ok
    }

    pub fn armed_timers(&self) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| self.timers[kind.index()].is_some())
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer: self.peer,
            role: self.role,
            state: self.state,
            connection_initiated: self.connection_initiated,
            local_ok: self.local_ok,
            remote_ok: self.remote_ok,
            armed_timers: self.armed_timers(),
            keepalive: self.keepalive,
            peer_keepalive: self.peer_keepalive,
            peer_dead_timer: self.peer_dead_timer,
            queued_messages: self.outbound.len(),
        }
    }

    fn on_transport_up(&mut self) {
        if self.state != SessionState::TcpPending {
            debug!(peer = %self.peer, state = %self.state, "unexpected transport up");
            return;
        }
        self.connection_established = true;
        self.send_open();
        self.cancel(TimerKind::Connect);
        self.arm(TimerKind::OpenWait, self.settings.open_wait);
        self.set_state(SessionState::OpenWait);
    }

    fn on_connect_failed(&mut self) {
        self.connect_retry_count += 1;
        if self.connect_retry_count >= self.settings.max_connect_retries {
            warn!(
                peer = %self.peer,
                retries = self.connect_retry_count,
                "giving up connecting"
            );
            self.close(CloseReason::ConnectRetriesExhausted);
            return;
        }
        debug!(peer = %self.peer, retry = self.connect_retry_count, "retrying connect");
        self.actions.push(Action::Connect);
        self.arm(TimerKind::Connect, self.settings.connect_timeout);
        self.set_state(SessionState::TcpPending);
    }

    fn on_network_message(&mut self, message: PcepMessage) {
        match self.state {
            SessionState::OpenWait => self.on_open_wait_message(message),
            SessionState::KeepWait => self.on_keep_wait_message(message),
            SessionState::SessionUp => self.on_session_up_message(message),
            SessionState::Idle | SessionState::TcpPending => {
                warn!(peer = %self.peer, state = %self.state, "message without a transport: {:?}", message);
            }
        }
    }

    fn on_open_wait_message(&mut self, message: PcepMessage) {
        match message.message_type() {
            Ok(MessageType::Open) => {}
            Ok(other) => {
                info!(peer = %self.peer, "expected OPEN, received {}", other);
                self.close(CloseReason::ProtocolSequence);
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer, "malformed message in OPEN_WAIT: {}", e);
                self.on_format_error();
                return;
            }
        }
        let open = match check_message_format(&message) {
            Ok(MessageContent::Open(open)) => open,
            Ok(other) => {
                warn!(peer = %self.peer, "OPEN decoded as {:?}", other);
                self.on_format_error();
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer, "malformed OPEN: {}", e);
                self.on_format_error();
                return;
            }
        };

        match self.settings.policy.check(&open) {
            Characteristics::Acceptable => {
                debug!(
                    peer = %self.peer,
                    keepalive = open.keepalive,
                    dead_timer = open.dead_timer,
                    "peer proposal accepted"
                );
                self.peer_keepalive = open.keepalive;
                self.peer_dead_timer = open.dead_timer;
                self.send(keepalive_message());
                self.remote_ok = true;
                self.cancel(TimerKind::OpenWait);
                if self.local_ok {
                    self.enter_session_up();
                } else {
                    self.arm(TimerKind::KeepWait, self.settings.keep_wait);
                    self.set_state(SessionState::KeepWait);
                }
            }
            Characteristics::Negotiable if self.open_retry_count == 0 => {
                self.open_retry_count += 1;
                let proposal = self
                    .settings
                    .policy
                    .counter_proposal(&open, self.session_id);
                info!(
                    peer = %self.peer,
                    keepalive = open.keepalive,
                    dead_timer = open.dead_timer,
                    "peer proposal negotiable, counter proposing {}/{}",
                    proposal.keepalive,
                    proposal.dead_timer
                );
                self.send(error_message(
                    ErrorObject::establishment(EstablishmentError::Negotiable),
                    Some(proposal),
                ));
                if self.local_ok {
                    self.arm(TimerKind::OpenWait, self.settings.open_wait);
                    self.set_state(SessionState::OpenWait);
                } else {
                    self.cancel(TimerKind::OpenWait);
                    self.arm(TimerKind::KeepWait, self.settings.keep_wait);
                    self.set_state(SessionState::KeepWait);
                }
            }
            Characteristics::Negotiable => {
                info!(peer = %self.peer, "second proposal still unacceptable");
                self.send_error(EstablishmentError::SecondOpenUnacceptable);
                self.close(CloseReason::NegotiationFailed);
            }
            Characteristics::NotNegotiable => {
                info!(
                    peer = %self.peer,
                    keepalive = open.keepalive,
                    dead_timer = open.dead_timer,
                    "peer proposal not negotiable"
                );
                self.send_error(EstablishmentError::NotNegotiable);
                self.close(CloseReason::NegotiationFailed);
            }
        }
    }

    fn on_keep_wait_message(&mut self, message: PcepMessage) {
        match message.message_type() {
            Ok(MessageType::Keepalive) | Ok(MessageType::Error) => {}
            Ok(other) => {
                info!(peer = %self.peer, "expected KEEPALIVE or ERROR, received {}", other);
                self.close(CloseReason::ProtocolSequence);
                return;
            }
            Err(e) => {
                warn!(peer = %self.peer, "malformed message in KEEP_WAIT: {}", e);
                self.on_format_error();
                return;
            }
        }
        let content = match check_message_format(&message) {
            Ok(content) => content,
            Err(e) => {
                warn!(peer = %self.peer, "malformed message in KEEP_WAIT: {}", e);
                self.on_format_error();
                return;
            }
        };

        match content {
            MessageContent::Keepalive => {
                self.local_ok = true;
                self.cancel(TimerKind::KeepWait);
                if self.remote_ok {
                    self.enter_session_up();
                } else {
                    self.arm(TimerKind::OpenWait, self.settings.open_wait);
                    self.set_state(SessionState::OpenWait);
                }
            }
            MessageContent::Error { error, proposal } => {
                let adopted = proposal.filter(|open| {
                    error.is(EstablishmentError::Negotiable)
                        && self.settings.policy.check(open) == Characteristics::Acceptable
                });
                let Some(open) = adopted else {
                    info!(
                        peer = %self.peer,
                        error_type = error.error_type,
                        error_value = error.error_value,
                        "peer rejected our proposal"
                    );
                    self.send_error(EstablishmentError::UnacceptableProposal);
                    self.close(CloseReason::NegotiationFailed);
                    return;
                };
                info!(
                    peer = %self.peer,
                    keepalive = open.keepalive,
                    dead_timer = open.dead_timer,
                    "adopting counter proposal"
                );
                self.keepalive = open.keepalive;
                self.dead_timer = open.dead_timer;
                self.send_open();
                if self.remote_ok {
                    self.arm(TimerKind::KeepWait, self.settings.keep_wait);
                    self.set_state(SessionState::KeepWait);
                } else {
                    self.cancel(TimerKind::KeepWait);
                    self.arm(TimerKind::OpenWait, self.settings.open_wait);
                    self.set_state(SessionState::OpenWait);
                }
            }
            other => {
                // message type was checked above
                warn!(peer = %self.peer, "unexpected content in KEEP_WAIT: {:?}", other);
                self.close(CloseReason::ProtocolSequence);
            }
        }
    }

    fn on_session_up_message(&mut self, message: PcepMessage) {
        let content = match check_message_format(&message) {
            Ok(content) => content,
            Err(e) => {
                warn!(peer = %self.peer, "malformed message in SESSION_UP: {}", e);
                self.on_format_error();
                return;
            }
        };
        self.restart_dead_timer();

        match content {
            MessageContent::Keepalive => trace!(peer = %self.peer, "keepalive received"),
            MessageContent::Open(_) => {
                warn!(peer = %self.peer, "OPEN received in SESSION_UP, ignored");
            }
            MessageContent::Close(close) => {
                info!(peer = %self.peer, reason = close.reason, "peer closed the session");
                self.close(CloseReason::PeerClosed);
            }
            MessageContent::Error { .. } => self.route_from_network(message, MessageType::Error),
            MessageContent::Data(message_type) => self.route_from_network(message, message_type),
        }
    }

    fn on_local_message(&mut self, message: PcepMessage) {
        if self.state == SessionState::SessionUp {
            self.route_from_local(message);
        } else if self.role == Role::Client {
            trace!(peer = %self.peer, state = %self.state, "queueing local message until up");
            self.outbound.push_back(message);
        } else {
            warn!(
                peer = %self.peer,
                state = %self.state,
                "session not up, dropping local {:?}",
                message
            );
        }
    }

    /// A server takes REQUEST from the network, a client takes RESPONSE.
    fn route_from_network(&mut self, message: PcepMessage, message_type: MessageType) {
        match (self.role, message_type) {
            (Role::Server, MessageType::Request)
            | (Role::Client, MessageType::Response)
            | (_, MessageType::Notification)
            | (_, MessageType::Error) => self.actions.push(Action::Deliver(message)),
            (role, message_type) => {
                warn!(peer = %self.peer, ?role, "dropping {} from the network", message_type);
            }
        }
    }

    /// A client sends REQUEST to the network, a server sends RESPONSE.
    fn route_from_local(&mut self, message: PcepMessage) {
        match (self.role, message.message_type()) {
            (Role::Client, Ok(MessageType::Request))
            | (Role::Server, Ok(MessageType::Response))
            | (_, Ok(MessageType::Notification))
            | (_, Ok(MessageType::Error)) => self.send(message),
            (role, message_type) => {
                warn!(peer = %self.peer, ?role, "dropping local {:?}", message_type);
            }
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        debug!(peer = %self.peer, state = %self.state, ?kind, "timer expired");
        match kind {
            TimerKind::Connect => {
                if self.state == SessionState::TcpPending {
                    self.on_connect_failed();
                }
            }
            TimerKind::OpenWait => {
                info!(peer = %self.peer, "no OPEN received in time");
                self.send_error(EstablishmentError::OpenWaitExpired);
                self.close(CloseReason::OpenWaitExpired);
            }
            TimerKind::KeepWait => {
                info!(peer = %self.peer, "no KEEPALIVE received in time");
                self.send_error(EstablishmentError::KeepWaitExpired);
                self.close(CloseReason::KeepWaitExpired);
            }
            TimerKind::DeadTimer => {
                info!(peer = %self.peer, "dead timer expired");
                self.send(close_message(CloseCause::DeadTimerExpired));
                self.close(CloseReason::DeadTimerExpired);
            }
            TimerKind::KeepAlive => {
                self.send(keepalive_message());
                self.arm(TimerKind::KeepAlive, secs(self.keepalive));
            }
        }
    }

    /// Malformed input: answer with ERROR(1,1) while negotiating, CLOSE once up.
    fn on_format_error(&mut self) {
        match self.state {
            SessionState::OpenWait | SessionState::KeepWait => {
                self.send_error(EstablishmentError::InvalidOpen);
            }
            SessionState::SessionUp => self.send(close_message(CloseCause::MalformedMessage)),
            SessionState::Idle | SessionState::TcpPending => {}
        }
        self.close(CloseReason::FramingError);
    }

    fn enter_session_up(&mut self) {
        self.set_state(SessionState::SessionUp);
        if !self.keepalive_started {
            self.keepalive_started = true;
            if self.keepalive > 0 {
                self.arm(TimerKind::KeepAlive, secs(self.keepalive));
            }
        }
        self.restart_dead_timer();
        info!(
            peer = %self.peer,
            role = ?self.role,
            keepalive = self.keepalive,
            dead_timer = self.peer_dead_timer,
            "session established"
        );
        self.actions.push(Action::Established);

        if !self.outbound.is_empty() {
            debug!(peer = %self.peer, queued = self.outbound.len(), "flushing queued messages");
        }
        while let Some(message) = self.outbound.pop_front() {
            self.route_from_local(message);
        }
    }

    fn restart_dead_timer(&mut self) {
        if self.peer_dead_timer > 0 {
            self.arm(TimerKind::DeadTimer, secs(self.peer_dead_timer));
        }
    }

    fn close(&mut self, reason: CloseReason) {
        self.release_resources();
        if !self.outbound.is_empty() {
            warn!(
                peer = %self.peer,
                dropped = self.outbound.len(),
                "session closed with queued messages"
            );
            self.outbound.clear();
        }
        self.closed = true;
        info!(peer = %self.peer, %reason, "session closed");
        self.actions.push(Action::Close(reason));
    }

    fn release_resources(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
        self.local_ok = false;
        self.remote_ok = false;
        self.set_state(SessionState::Idle);
    }

    fn send_open(&mut self) {
        self.send(open_message(OpenObject::new(
            self.keepalive,
            self.dead_timer,
            self.session_id,
        )));
    }

    fn send_error(&mut self, error: EstablishmentError) {
        self.send(error_message(ErrorObject::establishment(error), None));
    }

    fn send(&mut self, message: PcepMessage) {
        self.actions.push(Action::Send(message));
    }

    /// Arms `kind`, cancelling the previous instance first.
    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        let token = self.tokens.next_token();
        self.timers[kind.index()] = Some(token);
        self.actions.push(Action::ArmTimer { kind, token, after });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(token) = self.timers[kind.index()].take() {
            self.actions.push(Action::CancelTimer { kind, token });
        }
    }

    fn set_state(&mut self, target: SessionState) {
        debug_assert!(
            SessionState::can_transition_to(self.state, target),
            "{} -> {}",
            self.state,
            target
        );
        if self.state != target {
            debug!(peer = %self.peer, from = %self.state, to = %target, "state transition");
            self.state = target;
        }
    }

    fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }
}

fn secs(value: u8) -> Duration {
    Duration::from_secs(value as u64)
}
