use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::listener::SessionListener;
use super::machine::{Action, Session, SessionEvent, SessionSnapshot};
use super::policy::SessionSettings;
use super::state::Role;
use super::timer::TimerHandle;
use crate::network::DispatcherHandle;
use crate::utils::{
    MultipleChannelWorkerPool, PoolHandler, SessionIdGenerator, TimerTokenGenerator,
};
use crate::{AppResult, PeerAddress};

/// One event on its way to the worker that owns the peer's session.
#[derive(Debug)]
pub struct SessionTask {
    pub peer: PeerAddress,
    pub event: SessionEvent,
}

/// Where the dispatcher and the timer service post session events.
pub trait EventSink: Clone + Send + Sync + 'static {
    fn submit(
        &self,
        peer: PeerAddress,
        event: SessionEvent,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

impl EventSink for mpsc::UnboundedSender<SessionTask> {
    fn submit(
        &self,
        peer: PeerAddress,
        event: SessionEvent,
    ) -> impl Future<Output = AppResult<()>> + Send {
        let result: AppResult<()> = self.send(SessionTask { peer, event }).map_err(Into::into);
        async move { result }
    }
}

/// All live sessions, keyed by peer address.
///
/// A peer registered for an outbound session is `pending` until its worker creates the
/// session, so messages submitted in between are routed behind the connect request
/// instead of being rejected.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<PeerAddress, Session>>,
    pending: Arc<DashSet<PeerAddress>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.sessions.contains_key(peer) || self.pending.contains(peer)
    }

    /// Marks `peer` as pending. Returns false if it already has a session or a reservation.
    pub fn reserve(&self, peer: PeerAddress) -> bool {
        if self.sessions.contains_key(&peer) {
            return false;
        }
        self.pending.insert(peer)
    }

    pub fn release_reservation(&self, peer: &PeerAddress) {
        self.pending.remove(peer);
    }

    pub fn snapshot(&self, peer: &PeerAddress) -> Option<SessionSnapshot> {
        self.sessions.get(peer).map(|session| session.snapshot())
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Maps each peer to one fixed worker channel, so a session's events are never handled
/// concurrently or out of order.
#[derive(Debug, Clone)]
pub struct SessionRouter {
    pool: Arc<MultipleChannelWorkerPool<SessionTask>>,
}

impl SessionRouter {
    pub fn new(pool: Arc<MultipleChannelWorkerPool<SessionTask>>) -> Self {
        SessionRouter { pool }
    }

    pub fn worker_index(&self, peer: &PeerAddress) -> usize {
        let mut hasher = DefaultHasher::new();
        peer.hash(&mut hasher);
        (hasher.finish() % self.pool.channel_count() as u64) as usize
    }
}

impl EventSink for SessionRouter {
    fn submit(
        &self,
        peer: PeerAddress,
        event: SessionEvent,
    ) -> impl Future<Output = AppResult<()>> + Send {
        let index = self.worker_index(&peer);
        let pool = self.pool.clone();
        async move { pool.send(SessionTask { peer, event }, index).await }
    }
}

/// Runs sessions on the worker pool and turns their actions into I/O.
#[derive(Clone)]
pub struct SessionHandler {
    role: Role,
    registry: SessionRegistry,
    settings: Arc<SessionSettings>,
    session_ids: Arc<SessionIdGenerator>,
    tokens: Arc<TimerTokenGenerator>,
    dispatcher: DispatcherHandle,
    timers: TimerHandle,
    listener: Arc<dyn SessionListener>,
}

impl SessionHandler {
    pub fn new(
        role: Role,
        registry: SessionRegistry,
        settings: Arc<SessionSettings>,
        dispatcher: DispatcherHandle,
        timers: TimerHandle,
        listener: Arc<dyn SessionListener>,
    ) -> Self {
        SessionHandler {
            role,
            registry,
            settings,
            session_ids: Arc::new(SessionIdGenerator::new()),
            tokens: Arc::new(TimerTokenGenerator::new()),
            dispatcher,
            timers,
            listener,
        }
    }

    fn process(&self, task: SessionTask) {
        let SessionTask { peer, event } = task;
        let actions = match event {
            SessionEvent::Accepted => self.create(peer, false),
            SessionEvent::ConnectRequested => self.create(peer, true),
            event => match self.registry.sessions.get_mut(&peer) {
                Some(mut session) => session.handle(event),
                None => {
                    trace!(%peer, "no session, discarding {:?}", event);
                    return;
                }
            },
        };
        // the map guard is released here, Close removes the entry
        self.execute(peer, actions);
    }

    fn create(&self, peer: PeerAddress, connection_initiated: bool) -> Vec<Action> {
        match self.registry.sessions.entry(peer) {
            Entry::Occupied(mut occupied) => occupied.get_mut().handle(if connection_initiated {
                SessionEvent::ConnectRequested
            } else {
                SessionEvent::Accepted
            }),
            Entry::Vacant(vacant) => {
                let mut session = Session::new(
                    peer,
                    self.role,
                    connection_initiated,
                    self.session_ids.next_id(),
                    self.settings.clone(),
                    self.tokens.clone(),
                );
                let actions = session.start();
                vacant.insert(session);
                self.registry.pending.remove(&peer);
                actions
            }
        }
    }

    fn execute(&self, peer: PeerAddress, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect => self.dispatcher.connect(peer),
                Action::Send(message) => self.dispatcher.send(peer, message.encode()),
                Action::Deliver(message) => self.listener.on_inbound_message(peer, message),
                Action::ArmTimer { kind, token, after } => {
                    self.timers.arm(peer, kind, token, after)
                }
                Action::CancelTimer { token, .. } => self.timers.cancel(token),
                Action::Established => self.listener.on_session_established(peer),
                Action::Close(reason) => {
                    self.registry.sessions.remove(&peer);
                    self.dispatcher.close(peer);
                    debug!(%peer, %reason, "session removed");
                    self.listener.on_connection_closed(peer, reason);
                }
            }
        }
    }
}

impl PoolHandler<SessionTask> for SessionHandler {
    fn handle(&self, task: SessionTask) -> impl Future<Output = ()> + Send {
        let handler = self.clone();
        async move { handler.process(task) }
    }
}
