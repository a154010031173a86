use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::network::{Dispatcher, DispatcherHandle, DispatcherSettings, ReadSettings};
use crate::protocol::{MessageType, PcepMessage};
use crate::session::{
    EventSink, Role, SessionEvent, SessionHandler, SessionListener, SessionRegistry,
    SessionRouter, SessionSnapshot, TimerHandle, TimerService,
};
use crate::utils::MultipleChannelWorkerPool;
use crate::{AppError, AppResult, PeerAddress};

use super::PceeConfig;

/// Entry point for collaborators.
///
/// Owns nothing but handles: the dispatcher, the timer service and the session workers run
/// as tasks and stop when `notify_shutdown` fires. Every operation only enqueues an event
/// for the peer's worker, its effect is observed through the [`SessionListener`].
#[derive(Debug, Clone)]
pub struct SessionEngine {
    role: Role,
    local_addr: Option<SocketAddr>,
    registry: SessionRegistry,
    router: SessionRouter,
}

impl SessionEngine {
    pub async fn start(
        config: &PceeConfig,
        role: Role,
        listener: Arc<dyn SessionListener>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<SessionEngine> {
        let tcp_listener = match role {
            Role::Server => {
                let listen_address = config.network.listen_address();
                let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
                    let error_msg =
                        format!("failed to bind listener to {}: {}", listen_address, e);
                    error!("{}", error_msg);
                    AppError::DetailedIoError(error_msg)
                })?;
                Some(listener)
            }
            Role::Client => None,
        };
        let local_addr = tcp_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let registry = SessionRegistry::new();
        let (dispatcher_handle, commands) = DispatcherHandle::channel();
        let (timer_handle, timer_ops) = TimerHandle::channel();

        let handler = SessionHandler::new(
            role,
            registry.clone(),
            Arc::new(config.session.settings()),
            dispatcher_handle,
            timer_handle,
            listener,
        );
        let pool = MultipleChannelWorkerPool::new(
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            handler,
            config.session_worker_pool.pool_config(),
        );
        let router = SessionRouter::new(Arc::new(pool));

        TimerService::start(timer_ops, router.clone(), notify_shutdown.clone());

        let settings = DispatcherSettings {
            max_connection: config.network.max_connection,
            max_package_size: config.network.max_package_size,
            read: ReadSettings {
                read_buffer_size: config.network.read_buffer_size,
                max_empty_reads: config.network.max_empty_reads,
            },
        };
        Dispatcher::new(
            tcp_listener,
            settings,
            router.clone(),
            notify_shutdown,
            shutdown_complete_tx,
        )
        .spawn(commands);

        info!(?role, ?local_addr, "session engine started");
        Ok(SessionEngine {
            role,
            local_addr,
            registry,
            router,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Bound listener address, `None` for a client.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Opens a session to `peer`. Only a client initiates sessions.
    pub async fn register_outbound_connection(&self, peer: PeerAddress) -> AppResult<()> {
        if self.role != Role::Client {
            return Err(AppError::InvalidOperation(format!(
                "a {:?} node does not initiate sessions",
                self.role
            )));
        }
        if !self.registry.reserve(peer) {
            return Err(AppError::SessionExists(peer));
        }
        let result = self.router.submit(peer, SessionEvent::ConnectRequested).await;
        if result.is_err() {
            self.registry.release_reservation(&peer);
        }
        result
    }

    /// Hands a data message to the peer's session.
    ///
    /// A client session queues it until the session is up, a server session drops it
    /// unless it is up.
    pub async fn deliver_outbound_message(
        &self,
        peer: PeerAddress,
        message_type: MessageType,
        body: Bytes,
    ) -> AppResult<()> {
        let message = PcepMessage::try_new(message_type, body)?;
        if !self.registry.contains(&peer) {
            return Err(AppError::UnknownPeer(peer));
        }
        self.router.submit(peer, SessionEvent::Local(message)).await
    }

    /// Sends CLOSE if a transport exists, then tears the session down.
    pub async fn close(&self, peer: PeerAddress) -> AppResult<()> {
        if !self.registry.contains(&peer) {
            return Err(AppError::UnknownPeer(peer));
        }
        self.router.submit(peer, SessionEvent::CloseRequested).await
    }

    pub fn session_snapshot(&self, peer: &PeerAddress) -> Option<SessionSnapshot> {
        self.registry.snapshot(peer)
    }

    pub fn sessions(&self) -> Vec<PeerAddress> {
        self.registry.peers()
    }
}
