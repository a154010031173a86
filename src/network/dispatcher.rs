use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use super::connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionLoss, ReadSettings,
};
use super::demux::Demultiplexer;
use crate::session::{EventSink, SessionEvent};
use crate::{PeerAddress, Shutdown};

const CONNECTION_EVENT_CAPACITY: usize = 1024;

/// What sessions ask of the network side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherCommand {
    Connect(PeerAddress),
    /// already encoded message bytes
    Send(PeerAddress, Bytes),
    Close(PeerAddress),
}

/// Cheap to clone, never blocks. Commands are handled in send order.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    pub fn channel() -> (DispatcherHandle, mpsc::UnboundedReceiver<DispatcherCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (DispatcherHandle { commands }, rx)
    }

    pub fn connect(&self, peer: PeerAddress) {
        self.command(DispatcherCommand::Connect(peer));
    }

    pub fn send(&self, peer: PeerAddress, bytes: Bytes) {
        self.command(DispatcherCommand::Send(peer, bytes));
    }

    pub fn close(&self, peer: PeerAddress) {
        self.command(DispatcherCommand::Close(peer));
    }

    fn command(&self, command: DispatcherCommand) {
        if let Err(e) = self.commands.send(command) {
            debug!("dispatcher stopped, dropping {:?}", e.0);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub max_connection: usize,
    pub max_package_size: usize,
    pub read: ReadSettings,
}

struct ConnectAttempt {
    id: u64,
    task: JoinHandle<()>,
}

struct ConnectResult {
    peer: PeerAddress,
    attempt: u64,
    result: io::Result<TcpStream>,
}

/// The single owner of every socket.
///
/// Accepts inbound connections, performs outbound connects, writes what sessions send and
/// turns the bytes it reads into framed messages. It never decides anything about a
/// session, it only reports what happened to the peer's worker.
pub struct Dispatcher<S: EventSink> {
    listener: Option<TcpListener>,
    settings: DispatcherSettings,
    sink: S,
    connections: HashMap<PeerAddress, Connection>,
    connecting: HashMap<PeerAddress, ConnectAttempt>,
    /// connections whose byte stream failed to frame, their reads are ignored
    halted: HashSet<u64>,
    demux: Demultiplexer,
    next_connection_id: u64,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<S: EventSink> Dispatcher<S> {
    pub fn new(
        listener: Option<TcpListener>,
        settings: DispatcherSettings,
        sink: S,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Dispatcher {
            listener,
            settings,
            sink,
            connections: HashMap::new(),
            connecting: HashMap::new(),
            halted: HashSet::new(),
            demux: Demultiplexer::new(settings.max_package_size),
            next_connection_id: 1,
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    pub fn spawn(self, commands: mpsc::UnboundedReceiver<DispatcherCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(commands))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DispatcherCommand>) {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let listener = self.listener.take();
        let (events_tx, mut events_rx) = mpsc::channel(CONNECTION_EVENT_CAPACITY);
        let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();

        if let Some(listener) = &listener {
            match listener.local_addr() {
                Ok(addr) => info!("dispatcher listening on {}", addr),
                Err(e) => warn!("listener has no local address: {}", e),
            }
        }

        loop {
            tokio::select! {
                accepted = accept(listener.as_ref()) => {
                    match accepted {
                        Ok((socket, peer)) => self.on_accept(socket, peer, &events_tx).await,
                        Err(e) => {
                            error!("accept failed: {}", e);
                            time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                Some(command) = commands.recv() => {
                    self.on_command(command, &connect_tx);
                }
                Some(event) = events_rx.recv() => {
                    self.on_connection_event(event).await;
                }
                Some(result) = connect_rx.recv() => {
                    self.on_connect_result(result, &events_tx).await;
                }
                _ = shutdown.recv() => {
                    debug!("dispatcher received shutdown signal");
                    break;
                }
            }
        }

        for (_, attempt) in self.connecting.drain() {
            attempt.task.abort();
        }
        debug!(
            connections = self.connections.len(),
            "dispatcher exiting, closing connections"
        );
    }

    async fn on_accept(
        &mut self,
        socket: TcpStream,
        peer: PeerAddress,
        events: &mpsc::Sender<ConnectionEvent>,
    ) {
        if self.connections.contains_key(&peer) || self.connecting.contains_key(&peer) {
            warn!(%peer, "peer already has a connection, rejecting");
            return;
        }
        if self.connections.len() >= self.settings.max_connection {
            warn!(
                %peer,
                limit = self.settings.max_connection,
                "connection limit reached, rejecting"
            );
            return;
        }
        let connection_id = self.next_id();
        self.register(connection_id, peer, socket, events);
        info!(%peer, connection_id, "accepted connection");
        self.submit(peer, SessionEvent::Accepted).await;
    }

    fn on_command(
        &mut self,
        command: DispatcherCommand,
        connect_results: &mpsc::UnboundedSender<ConnectResult>,
    ) {
        match command {
            DispatcherCommand::Connect(peer) => {
                if self.connections.contains_key(&peer) {
                    warn!(%peer, "already connected, ignoring connect");
                    return;
                }
                let attempt = self.next_id();
                let results = connect_results.clone();
                let task = tokio::spawn(async move {
                    let result = TcpStream::connect(peer).await;
                    let _ = results.send(ConnectResult {
                        peer,
                        attempt,
                        result,
                    });
                });
                // a new attempt replaces one still in flight
                let previous = self
                    .connecting
                    .insert(peer, ConnectAttempt { id: attempt, task });
                if let Some(previous) = previous {
                    previous.task.abort();
                }
                debug!(%peer, attempt, "connecting");
            }
            DispatcherCommand::Send(peer, bytes) => match self.connections.get(&peer) {
                Some(connection) => {
                    if !connection.send(bytes) {
                        debug!(%peer, "writer gone, message dropped");
                    }
                }
                None => trace!(%peer, "no connection, message dropped"),
            },
            DispatcherCommand::Close(peer) => {
                if let Some(attempt) = self.connecting.remove(&peer) {
                    attempt.task.abort();
                }
                if let Some(connection) = self.connections.remove(&peer) {
                    self.halted.remove(&connection.connection_id);
                    debug!(%peer, connection_id = connection.connection_id, "closing connection");
                }
                self.demux.remove(&peer);
            }
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent {
            peer,
            connection_id,
            kind,
        } = event;
        let current = self
            .connections
            .get(&peer)
            .is_some_and(|connection| connection.connection_id == connection_id);
        if !current {
            trace!(%peer, connection_id, "event of a closed connection ignored");
            return;
        }

        match kind {
            ConnectionEventKind::Data(bytes) => {
                if self.halted.contains(&connection_id) {
                    return;
                }
                match self.demux.feed(peer, &bytes) {
                    Ok(messages) => {
                        for message in messages {
                            self.submit(peer, SessionEvent::Network(message)).await;
                        }
                    }
                    Err(e) => {
                        warn!(%peer, connection_id, "framing failed: {}", e);
                        if let Some(connection) = self.connections.get(&peer) {
                            connection.stop_reading();
                        }
                        self.halted.insert(connection_id);
                        self.submit(peer, SessionEvent::FramingFailed).await;
                    }
                }
            }
            ConnectionEventKind::Lost(loss) => {
                match &loss {
                    ConnectionLoss::EndOfStream => {
                        info!(%peer, connection_id, "peer closed the connection")
                    }
                    ConnectionLoss::Anomalous => {
                        warn!(%peer, connection_id, "connection stopped yielding data")
                    }
                    ConnectionLoss::Failed(e) => {
                        warn!(%peer, connection_id, "connection failed: {}", e)
                    }
                }
                self.connections.remove(&peer);
                self.halted.remove(&connection_id);
                self.demux.remove(&peer);
                self.submit(peer, SessionEvent::ConnectionLost).await;
            }
        }
    }

    async fn on_connect_result(
        &mut self,
        result: ConnectResult,
        events: &mpsc::Sender<ConnectionEvent>,
    ) {
        let ConnectResult {
            peer,
            attempt,
            result,
        } = result;
        if self.connecting.get(&peer).map(|current| current.id) != Some(attempt) {
            trace!(%peer, attempt, "stale connect result dropped");
            return;
        }
        self.connecting.remove(&peer);

        match result {
            Ok(socket) if self.connections.len() < self.settings.max_connection => {
                self.register(attempt, peer, socket, events);
                info!(%peer, connection_id = attempt, "connected");
                self.submit(peer, SessionEvent::TransportUp).await;
            }
            Ok(_) => {
                warn!(%peer, "connection limit reached, dropping outbound connection");
                self.submit(peer, SessionEvent::TransportFailed).await;
            }
            Err(e) => {
                info!(%peer, "connect failed: {}", e);
                self.submit(peer, SessionEvent::TransportFailed).await;
            }
        }
    }

    fn register(
        &mut self,
        connection_id: u64,
        peer: PeerAddress,
        socket: TcpStream,
        events: &mpsc::Sender<ConnectionEvent>,
    ) {
        let connection = Connection::spawn(
            connection_id,
            peer,
            socket,
            self.settings.read,
            events.clone(),
        );
        self.connections.insert(peer, connection);
    }

    async fn submit(&self, peer: PeerAddress, event: SessionEvent) {
        if let Err(e) = self.sink.submit(peer, event).await {
            warn!(%peer, "failed to hand event to session worker: {}", e);
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        id
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, PeerAddress)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::protocol::{keepalive_message, MessageType};
    use crate::session::SessionTask;

    struct Running {
        handle: DispatcherHandle,
        tasks: mpsc::UnboundedReceiver<SessionTask>,
        _notify_shutdown: broadcast::Sender<()>,
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            max_connection: 8,
            max_package_size: 1024,
            read: ReadSettings {
                read_buffer_size: 64,
                max_empty_reads: 2,
            },
        }
    }

    fn start(listener: Option<TcpListener>, settings: DispatcherSettings) -> Running {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let (sink, tasks) = mpsc::unbounded_channel();
        let (handle, commands) = DispatcherHandle::channel();
        Dispatcher::new(
            listener,
            settings,
            sink,
            notify_shutdown.clone(),
            shutdown_complete_tx,
        )
        .spawn(commands);
        Running {
            handle,
            tasks,
            _notify_shutdown: notify_shutdown,
        }
    }

    async fn next_task(tasks: &mut mpsc::UnboundedReceiver<SessionTask>) -> SessionTask {
        time::timeout(Duration::from_secs(5), tasks.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("dispatcher stopped")
    }

    async fn bind() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn accepted_peer_gets_framed_messages() {
        let listener = bind().await;
        let addr = listener.local_addr().unwrap();
        let mut running = start(Some(listener), settings());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let peer = client.local_addr().unwrap();
        let task = next_task(&mut running.tasks).await;
        assert_eq!(task.peer, peer);
        assert!(matches!(task.event, SessionEvent::Accepted));

        let bytes = keepalive_message().encode();
        client.write_all(&bytes[..1]).await.unwrap();
        client.flush().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        client.write_all(&bytes[1..]).await.unwrap();

        match next_task(&mut running.tasks).await.event {
            SessionEvent::Network(message) => {
                assert_eq!(message.message_type().unwrap(), MessageType::Keepalive)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_then_close_flushes_and_shuts_down() {
        let listener = bind().await;
        let addr = listener.local_addr().unwrap();
        let mut running = start(Some(listener), settings());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let peer = client.local_addr().unwrap();
        next_task(&mut running.tasks).await;

        let bytes = keepalive_message().encode();
        running.handle.send(peer, bytes.clone());
        running.handle.close(peer);

        let mut received = Vec::new();
        time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, bytes.to_vec());
    }

    #[tokio::test]
    async fn peer_disconnect_is_reported() {
        let listener = bind().await;
        let addr = listener.local_addr().unwrap();
        let mut running = start(Some(listener), settings());

        let client = TcpStream::connect(addr).await.unwrap();
        next_task(&mut running.tasks).await;
        drop(client);

        assert!(matches!(
            next_task(&mut running.tasks).await.event,
            SessionEvent::ConnectionLost
        ));
    }

    #[tokio::test]
    async fn bad_length_stops_reading() {
        let listener = bind().await;
        let addr = listener.local_addr().unwrap();
        let mut running = start(Some(listener), settings());

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_task(&mut running.tasks).await;
        // header announcing a length shorter than itself
        client.write_all(&[0x20, 2, 0, 2]).await.unwrap();

        assert!(matches!(
            next_task(&mut running.tasks).await.event,
            SessionEvent::FramingFailed
        ));
    }

    #[tokio::test]
    async fn connection_limit_rejects_extra_peers() {
        let listener = bind().await;
        let addr = listener.local_addr().unwrap();
        let mut running = start(
            Some(listener),
            DispatcherSettings {
                max_connection: 1,
                ..settings()
            },
        );

        let _first = TcpStream::connect(addr).await.unwrap();
        next_task(&mut running.tasks).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        // the rejected socket is dropped right away
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(running.tasks.try_recv().is_err());
    }

    #[tokio::test]
    async fn outbound_connect_reports_transport_up() {
        let remote = bind().await;
        let peer = remote.local_addr().unwrap();
        let mut running = start(None, settings());

        running.handle.connect(peer);
        let (mut accepted, _) = remote.accept().await.unwrap();
        let task = next_task(&mut running.tasks).await;
        assert_eq!(task.peer, peer);
        assert!(matches!(task.event, SessionEvent::TransportUp));

        running.handle.send(peer, keepalive_message().encode());
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[1], MessageType::Keepalive.as_u8());
    }

    #[tokio::test]
    async fn refused_connect_reports_failure() {
        let peer = {
            let listener = bind().await;
            listener.local_addr().unwrap()
        };
        let mut running = start(None, settings());

        running.handle.connect(peer);
        assert!(matches!(
            next_task(&mut running.tasks).await.event,
            SessionEvent::TransportFailed
        ));
    }
}
