use std::io::{self, ErrorKind};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::PeerAddress;

/// Why a connection stopped delivering bytes.
#[derive(Debug)]
pub enum ConnectionLoss {
    /// the peer closed its side
    EndOfStream,
    /// the socket kept signalling readable without yielding any data
    Anomalous,
    /// a read or write failed
    Failed(io::Error),
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    Data(Bytes),
    Lost(ConnectionLoss),
}

/// Sent by the reader and writer tasks to the dispatcher.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub peer: PeerAddress,
    pub connection_id: u64,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadSettings {
    pub read_buffer_size: usize,
    pub max_empty_reads: u32,
}

/// Represents one registered peer socket.
///
/// The socket is split in two: a reader task that only moves bytes to the dispatcher, and
/// a writer task that drains an unbounded queue of encoded messages. Dropping the
/// `Connection` stops the reader and lets the writer flush what is queued, then shut
/// the socket down.
#[derive(Debug)]
pub struct Connection {
    pub connection_id: u64,
    pub peer: PeerAddress,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn spawn(
        connection_id: u64,
        peer: PeerAddress,
        socket: TcpStream,
        settings: ReadSettings,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Connection {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, "failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = socket.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            connection_id,
            peer,
            read_half,
            settings,
            events.clone(),
        ));
        tokio::spawn(write_loop(
            connection_id,
            peer,
            BufWriter::new(write_half),
            writer_rx,
            events,
        ));

        Connection {
            connection_id,
            peer,
            writer_tx,
            reader,
        }
    }

    /// Queues encoded bytes for the writer. Returns false once the writer is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        self.writer_tx.send(bytes).is_ok()
    }

    /// Stops reading, writes already queued are still flushed.
    pub fn stop_reading(&self) {
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        debug!(peer = %self.peer, connection_id = self.connection_id, "connection dropped");
    }
}

/// Counts readable wake-ups that yield no data.
///
/// The `WouldBlock` that ends a drain after data was read is how readiness gets cleared,
/// so only wake-ups after it count.
#[derive(Debug)]
struct EmptyReads {
    limit: u32,
    count: u32,
    drained: bool,
}

impl EmptyReads {
    fn new(limit: u32) -> Self {
        EmptyReads {
            limit: limit.max(1),
            count: 0,
            drained: true,
        }
    }

    fn data_read(&mut self) {
        self.count = 0;
        self.drained = false;
    }

    /// Returns true once the limit of consecutive empty wake-ups is reached.
    fn would_block(&mut self) -> bool {
        if !self.drained {
            self.drained = true;
            return false;
        }
        self.count += 1;
        self.count >= self.limit
    }
}

async fn read_loop(
    connection_id: u64,
    peer: PeerAddress,
    reader: OwnedReadHalf,
    settings: ReadSettings,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let mut buffer = BytesMut::with_capacity(settings.read_buffer_size);
    let mut empty_reads = EmptyReads::new(settings.max_empty_reads);

    let loss = loop {
        if let Err(e) = reader.readable().await {
            break ConnectionLoss::Failed(e);
        }
        buffer.reserve(settings.read_buffer_size);
        match reader.try_read_buf(&mut buffer) {
            Ok(0) => break ConnectionLoss::EndOfStream,
            Ok(n) => {
                trace!(%peer, "read {} bytes", n);
                empty_reads.data_read();
                let event = ConnectionEvent {
                    peer,
                    connection_id,
                    kind: ConnectionEventKind::Data(buffer.split().freeze()),
                };
                if events.send(event).await.is_err() {
                    // dispatcher is gone
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if empty_reads.would_block() {
                    break ConnectionLoss::Anomalous;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => break ConnectionLoss::Failed(e),
        }
    };

    debug!(%peer, connection_id, "reader stopped: {:?}", loss);
    let _ = events
        .send(ConnectionEvent {
            peer,
            connection_id,
            kind: ConnectionEventKind::Lost(loss),
        })
        .await;
}

async fn write_loop(
    connection_id: u64,
    peer: PeerAddress,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = write_batch(&mut writer, bytes, &mut queue).await {
            warn!(%peer, connection_id, "write failed: {}", e);
            let _ = events
                .send(ConnectionEvent {
                    peer,
                    connection_id,
                    kind: ConnectionEventKind::Lost(ConnectionLoss::Failed(e)),
                })
                .await;
            return;
        }
    }
    // the connection was dropped, everything queued has been written
    if let Err(e) = writer.shutdown().await {
        trace!(%peer, connection_id, "shutdown after close: {}", e);
    }
    debug!(%peer, connection_id, "writer stopped");
}

/// Writes `first` and whatever else is already queued, then flushes once.
async fn write_batch(
    writer: &mut BufWriter<OwnedWriteHalf>,
    first: Bytes,
    queue: &mut mpsc::UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    writer.write_all(&first).await?;
    while let Ok(bytes) = queue.try_recv() {
        writer.write_all(&bytes).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    const SETTINGS: ReadSettings = ReadSettings {
        read_buffer_size: 2000,
        max_empty_reads: 2,
    };

    #[tokio::test]
    async fn reader_forwards_bytes_then_end_of_stream() {
        let (mut client, server) = pair().await;
        let peer = client.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let _connection = Connection::spawn(7, peer, server, SETTINGS, events_tx);

        client.write_all(b"hello").await.unwrap();
        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.connection_id, 7);
        match event.kind {
            ConnectionEventKind::Data(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(client);
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.kind,
            ConnectionEventKind::Lost(ConnectionLoss::EndOfStream)
        ));
    }

    #[test]
    fn would_block_ending_a_drain_is_not_an_empty_read() {
        let mut empty_reads = EmptyReads::new(2);
        for _ in 0..10 {
            empty_reads.data_read();
            assert!(!empty_reads.would_block());
        }
        // one stale wake-up after a drain is tolerated
        empty_reads.data_read();
        assert!(!empty_reads.would_block());
        assert!(!empty_reads.would_block());
        empty_reads.data_read();
        assert!(!empty_reads.would_block());
        assert!(!empty_reads.would_block());
        assert!(empty_reads.would_block());
    }

    #[test]
    fn repeated_empty_wake_ups_are_anomalous() {
        let mut empty_reads = EmptyReads::new(3);
        assert!(!empty_reads.would_block());
        assert!(!empty_reads.would_block());
        assert!(empty_reads.would_block());

        let mut empty_reads = EmptyReads::new(0);
        assert!(empty_reads.would_block());
    }

    #[tokio::test]
    async fn dropping_connection_flushes_queued_writes() {
        let (mut client, server) = pair().await;
        let peer = client.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let connection = Connection::spawn(1, peer, server, SETTINGS, events_tx);

        assert!(connection.send(Bytes::from_static(b"first ")));
        assert!(connection.send(Bytes::from_static(b"second")));
        drop(connection);

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], b"first second");
    }
}
