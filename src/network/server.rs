//! Heartwire Server
//!
//! Accepts client connections and keeps every admitted client informed that
//! the server is alive. One loop owns the connection table: it drains the
//! accept backlog, fires heartbeats and applies close events from the
//! per-connection readers.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use super::connection::{ConnectionEvent, ConnectionId, ConnectionTable, Transport};
use super::heartbeat::Heartbeat;
use crate::config::{ProtocolConfig, ServerConfig};
use crate::protocol::CodecError;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Bind to {addr} failed: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Heartbeat packet error: {0}")]
    Codec(#[from] CodecError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Source of new connections
pub trait Acceptor {
    type Transport: Transport;

    /// Accept one pending connection without blocking.
    /// `WouldBlock` means the backlog is empty.
    fn try_accept(&mut self, id: ConnectionId) -> io::Result<(Self::Transport, SocketAddr)>;
}

/// Admit every pending connection; stops at the first `WouldBlock`.
/// Any other accept error is fatal.
pub fn drain_backlog<A: Acceptor>(
    acceptor: &mut A,
    table: &mut ConnectionTable<A::Transport>,
) -> ServerResult<usize> {
    let mut admitted = 0;

    loop {
        let id = table.next_id();
        match acceptor.try_accept(id) {
            Ok((transport, addr)) => {
                table.insert(id, addr, transport);
                admitted += 1;
                tracing::info!(
                    "Accepted connection {} from {} ({} open)",
                    id,
                    addr,
                    table.len()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(admitted),
            Err(e) => return Err(ServerError::Accept(e)),
        }
    }
}

/// Write half of an accepted TCP connection plus its reader task.
/// Dropping it stops the reader, which releases the socket.
#[derive(Debug)]
pub struct TcpTransport {
    writer: OwnedWriteHalf,
    reader: AbortHandle,
}

impl Transport for TcpTransport {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writer.try_write(buf)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Accepts TCP connections and spawns a reader per connection that reports
/// data and closure back to the server loop
pub struct TcpAcceptor {
    listener: TcpListener,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pending: Option<(TcpStream, SocketAddr)>,
    read_buffer_size: usize,
}

impl TcpAcceptor {
    pub fn new(
        listener: TcpListener,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            listener,
            events,
            pending: None,
            read_buffer_size,
        }
    }

    /// Resolves once the listener has at least one connection waiting.
    /// Cancel safe.
    pub async fn readable(&mut self) -> io::Result<()> {
        if self.pending.is_none() {
            self.pending = Some(self.listener.accept().await?);
        }
        Ok(())
    }
}

impl Acceptor for TcpAcceptor {
    type Transport = TcpTransport;

    fn try_accept(&mut self, id: ConnectionId) -> io::Result<(TcpTransport, SocketAddr)> {
        let (stream, addr) = match self.pending.take() {
            Some(connection) => connection,
            None => {
                let mut cx = Context::from_waker(futures::task::noop_waker_ref());
                match self.listener.poll_accept(&mut cx) {
                    Poll::Ready(result) => result?,
                    Poll::Pending => return Err(io::ErrorKind::WouldBlock.into()),
                }
            }
        };

        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_until_closed(
            reader,
            id,
            addr,
            self.events.clone(),
            self.read_buffer_size,
        ))
        .abort_handle();

        Ok((TcpTransport { writer, reader }, addr))
    }
}

/// Report inbound chunks, then the close, of one connection
async fn read_until_closed(
    mut reader: OwnedReadHalf,
    id: ConnectionId,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "closed by peer".to_string(),
            Ok(len) => {
                if events.send(ConnectionEvent::Data { id, addr, len }).is_err() {
                    // server loop is gone
                    return;
                }
            }
            Err(e) => break format!("read error: {}", e),
        }
    };

    let _ = events.send(ConnectionEvent::Closed { id, addr, reason });
}

/// Heartwire Server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    heartbeat: Heartbeat,
    read_buffer_size: usize,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(config: &ServerConfig, protocol: &ProtocolConfig) -> ServerResult<Self> {
        let heartbeat = Heartbeat::new(
            protocol.protocol_id,
            protocol.heartbeat_type,
            config.heartbeat_interval(),
        )?;

        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: bind_addr.clone(),
                source,
            })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            listener,
            local_addr,
            heartbeat,
            read_buffer_size: config.read_buffer_size,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sending on the returned channel stops [`Server::run`]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until shutdown; returns early only on a fatal accept error
    pub async fn run(self) -> ServerResult<()> {
        let Server {
            listener,
            heartbeat,
            read_buffer_size,
            mut shutdown_rx,
            ..
        } = self;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut acceptor = TcpAcceptor::new(listener, event_tx, read_buffer_size);
        let mut table = ConnectionTable::new();

        let mut ticker = tokio::time::interval(heartbeat.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                ready = acceptor.readable() => {
                    if let Err(e) = ready {
                        break Err(ServerError::Accept(e));
                    }
                    if let Err(e) = drain_backlog(&mut acceptor, &mut table) {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    let writes = heartbeat.beat(&mut table);
                    if writes > 0 {
                        tracing::debug!("heartbeat written to {} connections", writes);
                    }
                }
                Some(event) = event_rx.recv() => {
                    table.apply(event);
                }
                _ = shutdown_rx.recv() => {
                    break Ok(());
                }
            }
        };

        tracing::info!("Shutting down");
        table.clear();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::tests::{addr, MockTransport};
    use crate::protocol::HEADER_SIZE;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct MockAcceptor {
        queue: VecDeque<io::Result<(MockTransport, SocketAddr)>>,
        calls: usize,
    }

    impl MockAcceptor {
        fn new(queue: Vec<io::Result<(MockTransport, SocketAddr)>>) -> Self {
            Self {
                queue: queue.into(),
                calls: 0,
            }
        }
    }

    impl Acceptor for MockAcceptor {
        type Transport = MockTransport;

        fn try_accept(&mut self, _id: ConnectionId) -> io::Result<(MockTransport, SocketAddr)> {
            self.calls += 1;
            self.queue
                .pop_front()
                .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
        }
    }

    #[test]
    fn test_drains_whole_backlog() {
        let mut acceptor = MockAcceptor::new(
            (1..=4)
                .map(|port| Ok((MockTransport::default(), addr(port))))
                .collect(),
        );
        let mut table = ConnectionTable::new();

        assert_eq!(drain_backlog(&mut acceptor, &mut table).unwrap(), 4);
        assert_eq!(table.len(), 4);
        // four admissions plus the would-block that ends the drain
        assert_eq!(acceptor.calls, 5);
    }

    #[test]
    fn test_empty_backlog_is_not_an_error() {
        let mut acceptor = MockAcceptor::new(Vec::new());
        let mut table = ConnectionTable::new();

        assert_eq!(drain_backlog(&mut acceptor, &mut table).unwrap(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_fatal_accept_error_propagates() {
        let mut acceptor = MockAcceptor::new(vec![
            Ok((MockTransport::default(), addr(1))),
            Err(io::ErrorKind::PermissionDenied.into()),
            Ok((MockTransport::default(), addr(2))),
        ]);
        let mut table = ConnectionTable::new();

        let err = drain_backlog(&mut acceptor, &mut table).unwrap_err();
        assert!(matches!(err, ServerError::Accept(ref e) if e.kind() == io::ErrorKind::PermissionDenied));
        assert!(table.contains(&addr(1)));
        assert!(!table.contains(&addr(2)));
    }

    fn test_configs() -> (ServerConfig, ProtocolConfig) {
        let server = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            heartbeat_interval_ms: 50,
            ..Default::default()
        };
        (server, ProtocolConfig::default())
    }

    #[tokio::test]
    async fn test_clients_receive_heartbeats() {
        let (server_config, protocol) = test_configs();
        let server = Server::bind(&server_config, &protocol).await.unwrap();
        let local_addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());

        let mut first = TcpStream::connect(local_addr).await.unwrap();
        let mut second = TcpStream::connect(local_addr).await.unwrap();

        for stream in [&mut first, &mut second] {
            read_heartbeat(stream).await;
        }

        shutdown.send(()).await.unwrap();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn read_heartbeat(stream: &mut TcpStream) {
        let mut buf = [0u8; HEADER_SIZE];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, [0xE8, 0x03, 0, 0, 0xD0, 0x07, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_reader_reports_peer_close() {
        let (mut client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let id = ConnectionTable::<MockTransport>::new().next_id();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (reader, _writer) = server.into_split();
        let task = tokio::spawn(read_until_closed(reader, id, peer, event_tx, 64));

        client.write_all(b"ping").await.unwrap();
        drop(client);

        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        task.await.unwrap();

        assert!(matches!(events[0], ConnectionEvent::Data { id: got, .. } if got == id));
        match events.last() {
            Some(ConnectionEvent::Closed { id: got, addr, reason }) => {
                assert_eq!(*got, id);
                assert_eq!(*addr, peer);
                assert_eq!(reason, "closed by peer");
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_transport_stops_reader() {
        let (mut client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let id = ConnectionTable::<MockTransport>::new().next_id();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (reader, writer) = server.into_split();
        let task = tokio::spawn(read_until_closed(reader, id, peer, event_tx, 64));

        let transport = TcpTransport {
            writer,
            reader: task.abort_handle(),
        };
        drop(transport);

        assert!(task.await.unwrap_err().is_cancelled());
        // both halves are gone, so the peer sees the socket close
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeats_continue_after_peer_closes() {
        let (server_config, protocol) = test_configs();
        let server = Server::bind(&server_config, &protocol).await.unwrap();
        let local_addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(local_addr).await.unwrap());
        }
        for client in clients.iter_mut() {
            read_heartbeat(client).await;
        }

        drop(clients.remove(1));

        for _ in 0..3 {
            for client in clients.iter_mut() {
                read_heartbeat(client).await;
            }
        }

        shutdown.send(()).await.unwrap();
        tokio_test::assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server_config, protocol) = test_configs();
        let server = Server::bind(&server_config, &protocol).await.unwrap();
        let local_addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());

        let mut clients = Vec::new();
        for _ in 0..2 {
            let mut client = TcpStream::connect(local_addr).await.unwrap();
            read_heartbeat(&mut client).await;
            clients.push(client);
        }

        shutdown.send(()).await.unwrap();
        tokio_test::assert_ok!(handle.await.unwrap());

        for client in clients.iter_mut() {
            let mut rest = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(rest.len() % HEADER_SIZE, 0);
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (server_config, protocol) = test_configs();
        let taken = Server::bind(&server_config, &protocol).await.unwrap();

        let clash = ServerConfig {
            port: taken.local_addr().port(),
            ..server_config
        };
        assert!(matches!(
            Server::bind(&clash, &protocol).await,
            Err(ServerError::BindFailed { .. })
        ));
    }
}
