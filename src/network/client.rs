//! Heartwire Client
//!
//! Drives a [`Session`] from a fixed-rate tick, turns inbound bytes into
//! packets and reports everything to the application as [`ClientEvent`]s.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};

use super::session::{Connector, Link, Session, SessionConfig, Tick};
use crate::config::{ClientConfig, ProtocolConfig};
use crate::protocol::{heartbeat_kind, CodecError, FrameDecoder, Packet, PacketSet, SchemaError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Session established
    Connected { server: String },
    /// A connection attempt failed
    RetryScheduled { delay: Duration },
    /// The server's liveness packet arrived
    Heartbeat,
    /// Any other packet of the registered set
    Packet(Packet),
    /// The server stayed silent for the whole liveness timeout
    ConnectionLost,
    /// Inbound data that could not be decoded
    Error { message: String },
}

/// Connects over TCP with a per-attempt timeout
pub struct TcpConnector {
    target: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(target: String, timeout: Duration) -> Self {
        Self { target, timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Link = TcpStream;

    async fn connect(&mut self) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection timeout")),
        }
    }

    fn target(&self) -> &str {
        &self.target
    }
}

impl Link for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }
}

/// Heartwire Client
pub struct Client<C: Connector = TcpConnector> {
    session: Session<C>,
    packets: PacketSet,
    heartbeat_type: i32,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    tick_interval: Duration,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Client<TcpConnector> {
    /// Create a TCP client for the configured server
    pub fn new(
        config: &ClientConfig,
        protocol: &ProtocolConfig,
        packets: PacketSet,
    ) -> ClientResult<Self> {
        let connector = TcpConnector::new(config.server_addr(), config.connect_timeout());
        Self::with_connector(connector, config, protocol, packets)
    }
}

impl<C: Connector> Client<C> {
    /// Create a client over any connector. The heartbeat kind is added to
    /// `packets` unless the set already has its type id.
    pub fn with_connector(
        connector: C,
        config: &ClientConfig,
        protocol: &ProtocolConfig,
        mut packets: PacketSet,
    ) -> ClientResult<Self> {
        if packets.get(protocol.heartbeat_type).is_none() {
            packets.register(heartbeat_kind(protocol.protocol_id, protocol.heartbeat_type)?)?;
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            session: Session::new(connector, SessionConfig::from(config)),
            decoder: FrameDecoder::new(packets.protocol(), protocol.max_payload_size),
            packets,
            heartbeat_type: protocol.heartbeat_type,
            read_buf: BytesMut::with_capacity(4096),
            tick_interval: config.tick_interval(),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Sending on the returned channel stops [`Client::run`]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Tick the session until shutdown, or until a lost session halts
    pub async fn run(mut self) -> ClientResult<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        tracing::info!("Connecting to {}", self.session.target());

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    let dt = now.saturating_duration_since(last);
                    last = now;

                    // a connect attempt can take up to the connect timeout
                    let tick = tokio::select! {
                        tick = self.session.tick(dt) => tick,
                        _ = self.shutdown_rx.recv() => {
                            tracing::info!("client shutting down");
                            break;
                        }
                    };
                    if tick == Tick::Halted {
                        tracing::info!("session halted after lost connection");
                        break;
                    }
                    self.handle_tick(tick);
                }
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("client shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Connected => {
                self.read_buf.clear();
                self.decoder.reset();
                self.emit(ClientEvent::Connected {
                    server: self.session.target().to_string(),
                });
            }
            Tick::RetryScheduled { delay } => {
                self.emit(ClientEvent::RetryScheduled { delay });
            }
            Tick::Received(bytes) => self.handle_bytes(bytes),
            Tick::Silent { since } => {
                tracing::trace!("no data for {:?}", since);
            }
            Tick::Lost => self.emit(ClientEvent::ConnectionLost),
            Tick::Waiting | Tick::Halted => {}
        }
    }

    fn handle_bytes(&mut self, bytes: Bytes) {
        tracing::debug!("received {} bytes from server", bytes.len());
        self.read_buf.extend_from_slice(&bytes);

        loop {
            let frame = match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    // framing is lost, nothing after this point can be trusted
                    tracing::warn!("discarding inbound stream: {}", e);
                    self.read_buf.clear();
                    self.decoder.reset();
                    self.emit(ClientEvent::Error {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            match self.packets.decode(&frame) {
                Ok(_) if frame.header.type_id == self.heartbeat_type => {
                    tracing::debug!("heartbeat from server");
                    self.emit(ClientEvent::Heartbeat);
                }
                Ok(packet) => self.emit(ClientEvent::Packet(packet)),
                Err(e @ CodecError::UnknownType(_)) => {
                    tracing::warn!("ignoring packet: {}", e);
                }
                Err(e) => {
                    tracing::warn!("undecodable packet: {}", e);
                    self.emit(ClientEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Never blocks the tick loop; drops the event if the queue is full
    fn emit(&self, event: ClientEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("event queue full, dropping {:?}", event);
            }
        }
    }
}
