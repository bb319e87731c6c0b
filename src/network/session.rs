//! Client session state machine
//!
//! Driven once per tick with the elapsed time since the previous tick.
//! Handles reconnect with linear backoff and detects a silent server by
//! accumulating time without inbound data.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::config::{ClientConfig, LostPolicy};

/// Opens transports to the server
#[async_trait]
pub trait Connector: Send {
    type Link: Link;

    async fn connect(&mut self) -> io::Result<Self::Link>;

    /// Human readable destination, used in logs
    fn target(&self) -> &str;
}

/// Read side of an established transport
pub trait Link: Send {
    /// Non-blocking read; `WouldBlock` when nothing is buffered
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Still inside the retry delay
    Waiting,
    /// A connection attempt succeeded
    Connected,
    /// A connection attempt failed; the next one comes after `delay`
    RetryScheduled { delay: Duration },
    /// Bytes read from the server
    Received(Bytes),
    /// Nothing read; `since` is the time without inbound data
    Silent { since: Duration },
    /// The server went quiet for the full liveness timeout
    Lost,
    /// Lost earlier and the policy forbids reconnecting
    Halted,
}

/// Timing and policy knobs of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub liveness_timeout: Duration,
    /// Upper bound of the retry delay, in seconds
    pub max_retry_delay: u32,
    pub on_lost: LostPolicy,
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            liveness_timeout: config.liveness_timeout(),
            max_retry_delay: config.max_retry_delay_secs,
            on_lost: config.on_lost,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// Delay in seconds after another failed attempt: 1, 2, ... up to `cap`
pub fn next_retry_delay(current: u32, cap: u32) -> u32 {
    current.saturating_add(1).min(cap.max(1))
}

/// One client's connection lifecycle
pub struct Session<C: Connector> {
    connector: C,
    link: Option<C::Link>,
    config: SessionConfig,
    status: SessionStatus,
    retry_elapsed: Duration,
    /// Seconds to wait before the next attempt
    retry_next: u32,
    data_last_received: Duration,
    buf: Vec<u8>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        let buf = vec![0u8; config.read_buffer_size.max(1)];
        Self {
            connector,
            link: None,
            config,
            status: SessionStatus::Disconnected,
            retry_elapsed: Duration::ZERO,
            retry_next: 0,
            data_last_received: Duration::ZERO,
            buf,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// Current retry delay in seconds
    pub fn retry_next(&self) -> u32 {
        self.retry_next
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.retry_next))
    }

    /// Time since the server last sent anything
    pub fn data_last_received(&self) -> Duration {
        self.data_last_received
    }

    pub fn target(&self) -> &str {
        self.connector.target()
    }

    /// Drop any transport and start over from Disconnected
    pub fn restart(&mut self) {
        self.link = None;
        self.status = SessionStatus::Disconnected;
        self.retry_elapsed = Duration::ZERO;
        self.retry_next = 0;
        self.data_last_received = Duration::ZERO;
    }

    /// Advance the session by `dt`
    pub async fn tick(&mut self, dt: Duration) -> Tick {
        match self.status {
            SessionStatus::Disconnected => {
                self.status = SessionStatus::Connecting;
                self.attempt().await
            }
            SessionStatus::Connecting => {
                self.retry_elapsed += dt;
                if self.retry_elapsed < self.retry_delay() {
                    return Tick::Waiting;
                }
                self.attempt().await
            }
            SessionStatus::Connected => self.poll(dt),
            SessionStatus::Lost => match self.config.on_lost {
                LostPolicy::Halt => Tick::Halted,
                LostPolicy::Reconnect => {
                    tracing::info!("reconnecting to {} after lost connection", self.target());
                    self.restart();
                    self.status = SessionStatus::Connecting;
                    self.attempt().await
                }
            },
        }
    }

    async fn attempt(&mut self) -> Tick {
        tracing::debug!("attempting to connect to server at {}", self.connector.target());

        match self.connector.connect().await {
            Ok(link) => {
                tracing::info!("connection established with {}", self.connector.target());
                self.link = Some(link);
                self.retry_elapsed = Duration::ZERO;
                self.retry_next = 0;
                self.data_last_received = Duration::ZERO;
                self.status = SessionStatus::Connected;
                Tick::Connected
            }
            Err(e) => {
                self.retry_elapsed = Duration::ZERO;
                self.retry_next = next_retry_delay(self.retry_next, self.config.max_retry_delay);
                tracing::error!(
                    "Unable to connect to server {}: {}, will retry in {} seconds",
                    self.connector.target(),
                    e,
                    self.retry_next
                );
                Tick::RetryScheduled {
                    delay: self.retry_delay(),
                }
            }
        }
    }

    fn poll(&mut self, dt: Duration) -> Tick {
        let mut received = BytesMut::new();

        if let Some(link) = self.link.as_mut() {
            // drain everything the transport has buffered
            loop {
                match link.try_read(&mut self.buf) {
                    Ok(0) => {
                        tracing::warn!("server {} closed the connection", self.connector.target());
                        self.link = None;
                        break;
                    }
                    Ok(n) => received.extend_from_slice(&self.buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!("read from {} failed: {}", self.connector.target(), e);
                        self.link = None;
                        break;
                    }
                }
            }
        }

        if !received.is_empty() {
            self.data_last_received = Duration::ZERO;
            return Tick::Received(received.freeze());
        }

        self.data_last_received += dt;

        if self.data_last_received >= self.config.liveness_timeout {
            tracing::error!("connection to server lost");
            self.link = None;
            self.status = SessionStatus::Lost;
            return Tick::Lost;
        }

        Tick::Silent {
            since: self.data_last_received,
        }
    }
}
