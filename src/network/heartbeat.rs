//! Server heartbeat
//!
//! The heartbeat packet is encoded once; every beat writes the same bytes
//! to each open connection.

use std::io;
use std::time::Duration;

use bytes::Bytes;

use super::connection::{ConnectionTable, Transport};
use crate::protocol::{heartbeat_kind, CodecError};

/// Default beat period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);

/// Periodic liveness broadcast
#[derive(Debug, Clone)]
pub struct Heartbeat {
    packet: Bytes,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(protocol: i32, type_id: i32, interval: Duration) -> Result<Self, CodecError> {
        let packet = heartbeat_kind(protocol, type_id)?.encode(&[])?;

        Ok(Self { packet, interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Encoded heartbeat bytes
    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    /// Write one heartbeat to every connection; returns the number of writes
    /// attempted. Failures stay with their connection, except a partial
    /// write: the peer's framing is broken, so that connection is dropped.
    pub fn beat<T: Transport>(&self, table: &mut ConnectionTable<T>) -> usize {
        if table.is_empty() {
            return 0;
        }

        let mut writes = 0;
        let mut torn = Vec::new();
        for record in table.iter_mut() {
            record.age(self.interval);
            writes += 1;

            match record.try_send(&self.packet) {
                Ok(n) if n == self.packet.len() => {
                    tracing::debug!("heartbeat sent to {}", record.addr());
                }
                Ok(n) => {
                    tracing::warn!(
                        "partial heartbeat to {}: {} of {} bytes, dropping connection",
                        record.addr(),
                        n,
                        self.packet.len()
                    );
                    torn.push((record.addr(), record.id()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::debug!("heartbeat to {} skipped, socket busy", record.addr());
                }
                Err(e) => {
                    tracing::warn!("heartbeat to {} failed: {}", record.addr(), e);
                }
            }
        }

        for (addr, id) in torn {
            table.remove(&addr, id);
        }

        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::tests::{addr, MockTransport};

    fn heartbeat() -> Heartbeat {
        Heartbeat::new(1000, 2000, DEFAULT_HEARTBEAT_INTERVAL).unwrap()
    }

    #[test]
    fn test_empty_table_no_writes() {
        let mut table: ConnectionTable<MockTransport> = ConnectionTable::new();
        assert_eq!(heartbeat().beat(&mut table), 0);
    }

    #[test]
    fn test_one_write_per_connection() {
        let beat = heartbeat();
        let mut table = ConnectionTable::new();
        let transports: Vec<MockTransport> = (0..3).map(|_| MockTransport::default()).collect();
        for (port, transport) in (1..).zip(&transports) {
            let id = table.next_id();
            table.insert(id, addr(port), transport.clone());
        }

        assert_eq!(beat.beat(&mut table), 3);
        for transport in &transports {
            assert_eq!(transport.write_count(), 1);
            assert_eq!(transport.writes.borrow()[0], beat.packet().to_vec());
        }
    }

    #[test]
    fn test_failed_write_does_not_stop_others() {
        let beat = heartbeat();
        let mut table = ConnectionTable::new();
        let broken = MockTransport::failing(io::ErrorKind::BrokenPipe);
        let busy = MockTransport::failing(io::ErrorKind::WouldBlock);
        let healthy = MockTransport::default();

        for (port, transport) in [(1, &broken), (2, &busy), (3, &healthy)] {
            let id = table.next_id();
            table.insert(id, addr(port), transport.clone());
        }

        assert_eq!(beat.beat(&mut table), 3);
        assert_eq!(broken.write_count(), 1);
        assert_eq!(busy.write_count(), 1);
        assert_eq!(healthy.write_count(), 1);
        // removal is left to the close path
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_partial_write_drops_connection() {
        let beat = heartbeat();
        let mut table = ConnectionTable::new();
        let short = MockTransport::short(5);
        let healthy = MockTransport::default();

        for (port, transport) in [(1, &short), (2, &healthy)] {
            let id = table.next_id();
            table.insert(id, addr(port), transport.clone());
        }

        assert_eq!(beat.beat(&mut table), 2);
        assert!(!table.contains(&addr(1)));
        assert!(table.contains(&addr(2)));

        // the next beat only reaches the survivor
        assert_eq!(beat.beat(&mut table), 1);
        assert_eq!(short.write_count(), 1);
        assert_eq!(healthy.write_count(), 2);
    }

    #[test]
    fn test_beat_ages_connections() {
        let beat = heartbeat();
        let mut table = ConnectionTable::new();
        let id = table.next_id();
        table.insert(id, addr(1), MockTransport::default());

        beat.beat(&mut table);
        beat.beat(&mut table);
        assert_eq!(
            table.get(&addr(1)).unwrap().idle(),
            DEFAULT_HEARTBEAT_INTERVAL * 2
        );
    }

    #[test]
    fn test_packet_is_bare_header() {
        assert_eq!(
            &heartbeat().packet()[..],
            &[0xE8, 0x03, 0, 0, 0xD0, 0x07, 0, 0, 0, 0, 0, 0]
        );
    }
}
