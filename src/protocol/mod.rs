//! Protocol module - Defines the heartwire wire protocol
//!
//! The protocol uses a fixed-width binary format:
//! - 4 bytes protocol id (little-endian)
//! - 4 bytes packet type id (little-endian)
//! - 4 bytes payload length (little-endian)
//! - payload fields packed in declaration order, each at its fixed width

mod codec;
mod format;
mod packet;

pub use codec::*;
pub use format::*;
pub use packet::*;

/// Protocol id shared by every built-in packet kind
pub const DEFAULT_PROTOCOL_ID: i32 = 1000;

/// Type id of the server heartbeat
pub const HEARTBEAT_TYPE_ID: i32 = 2000;

/// Default port for heartwire communication
pub const DEFAULT_PORT: u16 = 10000;

/// Largest payload a stream decoder accepts by default (64 KB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// The zero-payload packet the server broadcasts to prove liveness
pub fn heartbeat_kind(protocol: i32, type_id: i32) -> Result<PacketKind, SchemaError> {
    PacketKind::builder("Heartbeat")
        .protocol(protocol)
        .type_id(type_id)
        .build()
}
