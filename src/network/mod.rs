//! Network module - Connection lifecycle on both ends of the wire
//!
//! Provides:
//! - Server accept loop, connection table and heartbeat broadcast
//! - Client session with reconnect backoff and liveness timeout

mod client;
mod connection;
mod heartbeat;
mod server;
mod session;

pub use client::*;
pub use connection::*;
pub use heartbeat::*;
pub use server::*;
pub use session::*;
