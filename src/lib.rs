//! Heartwire - fixed-width packet protocol with heartbeat-driven connections
//!
//! - [`protocol`]: format registry, packet kinds, header codec and framing
//! - [`network`]: server accept loop and heartbeat, client session and driver
//! - [`config`]: TOML configuration shared by both ends

pub mod config;
pub mod network;
pub mod protocol;
