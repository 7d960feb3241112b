//! Encrypted, multiplexed per-peer sessions and everything routed over them.

pub mod client;
pub mod conn;
pub mod datagram;
pub mod dialer;
pub mod forwarder;
pub mod handshake;
pub mod listener;
pub mod peers;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod server;
pub mod session;
pub mod splice;
pub mod transport;
pub mod tunnel;
