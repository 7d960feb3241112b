//! Interfaces of the external session registry.
//!
//! Route RPCs and the raw tunnel primitive talk to connected peers through
//! these traits. The process wires them to [`CommSessions`] by default; other
//! front ends can inject their own implementation.
//!
//! [`CommSessions`]: crate::burrow::comm::session::CommSessions

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use thiserror::Error;

/// Message kinds exchanged with a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    RouteAdd,
    RouteRemove,
    TunnelOpen,
    TunnelData,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {0} not found")]
    NotFound(u32),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("peer rejected request: {0}")]
    Remote(String),
    #[error("message type {0:?} not supported by this session")]
    Unsupported(MsgType),
    #[error("session closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn id(&self) -> u32;
    fn name(&self) -> String;
    fn remote_ip(&self) -> Option<IpAddr>;
    fn interfaces(&self) -> Vec<IpNetwork>;

    /// Request/response round-trip.
    async fn request(
        &self,
        msg: MsgType,
        timeout: Duration,
        payload: Bytes,
    ) -> Result<Bytes, PeerError>;

    /// Fire-and-forget message.
    async fn send(&self, msg: MsgType, payload: Bytes) -> Result<(), PeerError>;
}

pub trait PeerRegistry: Send + Sync {
    fn get(&self, id: u32) -> Option<Arc<dyn PeerSession>>;
    fn all(&self) -> Vec<Arc<dyn PeerSession>>;
}

/// Parses interface strings (`"10.0.0.2/24"` or a bare address) into networks.
/// The host bits are kept so the peer's own address stays visible; containment
/// checks use the network part.
pub fn parse_interfaces(raw: &[String]) -> Vec<IpNetwork> {
    raw.iter()
        .filter_map(|s| {
            let s = s.trim();
            if let Ok(n) = s.parse::<IpNetwork>() {
                return Some(n);
            }
            s.parse::<IpAddr>().ok().map(IpNetwork::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interfaces_accept_cidr_and_bare_addresses() {
        let got = parse_interfaces(&[
            "10.0.0.2/24".into(),
            "192.168.7.1".into(),
            "garbage".into(),
        ]);
        assert_eq!(got.len(), 2);
        assert!(got[0].contains("10.0.0.77".parse().unwrap()));
        assert!(got[1].contains("192.168.7.1".parse().unwrap()));
        assert!(!got[1].contains("192.168.7.2".parse().unwrap()));
    }
}
