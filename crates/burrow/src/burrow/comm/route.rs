//! Network routes through agents, and their hop-by-hop setup.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::burrow::comm::{
    peers::{MsgType, PeerError, PeerRegistry, PeerSession},
    protocol::{RouteRef, RouteSpec},
    registry::Registries,
    session::Comm,
};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid network {0:?}")]
    InvalidNetwork(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("{network} overlaps route {existing} ({existing_network})")]
    Overlap {
        network: IpNetwork,
        existing: Uuid,
        existing_network: IpNetwork,
    },
    #[error("no connected peer has an interface in {0}")]
    NoGateway(IpNetwork),
    #[error("several peers can reach {network}: {candidates:?}")]
    AmbiguousGateway {
        network: IpNetwork,
        candidates: Vec<u32>,
    },
    #[error("peer {0} not found")]
    PeerNotFound(u32),
    #[error("hop {peer} refused the route: {source}")]
    Hop {
        peer: u32,
        #[source]
        source: PeerError,
    },
    #[error("route {0} not found")]
    NotFound(Uuid),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A destination network reached through a chain of peers.
pub struct Route {
    pub id: Uuid,
    pub network: IpNetwork,
    /// Intermediate peers, nearest first. Empty for a single-hop route.
    pub nodes: Vec<u32>,
    pub gateway: u32,
    comm: Option<Arc<Comm>>,
    active: AtomicBool,
    token: CancellationToken,
}

impl Route {
    fn new(
        network: IpNetwork,
        nodes: Vec<u32>,
        gateway: u32,
        comm: Option<Arc<Comm>>,
    ) -> Self {
        let token = match &comm {
            Some(c) => c.token().child_token(),
            None => CancellationToken::new(),
        };
        Self {
            id: Uuid::new_v4(),
            network,
            nodes,
            gateway,
            comm,
            active: AtomicBool::new(false),
            token,
        }
    }

    /// The gateway's Comm, which carries every connection on this route.
    pub fn comm(&self) -> Option<&Arc<Comm>> {
        self.comm.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Parent token of every connection dialed through this route.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Peers in the order route RPCs travel: intermediates, then the gateway.
    pub fn hops(&self) -> Vec<u32> {
        let mut hops = self.nodes.clone();
        hops.push(self.gateway);
        hops
    }

    pub fn spec(&self) -> RouteSpec {
        RouteSpec {
            id: self.id.to_string(),
            network: self.network.to_string(),
            nodes: self.nodes.clone(),
            gateway: self.gateway,
        }
    }

    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("nodes", &self.nodes)
            .field("gateway", &self.gateway)
            .field("active", &self.is_active())
            .finish()
    }
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Parses `10.0.0.0/24` or a bare address (host route), dropping host bits.
pub fn parse_network(raw: &str) -> Result<IpNetwork, RouteError> {
    let raw = raw.trim();
    let parsed = raw
        .parse::<IpNetwork>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNetwork::from))
        .map_err(|_| RouteError::InvalidNetwork(raw.to_string()))?;
    IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|_| RouteError::InvalidNetwork(raw.to_string()))
}

/// Registered routes, pending and active.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<Uuid, Arc<Route>>>,
}

impl RouteTable {
    /// The active route whose network contains `ip`.
    pub async fn resolve(&self, ip: IpAddr) -> Option<Arc<Route>> {
        let routes = self.routes.read().await;
        routes
            .values()
            .find(|r| r.is_active() && r.network.contains(ip))
            .cloned()
    }

    /// Like [`RouteTable::resolve`] for `"ip"` or `"ip:port"` strings.
    pub async fn resolve_addr(&self, addr: &str) -> Result<Option<Arc<Route>>, RouteError> {
        let ip = addr
            .parse::<SocketAddr>()
            .map(|a| a.ip())
            .or_else(|_| addr.trim_matches(['[', ']']).parse::<IpAddr>())
            .map_err(|_| RouteError::InvalidAddress(addr.to_string()))?;
        Ok(self.resolve(ip).await)
    }

    /// Inserts `route` unless its network overlaps a registered one.
    /// Pending routes count, so two concurrent adds cannot both pass.
    async fn reserve(&self, route: Arc<Route>) -> Result<(), RouteError> {
        let mut routes = self.routes.write().await;
        if let Some(existing) = routes.values().find(|r| overlaps(&r.network, &route.network)) {
            return Err(RouteError::Overlap {
                network: route.network,
                existing: existing.id,
                existing_network: existing.network,
            });
        }
        routes.insert(route.id, route);
        Ok(())
    }

    async fn activate(&self, id: &Uuid) {
        let routes = self.routes.read().await;
        if let Some(r) = routes.get(id) {
            if !r.active.swap(true, Ordering::AcqRel) {
                metrics::gauge!("burrow_routes_active").increment(1.0);
            }
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Route>> {
        self.routes.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Route>> {
        let removed = self.routes.write().await.remove(id);
        if let Some(r) = &removed {
            if r.deactivate() {
                metrics::gauge!("burrow_routes_active").decrement(1.0);
            }
        }
        removed
    }

    pub async fn list(&self) -> Vec<Arc<Route>> {
        let mut out: Vec<_> = self.routes.read().await.values().cloned().collect();
        out.sort_by_key(|r| r.network.to_string());
        out
    }

    /// Drops every route carried by Comm `comm_id` and closes their connections.
    pub async fn remove_by_comm(&self, comm_id: u32) -> Vec<Arc<Route>> {
        let removed: Vec<Arc<Route>> = {
            let mut routes = self.routes.write().await;
            let ids: Vec<Uuid> = routes
                .values()
                .filter(|r| r.comm.as_ref().is_some_and(|c| c.id() == comm_id))
                .map(|r| r.id)
                .collect();
            ids.iter().filter_map(|id| routes.remove(id)).collect()
        };
        for r in &removed {
            r.token.cancel();
            if r.deactivate() {
                metrics::gauge!("burrow_routes_active").decrement(1.0);
            }
        }
        removed
    }
}

/// One step of a saga: something that can be done and, once done, undone.
#[async_trait]
pub trait HopStep: Send + Sync {
    async fn apply(&self) -> Result<(), RouteError>;

    /// Best-effort; failures are only logged.
    async fn compensate(&self);
}

/// Applies `steps` in order. On the first failure the steps that already
/// succeeded are compensated in reverse order and the error is returned.
pub async fn run_saga<S: HopStep + ?Sized>(steps: &[Box<S>]) -> Result<(), RouteError> {
    for (i, step) in steps.iter().enumerate() {
        if let Err(err) = step.apply().await {
            for done in steps[..i].iter().rev() {
                done.compensate().await;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Installs a route on one peer.
struct RouteHop {
    peer: Arc<dyn PeerSession>,
    spec: RouteSpec,
    timeout: Duration,
}

#[async_trait]
impl HopStep for RouteHop {
    async fn apply(&self) -> Result<(), RouteError> {
        let payload = Bytes::from(serde_json::to_vec(&self.spec)?);
        self.peer
            .request(MsgType::RouteAdd, self.timeout, payload)
            .await
            .map(|_| ())
            .map_err(|source| RouteError::Hop {
                peer: self.peer.id(),
                source,
            })
    }

    async fn compensate(&self) {
        remove_on_peer(self.peer.as_ref(), &self.spec.id, self.timeout).await;
    }
}

async fn remove_on_peer(peer: &dyn PeerSession, route_id: &str, timeout: Duration) {
    let payload = match serde_json::to_vec(&RouteRef {
        id: route_id.to_string(),
    }) {
        Ok(p) => Bytes::from(p),
        Err(err) => {
            tracing::warn!(route = %route_id, err = %err, "route: encoding remove request failed");
            return;
        }
    };
    if let Err(err) = peer.request(MsgType::RouteRemove, timeout, payload).await {
        tracing::warn!(route = %route_id, peer = peer.id(), err = %err, "route: remove on hop failed");
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddRoute {
    pub network: String,
    /// Gateway session; when absent it is picked from peer interfaces.
    pub gateway: Option<u32>,
}

/// Route management over the session registry.
pub struct RouteManager {
    registries: Arc<Registries>,
    peers: Arc<dyn PeerRegistry>,
    rpc_timeout: Duration,
}

impl RouteManager {
    pub fn new(
        registries: Arc<Registries>,
        peers: Arc<dyn PeerRegistry>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            registries,
            peers,
            rpc_timeout,
        }
    }

    pub async fn resolve(&self, addr: &str) -> Result<Option<Arc<Route>>, RouteError> {
        self.registries.routes.resolve_addr(addr).await
    }

    fn select_gateway(&self, network: &IpNetwork) -> Result<Arc<dyn PeerSession>, RouteError> {
        let mut found: Vec<Arc<dyn PeerSession>> = self
            .peers
            .all()
            .into_iter()
            .filter(|p| p.interfaces().iter().any(|n| n.contains(network.network())))
            .collect();
        match found.len() {
            0 => Err(RouteError::NoGateway(*network)),
            1 => Ok(found.remove(0)),
            _ => Err(RouteError::AmbiguousGateway {
                network: *network,
                candidates: found.iter().map(|p| p.id()).collect(),
            }),
        }
    }

    /// Adds a route and installs it hop by hop. The route only resolves once
    /// the gateway has acknowledged; any failure leaves the table unchanged.
    pub async fn add(&self, req: AddRoute) -> Result<Arc<Route>, RouteError> {
        let network = parse_network(&req.network)?;
        let gateway = match req.gateway {
            Some(id) => self.peers.get(id).ok_or(RouteError::PeerNotFound(id))?,
            None => self.select_gateway(&network)?,
        };

        // A gateway that is itself reached through a route extends that chain.
        let mut nodes = Vec::new();
        if let Some(ip) = gateway.remote_ip() {
            if let Some(via) = self.registries.routes.resolve(ip).await {
                nodes = via.hops();
            }
        }

        // The gateway's own session already crosses the chain, so traffic for
        // the route is carried by its Comm and leaves from the gateway.
        let comm = self.registries.comm_by_session(gateway.id());
        let route = Arc::new(Route::new(network, nodes, gateway.id(), comm));
        self.registries.routes.reserve(route.clone()).await?;

        let steps = match self.hop_steps(&route, &gateway) {
            Ok(s) => s,
            Err(err) => {
                self.registries.routes.remove(&route.id).await;
                return Err(err);
            }
        };
        if let Err(err) = run_saga(&steps).await {
            self.registries.routes.remove(&route.id).await;
            tracing::warn!(route = %route.id, network = %network, err = %err, "route: add failed");
            return Err(err);
        }

        self.registries.routes.activate(&route.id).await;
        tracing::info!(
            route = %route.id,
            network = %network,
            gateway = route.gateway,
            hops = route.nodes.len() + 1,
            "route: added"
        );
        Ok(route)
    }

    fn hop_steps(
        &self,
        route: &Route,
        gateway: &Arc<dyn PeerSession>,
    ) -> Result<Vec<Box<dyn HopStep>>, RouteError> {
        let mut steps: Vec<Box<dyn HopStep>> = Vec::with_capacity(route.nodes.len() + 1);
        for (i, &node) in route.nodes.iter().enumerate() {
            let peer = self.peers.get(node).ok_or(RouteError::PeerNotFound(node))?;
            let mut spec = route.spec();
            spec.nodes = route.nodes[i + 1..].to_vec();
            steps.push(Box::new(RouteHop {
                peer,
                spec,
                timeout: self.rpc_timeout,
            }));
        }
        let mut spec = route.spec();
        spec.nodes.clear();
        steps.push(Box::new(RouteHop {
            peer: gateway.clone(),
            spec,
            timeout: self.rpc_timeout,
        }));
        Ok(steps)
    }

    /// Removes a route from every hop (best-effort) and deregisters it.
    pub async fn remove(&self, id: Uuid, close_conns: bool) -> Result<(), RouteError> {
        let route = self
            .registries
            .routes
            .get(&id)
            .await
            .ok_or(RouteError::NotFound(id))?;

        let route_id = id.to_string();
        for hop in route.hops() {
            match self.peers.get(hop) {
                Some(peer) => remove_on_peer(peer.as_ref(), &route_id, self.rpc_timeout).await,
                None => tracing::warn!(route = %id, peer = hop, "route: hop no longer connected"),
            }
        }
        if close_conns {
            route.token.cancel();
        }
        self.registries.routes.remove(&id).await;
        tracing::info!(route = %id, network = %route.network, close_conns, "route: removed");
        Ok(())
    }

    pub async fn list(&self) -> Vec<Arc<Route>> {
        self.registries.routes.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::burrow::comm::{
        dialer::Dialer,
        peers,
        protocol::PeerKind,
        session::{CommSessions, tests::pair},
    };

    type Log = Arc<Mutex<Vec<(u32, MsgType, String)>>>;

    struct FakePeer {
        id: u32,
        remote: Option<IpAddr>,
        interfaces: Vec<IpNetwork>,
        refuse: bool,
        log: Log,
    }

    #[async_trait]
    impl PeerSession for FakePeer {
        fn id(&self) -> u32 {
            self.id
        }
        fn name(&self) -> String {
            format!("peer-{}", self.id)
        }
        fn remote_ip(&self) -> Option<IpAddr> {
            self.remote
        }
        fn interfaces(&self) -> Vec<IpNetwork> {
            self.interfaces.clone()
        }
        async fn request(&self, msg: MsgType, _t: Duration, payload: Bytes) -> Result<Bytes, PeerError> {
            let body = String::from_utf8_lossy(&payload).into_owned();
            self.log.lock().unwrap().push((self.id, msg, body));
            if self.refuse && msg == MsgType::RouteAdd {
                return Err(PeerError::Remote("no".into()));
            }
            Ok(Bytes::new())
        }
        async fn send(&self, msg: MsgType, _payload: Bytes) -> Result<(), PeerError> {
            Err(PeerError::Unsupported(msg))
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        peers: Vec<Arc<FakePeer>>,
    }

    impl PeerRegistry for FakeRegistry {
        fn get(&self, id: u32) -> Option<Arc<dyn PeerSession>> {
            self.peers
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.clone() as Arc<dyn PeerSession>)
        }
        fn all(&self) -> Vec<Arc<dyn PeerSession>> {
            self.peers.iter().map(|p| p.clone() as Arc<dyn PeerSession>).collect()
        }
    }

    fn peer(id: u32, remote: &str, ifaces: &[&str], refuse: bool, log: &Log) -> Arc<FakePeer> {
        let raw: Vec<String> = ifaces.iter().map(|s| s.to_string()).collect();
        Arc::new(FakePeer {
            id,
            remote: remote.parse().ok(),
            interfaces: peers::parse_interfaces(&raw),
            refuse,
            log: log.clone(),
        })
    }

    fn manager(peers: Vec<Arc<FakePeer>>) -> (Arc<Registries>, RouteManager) {
        let reg = Registries::new();
        let m = RouteManager::new(
            reg.clone(),
            Arc::new(FakeRegistry { peers }),
            Duration::from_secs(1),
        );
        (reg, m)
    }

    fn add(network: &str) -> AddRoute {
        AddRoute {
            network: network.into(),
            gateway: None,
        }
    }

    #[tokio::test]
    async fn resolves_within_route_and_rejects_overlap() {
        let log = Log::default();
        let (_reg, m) = manager(vec![peer(7, "203.0.113.5", &["10.0.0.2/24"], false, &log)]);

        let route = m.add(add("10.0.0.0/24")).await.unwrap();
        assert_eq!(route.gateway, 7);
        assert!(route.is_active());

        let hit = m.resolve("10.0.0.5").await.unwrap().unwrap();
        assert_eq!(hit.id, route.id);
        assert!(m.resolve("10.0.1.5:80").await.unwrap().is_none());
        assert!(matches!(m.resolve("nope").await, Err(RouteError::InvalidAddress(_))));

        let err = m.add(add("10.0.0.0/25")).await.unwrap_err();
        assert!(matches!(err, RouteError::Overlap { existing, .. } if existing == route.id));
        assert_eq!(m.list().await.len(), 1);

        let sent = log.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, MsgType::RouteAdd);
        assert!(sent[0].2.contains("10.0.0.0/24"));
    }

    #[tokio::test]
    async fn gateway_selection_needs_exactly_one_candidate() {
        let log = Log::default();
        let (_reg, m) = manager(vec![
            peer(1, "203.0.113.1", &["192.168.1.10/24"], false, &log),
            peer(2, "203.0.113.2", &["192.168.1.11/24"], false, &log),
        ]);
        assert!(matches!(
            m.add(add("192.168.1.0/24")).await,
            Err(RouteError::AmbiguousGateway { .. })
        ));
        assert!(matches!(m.add(add("172.20.0.0/16")).await, Err(RouteError::NoGateway(_))));
        assert!(matches!(m.add(add("banana")).await, Err(RouteError::InvalidNetwork(_))));

        let explicit = m
            .add(AddRoute {
                network: "192.168.1.0/24".into(),
                gateway: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(explicit.gateway, 2);
        assert!(m.list().await.len() == 1);
    }

    #[tokio::test]
    async fn chained_gateway_splices_and_failure_compensates() {
        let log = Log::default();
        let g1 = peer(1, "203.0.113.1", &["10.0.0.2/24"], false, &log);
        let g2 = peer(2, "10.0.0.7", &["172.16.4.1/16"], true, &log);
        let g3 = peer(3, "10.0.0.8", &["192.168.50.1/24"], false, &log);
        let (_reg, m) = manager(vec![g1, g2, g3]);

        m.add(add("10.0.0.0/24")).await.unwrap();
        log.lock().unwrap().clear();

        // g2 sits behind g1 and refuses: g1 must be told to forget the route.
        let err = m.add(add("172.16.0.0/16")).await.unwrap_err();
        assert!(matches!(err, RouteError::Hop { peer: 2, .. }));
        assert!(m.resolve("172.16.0.1").await.unwrap().is_none());
        let sent: Vec<(u32, MsgType)> = log.lock().unwrap().iter().map(|e| (e.0, e.1)).collect();
        assert_eq!(
            sent,
            vec![
                (1, MsgType::RouteAdd),
                (2, MsgType::RouteAdd),
                (1, MsgType::RouteRemove),
            ]
        );
        log.lock().unwrap().clear();

        let chained = m.add(add("192.168.50.0/24")).await.unwrap();
        assert_eq!(chained.nodes, vec![1]);
        assert_eq!(chained.gateway, 3);
        assert_eq!(chained.hops(), vec![1, 3]);

        m.remove(chained.id, true).await.unwrap();
        assert!(chained.token().is_cancelled());
        assert!(m.resolve("192.168.50.9").await.unwrap().is_none());
        let removes: Vec<u32> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.1 == MsgType::RouteRemove)
            .map(|e| e.0)
            .collect();
        assert_eq!(removes, vec![1, 3]);
        assert!(matches!(m.remove(chained.id, false).await, Err(RouteError::NotFound(_))));
    }

    struct Step {
        n: u32,
        fail: bool,
        trail: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HopStep for Step {
        async fn apply(&self) -> Result<(), RouteError> {
            self.trail.lock().unwrap().push(format!("apply {}", self.n));
            if self.fail {
                Err(RouteError::PeerNotFound(self.n))
            } else {
                Ok(())
            }
        }
        async fn compensate(&self) {
            self.trail.lock().unwrap().push(format!("undo {}", self.n));
        }
    }

    #[tokio::test]
    async fn saga_undoes_the_succeeded_prefix_in_reverse() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let steps: Vec<Box<Step>> = (1..=4)
            .map(|n| {
                Box::new(Step {
                    n,
                    fail: n == 3,
                    trail: trail.clone(),
                })
            })
            .collect();
        assert!(matches!(run_saga(&steps).await, Err(RouteError::PeerNotFound(3))));
        assert_eq!(
            *trail.lock().unwrap(),
            vec!["apply 1", "apply 2", "apply 3", "undo 2", "undo 1"]
        );
    }

    #[tokio::test]
    async fn routes_follow_their_comm() {
        let reg = Registries::new();
        let (agent, client) = pair(&reg, PeerKind::Agent, "gw", vec!["10.9.0.4/16".into()]).await;
        let m = RouteManager::new(reg.clone(), CommSessions::new(reg.clone()), Duration::from_secs(5));

        let route = m.add(add("10.9.0.0/16")).await.unwrap();
        assert_eq!(route.comm().map(|c| c.id()), Some(agent.id()));
        let installed = client.routes();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].id, route.id.to_string());

        agent.shutdown().await;
        assert!(route.token().is_cancelled());
        assert!(reg.routes.list().await.is_empty());
        assert!(m.resolve("10.9.1.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spliced_route_traffic_leaves_from_the_gateway() {
        let target = tokio::net::TcpListener::bind("127.0.0.2:0").await.unwrap();
        let taddr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = s.read(&mut buf).await.unwrap_or(0);
                if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let reg = Registries::new();
        // Both test agents appear to come from 127.0.0.1, so the gateway is
        // reached through the hop's route.
        let (hop, _hop_client) = pair(&reg, PeerKind::Agent, "hop", vec!["127.0.0.1/32".into()]).await;
        let (gw, _gw_client) = pair(&reg, PeerKind::Agent, "gw", vec!["127.0.0.2/32".into()]).await;
        let m = RouteManager::new(reg.clone(), CommSessions::new(reg.clone()), Duration::from_secs(5));

        let via = m.add(add("127.0.0.1/32")).await.unwrap();
        assert_eq!(via.comm().map(|c| c.id()), Some(hop.id()));
        let route = m.add(add("127.0.0.2/32")).await.unwrap();
        assert_eq!(route.nodes, vec![hop.session_id()]);
        assert_eq!(route.gateway, gw.session_id());
        assert_eq!(route.comm().map(|c| c.id()), Some(gw.id()));

        let mut conn = Dialer::new(reg.clone(), Duration::from_secs(5))
            .dial(&taddr.to_string())
            .await
            .unwrap();
        assert!(conn.is_routed());
        conn.write_all(b"pivot").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pivot");

        // Losing the gateway ends the relayed connection; the hop's route stays.
        gw.shutdown().await;
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(m.resolve("127.0.0.2").await.unwrap().is_none());
        assert_eq!(m.resolve("127.0.0.1").await.unwrap().map(|r| r.id), Some(via.id));
    }
}
