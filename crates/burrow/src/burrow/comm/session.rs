use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::burrow::comm::{
    conn::{Channel, CommConn, PacketConn},
    forwarder,
    handshake::{self, Credentials, HandshakeError},
    peers::{self, MsgType, PeerError, PeerRegistry, PeerSession},
    protocol::{
        self, Direction, Hello, PeerKind, ProtocolError, Reply, Request, RouteRef, RouteSpec,
        StreamHeader, Transport,
    },
    registry::Registries,
    route::{AddRoute, RouteManager},
    transport::{BoxedStream, MuxSession},
    tunnel::{self, Tunnel, TunnelError},
};

#[derive(Debug, Error)]
pub enum CommError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("channel rejected: {0}")]
    Rejected(String),
    #[error("peer error: {0}")]
    Remote(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("comm closed")]
    Closed,
    #[error("no connection and no session to tunnel through")]
    NoTransport,
}

#[derive(Debug, Clone)]
pub struct CommOptions {
    /// Zero disables keepalive.
    pub keepalive_interval: Duration,
    pub keepalive_max_failures: u32,
    pub request_timeout: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub accept_backlog: usize,
}

impl Default for CommOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_max_failures: 3,
            request_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            accept_backlog: 128,
        }
    }
}

/// What the peer told us about itself during bootstrap.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    pub name: String,
    pub kind: PeerKind,
    pub interfaces: Vec<IpNetwork>,
    pub fingerprint: String,
}

pub struct CommInit {
    pub session_id: u32,
    /// Raw connection; when absent a tunnel is opened through `session`.
    pub conn: Option<BoxedStream>,
    pub remote_addr: Option<SocketAddr>,
    pub session: Option<Arc<dyn PeerSession>>,
}

/// One multiplexed, authenticated session with a peer.
pub struct Comm {
    id: u32,
    session_id: u32,
    mux: MuxSession,
    registries: Arc<Registries>,
    opts: CommOptions,
    remote_addr: Option<SocketAddr>,
    profile: RwLock<PeerInfo>,
    tunnel: Option<Arc<Tunnel>>,
    token: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

type InboundRequest = (Request, BoxedStream);

impl Comm {
    /// Secures `init.conn` (or a fresh tunnel), sets up the multiplexer and
    /// waits for the bootstrap stream. The Comm is not registered yet.
    pub async fn init(
        init: CommInit,
        registries: Arc<Registries>,
        creds: &Credentials,
        opts: CommOptions,
    ) -> Result<(Arc<Comm>, BoxedStream), CommError> {
        let (raw, tunnel): (BoxedStream, Option<Arc<Tunnel>>) = match init.conn {
            Some(conn) => (conn, None),
            None => {
                let session = init.session.ok_or(CommError::NoTransport)?;
                let ts = tunnel::open(&registries, session, opts.request_timeout).await?;
                let t = ts.tunnel().clone();
                (Box::new(ts), Some(t))
            }
        };

        let (secured, fingerprint) = handshake::accept(raw, creds, opts.handshake_timeout).await?;
        let mux = MuxSession::server(secured);

        let bootstrap = tokio::time::timeout(opts.handshake_timeout, mux.accept_stream())
            .await
            .map_err(|_| CommError::Timeout(opts.handshake_timeout))?
            .ok_or(CommError::Closed)?;

        let id = registries.next_comm_id();
        tracing::info!(
            comm = id,
            session = init.session_id,
            remote = ?init.remote_addr,
            fingerprint = %fingerprint,
            tunneled = tunnel.is_some(),
            "comm: handshake complete"
        );

        let comm = Arc::new(Comm {
            id,
            session_id: init.session_id,
            mux,
            registries,
            opts,
            remote_addr: init.remote_addr,
            profile: RwLock::new(PeerInfo {
                fingerprint,
                ..Default::default()
            }),
            tunnel,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok((comm, bootstrap))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn options(&self) -> &CommOptions {
        &self.opts
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    /// Cancelled when the Comm shuts down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn profile(&self) -> PeerInfo {
        self.profile.read().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_profile(&self, hello: &Hello) {
        if let Ok(mut p) = self.profile.write() {
            p.name = hello.name.clone();
            p.kind = hello.kind;
            p.interfaces = peers::parse_interfaces(&hello.interfaces);
        }
    }

    /// Registers the Comm and spawns its dispatcher, request handler and keepalive.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registries.comms.add(self.id, self.clone());
        metrics::gauge!("burrow_comms_active").increment(1.0);

        let (req_tx, req_rx) = mpsc::channel::<InboundRequest>(self.opts.accept_backlog.max(1));
        tokio::spawn(self.clone().serve(req_tx));
        tokio::spawn(self.clone().handle_requests(req_rx));
        if !self.opts.keepalive_interval.is_zero() {
            tokio::spawn(self.clone().keepalive());
        }

        let p = self.profile();
        tracing::info!(
            comm = self.id,
            session = self.session_id,
            name = %p.name,
            kind = ?p.kind,
            interfaces = p.interfaces.len(),
            "comm: started"
        );
    }

    async fn serve(self: Arc<Self>, requests: mpsc::Sender<InboundRequest>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                st = self.mux.accept_stream() => st,
            };
            let Some(mut stream) = next else {
                tracing::info!(comm = self.id, "comm: transport closed");
                break;
            };

            let comm = self.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                let header = tokio::time::timeout(
                    comm.opts.handshake_timeout,
                    protocol::read_header(&mut stream),
                )
                .await;
                match header {
                    Ok(Ok(StreamHeader::Channel(info))) => {
                        let ch = Channel::new(info, stream, comm.token.child_token());
                        comm.dispatch(ch).await;
                    }
                    Ok(Ok(StreamHeader::Request(req))) => {
                        if requests.send((req, stream)).await.is_err() {
                            tracing::debug!(comm = comm.id, "comm: request queue closed");
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(comm = comm.id, err = %err, "comm: bad stream header");
                    }
                    Err(_) => {
                        tracing::debug!(comm = comm.id, "comm: stream header timed out");
                    }
                }
            });
        }
        self.shutdown().await;
    }

    /// Routes an inbound channel to the listener or forwarder registered under its ID.
    async fn dispatch(self: &Arc<Self>, ch: Channel) {
        let id = ch.info.id.clone();
        metrics::counter!("burrow_channels_total", "transport" => ch.info.transport.to_string())
            .increment(1);
        tracing::debug!(comm = self.id, id = %id, transport = %ch.info.transport, "comm: inbound channel");

        if let Some(l) = self.registries.tcp_listeners.get(&id) {
            if l.comm_id() == self.id {
                l.push(ch).await;
                return;
            }
        } else if let Some(l) = self.registries.udp_listeners.get(&id) {
            if l.comm_id() == self.id {
                l.attach(ch).await;
                return;
            }
        } else if let Some(fw) = self.registries.forwarders.get(&id) {
            let (client, peer) = fw.comms();
            let origin = match fw.info().direction {
                Direction::Direct => client,
                Direction::Reverse => peer,
            };
            if origin == self.id {
                fw.handle(ch).await;
                return;
            }
        }

        metrics::counter!("burrow_channels_rejected_total").increment(1);
        tracing::debug!(comm = self.id, id = %id, "comm: no handler for channel");
        ch.reject("no handler").await;
    }

    async fn handle_requests(self: Arc<Self>, mut rx: mpsc::Receiver<InboundRequest>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                r = rx.recv() => r,
            };
            let Some((req, mut stream)) = next else {
                break;
            };
            let comm = self.clone();
            tokio::spawn(async move {
                let kind = req.kind();
                let reply = comm.answer(req).await;
                if !reply.ok {
                    tracing::debug!(comm = comm.id, kind, err = %reply.error, "comm: request refused");
                }
                if let Err(err) = protocol::write_reply(&mut stream, &reply).await {
                    tracing::debug!(comm = comm.id, kind, err = %err, "comm: reply not delivered");
                }
                let _ = stream.shutdown().await;
            });
        }
    }

    async fn answer(self: &Arc<Self>, req: Request) -> Reply {
        match req {
            Request::Keepalive | Request::Latency => Reply::ok(),
            Request::HandlerClosed { id } => {
                self.release_handler(&id).await;
                Reply::ok()
            }
            Request::PortfwdOpen { handler, session_id } => {
                if self.profile().kind != PeerKind::Console {
                    return Reply::err("port forwards can only be opened by consoles");
                }
                let Some(peer) = self.registries.comm_by_session(session_id) else {
                    return Reply::err(format!("no comm for session {session_id}"));
                };
                match forwarder::open(&self.registries, handler, self.clone(), peer).await {
                    Ok(_) => Reply::ok(),
                    Err(err) => Reply::err(err.to_string()),
                }
            }
            Request::PortfwdClose { id, close_conns } => {
                match self.registries.forwarders.get(&id) {
                    Some(fw) if fw.comms().0 == self.id => {
                        match forwarder::close(&self.registries, &id, close_conns).await {
                            Ok(()) => Reply::ok(),
                            Err(err) => Reply::err(err.to_string()),
                        }
                    }
                    _ => Reply::err(format!("port forward {id:?} not found")),
                }
            }
            Request::RouteCreate { network, gateway } => {
                if self.profile().kind != PeerKind::Console {
                    return Reply::err("routes can only be managed by consoles");
                }
                match self.routes().add(AddRoute { network, gateway }).await {
                    Ok(route) => Reply::with_data(serde_json::json!(route.spec())),
                    Err(err) => Reply::err(err.to_string()),
                }
            }
            Request::RouteDelete { id, close_conns } => {
                if self.profile().kind != PeerKind::Console {
                    return Reply::err("routes can only be managed by consoles");
                }
                let Ok(uuid) = Uuid::parse_str(&id) else {
                    return Reply::err(format!("route {id:?} not found"));
                };
                match self.routes().remove(uuid, close_conns).await {
                    Ok(()) => Reply::ok(),
                    Err(err) => Reply::err(err.to_string()),
                }
            }
            Request::RouteList { addr } => {
                if self.profile().kind != PeerKind::Console {
                    return Reply::err("routes can only be managed by consoles");
                }
                let specs: Vec<RouteSpec> = match addr {
                    Some(addr) => match self.routes().resolve(&addr).await {
                        Ok(hit) => hit.iter().map(|r| r.spec()).collect(),
                        Err(err) => return Reply::err(err.to_string()),
                    },
                    None => self.routes().list().await.iter().map(|r| r.spec()).collect(),
                };
                Reply::with_data(serde_json::json!(specs))
            }
            other => Reply::err(format!("unsupported request {}", other.kind())),
        }
    }

    fn routes(&self) -> RouteManager {
        RouteManager::new(
            self.registries.clone(),
            CommSessions::new(self.registries.clone()),
            self.opts.request_timeout,
        )
    }

    /// The peer reports that the concrete listener behind `id` is gone.
    async fn release_handler(&self, id: &str) {
        let id = id.to_string();
        if let Some(l) = self.registries.tcp_listeners.get(&id) {
            if l.comm_id() == self.id {
                l.close_local().await;
            }
        }
        if let Some(l) = self.registries.udp_listeners.get(&id) {
            if l.comm_id() == self.id {
                l.close_local().await;
            }
        }
        if let Some(fw) = self.registries.forwarders.get(&id) {
            if fw.comms().1 == self.id {
                forwarder::release(&self.registries, &fw, true).await;
            }
        }
    }

    async fn keepalive(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.opts.keepalive_interval);
        tick.tick().await;
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tick.tick() => {}
            }
            match self.request(Request::Keepalive, self.opts.request_timeout).await {
                Ok(_) => failures = 0,
                Err(CommError::Closed) => return,
                Err(err) => {
                    failures += 1;
                    tracing::warn!(comm = self.id, failures, err = %err, "comm: keepalive failed");
                    if failures >= self.opts.keepalive_max_failures.max(1) {
                        tracing::warn!(comm = self.id, "comm: peer unresponsive; shutting down");
                        self.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    /// Out-of-band request/response on a dedicated stream.
    pub async fn request(
        &self,
        req: Request,
        timeout: Duration,
    ) -> Result<serde_json::Value, CommError> {
        if self.is_closed() {
            return Err(CommError::Closed);
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(CommError::Closed),
            r = call(&self.mux, &req, timeout) => r,
        }
    }

    /// Round-trip time of one request.
    pub async fn latency(&self) -> Result<Duration, CommError> {
        let started = Instant::now();
        self.request(Request::Latency, self.opts.request_timeout).await?;
        Ok(started.elapsed())
    }

    /// Opens a channel and returns the accepted raw stream.
    pub async fn open_channel(&self, info: &protocol::ConnInfo) -> Result<BoxedStream, CommError> {
        if self.is_closed() {
            return Err(CommError::Closed);
        }
        let timeout = if info.timeout_ms > 0 {
            Duration::from_millis(info.timeout_ms)
        } else {
            self.opts.dial_timeout
        };
        tokio::select! {
            _ = self.token.cancelled() => Err(CommError::Closed),
            r = open_channel(&self.mux, info, timeout) => r,
        }
    }

    /// Dials `info.rhost:info.rport` through the peer.
    pub async fn dial(&self, info: protocol::ConnInfo) -> Result<CommConn, CommError> {
        self.dial_scoped(info, self.token.child_token()).await
    }

    /// Like [`Comm::dial`], closing the connection when `token` is cancelled.
    pub async fn dial_scoped(
        &self,
        info: protocol::ConnInfo,
        token: CancellationToken,
    ) -> Result<CommConn, CommError> {
        let stream = self.open_channel(&info).await?;
        Ok(CommConn::new(stream, info, token))
    }

    /// Packet-oriented dial: a UDP channel bound to a single remote.
    pub async fn dial_packet(
        &self,
        mut info: protocol::ConnInfo,
        token: CancellationToken,
    ) -> Result<PacketConn, CommError> {
        info.transport = Transport::Udp;
        let stream = self.open_channel(&info).await?;
        Ok(PacketConn::connected(stream, info, token))
    }

    /// Tears the Comm down. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(comm = self.id, session = self.session_id, "comm: shutting down");

        // Closes every relayed connection scoped under this Comm.
        self.token.cancel();

        for l in self.registries.tcp_listeners.all() {
            if l.comm_id() == self.id {
                l.close_local().await;
            }
        }
        for l in self.registries.udp_listeners.all() {
            if l.comm_id() == self.id {
                l.close_local().await;
            }
        }
        for fw in self.registries.forwarders.all() {
            let (client, peer) = fw.comms();
            if peer == self.id {
                forwarder::release(&self.registries, &fw, true).await;
            } else if client == self.id {
                forwarder::release(&self.registries, &fw, false).await;
            }
        }
        for route in self.registries.routes.remove_by_comm(self.id).await {
            tracing::info!(comm = self.id, route = %route.id, network = %route.network, "route: dropped with comm");
        }

        self.mux.close().await;
        if let Some(t) = &self.tunnel {
            t.close();
        }

        self.registries
            .comms
            .remove_if(&self.id, |c| std::ptr::eq(Arc::as_ptr(c), self));
        if self.started.load(Ordering::Acquire) {
            metrics::gauge!("burrow_comms_active").decrement(1.0);
        }
    }
}

/// Sends one request on a fresh stream and waits for its reply.
pub(crate) async fn call(
    mux: &MuxSession,
    req: &Request,
    timeout: Duration,
) -> Result<serde_json::Value, CommError> {
    let round_trip = async {
        let mut st = mux.open_stream().await?;
        protocol::write_header(&mut st, &StreamHeader::Request(req.clone())).await?;
        let reply = protocol::read_reply(&mut st).await?;
        let _ = st.shutdown().await;
        Ok::<_, CommError>(reply)
    };
    let reply = tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| CommError::Timeout(timeout))??;
    if reply.ok {
        Ok(reply.data)
    } else {
        Err(CommError::Remote(reply.error))
    }
}

/// Opens a channel and waits for the peer's accept/reject status.
///
/// The timeout covers the whole exchange; a stream lost to the timeout is
/// dropped, which closes it on the peer.
pub(crate) async fn open_channel(
    mux: &MuxSession,
    info: &protocol::ConnInfo,
    timeout: Duration,
) -> Result<BoxedStream, CommError> {
    let open = async {
        let mut st = mux.open_stream().await?;
        protocol::write_header(&mut st, &StreamHeader::Channel(info.clone())).await?;
        match protocol::read_status(&mut st).await? {
            Ok(()) => Ok(st),
            Err(reason) => Err(CommError::Rejected(reason)),
        }
    };
    tokio::time::timeout(timeout, open)
        .await
        .map_err(|_| CommError::Timeout(timeout))?
}

/// Session registry backed by the registered Comms.
///
/// Route RPCs travel as Comm requests; tunnel messages are not supported
/// since a registered Comm already has a transport.
pub struct CommSessions {
    registries: Arc<Registries>,
}

impl CommSessions {
    pub fn new(registries: Arc<Registries>) -> Arc<Self> {
        Arc::new(Self { registries })
    }
}

impl PeerRegistry for CommSessions {
    fn get(&self, id: u32) -> Option<Arc<dyn PeerSession>> {
        self.registries
            .comm_by_session(id)
            .map(|c| Arc::new(CommPeer(c)) as Arc<dyn PeerSession>)
    }

    fn all(&self) -> Vec<Arc<dyn PeerSession>> {
        self.registries
            .comms
            .all()
            .into_iter()
            .filter(|c| c.profile().kind == PeerKind::Agent)
            .map(|c| Arc::new(CommPeer(c)) as Arc<dyn PeerSession>)
            .collect()
    }
}

struct CommPeer(Arc<Comm>);

impl From<CommError> for PeerError {
    fn from(err: CommError) -> Self {
        match err {
            CommError::Timeout(d) => PeerError::Timeout(d),
            CommError::Remote(msg) => PeerError::Remote(msg),
            CommError::Closed => PeerError::Closed,
            other => PeerError::Other(other.to_string()),
        }
    }
}

#[async_trait]
impl PeerSession for CommPeer {
    fn id(&self) -> u32 {
        self.0.session_id()
    }

    fn name(&self) -> String {
        self.0.profile().name
    }

    fn remote_ip(&self) -> Option<IpAddr> {
        self.0.remote_addr().map(|a| a.ip())
    }

    fn interfaces(&self) -> Vec<IpNetwork> {
        self.0.profile().interfaces
    }

    async fn request(
        &self,
        msg: MsgType,
        timeout: Duration,
        payload: Bytes,
    ) -> Result<Bytes, PeerError> {
        let req = match msg {
            MsgType::RouteAdd => {
                let route: RouteSpec = serde_json::from_slice(&payload)
                    .map_err(|e| PeerError::Other(e.to_string()))?;
                Request::RouteAdd { route }
            }
            MsgType::RouteRemove => {
                let r: RouteRef = serde_json::from_slice(&payload)
                    .map_err(|e| PeerError::Other(e.to_string()))?;
                Request::RouteRemove { id: r.id }
            }
            other => return Err(PeerError::Unsupported(other)),
        };
        let data = self.0.request(req, timeout).await?;
        let out = serde_json::to_vec(&data).map_err(|e| PeerError::Other(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    async fn send(&self, msg: MsgType, _payload: Bytes) -> Result<(), PeerError> {
        Err(PeerError::Unsupported(msg))
    }
}
