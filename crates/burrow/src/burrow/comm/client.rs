//! The remote end of a Comm, run by agents and consoles.
//!
//! The client dials the server, completes the handshake as TLS client,
//! announces itself on the bootstrap stream and then serves whatever the
//! server opens: channels to dial, listeners to bind, routes to record.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
    sync::{Mutex, watch},
};
use tokio_util::sync::CancellationToken;

use crate::burrow::{
    comm::{
        datagram,
        handshake::{self, Credentials},
        protocol::{
            self, Application, ConnInfo, Direction, Handler, Hello, PeerKind, Reply, Request, RouteSpec,
            StreamHeader, Transport,
        },
        registry::Registry,
        session::{self, CommError},
        splice::splice_tcp,
        transport::{BoxedStream, MuxSession},
    },
    net,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub name: String,
    pub kind: PeerKind,
    /// Interface networks announced to the server (`"10.0.0.2/24"`).
    pub interfaces: Vec<String>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            name: "burrow-agent".to_string(),
            kind: PeerKind::Agent,
            interfaces: Vec::new(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// A listener bound on this host on behalf of the server.
struct LocalHandler {
    handler: Handler,
    addr: SocketAddr,
    token: CancellationToken,
}

enum Bound {
    Tcp(tokio::net::TcpListener),
    Udp(UdpSocket),
}

pub struct CommClient {
    comm_id: u32,
    session_id: u32,
    server_fingerprint: String,
    mux: MuxSession,
    opts: ClientOptions,
    handlers: Registry<String, Arc<LocalHandler>>,
    routes: Registry<String, RouteSpec>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl CommClient {
    pub async fn connect(opts: ClientOptions, creds: &Credentials) -> Result<Arc<Self>, CommError> {
        let addr = opts.server_addr.trim().to_string();
        if addr.is_empty() {
            return Err(CommError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server address is required",
            )));
        }
        let tcp = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| CommError::Timeout(opts.dial_timeout))??;
        let _ = tcp.set_nodelay(true);
        Self::connect_stream(Box::new(tcp), opts, creds).await
    }

    /// Runs the client handshake and bootstrap over an established stream.
    pub async fn connect_stream(
        raw: BoxedStream,
        opts: ClientOptions,
        creds: &Credentials,
    ) -> Result<Arc<Self>, CommError> {
        let (secured, server_fingerprint) =
            handshake::connect(raw, creds, opts.handshake_timeout).await?;
        let mux = MuxSession::client(secured);

        let hello = Hello {
            name: opts.name.clone(),
            kind: opts.kind,
            interfaces: opts.interfaces.clone(),
        };
        let bootstrap = async {
            let mut st = mux.open_stream().await?;
            protocol::write_hello(&mut st, &hello).await?;
            let reply = protocol::read_reply(&mut st).await?;
            let _ = st.shutdown().await;
            Ok::<Reply, CommError>(reply)
        };
        let reply = tokio::time::timeout(opts.handshake_timeout, bootstrap)
            .await
            .map_err(|_| CommError::Timeout(opts.handshake_timeout))??;
        if !reply.ok {
            return Err(CommError::Remote(reply.error));
        }
        let field = |k: &str| {
            reply
                .data
                .get(k)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or_default() as u32
        };

        let client = Arc::new(Self {
            comm_id: field("comm_id"),
            session_id: field("session_id"),
            server_fingerprint,
            mux,
            opts,
            handlers: Registry::default(),
            routes: Registry::default(),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        tracing::info!(
            comm = client.comm_id,
            session = client.session_id,
            name = %client.opts.name,
            server = %client.server_fingerprint,
            "comm: connected to server"
        );
        tokio::spawn(client.clone().serve());
        Ok(client)
    }

    /// The Comm ID the server assigned to this session.
    pub fn comm_id(&self) -> u32 {
        self.comm_id
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn server_fingerprint(&self) -> &str {
        &self.server_fingerprint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session is gone.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Bound address of a handler started by the server.
    pub fn handler_addr(&self, id: &str) -> Option<SocketAddr> {
        self.handlers.get(&id.to_string()).map(|h| h.addr)
    }

    /// Routes the server installed on this peer.
    pub fn routes(&self) -> Vec<RouteSpec> {
        let mut out = self.routes.all();
        out.sort_by(|a, b| a.network.cmp(&b.network));
        out
    }

    pub async fn request(&self, req: Request, timeout: Duration) -> Result<serde_json::Value, CommError> {
        if self.is_closed() {
            return Err(CommError::Closed);
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(CommError::Closed),
            r = session::call(&self.mux, &req, timeout) => r,
        }
    }

    pub async fn open_channel(&self, info: &ConnInfo) -> Result<BoxedStream, CommError> {
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
            r = session::open_channel(&self.mux, info, timeout) => r,
        }
    }

    /// Opens a port forward through the server (consoles only).
    ///
    /// Direct forwards bind here first, so a bind failure never reaches the
    /// server; the local side starts serving once the server accepted.
    pub async fn open_portfwd(self: &Arc<Self>, handler: Handler, session_id: u32) -> Result<(), CommError> {
        let req = Request::PortfwdOpen {
            handler: handler.clone(),
            session_id,
        };
        if handler.direction == Direction::Reverse {
            self.request(req, self.opts.request_timeout).await?;
            return Ok(());
        }
        let (bound, addr) = bind(&handler).await?;
        self.request(req, self.opts.request_timeout).await?;
        self.serve_bound(handler, bound, addr);
        Ok(())
    }

    pub async fn close_portfwd(&self, id: &str, close_conns: bool) -> Result<(), CommError> {
        let req = Request::PortfwdClose {
            id: id.to_string(),
            close_conns,
        };
        let res = self.request(req, self.opts.request_timeout).await;
        self.stop_handler(id);
        res.map(|_| ())
    }

    /// Asks the server to route `network` through an agent (consoles only).
    pub async fn add_route(&self, network: &str, gateway: Option<u32>) -> Result<RouteSpec, CommError> {
        let req = Request::RouteCreate {
            network: network.to_string(),
            gateway,
        };
        let data = self.request(req, self.opts.request_timeout).await?;
        serde_json::from_value(data).map_err(|e| CommError::Protocol(e.into()))
    }

    pub async fn remove_route(&self, id: &str, close_conns: bool) -> Result<(), CommError> {
        let req = Request::RouteDelete {
            id: id.to_string(),
            close_conns,
        };
        self.request(req, self.opts.request_timeout).await.map(|_| ())
    }

    /// Every active route, or only the one `addr` resolves through.
    pub async fn list_routes(&self, addr: Option<&str>) -> Result<Vec<RouteSpec>, CommError> {
        let req = Request::RouteList {
            addr: addr.map(str::to_string),
        };
        let data = self.request(req, self.opts.request_timeout).await?;
        serde_json::from_value(data).map_err(|e| CommError::Protocol(e.into()))
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        for id in self.handlers.keys() {
            self.stop_handler(&id);
        }
        self.mux.close().await;
        tracing::info!(comm = self.comm_id, "comm: client closed");
    }

    async fn serve(self: Arc<Self>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                st = self.mux.accept_stream() => st,
            };
            let Some(mut stream) = next else {
                tracing::info!(comm = self.comm_id, "comm: server closed the session");
                break;
            };
            let client = self.clone();
            tokio::spawn(async move {
                let header = tokio::time::timeout(
                    client.opts.handshake_timeout,
                    protocol::read_header(&mut stream),
                )
                .await;
                match header {
                    Ok(Ok(StreamHeader::Channel(info))) => client.handle_channel(info, stream).await,
                    Ok(Ok(StreamHeader::Request(req))) => {
                        let kind = req.kind();
                        let reply = client.answer(req).await;
                        if let Err(err) = protocol::write_reply(&mut stream, &reply).await {
                            tracing::debug!(kind, err = %err, "comm: reply not delivered");
                        }
                        let _ = stream.shutdown().await;
                    }
                    Ok(Err(err)) => tracing::debug!(err = %err, "comm: bad stream header"),
                    Err(_) => tracing::debug!("comm: stream header timed out"),
                }
            });
        }
        self.close().await;
    }

    async fn answer(self: &Arc<Self>, req: Request) -> Reply {
        match req {
            Request::Keepalive | Request::Latency => Reply::ok(),
            Request::HandlerStart { handler } => match self.start_handler(handler).await {
                Ok(addr) => Reply::with_data(serde_json::json!({ "addr": addr.to_string() })),
                Err(err) => Reply::err(err.to_string()),
            },
            Request::HandlerStop { id } | Request::HandlerClosed { id } => {
                self.stop_handler(&id);
                Reply::ok()
            }
            Request::RouteAdd { route } => {
                tracing::info!(route = %route.id, network = %route.network, next = ?route.nodes.first(), "route: installed");
                self.routes.add(route.id.clone(), route);
                Reply::ok()
            }
            Request::RouteRemove { id } => {
                if self.routes.remove(&id).is_some() {
                    tracing::info!(route = %id, "route: uninstalled");
                }
                Reply::ok()
            }
            other => Reply::err(format!("unsupported request {}", other.kind())),
        }
    }

    async fn start_handler(self: &Arc<Self>, handler: Handler) -> Result<SocketAddr, CommError> {
        if self.handlers.contains(&handler.id) {
            return Err(CommError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("handler {:?} already running", handler.id),
            )));
        }
        let (bound, addr) = bind(&handler).await?;
        self.serve_bound(handler, bound, addr);
        Ok(addr)
    }

    fn serve_bound(self: &Arc<Self>, handler: Handler, bound: Bound, addr: SocketAddr) {
        let local = Arc::new(LocalHandler {
            handler,
            addr,
            token: self.token.child_token(),
        });
        if let Some(old) = self.handlers.add(local.handler.id.clone(), local.clone()) {
            old.token.cancel();
        }
        tracing::info!(
            id = %local.handler.id,
            transport = %local.handler.transport,
            addr = %addr,
            "comm: handler started"
        );
        match bound {
            Bound::Tcp(l) => {
                tokio::spawn(self.clone().serve_tcp(local, l));
            }
            Bound::Udp(s) => {
                tokio::spawn(self.clone().serve_udp(local, s));
            }
        }
    }

    fn stop_handler(&self, id: &str) {
        if let Some(h) = self.handlers.remove(&id.to_string()) {
            h.token.cancel();
            tracing::info!(id = %id, "comm: handler stopped");
        }
    }

    fn forget_handler(&self, local: &Arc<LocalHandler>) {
        self.handlers
            .remove_if(&local.handler.id, |x| Arc::ptr_eq(x, local));
    }

    /// Reports every accepted connection to the server as a channel.
    async fn serve_tcp(self: Arc<Self>, local: Arc<LocalHandler>, listener: tokio::net::TcpListener) {
        loop {
            let (conn, src) = tokio::select! {
                _ = local.token.cancelled() => break,
                r = listener.accept() => match r {
                    Ok(x) => x,
                    Err(err) => {
                        tracing::warn!(id = %local.handler.id, err = %err, "comm: accept failed");
                        continue;
                    }
                },
            };
            let info = ConnInfo {
                id: local.handler.id.clone(),
                transport: Transport::Tcp,
                application: local.handler.application,
                lhost: local.addr.ip().to_string(),
                lport: local.addr.port(),
                rhost: src.ip().to_string(),
                rport: src.port(),
                timeout_ms: self.opts.dial_timeout.as_millis() as u64,
            };
            let client = self.clone();
            let token = local.token.child_token();
            tokio::spawn(async move {
                match client.open_channel(&info).await {
                    Ok(stream) => splice_tcp(conn, stream, token).await,
                    Err(err) => {
                        tracing::debug!(id = %info.id, src = %src, err = %err, "comm: connection refused by server");
                    }
                }
            });
        }
        self.forget_handler(&local);
    }

    /// Relays a bound UDP socket over one carrying channel.
    async fn serve_udp(self: Arc<Self>, local: Arc<LocalHandler>, socket: UdpSocket) {
        let info = ConnInfo {
            id: local.handler.id.clone(),
            transport: Transport::Udp,
            application: local.handler.application,
            lhost: local.addr.ip().to_string(),
            lport: local.addr.port(),
            timeout_ms: self.opts.dial_timeout.as_millis() as u64,
            ..Default::default()
        };
        let stream = match self.open_channel(&info).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(id = %info.id, err = %err, "comm: carrying stream refused");
                self.forget_handler(&local);
                return;
            }
        };

        let (mut rd, mut wr) = tokio::io::split(stream);
        let stop = local.token.child_token();
        let inbound = async {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, src) = tokio::select! {
                    _ = stop.cancelled() => break,
                    r = socket.recv_from(&mut buf) => match r {
                        Ok(x) => x,
                        Err(err) => {
                            tracing::debug!(id = %info.id, err = %err, "comm: udp receive failed");
                            break;
                        }
                    },
                };
                if datagram::write_packet(&mut wr, &src, &buf[..n]).await.is_err() {
                    break;
                }
            }
            stop.cancel();
            let _ = wr.shutdown().await;
        };
        let outbound = async {
            loop {
                let pkt = tokio::select! {
                    _ = stop.cancelled() => break,
                    p = datagram::read_packet(&mut rd) => p,
                };
                match pkt {
                    Ok(p) => {
                        if let Err(err) = socket.send_to(&p.payload, p.addr).await {
                            tracing::debug!(id = %info.id, to = %p.addr, err = %err, "comm: udp send failed");
                        }
                    }
                    Err(err) if err.is_transient() => continue,
                    Err(_) => break,
                }
            }
            stop.cancel();
        };
        tokio::join!(inbound, outbound);
        self.forget_handler(&local);
    }

    /// Serves a channel the server opened: dial its target and relay.
    async fn handle_channel(self: Arc<Self>, info: ConnInfo, mut stream: BoxedStream) {
        let timeout = if info.timeout_ms > 0 {
            Duration::from_millis(info.timeout_ms)
        } else {
            self.opts.dial_timeout
        };
        let token = self.token.child_token();
        // The application protocol takes precedence over the transport.
        if info.application == Application::NamedPipe {
            return dial_named_pipe(&info, stream, token).await;
        }
        if info.rport == 0 || info.rhost.trim().is_empty() {
            reject(stream, &info, "missing target address").await;
            return;
        }
        let target = net::join_host_port(&info.rhost, info.rport);

        match info.transport {
            Transport::Tcp => {
                let dialed = tokio::time::timeout(timeout, TcpStream::connect(target.as_str())).await;
                let tcp = match dialed {
                    Ok(Ok(s)) => s,
                    Ok(Err(err)) => return reject(stream, &info, &err.to_string()).await,
                    Err(_) => return reject(stream, &info, "dial timed out").await,
                };
                let _ = tcp.set_nodelay(true);
                if protocol::write_status(&mut stream, None).await.is_err() {
                    return;
                }
                tracing::debug!(id = %info.id, target = %target, "comm: channel connected");
                splice_tcp(stream, tcp, token).await;
            }
            Transport::Udp => {
                let addr = match net::resolve_socket_addr(&target).await {
                    Ok(a) => a,
                    Err(err) => return reject(stream, &info, &err.to_string()).await,
                };
                if protocol::write_status(&mut stream, None).await.is_err() {
                    return;
                }
                relay_to_target(stream, addr, token).await;
            }
        }
    }
}

/// Connects a named-pipe channel. `rhost` carries the full pipe path
/// (`\\host\pipe\name`); the port is unused.
#[cfg(windows)]
async fn dial_named_pipe(info: &ConnInfo, mut stream: BoxedStream, token: CancellationToken) {
    use tokio::net::windows::named_pipe::ClientOptions;

    let path = info.rhost.trim();
    if path.is_empty() {
        return reject(stream, info, "missing pipe path").await;
    }
    let pipe = match ClientOptions::new().open(path) {
        Ok(p) => p,
        Err(err) => return reject(stream, info, &err.to_string()).await,
    };
    if protocol::write_status(&mut stream, None).await.is_err() {
        return;
    }
    tracing::debug!(id = %info.id, pipe = %path, "comm: named pipe connected");
    splice_tcp(stream, pipe, token).await;
}

#[cfg(not(windows))]
async fn dial_named_pipe(info: &ConnInfo, stream: BoxedStream, _token: CancellationToken) {
    reject(stream, info, NAMED_PIPE_UNSUPPORTED).await;
}

#[cfg(not(windows))]
const NAMED_PIPE_UNSUPPORTED: &str = "named pipes are not supported on this host";

async fn reject(mut stream: BoxedStream, info: &ConnInfo, reason: &str) {
    tracing::debug!(id = %info.id, target = %net::join_host_port(&info.rhost, info.rport), reason, "comm: channel rejected");
    let _ = protocol::write_status(&mut stream, Some(reason)).await;
    let _ = stream.shutdown().await;
}

/// Binds the local side of `handler`. Only literal IP hosts are accepted.
async fn bind(handler: &Handler) -> Result<(Bound, SocketAddr), CommError> {
    let host = match handler.lhost.trim() {
        "" => "0.0.0.0",
        h => h,
    };
    let addr = net::socket_addr(host, handler.lport).ok_or_else(|| {
        CommError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bind host {:?} is not an IP address", handler.lhost),
        ))
    })?;
    match handler.transport {
        Transport::Tcp => {
            let l = tokio::net::TcpListener::bind(addr).await?;
            let local = l.local_addr()?;
            Ok((Bound::Tcp(l), local))
        }
        Transport::Udp => {
            let s = UdpSocket::bind(addr).await?;
            let local = s.local_addr()?;
            Ok((Bound::Udp(s), local))
        }
    }
}

type SharedWriter = Arc<Mutex<tokio::io::WriteHalf<BoxedStream>>>;

/// Relays a UDP channel to one target with a socket per originating address,
/// so replies find their way back to the right source.
async fn relay_to_target(stream: BoxedStream, target: SocketAddr, token: CancellationToken) {
    let (mut rd, wr) = tokio::io::split(stream);
    let wr: SharedWriter = Arc::new(Mutex::new(wr));
    let mut sockets: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();

    loop {
        let pkt = tokio::select! {
            _ = token.cancelled() => break,
            p = datagram::read_packet(&mut rd) => p,
        };
        let pkt = match pkt {
            Ok(p) => p,
            Err(err) if err.is_transient() => continue,
            Err(_) => break,
        };
        let socket = match sockets.get(&pkt.addr) {
            Some(s) => s.clone(),
            None => match connected_socket(target).await {
                Ok(s) => {
                    let s = Arc::new(s);
                    sockets.insert(pkt.addr, s.clone());
                    tokio::spawn(pump_replies(s.clone(), pkt.addr, wr.clone(), token.clone()));
                    s
                }
                Err(err) => {
                    tracing::debug!(target = %target, err = %err, "comm: udp socket setup failed");
                    continue;
                }
            },
        };
        if let Err(err) = socket.send(&pkt.payload).await {
            tracing::debug!(target = %target, err = %err, "comm: udp send failed");
        }
    }

    token.cancel();
    let _ = wr.lock().await.shutdown().await;
}

async fn connected_socket(target: SocketAddr) -> io::Result<UdpSocket> {
    let bind: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let s = UdpSocket::bind(bind).await?;
    s.connect(target).await?;
    Ok(s)
}

async fn pump_replies(
    socket: Arc<UdpSocket>,
    key: SocketAddr,
    wr: SharedWriter,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => break,
            r = socket.recv(&mut buf) => match r {
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(src = %key, err = %err, "comm: udp reply receive failed");
                    break;
                }
            },
        };
        let mut w = wr.lock().await;
        if datagram::write_packet(&mut *w, &key, &buf[..n]).await.is_err() {
            break;
        }
    }
}

/// Keeps an agent connected, reconnecting with backoff until `shutdown` fires.
pub async fn run(
    opts: ClientOptions,
    creds: Credentials,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if opts.server_addr.trim().is_empty() {
        anyhow::bail!("comm: agent server_addr is required");
    }

    let mut backoff = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match run_once(&opts, &creds, shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(
                    server = %opts.server_addr,
                    err = %err,
                    backoff = %humantime::format_duration(backoff),
                    "comm: disconnected; retrying"
                );
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }

        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

async fn run_once(
    opts: &ClientOptions,
    creds: &Credentials,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = CommClient::connect(opts.clone(), creds).await?;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    client.close().await;
                    return Ok(());
                }
            }
            _ = client.closed() => anyhow::bail!("comm: session closed by server"),
        }
    }
}
