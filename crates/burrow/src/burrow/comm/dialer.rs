//! Outbound connections and listeners for in-process callers.
//!
//! Destinations inside a routed network go through the route's Comm; anything
//! else is dialed from this host.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpSocket, TcpStream, UdpSocket},
};
use uuid::Uuid;

use crate::burrow::{
    comm::{
        conn::{CommConn, PacketConn},
        listener::{ListenerError, TcpListener, UdpListener},
        protocol::{ConnInfo, Direction, Handler, Transport},
        registry::Registries,
        route::RouteError,
        session::CommError,
    },
    net,
};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("route: {0}")]
    Route(#[from] RouteError),
    #[error("route {0} has no connected comm")]
    RouteDown(Uuid),
    #[error("comm: {0}")]
    Comm(#[from] CommError),
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("no comm for session {0}")]
    NoSession(u32),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A stream dialed either through a Comm or from this host.
pub enum Connection {
    Routed(CommConn),
    Direct(TcpStream),
}

impl Connection {
    pub fn is_routed(&self) -> bool {
        matches!(self, Connection::Routed(_))
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Routed(c) => Pin::new(c).poll_read(cx, buf),
            Connection::Direct(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Routed(c) => Pin::new(c).poll_write(cx, buf),
            Connection::Direct(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Routed(c) => Pin::new(c).poll_flush(cx),
            Connection::Direct(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Routed(c) => Pin::new(c).poll_shutdown(cx),
            Connection::Direct(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub enum PacketConnection {
    Routed(PacketConn),
    /// A local socket connected to the destination.
    Direct(UdpSocket),
}

impl PacketConnection {
    pub async fn send(&self, payload: &[u8]) -> Result<(), DialError> {
        match self {
            PacketConnection::Routed(c) => c
                .send(payload)
                .await
                .map_err(|e| DialError::Comm(CommError::Protocol(e))),
            PacketConnection::Direct(s) => s.send(payload).await.map(|_| ()).map_err(Into::into),
        }
    }

    pub async fn recv(&self) -> Result<Vec<u8>, DialError> {
        match self {
            PacketConnection::Routed(c) => c
                .recv_from()
                .await
                .map(|(_, p)| p)
                .map_err(|e| DialError::Comm(CommError::Protocol(e))),
            PacketConnection::Direct(s) => {
                let mut buf = vec![0u8; 64 * 1024];
                let n = s.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

pub struct Dialer {
    registries: Arc<Registries>,
    timeout: Duration,
}

impl Dialer {
    pub fn new(registries: Arc<Registries>, timeout: Duration) -> Self {
        Self {
            registries,
            timeout,
        }
    }

    fn conn_info(&self, transport: Transport, target: SocketAddr) -> ConnInfo {
        ConnInfo {
            id: Uuid::new_v4().to_string(),
            transport,
            rhost: target.ip().to_string(),
            rport: target.port(),
            timeout_ms: self.timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Connects to `addr` (`ip:port`, or `host:port` for unrouted targets).
    pub async fn dial(&self, addr: &str) -> Result<Connection, DialError> {
        let target = net::resolve_socket_addr(addr)
            .await
            .map_err(|_| DialError::InvalidAddress(addr.to_string()))?;

        if let Some(route) = self.registries.routes.resolve(target.ip()).await {
            let comm = route.comm().ok_or(DialError::RouteDown(route.id))?;
            tracing::debug!(route = %route.id, comm = comm.id(), target = %target, "route: dialing through comm");
            let conn = comm
                .dial_scoped(self.conn_info(Transport::Tcp, target), route.token().child_token())
                .await?;
            return Ok(Connection::Routed(conn));
        }

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = tokio::time::timeout(self.timeout, socket.connect(target))
            .await
            .map_err(|_| DialError::Timeout(self.timeout))??;
        Ok(Connection::Direct(stream))
    }

    pub async fn dial_packet(&self, addr: &str) -> Result<PacketConnection, DialError> {
        let target = net::resolve_socket_addr(addr)
            .await
            .map_err(|_| DialError::InvalidAddress(addr.to_string()))?;

        if let Some(route) = self.registries.routes.resolve(target.ip()).await {
            let comm = route.comm().ok_or(DialError::RouteDown(route.id))?;
            let conn = comm
                .dial_packet(self.conn_info(Transport::Udp, target), route.token().child_token())
                .await?;
            return Ok(PacketConnection::Routed(conn));
        }

        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(PacketConnection::Direct(socket))
    }

    fn reverse_handler(&self, transport: Transport, bind: &str) -> Result<Handler, DialError> {
        let (lhost, lport) =
            net::split_host_port(bind).ok_or_else(|| DialError::InvalidAddress(bind.to_string()))?;
        Ok(Handler {
            id: Uuid::new_v4().to_string(),
            transport,
            direction: Direction::Reverse,
            lhost,
            lport,
            ..Default::default()
        })
    }

    /// Listens on `bind` on the agent behind `session_id`.
    pub async fn listen(&self, session_id: u32, bind: &str) -> Result<Arc<TcpListener>, DialError> {
        let comm = self
            .registries
            .comm_by_session(session_id)
            .ok_or(DialError::NoSession(session_id))?;
        let handler = self.reverse_handler(Transport::Tcp, bind)?;
        Ok(TcpListener::start(&comm, handler, self.timeout).await?)
    }

    pub async fn listen_packet(
        &self,
        session_id: u32,
        bind: &str,
    ) -> Result<Arc<UdpListener>, DialError> {
        let comm = self
            .registries
            .comm_by_session(session_id)
            .ok_or(DialError::NoSession(session_id))?;
        let handler = self.reverse_handler(Transport::Udp, bind)?;
        Ok(UdpListener::start(&comm, handler, self.timeout).await?)
    }
}
