//! Listener shims backed by a concrete listener on a remote peer.
//!
//! The peer accepts the real connections and reports each one as a channel
//! tagged with the listener ID; Comm dispatch feeds those channels in here.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::burrow::comm::{
    conn::{Channel, CommConn, PacketConn},
    protocol::{ConnInfo, Handler, ProtocolError, Request, Transport},
    session::{Comm, CommError},
    transport::BoxedStream,
};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,
    #[error("remote listener start failed: {0}")]
    Start(#[source] CommError),
    #[error("peer did not open the carrying stream within {0:?}")]
    NoStream(Duration),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connection-oriented listener shim.
pub struct TcpListener {
    handler: Handler,
    comm: Arc<Comm>,
    tx: mpsc::Sender<Channel>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl TcpListener {
    /// Registers the listener, then asks the peer to bind `handler.lhost:lport`.
    /// The registry entry is removed again if the peer refuses.
    pub async fn start(
        comm: &Arc<Comm>,
        mut handler: Handler,
        timeout: Duration,
    ) -> Result<Arc<Self>, ListenerError> {
        handler.transport = Transport::Tcp;
        let (tx, rx) = mpsc::channel(comm.options().accept_backlog.max(1));
        let l = Arc::new(Self {
            handler: handler.clone(),
            comm: comm.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            token: comm.token().child_token(),
            closed: AtomicBool::new(false),
        });

        let registries = comm.registries();
        registries.tcp_listeners.add(handler.id.clone(), l.clone());
        if let Err(err) = comm.request(Request::HandlerStart { handler }, timeout).await {
            l.closed.store(true, Ordering::Release);
            registries
                .tcp_listeners
                .remove_if(&l.handler.id, |x| Arc::ptr_eq(x, &l));
            return Err(ListenerError::Start(err));
        }

        tracing::info!(
            comm = comm.id(),
            id = %l.handler.id,
            bind = %crate::burrow::net::join_host_port(&l.handler.lhost, l.handler.lport),
            "comm: tcp listener started"
        );
        Ok(l)
    }

    pub fn id(&self) -> &str {
        &self.handler.id
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn comm_id(&self) -> u32 {
        self.comm.id()
    }

    /// Next connection accepted by the remote listener.
    pub async fn accept(&self) -> Result<CommConn, ListenerError> {
        loop {
            let ch = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    _ = self.token.cancelled() => return Err(ListenerError::Closed),
                    ch = rx.recv() => ch.ok_or(ListenerError::Closed)?,
                }
            };
            match ch.accept().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    tracing::debug!(id = %self.handler.id, err = %err, "comm: dropped queued connection");
                }
            }
        }
    }

    /// Queues a channel reported by the peer.
    pub(crate) async fn push(&self, ch: Channel) {
        if self.closed.load(Ordering::Acquire) {
            ch.reject("listener closed").await;
            return;
        }
        match self.tx.try_send(ch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ch)) => {
                tracing::warn!(id = %self.handler.id, "comm: listener backlog full");
                ch.reject("backlog full").await;
            }
            Err(mpsc::error::TrySendError::Closed(ch)) => ch.reject("listener closed").await,
        }
    }

    /// Stops accepting, rejects queued connections, stops the remote listener
    /// (best-effort) and deregisters.
    pub async fn close(&self) {
        self.close_inner(true).await;
    }

    /// Like [`TcpListener::close`] without telling the peer.
    pub async fn close_local(&self) {
        self.close_inner(false).await;
    }

    async fn close_inner(&self, remote: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        {
            let mut rx = self.rx.lock().await;
            rx.close();
            while let Ok(ch) = rx.try_recv() {
                ch.reject("listener closed").await;
            }
        }

        if remote {
            let req = Request::HandlerStop {
                id: self.handler.id.clone(),
            };
            if let Err(err) = self.comm.request(req, self.comm.options().request_timeout).await {
                tracing::warn!(comm = self.comm.id(), id = %self.handler.id, err = %err, "comm: remote listener stop failed");
            }
        }

        self.comm
            .registries()
            .tcp_listeners
            .remove_if(&self.handler.id, |x| std::ptr::eq(Arc::as_ptr(x), self));
        tracing::info!(comm = self.comm.id(), id = %self.handler.id, "comm: tcp listener closed");
    }
}

type Carrier = (ConnInfo, BoxedStream, CancellationToken);

/// Packet-oriented listener shim over one shared carrying stream.
pub struct UdpListener {
    handler: Handler,
    comm: Arc<Comm>,
    waiter: Mutex<Option<oneshot::Sender<Carrier>>>,
    conn: OnceLock<PacketConn>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl UdpListener {
    /// Registers the listener, asks the peer to bind, then waits for the peer
    /// to dial back with the carrying stream.
    pub async fn start(
        comm: &Arc<Comm>,
        mut handler: Handler,
        timeout: Duration,
    ) -> Result<Arc<Self>, ListenerError> {
        handler.transport = Transport::Udp;
        let (tx, rx) = oneshot::channel();
        let l = Arc::new(Self {
            handler: handler.clone(),
            comm: comm.clone(),
            waiter: Mutex::new(Some(tx)),
            conn: OnceLock::new(),
            token: comm.token().child_token(),
            closed: AtomicBool::new(false),
        });

        let registries = comm.registries();
        registries.udp_listeners.add(handler.id.clone(), l.clone());

        let started = async {
            comm.request(Request::HandlerStart { handler }, timeout)
                .await
                .map_err(ListenerError::Start)?;
            let carrier = tokio::select! {
                _ = l.token.cancelled() => return Err(ListenerError::Closed),
                r = tokio::time::timeout(timeout, rx) => match r {
                    Ok(Ok(c)) => c,
                    Ok(Err(_)) => return Err(ListenerError::Closed),
                    Err(_) => return Err(ListenerError::NoStream(timeout)),
                },
            };
            Ok::<Carrier, ListenerError>(carrier)
        };

        match started.await {
            Ok((info, stream, token)) => {
                let _ = l.conn.set(PacketConn::new(stream, info, token));
            }
            Err(err) => {
                l.close_inner(!matches!(err, ListenerError::Start(_))).await;
                return Err(err);
            }
        }

        tracing::info!(
            comm = comm.id(),
            id = %l.handler.id,
            bind = %crate::burrow::net::join_host_port(&l.handler.lhost, l.handler.lport),
            "comm: udp listener started"
        );
        Ok(l)
    }

    pub fn id(&self) -> &str {
        &self.handler.id
    }

    pub fn comm_id(&self) -> u32 {
        self.comm.id()
    }

    /// Hands the carrying stream to the waiting creator.
    pub(crate) async fn attach(&self, ch: Channel) {
        let waiter = self.waiter.lock().ok().and_then(|mut w| w.take());
        let Some(tx) = waiter else {
            ch.reject("carrying stream already attached").await;
            return;
        };
        match ch.accept_stream().await {
            Ok(carrier) => {
                if tx.send(carrier).is_err() {
                    tracing::debug!(id = %self.handler.id, "comm: udp listener gave up before attach");
                }
            }
            Err(err) => {
                tracing::debug!(id = %self.handler.id, err = %err, "comm: carrying stream lost");
            }
        }
    }

    /// Reads one datagram and the address it came from on the peer side.
    pub async fn read_from(&self) -> Result<(SocketAddr, Vec<u8>), ListenerError> {
        let conn = self.conn.get().ok_or(ListenerError::Closed)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed);
        }
        Ok(conn.recv_from().await?)
    }

    pub async fn write_to(&self, addr: &SocketAddr, payload: &[u8]) -> Result<(), ListenerError> {
        let conn = self.conn.get().ok_or(ListenerError::Closed)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ListenerError::Closed);
        }
        Ok(conn.send_to(addr, payload).await?)
    }

    pub async fn close(&self) {
        self.close_inner(true).await;
    }

    pub async fn close_local(&self) {
        self.close_inner(false).await;
    }

    async fn close_inner(&self, remote: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        if let Ok(mut w) = self.waiter.lock() {
            w.take();
        }
        if let Some(conn) = self.conn.get() {
            conn.close().await;
        }

        if remote {
            let req = Request::HandlerStop {
                id: self.handler.id.clone(),
            };
            if let Err(err) = self.comm.request(req, self.comm.options().request_timeout).await {
                tracing::warn!(comm = self.comm.id(), id = %self.handler.id, err = %err, "comm: remote listener stop failed");
            }
        }

        self.comm
            .registries()
            .udp_listeners
            .remove_if(&self.handler.id, |x| std::ptr::eq(Arc::as_ptr(x), self));
        tracing::info!(comm = self.comm.id(), id = %self.handler.id, "comm: udp listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::comm::{
        protocol::{Direction, PeerKind},
        registry::Registries,
        session::tests::pair,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const T: Duration = Duration::from_secs(5);

    fn handler(id: &str, transport: Transport) -> Handler {
        Handler {
            id: id.into(),
            transport,
            direction: Direction::Reverse,
            lhost: "127.0.0.1".into(),
            lport: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tcp_listener_accepts_remote_connections() {
        let reg = Registries::new();
        let (comm, client) = pair(&reg, PeerKind::Agent, "a", vec![]).await;

        let l = TcpListener::start(&comm, handler("l1", Transport::Tcp), T)
            .await
            .unwrap();
        assert!(reg.tcp_listeners.get(&"l1".to_string()).is_some());

        let bound = client.handler_addr("l1").unwrap();
        let mut outside = tokio::net::TcpStream::connect(bound).await.unwrap();
        outside.write_all(b"knock").await.unwrap();

        let mut conn = tokio::time::timeout(T, l.accept()).await.unwrap().unwrap();
        assert_eq!(conn.remote_addr(), Some(outside.local_addr().unwrap()));
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"knock");
        conn.write_all(b"enter").await.unwrap();
        outside.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"enter");

        l.close().await;
        assert!(reg.tcp_listeners.get(&"l1".to_string()).is_none());
        assert!(matches!(l.accept().await, Err(ListenerError::Closed)));
        for _ in 0..50 {
            if client.handler_addr("l1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(client.handler_addr("l1").is_none());
    }

    #[tokio::test]
    async fn failed_remote_start_leaves_no_entry() {
        let reg = Registries::new();
        let (comm, _client) = pair(&reg, PeerKind::Agent, "a", vec![]).await;

        let mut h = handler("bad", Transport::Tcp);
        h.lhost = "not-an-ip".into();
        let err = TcpListener::start(&comm, h, T).await.err().unwrap();
        assert!(matches!(err, ListenerError::Start(_)));
        assert!(reg.tcp_listeners.is_empty());
    }

    #[tokio::test]
    async fn udp_listener_pairs_read_from_and_write_to() {
        let reg = Registries::new();
        let (comm, client) = pair(&reg, PeerKind::Agent, "a", vec![]).await;

        let l = UdpListener::start(&comm, handler("u1", Transport::Udp), T)
            .await
            .unwrap();
        let bound = client.handler_addr("u1").unwrap();

        let outside = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        outside.send_to(&[0, 0, 1], bound).await.unwrap();

        let (from, payload) = tokio::time::timeout(T, l.read_from()).await.unwrap().unwrap();
        assert_eq!(from, outside.local_addr().unwrap());
        assert_eq!(payload, vec![0, 0, 1]);

        l.write_to(&from, b"reply").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, src) = tokio::time::timeout(T, outside.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(src, bound);

        l.close().await;
        assert!(reg.udp_listeners.is_empty());
        assert!(l.read_from().await.is_err());
    }

    #[tokio::test]
    async fn comm_shutdown_closes_owned_listeners() {
        let reg = Registries::new();
        let (comm, _client) = pair(&reg, PeerKind::Agent, "a", vec![]).await;
        let l = TcpListener::start(&comm, handler("l2", Transport::Tcp), T)
            .await
            .unwrap();

        comm.shutdown().await;
        assert!(reg.tcp_listeners.is_empty());
        assert!(matches!(l.accept().await, Err(ListenerError::Closed)));
    }
}
