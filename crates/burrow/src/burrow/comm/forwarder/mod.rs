//! Console-initiated port forwards, independent of route resolution.
//!
//! One trait, four variants over transport × direction. A forward is bound to
//! two Comms: the console (`client`) and the agent (`peer`).

mod direct;
mod reverse;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::burrow::comm::{
    conn::Channel,
    protocol::{ConnInfo, Direction, Handler, Request, Transport},
    registry::Registries,
    session::{Comm, CommError},
};

pub use direct::{DirectTcp, DirectUdp};
pub use reverse::{ReverseTcp, ReverseUdp};

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("port forward {0:?} already exists")]
    Exists(String),
    #[error("port forward {0:?} not found")]
    NotFound(String),
    #[error("invalid port forward: {0}")]
    Invalid(String),
    #[error("start failed: {0}")]
    Start(#[source] CommError),
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    fn info(&self) -> &Handler;

    /// `(client comm id, peer comm id)`.
    fn comms(&self) -> (u32, u32);

    async fn start(&self) -> Result<(), ForwarderError>;

    /// Serves one inbound channel; returns when the relay ends.
    async fn handle(&self, channel: Channel);

    async fn close(&self, close_conns: bool);

    /// Tells the console its forward is gone because the peer went away.
    async fn notify_close(&self);
}

/// State shared by all variants.
pub(crate) struct Binding {
    pub handler: Handler,
    pub client: Arc<Comm>,
    pub peer: Arc<Comm>,
    pub token: CancellationToken,
}

impl Binding {
    fn new(handler: Handler, client: Arc<Comm>, peer: Arc<Comm>) -> Self {
        Self {
            handler,
            client,
            peer,
            token: CancellationToken::new(),
        }
    }

    pub fn comms(&self) -> (u32, u32) {
        (self.client.id(), self.peer.id())
    }

    /// Channel metadata for the dialing side. `origin` is the accepted-connection
    /// report, whose remote end becomes the originating address.
    pub fn dial_info(&self, origin: &ConnInfo, via: &Comm) -> ConnInfo {
        let mut info = self
            .handler
            .dial_info(via.options().dial_timeout.as_millis() as u64);
        info.lhost = origin.rhost.clone();
        info.lport = origin.rport;
        info
    }

    pub fn close_conns(&self, close_conns: bool) {
        if close_conns {
            self.token.cancel();
        }
    }

    pub async fn notify_client(&self) {
        let req = Request::HandlerClosed {
            id: self.handler.id.clone(),
        };
        if let Err(err) = self
            .client
            .request(req, self.client.options().request_timeout)
            .await
        {
            tracing::warn!(id = %self.handler.id, comm = self.client.id(), err = %err, "portfwd: console notification failed");
        }
    }

    pub async fn start_remote(&self) -> Result<(), ForwarderError> {
        let req = Request::HandlerStart {
            handler: self.handler.clone(),
        };
        self.peer
            .request(req, self.peer.options().request_timeout)
            .await
            .map(|_| ())
            .map_err(ForwarderError::Start)
    }

    pub async fn stop_remote(&self) {
        let req = Request::HandlerStop {
            id: self.handler.id.clone(),
        };
        if let Err(err) = self
            .peer
            .request(req, self.peer.options().request_timeout)
            .await
        {
            tracing::warn!(id = %self.handler.id, comm = self.peer.id(), err = %err, "portfwd: remote stop failed");
        }
    }
}

fn build(handler: Handler, client: Arc<Comm>, peer: Arc<Comm>) -> Arc<dyn Forwarder> {
    let b = Binding::new(handler, client, peer);
    match (b.handler.transport, b.handler.direction) {
        (Transport::Tcp, Direction::Direct) => Arc::new(DirectTcp::new(b)),
        (Transport::Udp, Direction::Direct) => Arc::new(DirectUdp::new(b)),
        (Transport::Tcp, Direction::Reverse) => Arc::new(ReverseTcp::new(b)),
        (Transport::Udp, Direction::Reverse) => Arc::new(ReverseUdp::new(b)),
    }
}

fn validate(h: &Handler) -> Result<(), ForwarderError> {
    if h.id.trim().is_empty() {
        return Err(ForwarderError::Invalid("empty handler id".into()));
    }
    if h.rport == 0 {
        return Err(ForwarderError::Invalid("remote port is required".into()));
    }
    if h.direction == Direction::Reverse && h.lport == 0 {
        return Err(ForwarderError::Invalid(
            "reverse forwards need a bind port".into(),
        ));
    }
    Ok(())
}

/// Creates, registers and starts a forward. On start failure the entry is removed.
pub async fn open(
    registries: &Arc<Registries>,
    handler: Handler,
    client: Arc<Comm>,
    peer: Arc<Comm>,
) -> Result<Arc<dyn Forwarder>, ForwarderError> {
    validate(&handler)?;
    let id = handler.id.clone();
    let fw = build(handler, client, peer);
    if registries.forwarders.try_add(id.clone(), fw.clone()).is_err() {
        return Err(ForwarderError::Exists(id));
    }
    if let Err(err) = fw.start().await {
        registries
            .forwarders
            .remove_if(&id, |x| Arc::ptr_eq(x, &fw));
        tracing::warn!(id = %id, err = %err, "portfwd: start failed");
        return Err(err);
    }

    metrics::gauge!("burrow_forwarders_active").increment(1.0);
    let h = fw.info();
    let (client, peer) = fw.comms();
    tracing::info!(
        id = %id,
        transport = %h.transport,
        direction = ?h.direction,
        client,
        peer,
        "portfwd: opened"
    );
    Ok(fw)
}

pub async fn close(
    registries: &Registries,
    id: &str,
    close_conns: bool,
) -> Result<(), ForwarderError> {
    let fw = registries
        .forwarders
        .remove(&id.to_string())
        .ok_or_else(|| ForwarderError::NotFound(id.to_string()))?;
    fw.close(close_conns).await;
    metrics::gauge!("burrow_forwarders_active").decrement(1.0);
    tracing::info!(id = %id, "portfwd: closed");
    Ok(())
}

/// Teardown driven by a Comm going away.
pub(crate) async fn release(registries: &Registries, fw: &Arc<dyn Forwarder>, peer_gone: bool) {
    let id = fw.info().id.clone();
    if registries
        .forwarders
        .remove_if(&id, |x| Arc::ptr_eq(x, fw))
        .is_none()
    {
        return;
    }
    if peer_gone {
        fw.notify_close().await;
    }
    fw.close(true).await;
    metrics::gauge!("burrow_forwarders_active").decrement(1.0);
    tracing::info!(id = %id, peer_gone, "portfwd: released");
}

pub fn list(registries: &Registries) -> Vec<Handler> {
    let mut out: Vec<Handler> = registries
        .forwarders
        .all()
        .iter()
        .map(|f| f.info().clone())
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::burrow::comm::{protocol::PeerKind, session::tests::pair};

    const T: Duration = Duration::from_secs(5);

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..100 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f(), "condition not reached");
    }

    #[tokio::test]
    async fn direct_tcp_forward_relays_console_connections() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taddr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"ack").await.unwrap();
        });

        let reg = Registries::new();
        let (agent, _agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (console, console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "fwd1".into(),
            transport: Transport::Tcp,
            direction: Direction::Direct,
            lhost: "127.0.0.1".into(),
            lport: 0,
            rhost: taddr.ip().to_string(),
            rport: taddr.port(),
            ..Default::default()
        };
        console_client
            .open_portfwd(h, agent.session_id())
            .await
            .unwrap();
        assert_eq!(list(&reg).len(), 1);
        assert_eq!(reg.forwarders.get(&"fwd1".to_string()).unwrap().comms(), (console.id(), agent.id()));

        let local = console_client.handler_addr("fwd1").unwrap();
        let mut s = tokio::net::TcpStream::connect(local).await.unwrap();
        s.write_all(b"syn").await.unwrap();
        let mut buf = [0u8; 3];
        tokio::time::timeout(T, s.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ack");

        console_client.close_portfwd("fwd1", true).await.unwrap();
        assert!(list(&reg).is_empty());
        assert!(console_client.handler_addr("fwd1").is_none());
    }

    #[tokio::test]
    async fn reverse_tcp_forward_dials_from_the_console() {
        let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taddr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            s.write_all(b"console-side").await.unwrap();
        });

        // Find a free port for the agent-side bind.
        let spare = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind_port = spare.local_addr().unwrap().port();
        drop(spare);

        let reg = Registries::new();
        let (agent, agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (_console, console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "rev1".into(),
            transport: Transport::Tcp,
            direction: Direction::Reverse,
            lhost: "127.0.0.1".into(),
            lport: bind_port,
            rhost: taddr.ip().to_string(),
            rport: taddr.port(),
            ..Default::default()
        };
        console_client
            .open_portfwd(h, agent.session_id())
            .await
            .unwrap();
        let bound = agent_client.handler_addr("rev1").unwrap();

        let mut s = tokio::net::TcpStream::connect(bound).await.unwrap();
        let mut buf = [0u8; 12];
        tokio::time::timeout(T, s.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"console-side");

        close(&reg, "rev1", true).await.unwrap();
        wait_for(|| agent_client.handler_addr("rev1").is_none()).await;
    }

    #[tokio::test]
    async fn failed_start_leaves_no_registry_entry() {
        let reg = Registries::new();
        let (agent, _agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (console, _console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        // The agent cannot bind a non-literal address.
        let h = Handler {
            id: "rev-bad".into(),
            transport: Transport::Tcp,
            direction: Direction::Reverse,
            lhost: "nowhere".into(),
            lport: 9,
            rhost: "127.0.0.1".into(),
            rport: 9,
            ..Default::default()
        };
        let err = open(&reg, h, console.clone(), agent.clone()).await.err().unwrap();
        assert!(matches!(err, ForwarderError::Start(_)));
        assert!(reg.forwarders.is_empty());

        let dup = Handler {
            id: "d".into(),
            rhost: "127.0.0.1".into(),
            rport: 9,
            ..Default::default()
        };
        open(&reg, dup.clone(), console.clone(), agent.clone()).await.unwrap();
        assert!(matches!(
            open(&reg, dup, console, agent).await,
            Err(ForwarderError::Exists(_))
        ));
    }

    #[tokio::test]
    async fn peer_disconnect_notifies_the_console() {
        let reg = Registries::new();
        let (agent, _agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (_console, console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "fwd-gone".into(),
            transport: Transport::Tcp,
            direction: Direction::Direct,
            lhost: "127.0.0.1".into(),
            rhost: "127.0.0.1".into(),
            rport: 9,
            ..Default::default()
        };
        console_client
            .open_portfwd(h, agent.session_id())
            .await
            .unwrap();
        assert!(console_client.handler_addr("fwd-gone").is_some());

        agent.shutdown().await;
        assert!(reg.forwarders.is_empty());
        wait_for(|| console_client.handler_addr("fwd-gone").is_none()).await;
    }

    #[tokio::test]
    async fn direct_udp_forward_relays_datagrams() {
        let target = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taddr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = target.recv_from(&mut buf).await.unwrap();
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            target.send_to(&reply, from).await.unwrap();
        });

        let reg = Registries::new();
        let (agent, _agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (_console, console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "dns".into(),
            transport: Transport::Udp,
            direction: Direction::Direct,
            lhost: "127.0.0.1".into(),
            rhost: taddr.ip().to_string(),
            rport: taddr.port(),
            ..Default::default()
        };
        console_client
            .open_portfwd(h, agent.session_id())
            .await
            .unwrap();
        let local = console_client.handler_addr("dns").unwrap();

        let app = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        // The carrying channel is set up asynchronously; resend until it answers.
        let n = loop {
            app.send_to(b"q", local).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(300), app.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => break n,
                _ => continue,
            }
        };
        assert_eq!(&buf[..n], b"re:q");
    }

    #[tokio::test]
    async fn reverse_udp_forward_answers_from_the_console() {
        let target = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let taddr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((n, from)) = target.recv_from(&mut buf).await else {
                    return;
                };
                let mut reply = b"re:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = target.send_to(&reply, from).await;
            }
        });

        // Find a free port for the agent-side bind.
        let spare = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bind_port = spare.local_addr().unwrap().port();
        drop(spare);

        let reg = Registries::new();
        let (agent, agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (console, console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "rev-udp".into(),
            transport: Transport::Udp,
            direction: Direction::Reverse,
            lhost: "127.0.0.1".into(),
            lport: bind_port,
            rhost: taddr.ip().to_string(),
            rport: taddr.port(),
            ..Default::default()
        };
        console_client
            .open_portfwd(h, agent.session_id())
            .await
            .unwrap();
        assert_eq!(
            reg.forwarders.get(&"rev-udp".to_string()).unwrap().comms(),
            (console.id(), agent.id())
        );
        let bound = agent_client.handler_addr("rev-udp").unwrap();
        assert_eq!(bound.port(), bind_port);

        let app = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        let n = loop {
            app.send_to(b"q", bound).await.unwrap();
            match tokio::time::timeout(Duration::from_millis(300), app.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => break n,
                _ => continue,
            }
        };
        assert_eq!(&buf[..n], b"re:q");

        close(&reg, "rev-udp", true).await.unwrap();
        wait_for(|| agent_client.handler_addr("rev-udp").is_none()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_with_one_id_register_once() {
        let reg = Registries::new();
        let (agent, _agent_client) = pair(&reg, PeerKind::Agent, "agent", vec![]).await;
        let (console, _console_client) = pair(&reg, PeerKind::Console, "op", vec![]).await;

        let h = Handler {
            id: "race".into(),
            rhost: "127.0.0.1".into(),
            rport: 9,
            ..Default::default()
        };
        let mut opens = Vec::new();
        for _ in 0..16 {
            let (reg, h, console, agent) = (reg.clone(), h.clone(), console.clone(), agent.clone());
            opens.push(tokio::spawn(async move { open(&reg, h, console, agent).await }));
        }
        let mut won = 0;
        for o in opens {
            match o.await.unwrap() {
                Ok(_) => won += 1,
                Err(err) => assert!(matches!(err, ForwarderError::Exists(_))),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(reg.forwarders.len(), 1);
    }
}
