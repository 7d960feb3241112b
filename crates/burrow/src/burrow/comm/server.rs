use std::{net::SocketAddr, sync::Arc};

use tokio::sync::watch;

use crate::burrow::{
    comm::{
        handshake::Credentials,
        peers::PeerSession,
        protocol::{self, Reply},
        registry::Registries,
        session::{Comm, CommError, CommInit, CommOptions},
        transport::BoxedStream,
    },
    net,
};

/// Accepts peers and consoles and turns each connection into a started Comm.
pub struct CommServer {
    registries: Arc<Registries>,
    creds: Arc<Credentials>,
    opts: CommOptions,
}

impl CommServer {
    pub fn new(registries: Arc<Registries>, creds: Arc<Credentials>, opts: CommOptions) -> Self {
        Self {
            registries,
            creds,
            opts,
        }
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub async fn bind(listen_addr: &str) -> anyhow::Result<tokio::net::TcpListener> {
        let addr = net::normalize_bind_addr(listen_addr);
        let ln = tokio::net::TcpListener::bind(addr.as_ref()).await?;
        Ok(ln)
    }

    pub async fn listen_and_serve(
        self: &Arc<Self>,
        listen_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let ln = Self::bind(listen_addr).await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        self: &Arc<Self>,
        ln: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "comm: listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                conn = ln.accept() => {
                    let (conn, remote) = match conn {
                        Ok(x) => x,
                        Err(err) => {
                            tracing::warn!(err = %err, "comm: accept failed");
                            continue;
                        }
                    };
                    let _ = conn.set_nodelay(true);
                    let srv = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = srv.attach(Some(Box::new(conn)), Some(remote), None).await {
                            tracing::warn!(client = %remote, err = %err, "comm: session setup failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Brings up a Comm over `conn`, or over a tunnel through `session` when
    /// there is no raw connection, and registers it once the peer has
    /// introduced itself.
    pub async fn attach(
        &self,
        conn: Option<BoxedStream>,
        remote_addr: Option<SocketAddr>,
        session: Option<Arc<dyn PeerSession>>,
    ) -> Result<Arc<Comm>, CommError> {
        let session_id = match &session {
            Some(s) => s.id(),
            None => self.registries.next_session_id(),
        };
        let (comm, mut boot) = Comm::init(
            CommInit {
                session_id,
                conn,
                remote_addr,
                session,
            },
            self.registries.clone(),
            &self.creds,
            self.opts.clone(),
        )
        .await?;

        let timeout = self.opts.handshake_timeout;
        let introduced = async {
            let hello = protocol::read_hello(&mut boot).await?;
            comm.set_profile(&hello);
            protocol::write_reply(
                &mut boot,
                &Reply::with_data(serde_json::json!({
                    "comm_id": comm.id(),
                    "session_id": session_id,
                })),
            )
            .await?;
            Ok::<(), CommError>(())
        };
        let res = match tokio::time::timeout(timeout, introduced).await {
            Ok(r) => r,
            Err(_) => Err(CommError::Timeout(timeout)),
        };
        if let Err(err) = res {
            comm.shutdown().await;
            return Err(err);
        }

        comm.start();
        Ok(comm)
    }

    /// Shuts down every registered Comm.
    pub async fn shutdown(&self) {
        for comm in self.registries.comms.all() {
            comm.shutdown().await;
        }
    }
}
