//! Direct forwards: the console binds locally and the agent dials the target.

use async_trait::async_trait;

use super::{Binding, Forwarder, ForwarderError};
use crate::burrow::comm::{
    conn::Channel,
    protocol::{ConnInfo, Handler, Transport},
    splice::{splice_tcp, splice_udp},
    transport::BoxedStream,
};

/// Opens the matching channel towards the agent, or `None` when the dial fails.
async fn open_to_peer(b: &Binding, origin: &ConnInfo, transport: Transport) -> Option<BoxedStream> {
    let mut info = b.dial_info(origin, &b.peer);
    info.transport = transport;
    match b.peer.open_channel(&info).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::debug!(id = %b.handler.id, peer = b.peer.id(), err = %err, "portfwd: peer dial failed");
            None
        }
    }
}

pub struct DirectTcp {
    b: Binding,
}

impl DirectTcp {
    pub(crate) fn new(b: Binding) -> Self {
        Self { b }
    }
}

#[async_trait]
impl Forwarder for DirectTcp {
    fn info(&self) -> &Handler {
        &self.b.handler
    }

    fn comms(&self) -> (u32, u32) {
        self.b.comms()
    }

    async fn start(&self) -> Result<(), ForwarderError> {
        Ok(())
    }

    async fn handle(&self, ch: Channel) {
        let origin = ch.info.clone();
        let Some(remote) = open_to_peer(&self.b, &origin, Transport::Tcp).await else {
            ch.reject("peer dial failed").await;
            return;
        };
        let local = match ch.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(id = %self.b.handler.id, err = %err, "portfwd: console side lost");
                return;
            }
        };
        splice_tcp(local, remote, self.b.token.child_token()).await;
    }

    async fn close(&self, close_conns: bool) {
        self.b.close_conns(close_conns);
    }

    async fn notify_close(&self) {
        self.b.notify_client().await;
    }
}

pub struct DirectUdp {
    b: Binding,
}

impl DirectUdp {
    pub(crate) fn new(b: Binding) -> Self {
        Self { b }
    }
}

#[async_trait]
impl Forwarder for DirectUdp {
    fn info(&self) -> &Handler {
        &self.b.handler
    }

    fn comms(&self) -> (u32, u32) {
        self.b.comms()
    }

    async fn start(&self) -> Result<(), ForwarderError> {
        Ok(())
    }

    async fn handle(&self, ch: Channel) {
        let origin = ch.info.clone();
        let Some(remote) = open_to_peer(&self.b, &origin, Transport::Udp).await else {
            ch.reject("peer dial failed").await;
            return;
        };
        let (_, local, _) = match ch.accept_stream().await {
            Ok(carrier) => carrier,
            Err(err) => {
                tracing::debug!(id = %self.b.handler.id, err = %err, "portfwd: console side lost");
                return;
            }
        };
        splice_udp(local, remote, self.b.token.child_token()).await;
    }

    async fn close(&self, close_conns: bool) {
        self.b.close_conns(close_conns);
    }

    async fn notify_close(&self) {
        self.b.notify_client().await;
    }
}
