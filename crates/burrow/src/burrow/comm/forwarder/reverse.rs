//! Reverse forwards: the agent binds and the console dials the target.

use async_trait::async_trait;

use super::{Binding, Forwarder, ForwarderError};
use crate::burrow::comm::{
    conn::Channel,
    protocol::{ConnInfo, Handler, Transport},
    splice::{splice_tcp, splice_udp},
    transport::BoxedStream,
};

async fn open_to_client(b: &Binding, origin: &ConnInfo, transport: Transport) -> Option<BoxedStream> {
    let mut info = b.dial_info(origin, &b.client);
    info.transport = transport;
    match b.client.open_channel(&info).await {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::debug!(id = %b.handler.id, client = b.client.id(), err = %err, "portfwd: console dial failed");
            None
        }
    }
}

pub struct ReverseTcp {
    b: Binding,
}

impl ReverseTcp {
    pub(crate) fn new(b: Binding) -> Self {
        Self { b }
    }
}

#[async_trait]
impl Forwarder for ReverseTcp {
    fn info(&self) -> &Handler {
        &self.b.handler
    }

    fn comms(&self) -> (u32, u32) {
        self.b.comms()
    }

    async fn start(&self) -> Result<(), ForwarderError> {
        self.b.start_remote().await
    }

    async fn handle(&self, ch: Channel) {
        let origin = ch.info.clone();
        let Some(console) = open_to_client(&self.b, &origin, Transport::Tcp).await else {
            ch.reject("console dial failed").await;
            return;
        };
        let accepted = match ch.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(id = %self.b.handler.id, err = %err, "portfwd: agent side lost");
                return;
            }
        };
        splice_tcp(accepted, console, self.b.token.child_token()).await;
    }

    async fn close(&self, close_conns: bool) {
        self.b.stop_remote().await;
        self.b.close_conns(close_conns);
    }

    async fn notify_close(&self) {
        self.b.notify_client().await;
    }
}

pub struct ReverseUdp {
    b: Binding,
}

impl ReverseUdp {
    pub(crate) fn new(b: Binding) -> Self {
        Self { b }
    }
}

#[async_trait]
impl Forwarder for ReverseUdp {
    fn info(&self) -> &Handler {
        &self.b.handler
    }

    fn comms(&self) -> (u32, u32) {
        self.b.comms()
    }

    async fn start(&self) -> Result<(), ForwarderError> {
        self.b.start_remote().await
    }

    async fn handle(&self, ch: Channel) {
        let origin = ch.info.clone();
        let Some(console) = open_to_client(&self.b, &origin, Transport::Udp).await else {
            ch.reject("console dial failed").await;
            return;
        };
        let (_, carrier, _) = match ch.accept_stream().await {
            Ok(c) => c,
            Err(err) => {
                tracing::debug!(id = %self.b.handler.id, err = %err, "portfwd: agent side lost");
                return;
            }
        };
        splice_udp(carrier, console, self.b.token.child_token()).await;
    }

    async fn close(&self, close_conns: bool) {
        self.b.stop_remote().await;
        self.b.close_conns(close_conns);
    }

    async fn notify_close(&self) {
        self.b.notify_client().await;
    }
}
