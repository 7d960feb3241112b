use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    sync::Mutex,
};
use tokio_util::{
    codec::FramedRead,
    sync::{CancellationToken, WaitForCancellationFutureOwned},
};

use crate::burrow::{
    comm::{
        datagram,
        protocol::{self, ConnInfo, ProtocolError},
        transport::BoxedStream,
    },
    net,
};

/// A relayed connection carried by one multiplexed channel.
///
/// Once its token is cancelled reads report EOF and writes fail with
/// `BrokenPipe`, which ends any splice the connection takes part in.
pub struct CommConn {
    stream: BoxedStream,
    info: ConnInfo,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl CommConn {
    pub fn new(stream: BoxedStream, info: ConnInfo, token: CancellationToken) -> Self {
        let local = net::socket_addr(&info.lhost, info.lport);
        let remote = net::socket_addr(&info.rhost, info.rport);
        Self {
            stream,
            local,
            remote,
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
            info,
            done: false,
        }
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Token that closes this connection when cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.done && self.cancelled.as_mut().poll(cx).is_ready() {
            self.done = true;
        }
        self.done
    }
}

impl AsyncRead for CommConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_cancelled(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for CommConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_cancelled(cx) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// An inbound channel waiting for an accept/reject answer.
pub struct Channel {
    pub info: ConnInfo,
    stream: BoxedStream,
    token: CancellationToken,
}

impl Channel {
    pub fn new(info: ConnInfo, stream: BoxedStream, token: CancellationToken) -> Self {
        Self {
            info,
            stream,
            token,
        }
    }

    pub async fn accept(self) -> Result<CommConn, ProtocolError> {
        let Self {
            info,
            mut stream,
            token,
        } = self;
        protocol::write_status(&mut stream, None).await?;
        Ok(CommConn::new(stream, info, token))
    }

    /// Accepts the channel and hands back the raw stream (UDP carrying streams).
    pub async fn accept_stream(mut self) -> Result<(ConnInfo, BoxedStream, CancellationToken), ProtocolError> {
        protocol::write_status(&mut self.stream, None).await?;
        Ok((self.info, self.stream, self.token))
    }

    pub async fn reject(mut self, reason: &str) {
        if let Err(err) = protocol::write_status(&mut self.stream, Some(reason)).await {
            tracing::debug!(id = %self.info.id, err = %err, "comm: reject status not delivered");
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Packet-oriented view of a UDP carrying stream.
///
/// With a fixed remote (dialed conns) every datagram goes to and comes from
/// that remote; otherwise each unit carries its own address. Partially read
/// units stay buffered in the reader, so `recv_from` is cancel-safe.
pub struct PacketConn {
    reader: Mutex<FramedRead<ReadHalf<BoxedStream>, datagram::PacketCodec>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    info: ConnInfo,
    remote: Option<SocketAddr>,
    source: SocketAddr,
    token: CancellationToken,
}

impl PacketConn {
    pub fn new(stream: BoxedStream, info: ConnInfo, token: CancellationToken) -> Self {
        Self::build(stream, info, None, token)
    }

    pub fn connected(stream: BoxedStream, info: ConnInfo, token: CancellationToken) -> Self {
        let remote = net::socket_addr(&info.rhost, info.rport);
        Self::build(stream, info, remote, token)
    }

    fn build(
        stream: BoxedStream,
        info: ConnInfo,
        remote: Option<SocketAddr>,
        token: CancellationToken,
    ) -> Self {
        let source = net::socket_addr(&info.lhost, info.lport)
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(rd, datagram::PacketCodec)),
            writer: Mutex::new(wr),
            info,
            remote,
            source,
            token,
        }
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), ProtocolError> {
        let mut rd = self.reader.lock().await;
        let pkt = tokio::select! {
            _ = self.token.cancelled() => {
                return Err(ProtocolError::Io(io::ErrorKind::ConnectionAborted.into()));
            }
            pkt = rd.next() => match pkt {
                Some(pkt) => pkt?,
                None => return Err(ProtocolError::Io(io::ErrorKind::UnexpectedEof.into())),
            },
        };
        Ok((self.remote.unwrap_or(pkt.addr), pkt.payload))
    }

    pub async fn send_to(&self, addr: &SocketAddr, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.token.is_cancelled() {
            return Err(ProtocolError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        let addr = if self.remote.is_some() { &self.source } else { addr };
        let mut wr = self.writer.lock().await;
        datagram::write_packet(&mut *wr, addr, payload).await
    }

    /// Sends to the fixed remote of a dialed conn.
    pub async fn send(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        let addr = self.source;
        self.send_to(&addr, payload).await
    }

    pub async fn close(&self) {
        self.token.cancel();
        let mut wr = self.writer.lock().await;
        let _ = wr.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn info() -> ConnInfo {
        ConnInfo {
            id: "c".into(),
            lhost: "127.0.0.1".into(),
            lport: 1000,
            rhost: "10.0.0.5".into(),
            rport: 22,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cancelled_conn_reads_eof_and_refuses_writes() {
        let (a, mut b) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        let mut conn = CommConn::new(Box::new(a), info(), token.clone());
        assert_eq!(conn.remote_addr(), Some("10.0.0.5:22".parse().unwrap()));

        b.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        conn.read_exact(&mut one).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = conn.read(&mut buf).await.unwrap();
            (n, conn)
        });
        token.cancel();
        let (n, mut conn) = reader.await.unwrap();
        assert_eq!(n, 0);

        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn rejected_channel_reports_reason() {
        let (a, mut b) = tokio::io::duplex(1024);
        let ch = Channel::new(info(), Box::new(a), CancellationToken::new());
        ch.reject("no handler").await;
        assert_eq!(
            protocol::read_status(&mut b).await.unwrap(),
            Err("no handler".to_string())
        );
    }

    #[tokio::test]
    async fn packet_conn_pairs_addresses() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = PacketConn::new(Box::new(a), info(), CancellationToken::new());
        let right = PacketConn::new(Box::new(b), info(), CancellationToken::new());

        let peer: SocketAddr = "172.16.0.9:5000".parse().unwrap();
        left.send_to(&peer, &[0, 1, 0]).await.unwrap();
        let (addr, payload) = right.recv_from().await.unwrap();
        assert_eq!(addr, peer);
        assert_eq!(payload, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn timed_out_recv_keeps_the_stream_aligned() {
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let conn = PacketConn::new(Box::new(b), info(), CancellationToken::new());

        let mut unit = Vec::new();
        let first: SocketAddr = "10.0.0.1:53".parse().unwrap();
        datagram::write_packet(&mut unit, &first, b"hello").await.unwrap();
        a.write_all(&unit[..6]).await.unwrap();

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            conn.recv_from(),
        )
        .await;
        assert!(waited.is_err());

        a.write_all(&unit[6..]).await.unwrap();
        let second: SocketAddr = "10.0.0.2:53".parse().unwrap();
        datagram::write_packet(&mut a, &second, b"again").await.unwrap();

        assert_eq!(conn.recv_from().await.unwrap(), (first, b"hello".to_vec()));
        assert_eq!(conn.recv_from().await.unwrap(), (second, b"again".to_vec()));
    }

    #[tokio::test]
    async fn connected_packet_conn_reports_fixed_remote() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let dialed = PacketConn::connected(Box::new(a), info(), CancellationToken::new());
        let far = PacketConn::new(Box::new(b), info(), CancellationToken::new());

        dialed.send(b"q").await.unwrap();
        let (src, _) = far.recv_from().await.unwrap();
        assert_eq!(src, "127.0.0.1:1000".parse().unwrap());

        far.send_to(&src, b"r").await.unwrap();
        let (from, payload) = dialed.recv_from().await.unwrap();
        assert_eq!(from, "10.0.0.5:22".parse().unwrap());
        assert_eq!(payload, b"r");
    }
}
