//! Ordered byte stream over a record-oriented, reorder-tolerant message channel.
//!
//! Used when a peer has no raw socket (e.g. it talks over polling HTTP/DNS).
//! Every write becomes one sequenced frame sent as a `TunnelData` message; the
//! receive path reorders frames and drains contiguous runs into the reader.
//!
//! Frame layout: `u64be seq | u64be tunnel_id | u16be owner_len | owner |
//! u8 closed | u32be payload_len | payload`.

use std::{
    collections::BTreeMap,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{RngExt, rng};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};

use crate::burrow::comm::{
    peers::{MsgType, PeerError, PeerSession},
    registry::Registries,
};

/// Largest payload carried by a single frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// How far ahead of the next expected sequence a frame may arrive. Frames
/// beyond it mean the gap will not be filled, and the tunnel is torn down.
pub const MAX_REORDER_WINDOW: u64 = 4096;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("frame truncated")]
    Truncated,
    #[error("frame payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("unknown tunnel {0}")]
    UnknownTunnel(u64),
    #[error("tunnel {0} already exists")]
    Exists(u64),
    #[error("frame {seq} is beyond the reorder window (expecting {next})")]
    WindowExceeded { seq: u64, next: u64 },
    #[error("peer: {0}")]
    Peer(#[from] PeerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub seq: u64,
    pub tunnel_id: u64,
    pub owner: String,
    pub closed: bool,
    pub payload: Bytes,
}

impl TunnelFrame {
    pub fn encode(&self) -> Bytes {
        let owner = self.owner.as_bytes();
        let owner = &owner[..owner.len().min(u16::MAX as usize)];
        let mut b = BytesMut::with_capacity(8 + 8 + 2 + owner.len() + 1 + 4 + self.payload.len());
        b.put_u64(self.seq);
        b.put_u64(self.tunnel_id);
        b.put_u16(owner.len() as u16);
        b.put_slice(owner);
        b.put_u8(u8::from(self.closed));
        b.put_u32(self.payload.len() as u32);
        b.put_slice(&self.payload);
        b.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, TunnelError> {
        if buf.remaining() < 18 {
            return Err(TunnelError::Truncated);
        }
        let seq = buf.get_u64();
        let tunnel_id = buf.get_u64();
        let owner_len = buf.get_u16() as usize;
        if buf.remaining() < owner_len + 5 {
            return Err(TunnelError::Truncated);
        }
        let owner = String::from_utf8_lossy(&buf.split_to(owner_len)).into_owned();
        let closed = buf.get_u8() != 0;
        let n = buf.get_u32() as usize;
        if n > MAX_FRAME_PAYLOAD {
            return Err(TunnelError::PayloadTooLarge(n));
        }
        if buf.remaining() < n {
            return Err(TunnelError::Truncated);
        }
        let payload = buf.split_to(n);
        Ok(Self {
            seq,
            tunnel_id,
            owner,
            closed,
            payload,
        })
    }
}

/// Reorder cache: frames keyed by sequence, drained in contiguous runs.
#[derive(Debug, Default)]
struct Reorder {
    next: u64,
    cache: BTreeMap<u64, (bool, Bytes)>,
    finished: bool,
}

impl Reorder {
    /// Stores one frame and returns every frame that became deliverable.
    fn push(
        &mut self,
        seq: u64,
        closed: bool,
        payload: Bytes,
    ) -> Result<Vec<(bool, Bytes)>, TunnelError> {
        if self.finished || seq < self.next {
            return Ok(Vec::new());
        }
        if seq - self.next >= MAX_REORDER_WINDOW {
            let next = self.next;
            self.finished = true;
            self.cache.clear();
            return Err(TunnelError::WindowExceeded { seq, next });
        }
        self.cache.entry(seq).or_insert((closed, payload));

        let mut out = Vec::new();
        while let Some(entry) = self.cache.remove(&self.next) {
            self.next += 1;
            let closed = entry.0;
            out.push(entry);
            if closed {
                self.finished = true;
                self.cache.clear();
                break;
            }
        }
        Ok(out)
    }
}

struct Inbound {
    reorder: Reorder,
    ordered: Option<mpsc::UnboundedSender<Bytes>>,
}

pub struct Tunnel {
    id: u64,
    owner: String,
    out_seq: AtomicU64,
    out: Mutex<Option<mpsc::UnboundedSender<TunnelFrame>>>,
    inbound: Mutex<Inbound>,
    closed: AtomicBool,
    registries: Weak<Registries>,
}

impl Tunnel {
    /// Creates and registers a tunnel; returns its reader/writer and the
    /// outbound frame queue to pump to the peer.
    fn create(
        registries: &Arc<Registries>,
        id: u64,
        owner: String,
    ) -> (Arc<Tunnel>, TunnelStream, mpsc::UnboundedReceiver<TunnelFrame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ord_tx, ord_rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Tunnel {
            id,
            owner,
            out_seq: AtomicU64::new(0),
            out: Mutex::new(Some(out_tx)),
            inbound: Mutex::new(Inbound {
                reorder: Reorder::default(),
                ordered: Some(ord_tx),
            }),
            closed: AtomicBool::new(false),
            registries: Arc::downgrade(registries),
        });
        registries.tunnels.add(id, tunnel.clone());
        let stream = TunnelStream {
            tunnel: tunnel.clone(),
            rx: ord_rx,
            pending: Bytes::new(),
        };
        (tunnel, stream, out_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_frame(&self, closed: bool, payload: Bytes) -> io::Result<()> {
        let out = self
            .out
            .lock()
            .map_err(|_| io::Error::other("tunnel: poisoned"))?;
        let Some(tx) = out.as_ref() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        let frame = TunnelFrame {
            seq: self.out_seq.fetch_add(1, Ordering::AcqRel),
            tunnel_id: self.id,
            owner: self.owner.clone(),
            closed,
            payload,
        };
        tx.send(frame).map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Tags `data` with the next outbound sequence number and queues it as one frame.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = data.len().min(MAX_FRAME_PAYLOAD);
        self.send_frame(false, Bytes::copy_from_slice(&data[..n]))?;
        Ok(n)
    }

    /// Feeds one inbound frame through the reorder cache; returns how many
    /// frames were drained into the ordered buffer. A frame past the reorder
    /// window ends the inbound stream: the reader sees EOF.
    pub fn ingest(&self, frame: TunnelFrame) -> Result<usize, TunnelError> {
        let Ok(mut inbound) = self.inbound.lock() else {
            return Ok(0);
        };
        let drained = match inbound.reorder.push(frame.seq, frame.closed, frame.payload) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(tunnel = self.id, err = %err, "tunnel: dropping inbound stream");
                inbound.ordered = None;
                return Err(err);
            }
        };
        let n = drained.len();
        for (closed, payload) in drained {
            if !payload.is_empty() {
                if let Some(tx) = inbound.ordered.as_ref() {
                    let _ = tx.send(payload);
                }
            }
            if closed {
                tracing::debug!(tunnel = self.id, "tunnel: peer closed");
                inbound.ordered = None;
            }
        }
        Ok(n)
    }

    /// Sends the final closed frame and deregisters. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.send_frame(true, Bytes::new()) {
            tracing::debug!(tunnel = self.id, err = %err, "tunnel: close frame not queued");
        }
        if let Ok(mut out) = self.out.lock() {
            out.take();
        }
        if let Some(reg) = self.registries.upgrade() {
            reg.tunnels
                .remove_if(&self.id, |t| std::ptr::eq(Arc::as_ptr(t), self));
        }
        tracing::debug!(tunnel = self.id, owner = %self.owner, "tunnel: closed");
    }
}

/// Reader/writer half of a tunnel, usable as a raw stream under TLS.
pub struct TunnelStream {
    tunnel: Arc<Tunnel>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl TunnelStream {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(b)) => self.pending = b,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.tunnel.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tunnel.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.tunnel.close();
    }
}

fn spawn_pump(
    id: u64,
    session: Arc<dyn PeerSession>,
    mut frames: mpsc::UnboundedReceiver<TunnelFrame>,
) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(err) = session.send(MsgType::TunnelData, frame.encode()).await {
                tracing::warn!(tunnel = id, session = session.id(), err = %err, "tunnel: send failed");
                break;
            }
        }
    });
}

/// Opens a tunnel towards `session`: registers a fresh random ID and asks the
/// peer to open its end.
pub async fn open(
    registries: &Arc<Registries>,
    session: Arc<dyn PeerSession>,
    timeout: Duration,
) -> Result<TunnelStream, TunnelError> {
    let mut id = rng().random::<u64>();
    while id == 0 || registries.tunnels.contains(&id) {
        id = rng().random::<u64>();
    }

    let (tunnel, stream, frames) = Tunnel::create(registries, id, session.name());
    spawn_pump(id, session.clone(), frames);

    if let Err(err) = session
        .request(MsgType::TunnelOpen, timeout, Bytes::copy_from_slice(&id.to_be_bytes()))
        .await
    {
        tunnel.close();
        return Err(err.into());
    }
    tracing::info!(tunnel = id, session = session.id(), "tunnel: opened");
    Ok(stream)
}

/// Peer side of [`open`]: registers the tunnel announced by a `TunnelOpen` message.
pub fn accept(
    registries: &Arc<Registries>,
    session: Arc<dyn PeerSession>,
    id: u64,
) -> Result<TunnelStream, TunnelError> {
    if registries.tunnels.contains(&id) {
        return Err(TunnelError::Exists(id));
    }
    let (_, stream, frames) = Tunnel::create(registries, id, session.name());
    spawn_pump(id, session, frames);
    Ok(stream)
}

/// Routes one inbound `TunnelData` payload to its tunnel.
pub fn deliver(registries: &Registries, payload: Bytes) -> Result<usize, TunnelError> {
    let frame = TunnelFrame::decode(payload)?;
    let Some(tunnel) = registries.tunnels.get(&frame.tunnel_id) else {
        return Err(TunnelError::UnknownTunnel(frame.tunnel_id));
    };
    tunnel.ingest(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use async_trait::async_trait;
    use ipnetwork::IpNetwork;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(seq: u64, payload: &'static [u8]) -> TunnelFrame {
        TunnelFrame {
            seq,
            tunnel_id: 7,
            owner: "op".into(),
            closed: false,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn frame_layout_is_stable() {
        let f = TunnelFrame {
            seq: 1,
            tunnel_id: 2,
            owner: "ab".into(),
            closed: true,
            payload: Bytes::from_static(b"z"),
        };
        let b = f.encode();
        assert_eq!(&b[..8], &1u64.to_be_bytes());
        assert_eq!(&b[8..16], &2u64.to_be_bytes());
        assert_eq!(&b[16..18], &2u16.to_be_bytes());
        assert_eq!(&b[18..20], b"ab");
        assert_eq!(b[20], 1);
        assert_eq!(&b[21..25], &1u32.to_be_bytes());
        assert_eq!(&b[25..], b"z");
        assert_eq!(TunnelFrame::decode(b).unwrap(), f);

        assert!(matches!(
            TunnelFrame::decode(Bytes::from_static(&[0; 10])),
            Err(TunnelError::Truncated)
        ));
    }

    #[tokio::test]
    async fn out_of_order_frames_drain_once_in_order() {
        let reg = Registries::new();
        let (tunnel, mut stream, _frames) = Tunnel::create(&reg, 7, "op".into());

        assert_eq!(tunnel.ingest(frame(2, b"c")).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(1, b"b")).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(0, b"a")).unwrap(), 3);
        // duplicates and consumed sequences are dropped
        assert_eq!(tunnel.ingest(frame(1, b"b")).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(4, b"e")).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(4, b"X")).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(3, b"d")).unwrap(), 2);

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcde");
    }

    #[tokio::test]
    async fn closed_frame_yields_eof_after_earlier_frames() {
        let reg = Registries::new();
        let (tunnel, mut stream, _frames) = Tunnel::create(&reg, 7, "op".into());

        let mut fin = frame(1, b"");
        fin.closed = true;
        assert_eq!(tunnel.ingest(fin).unwrap(), 0);
        assert_eq!(tunnel.ingest(frame(0, b"last")).unwrap(), 2);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last");
    }

    #[tokio::test]
    async fn close_sends_final_frame_and_deregisters() {
        let reg = Registries::new();
        let (tunnel, mut stream, mut frames) = Tunnel::create(&reg, 9, "op".into());
        assert!(reg.tunnels.contains(&9));

        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();
        assert!(tunnel.is_closed());
        assert!(!reg.tunnels.contains(&9));

        let first = frames.recv().await.unwrap();
        assert_eq!((first.seq, first.closed), (0, false));
        assert_eq!(&first.payload[..], b"hello");
        let last = frames.recv().await.unwrap();
        assert_eq!((last.seq, last.closed), (1, true));
        assert!(last.payload.is_empty());
        assert!(frames.recv().await.is_none());

        assert!(stream.write_all(b"x").await.is_err());
    }

    /// Session that delivers frames into another process's registries,
    /// reversing each batch of two to exercise reordering.
    struct Loopback {
        far: Arc<Registries>,
        held: tokio::sync::Mutex<Option<Bytes>>,
        accept_tx: tokio::sync::mpsc::UnboundedSender<u64>,
    }

    #[async_trait]
    impl PeerSession for Loopback {
        fn id(&self) -> u32 {
            1
        }
        fn name(&self) -> String {
            "loop".into()
        }
        fn remote_ip(&self) -> Option<IpAddr> {
            None
        }
        fn interfaces(&self) -> Vec<IpNetwork> {
            Vec::new()
        }
        async fn request(&self, msg: MsgType, _t: Duration, payload: Bytes) -> Result<Bytes, PeerError> {
            assert_eq!(msg, MsgType::TunnelOpen);
            let id = u64::from_be_bytes(payload[..8].try_into().unwrap());
            self.accept_tx.send(id).unwrap();
            Ok(Bytes::new())
        }
        async fn send(&self, msg: MsgType, payload: Bytes) -> Result<(), PeerError> {
            assert_eq!(msg, MsgType::TunnelData);
            let mut held = self.held.lock().await;
            match held.take() {
                None => *held = Some(payload),
                Some(prev) => {
                    let _ = deliver(&self.far, payload);
                    let _ = deliver(&self.far, prev);
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn open_delivers_reordered_bytes_to_the_far_end() {
        let near = Registries::new();
        let far = Registries::new();
        let (accept_tx, mut accept_rx) = tokio::sync::mpsc::unbounded_channel();
        let session = Arc::new(Loopback {
            far: far.clone(),
            held: tokio::sync::Mutex::new(None),
            accept_tx,
        });

        // Far end accepts with a session that is never used for sending.
        let far_reg = far.clone();
        let far_sess = session.clone();
        let acceptor = tokio::spawn(async move {
            let id = accept_rx.recv().await.unwrap();
            accept(&far_reg, far_sess, id).unwrap()
        });

        let mut near_stream = open(&near, session, Duration::from_secs(1)).await.unwrap();
        let mut far_stream = acceptor.await.unwrap();

        near_stream.write_all(b"one").await.unwrap();
        near_stream.write_all(b"two").await.unwrap();
        near_stream.write_all(b"333").await.unwrap();
        near_stream.shutdown().await.unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), far_stream.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"onetwo333");
    }

    #[tokio::test]
    async fn frames_past_the_reorder_window_end_the_stream() {
        let reg = Registries::new();
        let (tunnel, mut stream, _frames) = Tunnel::create(&reg, 7, "op".into());

        for seq in 1..MAX_REORDER_WINDOW {
            assert_eq!(tunnel.ingest(frame(seq, b"x")).unwrap(), 0);
        }
        let err = tunnel.ingest(frame(MAX_REORDER_WINDOW, b"x")).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::WindowExceeded { seq, next: 0 } if seq == MAX_REORDER_WINDOW
        ));
        {
            let inbound = tunnel.inbound.lock().unwrap();
            assert!(inbound.reorder.cache.is_empty());
        }

        // The missing frame no longer revives the stream.
        assert_eq!(tunnel.ingest(frame(0, b"late")).unwrap(), 0);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn deliver_to_unknown_tunnel_fails() {
        let reg = Registries::new();
        let err = deliver(&reg, frame(0, b"x").encode()).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownTunnel(7)));
    }
}
