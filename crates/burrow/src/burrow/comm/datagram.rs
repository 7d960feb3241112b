use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::burrow::comm::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

/// Datagram framing over a channel stream.
///
/// Each unit is encoded as: `u16be addr_len` + `addr` (`"ip:port"`) +
/// `u32be payload_len` + `payload`. The address is the remote end of the
/// datagram on the side that owns the concrete socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &SocketAddr,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }

    let addr = addr.to_string();
    let mut buf = Vec::with_capacity(2 + addr.len() + 4 + payload.len());
    buf.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(addr.as_bytes());
    buf.extend_from_slice(&n.to_be_bytes());
    buf.extend_from_slice(payload);

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one unit.
///
/// An unparsable address yields [`ProtocolError::BadAddress`] only after the
/// whole unit was consumed, so callers may skip it and keep reading.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet, ProtocolError> {
    let alen = r.read_u16().await? as usize;
    let mut abuf = vec![0u8; alen];
    r.read_exact(&mut abuf).await?;

    let n = r.read_u32().await?;
    if n > MAX_DATAGRAM_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut payload = vec![0u8; n as usize];
    r.read_exact(&mut payload).await?;

    let raw = String::from_utf8_lossy(&abuf);
    let addr: SocketAddr = raw
        .parse()
        .map_err(|_| ProtocolError::BadAddress(raw.to_string()))?;
    Ok(Packet { addr, payload })
}

/// Incremental decoder for the same framing, for readers that may be
/// cancelled mid-unit. Units with an unparsable address are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        loop {
            if src.len() < 2 {
                return Ok(None);
            }
            let alen = u16::from_be_bytes([src[0], src[1]]) as usize;
            let head = 2 + alen + 4;
            if src.len() < head {
                src.reserve(head - src.len());
                return Ok(None);
            }
            let n = u32::from_be_bytes([
                src[head - 4],
                src[head - 3],
                src[head - 2],
                src[head - 1],
            ]);
            if n > MAX_DATAGRAM_BYTES {
                return Err(ProtocolError::PayloadTooLarge(n));
            }
            let total = head + n as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut unit = src.split_to(total);
            unit.advance(2);
            let raw = unit.split_to(alen);
            unit.advance(4);
            let raw = String::from_utf8_lossy(&raw);
            match raw.parse::<SocketAddr>() {
                Ok(addr) => {
                    return Ok(Some(Packet {
                        addr,
                        payload: unit.to_vec(),
                    }));
                }
                Err(_) => tracing::debug!(addr = %raw, "comm: skipping datagram with bad address"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_keeps_address_and_empty_payload() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let v4: SocketAddr = "192.168.1.7:5353".parse().unwrap();
        let v6: SocketAddr = "[fe80::1]:9".parse().unwrap();

        write_packet(&mut a, &v4, b"").await.unwrap();
        write_packet(&mut a, &v6, &[0, 0, 7]).await.unwrap();

        let p = read_packet(&mut b).await.unwrap();
        assert_eq!(p.addr, v4);
        assert!(p.payload.is_empty());

        let p = read_packet(&mut b).await.unwrap();
        assert_eq!(p.addr, v6);
        assert_eq!(p.payload, vec![0, 0, 7]);
    }

    #[tokio::test]
    async fn bad_address_leaves_stream_aligned() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_u16(3).await.unwrap();
        a.write_all(b"???").await.unwrap();
        a.write_u32(2).await.unwrap();
        a.write_all(b"xx").await.unwrap();
        let ok: SocketAddr = "10.1.1.1:1".parse().unwrap();
        write_packet(&mut a, &ok, b"next").await.unwrap();

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(err.is_transient());

        let p = read_packet(&mut b).await.unwrap();
        assert_eq!(p.addr, ok);
        assert_eq!(p.payload, b"next");
    }

    #[tokio::test]
    async fn codec_waits_for_whole_units_and_skips_bad_addresses() {
        let ok: SocketAddr = "10.1.1.1:1".parse().unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&3u16.to_be_bytes());
        wire.extend_from_slice(b"???");
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.push(9);
        write_packet(&mut wire, &ok, &[0, 0]).await.unwrap();

        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        for (i, b) in wire.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let got = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(got.is_none(), "unit decoded early at byte {i}");
            } else {
                assert_eq!(got, Some(Packet { addr: ok, payload: vec![0, 0] }));
            }
        }
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (mut a, _b) = tokio::io::duplex(64);
        let big = vec![0u8; MAX_DATAGRAM_BYTES as usize + 1];
        assert!(matches!(
            write_packet(&mut a, &addr, &big).await,
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
