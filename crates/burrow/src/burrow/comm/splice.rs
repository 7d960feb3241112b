use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::burrow::comm::datagram;

/// Relays bytes both ways until the first EOF or error on either side (or
/// cancellation), then shuts both sides down.
pub async fn splice_tcp<A, B>(a: A, b: B, token: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    {
        let a_to_b = tokio::io::copy(&mut ar, &mut bw);
        let b_to_a = tokio::io::copy(&mut br, &mut aw);
        tokio::pin!(a_to_b, b_to_a);

        tokio::select! {
            _ = token.cancelled() => {}
            r = &mut a_to_b => {
                tracing::debug!(bytes = r.as_ref().ok().copied(), "portfwd: upstream side finished");
            }
            r = &mut b_to_a => {
                tracing::debug!(bytes = r.as_ref().ok().copied(), "portfwd: downstream side finished");
            }
        }
    }

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;
}

/// Relays datagram units both ways. Each direction keeps going across
/// per-unit errors; a broken stream on either side ends both.
pub async fn splice_udp<A, B>(a: A, b: B, token: CancellationToken)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    let stop = token.child_token();

    tokio::join!(
        relay_units(&mut ar, &mut bw, &stop),
        relay_units(&mut br, &mut aw, &stop),
    );

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;
}

async fn relay_units<R, W>(r: &mut R, w: &mut W, stop: &CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let pkt = tokio::select! {
            _ = stop.cancelled() => break,
            p = datagram::read_packet(r) => p,
        };
        let pkt = match pkt {
            Ok(p) => p,
            Err(err) if err.is_transient() => {
                tracing::debug!(err = %err, "portfwd: skipping bad datagram unit");
                continue;
            }
            Err(_) => break,
        };
        if let Err(err) = datagram::write_packet(w, &pkt.addr, &pkt.payload).await {
            tracing::debug!(err = %err, "portfwd: datagram relay write failed");
            break;
        }
    }
    stop.cancel();
}
