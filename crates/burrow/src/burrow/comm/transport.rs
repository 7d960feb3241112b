use std::io;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// A yamux session over an already-secured byte stream.
///
/// The session future is driven by a background task that forwards inbound
/// streams into a bounded queue; outbound streams are opened through the
/// session control handle.
pub struct MuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    task: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    pub fn server(raw: BoxedStream) -> Self {
        let session = tokio_yamux::Session::new_server(raw, tokio_yamux::Config::default());
        Self::from_session(session)
    }

    pub fn client(raw: BoxedStream) -> Self {
        let session = tokio_yamux::Session::new_client(raw, tokio_yamux::Config::default());
        Self::from_session(session)
    }

    fn from_session(mut session: tokio_yamux::Session<BoxedStream>) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(64);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err = %err, "comm: mux session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            task,
        }
    }

    pub async fn open_stream(&self) -> io::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl
            .open_stream()
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Box::new(st))
    }

    /// Next stream opened by the peer; `None` once the session is gone.
    pub async fn accept_stream(&self) -> Option<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx.recv().await?;
        Some(Box::new(st))
    }

    pub async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
        self.task.abort();
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn streams_flow_both_ways_over_duplex() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(Box::new(a));
        let client = MuxSession::client(Box::new(b));

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        inbound.flush().await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn accept_returns_none_after_peer_closes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = MuxSession::server(Box::new(a));
        let client = MuxSession::client(Box::new(b));

        client.close().await;
        drop(client);

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), server.accept_stream())
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
