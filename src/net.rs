//! Socket helpers: outbound connects with a deadline and an idle read
//! timeout wrapper usable on any byte stream.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Sleep, timeout};

use crate::error::{ProxyError, Result};

/// A backend socket as kept in the pool. Buffered so that bytes read past a
/// response boundary stay with the socket.
pub type BackendStream = BufReader<TimedStream<TcpStream>>;

/// Wraps a stream so that a read which sees no data for `timeout` fails with
/// [`io::ErrorKind::TimedOut`]. The window restarts whenever a read
/// completes, so it bounds idle periods rather than whole transfers.
pub struct TimedStream<S> {
    inner: S,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            sleep: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.sleep = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                let Some(limit) = this.timeout else {
                    return Poll::Pending;
                };

                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));

                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.sleep = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Resolves `host:port`, returning the first address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        ProxyError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}:{}", host, port),
        ))
    })
}

/// Opens a backend connection with no-delay set, bounded by
/// `connect_timeout`, and wraps it with the idle read timeout.
pub async fn connect(
    addr: SocketAddr,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
) -> Result<BackendStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout(format!("connecting to {}", addr)))??;

    stream.set_nodelay(true)?;

    tracing::trace!(%addr, "Connected to backend");

    Ok(BufReader::new(TimedStream::new(stream, read_timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn idle_read_times_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(client, Some(Duration::from_millis(50)));

        let mut buf = [0u8; 8];
        let err = timed.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn data_arriving_in_time_is_read() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut timed = TimedStream::new(client, Some(Duration::from_secs(5)));

        server.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, Duration::from_secs(2), None).await;
        assert!(result.is_err());
    }
}
