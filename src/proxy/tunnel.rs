//! CONNECT tunnelling
//!
//! Establishes the backend socket (directly, or through the forward proxy's
//! own CONNECT), answers 200 and then pumps raw bytes both ways until either
//! side stops.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use url::Url;

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::http::header::{Header, NEVER_TRANSMIT};
use crate::http::parser::{self, LineRead};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::transfer::BUFFER_SIZE;
use crate::net::{self, BackendStream};

/// Handles CONNECT requests
pub struct TunnelHandler {
    ctx: Arc<ProxyContext>,
}

impl TunnelHandler {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Opens the tunnel's backend side and answers the client. Returns the
    /// backend socket once `200` has been flushed, or `None` after an error
    /// page was written.
    pub async fn establish<W>(
        &self,
        request: &Request,
        response: &mut Response<'_, W>,
    ) -> Result<Option<BackendStream>>
    where
        W: AsyncWrite + Unpin,
    {
        let (host, port) = match parse_authority(&request.target) {
            Ok(authority) => authority,
            Err(e) => {
                response
                    .write_error(StatusCode::BadRequest, &e.to_string())
                    .await?;
                return Ok(None);
            }
        };

        let connected = match self.ctx.forward_proxy_for(&host) {
            Some(proxy) => self.connect_via_proxy(proxy, &host, port).await,
            None => self.connect_direct(&host, port).await,
        };

        match connected {
            Ok((backend, headers)) => {
                tracing::debug!(%host, port, "Tunnel established");

                response.write_status(StatusCode::Ok).await?;
                response
                    .write_headers(NEVER_TRANSMIT.filter(headers.iter()))
                    .await?;
                response.end_headers().await?;
                response.flush().await?;

                Ok(Some(backend))
            }
            Err(e) if e.is_timeout() => {
                response
                    .write_error(
                        StatusCode::GatewayTimeout,
                        &format!("Timed out connecting to {}", request.target),
                    )
                    .await?;
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(%host, port, error = %e, "Tunnel failed");
                response
                    .write_error(StatusCode::BadGateway, &e.to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    async fn connect_direct(&self, host: &str, port: u16) -> Result<(BackendStream, Vec<Header>)> {
        let addr = net::resolve(host, port).await?;
        let backend = net::connect(addr, self.ctx.connect_timeout, self.ctx.read_timeout).await?;
        Ok((backend, Vec::new()))
    }

    /// Runs a CONNECT handshake with the forward proxy and returns its
    /// response headers for relaying to the client.
    async fn connect_via_proxy(
        &self,
        proxy: &Url,
        host: &str,
        port: u16,
    ) -> Result<(BackendStream, Vec<Header>)> {
        let proxy_host = proxy.host_str().unwrap_or_default();
        let proxy_port = proxy.port_or_known_default().unwrap_or(80);

        let addr = net::resolve(proxy_host, proxy_port).await?;
        let mut backend =
            net::connect(addr, self.ctx.connect_timeout, self.ctx.read_timeout).await?;

        backend
            .write_all(format!("CONNECT {}:{} HTTP/1.0\r\n\r\n", host, port).as_bytes())
            .await?;
        backend.flush().await?;

        let line = match parser::read_line(&mut backend).await? {
            LineRead::Line(line) => line,
            LineRead::Eof => {
                return Err(ProxyError::protocol(format!("Connection closed by {}", addr)));
            }
        };

        let status = parser::parse_status_line(&line)?;
        if status.code != 200 {
            return Err(ProxyError::protocol(format!(
                "Could not connect to {}:{} via proxy {}:{}: {} {}",
                host,
                port,
                proxy_host,
                proxy_port,
                status.code,
                status.reason.unwrap_or_default()
            )));
        }

        let headers = parser::read_headers(&mut backend).await?;
        Ok((backend, headers))
    }
}

/// Splits a CONNECT target into host and port. The port defaults to 80.
pub fn parse_authority(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        // Bare IPv6 address without a port
        Some((host, _)) if host.contains(':') && !host.ends_with(']') => (target, 80),
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ProxyError::protocol(format!("Invalid port in CONNECT target '{}'", target))
            })?;
            (host, port)
        }
        None => (target, 80),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::protocol(format!(
            "Missing host in CONNECT target '{}'",
            target
        )));
    }

    Ok((host.to_string(), port))
}

/// Relays bytes between the client and the backend until either direction
/// ends. Each direction runs in its own task; the first to finish tells the
/// other to stop, and both sockets close once both tasks are done.
pub async fn relay<R, W>(client_reader: R, client_writer: W, backend: BackendStream)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (backend_reader, backend_writer) = tokio::io::split(backend);

    let (upstream_done, upstream_watch) = watch::channel(false);
    let (downstream_done, downstream_watch) = watch::channel(false);

    let upstream = tokio::spawn(pump(
        "client to server",
        client_reader,
        backend_writer,
        upstream_done,
        downstream_watch,
    ));
    let downstream = tokio::spawn(pump(
        "server to client",
        backend_reader,
        client_writer,
        downstream_done,
        upstream_watch,
    ));

    let (sent, received) = tokio::join!(upstream, downstream);
    tracing::debug!(
        sent = sent.unwrap_or(0),
        received = received.unwrap_or(0),
        "Tunnel closed"
    );
}

/// Copies `from` to `to` until end of stream, an error, or the peer task
/// finishing. Shuts down `to` and signals `done` on the way out.
async fn pump<R, W>(
    direction: &'static str,
    mut from: R,
    mut to: W,
    done: watch::Sender<bool>,
    mut peer_done: watch::Receiver<bool>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        tokio::select! {
            copied = copy_once(&mut from, &mut to, &mut buf) => match copied {
                Ok(0) => {
                    tracing::trace!(direction, "End of stream");
                    break;
                }
                Ok(n) => total += n as u64,
                Err(e) => {
                    tracing::trace!(direction, error = %e, "Relay stopped");
                    break;
                }
            },
            _ = peer_done.changed() => {
                tracing::trace!(direction, "Peer relay finished");
                break;
            }
        }
    }

    let _ = to.shutdown().await;
    let _ = done.send(true);
    total
}

async fn copy_once<R, W>(from: &mut R, to: &mut W, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = from.read(buf).await?;
    if n > 0 {
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
    }
    Ok(n)
}
