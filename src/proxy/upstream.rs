//! Request forwarding
//!
//! Forwards GET, POST and HEAD requests with absolute `http://` targets to
//! the origin server, or to the configured forward proxy, and relays the
//! response back byte for byte.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufWriter};
use url::Url;

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::http::header::{self, DIRECT_REQUEST, Header, NEVER_TRANSMIT};
use crate::http::parser::{self, LineRead, StatusLine, encode_line};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::transfer::{self, BodyLength};
use crate::net::{self, BackendStream};
use crate::proxy::pool::SocketPool;

/// Where a forwarded request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// False when going through the forward proxy
    pub direct: bool,
}

/// A backend response head, read in full before anything is written to the
/// client.
struct ResponseHead {
    status: StatusLine,
    headers: Vec<Header>,
}

/// Handles forwarded (non-CONNECT) requests
pub struct ProxyHandler {
    ctx: Arc<ProxyContext>,
}

impl ProxyHandler {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }

    /// Forwards `request`, reading its body from `body`.
    ///
    /// Returns `Ok(true)` when the client connection can carry another
    /// request. Failures before the response status is written are answered
    /// with 502 or 504; failures after it end the connection.
    pub async fn forward<R, W>(
        &self,
        pool: &mut SocketPool,
        request: &Request,
        body: &mut R,
        response: &mut Response<'_, W>,
    ) -> Result<bool>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let url = match request_url(request) {
            Ok(url) => url,
            Err(details) => {
                response.write_error(StatusCode::BadRequest, &details).await?;
                return Ok(false);
            }
        };

        let target = self.select_target(&url);
        let request_body = BodyLength::of(&request.headers);

        tracing::debug!(
            host = %target.host,
            port = target.port,
            direct = target.direct,
            "Forwarding request"
        );

        let backend = match net::resolve(&target.host, target.port).await {
            Ok(server) => match pool.take(server) {
                Some(socket) => Ok((server, socket)),
                None => net::connect(server, self.ctx.connect_timeout, self.ctx.read_timeout)
                    .await
                    .map(|socket| (server, socket)),
            },
            Err(e) => Err(e),
        };

        let (server, mut backend) = match backend {
            Ok(backend) => backend,
            Err(e) => {
                // Nothing was read from the request body yet
                if let Err(drain) = transfer::copy_body(body, &mut tokio::io::sink(), request_body).await {
                    return reject_body(response, drain).await;
                }
                self.write_failure(response, &request.target, &e).await?;
                return Ok(true);
            }
        };

        if let Err(e) = send_request(&mut backend, request, body, request_body, target.direct).await
        {
            // Only the client's body framing can be malformed while sending
            if matches!(e, ProxyError::Protocol(_)) {
                return reject_body(response, e).await;
            }

            tracing::debug!(%server, error = %e, "Failed sending request to backend");
            self.write_failure(response, &request.target, &e).await?;
            // A partly copied body leaves the client stream unframed
            return Ok(request_body == BodyLength::None);
        }

        let head = match read_response_head(&mut backend, server).await {
            Ok(head) => head,
            Err(e) => {
                tracing::debug!(%server, error = %e, "Failed reading backend response");
                self.write_failure(response, &request.target, &e).await?;
                return Ok(true);
            }
        };

        if let Some(delay) = self.ctx.response_delay {
            tokio::time::sleep(delay).await;
        }

        match self
            .relay_response(&mut backend, request, head, response)
            .await
        {
            Ok(backend_closes) => {
                if backend_closes {
                    tracing::trace!(%server, "Backend closes connection, not pooling");
                } else {
                    pool.put(server, backend);
                }
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(%server, error = %e, "Failed relaying response");
                pool.evict(server);
                Ok(false)
            }
        }
    }

    /// The forward proxy when one is configured and `url`'s host is not
    /// bypassed, otherwise the origin server.
    pub fn select_target(&self, url: &Url) -> Target {
        let host = host_of(url);

        match self.ctx.forward_proxy_for(&host) {
            Some(proxy) => Target {
                host: host_of(proxy),
                port: proxy.port_or_known_default().unwrap_or(80),
                direct: false,
            },
            None => Target {
                host,
                port: url.port_or_known_default().unwrap_or(80),
                direct: true,
            },
        }
    }

    /// Writes the status line, filtered headers plus `Via`, and the body.
    /// Returns true when the backend will close its side after this response.
    async fn relay_response<W>(
        &self,
        backend: &mut BackendStream,
        request: &Request,
        head: ResponseHead,
        response: &mut Response<'_, W>,
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
    {
        let ResponseHead { status, headers } = head;

        let backend_closes =
            header::is_connection_close(&headers) || header::is_proxy_connection_close(&headers);

        response
            .write_status_line(&status.version, status.code, status.reason.as_deref())
            .await?;
        response
            .write_headers(NEVER_TRANSMIT.filter(headers.iter()))
            .await?;
        response
            .write_header(Header::new(header::VIA, format!("1.0 {}", self.ctx.hostname)))
            .await?;
        response.end_headers().await?;

        if request.is_head() {
            return Ok(backend_closes);
        }

        match BodyLength::of(&headers) {
            BodyLength::None if backend_closes => {
                let n = transfer::copy_to_eof(backend, response.body()).await?;
                tracing::trace!(bytes = n, "Copied close-delimited body");
            }
            length => transfer::copy_body(backend, response.body(), length).await?,
        }

        Ok(backend_closes)
    }

    async fn write_failure<W>(
        &self,
        response: &mut Response<'_, W>,
        target: &str,
        error: &ProxyError,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if error.is_timeout() {
            response
                .write_error(
                    StatusCode::GatewayTimeout,
                    &format!("Timed out connecting to {}", target),
                )
                .await
        } else {
            response
                .write_error(StatusCode::BadGateway, &error.to_string())
                .await
        }
    }
}

/// Answers a client body that could not be framed with a 400 and ends the
/// connection. Other failures reading it are passed on.
async fn reject_body<W>(response: &mut Response<'_, W>, error: ProxyError) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match error {
        ProxyError::Protocol(details) => {
            tracing::debug!(%details, "Malformed request body");
            response.write_error(StatusCode::BadRequest, &details).await?;
            Ok(false)
        }
        other => Err(other),
    }
}

/// Parses an absolute `http://` request target. The error is the text of
/// the 400 page.
pub fn request_url(request: &Request) -> std::result::Result<Url, String> {
    let absolute_required = "This is a proxy server and it requires absolute resource URIs.";

    let url = Url::parse(&request.target).map_err(|_| absolute_required.to_string())?;

    if url.host_str().is_none() {
        return Err(absolute_required.to_string());
    }

    if url.scheme() != "http" {
        return Err(format!(
            "Only HTTP supported for {} requests.  Use CONNECT for HTTPS.",
            request.method
        ));
    }

    Ok(url)
}

fn host_of(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Sends the request line verbatim, filtered headers and the body.
async fn send_request<R>(
    backend: &mut BackendStream,
    request: &Request,
    body: &mut R,
    length: BodyLength,
    direct: bool,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut out = BufWriter::new(backend);

    out.write_all(&encode_line(&request.to_string())).await?;
    out.write_all(b"\r\n").await?;

    let mut headers = NEVER_TRANSMIT.filter(request.headers.iter());
    if direct {
        headers = DIRECT_REQUEST.filter(headers.iter());
    }

    for h in &headers {
        out.write_all(&encode_line(&h.to_string())).await?;
        out.write_all(b"\r\n").await?;
    }
    out.write_all(b"\r\n").await?;

    transfer::copy_body(body, &mut out, length).await?;
    out.flush().await?;

    Ok(())
}

async fn read_response_head(backend: &mut BackendStream, server: SocketAddr) -> Result<ResponseHead> {
    let line = match parser::read_line(backend).await? {
        LineRead::Line(line) => line,
        LineRead::Eof => {
            return Err(ProxyError::protocol(format!("Connection closed by {}", server)));
        }
    };

    let status = parser::parse_status_line(&line)?;
    let headers = parser::read_headers(backend).await?;

    Ok(ResponseHead { status, headers })
}
