use std::sync::Arc;

use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use crate::auth::{self, AuthState, GateDecision};
use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::http::header;
use crate::http::parser;
use crate::http::request::{Request, Version};
use crate::http::response::{Response, StatusCode};
use crate::http::transfer::{self, BodyLength};
use crate::net::{BackendStream, TimedStream};
use crate::proxy::{ProxyHandler, Route, SocketPool, TunnelHandler, tunnel};

type ClientReader<S> = BufReader<ReadHalf<TimedStream<S>>>;
type ClientWriter<S> = BufWriter<WriteHalf<TimedStream<S>>>;

/// One client connection: reads requests until keep-alive ends, running
/// each through the authentication gate and its handler.
pub struct Connection<S> {
    id: u64,
    stream: S,
    ctx: Arc<ProxyContext>,
}

pub enum ConnectionState {
    ReadRequest,
    Exchange(Request),
    Tunnel(BackendStream),
    Closed,
}

/// Per-connection state that outlives a single exchange.
struct Session {
    keep_alive: bool,
    /// Set once any request carried a `Connection` header
    explicit_keep_alive: bool,
    served: u64,
    auth: AuthState,
    pool: SocketPool,
    forward: ProxyHandler,
    tunnel: TunnelHandler,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(id: u64, stream: S, ctx: Arc<ProxyContext>) -> Self {
        Self { id, stream, ctx }
    }

    pub async fn run(self) -> Result<()> {
        let Connection { id, stream, ctx } = self;

        let (read_half, write_half) = tokio::io::split(TimedStream::new(stream, ctx.read_timeout));
        let mut reader: ClientReader<S> = BufReader::new(read_half);
        let mut writer: ClientWriter<S> = BufWriter::new(write_half);

        let mut session = Session {
            keep_alive: true,
            explicit_keep_alive: false,
            served: 0,
            auth: AuthState::new(),
            pool: SocketPool::new(id),
            forward: ProxyHandler::new(ctx.clone()),
            tunnel: TunnelHandler::new(ctx.clone()),
        };

        let mut state = ConnectionState::ReadRequest;

        let result = loop {
            let step = match state {
                ConnectionState::ReadRequest => session.read_request(&mut reader, &mut writer).await,

                ConnectionState::Exchange(request) => {
                    session
                        .exchange(&ctx, request, &mut reader, &mut writer)
                        .await
                }

                ConnectionState::Tunnel(backend) => {
                    tunnel::relay(reader, writer, backend).await;
                    return Ok(());
                }

                ConnectionState::Closed => break Ok(()),
            };

            state = match step {
                Ok(next) => next,
                Err(e) if e.is_timeout() => {
                    tracing::debug!("Connection timed out");
                    ConnectionState::Closed
                }
                Err(ProxyError::Io(e)) => {
                    tracing::debug!(error = %e, "Connection I/O error");
                    ConnectionState::Closed
                }
                Err(ProxyError::Protocol(details)) => {
                    tracing::debug!(%details, "Protocol error after response started");
                    ConnectionState::Closed
                }
                Err(e) => break Err(e),
            };
        };

        let _ = writer.shutdown().await;
        tracing::debug!(requests = session.served, "Connection closed");

        result
    }
}

impl Session {
    async fn read_request<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<ConnectionState>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match parser::read_request(reader).await {
            Ok(Some(request)) => Ok(ConnectionState::Exchange(request)),
            Ok(None) => {
                if self.served == 0 {
                    tracing::warn!("Client closed connection before sending a request");
                }
                Ok(ConnectionState::Closed)
            }
            Err(ProxyError::Protocol(details)) => {
                tracing::debug!(%details, "Bad request");

                // The request version is unknown here
                let mut response = Response::new(writer, Version::Http10);
                response
                    .write_error(StatusCode::BadRequest, &details)
                    .await?;
                Ok(ConnectionState::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Gate, dispatch and post-check for one request.
    async fn exchange<R, W>(
        &mut self,
        ctx: &ProxyContext,
        request: Request,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<ConnectionState>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.update_keep_alive(&request);
        self.served += 1;

        let mut response = Response::new(writer, request.version);

        if let GateDecision::Reject(challenges) = self.auth.check(ctx, &request) {
            tracing::debug!(method = %request.method, "Proxy authentication required");

            // Keep the client stream framed for the next request
            let drained =
                transfer::copy_body(reader, &mut tokio::io::sink(), BodyLength::of(&request.headers))
                    .await;
            if let Err(ProxyError::Protocol(details)) = drained {
                tracing::debug!(%details, "Malformed request body");
                if !response.is_committed() {
                    response
                        .write_error(StatusCode::BadRequest, &details)
                        .await?;
                }
                return Ok(ConnectionState::Closed);
            }
            drained?;

            auth::write_rejection(&mut response, &challenges).await?;

            let headers = response.headers();
            if header::is_connection_close(headers) || header::is_proxy_connection_close(headers) {
                self.keep_alive = false;
            } else if header::is_connection_keep_alive(headers) {
                self.keep_alive = true;
            }

            return Ok(self.next_state());
        }

        let route = Route::for_method(&request.method);
        tracing::debug!(?route, target = %request.target, "Dispatching request");

        let keep_going = match route {
            Route::Tunnel => {
                return match self.tunnel.establish(&request, &mut response).await? {
                    Some(backend) => Ok(ConnectionState::Tunnel(backend)),
                    None => Ok(ConnectionState::Closed),
                };
            }
            Route::Forward => {
                self.forward
                    .forward(&mut self.pool, &request, reader, &mut response)
                    .await?
            }
            Route::Unsupported => {
                let details = format!(
                    "This proxy server does not support the {} method",
                    request.method
                );
                response
                    .write_error(StatusCode::BadRequest, &details)
                    .await?;
                false
            }
        };

        if !keep_going {
            let _ = response.flush().await;
            return Ok(ConnectionState::Closed);
        }

        response.flush().await?;

        if !request.is_head() {
            if let Some(declared) = response.content_length() {
                let written = response.body_len();
                if declared != written {
                    tracing::warn!(declared, written, "Content length mismatch, closing connection");
                    return Ok(ConnectionState::Closed);
                }
            }
        }

        let headers = response.headers();
        if header::is_connection_close(headers) || header::is_proxy_connection_close(headers) {
            self.keep_alive = false;
        }

        Ok(self.next_state())
    }

    /// A `Connection` header decides keep-alive and makes the decision
    /// sticky; without one the version default applies until a header has
    /// been seen on this connection.
    fn update_keep_alive(&mut self, request: &Request) {
        match request.header(header::CONNECTION) {
            Some(value) => {
                self.keep_alive = value.eq_ignore_ascii_case(header::KEEP_ALIVE);
                self.explicit_keep_alive = true;
            }
            None if !self.explicit_keep_alive => {
                self.keep_alive = request.version.keeps_alive_by_default();
            }
            None => {}
        }
    }

    fn next_state(&self) -> ConnectionState {
        if self.keep_alive {
            ConnectionState::ReadRequest
        } else {
            ConnectionState::Closed
        }
    }
}
