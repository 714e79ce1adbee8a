//! Proxy authentication gate
//!
//! Basic credentials are checked on every request. NTLM is a handshake
//! bound to the client connection: once it succeeds, later requests on the
//! same connection pass without a `Proxy-Authorization` header.

pub mod basic;
pub mod ntlm;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::context::ProxyContext;
use crate::error::Result;
use crate::http::header::{self, Header};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};

pub use crate::config::AuthScheme;
use ntlm::{NtlmError, NtlmMessage, Type2Message};

const REJECTION_PAGE: &str = "<html><head><title>Proxy Authentication Required</title></head>\
<body><p>Proxy Authentication Required</p></body></html>";

/// Outcome of running a request through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Reply 407 with these `Proxy-Authenticate` values.
    Reject(Vec<String>),
}

/// Authentication state of one client connection.
#[derive(Debug, Default)]
pub struct AuthState {
    authenticated: bool,
    pending_challenge: Option<Type2Message>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ctx: &ProxyContext, request: &Request) -> GateDecision {
        if !ctx.auth_required || self.authenticated {
            return GateDecision::Allow;
        }

        let authorization = request.header(header::PROXY_AUTHORIZATION);

        match ctx.auth_scheme {
            AuthScheme::Basic => {
                if basic::authenticate(authorization, &ctx.credentials) {
                    GateDecision::Allow
                } else {
                    GateDecision::Reject(vec![basic::CHALLENGE.to_string()])
                }
            }
            AuthScheme::Ntlm => self.check_ntlm(ctx, authorization),
        }
    }

    fn check_ntlm(&mut self, ctx: &ProxyContext, authorization: Option<&str>) -> GateDecision {
        let token = authorization
            .and_then(|v| v.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("NTLM"))
            .map(|(_, token)| token.trim());

        let Some(token) = token else {
            return self.restart();
        };

        let message = match decode_token(token) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed NTLM token");
                return self.restart();
            }
        };

        match message {
            NtlmMessage::Negotiate(type1) => match ntlm::create_challenge(&type1, &ctx.hostname) {
                Ok(type2) => {
                    tracing::debug!(flags = format_args!("{:#010x}", type2.flags), "Sending NTLM challenge");
                    let value = format!("NTLM {}", STANDARD.encode(type2.to_bytes()));
                    self.pending_challenge = Some(type2);
                    GateDecision::Reject(vec![value])
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Can't answer NTLM negotiate");
                    self.restart()
                }
            },
            NtlmMessage::Authenticate(type3) => {
                let Some(challenge) = self.pending_challenge.take() else {
                    tracing::debug!("NTLM authenticate without a pending challenge");
                    return self.restart();
                };

                let Some((user, password)) = ctx.credentials.find_ignore_case(&type3.username)
                else {
                    tracing::debug!(user = %type3.username, "Unknown NTLM user");
                    return self.restart();
                };

                match ntlm::verify(&type3, &challenge, &user, &password) {
                    Ok(true) => {
                        tracing::debug!(%user, domain = %type3.domain, "NTLM authentication succeeded");
                        self.authenticated = true;
                        GateDecision::Allow
                    }
                    Ok(false) => {
                        tracing::debug!(%user, domain = %type3.domain, "NTLM authentication failed");
                        self.restart()
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "NTLM verification error");
                        self.restart()
                    }
                }
            }
            NtlmMessage::Challenge(_) => self.restart(),
        }
    }

    /// Drops any handshake in progress and asks for a fresh negotiate.
    fn restart(&mut self) -> GateDecision {
        self.pending_challenge = None;
        GateDecision::Reject(vec!["NTLM".to_string()])
    }
}

fn decode_token(token: &str) -> std::result::Result<NtlmMessage, NtlmError> {
    let raw = STANDARD.decode(token)?;
    NtlmMessage::parse(&raw)
}

/// Writes the complete 407 response for a rejected request.
pub async fn write_rejection<W>(response: &mut Response<'_, W>, challenges: &[String]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    response
        .write_status(StatusCode::ProxyAuthenticationRequired)
        .await?;

    for challenge in challenges {
        response
            .write_header(Header::new(header::PROXY_AUTHENTICATE, challenge.as_str()))
            .await?;
    }

    response
        .write_header(Header::new(
            header::CONTENT_TYPE,
            "text/html; charset=iso-8859-1",
        ))
        .await?;
    response
        .write_header(Header::new(
            header::CONTENT_LENGTH,
            REJECTION_PAGE.len().to_string(),
        ))
        .await?;
    response.end_headers().await?;

    response.body().write_all(REJECTION_PAGE.as_bytes()).await?;
    response.flush().await
}
