//! Error types shared by the protocol engine.
//!
//! Protocol errors carry a message that may be echoed back to the client in
//! an error page. I/O errors are never turned into a response once bytes may
//! have reached the client; the connection is simply closed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed request line, header, chunk size or backend status line.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ProxyError::Protocol(msg.into())
    }

    /// True for read timeouts surfaced by [`crate::net::TimedStream`] as well
    /// as explicit connect timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            ProxyError::Timeout(_) => true,
            ProxyError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
