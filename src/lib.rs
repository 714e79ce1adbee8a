//! Poxy - HTTP forward proxy
//!
//! Keep-alive client connections, chunked and fixed-length framing, CONNECT
//! tunnelling, a per-connection backend socket pool, chaining through a
//! forward proxy, and Basic or NTLM proxy authentication.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod net;
pub mod proxy;
pub mod server;
