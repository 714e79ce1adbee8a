//! Proxy request handling
//!
//! This module routes requests to their handler: CONNECT requests open a
//! tunnel, GET/POST/HEAD are forwarded through a per-connection pool of
//! backend sockets, and everything else is refused.

pub mod pool;
pub mod tunnel;
pub mod upstream;

pub use pool::{PoolKey, SocketPool};
pub use tunnel::TunnelHandler;
pub use upstream::ProxyHandler;

use crate::http::request::Method;

/// Handler chosen for a request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tunnel,
    Forward,
    Unsupported,
}

impl Route {
    pub fn for_method(method: &Method) -> Self {
        match method {
            Method::CONNECT => Route::Tunnel,
            Method::GET | Method::POST | Method::HEAD => Route::Forward,
            Method::Other(_) => Route::Unsupported,
        }
    }
}
