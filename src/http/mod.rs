//! HTTP protocol implementation.
//!
//! This module implements the proxy side of HTTP/1.0 and HTTP/1.1 with
//! support for keep-alive connections.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The per-client state machine (read, authenticate, dispatch, check)
//! - **`parser`**: Line, header, request line and status line parsing
//! - **`header`**: Header type, well-known names and header filters
//! - **`request`**: HTTP request representation
//! - **`response`**: Response writer that tracks the declared and actual body length
//! - **`transfer`**: Chunked, fixed-length and read-to-close body copying
//! - **`writer`**: Byte-counting sink used by the response
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │ ReadRequest │ ← Wait for a request line and headers
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │    Exchange      │ ← Auth gate, dispatch, content-length check
//!        └──────┬───────────┘
//!               │
//!               ├─ Keep-Alive → ReadRequest (same connection)
//!               ├─ CONNECT    → Tunnel (raw relay until either side closes)
//!               └─ Close      → Closed
//! ```

pub mod connection;
pub mod header;
pub mod parser;
pub mod request;
pub mod response;
pub mod transfer;
pub mod writer;
