//! TCP front end: accepts client sockets and runs one connection task per
//! socket.

pub mod listener;

pub use listener::{run, serve};
