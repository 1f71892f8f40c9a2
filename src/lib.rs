//! h1loop - HTTP/1.1 connection core
//!
//! Per-connection framing, keep-alive and upgrade on a fixed pool of
//! single-threaded event loops, with idle-timeout enforcement that only runs
//! while a connection is waiting for its next request.

pub mod config;
pub mod error;
pub mod http;
pub mod io;
pub mod server;
