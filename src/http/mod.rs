//! HTTP/1.1 protocol implementation.
//!
//! This module implements the per-connection side of an HTTP/1.1 server:
//! framing, keep-alive, pipelining and protocol upgrade.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: Glues a socket to a frame and a timeout entry; drives the cycle
//! - **`frame`**: The protocol state machine (head, body framing, response framing)
//! - **`exchange`**: Body-read and body-write capabilities handed to the handler
//! - **`handler`**: The `RequestHandler` trait
//! - **`parser`**: Parses request heads from byte buffers
//! - **`chunked`**: Chunked transfer-encoding decoder and encoder
//! - **`request`**: HTTP request head representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`headers`**: Ordered, case-insensitive header list
//! - **`writer`**: Serializes status lines and headers
//!
//! # Connection Cycle
//!
//! Each client connection repeats this cycle until it closes or upgrades:
//!
//! ```text
//!        ┌─────────────────────┐
//!        │ AwaitingRequestLine │ ← idle timer armed
//!        └──────────┬──────────┘
//!                   │ head bytes arrive (timer disabled)
//!                   ▼
//!        ┌─────────────────────┐
//!        │   ReadingHeaders    │
//!        └──────────┬──────────┘
//!                   │ head parsed
//!                   ▼
//!        ┌──────────────────────────────────┐
//!        │ ReadingBody / ReadyForApplication│ ← handler invoked
//!        └──────────┬───────────────────────┘
//!                   │ response head written
//!                   ▼
//!        ┌─────────────────────┐
//!        │   WritingResponse   │
//!        └──────────┬──────────┘
//!                   │ response finished
//!                   ├─ Keep-Alive → AwaitingRequestLine (timer re-armed)
//!                   ├─ 101 → Upgraded (timer off for good)
//!                   └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```no_run
//! use h1loop::http::exchange::Exchange;
//! use h1loop::http::handler::RequestHandler;
//! use h1loop::http::response::Response;
//! use h1loop::io::AsyncSocketIo;
//!
//! struct Hello;
//!
//! impl RequestHandler for Hello {
//!     async fn handle<S: AsyncSocketIo>(&self, exchange: &mut Exchange<'_, S>) -> anyhow::Result<()> {
//!         exchange.send(Response::ok("hello\n")).await?;
//!         Ok(())
//!     }
//! }
//! ```

pub mod chunked;
pub mod connection;
pub mod exchange;
pub mod frame;
pub mod handler;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
