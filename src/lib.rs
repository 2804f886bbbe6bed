//! # muxrpc
//!
//! A multiplexed remote-procedure-call runtime over a single
//! bidirectional, ordered, reliable byte stream (a TCP connection or an
//! in-memory pipe, already authenticated by the caller).
//!
//! The wire protocol frames packets with a flag byte, a body length and a
//! signed 32-bit request id, and multiplexes four call shapes over one
//! transport, in both directions:
//!
//! - **async** - single reply
//! - **source** - the callee streams values to the caller
//! - **sink** - the caller streams values to the callee
//! - **duplex** - both sides stream
//!
//! ## Architecture
//!
//! - [`protocol`] - the frame header codec and packet type
//! - [`packer`] - buffered frame reader and serialized writer halves
//! - [`stream`] - per-request endpoints with capabilities and
//!   back-pressure
//! - [`request`] - the call envelope
//! - [`rpc`] - the session: id allocation, serve loop, termination
//! - [`handler`] - the contract with user code
//!
//! ## Example
//!
//! ```ignore
//! use muxrpc::{Handler, Method, Packer, Request, Rpc};
//!
//! struct Whoami;
//!
//! #[async_trait::async_trait]
//! impl Handler for Whoami {
//!     async fn handle_call(&self, req: Request, _rpc: &Rpc) {
//!         if req.method().parts() == ["whoami"] {
//!             let _ = req.respond(&"you are a test").await;
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> muxrpc::Result<()> {
//!     let conn = tokio::net::TcpStream::connect("localhost:8008").await?;
//!     let rpc = Rpc::handle(Packer::new(conn), Whoami);
//!
//!     let serve = { let rpc = rpc.clone(); tokio::spawn(async move { rpc.serve().await }) };
//!     let who: String = rpc.async_call(Method::new(["whoami"]), vec![]).await?;
//!     println!("{who}");
//!
//!     rpc.terminate().await?;
//!     serve.await.expect("serve panicked")
//! }
//! ```

pub mod error;
pub mod handler;
pub mod packer;
pub mod protocol;
pub mod request;
pub mod rpc;
pub mod stream;

pub use error::{CallError, Error, Result};
pub use handler::Handler;
pub use packer::Packer;
pub use request::{CallType, Method, Request};
pub use rpc::{Rpc, RpcOptions};
pub use stream::{Body, Stream, StreamCapability, DEFAULT_STREAM_BUFFER};
