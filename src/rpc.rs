//! RPC session: request multiplexing over one transport.
//!
//! An [`Rpc`] owns the packer halves, the table of live requests and the
//! request-id allocator. Both endpoints of a session are symmetric: each
//! may initiate calls while serving the peer's.
//!
//! # Lifecycle
//!
//! 1. Build a session with [`Rpc::handle`] over a split transport.
//! 2. Drive it with [`Rpc::serve`] (one task per session).
//! 3. Issue calls with [`Rpc::async_call`] / [`Rpc::source`] /
//!    [`Rpc::sink`] / [`Rpc::duplex`] from any task.
//! 4. Shut down with [`Rpc::terminate`].
//!
//! # Example
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
//! # async fn run(conn: tokio::io::DuplexStream) -> muxrpc::Result<()> {
//! let rpc = Rpc::handle(Packer::new(conn), Whoami);
//! let serve = { let rpc = rpc.clone(); tokio::spawn(async move { rpc.serve().await }) };
//! let who: String = rpc.async_call(Method::new(["whoami"]), vec![]).await?;
//! rpc.terminate().await?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, Error, Result};
use crate::handler::Handler;
use crate::packer::{FrameReader, FrameSink, Packer};
use crate::protocol::{is_true_body, BodyKind, Packet};
use crate::request::{empty_args, CallType, Method, Request, RequestEnvelope, WireRequest};
use crate::stream::{Body, Stream, StreamCapability, StreamItem, Terminal, DEFAULT_STREAM_BUFFER};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Bound of each stream's inbound queue, in frames.
    pub stream_buffer: usize,
    /// Peer identity to report from [`Rpc::remote`], if the transport has
    /// one.
    pub remote: Option<SocketAddr>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            stream_buffer: DEFAULT_STREAM_BUFFER,
            remote: None,
        }
    }
}

/// Session-side record of one live request.
#[derive(Clone)]
struct Entry {
    tx: mpsc::Sender<StreamItem>,
    stream: Stream,
}

struct ReqTable {
    /// Highest request id allocated so far on this side.
    highest: i32,
    entries: HashMap<i32, Entry>,
}

struct RpcInner {
    sink: FrameSink,
    reader: tokio::sync::Mutex<Option<FrameReader>>,
    table: Mutex<ReqTable>,
    terminated: AtomicBool,
    shutdown: CancellationToken,
    handler: Arc<dyn Handler>,
    remote: Option<SocketAddr>,
    stream_buffer: usize,
}

/// One end of an RPC session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl Rpc {
    /// Set up a session over the packer with default options.
    ///
    /// Dispatches `handle_connect` on a fresh task, so this must run
    /// inside a tokio runtime.
    pub fn handle(packer: Packer, handler: impl Handler) -> Self {
        Self::handle_with_options(packer, handler, RpcOptions::default())
    }

    /// Set up a session with explicit options.
    pub fn handle_with_options(packer: Packer, handler: impl Handler, options: RpcOptions) -> Self {
        let (reader, sink) = packer.into_parts();
        let rpc = Self {
            inner: Arc::new(RpcInner {
                sink,
                reader: tokio::sync::Mutex::new(Some(reader)),
                table: Mutex::new(ReqTable {
                    highest: 0,
                    entries: HashMap::new(),
                }),
                terminated: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                handler: Arc::new(handler),
                remote: options.remote,
                stream_buffer: options.stream_buffer,
            }),
        };

        let connected = rpc.clone();
        tokio::spawn(async move {
            let handler = connected.inner.handler.clone();
            handler.handle_connect(&connected).await;
        });

        rpc
    }

    fn table(&self) -> MutexGuard<'_, ReqTable> {
        self.inner.table.lock().expect("request table lock poisoned")
    }

    fn lookup(&self, id: i32) -> Option<Entry> {
        self.table().entries.get(&id).cloned()
    }

    fn remove_entry(&self, id: i32) -> Option<Entry> {
        self.table().entries.remove(&id)
    }

    /// Whether the session has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// The peer identity, if one was configured.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    /// Initiate a call: allocate an id, install the request, send the
    /// initiation frame.
    async fn start_call(
        &self,
        call_type: CallType,
        method: Method,
        args: Vec<Value>,
    ) -> Result<Request> {
        if self.is_terminated() {
            return Err(Error::SessionTerminated);
        }

        let raw_args = RawValue::from_string(serde_json::to_string(&args)?)?;
        let body = serde_json::to_vec(&WireRequest {
            name: &method,
            call_type,
            args: &raw_args,
        })?;

        let req = {
            let mut table = self.table();
            table.highest += 1;
            let id = table.highest;

            let abort = self.inner.shutdown.child_token();
            let (in_cap, out_cap) = call_type.originator_caps();
            let (stream, tx) = Stream::new(
                id,
                in_cap,
                out_cap,
                self.inner.sink.clone(),
                self.inner.stream_buffer,
                abort.clone(),
            );
            table.entries.insert(
                id,
                Entry {
                    tx,
                    stream: stream.clone(),
                },
            );

            Request::new(id, call_type, method, raw_args, stream, abort)
        };

        tracing::debug!(id = req.id(), method = %req.method(), call = %call_type, "sending request");

        let pkt = Packet::json(req.id(), body.into(), call_type.is_stream(), false);
        if let Err(e) = self.inner.sink.pour(&pkt).await {
            self.remove_entry(req.id());
            return Err(e);
        }
        Ok(req)
    }

    /// Call an async method and JSON-decode the single reply.
    pub async fn async_call<T: DeserializeOwned>(
        &self,
        method: Method,
        args: Vec<Value>,
    ) -> Result<T> {
        self.async_raw(method, args).await?.decode()
    }

    /// Call an async method and return the reply payload as-is.
    pub async fn async_raw(&self, method: Method, args: Vec<Value>) -> Result<Body> {
        let req = self.start_call(CallType::Async, method, args).await?;
        match req.stream().recv().await? {
            Some(body) => Ok(body),
            None => Err(Error::UnexpectedEnd),
        }
    }

    /// Start a source call: the peer streams values to us.
    pub async fn source(&self, method: Method, args: Vec<Value>) -> Result<Stream> {
        Ok(self
            .start_call(CallType::Source, method, args)
            .await?
            .into_stream())
    }

    /// Start a sink call: we stream values to the peer.
    pub async fn sink(&self, method: Method, args: Vec<Value>) -> Result<Stream> {
        Ok(self
            .start_call(CallType::Sink, method, args)
            .await?
            .into_stream())
    }

    /// Start a duplex call: both sides stream.
    pub async fn duplex(&self, method: Method, args: Vec<Value>) -> Result<Stream> {
        Ok(self
            .start_call(CallType::Duplex, method, args)
            .await?
            .into_stream())
    }

    /// Drive the session: demultiplex inbound frames until the peer says
    /// goodbye, the transport fails, or the session is terminated.
    ///
    /// Returns `Ok(())` on graceful shutdown, including shutdown through
    /// [`Rpc::terminate`]. May be called once per session.
    pub async fn serve(&self) -> Result<()> {
        let mut reader = self.inner.reader.lock().await.take().ok_or_else(|| {
            Error::Protocol("serve may only be called once per session".to_string())
        })?;

        tracing::debug!("serving");
        let result = self.serve_loop(&mut reader).await;
        let _ = self.terminate().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "serve failed");
        }
        result
    }

    async fn serve_loop(&self, reader: &mut FrameReader) -> Result<()> {
        loop {
            let pkt = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                next = reader.next_packet() => match next {
                    Ok(Some(pkt)) => pkt,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        if self.is_terminated() {
                            return Ok(());
                        }
                        return Err(e);
                    }
                },
            };

            if pkt.is_end_err() {
                self.route_end(pkt).await?;
            } else {
                self.route_data(pkt).await?;
            }
        }
    }

    /// Route a payload frame: to a live stream, or open a new request.
    async fn route_data(&self, pkt: Packet) -> Result<()> {
        if let Some(entry) = self.lookup(pkt.req) {
            return self.deliver(&entry, pkt).await;
        }

        // Unknown id. Inbound new calls carry the peer's (negated) id and
        // are negative here; a positive id would be a reply to a call we
        // never made.
        if pkt.req >= 0 {
            return Err(Error::Protocol(format!(
                "unroutable frame for request {}",
                pkt.req
            )));
        }

        let request = self.accept_request(&pkt)?;
        let rpc = self.clone();
        let handler = self.inner.handler.clone();
        tokio::spawn(async move {
            let id = request.id();
            let method = request.method().to_string();
            handler.handle_call(request, &rpc).await;
            tracing::debug!(id, method = %method, "handler returned");
        });
        Ok(())
    }

    /// Parse the initiation frame of a new incoming call and install it.
    fn accept_request(&self, pkt: &Packet) -> Result<Request> {
        if pkt.body_kind()? != BodyKind::Json {
            return Err(Error::Protocol(
                "request initiation requires a json body".to_string(),
            ));
        }

        let envelope: RequestEnvelope = serde_json::from_slice(&pkt.body)
            .map_err(|e| Error::Protocol(format!("invalid request envelope: {e}")))?;

        let call_type = if pkt.is_stream() {
            match envelope.call_type {
                Some(ct @ (CallType::Source | CallType::Sink | CallType::Duplex)) => ct,
                Some(other) => {
                    return Err(Error::Protocol(format!("unhandled request type: {other}")))
                }
                None => {
                    return Err(Error::Protocol(
                        "missing request type on stream call".to_string(),
                    ))
                }
            }
        } else {
            match envelope.call_type {
                None | Some(CallType::Async) => CallType::Async,
                Some(other) => {
                    return Err(Error::Protocol(format!("unhandled request type: {other}")))
                }
            }
        };

        let raw_args = envelope.args.unwrap_or_else(empty_args);
        let abort = self.inner.shutdown.child_token();
        let (in_cap, out_cap) = call_type.handler_caps();
        let (stream, tx) = Stream::new(
            pkt.req,
            in_cap,
            out_cap,
            self.inner.sink.clone(),
            self.inner.stream_buffer,
            abort.clone(),
        );

        self.table().entries.insert(
            pkt.req,
            Entry {
                tx,
                stream: stream.clone(),
            },
        );

        tracing::debug!(id = pkt.req, method = %envelope.name, call = %call_type, "incoming request");
        Ok(Request::new(
            pkt.req,
            call_type,
            envelope.name,
            raw_args,
            stream,
            abort,
        ))
    }

    /// Feed one payload frame into a live stream's inbound queue.
    ///
    /// Awaiting a full queue here is the back-pressure path: the serve
    /// loop stalls, and with it the peer.
    async fn deliver(&self, entry: &Entry, pkt: Packet) -> Result<()> {
        if entry.stream.in_capability() == StreamCapability::None {
            return Err(Error::Protocol(format!(
                "payload frame for non-readable request {}",
                pkt.req
            )));
        }

        let body = Body::from_packet(&pkt)?;
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Ok(()),
            sent = entry.tx.send(StreamItem::Data(body)) => {
                if sent.is_err() {
                    tracing::debug!(id = pkt.req, "dropping frame for abandoned stream");
                }
                Ok(())
            }
        }
    }

    /// Handle an end/err frame: close the request's inbound side with EOS
    /// or the carried error, cancel its handler context, retire it.
    async fn route_end(&self, pkt: Packet) -> Result<()> {
        let Some(entry) = self.remove_entry(pkt.req) else {
            tracing::warn!(id = pkt.req, "end frame for unknown request");
            return Ok(());
        };

        let item = if is_true_body(&pkt.body) {
            StreamItem::End
        } else {
            let err: CallError = serde_json::from_slice(&pkt.body)
                .map_err(|e| Error::Protocol(format!("invalid error body: {e}")))?;
            StreamItem::Failed(err)
        };

        // Queue the terminal item before cancelling, so a consumer that is
        // mid-drain observes every buffered value and then the end.
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {}
            sent = entry.tx.send(item) => {
                if sent.is_err() {
                    tracing::debug!(id = pkt.req, "stream abandoned before end frame");
                }
            }
        }
        entry.stream.cancel();
        Ok(())
    }

    /// End the session: fail all live requests, send the goodbye marker,
    /// close the transport. Idempotent.
    pub async fn terminate(&self) -> Result<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!("terminating session");
        self.inner.shutdown.cancel();

        let entries: Vec<Entry> = {
            let mut table = self.table();
            table.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.stream.kill(Terminal::Terminated);
        }

        let _ = self.inner.sink.goodbye().await;
        self.inner.sink.close().await
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("remote", &self.inner.remote)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::duplex;

    struct Reply;

    #[async_trait]
    impl Handler for Reply {
        async fn handle_call(&self, req: Request, _rpc: &Rpc) {
            let _ = req.respond(&"ok").await;
        }
    }

    fn session_pair() -> (Rpc, Rpc) {
        let (a, b) = duplex(64 * 1024);
        let rpc_a = Rpc::handle(Packer::new(a), Reply);
        let rpc_b = Rpc::handle(Packer::new(b), Reply);
        for rpc in [&rpc_a, &rpc_b] {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.serve().await });
        }
        (rpc_a, rpc_b)
    }

    #[tokio::test]
    async fn test_request_ids_strictly_increasing() {
        let (rpc_a, _rpc_b) = session_pair();

        let mut last = 0;
        for _ in 0..3 {
            let req = rpc_a
                .start_call(CallType::Async, Method::new(["whoami"]), vec![])
                .await
                .unwrap();
            assert!(req.id() > last);
            assert!(req.id() > 0);
            last = req.id();
        }

        rpc_a.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_fail_after_terminate() {
        let (rpc_a, _rpc_b) = session_pair();

        rpc_a.terminate().await.unwrap();
        let result = rpc_a
            .async_call::<String>(Method::new(["whoami"]), vec![])
            .await;
        assert!(matches!(result, Err(Error::SessionTerminated)));
    }

    #[tokio::test]
    async fn test_terminate_idempotent() {
        let (rpc_a, _rpc_b) = session_pair();
        rpc_a.terminate().await.unwrap();
        rpc_a.terminate().await.unwrap();
        assert!(rpc_a.is_terminated());
    }

    #[tokio::test]
    async fn test_remote_from_options() {
        let (a, b) = duplex(4096);
        let addr: SocketAddr = "127.0.0.1:8008".parse().unwrap();
        let rpc = Rpc::handle_with_options(
            Packer::new(a),
            Reply,
            RpcOptions {
                remote: Some(addr),
                ..RpcOptions::default()
            },
        );
        assert_eq!(rpc.remote(), Some(addr));
        assert!(Rpc::handle(Packer::new(b), Reply).remote().is_none());
    }
}
