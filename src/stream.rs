//! Per-request stream endpoints.
//!
//! Every call owns one [`Stream`]: a bidirectional conduit tied to a
//! request id. Reads come out of a bounded inbound queue fed by the
//! session's serve loop; writes go straight through the shared
//! [`FrameSink`](crate::packer::FrameSink), one frame per pour.
//!
//! Capabilities are fixed at construction and derived from the call type:
//! an `async` reply side may write once, a `source` side many times, a
//! non-writable side not at all. Violations surface synchronously to the
//! local caller without producing a frame.
//!
//! End-of-stream and remote errors are delivered in-band through the same
//! queue as data, so a consumer always drains buffered values before it
//! observes the end. Cancellation and session termination preempt the
//! queue instead.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, Error, Result};
use crate::packer::FrameSink;
use crate::protocol::{compose_flag, BodyKind, Packet};

/// Default bound of a stream's inbound queue, in frames.
///
/// If the consumer of a stream stops reading, the serve loop stops
/// draining once this many frames pile up and the peer stalls. Large
/// values can pin a lot of memory per slow stream.
pub const DEFAULT_STREAM_BUFFER: usize = 150;

/// Declared read/write shape of one stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCapability {
    /// Direction is unused.
    None,
    /// Exactly one frame may pass (async reply).
    Once,
    /// Any number of frames may pass.
    Many,
}

/// One frame payload, tagged with its wire interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Raw bytes.
    Binary(Bytes),
    /// UTF-8 text.
    Text(String),
    /// Raw JSON bytes, decoded on demand.
    Json(Bytes),
}

impl Body {
    /// JSON-encode a value into a body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Body::Json(serde_json::to_vec(value)?.into()))
    }

    /// Build a body from an inbound packet according to its kind flag.
    pub(crate) fn from_packet(pkt: &Packet) -> Result<Self> {
        match pkt.body_kind()? {
            BodyKind::Binary => Ok(Body::Binary(pkt.body.clone())),
            BodyKind::Text => {
                let text = std::str::from_utf8(&pkt.body)
                    .map_err(|_| Error::Protocol("invalid utf-8 in text body".to_string()))?;
                Ok(Body::Text(text.to_string()))
            }
            BodyKind::Json => Ok(Body::Json(pkt.body.clone())),
        }
    }

    /// The wire kind of this body.
    pub fn kind(&self) -> BodyKind {
        match self {
            Body::Binary(_) => BodyKind::Binary,
            Body::Text(_) => BodyKind::Text,
            Body::Json(_) => BodyKind::Json,
        }
    }

    /// View the payload bytes regardless of kind.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Binary(b) | Body::Json(b) => b,
            Body::Text(s) => s.as_bytes(),
        }
    }

    /// The text payload, if this is a text body.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Take the payload bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Body::Binary(b) | Body::Json(b) => b,
            Body::Text(s) => Bytes::from(s),
        }
    }

    /// JSON-decode the payload into a typed value.
    ///
    /// Only JSON bodies decode; use [`Body::as_str`] / [`Body::as_bytes`]
    /// for the other kinds.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Body::Json(b) => Ok(serde_json::from_slice(b)?),
            _ => Err(Error::Protocol(
                "typed decode requires a json body".to_string(),
            )),
        }
    }
}

/// What the serve loop feeds into a stream's inbound queue.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Data(Body),
    End,
    Failed(CallError),
}

/// Terminal state of a stream, sticky once reached.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    Eos,
    Remote(CallError),
    Cancelled,
    Terminated,
}

impl Terminal {
    fn into_error(self) -> Error {
        match self {
            Terminal::Eos => Error::StreamClosed,
            Terminal::Remote(e) => Error::Remote(e),
            Terminal::Cancelled => Error::Cancelled,
            Terminal::Terminated => Error::SessionTerminated,
        }
    }

    fn into_recv_result(self) -> Result<Option<Body>> {
        match self {
            Terminal::Eos => Ok(None),
            other => Err(other.into_error()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    out_closed: bool,
    poured_once: bool,
    /// Normal inbound end, reached only after the queue drained.
    in_terminal: Option<Terminal>,
    /// Whole-stream failure; preempts buffered data.
    fatal: Option<Terminal>,
}

struct StreamInner {
    req: i32,
    in_cap: StreamCapability,
    out_cap: StreamCapability,
    sink: FrameSink,
    rx: tokio::sync::Mutex<mpsc::Receiver<StreamItem>>,
    state: Mutex<State>,
    abort: CancellationToken,
}

/// Bidirectional per-request conduit. Cheap to clone.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(
        req: i32,
        in_cap: StreamCapability,
        out_cap: StreamCapability,
        sink: FrameSink,
        buffer: usize,
        abort: CancellationToken,
    ) -> (Self, mpsc::Sender<StreamItem>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let stream = Self {
            inner: Arc::new(StreamInner {
                req,
                in_cap,
                out_cap,
                sink,
                rx: tokio::sync::Mutex::new(rx),
                state: Mutex::new(State::default()),
                abort,
            }),
        };
        (stream, tx)
    }

    /// The request id frames of this stream carry on the wire.
    #[inline]
    pub fn req(&self) -> i32 {
        self.inner.req
    }

    /// Inbound capability.
    #[inline]
    pub fn in_capability(&self) -> StreamCapability {
        self.inner.in_cap
    }

    /// Outbound capability.
    #[inline]
    pub fn out_capability(&self) -> StreamCapability {
        self.inner.out_cap
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("stream state lock poisoned")
    }

    /// Receive the next inbound payload.
    ///
    /// Returns `Ok(None)` once the peer has ended the stream; a remote
    /// error, cancellation or session termination is returned as `Err` on
    /// this and every later call.
    pub async fn recv(&self) -> Result<Option<Body>> {
        let mut rx = self.inner.rx.lock().await;

        // Terminal failures preempt buffered data; a normal end travels
        // in-band through the queue so buffered values drain first.
        if let Some(t) = self.state().fatal.clone() {
            return t.into_recv_result();
        }

        match rx.try_recv() {
            Ok(item) => return self.accept(item),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return self.end_of_stream(),
        }

        if let Some(t) = self.state().in_terminal.clone() {
            return t.into_recv_result();
        }

        tokio::select! {
            biased;
            _ = self.inner.abort.cancelled() => {
                // Drain anything that raced in ahead of the cancellation.
                if let Ok(item) = rx.try_recv() {
                    return self.accept(item);
                }
                let t = {
                    let mut st = self.state();
                    st.fatal.get_or_insert(Terminal::Cancelled).clone()
                };
                t.into_recv_result()
            }
            item = rx.recv() => match item {
                Some(item) => self.accept(item),
                None => self.end_of_stream(),
            },
        }
    }

    /// Receive the next inbound payload, JSON-decoded into `T`.
    pub async fn recv_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.recv().await? {
            Some(body) => Ok(Some(body.decode()?)),
            None => Ok(None),
        }
    }

    fn accept(&self, item: StreamItem) -> Result<Option<Body>> {
        match item {
            StreamItem::Data(body) => Ok(Some(body)),
            StreamItem::End => {
                self.state().in_terminal.get_or_insert(Terminal::Eos);
                Ok(None)
            }
            StreamItem::Failed(err) => {
                {
                    let mut st = self.state();
                    st.fatal.get_or_insert(Terminal::Remote(err.clone()));
                    // The peer tore the call down, writes are dead too.
                    st.out_closed = true;
                }
                Err(Error::Remote(err))
            }
        }
    }

    fn end_of_stream(&self) -> Result<Option<Body>> {
        let mut st = self.state();
        if let Some(t) = st.fatal.clone() {
            return t.into_recv_result();
        }
        st.in_terminal.get_or_insert(Terminal::Eos).clone().into_recv_result()
    }

    /// Send one outbound payload frame.
    pub async fn pour(&self, body: Body) -> Result<()> {
        let flag = {
            let mut st = self.state();
            if self.inner.out_cap == StreamCapability::None {
                return Err(Error::CapabilityViolation("pour on a non-writable stream"));
            }
            if let Some(t) = st.fatal.clone() {
                return Err(t.into_error());
            }
            if self.inner.abort.is_cancelled() {
                st.fatal.get_or_insert(Terminal::Cancelled);
                return Err(Error::Cancelled);
            }
            if st.out_closed {
                return Err(Error::StreamClosed);
            }
            if self.inner.out_cap == StreamCapability::Once && st.poured_once {
                return Err(Error::CapabilityViolation(
                    "second pour on a single-shot stream",
                ));
            }
            st.poured_once = true;
            compose_flag(
                body.kind(),
                self.inner.out_cap == StreamCapability::Many,
                false,
            )
        };

        let pkt = Packet::new(flag, self.inner.req, body.into_bytes());
        self.inner.sink.pour(&pkt).await
    }

    /// JSON-encode a value and send it as one payload frame.
    pub async fn pour_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.pour(Body::json(value)?).await
    }

    /// Close the outbound side with a normal end-of-stream frame.
    ///
    /// Idempotent: the second call is a no-op. A single-shot stream that
    /// already sent its reply closes without a separate end frame.
    pub async fn close(&self) -> Result<()> {
        let end_frame = {
            let mut st = self.state();
            if st.out_closed {
                return Ok(());
            }
            st.out_closed = true;
            !(self.inner.out_cap == StreamCapability::Once && st.poured_once)
        };

        if end_frame {
            let pkt = Packet::json(
                self.inner.req,
                Bytes::from_static(b"true"),
                self.inner.out_cap == StreamCapability::Many,
                true,
            );
            self.inner.sink.pour(&pkt).await?;
        }
        Ok(())
    }

    /// Fail the stream on both sides.
    ///
    /// Sends an end/err frame carrying `err` (unless the outbound side is
    /// already closed) and marks the stream terminally failed: later reads
    /// and writes return `err`. A subsequent [`Stream::close`] does not
    /// overwrite it.
    pub async fn close_with_error(&self, err: CallError) -> Result<()> {
        let send = {
            let mut st = self.state();
            let send = !st.out_closed;
            st.out_closed = true;
            st.fatal.get_or_insert(Terminal::Remote(err.clone()));
            send
        };
        self.inner.abort.cancel();

        if send {
            let body = serde_json::to_vec(&err)?;
            let pkt = Packet::json(
                self.inner.req,
                body.into(),
                self.inner.out_cap == StreamCapability::Many,
                true,
            );
            self.inner.sink.pour(&pkt).await?;
        }
        Ok(())
    }

    /// Tear the stream down locally without sending anything.
    pub(crate) fn kill(&self, terminal: Terminal) {
        {
            let mut st = self.state();
            st.fatal.get_or_insert(terminal);
            st.out_closed = true;
        }
        self.inner.abort.cancel();
    }

    /// Cancel the request's handler context.
    pub(crate) fn cancel(&self) {
        self.inner.abort.cancel();
    }

    /// The cancellation token tied to this stream's request.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.inner.abort
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("req", &self.inner.req)
            .field("in_cap", &self.inner.in_cap)
            .field("out_cap", &self.inner.out_cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::Packer;
    use crate::protocol::is_true_body;
    use tokio::io::duplex;

    fn test_stream(
        in_cap: StreamCapability,
        out_cap: StreamCapability,
    ) -> (Stream, mpsc::Sender<StreamItem>, crate::packer::FrameReader) {
        let (a, b) = duplex(64 * 1024);
        let Packer { sink, .. } = Packer::new(a);
        let Packer { reader, .. } = Packer::new(b);
        let (stream, tx) = Stream::new(1, in_cap, out_cap, sink, 16, CancellationToken::new());
        (stream, tx, reader)
    }

    #[tokio::test]
    async fn test_recv_data_then_eos() {
        let (stream, tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::None);

        tx.send(StreamItem::Data(Body::Text("one".into()))).await.unwrap();
        tx.send(StreamItem::Data(Body::Text("two".into()))).await.unwrap();
        tx.send(StreamItem::End).await.unwrap();

        assert_eq!(stream.recv().await.unwrap().unwrap().as_str(), Some("one"));
        assert_eq!(stream.recv().await.unwrap().unwrap().as_str(), Some("two"));
        assert!(stream.recv().await.unwrap().is_none());
        // EOS is sticky.
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffered_data_drains_even_after_cancel() {
        let (stream, tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::None);

        tx.send(StreamItem::Data(Body::Text("kept".into()))).await.unwrap();
        tx.send(StreamItem::End).await.unwrap();
        stream.cancel();

        assert_eq!(stream.recv().await.unwrap().unwrap().as_str(), Some("kept"));
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_error_is_terminal() {
        let (stream, tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::Many);

        tx.send(StreamItem::Failed(CallError::new("Error", "boom")))
            .await
            .unwrap();

        let first = stream.recv().await;
        let Err(Error::Remote(e)) = first else {
            panic!("expected remote error, got {first:?}");
        };
        assert_eq!(e.message, "boom");

        // Same terminal state on every later read and write.
        assert!(matches!(stream.recv().await, Err(Error::Remote(_))));
        assert!(matches!(
            stream.pour(Body::Text("x".into())).await,
            Err(Error::Remote(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_fails_waiting_recv() {
        let (stream, _tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::None);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.recv().await })
        };
        tokio::task::yield_now().await;
        stream.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_pour_on_non_writable_stream() {
        let (stream, _tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::None);

        let result = stream.pour(Body::Text("nope".into())).await;
        assert!(matches!(result, Err(Error::CapabilityViolation(_))));
    }

    #[tokio::test]
    async fn test_single_shot_second_pour_rejected() {
        let (stream, _tx, mut reader) = test_stream(StreamCapability::None, StreamCapability::Once);

        stream.pour_json(&"reply").await.unwrap();
        let result = stream.pour_json(&"again").await;
        assert!(matches!(result, Err(Error::CapabilityViolation(_))));

        // Exactly one frame on the wire, without the stream flag.
        let pkt = reader.next_packet().await.unwrap().unwrap();
        assert!(!pkt.is_stream());
        assert_eq!(&pkt.body[..], b"\"reply\"");
    }

    #[tokio::test]
    async fn test_many_pour_sets_stream_flag() {
        let (stream, _tx, mut reader) = test_stream(StreamCapability::None, StreamCapability::Many);

        stream.pour_json(&1).await.unwrap();
        let pkt = reader.next_packet().await.unwrap().unwrap();
        assert!(pkt.is_stream());
        assert!(!pkt.is_end_err());
    }

    #[tokio::test]
    async fn test_close_sends_true_and_is_idempotent() {
        let (stream, _tx, mut reader) = test_stream(StreamCapability::None, StreamCapability::Many);

        stream.close().await.unwrap();
        stream.close().await.unwrap();

        let pkt = reader.next_packet().await.unwrap().unwrap();
        assert!(pkt.is_end_err());
        assert!(pkt.is_stream());
        assert!(is_true_body(&pkt.body));

        let result = stream.pour(Body::Text("after close".into())).await;
        assert!(matches!(result, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_single_shot_close_after_reply_sends_no_end_frame() {
        let (stream, _tx, mut reader) = test_stream(StreamCapability::None, StreamCapability::Once);

        stream.pour_json(&"done").await.unwrap();
        stream.close().await.unwrap();

        let pkt = reader.next_packet().await.unwrap().unwrap();
        assert!(!pkt.is_end_err());
        assert_eq!(&pkt.body[..], b"\"done\"");
    }

    #[tokio::test]
    async fn test_close_with_error_then_close_keeps_error() {
        let (stream, _tx, mut reader) = test_stream(StreamCapability::Many, StreamCapability::Many);

        stream
            .close_with_error(CallError::new("Error", "handler exploded"))
            .await
            .unwrap();
        stream.close().await.unwrap();

        let pkt = reader.next_packet().await.unwrap().unwrap();
        assert!(pkt.is_end_err());
        let err: CallError = serde_json::from_slice(&pkt.body).unwrap();
        assert_eq!(err.message, "handler exploded");

        // Reads keep returning the original error.
        assert!(matches!(stream.recv().await, Err(Error::Remote(_))));
    }

    #[tokio::test]
    async fn test_kill_terminated() {
        let (stream, _tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::Many);

        stream.kill(Terminal::Terminated);

        assert!(matches!(stream.recv().await, Err(Error::SessionTerminated)));
        assert!(matches!(
            stream.pour(Body::Text("x".into())).await,
            Err(Error::SessionTerminated)
        ));
    }

    #[tokio::test]
    async fn test_senders_dropped_reads_as_eos() {
        let (stream, tx, _reader) = test_stream(StreamCapability::Many, StreamCapability::None);
        drop(tx);
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[test]
    fn test_body_kinds_and_accessors() {
        let bin = Body::Binary(Bytes::from_static(b"\x00\x01"));
        assert_eq!(bin.kind(), BodyKind::Binary);
        assert_eq!(bin.as_bytes(), b"\x00\x01");
        assert!(bin.as_str().is_none());

        let text = Body::Text("hi".into());
        assert_eq!(text.kind(), BodyKind::Text);
        assert_eq!(text.as_str(), Some("hi"));

        let json = Body::json(&vec![1, 2, 3]).unwrap();
        assert_eq!(json.kind(), BodyKind::Json);
        let decoded: Vec<i32> = json.decode().unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn test_typed_decode_requires_json() {
        let text = Body::Text("hi".into());
        assert!(text.decode::<String>().is_err());
    }

    #[test]
    fn test_body_from_packet_invalid_utf8() {
        let pkt = Packet::new(
            compose_flag(BodyKind::Text, false, false),
            1,
            Bytes::from_static(&[0xFF, 0xFE]),
        );
        let result = Body::from_packet(&pkt);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("utf-8"));
    }
}
