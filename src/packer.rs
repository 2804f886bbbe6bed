//! Buffered reader/writer pair over the transport.
//!
//! The [`Packer`] adapts a bidirectional byte stream into a frame stream:
//!
//! - [`FrameReader`] accumulates raw reads and extracts complete packets
//!   with a header/body state machine. It is single-consumer by contract:
//!   only the session's serve loop reads from it.
//! - [`FrameSink`] is a cheaply cloneable writer handle. Each pour writes
//!   header and body while holding the writer lock, so concurrent pours
//!   are linearized and frames never interleave on the wire.
//!
//! Inbound request ids are sign-flipped here, so the request table is
//! always keyed in originator-relative terms: positive ids for calls this
//! side initiated, negative ids for calls the peer initiated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{Header, Packet, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};

/// Read chunk size for transport reads.
const READ_CHUNK: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for a complete header (need 9 bytes).
    Header,
    /// Header parsed, waiting for the body bytes.
    Body(Header),
}

/// Reads packets off the transport.
pub struct FrameReader {
    reader: BoxedReader,
    buffer: BytesMut,
    state: DecodeState,
    max_body_size: u32,
    done: bool,
}

impl FrameReader {
    /// Wrap a read half with the default body size limit.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::with_max_body(reader, DEFAULT_MAX_BODY_SIZE)
    }

    /// Wrap a read half with a custom body size limit.
    pub fn with_max_body(reader: impl AsyncRead + Send + Unpin + 'static, max_body_size: u32) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            state: DecodeState::Header,
            max_body_size,
            done: false,
        }
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the session ended gracefully: a goodbye
    /// marker, or EOF at a frame boundary. EOF inside a frame is a
    /// protocol error. Inbound request ids come back sign-flipped.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if self.done {
                return Ok(None);
            }

            if let Some(pkt) = self.try_extract()? {
                if pkt.is_goodbye() {
                    self.done = true;
                    return Ok(None);
                }
                let req = pkt.req.checked_neg().ok_or_else(|| {
                    Error::Protocol("request id out of range".to_string())
                })?;
                return Ok(Some(Packet::new(pkt.flag, req, pkt.body)));
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.done = true;
                if self.buffer.is_empty() && matches!(self.state, DecodeState::Header) {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "transport closed mid-frame".to_string(),
                ));
            }
        }
    }

    /// Try to extract a single packet from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed.
    fn try_extract(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = Header::decode(&self.buffer[..HEADER_SIZE])
                        .expect("buffer has enough bytes");
                    self.buffer.advance(HEADER_SIZE);

                    if header.is_goodbye() {
                        return Ok(Some(Packet::goodbye()));
                    }

                    header.validate(self.max_body_size)?;

                    if header.body_len == 0 {
                        return Ok(Some(Packet::new(header.flag, header.req, Default::default())));
                    }

                    self.state = DecodeState::Body(header);
                }

                DecodeState::Body(header) => {
                    let want = header.body_len as usize;
                    if self.buffer.len() < want {
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(want).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(Packet::new(header.flag, header.req, body)));
                }
            }
        }
    }
}

/// Shared, serialized writer over the transport.
///
/// Clones share one writer lock; a pour holds it across header and body so
/// frames from concurrent writers never interleave.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl FrameSink {
    /// Wrap a write half.
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                writer: Mutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Write one packet atomically and flush.
    pub async fn pour(&self, pkt: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionTerminated);
        }

        let header = pkt.header().encode();
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&header).await?;
        if !pkt.body.is_empty() {
            writer.write_all(&pkt.body).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Send the goodbye marker.
    pub async fn goodbye(&self) -> Result<()> {
        self.pour(&Packet::goodbye()).await
    }

    /// Shut the transport down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Check whether the sink has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// The buffered frame reader/writer pair for one session.
pub struct Packer {
    pub(crate) reader: FrameReader,
    pub(crate) sink: FrameSink,
}

impl Packer {
    /// Split a bidirectional transport into a packer.
    pub fn new<T>(transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_max_body(transport, DEFAULT_MAX_BODY_SIZE)
    }

    /// Split a transport with a custom body size limit.
    pub fn with_max_body<T>(transport: T, max_body_size: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: FrameReader::with_max_body(read_half, max_body_size),
            sink: FrameSink::new(write_half),
        }
    }

    /// Take the halves apart.
    pub fn into_parts(self) -> (FrameReader, FrameSink) {
        (self.reader, self.sink)
    }
}
