//! Packet struct with typed accessors.
//!
//! Represents a complete protocol frame with flags, request id and body.
//! Uses `bytes::Bytes` for zero-copy body sharing.

use bytes::Bytes;

use super::wire_format::{compose_flag, flags, BodyKind, Header};
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Flags byte (see [`super::wire_format::flags`]).
    pub flag: u8,
    /// Request identifier.
    pub req: i32,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Packet {
    /// Create a new packet from its parts.
    pub fn new(flag: u8, req: i32, body: Bytes) -> Self {
        Self { flag, req, body }
    }

    /// Create a JSON-bodied packet.
    pub fn json(req: i32, body: Bytes, stream: bool, end_err: bool) -> Self {
        Self {
            flag: compose_flag(BodyKind::Json, stream, end_err),
            req,
            body,
        }
    }

    /// The goodbye marker ending a session.
    pub fn goodbye() -> Self {
        Self {
            flag: 0,
            req: 0,
            body: Bytes::new(),
        }
    }

    /// Build the header describing this packet.
    pub fn header(&self) -> Header {
        Header::new(self.flag, self.body.len() as u32, self.req)
    }

    /// The body kind announced by the flag byte.
    #[inline]
    pub fn body_kind(&self) -> Result<BodyKind> {
        BodyKind::from_flag(self.flag)
    }

    /// Check if the stream flag is set.
    #[inline]
    pub fn is_stream(&self) -> bool {
        flags::has_flag(self.flag, flags::STREAM)
    }

    /// Check if the end/err flag is set.
    #[inline]
    pub fn is_end_err(&self) -> bool {
        flags::has_flag(self.flag, flags::END_ERR)
    }

    /// Check if this is the goodbye marker.
    #[inline]
    pub fn is_goodbye(&self) -> bool {
        self.flag == 0 && self.req == 0 && self.body.is_empty()
    }
}

/// A normal end-of-stream body is exactly the four ASCII bytes `true`.
/// Anything else on an end/err frame is a [`crate::CallError`].
#[inline]
pub fn is_true_body(body: &[u8]) -> bool {
    body == b"true"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_creation() {
        let pkt = Packet::new(0b1010, 42, Bytes::from_static(b"{}"));
        assert_eq!(pkt.req, 42);
        assert!(pkt.is_stream());
        assert!(!pkt.is_end_err());
        assert_eq!(pkt.body_kind().unwrap(), BodyKind::Json);
    }

    #[test]
    fn test_json_constructor() {
        let pkt = Packet::json(7, Bytes::from_static(b"true"), true, true);
        assert!(pkt.is_stream());
        assert!(pkt.is_end_err());
        assert_eq!(pkt.body_kind().unwrap(), BodyKind::Json);
        assert_eq!(&pkt.body[..], b"true");
    }

    #[test]
    fn test_goodbye() {
        let pkt = Packet::goodbye();
        assert!(pkt.is_goodbye());
        assert!(pkt.header().is_goodbye());
    }

    #[test]
    fn test_header_reflects_body_len() {
        let pkt = Packet::json(1, Bytes::from_static(b"[1,2,3]"), false, false);
        let hdr = pkt.header();
        assert_eq!(hdr.body_len, 7);
        assert_eq!(hdr.req, 1);
        assert_eq!(hdr.flag, pkt.flag);
    }

    #[test]
    fn test_is_true_body() {
        assert!(is_true_body(b"true"));
        assert!(!is_true_body(b"true "));
        assert!(!is_true_body(b" true"));
        assert!(!is_true_body(b"TRUE"));
        assert!(!is_true_body(b"{\"name\":\"Error\"}"));
    }
}
