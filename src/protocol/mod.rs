//! Protocol module - wire format primitives.
//!
//! Provides:
//! - [`Header`] - the 9-byte frame header (flag, body length, request id)
//! - [`Packet`] - a complete frame with its body
//! - [`BodyKind`] - interpretation of body bytes (binary, text, json)

mod packet;
mod wire_format;

pub use packet::{is_true_body, Packet};
pub use wire_format::{
    compose_flag, flags, BodyKind, Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE,
};
