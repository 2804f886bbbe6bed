//! Request envelope and call types.
//!
//! A [`Request`] describes one call: the routable method path, the call
//! type, the raw JSON argument array, and the per-request [`Stream`]. On
//! the wire the initiation frame carries the JSON envelope
//! `{"name":[…],"type":"…","args":[…]}` with the json flag set.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, Result};
use crate::stream::{Stream, StreamCapability};

/// The four call shapes of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Single reply.
    Async,
    /// Server-streaming.
    Source,
    /// Client-streaming.
    Sink,
    /// Bidirectional streaming.
    Duplex,
}

impl CallType {
    /// Whether frames of this call carry the stream flag.
    #[inline]
    pub fn is_stream(self) -> bool {
        !matches!(self, CallType::Async)
    }

    /// Stream capabilities on the side that received the call:
    /// `(inbound, outbound)`.
    pub fn handler_caps(self) -> (StreamCapability, StreamCapability) {
        match self {
            CallType::Async => (StreamCapability::None, StreamCapability::Once),
            CallType::Source => (StreamCapability::None, StreamCapability::Many),
            CallType::Sink => (StreamCapability::Many, StreamCapability::None),
            CallType::Duplex => (StreamCapability::Many, StreamCapability::Many),
        }
    }

    /// Stream capabilities on the side that initiated the call: the
    /// mirror image of [`CallType::handler_caps`].
    pub fn originator_caps(self) -> (StreamCapability, StreamCapability) {
        let (handler_in, handler_out) = self.handler_caps();
        (handler_out, handler_in)
    }

    /// The wire name of this call type.
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Async => "async",
            CallType::Source => "source",
            CallType::Sink => "sink",
            CallType::Duplex => "duplex",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routable method path: an ordered sequence of name parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Vec<String>);

impl Method {
    /// Build a method path from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The path parts.
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl<S: Into<String>> FromIterator<S> for Method {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Inbound shape of the initiation body.
#[derive(Debug, Deserialize)]
pub(crate) struct RequestEnvelope {
    pub name: Method,
    #[serde(rename = "type", default)]
    pub call_type: Option<CallType>,
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
}

/// Outbound shape of the initiation body.
#[derive(Serialize)]
pub(crate) struct WireRequest<'a> {
    pub name: &'a Method,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub args: &'a RawValue,
}

/// Empty argument list. Absent args always normalize to `[]`, never
/// `null`.
pub(crate) fn empty_args() -> Box<RawValue> {
    RawValue::from_string("[]".to_string()).expect("valid JSON literal")
}

/// One call, as seen by either side of the session.
pub struct Request {
    id: i32,
    call_type: CallType,
    method: Method,
    raw_args: Box<RawValue>,
    stream: Stream,
    abort: CancellationToken,
}

impl Request {
    pub(crate) fn new(
        id: i32,
        call_type: CallType,
        method: Method,
        raw_args: Box<RawValue>,
        stream: Stream,
        abort: CancellationToken,
    ) -> Self {
        Self {
            id,
            call_type,
            method,
            raw_args,
            stream,
            abort,
        }
    }

    /// Session-local request id: positive if this side initiated the
    /// call, negative if the peer did.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The call shape.
    #[inline]
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// The method path being called.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw JSON argument array.
    pub fn args(&self) -> &RawValue {
        &self.raw_args
    }

    /// Decode the argument array into a typed value.
    pub fn parse_args<'a, T: Deserialize<'a>>(&'a self) -> Result<T> {
        Ok(serde_json::from_str(self.raw_args.get())?)
    }

    /// The stream carrying this call's frames.
    #[inline]
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Take the stream out of the request.
    pub fn into_stream(self) -> Stream {
        self.stream
    }

    /// Cancellation handle for the handler-side context. Cancelled when
    /// the peer ends the call or the session terminates.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Reply to an async call with a single value and finish the request.
    ///
    /// Sends exactly one non-stream JSON frame; no separate end frame
    /// follows.
    pub async fn respond<T: Serialize>(&self, value: &T) -> Result<()> {
        self.stream.pour_json(value).await?;
        self.stream.close().await
    }

    /// Fail the request on both sides.
    pub async fn close_with_error(&self, err: CallError) -> Result<()> {
        self.stream.close_with_error(err).await
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("type", &self.call_type)
            .field("method", &self.method.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_wire_names() {
        assert_eq!(serde_json::to_string(&CallType::Async).unwrap(), "\"async\"");
        assert_eq!(serde_json::to_string(&CallType::Duplex).unwrap(), "\"duplex\"");
        let ct: CallType = serde_json::from_str("\"source\"").unwrap();
        assert_eq!(ct, CallType::Source);
    }

    #[test]
    fn test_call_type_stream_flag() {
        assert!(!CallType::Async.is_stream());
        assert!(CallType::Source.is_stream());
        assert!(CallType::Sink.is_stream());
        assert!(CallType::Duplex.is_stream());
    }

    #[test]
    fn test_capability_table() {
        use StreamCapability::{Many, None, Once};

        assert_eq!(CallType::Async.handler_caps(), (None, Once));
        assert_eq!(CallType::Source.handler_caps(), (None, Many));
        assert_eq!(CallType::Sink.handler_caps(), (Many, None));
        assert_eq!(CallType::Duplex.handler_caps(), (Many, Many));

        // Originator side mirrors the handler side.
        assert_eq!(CallType::Async.originator_caps(), (Once, None));
        assert_eq!(CallType::Source.originator_caps(), (Many, None));
        assert_eq!(CallType::Sink.originator_caps(), (None, Many));
        assert_eq!(CallType::Duplex.originator_caps(), (Many, Many));
    }

    #[test]
    fn test_method_display() {
        let m = Method::new(["blobs", "get"]);
        assert_eq!(m.to_string(), "blobs.get");
        assert_eq!(m.parts(), ["blobs", "get"]);
    }

    #[test]
    fn test_envelope_parse() {
        let env: RequestEnvelope =
            serde_json::from_str(r#"{"name":["whoami"],"type":"async","args":[]}"#).unwrap();
        assert_eq!(env.name.parts(), ["whoami"]);
        assert_eq!(env.call_type, Some(CallType::Async));
        assert_eq!(env.args.unwrap().get(), "[]");
    }

    #[test]
    fn test_envelope_defaults() {
        let env: RequestEnvelope = serde_json::from_str(r#"{"name":["whoami"]}"#).unwrap();
        assert!(env.call_type.is_none());
        assert!(env.args.is_none());
    }

    #[test]
    fn test_wire_request_serialization() {
        let method = Method::new(["whoami"]);
        let args = empty_args();
        let wire = WireRequest {
            name: &method,
            call_type: CallType::Async,
            args: &args,
        };
        let encoded = serde_json::to_string(&wire).unwrap();
        assert_eq!(encoded, r#"{"name":["whoami"],"type":"async","args":[]}"#);
    }

    #[test]
    fn test_empty_args_is_array() {
        assert_eq!(empty_args().get(), "[]");
    }
}
