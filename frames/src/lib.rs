//! Shared frame model and length-delimited protobuf codec.
//!
//! This crate owns the wire representation used by both ends of a session:
//! the dialing client and the accepting server speak the same frames.
//!
//! WIRE FORMAT
//! ===========
//! Every frame is a protobuf varint length prefix followed by a protobuf
//! `WireFrame` body. The prefix makes the format self-delimiting, so a
//! [`FrameBuffer`] can reassemble frames from a byte stream split at
//! arbitrary boundaries.
//!
//! Control frames (`Connect`, `Join`, `Leave`, ...) are distinguished by
//! [`FrameKind`], never by magic event names. On rejection frames the
//! `event` field carries a machine-readable code (see [`CODE_UNAUTHORIZED`])
//! and `body` carries the human-readable reason.

use std::borrow::Cow;

use bytes::{Buf, BytesMut};
use prost::Message;

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A protobuf varint never exceeds ten bytes.
const MAX_VARINT_LEN: usize = 10;

/// Rejection code: the handshake credential was refused.
pub const CODE_UNAUTHORIZED: &str = "unauthorized";

/// Rejection code: the peer does not serve the requested namespace.
pub const CODE_NAMESPACE_NOT_FOUND: &str = "namespace_not_found";

/// Error returned by [`decode_frame`] and [`FrameBuffer::next_frame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The input ends before the length prefix or the body is complete.
    #[error("truncated frame")]
    Truncated,
    /// The bytes can never become a valid frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

// =============================================================================
// FRAME
// =============================================================================

/// Role of a frame in the session protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Application event inside a joined namespace.
    #[default]
    Data,
    /// First frame of a session; `body` holds the credential.
    Connect,
    /// Handshake accepted; `body` holds the assigned connection id.
    ConnectAck,
    /// Handshake refused; the sender closes the transport afterwards.
    ConnectRejected,
    /// Request to join `namespace`.
    Join,
    /// `namespace` joined.
    JoinAck,
    /// Join of `namespace` refused.
    JoinRejected,
    /// `namespace` left.
    Leave,
}

impl FrameKind {
    /// Convert kind into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self.to_wire() as i32
    }

    fn to_wire(self) -> WireFrameKind {
        match self {
            Self::Data => WireFrameKind::Data,
            Self::Connect => WireFrameKind::Connect,
            Self::ConnectAck => WireFrameKind::ConnectAck,
            Self::ConnectRejected => WireFrameKind::ConnectRejected,
            Self::Join => WireFrameKind::Join,
            Self::JoinAck => WireFrameKind::JoinAck,
            Self::JoinRejected => WireFrameKind::JoinRejected,
            Self::Leave => WireFrameKind::Leave,
        }
    }

    fn from_i32(value: i32) -> Result<Self, DecodeError> {
        match WireFrameKind::try_from(value) {
            Ok(WireFrameKind::Data) => Ok(Self::Data),
            Ok(WireFrameKind::Connect) => Ok(Self::Connect),
            Ok(WireFrameKind::ConnectAck) => Ok(Self::ConnectAck),
            Ok(WireFrameKind::ConnectRejected) => Ok(Self::ConnectRejected),
            Ok(WireFrameKind::Join) => Ok(Self::Join),
            Ok(WireFrameKind::JoinAck) => Ok(Self::JoinAck),
            Ok(WireFrameKind::JoinRejected) => Ok(Self::JoinRejected),
            Ok(WireFrameKind::Leave) => Ok(Self::Leave),
            Err(_) => Err(DecodeError::Malformed(format!("unknown frame kind: {value}"))),
        }
    }
}

/// A single message unit exchanged over the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Control or data role.
    pub kind: FrameKind,
    /// Namespace the frame belongs to. Empty for handshake frames.
    pub namespace: String,
    /// Room inside the namespace. Empty for namespace-wide frames.
    pub room: String,
    /// Application event name, or a rejection code on rejection frames.
    pub event: String,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Set on error replies and rejections.
    pub is_error: bool,
    /// Keep-alive frame carrying nothing.
    pub is_noop: bool,
}

impl Frame {
    /// Application event frame.
    pub fn data(namespace: impl Into<String>, event: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self { namespace: namespace.into(), event: event.into(), body: body.into(), ..Self::default() }
    }

    /// Handshake request carrying the credential (may be empty).
    #[must_use]
    pub fn connect(credentials: &str) -> Self {
        Self { kind: FrameKind::Connect, body: credentials.as_bytes().to_vec(), ..Self::default() }
    }

    /// Handshake accepted; tells the dialer its connection id.
    #[must_use]
    pub fn connect_ack(conn_id: &str) -> Self {
        Self { kind: FrameKind::ConnectAck, body: conn_id.as_bytes().to_vec(), ..Self::default() }
    }

    /// Handshake refused.
    pub fn connect_rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::ConnectRejected,
            event: code.into(),
            body: reason.into().into_bytes(),
            is_error: true,
            ..Self::default()
        }
    }

    pub fn join(namespace: impl Into<String>) -> Self {
        Self { kind: FrameKind::Join, namespace: namespace.into(), ..Self::default() }
    }

    pub fn join_ack(namespace: impl Into<String>) -> Self {
        Self { kind: FrameKind::JoinAck, namespace: namespace.into(), ..Self::default() }
    }

    pub fn join_rejected(namespace: impl Into<String>, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::JoinRejected,
            namespace: namespace.into(),
            event: code.into(),
            body: reason.into().into_bytes(),
            is_error: true,
            ..Self::default()
        }
    }

    pub fn leave(namespace: impl Into<String>) -> Self {
        Self { kind: FrameKind::Leave, namespace: namespace.into(), ..Self::default() }
    }

    /// Keep-alive frame. Receivers ignore it.
    #[must_use]
    pub fn noop() -> Self {
        Self { is_noop: true, ..Self::default() }
    }

    /// Error reply to this frame: same namespace, room and event.
    #[must_use]
    pub fn error_reply(&self, message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Data,
            namespace: self.namespace.clone(),
            room: self.room.clone(),
            event: self.event.clone(),
            body: message.into().into_bytes(),
            is_error: true,
            is_noop: false,
        }
    }

    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        self.kind != FrameKind::Data
    }

    /// Data frames other than keep-alives must name a namespace and an event.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.kind != FrameKind::Data || self.is_noop || (!self.namespace.is_empty() && !self.event.is_empty())
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame as a length-delimited protobuf message.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);
    let len = wire.encoded_len();

    let mut out = Vec::with_capacity(len + prost::length_delimiter_len(len));
    // Encoding into a growable Vec cannot fail.
    wire.encode_length_delimited(&mut out).unwrap_or_default();
    out
}

/// Decode exactly one length-delimited frame.
///
/// # Errors
///
/// Returns [`DecodeError::Truncated`] when `bytes` ends early and
/// [`DecodeError::Malformed`] for invalid prefixes, bodies, or trailing bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let Some((prefix, len)) = split_prefix(bytes)? else {
        return Err(DecodeError::Truncated);
    };
    check_len(len, MAX_FRAME_LEN)?;

    let total = prefix + len;
    if bytes.len() < total {
        return Err(DecodeError::Truncated);
    }
    if bytes.len() > total {
        return Err(DecodeError::Malformed(format!("{} trailing bytes", bytes.len() - total)));
    }
    decode_body(&bytes[prefix..])
}

/// Read the length prefix. `Ok(None)` means more bytes are needed.
fn split_prefix(bytes: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let Some(end) = bytes.iter().take(MAX_VARINT_LEN).position(|b| b & 0x80 == 0) else {
        if bytes.len() >= MAX_VARINT_LEN {
            return Err(DecodeError::Malformed("invalid length prefix".into()));
        }
        return Ok(None);
    };

    let len = prost::decode_length_delimiter(&bytes[..=end])
        .map_err(|e| DecodeError::Malformed(format!("invalid length prefix: {e}")))?;
    Ok(Some((end + 1, len)))
}

fn check_len(len: usize, max_len: usize) -> Result<(), DecodeError> {
    if len > max_len {
        return Err(DecodeError::Malformed(format!("frame length {len} exceeds limit {max_len}")));
    }
    Ok(())
}

fn decode_body(body: &[u8]) -> Result<Frame, DecodeError> {
    let wire = WireFrame::decode(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let frame = wire_to_frame(wire)?;
    if !frame.is_well_formed() {
        return Err(DecodeError::Malformed("data frame without namespace or event".into()));
    }
    Ok(frame)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        kind: frame.kind.as_i32(),
        namespace: frame.namespace.clone(),
        room: frame.room.clone(),
        event: frame.event.clone(),
        body: frame.body.clone(),
        is_error: frame.is_error,
        is_noop: frame.is_noop,
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, DecodeError> {
    Ok(Frame {
        kind: FrameKind::from_i32(wire.kind)?,
        namespace: wire.namespace,
        room: wire.room,
        event: wire.event,
        body: wire.body,
        is_error: wire.is_error,
        is_noop: wire.is_noop,
    })
}

// =============================================================================
// STREAM REASSEMBLY
// =============================================================================

/// Accumulates transport chunks and yields complete frames in arrival order.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_len: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    #[must_use]
    pub fn with_max_len(max_len: usize) -> Self {
        Self { buf: BytesMut::new(), max_len }
    }

    /// Append a chunk exactly as received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` while the next one is incomplete.
    ///
    /// A frame with a bad body is consumed and reported; the stream stays
    /// aligned on the following frame. A bad length prefix cannot be skipped,
    /// so it discards everything buffered.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        let (prefix, len) = match split_prefix(&self.buf) {
            Ok(Some(split)) => split,
            Ok(None) => return None,
            Err(e) => {
                self.buf.clear();
                return Some(Err(e));
            }
        };
        if let Err(e) = check_len(len, self.max_len) {
            self.buf.clear();
            return Some(Err(e));
        }
        if self.buf.len() < prefix + len {
            return None;
        }

        self.buf.advance(prefix);
        let body = self.buf.split_to(len);
        Some(decode_body(&body))
    }

    /// Buffered bytes not yet returned as frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(enumeration = "WireFrameKind", tag = "1")]
    kind: i32,
    #[prost(string, tag = "2")]
    namespace: String,
    #[prost(string, tag = "3")]
    room: String,
    #[prost(string, tag = "4")]
    event: String,
    #[prost(bytes = "vec", tag = "5")]
    body: Vec<u8>,
    #[prost(bool, tag = "6")]
    is_error: bool,
    #[prost(bool, tag = "7")]
    is_noop: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireFrameKind {
    Data = 0,
    Connect = 1,
    ConnectAck = 2,
    ConnectRejected = 3,
    Join = 4,
    JoinAck = 5,
    JoinRejected = 6,
    Leave = 7,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
