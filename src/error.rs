//! Error types and the structured error-response body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::consts::{MAX_PACKET_SIZE, MAX_PATH_LEN};
use crate::status::Status;

/// Code carried by an error response when a handler returned an error
/// without a code of its own.
pub const ERROR_CODE_HANDLER: i32 = -1;
/// Code carried by an error response when a handler produced no payload.
pub const ERROR_CODE_NO_RESPONSE: i32 = -2;
/// Code carried by an error response when channel id allocation failed.
pub const ERROR_CODE_IDS_EXHAUSTED: i32 = -3;
/// Code carried by an error response to a malformed control-plane request.
pub const ERROR_CODE_BAD_CONTROL: i32 = -4;

/// Connection-fatal wire violations. Any of these closes the connection;
/// the byte stream cannot be resynchronised once it is off the rails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid status byte {0}")]
    InvalidStatus(u8),

    #[error("illegal status progression: {prev:?} -> {current:?}")]
    IllegalTransition {
        prev: Option<Status>,
        current: Status,
    },

    #[error("no path terminator within {MAX_PATH_LEN} bytes")]
    PathUnterminated,

    #[error("frame data length {0} exceeds {MAX_PACKET_SIZE} bytes")]
    OversizedPayload(u32),

    #[error("zero data length on a non-close frame")]
    EmptyPayload,

    #[error("frame for unknown channel {0}")]
    UnknownChannel(u32),

    #[error("channel {0} already exists")]
    DuplicateChannel(u32),

    #[error("channel {0} is reserved")]
    ReservedChannel(u32),

    #[error("malformed control-plane payload")]
    BadControlPayload,

    #[error("stream ended mid-frame")]
    Truncated,
}

/// Everything that can go wrong in the transport core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encode-time path limit. The operation fails; the channel is unaffected.
    #[error("path too long ({0} bytes, max {MAX_PATH_LEN})")]
    PathTooLong(usize),

    /// A path containing a NUL byte cannot be framed.
    #[error("path contains a NUL byte")]
    PathHasNul,

    /// Encode-time payload limit for a single frame.
    #[error("payload too long ({0} bytes, max {MAX_PACKET_SIZE})")]
    PayloadTooLong(usize),

    /// Wire violation; the connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket failure; the connection is closed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A handler reported a failure for one exchange. The channel stays open
    /// and the peer receives a structured error response.
    #[error("handler failed: {message} (code {code})")]
    Handler { code: i32, message: String },

    /// A handler returned an empty payload for a completed message.
    #[error("handler produced no response")]
    HandlerNoResponse,

    /// Operation attempted on a closed channel.
    #[error("channel is closed")]
    ChannelClosed,

    /// Operation attempted on a closed connection.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Every 32-bit channel id is either live or was never returned to the
    /// free pool. New channels cannot be created on this connection.
    #[error("channel ids exhausted")]
    IdsExhausted,

    /// Operation only makes sense on the other side of the connection.
    #[error("operation not valid for this connection role")]
    InvalidRole,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Encode a structured error body: `code (i32 BE) ‖ len (u32 BE) ‖ message`.
///
/// Error responses travel in-band as ordinary response payloads; there is no
/// flag bit on the wire, so clients recognise them by shape with
/// [`parse_error_body`].
pub fn encode_error_body(code: i32, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + message.len());
    buf.put_i32(code);
    buf.put_u32(message.len() as u32);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Parse a structured error body. Returns `None` unless the payload is
/// exactly `code ‖ len ‖ message` with a matching length.
pub fn parse_error_body(data: &[u8]) -> Option<(i32, String)> {
    if data.len() < 8 {
        return None;
    }
    let code = i32::from_be_bytes(data[0..4].try_into().ok()?);
    let len = u32::from_be_bytes(data[4..8].try_into().ok()?) as usize;
    if data.len() != 8 + len {
        return None;
    }
    Some((code, String::from_utf8_lossy(&data[8..]).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_round_trip() {
        let body = encode_error_body(ERROR_CODE_HANDLER, "boom");
        let (code, message) = parse_error_body(&body).unwrap();
        assert_eq!(code, ERROR_CODE_HANDLER);
        assert_eq!(message, "boom");
    }

    #[test]
    fn error_body_empty_message() {
        let body = encode_error_body(7, "");
        assert_eq!(parse_error_body(&body), Some((7, String::new())));
    }

    #[test]
    fn ordinary_payloads_do_not_parse_as_errors() {
        assert_eq!(parse_error_body(b"hi"), None);
        assert_eq!(parse_error_body(b"1"), None);
        // Length field must match exactly.
        let mut body = encode_error_body(1, "x").to_vec();
        body.push(b'y');
        assert_eq!(parse_error_body(&body), None);
    }
}
