//! The system-channel control plane.
//!
//! Requests on channel 0 with one of the reserved paths are served by the
//! connection itself instead of the application handler:
//!
//! - `/sys/new_channel` allocates a channel id and answers with it in
//!   decimal ASCII.
//! - `/sys/delete_channel` takes a decimal id, quietly removes that
//!   channel (no close frame on the wire) and answers `ok`.
//!
//! Failures are answered with a structured error body; the connection
//! stays up either way.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::connection::ConnectionShared;
use crate::consts::{PATH_DELETE_CHANNEL, PATH_NEW_CHANNEL, SYSTEM_CHANNEL_ID};
use crate::error::{
    ERROR_CODE_BAD_CONTROL, ERROR_CODE_IDS_EXHAUSTED, Error, encode_error_body,
};
use crate::frame::Packet;

pub(crate) fn is_system_path(path: &[u8]) -> bool {
    path == PATH_NEW_CHANNEL || path == PATH_DELETE_CHANNEL
}

/// Decimal-ASCII encoding of a channel id, the payload format of the
/// control plane.
pub(crate) fn encode_channel_id(id: u32) -> Bytes {
    Bytes::from(id.to_string())
}

pub(crate) fn parse_channel_id(data: &[u8]) -> Option<u32> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

/// Serve one completed control-plane request; returns the response payload.
pub(crate) fn serve_system_request(shared: &Arc<ConnectionShared>, message: &Packet) -> Bytes {
    if message.path == PATH_NEW_CHANNEL {
        match shared.create_channel() {
            Ok(channel) => {
                debug!(channel = channel.id(), "control plane opened channel");
                encode_channel_id(channel.id())
            }
            Err(Error::IdsExhausted) => {
                encode_error_body(ERROR_CODE_IDS_EXHAUSTED, &Error::IdsExhausted.to_string())
            }
            Err(e) => encode_error_body(ERROR_CODE_BAD_CONTROL, &e.to_string()),
        }
    } else {
        match parse_channel_id(&message.data) {
            None => encode_error_body(ERROR_CODE_BAD_CONTROL, "malformed channel id"),
            Some(SYSTEM_CHANNEL_ID) => {
                encode_error_body(ERROR_CODE_BAD_CONTROL, "cannot delete the system channel")
            }
            Some(id) => match shared.get_channel(id) {
                None => encode_error_body(ERROR_CODE_BAD_CONTROL, "no such channel"),
                Some(_) => {
                    shared.remove_channel_quiet(id);
                    debug!(channel = id, "control plane deleted channel");
                    Bytes::from_static(b"ok")
                }
            },
        }
    }
}
