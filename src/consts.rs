//! Protocol limits, reserved paths, and queue-size defaults.

/// Maximum length of a frame path, excluding the NUL terminator.
pub const MAX_PATH_LEN: usize = 512;

/// Maximum payload bytes carried by a single frame (16 MiB).
///
/// Logical messages larger than this are split across frames; see
/// [`Channel::send_message`](crate::Channel::send_message).
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the buffered reader sitting between the socket and the
/// frame decoder.
pub const PACKET_READ_BUF_SIZE: usize = 16 * 1024;

/// Channel id reserved for the system channel, created implicitly on both
/// sides at connection birth and used for control-plane exchanges.
pub const SYSTEM_CHANNEL_ID: u32 = 0;

/// Control-plane path: allocate a new channel on this connection.
pub const PATH_NEW_CHANNEL: &[u8] = b"/sys/new_channel";

/// Control-plane path: tear down an existing channel on this connection.
pub const PATH_DELETE_CHANNEL: &[u8] = b"/sys/delete_channel";

/// Default capacity of the connection-wide outbound frame queue.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Default capacity of each channel's inbound frame queue.
pub const DEFAULT_CHANNEL_QUEUE_SIZE: usize = 100;
