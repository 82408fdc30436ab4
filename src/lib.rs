//! iip: the wire-level core of a multiplexed request/response transport.
//!
//! Many logical streams (*channels*) share one reliable byte stream. Each
//! channel carries an ordered sequence of request/response exchanges, and a
//! single request or response may be split across frames to bound per-frame
//! memory use.
//!
//! Per connection there are exactly three kinds of long-running task:
//! a reader (sole owner of the inbound socket half), a writer (sole owner
//! of the outbound half, draining one bounded connection-wide queue), and
//! one dispatcher per live channel. Frames flow
//!
//! ```text
//! socket → reader → channel inbound queue → dispatcher
//!        → (server) handler → outbound queue → writer → socket
//!        → (client) response delivery to the caller on that channel
//! ```
//!
//! All queues are bounded; a full queue blocks its producer, and that
//! backpressure (propagated through TCP) is the only flow control.
//! I/O and protocol errors close the whole connection; handler errors stay
//! within their exchange and are reported to the peer as structured error
//! responses.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use iip::{Connection, Handler, NoopHandler, Respond, Role};
//!
//! // server
//! let server = Connection::new(server_stream, Role::Server, Arc::new(Echo));
//! // client
//! let client = Connection::new(client_stream, Role::Client, Arc::new(NoopHandler));
//! let channel = client.open_channel().await?;
//! let reply = channel.request("/echo", "hi").await?;
//! ```

mod channel;
mod connection;
mod consts;
mod control;
mod dispatch;
mod error;
mod frame;
mod handler;
mod status;

pub use channel::{Channel, ChannelStats};
pub use connection::{Config, Connection, Registry};
pub use consts::{
    DEFAULT_CHANNEL_QUEUE_SIZE, DEFAULT_OUTBOUND_QUEUE_SIZE, MAX_PACKET_SIZE, MAX_PATH_LEN,
    PACKET_READ_BUF_SIZE, PATH_DELETE_CHANNEL, PATH_NEW_CHANNEL, SYSTEM_CHANNEL_ID,
};
pub use error::{
    ERROR_CODE_BAD_CONTROL, ERROR_CODE_HANDLER, ERROR_CODE_IDS_EXHAUSTED, ERROR_CODE_NO_RESPONSE,
    Error, ProtocolError, Result, encode_error_body, parse_error_body,
};
pub use frame::Packet;
pub use handler::{Handler, NoopHandler, Respond};
pub use status::{Direction, Role, Status, check_progression};
