//! The application handler contract.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::Channel;
use crate::error::Result;
use crate::frame::Packet;

/// What a handler decided about the message it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Respond {
    /// Respond with this payload once the message is complete.
    Payload(Bytes),
    /// The payload is not complete by application judgement; keep
    /// accumulating frames. On a completed message this means "no response".
    NeedMore,
}

/// Application logic invoked by a channel's dispatcher.
///
/// The dispatcher calls `handle` once per received frame with the message
/// accumulated so far; `completed` is true once the peer's final frame has
/// arrived. Handlers on one channel run strictly one at a time; across
/// channels they run concurrently.
///
/// On the server side the returned payload (for a completed message) is
/// sent back on the same channel and path; an `Err` is reported to the
/// peer as a structured error response and leaves the channel open. On the
/// client side the return value is ignored and errors are only logged;
/// the reassembled response is delivered to the caller waiting on the
/// channel instead.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        channel: &Arc<Channel>,
        message: &Packet,
        completed: bool,
    ) -> Result<Respond>;
}

/// Handler that never responds. The usual choice for pure-client
/// connections, where responses are consumed by the channel's delivery
/// endpoint rather than by a handler.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn handle(
        &self,
        _channel: &Arc<Channel>,
        _message: &Packet,
        _completed: bool,
    ) -> Result<Respond> {
        Ok(Respond::NeedMore)
    }
}
