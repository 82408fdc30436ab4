//! The frame status alphabet and the per-channel progression rules.
//!
//! Every frame starts with a one-byte status. Values 0–3 are the request
//! alphabet (client-origin), 4–7 the response alphabet (server-origin),
//! and 8 is the close marker. Within each alphabet the four values encode
//! two bits: whether the frame is the first of a logical message, and
//! whether the message is complete after this frame.

use crate::error::ProtocolError;

/// Raw byte stored as "no frame received yet" in a channel's status slot.
pub(crate) const STATUS_NONE: u8 = 0xFF;

/// One-byte frame status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    /// First frame of a request; more frames follow.
    RequestBegin = 0,
    /// First and only frame of a request.
    RequestDone = 1,
    /// Request continuation; more frames follow.
    RequestMore = 2,
    /// Final frame of a multi-frame request.
    RequestEnd = 3,
    /// First frame of a response; more frames follow.
    ResponseBegin = 4,
    /// First and only frame of a response.
    ResponseDone = 5,
    /// Response continuation; more frames follow.
    ResponseMore = 6,
    /// Final frame of a multi-frame response.
    ResponseEnd = 7,
    /// Close marker. Any peer-sent close terminates the whole connection.
    Close = 8,
}

/// Which half of the exchange a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Which end of the connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Status {
    /// Decode a status byte. Returns `None` for anything outside 0–8.
    pub fn from_u8(value: u8) -> Option<Status> {
        match value {
            0 => Some(Status::RequestBegin),
            1 => Some(Status::RequestDone),
            2 => Some(Status::RequestMore),
            3 => Some(Status::RequestEnd),
            4 => Some(Status::ResponseBegin),
            5 => Some(Status::ResponseDone),
            6 => Some(Status::ResponseMore),
            7 => Some(Status::ResponseEnd),
            8 => Some(Status::Close),
            _ => None,
        }
    }

    /// The alphabet this status belongs to; `None` for [`Status::Close`].
    pub fn direction(self) -> Option<Direction> {
        match self {
            Status::RequestBegin | Status::RequestDone | Status::RequestMore | Status::RequestEnd => {
                Some(Direction::Request)
            }
            Status::ResponseBegin
            | Status::ResponseDone
            | Status::ResponseMore
            | Status::ResponseEnd => Some(Direction::Response),
            Status::Close => None,
        }
    }

    /// True when the logical message is complete after this frame.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Status::RequestDone | Status::RequestEnd | Status::ResponseDone | Status::ResponseEnd
        )
    }

    /// True when this frame opens a new logical message.
    pub fn is_first(self) -> bool {
        matches!(
            self,
            Status::RequestBegin
                | Status::RequestDone
                | Status::ResponseBegin
                | Status::ResponseDone
        )
    }
}

impl Role {
    /// The alphabet this side stamps on outbound frames.
    pub fn send_direction(self) -> Direction {
        match self {
            Role::Client => Direction::Request,
            Role::Server => Direction::Response,
        }
    }

    /// The alphabet this side expects on inbound frames.
    pub fn recv_direction(self) -> Direction {
        match self {
            Role::Client => Direction::Response,
            Role::Server => Direction::Request,
        }
    }

    /// Status for an outbound frame, given its position in the message.
    pub fn frame_status(self, first: bool, done: bool) -> Status {
        match (self, first, done) {
            (Role::Client, true, true) => Status::RequestDone,
            (Role::Client, true, false) => Status::RequestBegin,
            (Role::Client, false, true) => Status::RequestEnd,
            (Role::Client, false, false) => Status::RequestMore,
            (Role::Server, true, true) => Status::ResponseDone,
            (Role::Server, true, false) => Status::ResponseBegin,
            (Role::Server, false, true) => Status::ResponseEnd,
            (Role::Server, false, false) => Status::ResponseMore,
        }
    }
}

/// Validate an inbound status against the previous one seen on the channel.
///
/// `expect` is the alphabet the receiving side accepts ([`Role::recv_direction`]).
/// A first-frame status is legal only at the start of the channel's life or
/// after a completed message; a continuation status requires an uncompleted
/// one. Close is always legal. Anything else is a protocol violation and
/// must take the whole connection down.
pub fn check_progression(
    expect: Direction,
    prev: Option<Status>,
    next: Status,
) -> Result<(), ProtocolError> {
    if next == Status::Close {
        return Ok(());
    }
    if next.direction() != Some(expect) {
        return Err(ProtocolError::InvalidStatus(next as u8));
    }
    let legal = if next.is_first() {
        match prev {
            None => true,
            Some(p) => p.is_done(),
        }
    } else {
        match prev {
            None => false,
            Some(p) => !p.is_done(),
        }
    };
    if legal {
        Ok(())
    } else {
        Err(ProtocolError::IllegalTransition {
            prev,
            current: next,
        })
    }
}
