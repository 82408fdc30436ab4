//! Per-channel dispatcher: reassemble logical messages and drive the
//! application handler.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::connection::ConnectionShared;
use crate::consts::SYSTEM_CHANNEL_ID;
use crate::control;
use crate::error::{ERROR_CODE_HANDLER, ERROR_CODE_NO_RESPONSE, Error, encode_error_body};
use crate::frame::Packet;
use crate::handler::Respond;
use crate::status::{Role, Status};

/// A logical message being reassembled across frames.
struct Pending {
    status: Status,
    path: Bytes,
    channel_id: u32,
    data: BytesMut,
}

impl Pending {
    fn begin(pkt: Packet) -> Pending {
        Pending {
            status: pkt.status,
            path: pkt.path,
            channel_id: pkt.channel_id,
            data: BytesMut::from(&pkt.data[..]),
        }
    }

    fn absorb(&mut self, pkt: &Packet) {
        self.data.extend_from_slice(&pkt.data);
        self.status = pkt.status;
    }

    fn snapshot(&self) -> Packet {
        Packet {
            status: self.status,
            path: self.path.clone(),
            channel_id: self.channel_id,
            data: Bytes::copy_from_slice(&self.data),
        }
    }
}

/// The dispatcher loop for one channel. Consumes the channel's inbound
/// queue FIFO, accumulates frames into the pending logical message, and
/// invokes the handler on every frame. Exits when the channel closes or
/// the connection's stop signal fires.
pub(crate) async fn run(
    shared: Arc<ConnectionShared>,
    channel: Arc<Channel>,
    mut inbound: mpsc::Receiver<Packet>,
    mut stop: watch::Receiver<bool>,
) {
    let role = shared.role();
    let mut pending: Option<Pending> = None;
    loop {
        let pkt = tokio::select! {
            _ = stop.changed() => break,
            pkt = inbound.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        if pkt.status == Status::Close {
            channel.close_with(Error::ChannelClosed, false);
            break;
        }
        let completed = pkt.status.is_done();
        let message = match pending.take() {
            // Whole message in a single frame; skip the assembly buffer.
            None if completed => pkt,
            None => {
                let acc = Pending::begin(pkt);
                let message = acc.snapshot();
                pending = Some(acc);
                message
            }
            Some(mut acc) => {
                acc.absorb(&pkt);
                let message = acc.snapshot();
                if !completed {
                    pending = Some(acc);
                }
                message
            }
        };
        match role {
            Role::Server => serve(&shared, &channel, &message, completed).await,
            Role::Client => observe(&shared, &channel, message, completed).await,
        }
    }
    debug!(channel = channel.id(), "dispatcher stopped");
}

/// Server side: run the handler and send back a response, an error body,
/// or nothing (still accumulating).
async fn serve(
    shared: &Arc<ConnectionShared>,
    channel: &Arc<Channel>,
    message: &Packet,
    completed: bool,
) {
    if completed
        && message.channel_id == SYSTEM_CHANNEL_ID
        && control::is_system_path(&message.path)
    {
        let body = control::serve_system_request(shared, message);
        if let Err(e) = channel.send_message(message.path.clone(), body).await {
            warn!(channel = channel.id(), error = %e, "control response failed");
        }
        return;
    }

    match shared.handler.handle(channel, message, completed).await {
        Ok(Respond::Payload(data)) => {
            if !completed {
                warn!(
                    channel = channel.id(),
                    path = ?message.path,
                    "handler responded to an incomplete message; dropping the payload"
                );
                return;
            }
            let body = if data.is_empty() {
                warn!(channel = channel.id(), path = ?message.path, "handler returned no data");
                encode_error_body(ERROR_CODE_NO_RESPONSE, &Error::HandlerNoResponse.to_string())
            } else {
                data
            };
            if let Err(e) = channel.send_message(message.path.clone(), body).await {
                warn!(channel = channel.id(), error = %e, "response send failed");
            }
        }
        Ok(Respond::NeedMore) => {}
        Err(e) => {
            warn!(channel = channel.id(), path = ?message.path, error = %e, "handler failed");
            let (code, text) = match &e {
                Error::Handler { code, message } => (*code, message.clone()),
                other => (ERROR_CODE_HANDLER, other.to_string()),
            };
            let body = encode_error_body(code, &text);
            if let Err(e) = channel.send_message(message.path.clone(), body).await {
                warn!(channel = channel.id(), error = %e, "error response send failed");
            }
        }
    }
}

/// Client side: the handler only observes; completed responses go to the
/// caller waiting on the channel's delivery endpoint.
async fn observe(
    shared: &Arc<ConnectionShared>,
    channel: &Arc<Channel>,
    message: Packet,
    completed: bool,
) {
    if let Err(e) = shared.handler.handle(channel, &message, completed).await {
        warn!(channel = channel.id(), error = %e, "client handler failed");
    }
    if completed {
        channel.deliver_response(message);
    }
}
