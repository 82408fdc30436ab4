//! Channels: logical FIFO streams multiplexed over one connection.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, warn};

use crate::connection::ConnectionShared;
use crate::consts::{MAX_PACKET_SIZE, MAX_PATH_LEN};
use crate::error::{Error, ProtocolError, Result};
use crate::frame::Packet;
use crate::status::{Role, STATUS_NONE, Status};

/// Advisory traffic counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames received on this channel.
    pub read_packets: u64,
    /// Frames enqueued for sending on this channel.
    pub write_packets: u64,
    /// Wire bytes received, frame overhead included.
    pub read_bytes: u64,
    /// Wire bytes enqueued for sending, frame overhead included.
    pub write_bytes: u64,
}

/// A bidirectional logical stream identified by a 32-bit id.
///
/// Channels are created by their connection (the system channel at birth,
/// others through the control plane) and hand frames to a dedicated
/// dispatcher task. A channel holds only a weak reference to its
/// connection: the connection always outlives its channels, because
/// connection close cascades to every channel before the connection goes
/// away.
pub struct Channel {
    id: u32,
    conn: Weak<ConnectionShared>,
    /// Inbound frame queue; the connection reader is the only producer.
    in_tx: mpsc::Sender<Packet>,
    /// Serialises one fragment burst so a logical message's frames are
    /// contiguous in the connection's outbound queue.
    send_lock: AsyncMutex<()>,
    /// Serialises whole request/response exchanges for [`Channel::request`].
    exchange_lock: AsyncMutex<()>,
    /// Status of the most recently received frame; `STATUS_NONE` sentinel
    /// until the first frame arrives. Only the connection reader touches it.
    last_status: AtomicU8,
    closed: AtomicBool,
    err: OnceLock<Arc<Error>>,
    stop_tx: watch::Sender<bool>,
    /// Single-slot response delivery endpoint, armed per exchange by the
    /// caller awaiting a response on this channel.
    response_slot: Mutex<Option<mpsc::Sender<Packet>>>,
    read_packets: AtomicU64,
    write_packets: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        conn: Weak<ConnectionShared>,
        queue: usize,
    ) -> (Arc<Channel>, mpsc::Receiver<Packet>, watch::Receiver<bool>) {
        let (in_tx, in_rx) = mpsc::channel(queue.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let channel = Arc::new(Channel {
            id,
            conn,
            in_tx,
            send_lock: AsyncMutex::new(()),
            exchange_lock: AsyncMutex::new(()),
            last_status: AtomicU8::new(STATUS_NONE),
            closed: AtomicBool::new(false),
            err: OnceLock::new(),
            stop_tx,
            response_slot: Mutex::new(None),
            read_packets: AtomicU64::new(0),
            write_packets: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        });
        (channel, in_rx, stop_rx)
    }

    /// This channel's id. `0` is the system channel.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once the channel has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The terminal error recorded at close, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.err.get().cloned()
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            read_packets: self.read_packets.load(Ordering::Relaxed),
            write_packets: self.write_packets.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }

    /// Send one logical message on this channel.
    ///
    /// Messages up to 16 MiB go out as a single frame; larger ones are
    /// split into frames of at most 16 MiB each, statuses running begin,
    /// then continuations, then the end marker, all in this side's
    /// alphabet. The fragment burst holds the channel's send lock, so
    /// concurrent senders on the same channel cannot interleave frames of
    /// different messages.
    ///
    /// Blocks when the connection's outbound queue is full; that is the
    /// transport's only flow control.
    pub async fn send_message(&self, path: impl Into<Bytes>, data: impl Into<Bytes>) -> Result<()> {
        let path = path.into();
        let data = data.into();
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let conn = self.conn.upgrade().ok_or(Error::ConnectionClosed)?;
        if conn.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        // Reject unframeable messages here, where the failure stays on this
        // channel; a bad frame reaching the writer costs the connection.
        if path.len() > MAX_PATH_LEN {
            return Err(Error::PathTooLong(path.len()));
        }
        if path.contains(&0) {
            return Err(Error::PathHasNul);
        }
        if data.is_empty() {
            return Err(Error::Protocol(ProtocolError::EmptyPayload));
        }
        let role = conn.role();

        let _burst = self.send_lock.lock().await;
        let total = data.len();
        let mut offset = 0usize;
        let mut first = true;
        let mut frames = 0u64;
        let mut bytes = 0u64;
        loop {
            let end = (offset + MAX_PACKET_SIZE).min(total);
            let done = end == total;
            let pkt = Packet {
                status: role.frame_status(first, done),
                path: path.clone(),
                channel_id: self.id,
                data: data.slice(offset..end),
            };
            frames += 1;
            bytes += pkt.wire_size() as u64;
            conn.enqueue(pkt).await?;
            if done {
                break;
            }
            first = false;
            offset = end;
        }
        self.write_packets.fetch_add(frames, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Send a request and await the reassembled response (client side).
    ///
    /// Exchanges on one channel are serialised; the response arrives
    /// through this channel's delivery endpoint once the peer's final
    /// response frame has been received. No timeout is applied here.
    pub async fn request(&self, path: impl Into<Bytes>, data: impl Into<Bytes>) -> Result<Packet> {
        let conn = self.conn.upgrade().ok_or(Error::ConnectionClosed)?;
        if conn.role() != Role::Client {
            return Err(Error::InvalidRole);
        }
        let _exchange = self.exchange_lock.lock().await;
        let mut rx = self.arm_response();
        self.send_message(path, data).await?;
        match rx.recv().await {
            Some(response) => Ok(response),
            None => Err(self.terminal_error()),
        }
    }

    /// Arm the single-slot response endpoint and return its receiving end.
    ///
    /// The dispatcher delivers the next completed response here. Arming
    /// replaces any previously installed endpoint.
    pub fn arm_response(&self) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(1);
        let mut slot = self.response_slot.lock();
        if !self.is_closed() {
            *slot = Some(tx);
        }
        // On a closed channel the sender is dropped here and the receiver
        // reports end-of-stream right away.
        rx
    }

    /// Close this channel.
    ///
    /// Idempotent. Emits a best-effort close frame, removes the channel
    /// from the connection's table (returning the id to the free pool) and
    /// stops the dispatcher. The peer treats any received close frame as
    /// termination of the whole connection.
    pub fn close(&self) {
        self.close_with(Error::ChannelClosed, true);
    }

    pub(crate) fn close_with(&self, reason: Error, emit_close_frame: bool) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reason = Arc::new(reason);
        let _ = self.err.set(reason.clone());
        if let Some(conn) = self.conn.upgrade() {
            if emit_close_frame && !conn.try_enqueue(Packet::close(self.id)) {
                debug!(channel = self.id, "close frame dropped");
            }
            conn.forget_channel(self.id);
        }
        // Wake any caller blocked on a response.
        *self.response_slot.lock() = None;
        let _ = self.stop_tx.send(true);
        debug!(channel = self.id, reason = %reason, "channel closed");
    }

    /// Deliver a fully reassembled response to whoever armed the endpoint.
    pub(crate) fn deliver_response(&self, response: Packet) {
        let slot = self.response_slot.lock();
        match slot.as_ref() {
            Some(tx) => {
                if tx.try_send(response).is_err() {
                    warn!(channel = self.id, "response dropped: endpoint not drained");
                }
            }
            None => {
                debug!(channel = self.id, "response discarded: no endpoint armed");
            }
        }
    }

    pub(crate) async fn push_inbound(
        &self,
        pkt: Packet,
    ) -> std::result::Result<(), mpsc::error::SendError<Packet>> {
        self.in_tx.send(pkt).await
    }

    pub(crate) fn last_status(&self) -> Option<Status> {
        Status::from_u8(self.last_status.load(Ordering::Relaxed))
    }

    pub(crate) fn set_last_status(&self, status: Status) {
        self.last_status.store(status as u8, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, wire_bytes: u64) {
        self.read_packets.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    fn terminal_error(&self) -> Error {
        match self.conn.upgrade() {
            None => Error::ConnectionClosed,
            Some(conn) if conn.is_closed() => Error::ConnectionClosed,
            Some(_) => Error::ChannelClosed,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
