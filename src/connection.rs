//! One connection: the pairing of a byte stream with its multiplex machinery.
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!                        │          Connection          │
//!                        ├──────────────────────────────┤
//!                        │  channel table + free ids    │
//!                        │  outbound queue (mpsc)       │
//!                        │  stop signal (watch)         │
//!                        └──────┬──────────────┬────────┘
//!                               │              │
//!                          reader task    writer task
//!                               │              │
//!            socket ──► parse + validate      drain queue ──► socket
//!                               │
//!                    per-channel inbound queue
//!                               │
//!                        dispatcher task (one per channel)
//!                               │
//!               server: handler → response frames on the outbound queue
//!               client: deliver reassembled response to the waiting caller
//! ```
//!
//! The reader exclusively owns the inbound half of the socket, the writer
//! the outbound half; everything else that wants to write must enqueue.
//! Both queues are bounded, and a full queue blocking its producer is the
//! transport's only flow control.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::consts::{
    DEFAULT_CHANNEL_QUEUE_SIZE, DEFAULT_OUTBOUND_QUEUE_SIZE, PACKET_READ_BUF_SIZE,
    PATH_DELETE_CHANNEL, PATH_NEW_CHANNEL, SYSTEM_CHANNEL_ID,
};
use crate::control::{encode_channel_id, parse_channel_id};
use crate::dispatch;
use crate::error::{ERROR_CODE_IDS_EXHAUSTED, Error, ProtocolError, Result, parse_error_body};
use crate::frame::{self, Packet};
use crate::handler::Handler;
use crate::status::{Role, Status, check_progression};

/// Enclosing server/client registry; a connection detaches itself from it
/// exactly once when it closes.
pub trait Registry: Send + Sync {
    fn connection_closed(&self, remote: &str);
}

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the connection-wide outbound frame queue.
    pub outbound_queue: usize,
    /// Capacity of each channel's inbound frame queue.
    pub channel_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE_SIZE,
            channel_queue: DEFAULT_CHANNEL_QUEUE_SIZE,
        }
    }
}

/// Channel table plus the id allocator. Guarded by one reader/writer lock:
/// lookups take it shared, create/remove/allocate take it exclusive.
#[derive(Default)]
struct ChannelTable {
    channels: HashMap<u32, Arc<Channel>>,
    free_ids: HashSet<u32>,
    max_id: u32,
}

impl ChannelTable {
    /// Hand out an id: any member of the free pool, else the next fresh
    /// one. Never returns 0 (the system channel) and never an id that is
    /// currently in the table.
    fn alloc_id(&mut self) -> Result<u32> {
        if let Some(&id) = self.free_ids.iter().next() {
            self.free_ids.remove(&id);
            return Ok(id);
        }
        if self.max_id < u32::MAX {
            self.max_id += 1;
            return Ok(self.max_id);
        }
        Err(Error::IdsExhausted)
    }

    fn release_id(&mut self, id: u32) {
        if id != SYSTEM_CHANNEL_ID {
            self.free_ids.insert(id);
        }
    }
}

pub(crate) struct ConnectionShared {
    role: Role,
    remote: String,
    config: Config,
    pub(crate) handler: Arc<dyn Handler>,
    registry: Option<Arc<dyn Registry>>,
    table: RwLock<ChannelTable>,
    out_tx: mpsc::Sender<Packet>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
    err: OnceLock<Arc<Error>>,
    /// Back-reference handed to channels and dispatcher tasks.
    self_ref: Weak<ConnectionShared>,
}

impl ConnectionShared {
    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue a frame for the writer, blocking while the queue is full.
    pub(crate) async fn enqueue(&self, pkt: Packet) -> Result<()> {
        self.out_tx
            .send(pkt)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Best-effort enqueue; used for close frames only.
    pub(crate) fn try_enqueue(&self, pkt: Packet) -> bool {
        self.out_tx.try_send(pkt).is_ok()
    }

    pub(crate) fn get_channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.table.read().channels.get(&id).cloned()
    }

    fn channel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.table.read().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop a channel from the table and return its id to the free pool.
    pub(crate) fn forget_channel(&self, id: u32) {
        let mut table = self.table.write();
        if table.channels.remove(&id).is_some() {
            table.release_id(id);
        }
    }

    /// Insert a channel under `id` and start its dispatcher.
    fn add_channel(&self, id: u32) -> Result<Arc<Channel>> {
        let shared = self.self_ref.upgrade().ok_or(Error::ConnectionClosed)?;
        let (channel, in_rx, stop_rx) = {
            let mut table = self.table.write();
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            if table.channels.contains_key(&id) {
                return Err(Error::Protocol(ProtocolError::DuplicateChannel(id)));
            }
            let parts = Channel::new(id, self.self_ref.clone(), self.config.channel_queue);
            table.channels.insert(id, parts.0.clone());
            parts
        };
        tokio::spawn(dispatch::run(shared, channel.clone(), in_rx, stop_rx));
        Ok(channel)
    }

    /// Create a channel with a locally allocated id and start its dispatcher.
    pub(crate) fn create_channel(&self) -> Result<Arc<Channel>> {
        let id = {
            let mut table = self.table.write();
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            table.alloc_id()?
        };
        match self.add_channel(id) {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.table.write().release_id(id);
                Err(e)
            }
        }
    }

    /// Create a channel under an id assigned elsewhere: the system channel
    /// at connection birth, or an id returned by the peer's control plane.
    pub(crate) fn install_channel(&self, id: u32) -> Result<Arc<Channel>> {
        self.add_channel(id)
    }

    /// Tear a channel down without emitting a close frame on the wire.
    /// This is the control-plane removal path.
    pub(crate) fn remove_channel_quiet(&self, id: u32) {
        if let Some(channel) = self.get_channel(id) {
            channel.close_with(Error::ChannelClosed, false);
        }
    }

    /// Close the connection. Idempotent; every path that tears the
    /// connection down funnels through here.
    pub(crate) fn close_conn(&self, reason: Error) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let reason = Arc::new(reason);
        let _ = self.err.set(reason.clone());
        debug!(role = ?self.role, remote = %self.remote, reason = %reason, "connection closed");
        if let Some(registry) = &self.registry {
            registry.connection_closed(&self.remote);
        }
        // Stop the writer (it drops its pending queue and shuts down the
        // outbound socket half) and the reader.
        let _ = self.stop_tx.send(true);
        let channels: Vec<Arc<Channel>> = self.table.read().channels.values().cloned().collect();
        for channel in channels {
            channel.close_with(Error::ConnectionClosed, true);
        }
    }
}

/// One multiplexed connection around an already-connected full-duplex byte
/// stream. Cloning yields another handle to the same connection.
///
/// Construction spawns the reader and writer tasks and pre-creates the
/// system channel (id 0), so it must happen inside a Tokio runtime.
/// Dropping the last handle does not close the connection; call
/// [`Connection::close`] or let an I/O error end it.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Wrap a connected stream with the default configuration.
    pub fn new<S>(stream: S, role: Role, handler: Arc<dyn Handler>) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_config(stream, role, handler, Config::default())
    }

    /// Wrap a connected stream with explicit queue capacities.
    pub fn with_config<S>(
        stream: S,
        role: Role,
        handler: Arc<dyn Handler>,
        config: Config,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, role, handler, None, String::new(), config)
    }

    /// Wrap a connected stream and register it with an enclosing registry.
    /// `remote` is the label handed back to the registry at close, usually
    /// the peer address.
    pub fn with_registry<S>(
        stream: S,
        role: Role,
        handler: Arc<dyn Handler>,
        config: Config,
        registry: Arc<dyn Registry>,
        remote: impl Into<String>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, role, handler, Some(registry), remote.into(), config)
    }

    fn build<S>(
        stream: S,
        role: Role,
        handler: Arc<dyn Handler>,
        registry: Option<Arc<dyn Registry>>,
        remote: String,
        config: Config,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new_cyclic(|weak| ConnectionShared {
            role,
            remote,
            config,
            handler,
            registry,
            table: RwLock::new(ChannelTable::default()),
            out_tx,
            stop_tx,
            closed: AtomicBool::new(false),
            err: OnceLock::new(),
            self_ref: weak.clone(),
        });
        // Subscribe both loops before anything can fire the stop signal.
        let reader_stop = shared.stop_tx.subscribe();
        let writer_stop = shared.stop_tx.subscribe();
        shared
            .install_channel(SYSTEM_CHANNEL_ID)
            .expect("fresh table accepts the system channel");
        tokio::spawn(reader_loop(shared.clone(), read_half, reader_stop));
        tokio::spawn(writer_loop(shared.clone(), write_half, out_rx, writer_stop));
        Connection { shared }
    }

    /// Which end of the connection this is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The remote label given at construction, if any.
    pub fn remote(&self) -> &str {
        &self.shared.remote
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The terminal error recorded at close, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared.err.get().cloned()
    }

    /// Look up a live channel by id.
    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.shared.get_channel(id)
    }

    /// Ids of all live channels, sorted (for diagnostics).
    pub fn channel_ids(&self) -> Vec<u32> {
        self.shared.channel_ids()
    }

    /// Create a channel with a locally allocated id (server side).
    ///
    /// The serving side of the control plane uses this when the peer asks
    /// for a new channel; client-side channels come from
    /// [`Connection::open_channel`] instead.
    pub fn create_channel(&self) -> Result<Arc<Channel>> {
        if self.shared.role != Role::Server {
            return Err(Error::InvalidRole);
        }
        self.shared.create_channel()
    }

    /// Ask the peer for a new channel (client side).
    ///
    /// Sends `/sys/new_channel` on the system channel, installs the id the
    /// server allocated, and returns the new channel.
    pub async fn open_channel(&self) -> Result<Arc<Channel>> {
        if self.shared.role != Role::Client {
            return Err(Error::InvalidRole);
        }
        let sys = self
            .shared
            .get_channel(SYSTEM_CHANNEL_ID)
            .ok_or(Error::ConnectionClosed)?;
        let response = sys.request(PATH_NEW_CHANNEL, &b"open"[..]).await?;
        if let Some((code, message)) = parse_error_body(&response.data) {
            if code == ERROR_CODE_IDS_EXHAUSTED {
                return Err(Error::IdsExhausted);
            }
            return Err(Error::Handler { code, message });
        }
        let id = parse_channel_id(&response.data).ok_or(ProtocolError::BadControlPayload)?;
        self.shared.install_channel(id)
    }

    /// Tear down a channel on both sides through the control plane
    /// (client side). The id returns to the server's free pool and may be
    /// handed out again.
    pub async fn delete_channel(&self, id: u32) -> Result<()> {
        if self.shared.role != Role::Client {
            return Err(Error::InvalidRole);
        }
        if id == SYSTEM_CHANNEL_ID {
            return Err(Error::Protocol(ProtocolError::ReservedChannel(id)));
        }
        let sys = self
            .shared
            .get_channel(SYSTEM_CHANNEL_ID)
            .ok_or(Error::ConnectionClosed)?;
        let response = sys
            .request(PATH_DELETE_CHANNEL, encode_channel_id(id))
            .await?;
        if let Some((code, message)) = parse_error_body(&response.data) {
            return Err(Error::Handler { code, message });
        }
        self.shared.remove_channel_quiet(id);
        Ok(())
    }

    /// Close the connection: record the reason, detach from the registry,
    /// stop the reader and writer, and cascade close to every channel.
    /// Idempotent. Frames still queued for sending are lost.
    pub fn close(&self) {
        self.shared.close_conn(Error::ConnectionClosed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Sole owner of the inbound socket half: parse frames, enforce the status
/// machine, hand frames to their channel's queue.
async fn reader_loop<R>(shared: Arc<ConnectionShared>, reader: R, mut stop: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::with_capacity(PACKET_READ_BUF_SIZE, reader);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            res = read_one(&shared, &mut reader) => {
                if let Err(e) = res {
                    shared.close_conn(e);
                    break;
                }
            }
        }
    }
    debug!(role = ?shared.role, "reader stopped");
}

async fn read_one<R>(shared: &Arc<ConnectionShared>, reader: &mut BufReader<R>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let status = frame::read_status(reader).await?;
    if status == Status::Close {
        // Peer close takes effect before the channel id is even parsed.
        debug!(role = ?shared.role, "close frame from peer");
        return Err(Error::ConnectionClosed);
    }
    let pkt = frame::read_body(status, reader).await?;
    let channel = shared
        .get_channel(pkt.channel_id)
        .ok_or(ProtocolError::UnknownChannel(pkt.channel_id))?;
    check_progression(shared.role.recv_direction(), channel.last_status(), status)?;
    channel.set_last_status(status);
    channel.record_read(pkt.wire_size() as u64);
    if channel.push_inbound(pkt).await.is_err() {
        // The channel closed between lookup and push; the frame dies with it.
        debug!(channel = channel.id(), "inbound frame dropped: dispatcher gone");
    }
    Ok(())
}

/// Sole owner of the outbound socket half: drain the connection-wide queue
/// and write each frame contiguously.
async fn writer_loop<W>(
    shared: Arc<ConnectionShared>,
    writer: W,
    mut out_rx: mpsc::Receiver<Packet>,
    mut stop: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut writer = writer;
    let mut buf = BytesMut::with_capacity(PACKET_READ_BUF_SIZE);
    loop {
        let pkt = tokio::select! {
            _ = stop.changed() => break,
            pkt = out_rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => break,
            },
        };
        buf.clear();
        if let Err(e) = pkt.encode_into(&mut buf) {
            // Frames are validated before they are enqueued; anything
            // slipping through is worth the whole connection.
            warn!(channel = pkt.channel_id, error = %e, "unencodable frame in outbound queue");
            shared.close_conn(e);
            break;
        }
        let res = tokio::select! {
            _ = stop.changed() => break,
            res = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => res,
        };
        if let Err(e) = res {
            shared.close_conn(Error::Io(e));
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!(role = ?shared.role, "writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;
    use std::time::Duration;

    #[test]
    fn allocator_never_returns_zero_or_live_ids() {
        let mut table = ChannelTable::default();
        let a = table.alloc_id().unwrap();
        let b = table.alloc_id().unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn allocator_reuses_released_ids() {
        let mut table = ChannelTable::default();
        let a = table.alloc_id().unwrap();
        let _b = table.alloc_id().unwrap();
        table.release_id(a);
        assert_eq!(table.alloc_id().unwrap(), a);
    }

    #[test]
    fn allocator_never_recycles_the_system_id() {
        let mut table = ChannelTable::default();
        table.release_id(SYSTEM_CHANNEL_ID);
        assert!(table.free_ids.is_empty());
    }

    #[test]
    fn allocator_exhaustion_is_distinguishable() {
        let mut table = ChannelTable {
            max_id: u32::MAX - 1,
            ..ChannelTable::default()
        };
        assert_eq!(table.alloc_id().unwrap(), u32::MAX);
        assert!(matches!(table.alloc_id(), Err(Error::IdsExhausted)));
        // Releasing an id makes allocation work again.
        table.release_id(7);
        assert_eq!(table.alloc_id().unwrap(), 7);
    }

    #[tokio::test]
    async fn close_frame_in_dispatcher_queue_closes_only_the_channel() {
        let (a, b) = tokio::io::duplex(4096);
        let server = Connection::new(a, Role::Server, Arc::new(NoopHandler));
        let _client = Connection::new(b, Role::Client, Arc::new(NoopHandler));

        let sys = server.channel(SYSTEM_CHANNEL_ID).unwrap();
        sys.push_inbound(Packet::close(SYSTEM_CHANNEL_ID))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !sys.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "channel never closed"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!server.is_closed());
        assert!(server.channel(SYSTEM_CHANNEL_ID).is_none());
    }

    #[tokio::test]
    async fn channel_ids_are_sorted() {
        let (a, _b) = tokio::io::duplex(4096);
        let server = Connection::new(a, Role::Server, Arc::new(NoopHandler));
        let c1 = server.create_channel().unwrap();
        let c2 = server.create_channel().unwrap();
        assert_eq!(
            server.channel_ids(),
            vec![SYSTEM_CHANNEL_ID, c1.id(), c2.id()]
        );
    }
}
