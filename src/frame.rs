//! The wire frame and its codec.
//!
//! # Wire format
//!
//! ```text
//! ┌────────┬─────────────┬──────┬────────────┬────────────┬────────────┐
//! │ status │ path        │ 0x00 │ channel_id │ data_len   │ data       │
//! │ 1 byte │ ≤ 512 bytes │      │ u32 BE     │ u32 BE     │ data_len B │
//! └────────┴─────────────┴──────┴────────────┴────────────┴────────────┘
//! ```
//!
//! The codec is stateless: every frame is self-describing in isolation, so
//! the reader carries no parse state across frames. The path rides on every
//! frame even though only the first frame of a logical message uses it.
//!
//! `data_len` must be ≤ 16 MiB and non-zero unless the frame is a close
//! marker. A close status byte at the top of a frame ends the connection
//! before the rest of the frame is even parsed; see
//! [`Connection`](crate::Connection).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::consts::{MAX_PACKET_SIZE, MAX_PATH_LEN};
use crate::error::{Error, ProtocolError, Result};
use crate::status::{Direction, Status};

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Frame status; see [`Status`].
    pub status: Status,
    /// Routing path. A byte string, semantically meaningful only on the
    /// first frame of a logical message.
    pub path: Bytes,
    /// The logical stream this frame belongs to.
    pub channel_id: u32,
    /// Payload bytes.
    pub data: Bytes,
}

impl Packet {
    /// Build a frame.
    pub fn new(
        status: Status,
        path: impl Into<Bytes>,
        channel_id: u32,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            status,
            path: path.into(),
            channel_id,
            data: data.into(),
        }
    }

    /// Build a close frame naming the given channel.
    pub fn close(channel_id: u32) -> Self {
        Self {
            status: Status::Close,
            path: Bytes::new(),
            channel_id,
            data: Bytes::new(),
        }
    }

    /// Which half of the exchange this frame belongs to.
    pub fn direction(&self) -> Option<Direction> {
        self.status.direction()
    }

    /// Total encoded size of this frame.
    pub fn wire_size(&self) -> usize {
        1 + self.path.len() + 1 + 4 + 4 + self.data.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.path.len() > MAX_PATH_LEN {
            return Err(Error::PathTooLong(self.path.len()));
        }
        if self.path.contains(&0) {
            return Err(Error::PathHasNul);
        }
        if self.data.len() > MAX_PACKET_SIZE {
            return Err(Error::PayloadTooLong(self.data.len()));
        }
        if self.data.is_empty() && self.status != Status::Close {
            return Err(Error::Protocol(ProtocolError::EmptyPayload));
        }
        dst.reserve(self.wire_size());
        dst.put_u8(self.status as u8);
        dst.put_slice(&self.path);
        dst.put_u8(0);
        dst.put_u32(self.channel_id);
        dst.put_u32(self.data.len() as u32);
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Encode the frame into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Read one complete frame, status byte included.
    ///
    /// The connection reader does not use this directly: it consumes the
    /// status byte itself so a peer close can take effect before the rest
    /// of the frame arrives.
    pub async fn read_from<R>(reader: &mut R) -> Result<Packet>
    where
        R: AsyncBufRead + Unpin,
    {
        let status = read_status(reader).await?;
        read_body(status, reader).await
    }
}

/// Read and decode the status byte that opens a frame.
///
/// A clean end of stream at a frame boundary reports `ConnectionClosed`.
pub(crate) async fn read_status<R>(reader: &mut R) -> Result<Status>
where
    R: AsyncRead + Unpin,
{
    let raw = reader.read_u8().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Io(e)
        }
    })?;
    Status::from_u8(raw).ok_or_else(|| Error::Protocol(ProtocolError::InvalidStatus(raw)))
}

/// Read the remainder of a frame whose status byte was already consumed.
pub(crate) async fn read_body<R>(status: Status, reader: &mut R) -> Result<Packet>
where
    R: AsyncBufRead + Unpin,
{
    // Path, up to and including the NUL terminator. The limit caps a peer
    // that never sends the terminator.
    let mut path = Vec::with_capacity(32);
    let mut limited = (&mut *reader).take((MAX_PATH_LEN + 1) as u64);
    limited.read_until(0, &mut path).await.map_err(mid_frame)?;
    match path.last() {
        Some(0) => {
            path.pop();
        }
        Some(_) if path.len() > MAX_PATH_LEN => {
            return Err(Error::Protocol(ProtocolError::PathUnterminated));
        }
        _ => return Err(Error::Protocol(ProtocolError::Truncated)),
    }

    let channel_id = reader.read_u32().await.map_err(mid_frame)?;
    let data_len = reader.read_u32().await.map_err(mid_frame)?;
    if data_len as usize > MAX_PACKET_SIZE {
        return Err(Error::Protocol(ProtocolError::OversizedPayload(data_len)));
    }
    if data_len == 0 && status != Status::Close {
        return Err(Error::Protocol(ProtocolError::EmptyPayload));
    }

    let mut data = vec![0u8; data_len as usize];
    reader.read_exact(&mut data).await.map_err(mid_frame)?;

    Ok(Packet {
        status,
        path: path.into(),
        channel_id,
        data: data.into(),
    })
}

fn mid_frame(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Protocol(ProtocolError::Truncated)
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_exact_wire_bytes() {
        let pkt = Packet::new(Status::RequestDone, &b"/echo"[..], 7, &b"hi"[..]);
        let wire = pkt.encode().unwrap();
        let expected: &[u8] = &[
            1, // status: request, first frame, complete
            b'/', b'e', b'c', b'h', b'o', 0, // path + terminator
            0, 0, 0, 7, // channel id
            0, 0, 0, 2, // data length
            b'h', b'i',
        ];
        assert_eq!(&wire[..], expected);
        assert_eq!(pkt.wire_size(), expected.len());
    }

    #[tokio::test]
    async fn decode_encode_round_trip() {
        let original = Packet::new(Status::ResponseEnd, &b"/some/path"[..], 42, vec![9u8; 1000]);
        let wire = original.encode().unwrap();
        let mut cursor = &wire[..];
        let decoded = Packet::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, original);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn close_frame_round_trip() {
        let original = Packet::close(12);
        let wire = original.encode().unwrap();
        let mut cursor = &wire[..];
        let decoded = Packet::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let a = Packet::new(Status::RequestBegin, &b"/a"[..], 1, vec![1u8; 16]);
        let b = Packet::new(Status::RequestEnd, &b"/a"[..], 1, vec![2u8; 8]);
        let mut wire = BytesMut::new();
        a.encode_into(&mut wire).unwrap();
        b.encode_into(&mut wire).unwrap();

        let mut cursor = &wire[..];
        assert_eq!(Packet::read_from(&mut cursor).await.unwrap(), a);
        assert_eq!(Packet::read_from(&mut cursor).await.unwrap(), b);
        assert!(cursor.is_empty());
    }

    #[test]
    fn encode_rejects_long_path() {
        let pkt = Packet::new(Status::RequestDone, vec![b'a'; MAX_PATH_LEN + 1], 1, &b"x"[..]);
        assert!(matches!(pkt.encode(), Err(Error::PathTooLong(_))));
        // Exactly at the limit is fine.
        let pkt = Packet::new(Status::RequestDone, vec![b'a'; MAX_PATH_LEN], 1, &b"x"[..]);
        assert!(pkt.encode().is_ok());
    }

    #[test]
    fn encode_rejects_nul_in_path() {
        let pkt = Packet::new(Status::RequestDone, &b"/a\0b"[..], 1, &b"x"[..]);
        assert!(matches!(pkt.encode(), Err(Error::PathHasNul)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let pkt = Packet::new(
            Status::RequestDone,
            &b"/big"[..],
            1,
            vec![0u8; MAX_PACKET_SIZE + 1],
        );
        assert!(matches!(pkt.encode(), Err(Error::PayloadTooLong(_))));
    }

    #[test]
    fn encode_rejects_empty_payload_on_data_frames() {
        let pkt = Packet::new(Status::RequestDone, &b"/x"[..], 1, Bytes::new());
        assert!(matches!(
            pkt.encode(),
            Err(Error::Protocol(ProtocolError::EmptyPayload))
        ));
        // Close frames carry no payload by design.
        assert!(Packet::close(1).encode().is_ok());
    }

    #[tokio::test]
    async fn decode_rejects_invalid_status_byte() {
        let wire = [200u8, 0, 0, 0, 0, 1, 0, 0, 0, 1, b'x'];
        let mut cursor = &wire[..];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::Protocol(ProtocolError::InvalidStatus(200)))
        ));
    }

    #[tokio::test]
    async fn decode_rejects_zero_data_len() {
        let wire = [1u8, b'/', b'x', 0, 0, 0, 0, 1, 0, 0, 0, 0];
        let mut cursor = &wire[..];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::Protocol(ProtocolError::EmptyPayload))
        ));
    }

    #[tokio::test]
    async fn decode_rejects_oversized_data_len() {
        let mut wire = BytesMut::new();
        wire.put_u8(1);
        wire.put_slice(b"/x\0");
        wire.put_u32(1);
        wire.put_u32((MAX_PACKET_SIZE + 1) as u32);
        let mut cursor = &wire[..];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::Protocol(ProtocolError::OversizedPayload(_)))
        ));
    }

    #[tokio::test]
    async fn decode_rejects_unterminated_path() {
        let mut wire = vec![1u8];
        wire.extend_from_slice(&[b'a'; MAX_PATH_LEN + 64]);
        let mut cursor = &wire[..];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::Protocol(ProtocolError::PathUnterminated))
        ));
    }

    #[tokio::test]
    async fn decode_reports_truncated_frame() {
        let full = Packet::new(Status::RequestDone, &b"/echo"[..], 7, &b"payload"[..])
            .encode()
            .unwrap();
        // Drop the tail of the payload.
        let mut cursor = &full[..full.len() - 3];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::Protocol(ProtocolError::Truncated))
        ));
    }

    #[tokio::test]
    async fn clean_eof_reports_connection_closed() {
        let mut cursor: &[u8] = &[];
        assert!(matches!(
            Packet::read_from(&mut cursor).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
