//! Length-prefixed message framing shared by both ends of a connection.
//!
//! Every message on the wire is `[u32 length][payload]` with the length in
//! big-endian byte order, and the payload is a serialized [`SaberMessage`]:
//! `[i32 type][u32 |data|][data][u32 |extra_data|][extra_data]`. Stream
//! order is preserved; batching falls out of writing multiple frames into
//! one outbox flush.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame payload, matching the 1 MB data cap plus
/// generous header room. Anything larger is treated as stream corruption.
pub(crate) const MAX_FRAME: u32 = 2 * 1024 * 1024;

/// The kind of a [`SaberMessage`], dispatching both request and response
/// handling.
#[derive(Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
#[repr(i32)]
pub enum MessageType {
    Connect = 1,
    Notification = 2,
    Create = 3,
    Delete = 4,
    Exists = 5,
    GetData = 6,
    SetData = 7,
    GetAcl = 8,
    SetAcl = 9,
    GetChildren = 10,
    Master = 11,
    Ping = 12,
    SetWatches = 13,
    Close = 14,
}

impl MessageType {
    pub(crate) fn from_i32(t: i32) -> Option<MessageType> {
        match t {
            1 => Some(MessageType::Connect),
            2 => Some(MessageType::Notification),
            3 => Some(MessageType::Create),
            4 => Some(MessageType::Delete),
            5 => Some(MessageType::Exists),
            6 => Some(MessageType::GetData),
            7 => Some(MessageType::SetData),
            8 => Some(MessageType::GetAcl),
            9 => Some(MessageType::SetAcl),
            10 => Some(MessageType::GetChildren),
            11 => Some(MessageType::Master),
            12 => Some(MessageType::Ping),
            13 => Some(MessageType::SetWatches),
            14 => Some(MessageType::Close),
            _ => None,
        }
    }
}

/// One framed protocol message: a type tag, the typed payload bytes, and
/// the out-of-band extra data (requests use it to carry the client's
/// chroot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaberMessage {
    pub type_: MessageType,
    pub data: Vec<u8>,
    pub extra_data: Vec<u8>,
}

impl SaberMessage {
    pub(crate) fn new(type_: MessageType, data: Vec<u8>) -> SaberMessage {
        SaberMessage {
            type_,
            data,
            extra_data: Vec::new(),
        }
    }

    pub(crate) fn with_extra(type_: MessageType, data: Vec<u8>, extra_data: Vec<u8>) -> SaberMessage {
        SaberMessage {
            type_,
            data,
            extra_data,
        }
    }

    /// Append this message, framed, to `buffer`.
    pub(crate) fn encode_into(&self, buffer: &mut Vec<u8>) {
        let lengthi = buffer.len();
        // dummy length
        buffer.extend_from_slice(&[0, 0, 0, 0]);
        WriteBytesExt::write_i32::<BigEndian>(buffer, self.type_ as i32)
            .expect("Vec::write should never fail");
        WriteBytesExt::write_u32::<BigEndian>(buffer, self.data.len() as u32)
            .expect("Vec::write should never fail");
        Write::write_all(buffer, &self.data).expect("Vec::write should never fail");
        WriteBytesExt::write_u32::<BigEndian>(buffer, self.extra_data.len() as u32)
            .expect("Vec::write should never fail");
        Write::write_all(buffer, &self.extra_data).expect("Vec::write should never fail");
        // set true length
        let written = buffer.len() - lengthi - 4;
        let mut length = &mut buffer[lengthi..lengthi + 4];
        WriteBytesExt::write_u32::<BigEndian>(&mut length, written as u32)
            .expect("Vec::write should never fail");
    }

    /// Parse one payload (the bytes between two frame boundaries).
    pub(crate) fn decode(payload: &[u8]) -> io::Result<SaberMessage> {
        let mut reader = payload;
        let raw_type = ReadBytesExt::read_i32::<BigEndian>(&mut reader)?;
        let type_ = MessageType::from_i32(raw_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type {}", raw_type),
            )
        })?;
        let data = read_chunk(&mut reader)?;
        let extra_data = read_chunk(&mut reader)?;
        Ok(SaberMessage {
            type_,
            data,
            extra_data,
        })
    }
}

fn read_chunk(reader: &mut &[u8]) -> io::Result<Vec<u8>> {
    let len = ReadBytesExt::read_u32::<BigEndian>(reader)? as usize;
    if len > reader.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "chunk length exceeds payload",
        ));
    }
    let mut buf = vec![0; len];
    Read::read_exact(reader, &mut buf)?;
    Ok(buf)
}

/// Read one framed message from an async stream. Returns `None` on a clean
/// end of stream at a frame boundary.
pub(crate) async fn read_message<R>(reader: &mut R) -> io::Result<Option<SaberMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length).await {
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let length = u32::from_be_bytes(length);
    if length > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", length),
        ));
    }
    let mut payload = vec![0; length as usize];
    reader.read_exact(&mut payload).await?;
    SaberMessage::decode(&payload).map(Some)
}

/// Write one framed message to an async stream.
pub(crate) async fn write_message<W>(writer: &mut W, message: &SaberMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(16 + message.data.len() + message.extra_data.len());
    message.encode_into(&mut buffer);
    writer.write_all(&buffer).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let msg = SaberMessage::with_extra(
            MessageType::Create,
            b"payload bytes".to_vec(),
            b"/chroot".to_vec(),
        );
        let mut buffer = Vec::new();
        msg.encode_into(&mut buffer);

        let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        assert_eq!(length, buffer.len() - 4);

        let decoded = SaberMessage::decode(&buffer[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn consecutive_frames_preserve_order() {
        let first = SaberMessage::new(MessageType::Ping, Vec::new());
        let second = SaberMessage::new(MessageType::GetData, b"x".to_vec());
        let mut buffer = Vec::new();
        first.encode_into(&mut buffer);
        second.encode_into(&mut buffer);

        let len0 = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        let a = SaberMessage::decode(&buffer[4..4 + len0]).unwrap();
        let rest = &buffer[4 + len0..];
        let len1 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let b = SaberMessage::decode(&rest[4..4 + len1]).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(4 + len0 + 4 + len1, buffer.len());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut payload = Vec::new();
        WriteBytesExt::write_i32::<BigEndian>(&mut payload, 99).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut payload, 0).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut payload, 0).unwrap();
        assert!(SaberMessage::decode(&payload).is_err());
    }

    #[test]
    fn rejects_truncated_chunk() {
        let mut payload = Vec::new();
        WriteBytesExt::write_i32::<BigEndian>(&mut payload, MessageType::Create as i32).unwrap();
        WriteBytesExt::write_u32::<BigEndian>(&mut payload, 1000).unwrap();
        payload.extend_from_slice(b"short");
        assert!(SaberMessage::decode(&payload).is_err());
    }
}
