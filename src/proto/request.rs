//! Typed request payloads.
//!
//! The client serializes requests through the [`Request`] enum; the server
//! parses them back into the record structs below. The two directions are
//! kept in one file so the field orders cannot drift apart, and a test
//! pins each pair together.

use super::message::{MessageType, SaberMessage};
use crate::{Acl, CreateMode, Permission};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::borrow::Cow;
use std::io::{self, Read, Write};

pub(crate) trait WriteTo {
    fn write_to<W: Write>(&self, writer: W) -> io::Result<()>;
}

impl WriteTo for Acl {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.perms.code())?;
        self.scheme.as_str().write_to(&mut writer)?;
        self.id.as_str().write_to(writer)
    }
}

impl WriteTo for str {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.len() as u32)?;
        writer.write_all(self.as_bytes())
    }
}

impl WriteTo for [u8] {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.len() as u32)?;
        writer.write_all(self)
    }
}

pub(crate) fn write_list<W, T>(mut writer: W, ts: &[T]) -> io::Result<()>
where
    T: WriteTo,
    W: Write,
{
    writer.write_u32::<BigEndian>(ts.len() as u32)?;
    for elem in ts {
        elem.write_to(&mut writer)?;
    }
    Ok(())
}

pub(crate) fn write_string_list<W: Write>(mut writer: W, ts: &[String]) -> io::Result<()> {
    writer.write_u32::<BigEndian>(ts.len() as u32)?;
    for elem in ts {
        elem.as_str().write_to(&mut writer)?;
    }
    Ok(())
}

pub(crate) fn read_buffer<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > super::message::MAX_FRAME as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "buffer length exceeds frame limit",
        ));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let raw = read_buffer(reader)?;
    String::from_utf8(raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid utf-8: {}", e)))
}

pub(crate) fn read_string_list<R: Read>(reader: &mut R) -> io::Result<Vec<String>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(read_string(reader)?);
    }
    Ok(out)
}

pub(crate) fn read_acl_list<R: Read>(reader: &mut R) -> io::Result<Vec<Acl>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut out = Vec::with_capacity(len.min(64));
    for _ in 0..len {
        let perms = Permission::from_raw(reader.read_u32::<BigEndian>()?);
        let scheme = read_string(reader)?;
        let id = read_string(reader)?;
        out.push(Acl { perms, scheme, id });
    }
    Ok(out)
}

/// A request as submitted by a user of the client, before it is framed.
#[derive(Debug)]
pub(crate) enum Request {
    Connect {
        session_id: u64,
        timeout_ms: u32,
    },
    Create {
        path: String,
        data: Cow<'static, [u8]>,
        acl: Cow<'static, [Acl]>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    Exists {
        path: String,
        watch: bool,
    },
    GetData {
        path: String,
        watch: bool,
    },
    SetData {
        path: String,
        data: Cow<'static, [u8]>,
        version: i32,
    },
    GetAcl {
        path: String,
    },
    SetAcl {
        path: String,
        acl: Cow<'static, [Acl]>,
        version: i32,
    },
    GetChildren {
        path: String,
        watch: bool,
    },
    SetWatches {
        data: Vec<String>,
        exist: Vec<String>,
        child: Vec<String>,
    },
    Close,
}

impl Request {
    pub(crate) fn message_type(&self) -> MessageType {
        match *self {
            Request::Connect { .. } => MessageType::Connect,
            Request::Create { .. } => MessageType::Create,
            Request::Delete { .. } => MessageType::Delete,
            Request::Exists { .. } => MessageType::Exists,
            Request::GetData { .. } => MessageType::GetData,
            Request::SetData { .. } => MessageType::SetData,
            Request::GetAcl { .. } => MessageType::GetAcl,
            Request::SetAcl { .. } => MessageType::SetAcl,
            Request::GetChildren { .. } => MessageType::GetChildren,
            Request::SetWatches { .. } => MessageType::SetWatches,
            Request::Close => MessageType::Close,
        }
    }

    /// The path this request operates on, as recorded in the per-op queue.
    pub(crate) fn path(&self) -> &str {
        match *self {
            Request::Create { ref path, .. }
            | Request::Delete { ref path, .. }
            | Request::Exists { ref path, .. }
            | Request::GetData { ref path, .. }
            | Request::SetData { ref path, .. }
            | Request::GetAcl { ref path, .. }
            | Request::SetAcl { ref path, .. }
            | Request::GetChildren { ref path, .. } => path,
            _ => "",
        }
    }

    fn serialize_data(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let b = &mut buffer;
        match *self {
            Request::Connect {
                session_id,
                timeout_ms,
            } => {
                b.write_u64::<BigEndian>(session_id)
                    .expect("Vec::write should never fail");
                b.write_u32::<BigEndian>(timeout_ms)
                    .expect("Vec::write should never fail");
            }
            Request::Create {
                ref path,
                ref data,
                ref acl,
                mode,
            } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                data.as_ref()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                write_list(&mut *b, acl).expect("Vec::write should never fail");
                b.write_i32::<BigEndian>(mode as i32)
                    .expect("Vec::write should never fail");
            }
            Request::Delete { ref path, version } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                b.write_i32::<BigEndian>(version)
                    .expect("Vec::write should never fail");
            }
            Request::Exists { ref path, watch }
            | Request::GetData { ref path, watch }
            | Request::GetChildren { ref path, watch } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                b.write_u8(watch as u8).expect("Vec::write should never fail");
            }
            Request::SetData {
                ref path,
                ref data,
                version,
            } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                data.as_ref()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                b.write_i32::<BigEndian>(version)
                    .expect("Vec::write should never fail");
            }
            Request::GetAcl { ref path } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
            }
            Request::SetAcl {
                ref path,
                ref acl,
                version,
            } => {
                path.as_str()
                    .write_to(&mut *b)
                    .expect("Vec::write should never fail");
                write_list(&mut *b, acl).expect("Vec::write should never fail");
                b.write_i32::<BigEndian>(version)
                    .expect("Vec::write should never fail");
            }
            Request::SetWatches {
                ref data,
                ref exist,
                ref child,
            } => {
                write_string_list(&mut *b, data).expect("Vec::write should never fail");
                write_string_list(&mut *b, exist).expect("Vec::write should never fail");
                write_string_list(&mut *b, child).expect("Vec::write should never fail");
            }
            Request::Close => {}
        }
        buffer
    }

    /// Frame this request, stamping the client's chroot into `extra_data`.
    pub(crate) fn into_message(&self, root: &str) -> SaberMessage {
        SaberMessage::with_extra(
            self.message_type(),
            self.serialize_data(),
            root.as_bytes().to_vec(),
        )
    }
}

// Server-side parses of the request payloads, in the exact field order
// written by `Request::serialize_data`.

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConnectRequest {
    pub session_id: u64,
    pub timeout_ms: u32,
}

impl ConnectRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<ConnectRequest> {
        Ok(ConnectRequest {
            session_id: reader.read_u64::<BigEndian>()?,
            timeout_ms: reader.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub mode: CreateMode,
}

impl CreateRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<CreateRequest> {
        let path = read_string(reader)?;
        let data = read_buffer(reader)?;
        let acl = read_acl_list(reader)?;
        let raw_mode = reader.read_i32::<BigEndian>()?;
        let mode = CreateMode::from_i32(raw_mode).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown create mode {}", raw_mode),
            )
        })?;
        Ok(CreateRequest {
            path,
            data,
            acl,
            mode,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

impl DeleteRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<DeleteRequest> {
        Ok(DeleteRequest {
            path: read_string(reader)?,
            version: reader.read_i32::<BigEndian>()?,
        })
    }
}

/// Shared shape of `Exists`, `GetData`, and `GetChildren` requests.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReadRequest {
    pub path: String,
    pub watch: bool,
}

impl ReadRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<ReadRequest> {
        Ok(ReadRequest {
            path: read_string(reader)?,
            watch: reader.read_u8()? != 0,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

impl SetDataRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<SetDataRequest> {
        Ok(SetDataRequest {
            path: read_string(reader)?,
            data: read_buffer(reader)?,
            version: reader.read_i32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct GetAclRequest {
    pub path: String,
}

impl GetAclRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<GetAclRequest> {
        Ok(GetAclRequest {
            path: read_string(reader)?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SetAclRequest {
    pub path: String,
    pub acl: Vec<Acl>,
    pub version: i32,
}

impl SetAclRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<SetAclRequest> {
        Ok(SetAclRequest {
            path: read_string(reader)?,
            acl: read_acl_list(reader)?,
            version: reader.read_i32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SetWatchesRequest {
    pub data: Vec<String>,
    pub exist: Vec<String>,
    pub child: Vec<String>,
}

impl SetWatchesRequest {
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<SetWatchesRequest> {
        Ok(SetWatchesRequest {
            data: read_string_list(reader)?,
            exist: read_string_list(reader)?,
            child: read_string_list(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_round_trips() {
        let req = Request::Create {
            path: "/a/b".to_string(),
            data: Cow::from(&b"hello"[..]),
            acl: Cow::from(Acl::open_unsafe()),
            mode: CreateMode::EphemeralSequential,
        };
        let data = req.serialize_data();
        let parsed = CreateRequest::read_from(&mut &data[..]).unwrap();
        assert_eq!(parsed.path, "/a/b");
        assert_eq!(parsed.data, b"hello");
        assert_eq!(parsed.acl, Acl::open_unsafe());
        assert_eq!(parsed.mode, CreateMode::EphemeralSequential);
    }

    #[test]
    fn read_requests_round_trip() {
        let req = Request::Exists {
            path: "/watched".to_string(),
            watch: true,
        };
        let data = req.serialize_data();
        let parsed = ReadRequest::read_from(&mut &data[..]).unwrap();
        assert_eq!(parsed.path, "/watched");
        assert!(parsed.watch);
    }

    #[test]
    fn set_data_and_connect_round_trip() {
        let req = Request::SetData {
            path: "/k".to_string(),
            data: Cow::from(&b"v1"[..]),
            version: 7,
        };
        let data = req.serialize_data();
        let parsed = SetDataRequest::read_from(&mut &data[..]).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.data, b"v1");

        let req = Request::Connect {
            session_id: 42,
            timeout_ms: 10_000,
        };
        let data = req.serialize_data();
        let parsed = ConnectRequest::read_from(&mut &data[..]).unwrap();
        assert_eq!(
            parsed,
            ConnectRequest {
                session_id: 42,
                timeout_ms: 10_000
            }
        );
    }

    #[test]
    fn set_watches_round_trips() {
        let req = Request::SetWatches {
            data: vec!["/a".to_string()],
            exist: vec!["/b".to_string(), "/c".to_string()],
            child: vec![],
        };
        let data = req.serialize_data();
        let parsed = SetWatchesRequest::read_from(&mut &data[..]).unwrap();
        assert_eq!(parsed.data, vec!["/a"]);
        assert_eq!(parsed.exist, vec!["/b", "/c"]);
        assert!(parsed.child.is_empty());
    }

    #[test]
    fn chroot_lands_in_extra_data() {
        let req = Request::GetData {
            path: "/k".to_string(),
            watch: false,
        };
        let msg = req.into_message("/app");
        assert_eq!(msg.type_, MessageType::GetData);
        assert_eq!(msg.extra_data, b"/app");
    }
}
