//! Typed response payloads.
//!
//! The server serializes responses through the record structs; the client
//! parses them into the [`Response`] enum. Every operation response leads
//! with `[i32 code][path]` so the session engine can assert the per-op
//! queue pairing before anything else is looked at.

use super::codes::Code;
use super::message::{MessageType, SaberMessage};
use super::request::{
    read_acl_list, read_buffer, read_string, read_string_list, write_list, write_string_list,
    WriteTo,
};
use crate::{Acl, SessionState, Stat, WatchedEvent, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub(crate) trait ReadFrom: Sized {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>;
}

impl ReadFrom for Stat {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Stat> {
        Ok(Stat {
            czxid: reader.read_i64::<BigEndian>()?,
            mzxid: reader.read_i64::<BigEndian>()?,
            ctime: reader.read_i64::<BigEndian>()?,
            mtime: reader.read_i64::<BigEndian>()?,
            version: reader.read_i32::<BigEndian>()?,
            cversion: reader.read_i32::<BigEndian>()?,
            aversion: reader.read_i32::<BigEndian>()?,
            ephemeral_owner: reader.read_u64::<BigEndian>()?,
            data_length: reader.read_i32::<BigEndian>()?,
            num_children: reader.read_i32::<BigEndian>()?,
            pzxid: reader.read_i64::<BigEndian>()?,
        })
    }
}

impl WriteTo for Stat {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i64::<BigEndian>(self.czxid)?;
        writer.write_i64::<BigEndian>(self.mzxid)?;
        writer.write_i64::<BigEndian>(self.ctime)?;
        writer.write_i64::<BigEndian>(self.mtime)?;
        writer.write_i32::<BigEndian>(self.version)?;
        writer.write_i32::<BigEndian>(self.cversion)?;
        writer.write_i32::<BigEndian>(self.aversion)?;
        writer.write_u64::<BigEndian>(self.ephemeral_owner)?;
        writer.write_i32::<BigEndian>(self.data_length)?;
        writer.write_i32::<BigEndian>(self.num_children)?;
        writer.write_i64::<BigEndian>(self.pzxid)
    }
}

impl ReadFrom for WatchedEvent {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<WatchedEvent> {
        let raw_type = reader.read_i32::<BigEndian>()?;
        let raw_state = reader.read_i32::<BigEndian>()?;
        let path = read_string(reader)?;
        let event_type = WatchedEventType::from_i32(raw_type).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown event type {}", raw_type),
            )
        })?;
        let state = SessionState::from_i32(raw_state).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown session state {}", raw_state),
            )
        })?;
        Ok(WatchedEvent {
            event_type,
            state,
            path,
        })
    }
}

impl WriteTo for WatchedEvent {
    fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.event_type as i32)?;
        writer.write_i32::<BigEndian>(self.state as i32)?;
        self.path.as_str().write_to(writer)
    }
}

impl WatchedEvent {
    /// Frame this event as a server-to-client notification.
    pub(crate) fn into_notification(&self) -> SaberMessage {
        let mut data = Vec::new();
        self.write_to(&mut data).expect("Vec::write should never fail");
        SaberMessage::new(MessageType::Notification, data)
    }
}

fn read_code<R: Read>(reader: &mut R) -> io::Result<Code> {
    let raw = reader.read_i32::<BigEndian>()?;
    Code::from_i32(raw).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown status code {}", raw),
        )
    })
}

/// The body of a successfully parsed response, minus the leading code and
/// echoed path.
#[derive(Debug)]
pub(crate) enum Response {
    Connect { session_id: u64, timeout_ms: u32 },
    Stat(Stat),
    String(String),
    Strings(Vec<String>),
    GetData { bytes: Vec<u8>, stat: Stat },
    GetAcl { acl: Vec<Acl>, stat: Stat },
    Empty,
}

/// A parsed operation response: status code, echoed path, and body.
#[derive(Debug)]
pub(crate) struct ParsedResponse {
    pub code: Code,
    pub path: String,
    pub body: Response,
}

impl Response {
    /// Parse a response payload for the given message type.
    pub(crate) fn parse(type_: MessageType, payload: &[u8]) -> io::Result<ParsedResponse> {
        let mut reader = payload;
        if type_ == MessageType::Connect {
            return Ok(ParsedResponse {
                code: Code::Ok,
                path: String::new(),
                body: Response::Connect {
                    session_id: reader.read_u64::<BigEndian>()?,
                    timeout_ms: reader.read_u32::<BigEndian>()?,
                },
            });
        }

        let code = read_code(&mut reader)?;
        let path = read_string(&mut reader)?;
        let body = match type_ {
            MessageType::Create => Response::String(read_string(&mut reader)?),
            MessageType::Delete => Response::Empty,
            MessageType::Exists | MessageType::SetData | MessageType::SetAcl => {
                Response::Stat(Stat::read_from(&mut reader)?)
            }
            MessageType::GetData => Response::GetData {
                bytes: read_buffer(&mut reader)?,
                stat: Stat::read_from(&mut reader)?,
            },
            MessageType::GetAcl => Response::GetAcl {
                acl: read_acl_list(&mut reader)?,
                stat: Stat::read_from(&mut reader)?,
            },
            MessageType::GetChildren => Response::Strings(read_string_list(&mut reader)?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{:?} is not an operation response", type_),
                ))
            }
        };
        Ok(ParsedResponse { code, path, body })
    }
}

// Server-side response builders, writing the exact field order parsed by
// `Response::parse`.

pub(crate) struct ConnectResponse {
    pub session_id: u64,
    pub timeout_ms: u32,
}

impl ConnectResponse {
    pub(crate) fn into_message(self) -> SaberMessage {
        let mut data = Vec::new();
        data.write_u64::<BigEndian>(self.session_id)
            .expect("Vec::write should never fail");
        data.write_u32::<BigEndian>(self.timeout_ms)
            .expect("Vec::write should never fail");
        SaberMessage::new(MessageType::Connect, data)
    }
}

/// Write the `[code][path]` prefix common to every operation response.
fn write_prefix(data: &mut Vec<u8>, code: Code, path: &str) {
    data.write_i32::<BigEndian>(code as i32)
        .expect("Vec::write should never fail");
    path.write_to(&mut *data).expect("Vec::write should never fail");
}

/// Build an operation response that carries only a `Stat` (exists,
/// set_data, set_acl). On error the stat is zeroed.
pub(crate) fn stat_response(
    type_: MessageType,
    code: Code,
    path: &str,
    stat: Stat,
) -> SaberMessage {
    let mut data = Vec::new();
    write_prefix(&mut data, code, path);
    stat.write_to(&mut data).expect("Vec::write should never fail");
    SaberMessage::new(type_, data)
}

pub(crate) fn create_response(code: Code, path: &str, name: &str) -> SaberMessage {
    let mut data = Vec::new();
    // on success the echoed path is the created name (sequential creates
    // extend the requested path)
    write_prefix(&mut data, code, if code == Code::Ok { name } else { path });
    name.write_to(&mut data).expect("Vec::write should never fail");
    SaberMessage::new(MessageType::Create, data)
}

pub(crate) fn delete_response(code: Code, path: &str) -> SaberMessage {
    let mut data = Vec::new();
    write_prefix(&mut data, code, path);
    SaberMessage::new(MessageType::Delete, data)
}

pub(crate) fn get_data_response(
    code: Code,
    path: &str,
    bytes: &[u8],
    stat: Stat,
) -> SaberMessage {
    let mut data = Vec::new();
    write_prefix(&mut data, code, path);
    bytes.write_to(&mut data).expect("Vec::write should never fail");
    stat.write_to(&mut data).expect("Vec::write should never fail");
    SaberMessage::new(MessageType::GetData, data)
}

pub(crate) fn get_acl_response(
    code: Code,
    path: &str,
    acl: &[Acl],
    stat: Stat,
) -> SaberMessage {
    let mut data = Vec::new();
    write_prefix(&mut data, code, path);
    write_list(&mut data, acl).expect("Vec::write should never fail");
    stat.write_to(&mut data).expect("Vec::write should never fail");
    SaberMessage::new(MessageType::GetAcl, data)
}

pub(crate) fn get_children_response(
    code: Code,
    path: &str,
    children: &[String],
) -> SaberMessage {
    let mut data = Vec::new();
    write_prefix(&mut data, code, path);
    write_string_list(&mut data, children).expect("Vec::write should never fail");
    SaberMessage::new(MessageType::GetChildren, data)
}

/// The master hint payload: where the current leader lives.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MasterHint {
    pub host: String,
    pub port: u16,
}

impl MasterHint {
    pub(crate) fn into_message(self) -> SaberMessage {
        let mut data = Vec::new();
        self.host
            .as_str()
            .write_to(&mut data)
            .expect("Vec::write should never fail");
        data.write_u16::<BigEndian>(self.port)
            .expect("Vec::write should never fail");
        SaberMessage::new(MessageType::Master, data)
    }

    pub(crate) fn read_from<R: Read>(reader: &mut R) -> io::Result<MasterHint> {
        Ok(MasterHint {
            host: read_string(reader)?,
            port: reader.read_u16::<BigEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permission;

    fn stat_with_version(version: i32) -> Stat {
        Stat {
            version,
            data_length: 5,
            ..Stat::default()
        }
    }

    #[test]
    fn get_data_response_round_trips() {
        let msg = get_data_response(Code::Ok, "/a", b"hello", stat_with_version(3));
        let parsed = Response::parse(MessageType::GetData, &msg.data).unwrap();
        assert_eq!(parsed.code, Code::Ok);
        assert_eq!(parsed.path, "/a");
        match parsed.body {
            Response::GetData { bytes, stat } => {
                assert_eq!(bytes, b"hello");
                assert_eq!(stat.version, 3);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn error_response_carries_code_and_path() {
        let msg = stat_response(MessageType::SetData, Code::BadVersion, "/a", Stat::default());
        let parsed = Response::parse(MessageType::SetData, &msg.data).unwrap();
        assert_eq!(parsed.code, Code::BadVersion);
        assert_eq!(parsed.path, "/a");
    }

    #[test]
    fn create_response_echoes_sequential_name() {
        let msg = create_response(Code::Ok, "/q-", "/q-0000000007");
        let parsed = Response::parse(MessageType::Create, &msg.data).unwrap();
        assert_eq!(parsed.path, "/q-0000000007");
        match parsed.body {
            Response::String(name) => assert_eq!(name, "/q-0000000007"),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn acl_response_round_trips() {
        let acl = vec![Acl {
            perms: Permission::READ | Permission::WRITE,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }];
        let msg = get_acl_response(Code::Ok, "/a", &acl, Stat::default());
        let parsed = Response::parse(MessageType::GetAcl, &msg.data).unwrap();
        match parsed.body {
            Response::GetAcl { acl: parsed_acl, .. } => assert_eq!(parsed_acl, acl),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn notification_round_trips() {
        let event = WatchedEvent::node(WatchedEventType::NodeDeleted, "/gone");
        let msg = event.into_notification();
        assert_eq!(msg.type_, MessageType::Notification);
        let parsed = WatchedEvent::read_from(&mut &msg.data[..]).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn master_hint_round_trips() {
        let hint = MasterHint {
            host: "10.0.0.7".to_string(),
            port: 8888,
        };
        let msg = hint.into_message();
        let parsed = MasterHint::read_from(&mut &msg.data[..]).unwrap();
        assert_eq!(
            parsed,
            MasterHint {
                host: "10.0.0.7".to_string(),
                port: 8888
            }
        );
    }
}
