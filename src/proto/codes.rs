/// Status code carried in every response payload. `Ok` is zero; everything
/// else describes why the operation was not performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// Server-side error with no more specific classification.
    SystemError = 1,
    /// A runtime inconsistency was found.
    RuntimeInconsistency = 2,
    /// Connection to the server has been lost.
    ConnectionLoss = 3,
    /// Error while marshalling or unmarshalling data.
    MarshallingError = 4,
    /// Attempted to operate on a node that does not exist.
    NoNode = 5,
    /// The requester's identity is not granted the required permission.
    NoAuth = 6,
    /// The expected version does not match the node's version.
    BadVersion = 7,
    /// Ephemeral nodes may not have children.
    NoChildrenForEphemerals = 8,
    /// Request to create a node that already exists.
    NodeExists = 9,
    /// The node has children and cannot be deleted.
    NotEmpty = 10,
    /// The session has been expired by the server.
    SessionExpired = 11,
    /// The given ACL list is invalid.
    InvalidAcl = 12,
    /// Client authentication failed.
    AuthFailed = 13,
}

impl Code {
    pub(crate) fn from_i32(code: i32) -> Option<Code> {
        match code {
            0 => Some(Code::Ok),
            1 => Some(Code::SystemError),
            2 => Some(Code::RuntimeInconsistency),
            3 => Some(Code::ConnectionLoss),
            4 => Some(Code::MarshallingError),
            5 => Some(Code::NoNode),
            6 => Some(Code::NoAuth),
            7 => Some(Code::BadVersion),
            8 => Some(Code::NoChildrenForEphemerals),
            9 => Some(Code::NodeExists),
            10 => Some(Code::NotEmpty),
            11 => Some(Code::SessionExpired),
            12 => Some(Code::InvalidAcl),
            13 => Some(Code::AuthFailed),
            _ => None,
        }
    }
}
