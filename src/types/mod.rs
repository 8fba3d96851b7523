mod acl;
pub use self::acl::*;

mod watch;
pub use self::watch::*;

/// Statistics about a node in the namespace, similar to the UNIX `stat`
/// structure.
///
/// # Time in the coordination service
///
/// Time is tracked in several ways:
///
/// - **zxid**: Every committed change receives a *zxid* (transaction id)
///   from the consensus layer. zxids expose the total ordering of all
///   changes -- if *zxid:a* is smaller than *zxid:b*, the change stamped
///   *zxid:a* happened before the one stamped *zxid:b*.
/// - **Version numbers**: Every change to a node increases one of its
///   version counters.
/// - **Clock time**: Wall-clock time is never used for decisions, but
///   creation and modification timestamps are recorded in the `Stat`.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Stat {
    /// The transaction id that created the node.
    pub czxid: i64,
    /// The last transaction that modified the node's data.
    pub mzxid: i64,
    /// Milliseconds since epoch when the node was created.
    pub ctime: i64,
    /// Milliseconds since epoch when the node was last modified.
    pub mtime: i64,
    /// The number of changes to the data of the node.
    pub version: i32,
    /// The number of changes to the children of the node.
    pub cversion: i32,
    /// The number of changes to the ACL of the node.
    pub aversion: i32,
    /// The session id of the owner of this node, or 0 if it is not
    /// ephemeral.
    pub ephemeral_owner: u64,
    /// The length of the data field of the node.
    pub data_length: i32,
    /// The number of children this node has.
    pub num_children: i32,
    /// The transaction id that last modified the children of the node.
    pub pzxid: i64,
}

/// `CreateMode` determines how a node is created.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node will not be automatically deleted upon the client's
    /// disconnect.
    Persistent = 0,
    /// The node will be deleted when the session that created it expires.
    Ephemeral = 1,
    /// The name of the node will be appended with a monotonically
    /// increasing number. The actual path name of a sequential node is the
    /// given path plus a suffix *i*, where *i* is the current sequential
    /// number of the parent. The sequence number is always a fixed length
    /// of 10 digits, 0 padded.
    PersistentSequential = 2,
    /// The node will be deleted when the session that created it expires,
    /// and its name will be appended with a monotonically increasing
    /// number.
    EphemeralSequential = 3,
    //
    // 21
    // 00
    // ^---- is it sequential?
    //  ^--- is it ephemeral?
}

impl CreateMode {
    /// Does this mode bind the node's lifetime to the creating session?
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Does this mode append a sequence suffix to the node name?
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    pub(crate) fn from_i32(mode: i32) -> Option<CreateMode> {
        match mode {
            0 => Some(CreateMode::Persistent),
            1 => Some(CreateMode::Ephemeral),
            2 => Some(CreateMode::PersistentSequential),
            3 => Some(CreateMode::EphemeralSequential),
            _ => None,
        }
    }
}
