/// Represents a change in the namespace (or in the state of the client's
/// connection) that a watcher is able to respond to.
///
/// The `WatchedEvent` includes exactly what happened, the current state of
/// the client's session, and the path of the node that was involved in the
/// event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// The trigger that caused the watch to hit.
    pub event_type: WatchedEventType,
    /// The state of the session at the time the event was generated.
    pub state: SessionState,
    /// The path of the node that was involved. Empty for session-state
    /// triggers.
    pub path: String,
}

impl WatchedEvent {
    pub(crate) fn state_change(state: SessionState) -> WatchedEvent {
        WatchedEvent {
            event_type: WatchedEventType::None,
            state,
            path: String::new(),
        }
    }

    pub(crate) fn node(event_type: WatchedEventType, path: &str) -> WatchedEvent {
        WatchedEvent {
            event_type,
            state: SessionState::Connected,
            path: path.to_string(),
        }
    }
}

/// Enumeration of states the session may be in when a watcher event is
/// delivered.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The client is not currently connected to any server in the ensemble.
    Disconnected = 0,
    /// The client is connected to a server in the ensemble.
    Connected = 1,
    /// Authentication has failed -- the connection requires a new client
    /// instance.
    AuthFailed = 2,
    /// The serving cluster has expired this session. The session is no
    /// longer valid; a new client must be created to continue.
    Expired = 3,
}

impl SessionState {
    pub(crate) fn from_i32(code: i32) -> Option<SessionState> {
        match code {
            0 => Some(SessionState::Disconnected),
            1 => Some(SessionState::Connected),
            2 => Some(SessionState::AuthFailed),
            3 => Some(SessionState::Expired),
            _ => None,
        }
    }
}

/// Enumeration of types of events that may occur on a node.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedEventType {
    /// Nothing known has occurred on the node. This value is issued as
    /// part of a [`WatchedEvent`] when the [`SessionState`] changes.
    None = 0,
    /// Issued when a node at a watched path is created.
    NodeCreated = 1,
    /// Issued when a node at a watched path is deleted.
    NodeDeleted = 2,
    /// Issued when the data of a watched node is altered. This event is
    /// issued whenever a *set* operation occurs without an actual contents
    /// check, so there is no guarantee the data actually changed.
    NodeDataChanged = 3,
    /// Issued when the children of a watched node are created or deleted.
    /// This event is not issued when the data within children is altered.
    NodeChildrenChanged = 4,
}

impl WatchedEventType {
    pub(crate) fn from_i32(code: i32) -> Option<WatchedEventType> {
        match code {
            0 => Some(WatchedEventType::None),
            1 => Some(WatchedEventType::NodeCreated),
            2 => Some(WatchedEventType::NodeDeleted),
            3 => Some(WatchedEventType::NodeDataChanged),
            4 => Some(WatchedEventType::NodeChildrenChanged),
            _ => None,
        }
    }
}
