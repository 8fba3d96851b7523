//! Server-side watch tables.
//!
//! A watch is a one-shot, edge-triggered registration: triggering a path
//! removes every watch registered on it and hands them back to the caller
//! for delivery, in insertion order. Watches are owned by sessions; when a
//! session dies its watches are dropped without firing.
//!
//! The table sits behind its own mutex so read operations, which run under
//! the tree's shared lock, can still register watches. Triggering only
//! happens while the tree's exclusive lock is held, so a registration can
//! never interleave with the snapshot taken by a trigger.

use crate::proto::SaberMessage;
use crate::{path, WatchedEvent, WatchedEventType};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// A registered watcher: enough to route one notification to the owning
/// session's connection. Holding the sender (not the connection) keeps
/// ownership acyclic; a dead connection just means the send is dropped.
#[derive(Debug, Clone)]
pub(crate) struct WatcherHandle {
    pub session_id: u64,
    /// The owning connection's chroot, stripped from notified paths.
    pub root: String,
    conn: UnboundedSender<SaberMessage>,
}

impl WatcherHandle {
    pub(crate) fn new(
        session_id: u64,
        root: String,
        conn: UnboundedSender<SaberMessage>,
    ) -> WatcherHandle {
        WatcherHandle {
            session_id,
            root,
            conn,
        }
    }

    /// Deliver one notification, translating the path into the watcher's
    /// namespace. Delivery to a closed connection is silently dropped; the
    /// watch was consumed either way.
    pub(crate) fn notify(&self, event_type: WatchedEventType, full_path: &str) {
        let event = WatchedEvent::node(event_type, &path::strip(&self.root, full_path));
        let _ = self.conn.send(event.into_notification());
    }
}

#[derive(Debug, Default)]
pub(crate) struct ServerWatchManager {
    watches: Mutex<HashMap<String, Vec<WatcherHandle>>>,
}

impl ServerWatchManager {
    pub(crate) fn new() -> ServerWatchManager {
        ServerWatchManager::default()
    }

    /// Register `handle` on `path`. A session re-registering on the same
    /// path (e.g. after a reconnect) replaces its previous handle instead
    /// of stacking a duplicate.
    pub(crate) fn add_watch(&self, path: &str, handle: WatcherHandle) {
        let mut watches = self.watches.lock();
        let entry = watches.entry(path.to_string()).or_default();
        if let Some(existing) = entry
            .iter_mut()
            .find(|w| w.session_id == handle.session_id)
        {
            *existing = handle;
        } else {
            entry.push(handle);
        }
    }

    /// Remove and return every watch on `path`, in insertion order. The
    /// caller owns delivery.
    pub(crate) fn trigger(&self, path: &str) -> Vec<WatcherHandle> {
        self.watches.lock().remove(path).unwrap_or_default()
    }

    /// Drop all watches owned by `session_id` without firing them.
    pub(crate) fn remove_owner(&self, session_id: u64) {
        let mut watches = self.watches.lock();
        watches.retain(|_, handles| {
            handles.retain(|w| w.session_id != session_id);
            !handles.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) fn watch_count(&self, path: &str) -> usize {
        self.watches.lock().get(path).map_or(0, Vec::len)
    }
}
