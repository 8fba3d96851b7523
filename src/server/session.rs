//! Server-side session tracking.
//!
//! A session is a logical client identity spanning reconnects. It stays
//! alive as long as the client is heard from within its negotiated
//! timeout; the expiry scan collects the silent ones so their ephemerals
//! can be cleaned up through a committed transaction.

use crate::proto::SaberMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

pub(crate) struct SessionManager {
    inner: Mutex<Inner>,
    min_timeout_ms: u32,
    max_timeout_ms: u32,
}

struct Inner {
    sessions: HashMap<u64, SessionEntry>,
    next_id: u64,
}

struct SessionEntry {
    timeout_ms: u32,
    last_seen: Instant,
    conn: Option<UnboundedSender<SaberMessage>>,
}

impl SessionManager {
    pub(crate) fn new(min_timeout_ms: u32, max_timeout_ms: u32) -> SessionManager {
        SessionManager {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                next_id: 1,
            }),
            min_timeout_ms,
            max_timeout_ms,
        }
    }

    fn clamp(&self, requested_ms: u32) -> u32 {
        requested_ms.clamp(self.min_timeout_ms, self.max_timeout_ms)
    }

    /// Allocate a fresh session. Returns the id and the granted timeout.
    pub(crate) fn create(
        &self,
        requested_ms: u32,
        conn: UnboundedSender<SaberMessage>,
    ) -> (u64, u32) {
        let timeout_ms = self.clamp(requested_ms);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(
            id,
            SessionEntry {
                timeout_ms,
                last_seen: Instant::now(),
                conn: Some(conn),
            },
        );
        (id, timeout_ms)
    }

    /// Re-attach a reconnecting client to its session. `None` means the
    /// session is unknown here, i.e. expired.
    pub(crate) fn attach(
        &self,
        session_id: u64,
        conn: UnboundedSender<SaberMessage>,
    ) -> Option<u32> {
        let mut inner = self.inner.lock();
        let entry = inner.sessions.get_mut(&session_id)?;
        entry.last_seen = Instant::now();
        entry.conn = Some(conn);
        Some(entry.timeout_ms)
    }

    /// Any message from the client counts as liveness.
    pub(crate) fn touch(&self, session_id: u64) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(&session_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// The connection serving this session went away; the session itself
    /// survives until its timeout.
    pub(crate) fn detach(&self, session_id: u64, conn: &UnboundedSender<SaberMessage>) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(&session_id) {
            // a reconnect may already have attached a newer connection
            if entry
                .conn
                .as_ref()
                .map_or(false, |c| c.same_channel(conn))
            {
                entry.conn = None;
            }
        }
    }

    pub(crate) fn remove(&self, session_id: u64) {
        self.inner.lock().sessions.remove(&session_id);
    }

    /// Sessions whose timeout elapsed without any sign of life.
    pub(crate) fn expired(&self) -> Vec<u64> {
        let now = Instant::now();
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|(_, entry)| {
                now.duration_since(entry.last_seen).as_millis() as u64
                    > u64::from(entry.timeout_ms)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, session_id: u64) -> bool {
        self.inner.lock().sessions.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn create_grants_clamped_timeouts() {
        let sm = SessionManager::new(4_000, 40_000);
        let (tx, _rx) = unbounded_channel();
        let (id, granted) = sm.create(1_000, tx.clone());
        assert_eq!(granted, 4_000);
        let (id2, granted) = sm.create(100_000, tx);
        assert_eq!(granted, 40_000);
        assert_ne!(id, id2);
    }

    #[test]
    fn attach_revives_known_sessions_only() {
        let sm = SessionManager::new(1_000, 40_000);
        let (tx, _rx) = unbounded_channel();
        let (id, _) = sm.create(10_000, tx.clone());
        assert_eq!(sm.attach(id, tx.clone()), Some(10_000));
        assert_eq!(sm.attach(id + 1, tx), None);
    }

    #[test]
    fn silent_sessions_expire() {
        let sm = SessionManager::new(0, 40_000);
        let (tx, _rx) = unbounded_channel();
        let (id, _) = sm.create(0, tx);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sm.expired(), vec![id]);
        sm.remove(id);
        assert!(sm.expired().is_empty());
        assert!(!sm.contains(id));
    }

    #[test]
    fn touch_defers_expiry() {
        let sm = SessionManager::new(0, 40_000);
        let (tx, _rx) = unbounded_channel();
        let (id, _) = sm.create(50, tx);
        std::thread::sleep(Duration::from_millis(30));
        sm.touch(id);
        std::thread::sleep(Duration::from_millis(30));
        assert!(sm.expired().is_empty());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(sm.expired(), vec![id]);
    }
}
