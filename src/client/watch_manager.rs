//! Client-side watch bookkeeping.
//!
//! Watches are one-shot and edge-triggered: once an event fires them they
//! are removed and must be re-registered through a new read. The manager
//! splits registrations by kind -- data, exist, and child -- because the
//! kinds react to different event types.

use crate::{WatchedEvent, WatchedEventType};
use futures::channel::oneshot;
use std::collections::HashMap;

/// One registered watch. `Global` registrations deliver through the
/// default watcher stream (which receives every notification anyway), so
/// only their liveness is tracked; `Custom` registrations own the sender
/// their event goes to.
#[derive(Debug)]
pub(crate) enum ClientWatch {
    Global,
    Custom(oneshot::Sender<WatchedEvent>),
}

impl ClientWatch {
    fn is_live(&self) -> bool {
        match self {
            ClientWatch::Global => true,
            ClientWatch::Custom(tx) => !tx.is_canceled(),
        }
    }
}

/// The kind of state a watch is observing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum WatchKind {
    /// Watching for changes to data.
    Data,
    /// Watching for the creation of a node at the given path.
    Exist,
    /// Watching for changes to children.
    Child,
}

#[derive(Debug, Default)]
pub(crate) struct ClientWatchManager {
    data: HashMap<String, Vec<ClientWatch>>,
    exist: HashMap<String, Vec<ClientWatch>>,
    child: HashMap<String, Vec<ClientWatch>>,
}

impl ClientWatchManager {
    pub(crate) fn new() -> ClientWatchManager {
        ClientWatchManager::default()
    }

    pub(crate) fn add(&mut self, kind: WatchKind, path: &str, watch: ClientWatch) {
        let map = match kind {
            WatchKind::Data => &mut self.data,
            WatchKind::Exist => &mut self.exist,
            WatchKind::Child => &mut self.child,
        };
        map.entry(path.to_string()).or_default().push(watch);
    }

    /// Remove and return the custom senders that `event` fires, per the
    /// kind/type matrix. Emptied map entries are dropped so reset lists
    /// stay small.
    pub(crate) fn trigger(&mut self, event: &WatchedEvent) -> Vec<oneshot::Sender<WatchedEvent>> {
        let mut fired = Vec::new();
        let path = &event.path;
        match event.event_type {
            WatchedEventType::NodeCreated | WatchedEventType::NodeDataChanged => {
                drain_into(&mut self.data, path, &mut fired);
                drain_into(&mut self.exist, path, &mut fired);
            }
            WatchedEventType::NodeDeleted => {
                drain_into(&mut self.data, path, &mut fired);
                drain_into(&mut self.exist, path, &mut fired);
                drain_into(&mut self.child, path, &mut fired);
            }
            WatchedEventType::NodeChildrenChanged => {
                drain_into(&mut self.child, path, &mut fired);
            }
            WatchedEventType::None => {}
        }
        fired
    }

    /// Paths with at least one live watch per kind, for a SET_WATCHES
    /// request after reconnecting.
    pub(crate) fn paths_for_reset(&mut self) -> (Vec<String>, Vec<String>, Vec<String>) {
        (
            live_paths(&mut self.data),
            live_paths(&mut self.exist),
            live_paths(&mut self.child),
        )
    }

    /// Remove every registration, returning the custom senders so the
    /// caller can deliver a final session-state event to each.
    pub(crate) fn drain_all(&mut self) -> Vec<oneshot::Sender<WatchedEvent>> {
        let mut out = Vec::new();
        for map in [&mut self.data, &mut self.exist, &mut self.child] {
            for (_, watches) in map.drain() {
                for watch in watches {
                    if let ClientWatch::Custom(tx) = watch {
                        out.push(tx);
                    }
                }
            }
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }
}

fn drain_into(
    map: &mut HashMap<String, Vec<ClientWatch>>,
    path: &str,
    fired: &mut Vec<oneshot::Sender<WatchedEvent>>,
) {
    if let Some(watches) = map.remove(path) {
        for watch in watches {
            if let ClientWatch::Custom(tx) = watch {
                fired.push(tx);
            }
        }
    }
}

fn live_paths(map: &mut HashMap<String, Vec<ClientWatch>>) -> Vec<String> {
    map.retain(|_, watches| {
        watches.retain(ClientWatch::is_live);
        !watches.is_empty()
    });
    let mut paths: Vec<String> = map.keys().cloned().collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionState;

    fn custom() -> (ClientWatch, oneshot::Receiver<WatchedEvent>) {
        let (tx, rx) = oneshot::channel();
        (ClientWatch::Custom(tx), rx)
    }

    fn deliver(fired: Vec<oneshot::Sender<WatchedEvent>>, event: &WatchedEvent) {
        for tx in fired {
            let _ = tx.send(event.clone());
        }
    }

    #[test]
    fn created_fires_data_and_exist_but_not_child() {
        let mut wm = ClientWatchManager::new();
        let (w1, mut rx1) = custom();
        let (w2, mut rx2) = custom();
        let (w3, mut rx3) = custom();
        wm.add(WatchKind::Data, "/a", w1);
        wm.add(WatchKind::Exist, "/a", w2);
        wm.add(WatchKind::Child, "/a", w3);

        let event = WatchedEvent::node(WatchedEventType::NodeCreated, "/a");
        let fired = wm.trigger(&event);
        assert_eq!(fired.len(), 2);
        deliver(fired, &event);
        assert!(rx1.try_recv().unwrap().is_some());
        assert!(rx2.try_recv().unwrap().is_some());
        assert!(rx3.try_recv().unwrap().is_none());
    }

    #[test]
    fn deleted_fires_all_three_kinds() {
        let mut wm = ClientWatchManager::new();
        for kind in [WatchKind::Data, WatchKind::Exist, WatchKind::Child] {
            let (w, _rx) = oneshot::channel();
            wm.add(kind, "/a", ClientWatch::Custom(w));
        }
        let event = WatchedEvent::node(WatchedEventType::NodeDeleted, "/a");
        assert_eq!(wm.trigger(&event).len(), 3);
        assert!(wm.is_empty());
    }

    #[test]
    fn watches_are_one_shot() {
        let mut wm = ClientWatchManager::new();
        let (w, _rx) = custom();
        wm.add(WatchKind::Data, "/k", w);
        let event = WatchedEvent::node(WatchedEventType::NodeDataChanged, "/k");
        assert_eq!(wm.trigger(&event).len(), 1);
        // second change: nothing left to fire
        assert_eq!(wm.trigger(&event).len(), 0);
    }

    #[test]
    fn trigger_is_per_path() {
        let mut wm = ClientWatchManager::new();
        let (w, _rx) = custom();
        wm.add(WatchKind::Data, "/a", w);
        let event = WatchedEvent::node(WatchedEventType::NodeDataChanged, "/b");
        assert!(wm.trigger(&event).is_empty());
        assert!(!wm.is_empty());
    }

    #[test]
    fn reset_lists_skip_canceled_watchers() {
        let mut wm = ClientWatchManager::new();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        wm.add(WatchKind::Data, "/dead", ClientWatch::Custom(tx));
        let (w, _rx) = custom();
        wm.add(WatchKind::Data, "/live", w);
        wm.add(WatchKind::Child, "/c", ClientWatch::Global);

        let (data, exist, child) = wm.paths_for_reset();
        assert_eq!(data, vec!["/live"]);
        assert!(exist.is_empty());
        assert_eq!(child, vec!["/c"]);
    }

    #[test]
    fn drain_hands_back_custom_senders() {
        let mut wm = ClientWatchManager::new();
        let (w, mut rx) = custom();
        wm.add(WatchKind::Exist, "/a", w);
        wm.add(WatchKind::Data, "/b", ClientWatch::Global);

        let drained = wm.drain_all();
        assert_eq!(drained.len(), 1);
        deliver(drained, &WatchedEvent::state_change(SessionState::Disconnected));
        assert_eq!(
            rx.try_recv().unwrap().unwrap().state,
            SessionState::Disconnected
        );
        assert!(wm.is_empty());
    }
}
