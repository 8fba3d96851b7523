use crate::WatchedEvent;
use futures::channel::oneshot;

/// What kind of watch registration, if any, a read request asked for.
#[derive(Debug)]
pub(crate) enum Watch {
    None,
    Global,
    Custom(oneshot::Sender<WatchedEvent>),
}

impl Watch {
    /// The wire flag: does the server need to register a watch at all?
    pub(crate) fn requested(&self) -> bool {
        !matches!(*self, Watch::None)
    }
}
