use crate::{Acl, Stat};
use std::collections::BTreeSet;

/// One node in the namespace: its data, its ACL, its stat, and the set of
/// its child segment names. Children are kept sorted so listing them is
/// stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataNode {
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub stat: Stat,
    pub children: BTreeSet<String>,
}

impl DataNode {
    pub(crate) fn new(data: Vec<u8>, acl: Vec<Acl>, stat: Stat) -> DataNode {
        DataNode {
            data,
            acl,
            stat,
            children: BTreeSet::new(),
        }
    }

    /// Add a child segment. Returns false if it was already present.
    pub(crate) fn add_child(&mut self, child: &str) -> bool {
        self.children.insert(child.to_string())
    }

    /// Remove a child segment. Returns false if it was not present.
    pub(crate) fn remove_child(&mut self, child: &str) -> bool {
        self.children.remove(child)
    }

    pub(crate) fn is_ephemeral(&self) -> bool {
        self.stat.ephemeral_owner != 0
    }
}
