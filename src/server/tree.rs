//! The namespace: a tree of data nodes plus the bookkeeping that keeps
//! ephemeral ownership, the children index, and the watch tables in
//! lockstep with it.
//!
//! Mutations only happen by applying committed transactions, serialized by
//! the single applier loop holding the exclusive lock. Checks and reads
//! run under the shared lock. Watch firing is collected into the apply
//! outcome and dispatched by the caller after the lock is released, so a
//! watch registered after a trigger snapshot never rides along with it.

use super::node::DataNode;
use super::txn::{Transaction, TxnOp};
use super::watch_manager::{ServerWatchManager, WatcherHandle};
use crate::proto::codes::Code;
use crate::proto::request::{read_acl_list, read_buffer, read_string, write_list, WriteTo};
use crate::proto::response::ReadFrom;
use crate::{path, Acl, CreateMode, Id, Permission, Stat, WatchedEventType};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::format_err;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// A watch removed by a trigger, waiting to be delivered once the tree
/// lock is dropped.
#[derive(Debug)]
pub(crate) struct FiredWatch {
    pub handle: WatcherHandle,
    pub event_type: WatchedEventType,
    /// The full (chrooted) path the event happened at.
    pub path: String,
}

impl FiredWatch {
    pub(crate) fn deliver(&self) {
        self.handle.notify(self.event_type, &self.path);
    }
}

/// The per-op body of an apply.
#[derive(Debug)]
pub(crate) enum ApplyResult {
    Create { code: Code, name: String },
    Delete { code: Code },
    SetData { code: Code, stat: Stat },
    SetAcl { code: Code, stat: Stat },
    KillSession,
}

/// What applying one committed transaction produced: the response body and
/// the watches it tripped.
#[derive(Debug)]
pub(crate) struct ApplyOutcome {
    pub result: ApplyResult,
    pub fired: Vec<FiredWatch>,
}

pub(crate) struct DataTree {
    nodes: BTreeMap<String, DataNode>,
    /// Children index, kept in lockstep with the per-node child sets.
    children: BTreeMap<String, BTreeSet<String>>,
    /// session id -> paths of the ephemeral nodes it owns.
    ephemerals: HashMap<u64, HashSet<String>>,
    data_watches: ServerWatchManager,
    child_watches: ServerWatchManager,
    last_zxid: i64,
}

fn valid_acl(acl: &[Acl]) -> bool {
    !acl.is_empty()
        && acl
            .iter()
            .all(|a| a.perms != Permission::NONE && !a.scheme.is_empty())
}

fn acl_grants(acl: &[Acl], perm: Permission, ids: &[Id]) -> bool {
    acl.iter().any(|entry| {
        entry.perms.can(perm)
            && ((entry.scheme == "world" && entry.id == "anyone")
                || ids
                    .iter()
                    .any(|id| id.scheme == entry.scheme && id.id == entry.id))
    })
}

fn fire(
    fired: &mut Vec<FiredWatch>,
    manager: &ServerWatchManager,
    path: &str,
    event_type: WatchedEventType,
) {
    for handle in manager.trigger(path) {
        fired.push(FiredWatch {
            handle,
            event_type,
            path: path.to_string(),
        });
    }
}

impl DataTree {
    pub(crate) fn new() -> DataTree {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            DataNode::new(Vec::new(), Acl::open_unsafe().to_vec(), Stat::default()),
        );
        let mut children = BTreeMap::new();
        children.insert("/".to_string(), BTreeSet::new());
        DataTree {
            nodes,
            children,
            ephemerals: HashMap::new(),
            data_watches: ServerWatchManager::new(),
            child_watches: ServerWatchManager::new(),
            last_zxid: 0,
        }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn last_zxid(&self) -> i64 {
        self.last_zxid
    }

    pub(crate) fn set_last_zxid(&mut self, zxid: i64) {
        self.last_zxid = zxid;
    }

    // ---- checks: no mutation, used for the pre-propose dry run ----

    pub(crate) fn check_create(
        &self,
        path: &str,
        acl: &[Acl],
        mode: CreateMode,
        ids: &[Id],
    ) -> Code {
        if path::validate(path).is_err() {
            return Code::SystemError;
        }
        if path == "/" {
            return Code::NodeExists;
        }
        if !valid_acl(acl) {
            return Code::InvalidAcl;
        }
        let parent = match self.nodes.get(path::parent(path)) {
            Some(parent) => parent,
            None => return Code::NoNode,
        };
        if parent.is_ephemeral() {
            return Code::NoChildrenForEphemerals;
        }
        if !acl_grants(&parent.acl, Permission::CREATE, ids) {
            return Code::NoAuth;
        }
        if mode.is_sequential() {
            // a wrapped child counter would break the fixed-width suffix
            if parent.stat.cversion < 0 {
                return Code::SystemError;
            }
        } else if self.nodes.contains_key(path) {
            return Code::NodeExists;
        }
        Code::Ok
    }

    pub(crate) fn check_delete(&self, path: &str, version: i32, ids: &[Id]) -> Code {
        if path::validate(path).is_err() || path == "/" {
            // the root always exists and is never deletable
            return Code::SystemError;
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Code::NoNode,
        };
        if version != -1 && version != node.stat.version {
            return Code::BadVersion;
        }
        if !node.children.is_empty() {
            return Code::NotEmpty;
        }
        let parent = match self.nodes.get(path::parent(path)) {
            Some(parent) => parent,
            None => return Code::SystemError,
        };
        if !acl_grants(&parent.acl, Permission::DELETE, ids) {
            return Code::NoAuth;
        }
        Code::Ok
    }

    pub(crate) fn check_set_data(&self, path: &str, version: i32, ids: &[Id]) -> Code {
        if path::validate(path).is_err() {
            return Code::SystemError;
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Code::NoNode,
        };
        if !acl_grants(&node.acl, Permission::WRITE, ids) {
            return Code::NoAuth;
        }
        if version != -1 && version != node.stat.version {
            return Code::BadVersion;
        }
        Code::Ok
    }

    pub(crate) fn check_set_acl(&self, path: &str, acl: &[Acl], version: i32, ids: &[Id]) -> Code {
        if path::validate(path).is_err() {
            return Code::SystemError;
        }
        if !valid_acl(acl) {
            return Code::InvalidAcl;
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return Code::NoNode,
        };
        if !acl_grants(&node.acl, Permission::ADMIN, ids) {
            return Code::NoAuth;
        }
        if version != -1 && version != node.stat.aversion {
            return Code::BadVersion;
        }
        Code::Ok
    }

    // ---- applies: driven by committed transactions ----

    pub(crate) fn apply(&mut self, txn: &Transaction) -> ApplyOutcome {
        let mut fired = Vec::new();
        let result = match txn.op {
            TxnOp::Create {
                ref path,
                ref data,
                ref acl,
                mode,
            } => {
                let (code, name) = self.apply_create(txn, path, data, acl, mode, &mut fired);
                ApplyResult::Create { code, name }
            }
            TxnOp::Delete { ref path, version } => ApplyResult::Delete {
                code: self.apply_delete(txn, path, version, &mut fired),
            },
            TxnOp::SetData {
                ref path,
                ref data,
                version,
            } => {
                let (code, stat) = self.apply_set_data(txn, path, data, version, &mut fired);
                ApplyResult::SetData { code, stat }
            }
            TxnOp::SetAcl {
                ref path,
                ref acl,
                version,
            } => {
                let (code, stat) = self.apply_set_acl(path, acl, version);
                ApplyResult::SetAcl { code, stat }
            }
            TxnOp::KillSession => {
                self.apply_kill_session(txn, &mut fired);
                ApplyResult::KillSession
            }
        };
        // committed transactions advance the zxid watermark whether or not
        // the operation itself succeeded
        self.last_zxid = txn.zxid;
        ApplyOutcome { result, fired }
    }

    fn apply_create(
        &mut self,
        txn: &Transaction,
        path: &str,
        data: &[u8],
        acl: &[Acl],
        mode: CreateMode,
        fired: &mut Vec<FiredWatch>,
    ) -> (Code, String) {
        let ids = [Id::anyone()];
        let code = self.check_create(path, acl, mode, &ids);
        if code != Code::Ok {
            return (code, String::new());
        }
        let parent_path = path::parent(path).to_string();
        let cversion = match self.nodes.get(&parent_path) {
            Some(parent) => parent.stat.cversion,
            None => return (Code::NoNode, String::new()),
        };
        let name = if mode.is_sequential() {
            format!("{}{:010}", path, cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&name) {
            return (Code::NodeExists, String::new());
        }

        let stat = Stat {
            czxid: txn.zxid,
            mzxid: txn.zxid,
            ctime: txn.time_ms,
            mtime: txn.time_ms,
            version: 0,
            cversion: 0,
            aversion: 0,
            ephemeral_owner: if mode.is_ephemeral() {
                txn.session_id
            } else {
                0
            },
            data_length: data.len() as i32,
            num_children: 0,
            pzxid: txn.zxid,
        };
        self.nodes
            .insert(name.clone(), DataNode::new(data.to_vec(), acl.to_vec(), stat));
        self.children.insert(name.clone(), BTreeSet::new());

        let segment = path::segment(&name).to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.pzxid = txn.zxid;
            parent.stat.num_children += 1;
            parent.add_child(&segment);
        }
        self.children
            .entry(parent_path.clone())
            .or_default()
            .insert(segment);

        if mode.is_ephemeral() {
            self.ephemerals
                .entry(txn.session_id)
                .or_default()
                .insert(name.clone());
        }

        fire(fired, &self.data_watches, &name, WatchedEventType::NodeCreated);
        fire(
            fired,
            &self.child_watches,
            &parent_path,
            WatchedEventType::NodeChildrenChanged,
        );
        (Code::Ok, name)
    }

    fn apply_delete(
        &mut self,
        txn: &Transaction,
        path: &str,
        version: i32,
        fired: &mut Vec<FiredWatch>,
    ) -> Code {
        let ids = [Id::anyone()];
        let code = self.check_delete(path, version, &ids);
        if code != Code::Ok {
            return code;
        }
        self.delete_node(path, txn, fired);
        Code::Ok
    }

    /// The unconditional part of a delete, shared with session cleanup.
    fn delete_node(&mut self, path: &str, txn: &Transaction, fired: &mut Vec<FiredWatch>) {
        let node = match self.nodes.remove(path) {
            Some(node) => node,
            None => return,
        };
        self.children.remove(path);

        let parent_path = path::parent(path).to_string();
        let segment = path::segment(path).to_string();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent.stat.cversion += 1;
            parent.stat.pzxid = txn.zxid;
            parent.stat.num_children -= 1;
            parent.remove_child(&segment);
        }
        if let Some(siblings) = self.children.get_mut(&parent_path) {
            siblings.remove(&segment);
        }

        if node.stat.ephemeral_owner != 0 {
            if let Some(owned) = self.ephemerals.get_mut(&node.stat.ephemeral_owner) {
                owned.remove(path);
                if owned.is_empty() {
                    self.ephemerals.remove(&node.stat.ephemeral_owner);
                }
            }
        }

        fire(fired, &self.data_watches, path, WatchedEventType::NodeDeleted);
        fire(fired, &self.child_watches, path, WatchedEventType::NodeDeleted);
        fire(
            fired,
            &self.child_watches,
            &parent_path,
            WatchedEventType::NodeChildrenChanged,
        );
    }

    fn apply_set_data(
        &mut self,
        txn: &Transaction,
        path: &str,
        data: &[u8],
        version: i32,
        fired: &mut Vec<FiredWatch>,
    ) -> (Code, Stat) {
        let ids = [Id::anyone()];
        let code = self.check_set_data(path, version, &ids);
        if code != Code::Ok {
            return (code, Stat::default());
        }
        let stat = match self.nodes.get_mut(path) {
            Some(node) => {
                node.data = data.to_vec();
                node.stat.version += 1;
                node.stat.mzxid = txn.zxid;
                node.stat.mtime = txn.time_ms;
                node.stat.data_length = data.len() as i32;
                node.stat
            }
            None => return (Code::NoNode, Stat::default()),
        };
        fire(
            fired,
            &self.data_watches,
            path,
            WatchedEventType::NodeDataChanged,
        );
        (Code::Ok, stat)
    }

    fn apply_set_acl(&mut self, path: &str, acl: &[Acl], version: i32) -> (Code, Stat) {
        let ids = [Id::anyone()];
        let code = self.check_set_acl(path, acl, version, &ids);
        if code != Code::Ok {
            return (code, Stat::default());
        }
        match self.nodes.get_mut(path) {
            Some(node) => {
                node.acl = acl.to_vec();
                node.stat.aversion += 1;
                (Code::Ok, node.stat)
            }
            None => (Code::NoNode, Stat::default()),
        }
    }

    /// Delete every ephemeral the session owns (firing watches like any
    /// other delete), then drop the watches the session itself held.
    fn apply_kill_session(&mut self, txn: &Transaction, fired: &mut Vec<FiredWatch>) {
        if let Some(owned) = self.ephemerals.remove(&txn.session_id) {
            let mut paths: Vec<String> = owned.into_iter().collect();
            paths.sort();
            for path in paths {
                self.delete_node(&path, txn, fired);
            }
        }
        self.data_watches.remove_owner(txn.session_id);
        self.child_watches.remove_owner(txn.session_id);
    }

    // ---- reads: shared lock, registration through the interior mutex ----

    pub(crate) fn exists(&self, path: &str, watcher: Option<WatcherHandle>) -> (Code, Stat) {
        if path::validate(path).is_err() {
            return (Code::SystemError, Stat::default());
        }
        // an exist-watch is registered whether or not the node is there;
        // creation of a missing node must still trigger it
        if let Some(handle) = watcher {
            self.data_watches.add_watch(path, handle);
        }
        match self.nodes.get(path) {
            Some(node) => (Code::Ok, node.stat),
            None => (Code::NoNode, Stat::default()),
        }
    }

    pub(crate) fn get_data(
        &self,
        path: &str,
        ids: &[Id],
        watcher: Option<WatcherHandle>,
    ) -> (Code, Vec<u8>, Stat) {
        if path::validate(path).is_err() {
            return (Code::SystemError, Vec::new(), Stat::default());
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return (Code::NoNode, Vec::new(), Stat::default()),
        };
        if !acl_grants(&node.acl, Permission::READ, ids) {
            return (Code::NoAuth, Vec::new(), Stat::default());
        }
        if let Some(handle) = watcher {
            self.data_watches.add_watch(path, handle);
        }
        (Code::Ok, node.data.clone(), node.stat)
    }

    pub(crate) fn get_children(
        &self,
        path: &str,
        ids: &[Id],
        watcher: Option<WatcherHandle>,
    ) -> (Code, Vec<String>) {
        if path::validate(path).is_err() {
            return (Code::SystemError, Vec::new());
        }
        let node = match self.nodes.get(path) {
            Some(node) => node,
            None => return (Code::NoNode, Vec::new()),
        };
        if !acl_grants(&node.acl, Permission::READ, ids) {
            return (Code::NoAuth, Vec::new());
        }
        if let Some(handle) = watcher {
            self.child_watches.add_watch(path, handle);
        }
        let children = self
            .children
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        (Code::Ok, children)
    }

    pub(crate) fn get_acl(&self, path: &str) -> (Code, Vec<Acl>, Stat) {
        if path::validate(path).is_err() {
            return (Code::SystemError, Vec::new(), Stat::default());
        }
        match self.nodes.get(path) {
            Some(node) => (Code::Ok, node.acl.clone(), node.stat),
            None => (Code::NoNode, Vec::new(), Stat::default()),
        }
    }

    /// Register watches in bulk for a reconnected session. Exist watches
    /// share the data table; the client keeps the kinds apart.
    pub(crate) fn set_watches(
        &self,
        data: &[String],
        exist: &[String],
        child: &[String],
        handle: &WatcherHandle,
    ) {
        for path in data.iter().chain(exist) {
            self.data_watches.add_watch(path, handle.clone());
        }
        for path in child {
            self.child_watches.add_watch(path, handle.clone());
        }
    }

    // ---- snapshot tables ----

    /// Append the node table and the children index to `buf`, in a
    /// deterministic order, such that [`DataTree::recover`] restores an
    /// identical tree and re-serialization is byte-identical.
    pub(crate) fn serialize_to_string(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.nodes.len() as u32)
            .expect("Vec::write should never fail");
        for (path, node) in &self.nodes {
            path.as_str()
                .write_to(&mut *buf)
                .expect("Vec::write should never fail");
            node.data
                .as_slice()
                .write_to(&mut *buf)
                .expect("Vec::write should never fail");
            write_list(&mut *buf, &node.acl).expect("Vec::write should never fail");
            node.stat
                .write_to(&mut *buf)
                .expect("Vec::write should never fail");
        }
        buf.write_u32::<BigEndian>(self.children.len() as u32)
            .expect("Vec::write should never fail");
        for (path, children) in &self.children {
            path.as_str()
                .write_to(&mut *buf)
                .expect("Vec::write should never fail");
            buf.write_u32::<BigEndian>(children.len() as u32)
                .expect("Vec::write should never fail");
            for child in children {
                child
                    .as_str()
                    .write_to(&mut *buf)
                    .expect("Vec::write should never fail");
            }
        }
    }

    /// Restore the tables serialized at `buf[offset..]`, replacing the
    /// current contents, and return the offset one past what was consumed.
    /// The ephemeral index is rebuilt by scanning the recovered nodes.
    pub(crate) fn recover(&mut self, buf: &[u8], offset: usize) -> Result<usize, failure::Error> {
        let mut reader = &buf[offset..];

        let mut nodes = BTreeMap::new();
        let node_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..node_count {
            let path = read_string(&mut reader)?;
            let data = read_buffer(&mut reader)?;
            let acl = read_acl_list(&mut reader)?;
            let stat = Stat::read_from(&mut reader)?;
            nodes.insert(path, DataNode::new(data, acl, stat));
        }

        let mut children = BTreeMap::new();
        let index_count = reader.read_u32::<BigEndian>()?;
        for _ in 0..index_count {
            let path = read_string(&mut reader)?;
            let child_count = reader.read_u32::<BigEndian>()?;
            let mut set = BTreeSet::new();
            for _ in 0..child_count {
                set.insert(read_string(&mut reader)?);
            }
            children.insert(path, set);
        }

        if !nodes.contains_key("/") {
            return Err(format_err!("recovered tree has no root"));
        }

        let mut ephemerals: HashMap<u64, HashSet<String>> = HashMap::new();
        for (path, node) in &mut nodes {
            if let Some(set) = children.get(path) {
                node.children = set.clone();
            }
            if node.stat.ephemeral_owner != 0 {
                ephemerals
                    .entry(node.stat.ephemeral_owner)
                    .or_default()
                    .insert(path.clone());
            }
        }

        self.nodes = nodes;
        self.children = children;
        self.ephemerals = ephemerals;
        Ok(buf.len() - reader.len())
    }

    #[cfg(test)]
    pub(crate) fn structurally_equal(&self, other: &DataTree) -> bool {
        self.nodes == other.nodes
            && self.children == other.children
            && self.ephemerals == other.ephemerals
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        // parent linkage and children index agree with the node table
        for path in self.nodes.keys() {
            if path == "/" {
                continue;
            }
            let parent = path::parent(path);
            assert!(self.nodes.contains_key(parent), "orphan node {}", path);
            assert!(
                self.children[parent].contains(path::segment(path)),
                "{} missing from children index of {}",
                path,
                parent
            );
        }
        for (path, children) in &self.children {
            let node = &self.nodes[path];
            assert_eq!(
                node.stat.num_children as usize,
                children.len(),
                "num_children mismatch at {}",
                path
            );
            assert_eq!(&node.children, children, "child set mismatch at {}", path);
            for child in children {
                let child_path = if path == "/" {
                    format!("/{}", child)
                } else {
                    format!("{}/{}", path, child)
                };
                assert!(
                    self.nodes.contains_key(&child_path),
                    "dangling child {}",
                    child_path
                );
            }
        }
        // ephemeral index agrees with ownership marks
        let marked: usize = self
            .nodes
            .values()
            .filter(|n| n.stat.ephemeral_owner != 0)
            .count();
        let indexed: usize = self.ephemerals.values().map(HashSet::len).sum();
        assert_eq!(marked, indexed);
        for (session, owned) in &self.ephemerals {
            for path in owned {
                assert_eq!(self.nodes[path].stat.ephemeral_owner, *session);
            }
        }
    }
}
