//! Snapshot framing around the tree tables.
//!
//! Layout: `[u32 magic][u32 version][u64 last_zxid]` followed by the node
//! table and the children index as emitted by
//! `DataTree::serialize_to_string`. The byte stream is deterministic, so a
//! snapshot can be checksummed and compared across replicas.

use super::tree::DataTree;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::{ensure, format_err};

const MAGIC: u32 = 0x5ABE_C001;
const VERSION: u32 = 1;

/// Serialize `tree` into a standalone snapshot.
pub(crate) fn write_snapshot(tree: &DataTree) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(MAGIC)
        .expect("Vec::write should never fail");
    buf.write_u32::<BigEndian>(VERSION)
        .expect("Vec::write should never fail");
    buf.write_u64::<BigEndian>(tree.last_zxid() as u64)
        .expect("Vec::write should never fail");
    tree.serialize_to_string(&mut buf);
    buf
}

/// Rebuild a tree from a snapshot produced by [`write_snapshot`].
pub(crate) fn read_snapshot(bytes: &[u8]) -> Result<DataTree, failure::Error> {
    let mut header = bytes;
    let magic = header.read_u32::<BigEndian>()?;
    ensure!(magic == MAGIC, "bad snapshot magic {:#010x}", magic);
    let version = header.read_u32::<BigEndian>()?;
    ensure!(version == VERSION, "unsupported snapshot version {}", version);
    let last_zxid = header.read_u64::<BigEndian>()? as i64;

    let mut tree = DataTree::new();
    let consumed = tree.recover(bytes, 16)?;
    if consumed != bytes.len() {
        return Err(format_err!(
            "{} trailing bytes after snapshot tables",
            bytes.len() - consumed
        ));
    }
    tree.set_last_zxid(last_zxid);
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::txn::{Transaction, TxnOp};
    use crate::{Acl, CreateMode};

    fn populated_tree() -> DataTree {
        let mut tree = DataTree::new();
        for (zxid, path) in [(1, "/a"), (2, "/a/b"), (3, "/c")] {
            tree.apply(&Transaction {
                session_id: 1,
                zxid,
                time_ms: zxid,
                op: TxnOp::Create {
                    path: path.to_string(),
                    data: vec![zxid as u8],
                    acl: Acl::open_unsafe().to_vec(),
                    mode: CreateMode::Persistent,
                },
            });
        }
        tree
    }

    #[test]
    fn snapshot_round_trips() {
        let tree = populated_tree();
        let bytes = write_snapshot(&tree);
        let recovered = read_snapshot(&bytes).unwrap();
        assert!(recovered.structurally_equal(&tree));
        assert_eq!(recovered.last_zxid(), 3);
        assert_eq!(write_snapshot(&recovered), bytes);
    }

    #[test]
    fn snapshot_rejects_bad_magic() {
        let tree = populated_tree();
        let mut bytes = write_snapshot(&tree);
        bytes[0] ^= 0xff;
        assert!(read_snapshot(&bytes).is_err());
    }

    #[test]
    fn snapshot_rejects_trailing_garbage() {
        let tree = populated_tree();
        let mut bytes = write_snapshot(&tree);
        bytes.push(0);
        assert!(read_snapshot(&bytes).is_err());
    }
}
