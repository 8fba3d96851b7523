//! Committed transactions and the consensus seam.
//!
//! The replicated-log layer below this crate is abstracted to a single
//! primitive: propose a [`Transaction`]; once it commits with an assigned
//! zxid, it is delivered to the applier loop. [`LocalProposer`] is the
//! single-replica implementation: commit is immediate and the zxid counter
//! is the commit order.
//!
//! Reads travel on the same delivery stream as commits
//! ([`Committed::Read`]). Interleaving them behind the writes their
//! session already submitted is what gives every session responses in
//! submission order, and therefore visibility of its own writes.

use crate::proto::message::MessageType;
use crate::proto::SaberMessage;
use crate::{Acl, CreateMode};
use async_trait::async_trait;
use failure::format_err;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// A serialized mutation produced by the consensus layer and applied
/// idempotently to every replica's tree.
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub session_id: u64,
    /// Assigned on commit; zero while the proposal is in flight.
    pub zxid: i64,
    /// Wall-clock milliseconds stamped when the proposal was accepted.
    pub time_ms: i64,
    pub op: TxnOp,
}

#[derive(Debug, Clone)]
pub(crate) enum TxnOp {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    SetAcl {
        path: String,
        acl: Vec<Acl>,
        version: i32,
    },
    KillSession,
}

/// Where the leader routes the response once the transaction is applied.
/// Followers apply with no reply route.
#[derive(Debug)]
pub(crate) struct ReplyTo {
    pub conn: UnboundedSender<SaberMessage>,
    /// The connection's chroot, stripped from echoed paths.
    pub root: String,
    /// The path exactly as the client sent it.
    pub path: String,
}

/// A read operation serialized into the committed stream behind the
/// writes its connection already submitted.
#[derive(Debug)]
pub(crate) struct ReadTask {
    pub type_: MessageType,
    /// The path exactly as the client sent it.
    pub client_path: String,
    /// The chrooted path to evaluate against the tree.
    pub full_path: String,
    pub watch: bool,
    pub session_id: u64,
    pub root: String,
    pub conn: UnboundedSender<SaberMessage>,
}

/// One item on the applier loop's input stream.
#[derive(Debug)]
pub(crate) enum Committed {
    Txn {
        txn: Transaction,
        reply: Option<ReplyTo>,
    },
    Read(ReadTask),
    /// A prebuilt response (e.g. a dry-run rejection) that only needs to
    /// keep its place in the per-session response order.
    Reply {
        conn: UnboundedSender<SaberMessage>,
        msg: SaberMessage,
    },
}

/// The consensus layer's face: accept a transaction, and deliver it to the
/// applier once it commits, zxid assigned.
#[async_trait]
pub(crate) trait Proposer: Send + Sync {
    async fn propose(
        &self,
        txn: Transaction,
        reply: Option<ReplyTo>,
    ) -> Result<(), failure::Error>;
}

/// Single-replica consensus: every proposal commits immediately. The zxid
/// counter and the send to the applier happen under one lock so commit
/// order and zxid order cannot diverge.
pub(crate) struct LocalProposer {
    inner: Mutex<LocalProposerInner>,
}

struct LocalProposerInner {
    next_zxid: i64,
    commits: UnboundedSender<Committed>,
}

impl LocalProposer {
    /// Start at the beginning of a zxid sequence, or continue one
    /// recovered from a snapshot.
    pub(crate) fn with_last_zxid(
        commits: UnboundedSender<Committed>,
        last_zxid: i64,
    ) -> LocalProposer {
        LocalProposer {
            inner: Mutex::new(LocalProposerInner {
                next_zxid: last_zxid + 1,
                commits,
            }),
        }
    }
}

#[async_trait]
impl Proposer for LocalProposer {
    async fn propose(
        &self,
        mut txn: Transaction,
        reply: Option<ReplyTo>,
    ) -> Result<(), failure::Error> {
        let mut inner = self.inner.lock();
        txn.zxid = inner.next_zxid;
        inner.next_zxid += 1;
        inner
            .commits
            .send(Committed::Txn { txn, reply })
            .map_err(|_| format_err!("applier loop has shut down"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn commits_carry_increasing_zxids() {
        let (tx, mut rx) = unbounded_channel();
        let proposer = LocalProposer::with_last_zxid(tx, 0);
        for _ in 0..3 {
            proposer
                .propose(
                    Transaction {
                        session_id: 1,
                        zxid: 0,
                        time_ms: 0,
                        op: TxnOp::KillSession,
                    },
                    None,
                )
                .await
                .unwrap();
        }
        let zxids: Vec<i64> = (0..3)
            .map(|_| match rx.try_recv().unwrap() {
                Committed::Txn { txn, .. } => txn.zxid,
                other => panic!("unexpected item on the commit stream: {:?}", other),
            })
            .collect();
        assert_eq!(zxids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn recovered_proposer_resumes_the_sequence() {
        let (tx, mut rx) = unbounded_channel();
        let proposer = LocalProposer::with_last_zxid(tx, 41);
        proposer
            .propose(
                Transaction {
                    session_id: 1,
                    zxid: 0,
                    time_ms: 0,
                    op: TxnOp::KillSession,
                },
                None,
            )
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            Committed::Txn { txn, .. } => assert_eq!(txn.zxid, 42),
            other => panic!("unexpected item on the commit stream: {:?}", other),
        }
    }
}
