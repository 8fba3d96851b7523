//! The server: connection handling, the request pipeline, and the applier
//! loop that owns all writes to the tree.
//!
//! Per connection, one task reads frames and one task drains an outbound
//! channel; everything written to a connection goes through that channel,
//! so notifications and responses keep their relative order. Reads are
//! serialized onto the committed stream behind the writes their session
//! already submitted; writes are dry-run checked under the shared lock,
//! proposed, and answered by the applier once they commit.

pub(crate) mod node;
pub(crate) mod session;
pub(crate) mod snapshot;
pub(crate) mod tree;
pub(crate) mod txn;
pub(crate) mod watch_manager;

use self::session::SessionManager;
use self::tree::{ApplyResult, DataTree};
use self::txn::{Committed, LocalProposer, Proposer, ReadTask, ReplyTo, Transaction, TxnOp};
use self::watch_manager::WatcherHandle;
use crate::proto::codes::Code;
use crate::proto::message::{self, MessageType, SaberMessage};
use crate::proto::request::{
    ConnectRequest, CreateRequest, DeleteRequest, GetAclRequest, ReadRequest, SetAclRequest,
    SetDataRequest, SetWatchesRequest,
};
use crate::proto::response::{
    create_response, delete_response, get_acl_response, get_children_response, get_data_response,
    stat_response, ConnectResponse, MasterHint,
};
use crate::{path, Id};
use failure::format_err;
use parking_lot::RwLock;
use slog::{debug, info, o, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Tunables for a server replica.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Lower clamp on granted session timeouts.
    pub min_session_timeout_ms: u32,
    /// Upper clamp on granted session timeouts.
    pub max_session_timeout_ms: u32,
    /// Cadence of the session-expiry scan.
    pub tick_ms: u64,
    /// When set, this replica is not the master: operation requests are
    /// answered with a redirect to this address.
    pub master: Option<SocketAddr>,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            min_session_timeout_ms: 4_000,
            max_session_timeout_ms: 40_000,
            tick_ms: 500,
            master: None,
        }
    }
}

struct ServerCore {
    tree: RwLock<DataTree>,
    sessions: SessionManager,
    proposer: LocalProposer,
    /// Direct access to the committed stream, for serializing reads.
    applier: UnboundedSender<Committed>,
    options: ServerOptions,
    logger: slog::Logger,
}

/// A coordination-service replica serving the framed protocol over TCP.
pub struct SaberServer {
    listener: TcpListener,
    core: Arc<ServerCore>,
}

impl std::fmt::Debug for SaberServer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SaberServer")
            .field("addr", &self.listener.local_addr().ok())
            .field("master", &self.core.options.master)
            .finish()
    }
}

impl SaberServer {
    /// Bind `addr` and start the applier loop and expiry ticker. Call
    /// [`SaberServer::run`] to begin accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        options: ServerOptions,
        logger: slog::Logger,
    ) -> Result<SaberServer, failure::Error> {
        SaberServer::bind_inner(addr, options, DataTree::new(), 0, logger).await
    }

    /// Like [`SaberServer::bind`], but starting from a snapshot, resuming
    /// its zxid sequence.
    pub async fn bind_recovered(
        addr: SocketAddr,
        options: ServerOptions,
        snapshot_bytes: &[u8],
        logger: slog::Logger,
    ) -> Result<SaberServer, failure::Error> {
        let tree = snapshot::read_snapshot(snapshot_bytes)?;
        let last_zxid = tree.last_zxid();
        SaberServer::bind_inner(addr, options, tree, last_zxid, logger).await
    }

    async fn bind_inner(
        addr: SocketAddr,
        options: ServerOptions,
        tree: DataTree,
        last_zxid: i64,
        logger: slog::Logger,
    ) -> Result<SaberServer, failure::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (applier_tx, applier_rx) = unbounded_channel();
        let core = Arc::new(ServerCore {
            tree: RwLock::new(tree),
            sessions: SessionManager::new(
                options.min_session_timeout_ms,
                options.max_session_timeout_ms,
            ),
            proposer: LocalProposer::with_last_zxid(applier_tx.clone(), last_zxid),
            applier: applier_tx,
            options,
            logger,
        });
        info!(core.logger, "server listening"; "addr" => %local_addr);

        tokio::spawn(run_applier(Arc::clone(&core), applier_rx));
        tokio::spawn(run_expiry_ticker(Arc::clone(&core)));

        Ok(SaberServer { listener, core })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, failure::Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serialize the current tree into a standalone snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        snapshot::write_snapshot(&self.core.tree.read())
    }

    /// Accept and serve connections until the future is dropped.
    pub async fn run(&self) -> Result<(), failure::Error> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            let core = Arc::clone(&self.core);
            let logger = self.core.logger.new(o!("peer" => peer.to_string()));
            tokio::spawn(handle_connection(core, stream, logger));
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The single writer: applies committed transactions, routes responses,
/// and executes the reads serialized between them.
async fn run_applier(core: Arc<ServerCore>, mut committed: UnboundedReceiver<Committed>) {
    while let Some(item) = committed.recv().await {
        match item {
            Committed::Txn { txn, reply } => {
                let outcome = core.tree.write().apply(&txn);
                if let TxnOp::KillSession = txn.op {
                    core.sessions.remove(txn.session_id);
                }
                // lock released: deliver notifications, then the response
                for fired in &outcome.fired {
                    fired.deliver();
                }
                if let Some(reply) = reply {
                    if let Some(msg) = build_reply(&outcome.result, &reply) {
                        let _ = reply.conn.send(msg);
                    }
                }
            }
            Committed::Read(task) => {
                let msg = execute_read(&core, &task);
                let _ = task.conn.send(msg);
            }
            Committed::Reply { conn, msg } => {
                let _ = conn.send(msg);
            }
        }
    }
}

fn build_reply(result: &ApplyResult, reply: &ReplyTo) -> Option<SaberMessage> {
    match result {
        ApplyResult::Create { code, name } => {
            let client_name = path::strip(&reply.root, name);
            Some(create_response(*code, &reply.path, &client_name))
        }
        ApplyResult::Delete { code } => Some(delete_response(*code, &reply.path)),
        ApplyResult::SetData { code, stat } => Some(stat_response(
            MessageType::SetData,
            *code,
            &reply.path,
            *stat,
        )),
        ApplyResult::SetAcl { code, stat } => Some(stat_response(
            MessageType::SetAcl,
            *code,
            &reply.path,
            *stat,
        )),
        ApplyResult::KillSession => None,
    }
}

fn execute_read(core: &ServerCore, task: &ReadTask) -> SaberMessage {
    let ids = [Id::anyone()];
    let watcher = if task.watch {
        Some(WatcherHandle::new(
            task.session_id,
            task.root.clone(),
            task.conn.clone(),
        ))
    } else {
        None
    };
    let tree = core.tree.read();
    match task.type_ {
        MessageType::Exists => {
            let (code, stat) = tree.exists(&task.full_path, watcher);
            stat_response(MessageType::Exists, code, &task.client_path, stat)
        }
        MessageType::GetData => {
            let (code, data, stat) = tree.get_data(&task.full_path, &ids, watcher);
            get_data_response(code, &task.client_path, &data, stat)
        }
        MessageType::GetChildren => {
            let (code, children) = tree.get_children(&task.full_path, &ids, watcher);
            get_children_response(code, &task.client_path, &children)
        }
        MessageType::GetAcl => {
            let (code, acl, stat) = tree.get_acl(&task.full_path);
            get_acl_response(code, &task.client_path, &acl, stat)
        }
        other => {
            // unreachable by construction; answer something harmless
            warn!(core.logger, "non-read task on the committed stream"; "type" => ?other);
            stat_response(MessageType::Exists, Code::SystemError, &task.client_path, Default::default())
        }
    }
}

async fn run_expiry_ticker(core: Arc<ServerCore>) {
    let mut interval = tokio::time::interval(Duration::from_millis(core.options.tick_ms.max(10)));
    loop {
        interval.tick().await;
        for session_id in core.sessions.expired() {
            info!(core.logger, "session timed out"; "session_id" => session_id);
            let txn = Transaction {
                session_id,
                zxid: 0,
                time_ms: now_ms(),
                op: TxnOp::KillSession,
            };
            if core.proposer.propose(txn, None).await.is_err() {
                return;
            }
        }
    }
}

struct Connection {
    core: Arc<ServerCore>,
    out: UnboundedSender<SaberMessage>,
    session_id: Option<u64>,
    root: String,
    logger: slog::Logger,
}

async fn handle_connection(core: Arc<ServerCore>, stream: TcpStream, logger: slog::Logger) {
    debug!(logger, "connection open");
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = unbounded_channel::<SaberMessage>();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if message::write_message(&mut writer, &msg).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        core,
        out: out_tx,
        session_id: None,
        root: String::new(),
        logger,
    };

    loop {
        match message::read_message(&mut reader).await {
            Ok(Some(msg)) => match conn.dispatch(msg).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    // the server never panics on client input; it drops
                    // the connection and logs why
                    warn!(conn.logger, "closing connection: {}", e);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!(conn.logger, "read failed: {}", e);
                break;
            }
        }
    }

    if let Some(session_id) = conn.session_id {
        conn.core.sessions.detach(session_id, &conn.out);
    }
    debug!(conn.logger, "connection closed");
}

impl Connection {
    /// Handle one inbound message. `Ok(false)` ends the connection.
    async fn dispatch(&mut self, msg: SaberMessage) -> Result<bool, failure::Error> {
        match msg.type_ {
            MessageType::Connect => {
                self.handle_connect(msg)?;
                Ok(true)
            }
            MessageType::Ping => {
                if let Some(session_id) = self.session_id {
                    self.core.sessions.touch(session_id);
                }
                let _ = self.out.send(SaberMessage::new(MessageType::Ping, Vec::new()));
                Ok(true)
            }
            MessageType::Close => {
                if let Some(session_id) = self.session_id {
                    debug!(self.logger, "client closed session"; "session_id" => session_id);
                    let txn = Transaction {
                        session_id,
                        zxid: 0,
                        time_ms: now_ms(),
                        op: TxnOp::KillSession,
                    };
                    let _ = self.core.proposer.propose(txn, None).await;
                }
                Ok(false)
            }
            MessageType::SetWatches => {
                let session_id = self.attached()?;
                self.core.sessions.touch(session_id);
                let req = SetWatchesRequest::read_from(&mut &msg.data[..])?;
                let handle =
                    WatcherHandle::new(session_id, self.root.clone(), self.out.clone());
                let data: Vec<String> =
                    req.data.iter().map(|p| path::join(&self.root, p)).collect();
                let exist: Vec<String> =
                    req.exist.iter().map(|p| path::join(&self.root, p)).collect();
                let child: Vec<String> =
                    req.child.iter().map(|p| path::join(&self.root, p)).collect();
                debug!(self.logger, "rebuilding watches";
                       "data" => data.len(), "exist" => exist.len(), "child" => child.len());
                self.core.tree.read().set_watches(&data, &exist, &child, &handle);
                Ok(true)
            }
            MessageType::Exists
            | MessageType::GetData
            | MessageType::GetChildren
            | MessageType::GetAcl => {
                let session_id = self.attached()?;
                self.core.sessions.touch(session_id);
                if self.redirected(msg.type_) {
                    return Ok(true);
                }
                self.submit_read(session_id, msg)?;
                Ok(true)
            }
            MessageType::Create
            | MessageType::Delete
            | MessageType::SetData
            | MessageType::SetAcl => {
                let session_id = self.attached()?;
                self.core.sessions.touch(session_id);
                if self.redirected(msg.type_) {
                    return Ok(true);
                }
                self.submit_write(session_id, msg).await?;
                Ok(true)
            }
            MessageType::Notification | MessageType::Master => Err(format_err!(
                "client sent server-only message type {:?}",
                msg.type_
            )),
        }
    }

    fn attached(&self) -> Result<u64, failure::Error> {
        self.session_id
            .ok_or_else(|| format_err!("operation before CONNECT handshake"))
    }

    fn handle_connect(&mut self, msg: SaberMessage) -> Result<(), failure::Error> {
        let req = ConnectRequest::read_from(&mut &msg.data[..])?;
        let root = match String::from_utf8(msg.extra_data) {
            Ok(root) if root.is_empty() || path::validate(&root).is_ok() => root,
            _ => return Err(format_err!("malformed chroot in CONNECT")),
        };
        self.root = root;

        let (session_id, timeout_ms) = if req.session_id != 0 {
            match self.core.sessions.attach(req.session_id, self.out.clone()) {
                Some(timeout_ms) => (req.session_id, timeout_ms),
                None => {
                    // an unknown id can only be an expired one
                    info!(self.logger, "rejecting expired session";
                          "session_id" => req.session_id);
                    let _ = self.out.send(
                        ConnectResponse {
                            session_id: 0,
                            timeout_ms: 0,
                        }
                        .into_message(),
                    );
                    return Ok(());
                }
            }
        } else {
            self.core.sessions.create(req.timeout_ms, self.out.clone())
        };

        info!(self.logger, "session attached";
              "session_id" => session_id, "timeout_ms" => timeout_ms);
        self.session_id = Some(session_id);
        let _ = self.out.send(
            ConnectResponse {
                session_id,
                timeout_ms,
            }
            .into_message(),
        );
        Ok(())
    }

    /// When this replica is not the master, operations are answered with
    /// the master's address instead.
    fn redirected(&self, type_: MessageType) -> bool {
        if let Some(master) = self.core.options.master {
            debug!(self.logger, "redirecting to master"; "type" => ?type_, "master" => %master);
            let _ = self.out.send(
                MasterHint {
                    host: master.ip().to_string(),
                    port: master.port(),
                }
                .into_message(),
            );
            true
        } else {
            false
        }
    }

    fn submit_read(&self, session_id: u64, msg: SaberMessage) -> Result<(), failure::Error> {
        let (client_path, watch) = match msg.type_ {
            MessageType::GetAcl => {
                let req = GetAclRequest::read_from(&mut &msg.data[..])?;
                (req.path, false)
            }
            _ => {
                let req = ReadRequest::read_from(&mut &msg.data[..])?;
                (req.path, req.watch)
            }
        };
        let task = ReadTask {
            type_: msg.type_,
            full_path: path::join(&self.root, &client_path),
            client_path,
            watch,
            session_id,
            root: self.root.clone(),
            conn: self.out.clone(),
        };
        self.core
            .applier
            .send(Committed::Read(task))
            .map_err(|_| format_err!("applier loop has shut down"))
    }

    async fn submit_write(&self, session_id: u64, msg: SaberMessage) -> Result<(), failure::Error> {
        let ids = [Id::anyone()];
        // dry-run check under the shared lock; failures are answered
        // through the committed stream so responses keep submission order
        let (op, client_path, precheck) = match msg.type_ {
            MessageType::Create => {
                let req = CreateRequest::read_from(&mut &msg.data[..])?;
                let full = path::join(&self.root, &req.path);
                let code = self
                    .core
                    .tree
                    .read()
                    .check_create(&full, &req.acl, req.mode, &ids);
                (
                    TxnOp::Create {
                        path: full,
                        data: req.data,
                        acl: req.acl,
                        mode: req.mode,
                    },
                    req.path,
                    code,
                )
            }
            MessageType::Delete => {
                let req = DeleteRequest::read_from(&mut &msg.data[..])?;
                let full = path::join(&self.root, &req.path);
                let code = self.core.tree.read().check_delete(&full, req.version, &ids);
                (
                    TxnOp::Delete {
                        path: full,
                        version: req.version,
                    },
                    req.path,
                    code,
                )
            }
            MessageType::SetData => {
                let req = SetDataRequest::read_from(&mut &msg.data[..])?;
                let full = path::join(&self.root, &req.path);
                let code = self
                    .core
                    .tree
                    .read()
                    .check_set_data(&full, req.version, &ids);
                (
                    TxnOp::SetData {
                        path: full,
                        data: req.data,
                        version: req.version,
                    },
                    req.path,
                    code,
                )
            }
            MessageType::SetAcl => {
                let req = SetAclRequest::read_from(&mut &msg.data[..])?;
                let full = path::join(&self.root, &req.path);
                let code = self
                    .core
                    .tree
                    .read()
                    .check_set_acl(&full, &req.acl, req.version, &ids);
                (
                    TxnOp::SetAcl {
                        path: full,
                        acl: req.acl,
                        version: req.version,
                    },
                    req.path,
                    code,
                )
            }
            other => return Err(format_err!("{:?} is not a write", other)),
        };

        if precheck != Code::Ok {
            debug!(self.logger, "write rejected in dry run";
                   "type" => ?msg.type_, "path" => &client_path, "code" => ?precheck);
            return self
                .core
                .applier
                .send(Committed::Reply {
                    conn: self.out.clone(),
                    msg: error_reply(msg.type_, precheck, &client_path),
                })
                .map_err(|_| format_err!("applier loop has shut down"));
        }

        let txn = Transaction {
            session_id,
            zxid: 0,
            time_ms: now_ms(),
            op,
        };
        let reply = ReplyTo {
            conn: self.out.clone(),
            root: self.root.clone(),
            path: client_path,
        };
        self.core.proposer.propose(txn, Some(reply)).await
    }
}

fn error_reply(type_: MessageType, code: Code, client_path: &str) -> SaberMessage {
    match type_ {
        MessageType::Create => create_response(code, client_path, ""),
        MessageType::Delete => delete_response(code, client_path),
        _ => stat_response(type_, code, client_path, Default::default()),
    }
}
