#![recursion_limit = "512"]

//! A ZooKeeper-style coordination core: a hierarchical namespace of small
//! data nodes with per-path watches, ephemeral nodes bound to client
//! sessions, and a client engine that survives server failures and master
//! changes without dropping in-flight requests.
//!
//! # The data model
//!
//! Keys look like filesystem paths (`/jobs/worker-0000000001`), and every
//! item along a path is a node. A node carries opaque bytes, an access
//! control list, and a [`Stat`] with version counters and transaction
//! ids. Nodes form a tree: a node cannot be created without its parent,
//! and cannot be deleted while it has children.
//!
//! Nodes are created with a [`CreateMode`]. `Persistent` nodes stay until
//! deleted. `Ephemeral` nodes live exactly as long as the session that
//! created them, which makes them the building block for liveness
//! tracking and leases; since they are deleted out from under their
//! owner, they may not have children. The `*Sequential` modes append a
//! 10-digit, zero-padded counter drawn from the parent, giving cheap
//! unique ordered names for queues and leader election.
//!
//! # Operations and watches
//!
//! The client API is the expected file-system-flavored set:
//! [`Saber::create`], [`Saber::delete`], [`Saber::exists`],
//! [`Saber::get_data`] / [`Saber::set_data`], [`Saber::get_acl`] /
//! [`Saber::set_acl`], and [`Saber::get_children`]. The read operations
//! can additionally leave a *watch* on the path (via [`Saber::watch`] or
//! [`Saber::with_watcher`]): a one-shot, edge-triggered registration that
//! delivers a single [`WatchedEvent`] the first time the observed state
//! changes, after which it must be re-registered. Watches fire in order:
//! a client never sees a watch event after it has seen new state that the
//! event predates.
//!
//! # Sessions
//!
//! A connection handshake establishes a *session*, identified by a 64-bit
//! id and kept alive by heartbeats. The session -- not the TCP connection
//! -- is the unit of liveness: the client reconnects to another server
//! (or to the hinted master) transparently, replaying requests that were
//! in flight, and re-arming watches when `auto_watch_reset` is on (the
//! default). Only when the cluster declares the session expired does the
//! engine give up: pending requests fail with a session-expired error,
//! the default watcher receives an [`SessionState::Expired`] event, and a
//! new client must be built.
//!
//! # The server
//!
//! [`SaberServer`] hosts the namespace behind the same wire protocol.
//! Reads are served from the current tree; writes are proposed to the
//! consensus layer below and applied once committed, so every replica
//! applies the same sequence of transactions. The bundled single-replica
//! proposer commits locally, which is enough for development, testing,
//! and single-node deployments.
//!
//! # Example
//!
//! ```no_run
//! use saber::{Acl, CreateMode, Saber, SaberServer, ServerOptions};
//! use slog::o;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), failure::Error> {
//!     let logger = slog::Logger::root(slog::Discard, o!());
//!     let server =
//!         SaberServer::bind("127.0.0.1:8888".parse()?, ServerOptions::default(), logger).await?;
//!     tokio::spawn(async move { server.run().await });
//!
//!     let (saber, _events) = Saber::connect("127.0.0.1:8888").await?;
//!     let (saber, path) = saber
//!         .create("/greeting", &b"hello"[..], Acl::open_unsafe(), CreateMode::Persistent)
//!         .await?;
//!     assert_eq!(path.as_deref(), Ok("/greeting"));
//!     let (saber, data) = saber.get_data("/greeting").await?;
//!     assert_eq!(data.unwrap().0, b"hello");
//!     saber.close().await
//! }
//! ```

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use futures::{channel::oneshot, Stream};
use slog::{o, trace};
use std::borrow::Cow;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod client;
/// Per-operation error types.
pub mod error;
/// Validation and decomposition of hierarchical keys.
pub mod path;
mod proto;
mod server;
mod transform;
mod types;

use crate::client::session::Session;
use crate::proto::{Packetizer, Request, Watch};
pub use crate::client::servers::{RoundRobin, ServerManager};
pub use crate::server::{SaberServer, ServerOptions};
pub use crate::types::{
    Acl, CreateMode, Id, Permission, SessionState, Stat, WatchedEvent, WatchedEventType,
};

/// A handle to a coordination-service session.
///
/// All interaction happens by calling the methods of a `Saber` instance;
/// clones share the same underlying session. Operations return
/// immediately at the call site and resolve through the returned future
/// once the response arrives, in submission order per operation type.
///
/// The handle stays usable across server failures: the engine reconnects
/// to the next candidate server (or to a hinted master), replays what was
/// in flight, and carries on under the same session id. The session-state
/// events a [`ServerManager`] cannot observe -- connected, disconnected,
/// expired -- arrive on the default watcher stream returned by
/// [`SaberBuilder::connect`]. Once the session is expired the handle is
/// dead: every call fails, and a new one must be built.
#[derive(Debug, Clone)]
pub struct Saber {
    connection: proto::Enqueuer,
    closed: Arc<AtomicBool>,
    logger: slog::Logger,
}

/// Builder that allows customizing options for a [`Saber`] session.
pub struct SaberBuilder {
    servers: Vec<SocketAddr>,
    root: String,
    session_timeout: Duration,
    auto_watch_reset: bool,
    server_manager: Option<Box<dyn ServerManager>>,
    logger: slog::Logger,
}

impl fmt::Debug for SaberBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SaberBuilder")
            .field("servers", &self.servers)
            .field("root", &self.root)
            .field("session_timeout", &self.session_timeout)
            .field("auto_watch_reset", &self.auto_watch_reset)
            .finish()
    }
}

impl SaberBuilder {
    /// Start building a session against the given comma-separated
    /// `host:port` list.
    pub fn new(servers: &str) -> Result<SaberBuilder, failure::Error> {
        let mut parsed = Vec::new();
        for server in servers.split(',') {
            let server = server.trim();
            let addr = server.to_socket_addrs()?.next().ok_or_else(|| {
                failure::format_err!("server {:?} does not resolve to an address", server)
            })?;
            parsed.push(addr);
        }
        if parsed.is_empty() {
            return Err(failure::format_err!("server list is empty"));
        }
        Ok(SaberBuilder {
            servers: parsed,
            root: String::new(),
            session_timeout: Duration::from_millis(10_000),
            auto_watch_reset: true,
            server_manager: None,
            logger: slog::Logger::root(slog::Discard, o!()),
        })
    }

    /// Prefix every path this session uses with `root`, confining the
    /// client to a subtree of the namespace.
    pub fn set_root(&mut self, root: &str) {
        self.root = root.to_string();
    }

    /// Set the session timeout to request. The granted timeout is
    /// negotiated by the server and may differ.
    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.session_timeout = timeout;
    }

    /// Choose whether watches are re-armed on the new server after a
    /// reconnect (the default), or dropped with a final `Disconnected`
    /// event to each watcher.
    pub fn set_auto_watch_reset(&mut self, reset: bool) {
        self.auto_watch_reset = reset;
    }

    /// Replace the built-in round-robin endpoint rotation.
    pub fn set_server_manager<M: ServerManager + 'static>(&mut self, manager: M) {
        self.server_manager = Some(Box::new(manager));
    }

    /// Set the logger used internally by the session engine.
    ///
    /// By default, all logging is disabled. See also [the `slog`
    /// documentation](https://docs.rs/slog).
    pub fn set_logger(&mut self, logger: slog::Logger) {
        self.logger = logger;
    }

    /// Start the session engine.
    ///
    /// Establishment is asynchronous: this returns immediately, requests
    /// submitted right away are sent once the handshake completes, and
    /// the returned stream delivers session-state changes and globally
    /// watched events.
    pub async fn connect(
        self,
    ) -> Result<(Saber, impl Stream<Item = WatchedEvent>), failure::Error> {
        let SaberBuilder {
            servers,
            root,
            session_timeout,
            auto_watch_reset,
            server_manager,
            logger,
        } = self;
        if !root.is_empty() {
            path::validate(&root)?;
        }
        let timeout_ms = session_timeout.as_millis() as u32;
        let session = Session::new(root, timeout_ms, auto_watch_reset);
        let servers = server_manager.unwrap_or_else(|| Box::new(RoundRobin::new(servers)));

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let enqueuer =
            Packetizer::<tokio::net::TcpStream>::new(servers, session, logger.clone(), tx);
        Ok((
            Saber {
                connection: enqueuer,
                closed: Arc::new(AtomicBool::new(false)),
                logger,
            },
            rx,
        ))
    }
}

impl Saber {
    /// Start a session with default options against the given
    /// comma-separated `host:port` list.
    ///
    /// See [`SaberBuilder::connect`].
    pub async fn connect(
        servers: &str,
    ) -> Result<(Self, impl Stream<Item = WatchedEvent>), failure::Error> {
        SaberBuilder::new(servers)?.connect().await
    }

    /// Create a node at `path` with `data` as its contents.
    ///
    /// If `mode` is sequential, the created node's name is the given
    /// `path` plus a 10-digit zero-padded counter, and the full name is
    /// returned; sequential creates therefore never fail with
    /// [`error::Create::NodeExists`]. If `mode` is ephemeral, the node is
    /// deleted automatically when this session ends.
    ///
    /// A successful create triggers the watches left on `path` by
    /// `exists` calls, and the child watches left on its parent by
    /// `get_children` calls.
    pub async fn create<D, A>(
        self,
        path: &str,
        data: D,
        acl: A,
        mode: CreateMode,
    ) -> Result<(Self, Result<String, error::Create>), failure::Error>
    where
        D: Into<Cow<'static, [u8]>>,
        A: Into<Cow<'static, [Acl]>>,
    {
        path::validate(path)?;
        let data = data.into();
        trace!(self.logger, "create"; "path" => path, "mode" => ?mode, "dlen" => data.len());
        self.connection
            .enqueue(
                Request::Create {
                    path: path.to_string(),
                    data,
                    acl: acl.into(),
                    mode,
                },
                Watch::None,
            )
            .await
            .and_then(transform::create)
            .map(move |r| (self, r))
    }

    /// Delete the node at `path`.
    ///
    /// The call succeeds if such a node exists and `version` is `None` or
    /// matches the node's data version. A successful delete triggers the
    /// watches left on `path`, and the child watches left on its parent.
    pub async fn delete(
        self,
        path: &str,
        version: Option<i32>,
    ) -> Result<(Self, Result<(), error::Delete>), failure::Error> {
        path::validate(path)?;
        trace!(self.logger, "delete"; "path" => path, "version" => ?version);
        let version = version.unwrap_or(-1);
        self.connection
            .enqueue(
                Request::Delete {
                    path: path.to_string(),
                    version,
                },
                Watch::None,
            )
            .await
            .and_then(move |r| transform::delete(version, r))
            .map(move |r| (self, r))
    }

    /// Set the data of the node at `path`.
    ///
    /// The call succeeds if such a node exists and `version` is `None` or
    /// matches the node's current data version; the updated [`Stat`] is
    /// returned. A successful set triggers the watches left on `path` by
    /// `get_data` and `exists` calls.
    pub async fn set_data<D>(
        self,
        path: &str,
        version: Option<i32>,
        data: D,
    ) -> Result<(Self, Result<Stat, error::SetData>), failure::Error>
    where
        D: Into<Cow<'static, [u8]>>,
    {
        path::validate(path)?;
        let data = data.into();
        trace!(self.logger, "set_data"; "path" => path, "version" => ?version, "dlen" => data.len());
        let version = version.unwrap_or(-1);
        self.connection
            .enqueue(
                Request::SetData {
                    path: path.to_string(),
                    data,
                    version,
                },
                Watch::None,
            )
            .await
            .and_then(move |r| transform::set_data(version, r))
            .map(move |r| (self, r))
    }

    /// Return the ACL and [`Stat`] of the node at `path`.
    pub async fn get_acl(
        self,
        path: &str,
    ) -> Result<(Self, Result<(Vec<Acl>, Stat), error::GetAcl>), failure::Error> {
        path::validate(path)?;
        trace!(self.logger, "get_acl"; "path" => path);
        self.connection
            .enqueue(
                Request::GetAcl {
                    path: path.to_string(),
                },
                Watch::None,
            )
            .await
            .and_then(transform::get_acl)
            .map(move |r| (self, r))
    }

    /// Set the ACL of the node at `path`.
    ///
    /// The call succeeds if such a node exists and `version` is `None` or
    /// matches the node's ACL version; the updated [`Stat`] is returned.
    /// ACL changes trigger no watches.
    pub async fn set_acl<A>(
        self,
        path: &str,
        acl: A,
        version: Option<i32>,
    ) -> Result<(Self, Result<Stat, error::SetAcl>), failure::Error>
    where
        A: Into<Cow<'static, [Acl]>>,
    {
        path::validate(path)?;
        trace!(self.logger, "set_acl"; "path" => path, "version" => ?version);
        let version = version.unwrap_or(-1);
        self.connection
            .enqueue(
                Request::SetAcl {
                    path: path.to_string(),
                    acl: acl.into(),
                    version,
                },
                Watch::None,
            )
            .await
            .and_then(move |r| transform::set_acl(version, r))
            .map(move |r| (self, r))
    }

    /// End the session.
    ///
    /// Idempotent: the first call (across all clones) tells the server to
    /// tear the session down -- deleting its ephemeral nodes immediately
    /// rather than waiting for the timeout -- and shuts the engine down;
    /// later calls are no-ops. Requests still in flight resolve as
    /// canceled.
    pub async fn close(self) -> Result<(), failure::Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!(self.logger, "close");
        // if the engine is already gone (expired session), there is
        // nothing left to say goodbye to
        let _ = self.connection.enqueue(Request::Close, Watch::None).await;
        Ok(())
    }
}

impl Saber {
    /// Add a global watch for the next chained operation.
    ///
    /// Events for global watches are delivered on the stream returned by
    /// [`SaberBuilder::connect`].
    pub fn watch(self) -> WatchGlobally {
        WatchGlobally(self)
    }

    /// Add a dedicated watcher for the next chained operation; its event
    /// arrives on the returned `oneshot` channel (and on the global
    /// stream as well).
    pub fn with_watcher(self) -> WithWatcher {
        WithWatcher(self)
    }

    async fn exists_w(
        self,
        path: &str,
        watch: Watch,
    ) -> Result<(Self, Option<Stat>), failure::Error> {
        path::validate(path)?;
        trace!(self.logger, "exists"; "path" => path, "watch" => ?watch);
        let requested = watch.requested();
        self.connection
            .enqueue(
                Request::Exists {
                    path: path.to_string(),
                    watch: requested,
                },
                watch,
            )
            .await
            .and_then(transform::exists)
            .map(move |r| (self, r))
    }

    /// Return the [`Stat`] of the node at `path`, or `None` if no such
    /// node exists.
    pub async fn exists(self, path: &str) -> Result<(Self, Option<Stat>), failure::Error> {
        self.exists_w(path, Watch::None).await
    }

    async fn get_data_w(
        self,
        path: &str,
        watch: Watch,
    ) -> Result<(Self, Option<(Vec<u8>, Stat)>), failure::Error> {
        path::validate(path)?;
        trace!(self.logger, "get_data"; "path" => path, "watch" => ?watch);
        let requested = watch.requested();
        self.connection
            .enqueue(
                Request::GetData {
                    path: path.to_string(),
                    watch: requested,
                },
                watch,
            )
            .await
            .and_then(transform::get_data)
            .map(move |r| (self, r))
    }

    /// Return the data and the [`Stat`] of the node at `path`, or `None`
    /// if no such node exists.
    pub async fn get_data(
        self,
        path: &str,
    ) -> Result<(Self, Option<(Vec<u8>, Stat)>), failure::Error> {
        self.get_data_w(path, Watch::None).await
    }

    async fn get_children_w(
        self,
        path: &str,
        watch: Watch,
    ) -> Result<(Self, Option<Vec<String>>), failure::Error> {
        path::validate(path)?;
        trace!(self.logger, "get_children"; "path" => path, "watch" => ?watch);
        let requested = watch.requested();
        self.connection
            .enqueue(
                Request::GetChildren {
                    path: path.to_string(),
                    watch: requested,
                },
                watch,
            )
            .await
            .and_then(transform::get_children)
            .map(move |r| (self, r))
    }

    /// Return the names of the children of the node at `path`, sorted
    /// lexicographically, or `None` if no such node exists.
    pub async fn get_children(
        self,
        path: &str,
    ) -> Result<(Self, Option<Vec<String>>), failure::Error> {
        self.get_children_w(path, Watch::None).await
    }
}

/// Proxy for [`Saber`] that adds watches for initiated operations.
///
/// Triggered watches produce events on the global watcher stream.
#[derive(Debug, Clone)]
pub struct WatchGlobally(Saber);

impl WatchGlobally {
    /// Return the [`Stat`] of the node at `path`, or `None` if no such
    /// node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that creates or deletes the node or sets its
    /// data. The event is sent to the global watcher stream.
    pub async fn exists(self, path: &str) -> Result<(Saber, Option<Stat>), failure::Error> {
        self.0.exists_w(path, Watch::Global).await
    }

    /// Return the data and the [`Stat`] of the node at `path`, or `None`
    /// if no such node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that sets the node's data or deletes it. The
    /// event is sent to the global watcher stream.
    pub async fn get_data(
        self,
        path: &str,
    ) -> Result<(Saber, Option<(Vec<u8>, Stat)>), failure::Error> {
        self.0.get_data_w(path, Watch::Global).await
    }

    /// Return the names of the children of the node at `path`, sorted
    /// lexicographically, or `None` if no such node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that deletes the node or creates or deletes
    /// one of its children. The event is sent to the global watcher
    /// stream.
    pub async fn get_children(
        self,
        path: &str,
    ) -> Result<(Saber, Option<Vec<String>>), failure::Error> {
        self.0.get_children_w(path, Watch::Global).await
    }
}

/// Proxy for [`Saber`] that adds dedicated watchers for initiated
/// operations.
///
/// Events from triggered watches are yielded through returned `oneshot`
/// channels; they also appear on the global watcher stream.
#[derive(Debug, Clone)]
pub struct WithWatcher(Saber);

impl WithWatcher {
    /// Return the [`Stat`] of the node at `path`, or `None` if no such
    /// node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that creates or deletes the node or sets its
    /// data; it resolves the included `oneshot::Receiver`.
    pub async fn exists(
        self,
        path: &str,
    ) -> Result<(Saber, oneshot::Receiver<WatchedEvent>, Option<Stat>), failure::Error> {
        let (tx, rx) = oneshot::channel();
        self.0
            .exists_w(path, Watch::Custom(tx))
            .await
            .map(|r| (r.0, rx, r.1))
    }

    /// Return the data and the [`Stat`] of the node at `path`, or `None`
    /// if no such node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that sets the node's data or deletes it; it
    /// resolves the included `oneshot::Receiver`.
    pub async fn get_data(
        self,
        path: &str,
    ) -> Result<
        (
            Saber,
            Option<(oneshot::Receiver<WatchedEvent>, Vec<u8>, Stat)>,
        ),
        failure::Error,
    > {
        let (tx, rx) = oneshot::channel();
        self.0
            .get_data_w(path, Watch::Custom(tx))
            .await
            .map(|r| (r.0, r.1.map(move |(b, s)| (rx, b, s))))
    }

    /// Return the names of the children of the node at `path`, sorted
    /// lexicographically, or `None` if no such node exists.
    ///
    /// If no error occurs, a watch is left on `path`, triggered by any
    /// successful operation that deletes the node or creates or deletes
    /// one of its children; it resolves the included `oneshot::Receiver`.
    pub async fn get_children(
        self,
        path: &str,
    ) -> Result<
        (
            Saber,
            Option<(oneshot::Receiver<WatchedEvent>, Vec<String>)>,
        ),
        failure::Error,
    > {
        let (tx, rx) = oneshot::channel();
        self.0
            .get_children_w(path, Watch::Custom(tx))
            .await
            .map(|r| (r.0, r.1.map(move |c| (rx, c))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::codes::Code;
    use crate::proto::message::{read_message, write_message, MessageType, SaberMessage};
    use crate::proto::request::{ConnectRequest, CreateRequest, ReadRequest, SetWatchesRequest};
    use crate::proto::response::{create_response, get_data_response, ConnectResponse, MasterHint};
    use futures::StreamExt;
    use slog::Drain;
    use tokio::net::{TcpListener, TcpStream};

    fn test_logger() -> slog::Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn quiet_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    async fn start_server() -> (SocketAddr, Arc<SaberServer>) {
        let server = SaberServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ServerOptions::default(),
            quiet_logger(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (addr, server)
    }

    /// Read the next non-ping message from a scripted server's stream,
    /// answering heartbeats along the way, and assert its type.
    async fn expect(stream: &mut TcpStream, type_: MessageType) -> SaberMessage {
        loop {
            let msg = read_message(stream)
                .await
                .unwrap()
                .expect("connection closed before the expected message");
            if msg.type_ == MessageType::Ping {
                write_message(stream, &SaberMessage::new(MessageType::Ping, Vec::new()))
                    .await
                    .unwrap();
                continue;
            }
            assert_eq!(msg.type_, type_);
            return msg;
        }
    }

    /// Answer pings and ignore everything else until the peer goes away.
    async fn drain(stream: &mut TcpStream) {
        while let Ok(Some(msg)) = read_message(stream).await {
            if msg.type_ == MessageType::Ping {
                if write_message(stream, &SaberMessage::new(MessageType::Ping, Vec::new()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn it_works() {
        let (addr, _server) = start_server().await;
        let mut builder = SaberBuilder::new(&addr.to_string()).unwrap();
        builder.set_logger(test_logger());
        let (zk, events) = builder.connect().await.unwrap();

        let (zk, exists_w, stat) = zk.with_watcher().exists("/foo").await.unwrap();
        assert_eq!(stat, None);
        let (zk, stat) = zk.watch().exists("/foo").await.unwrap();
        assert_eq!(stat, None);

        let (zk, path) = zk
            .create(
                "/foo",
                &b"Hello world"[..],
                Acl::open_unsafe(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Ok("/foo"));

        let event = exists_w.await.unwrap();
        assert_eq!(
            event,
            WatchedEvent {
                event_type: WatchedEventType::NodeCreated,
                state: SessionState::Connected,
                path: String::from("/foo"),
            }
        );

        let (zk, stat) = zk.watch().exists("/foo").await.unwrap();
        assert_eq!(stat.unwrap().data_length as usize, b"Hello world".len());

        let (zk, res) = zk.get_acl("/foo").await.unwrap();
        let (acl, _) = res.unwrap();
        assert_eq!(acl, Acl::open_unsafe());

        let (zk, res) = zk.get_data("/foo").await.unwrap();
        let res = res.unwrap();
        assert_eq!(res.0, b"Hello world");
        assert_eq!(res.1.version, 0);

        let (zk, stat) = zk
            .set_data("/foo", Some(res.1.version), &b"Bye world"[..])
            .await
            .unwrap();
        assert_eq!(stat.unwrap().data_length as usize, "Bye world".len());

        // a writer that raced on the old version loses
        let (zk, res) = zk.set_data("/foo", Some(0), &b"smashed"[..]).await.unwrap();
        assert_eq!(res, Err(error::SetData::BadVersion { expected: 0 }));
        let (zk, res) = zk.get_data("/foo").await.unwrap();
        assert_eq!(res.unwrap().0, b"Bye world");

        let (zk, path) = zk
            .create(
                "/foo/bar",
                &b"Hello bar"[..],
                Acl::open_unsafe(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Ok("/foo/bar"));

        let (zk, children) = zk.get_children("/foo").await.unwrap();
        assert_eq!(children, Some(vec!["bar".to_string()]));

        // add a new exists watch so we'll get notified of the delete
        let (zk, _) = zk.watch().exists("/foo").await.unwrap();
        let (zk, res) = zk.delete("/foo", None).await.unwrap();
        assert_eq!(res, Err(error::Delete::NotEmpty));
        let (zk, res) = zk.delete("/foo/bar", None).await.unwrap();
        assert_eq!(res, Ok(()));
        let (zk, res) = zk.delete("/foo", None).await.unwrap();
        assert_eq!(res, Ok(()));
        let (zk, stat) = zk.exists("/foo").await.unwrap();
        assert_eq!(stat, None);

        zk.close().await.unwrap();

        let node_events: Vec<WatchedEvent> = events
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .filter(|e| e.event_type != WatchedEventType::None)
            .collect();
        assert_eq!(
            node_events,
            vec![
                WatchedEvent {
                    event_type: WatchedEventType::NodeCreated,
                    state: SessionState::Connected,
                    path: String::from("/foo"),
                },
                WatchedEvent {
                    event_type: WatchedEventType::NodeDataChanged,
                    state: SessionState::Connected,
                    path: String::from("/foo"),
                },
                WatchedEvent {
                    event_type: WatchedEventType::NodeDeleted,
                    state: SessionState::Connected,
                    path: String::from("/foo"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn sequential_creates_number_from_the_parent() {
        let (addr, _server) = start_server().await;
        let (zk, _events) = Saber::connect(&addr.to_string()).await.unwrap();

        let (mut zk, path) = zk
            .create("/x", &b""[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Ok("/x"));

        for i in 0..3 {
            let (z, path) = zk
                .create(
                    "/x/q-",
                    &b""[..],
                    Acl::open_unsafe(),
                    CreateMode::PersistentSequential,
                )
                .await
                .unwrap();
            assert_eq!(path.unwrap(), format!("/x/q-{:010}", i));
            zk = z;
        }

        let (zk, stat) = zk.exists("/x").await.unwrap();
        let stat = stat.unwrap();
        assert_eq!(stat.cversion, 3);
        assert_eq!(stat.num_children, 3);
        zk.close().await.unwrap();
    }

    #[tokio::test]
    async fn closing_a_session_deletes_its_ephemerals() {
        let (addr, _server) = start_server().await;
        let (owner, _owner_events) = Saber::connect(&addr.to_string()).await.unwrap();
        let (observer, _observer_events) = Saber::connect(&addr.to_string()).await.unwrap();

        let (owner, path) = owner
            .create("/e", &b"lease"[..], Acl::open_unsafe(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Ok("/e"));

        let (observer, watch, stat) = observer.with_watcher().exists("/e").await.unwrap();
        assert!(stat.is_some());

        owner.close().await.unwrap();

        let event = watch.await.unwrap();
        assert_eq!(event.event_type, WatchedEventType::NodeDeleted);
        assert_eq!(event.state, SessionState::Connected);
        assert_eq!(event.path, "/e");

        let (observer, stat) = observer.exists("/e").await.unwrap();
        assert_eq!(stat, None);
        observer.close().await.unwrap();
    }

    #[tokio::test]
    async fn master_redirect_replays_the_pending_request() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        // a non-master that accepts the session but redirects the write
        let a_task = tokio::spawn(async move {
            let (mut stream, _) = a.accept().await.unwrap();
            let connect = expect(&mut stream, MessageType::Connect).await;
            let req = ConnectRequest::read_from(&mut &connect.data[..]).unwrap();
            assert_eq!(req.session_id, 0);
            write_message(
                &mut stream,
                &ConnectResponse {
                    session_id: 7,
                    timeout_ms: 9_000,
                }
                .into_message(),
            )
            .await
            .unwrap();

            let create = expect(&mut stream, MessageType::Create).await;
            let req = CreateRequest::read_from(&mut &create.data[..]).unwrap();
            assert_eq!(req.path, "/a");
            write_message(
                &mut stream,
                &MasterHint {
                    host: b_addr.ip().to_string(),
                    port: b_addr.port(),
                }
                .into_message(),
            )
            .await
            .unwrap();
            drain(&mut stream).await;
        });

        // the master: sees the same session id and the replayed create
        let b_task = tokio::spawn(async move {
            let (mut stream, _) = b.accept().await.unwrap();
            let connect = expect(&mut stream, MessageType::Connect).await;
            let req = ConnectRequest::read_from(&mut &connect.data[..]).unwrap();
            assert_eq!(req.session_id, 7);
            write_message(
                &mut stream,
                &ConnectResponse {
                    session_id: 7,
                    timeout_ms: 9_000,
                }
                .into_message(),
            )
            .await
            .unwrap();

            let create = expect(&mut stream, MessageType::Create).await;
            let req = CreateRequest::read_from(&mut &create.data[..]).unwrap();
            assert_eq!(req.path, "/a");
            write_message(&mut stream, &create_response(Code::Ok, "/a", "/a"))
                .await
                .unwrap();
            drain(&mut stream).await;
        });

        let (zk, _events) = Saber::connect(&a_addr.to_string()).await.unwrap();
        let (zk, path) = zk
            .create("/a", &b"x"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        // the callback fires exactly once, with the master's answer
        assert_eq!(path.as_deref(), Ok("/a"));
        zk.close().await.unwrap();

        a_task.await.unwrap();
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn watches_are_rearmed_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            // first connection: hand out the session and one watched read,
            // then fail the connection
            let (mut stream, _) = listener.accept().await.unwrap();
            expect(&mut stream, MessageType::Connect).await;
            write_message(
                &mut stream,
                &ConnectResponse {
                    session_id: 5,
                    timeout_ms: 9_000,
                }
                .into_message(),
            )
            .await
            .unwrap();
            let get = expect(&mut stream, MessageType::GetData).await;
            let req = ReadRequest::read_from(&mut &get.data[..]).unwrap();
            assert_eq!(req.path, "/k");
            assert!(req.watch);
            write_message(
                &mut stream,
                &get_data_response(Code::Ok, "/k", b"v", Stat::default()),
            )
            .await
            .unwrap();
            drop(stream);

            // reconnect: same session, and the watch comes back via
            // SET_WATCHES before anything else
            let (mut stream, _) = listener.accept().await.unwrap();
            let connect = expect(&mut stream, MessageType::Connect).await;
            let req = ConnectRequest::read_from(&mut &connect.data[..]).unwrap();
            assert_eq!(req.session_id, 5);
            write_message(
                &mut stream,
                &ConnectResponse {
                    session_id: 5,
                    timeout_ms: 9_000,
                }
                .into_message(),
            )
            .await
            .unwrap();
            let set_watches = expect(&mut stream, MessageType::SetWatches).await;
            let req = SetWatchesRequest::read_from(&mut &set_watches.data[..]).unwrap();
            assert_eq!(req.data, vec!["/k".to_string()]);
            assert!(req.exist.is_empty());
            assert!(req.child.is_empty());

            // now trip the re-armed watch
            write_message(
                &mut stream,
                &WatchedEvent::node(WatchedEventType::NodeDataChanged, "/k").into_notification(),
            )
            .await
            .unwrap();
            drain(&mut stream).await;
        });

        let (zk, _events) = Saber::connect(&addr.to_string()).await.unwrap();
        let (zk, res) = zk.with_watcher().get_data("/k").await.unwrap();
        let (watch, data, _stat) = res.unwrap();
        assert_eq!(data, b"v");

        let event = watch.await.unwrap();
        assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);
        assert_eq!(event.path, "/k");

        zk.close().await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn an_expired_session_fails_its_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            expect(&mut stream, MessageType::Connect).await;
            // session id zero: this session is gone
            write_message(
                &mut stream,
                &ConnectResponse {
                    session_id: 0,
                    timeout_ms: 0,
                }
                .into_message(),
            )
            .await
            .unwrap();
            drain(&mut stream).await;
        });

        let (zk, events) = Saber::connect(&addr.to_string()).await.unwrap();
        let result = zk
            .create("/a", &b"x"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await;
        assert!(result.is_err());

        let events: Vec<WatchedEvent> = events.collect().await;
        assert!(events
            .iter()
            .any(|e| e.state == SessionState::Expired && e.event_type == WatchedEventType::None));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn snapshots_restore_the_namespace() {
        let (addr, server) = start_server().await;
        let (zk, _events) = Saber::connect(&addr.to_string()).await.unwrap();
        let (zk, res) = zk
            .create("/a", &b"persist"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(res.is_ok());
        let (zk, res) = zk
            .create("/a/b", &b"child"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(res.is_ok());
        zk.close().await.unwrap();

        let snapshot = server.snapshot();
        let restored = SaberServer::bind_recovered(
            "127.0.0.1:0".parse().unwrap(),
            ServerOptions::default(),
            &snapshot,
            quiet_logger(),
        )
        .await
        .unwrap();
        let restored_addr = restored.local_addr().unwrap();
        let restored = Arc::new(restored);
        let runner = Arc::clone(&restored);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let (zk, _events) = Saber::connect(&restored_addr.to_string()).await.unwrap();
        let (zk, res) = zk.get_data("/a").await.unwrap();
        assert_eq!(res.unwrap().0, b"persist");
        let (zk, children) = zk.get_children("/a").await.unwrap();
        assert_eq!(children, Some(vec!["b".to_string()]));
        // the restored replica keeps accepting writes
        let (zk, res) = zk
            .create("/c", &b"new"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(res.is_ok());
        zk.close().await.unwrap();
    }

    #[tokio::test]
    async fn a_chrooted_client_sees_only_its_subtree() {
        let (addr, _server) = start_server().await;
        let (outside, _outside_events) = Saber::connect(&addr.to_string()).await.unwrap();
        let (outside, res) = outside
            .create("/app", &b""[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(res.is_ok());

        let mut builder = SaberBuilder::new(&addr.to_string()).unwrap();
        builder.set_root("/app");
        let (inside, _inside_events) = builder.connect().await.unwrap();

        let (inside, path) = inside
            .create("/x", &b"inner"[..], Acl::open_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path.as_deref(), Ok("/x"));

        // the node is really under the prefix
        let (outside, res) = outside.get_data("/app/x").await.unwrap();
        assert_eq!(res.unwrap().0, b"inner");

        // watch events come back in the chrooted namespace
        let (inside, res) = inside.with_watcher().get_data("/x").await.unwrap();
        let (watch, data, _stat) = res.unwrap();
        assert_eq!(data, b"inner");
        let (outside, res) = outside.set_data("/app/x", None, &b"changed"[..]).await.unwrap();
        assert!(res.is_ok());
        let event = watch.await.unwrap();
        assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);
        assert_eq!(event.path, "/x");

        let (inside, children) = inside.get_children("/").await.unwrap();
        assert_eq!(children, Some(vec!["x".to_string()]));

        inside.close().await.unwrap();
        outside.close().await.unwrap();
    }

    #[tokio::test]
    async fn acl_denies_what_it_does_not_grant() {
        let (addr, _server) = start_server().await;
        let (zk, _events) = Saber::connect(&addr.to_string()).await.unwrap();

        let (zk, res) = zk
            .create("/locked", &b"foo"[..], Acl::read_unsafe(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(res.as_deref(), Ok("/locked"));

        let (zk, res) = zk.get_acl("/locked").await.unwrap();
        assert_eq!(res.unwrap().0, Acl::read_unsafe());

        // reading is fine, writing is not
        let (zk, res) = zk.get_data("/locked").await.unwrap();
        assert_eq!(res.unwrap().0, b"foo");
        let (zk, res) = zk.set_data("/locked", None, &b"bar"[..]).await.unwrap();
        assert_eq!(res, Err(error::SetData::NoAuth));

        // nor can world reopen the node's acl
        let (zk, res) = zk.set_acl("/locked", Acl::open_unsafe(), None).await.unwrap();
        assert_eq!(res, Err(error::SetAcl::NoAuth));

        // and an empty acl list on create is rejected outright
        let (zk, res) = zk
            .create("/bad", &b""[..], &[][..], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(res, Err(error::Create::InvalidAcl));

        zk.close().await.unwrap();
    }
}
