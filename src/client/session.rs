//! Session-engine state: the per-operation FIFO queues, the outgoing
//! replay buffer, and the pure message-handling logic.
//!
//! Everything here is owned by the send loop (the packetizer task) and is
//! deliberately free of IO so the queue invariants are testable on their
//! own: responses of a given type arrive in submission order, so every
//! response pops the front of the matching queue, and the popped entry's
//! path must match the path echoed in the response.

use super::servers::ServerManager;
use super::watch_manager::{ClientWatch, ClientWatchManager, WatchKind};
use crate::proto::codes::Code;
use crate::proto::message::{MessageType, SaberMessage};
use crate::proto::request::Request;
use crate::proto::response::{MasterHint, ParsedResponse, Response};
use crate::proto::watch::Watch;
use crate::{SessionState, WatchedEvent};
use failure::format_err;
use futures::channel::{mpsc, oneshot};
use slog::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// One submitted operation waiting for its response.
pub(crate) struct Pending {
    pub(crate) path: String,
    pub(crate) watch: Watch,
    pub(crate) tx: oneshot::Sender<Result<Response, Code>>,
}

/// One FIFO per operation type. The server guarantees per-connection
/// response order within a type, which is what makes front-popping sound.
#[derive(Default)]
struct PendingQueues {
    create: VecDeque<Pending>,
    delete: VecDeque<Pending>,
    exists: VecDeque<Pending>,
    get_data: VecDeque<Pending>,
    set_data: VecDeque<Pending>,
    get_acl: VecDeque<Pending>,
    set_acl: VecDeque<Pending>,
    get_children: VecDeque<Pending>,
}

impl PendingQueues {
    fn queue_mut(&mut self, type_: MessageType) -> Option<&mut VecDeque<Pending>> {
        match type_ {
            MessageType::Create => Some(&mut self.create),
            MessageType::Delete => Some(&mut self.delete),
            MessageType::Exists => Some(&mut self.exists),
            MessageType::GetData => Some(&mut self.get_data),
            MessageType::SetData => Some(&mut self.set_data),
            MessageType::GetAcl => Some(&mut self.get_acl),
            MessageType::SetAcl => Some(&mut self.set_acl),
            MessageType::GetChildren => Some(&mut self.get_children),
            _ => None,
        }
    }

    fn drain(&mut self) -> Vec<Pending> {
        let mut out = Vec::new();
        out.extend(self.create.drain(..));
        out.extend(self.delete.drain(..));
        out.extend(self.exists.drain(..));
        out.extend(self.get_data.drain(..));
        out.extend(self.set_data.drain(..));
        out.extend(self.get_acl.drain(..));
        out.extend(self.set_acl.drain(..));
        out.extend(self.get_children.drain(..));
        out
    }

    fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.delete.is_empty()
            && self.exists.is_empty()
            && self.get_data.is_empty()
            && self.set_data.is_empty()
            && self.get_acl.is_empty()
            && self.set_acl.is_empty()
            && self.get_children.is_empty()
    }
}

/// What the connection loop should do after a message was handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Handled {
    /// Keep reading.
    Continue,
    /// A CONNECT response arrived; the ping cadence changes to a third of
    /// the negotiated timeout.
    SessionEstablished,
    /// The server pointed at the master; close and reconnect there.
    Redirect,
    /// The server expired the session; tear everything down for good.
    Expired,
}

pub(crate) struct Session {
    pub(crate) session_id: u64,
    /// Negotiated session timeout; starts at the requested value.
    pub(crate) timeout_ms: u32,
    pub(crate) root: String,
    pub(crate) auto_watch_reset: bool,
    pub(crate) expired: bool,
    pending: PendingQueues,
    outgoing: VecDeque<SaberMessage>,
    watches: ClientWatchManager,
}

impl Session {
    pub(crate) fn new(root: String, timeout_ms: u32, auto_watch_reset: bool) -> Session {
        Session {
            session_id: 0,
            timeout_ms,
            root,
            auto_watch_reset,
            expired: false,
            pending: PendingQueues::default(),
            outgoing: VecDeque::new(),
            watches: ClientWatchManager::new(),
        }
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms) / 3)
    }

    /// Record a submitted operation and produce its framed message. The
    /// message is also appended to the replay buffer.
    pub(crate) fn enqueue_op(
        &mut self,
        request: Request,
        watch: Watch,
        tx: oneshot::Sender<Result<Response, Code>>,
    ) -> SaberMessage {
        let type_ = request.message_type();
        let message = request.into_message(&self.root);
        let queue = self
            .pending
            .queue_mut(type_)
            .expect("only operation requests are enqueued");
        queue.push_back(Pending {
            path: request.path().to_string(),
            watch,
            tx,
        });
        self.outgoing.push_back(message.clone());
        message
    }

    /// The frames to send right after a transport (re)connects: the
    /// CONNECT handshake, then a watch reset when enabled and needed, then
    /// the entire replay buffer in original send order.
    pub(crate) fn handshake_messages(&mut self) -> Vec<SaberMessage> {
        let mut messages = Vec::with_capacity(2 + self.outgoing.len());
        messages.push(
            Request::Connect {
                session_id: self.session_id,
                timeout_ms: self.timeout_ms,
            }
            .into_message(&self.root),
        );
        if self.auto_watch_reset && !self.watches.is_empty() {
            let (data, exist, child) = self.watches.paths_for_reset();
            if !(data.is_empty() && exist.is_empty() && child.is_empty()) {
                // fire-and-forget: never buffered for replay, never queued
                messages.push(
                    Request::SetWatches {
                        data,
                        exist,
                        child,
                    }
                    .into_message(&self.root),
                );
            }
        }
        messages.extend(self.outgoing.iter().cloned());
        messages
    }

    /// The connection dropped. Emit the Disconnected state event and, when
    /// watch reset is disabled, deliver a final Disconnected event to each
    /// custom watcher and forget them all.
    pub(crate) fn on_disconnect(
        &mut self,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
    ) {
        let event = WatchedEvent::state_change(SessionState::Disconnected);
        let _ = default_watcher.unbounded_send(event.clone());
        if !self.auto_watch_reset {
            for tx in self.watches.drain_all() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Reconnection took longer than the session timeout allows; pending
    /// requests cannot be retried transparently any more.
    pub(crate) fn fail_pending(&mut self, code: Code) {
        for pending in self.pending.drain() {
            let _ = pending.tx.send(Err(code));
        }
        self.outgoing.clear();
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Handle one inbound message on the send loop.
    pub(crate) fn handle_message(
        &mut self,
        message: SaberMessage,
        servers: &mut dyn ServerManager,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        logger: &slog::Logger,
    ) -> Result<Handled, failure::Error> {
        use crate::proto::response::ReadFrom;

        match message.type_ {
            MessageType::Notification => {
                let event = WatchedEvent::read_from(&mut &message.data[..])?;
                trace!(logger, "got watcher event {:?}", event);
                for tx in self.watches.trigger(&event) {
                    // the receiver may have lost interest; that's fine
                    let _ = tx.send(event.clone());
                }
                let _ = default_watcher.unbounded_send(event);
                Ok(Handled::Continue)
            }
            MessageType::Connect => {
                let response = Response::parse(MessageType::Connect, &message.data)?;
                let (session_id, timeout_ms) = match response.body {
                    Response::Connect {
                        session_id,
                        timeout_ms,
                    } => (session_id, timeout_ms),
                    _ => unreachable!("Connect parse returns Response::Connect"),
                };
                if session_id == 0 {
                    info!(logger, "session expired by server");
                    self.expired = true;
                    self.fail_pending(Code::SessionExpired);
                    let event = WatchedEvent::state_change(SessionState::Expired);
                    for tx in self.watches.drain_all() {
                        let _ = tx.send(event.clone());
                    }
                    let _ = default_watcher.unbounded_send(event);
                    return Ok(Handled::Expired);
                }
                trace!(
                    logger,
                    "session established";
                    "session_id" => session_id,
                    "timeout_ms" => timeout_ms
                );
                self.session_id = session_id;
                self.timeout_ms = timeout_ms;
                let _ = default_watcher
                    .unbounded_send(WatchedEvent::state_change(SessionState::Connected));
                Ok(Handled::SessionEstablished)
            }
            MessageType::Master => {
                let hint = MasterHint::read_from(&mut &message.data[..])?;
                let addr = resolve(&hint.host, hint.port)?;
                info!(logger, "redirected to master"; "addr" => %addr);
                servers.set_master(addr);
                // the pending request stays in the replay buffer and is
                // retried against the master
                Ok(Handled::Redirect)
            }
            MessageType::Ping => {
                trace!(logger, "got response to heartbeat");
                Ok(Handled::Continue)
            }
            type_ => {
                let response = Response::parse(type_, &message.data)?;
                self.handle_op_response(type_, response, logger)?;
                Ok(Handled::Continue)
            }
        }
    }

    fn handle_op_response(
        &mut self,
        type_: MessageType,
        response: ParsedResponse,
        logger: &slog::Logger,
    ) -> Result<(), failure::Error> {
        // every operation response consumes the front of the replay buffer,
        // which must agree with it on type
        let sent = self
            .outgoing
            .pop_front()
            .ok_or_else(|| format_err!("response {:?} with empty replay buffer", type_))?;
        if sent.type_ != type_ {
            return Err(format_err!(
                "response type {:?} does not match sent {:?}; stream corrupt",
                type_,
                sent.type_
            ));
        }

        let queue = self
            .pending
            .queue_mut(type_)
            .ok_or_else(|| format_err!("{:?} is not an operation response", type_))?;
        let pending = queue
            .pop_front()
            .ok_or_else(|| format_err!("response {:?} with empty queue", type_))?;

        // sequential creates extend the requested path, everything else
        // echoes it verbatim
        let path_matches = if type_ == MessageType::Create {
            response.path.starts_with(&pending.path)
        } else {
            response.path == pending.path
        };
        if !path_matches {
            debug_assert!(
                path_matches,
                "head of {:?} queue is {:?} but response is for {:?}",
                type_, pending.path, response.path
            );
            return Err(format_err!(
                "response path {:?} does not match queued {:?}; stream corrupt",
                response.path,
                pending.path
            ));
        }

        self.place_watch(type_, &pending.path, pending.watch, response.code, logger);

        debug!(
            logger,
            "handling server response";
            "type" => ?type_, "path" => &response.path, "code" => ?response.code
        );
        let result = if response.code == Code::Ok {
            Ok(response.body)
        } else {
            Err(response.code)
        };
        // if the receiver doesn't care, we don't either
        let _ = pending.tx.send(result);
        Ok(())
    }

    /// Watches are placed when the response arrives. The exception to the
    /// success-only rule is an exists call answered NoNode, which still
    /// leaves a watch for the node's creation.
    fn place_watch(
        &mut self,
        type_: MessageType,
        path: &str,
        watch: Watch,
        code: Code,
        logger: &slog::Logger,
    ) {
        if !watch.requested() {
            return;
        }
        let kind = match (type_, code) {
            (MessageType::Exists, Code::Ok) => Some(WatchKind::Data),
            (MessageType::Exists, Code::NoNode) => Some(WatchKind::Exist),
            (MessageType::GetData, Code::Ok) => Some(WatchKind::Data),
            (MessageType::GetChildren, Code::Ok) => Some(WatchKind::Child),
            _ => None,
        };
        match kind {
            Some(kind) => {
                trace!(logger, "pending watcher turned into real watcher";
                       "path" => path, "kind" => ?kind);
                let watch = match watch {
                    Watch::Global => ClientWatch::Global,
                    Watch::Custom(tx) => ClientWatch::Custom(tx),
                    Watch::None => return,
                };
                self.watches.add(kind, path, watch);
            }
            None => {
                warn!(logger, "pending watcher dropped on error response";
                      "path" => path, "code" => ?code);
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, failure::Error> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format_err!("master hint {}:{} does not resolve", host, port))
}
