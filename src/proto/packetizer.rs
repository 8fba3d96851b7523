use super::active_packetizer::ActivePacketizer;
use super::codes::Code;
use super::message::{MessageType, SaberMessage};
use super::request::Request;
use super::response::Response;
use super::watch::Watch;
use super::SaberTransport;
use crate::client::servers::ServerManager;
use crate::client::session::Session;
use crate::WatchedEvent;
use failure::format_err;
use futures::{
    channel::{mpsc, oneshot},
    future::Either,
    ready, FutureExt, StreamExt,
};
use pin_project::pin_project;
use slog::{debug, error, info, trace};
use std::{
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

/// The send loop: owns the connection state machine, the session queues,
/// and the server rotation. Users talk to it through an [`Enqueuer`].
#[pin_project]
pub(crate) struct Packetizer<S>
where
    S: SaberTransport,
{
    /// Current connection state.
    #[pin]
    state: PacketizerState<S>,

    /// Per-op queues, replay buffer, watches, session identity.
    session: Session,

    /// Which endpoint to dial next.
    servers: Box<dyn ServerManager>,

    /// Watcher to send session-state and node events to.
    default_watcher: mpsc::UnboundedSender<WatchedEvent>,

    /// Incoming requests.
    rx: mpsc::UnboundedReceiver<Submitted>,

    /// When the current disconnected stretch began.
    disconnected_at: Option<Instant>,

    logger: slog::Logger,

    exiting: bool,
}

type Submitted = (Request, Watch, oneshot::Sender<Result<Response, Code>>);

impl<S> Packetizer<S>
where
    S: SaberTransport,
{
    // Enqueuer is the entry point for submitting requests to Packetizer
    #[allow(clippy::new_ret_no_self)]
    pub(crate) fn new(
        mut servers: Box<dyn ServerManager>,
        session: Session,
        log: slog::Logger,
        default_watcher: mpsc::UnboundedSender<WatchedEvent>,
    ) -> Enqueuer {
        let (tx, rx) = mpsc::unbounded();

        let addr = servers.next();
        let limit = Duration::from_millis(u64::from(session.timeout_ms));
        let exitlogger = log.clone();
        tokio::spawn(
            Packetizer {
                state: PacketizerState::Reconnecting(connect::<S>(addr, None, limit)),
                session,
                servers,
                default_watcher,
                rx,
                disconnected_at: None,
                logger: log,
                exiting: false,
            }
            .map(move |r| {
                if let Err(e) = r {
                    error!(exitlogger, "packetizer exiting: {:?}", e);
                }
            }),
        );

        Enqueuer(tx)
    }
}

fn connect<S: SaberTransport>(
    addr: SocketAddr,
    delay: Option<Duration>,
    limit: Duration,
) -> Pin<Box<dyn Future<Output = Result<S, failure::Error>> + Send + 'static>> {
    Box::pin(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match tokio::time::timeout(limit, S::connect(addr)).await {
            Ok(connected) => connected.map_err(failure::Error::from),
            Err(_) => Err(format_err!("connect to {} timed out", addr)),
        }
    })
}

#[pin_project(project = PacketizerStateProj)]
enum PacketizerState<S> {
    Connected(#[pin] ActivePacketizer<S>),
    Reconnecting(Pin<Box<dyn Future<Output = Result<S, failure::Error>> + Send + 'static>>),
}

impl<S> PacketizerState<S>
where
    S: SaberTransport,
{
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        exiting: bool,
        session: &mut Session,
        servers: &mut dyn ServerManager,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>> {
        let stream = match self.as_mut().project() {
            PacketizerStateProj::Connected(ref mut ap) => {
                return ap
                    .as_mut()
                    .poll(cx, exiting, session, servers, default_watcher, logger)
            }
            PacketizerStateProj::Reconnecting(ref mut c) => ready!(c.as_mut().poll(cx)?),
        };

        // we are now connected!
        info!(logger, "connection established"; "session_id" => session.session_id);
        servers.on_connection();
        let mut ap = ActivePacketizer::new(stream, session.ping_interval());
        trace!(logger, "about to handshake");
        for message in session.handshake_messages() {
            ap.enqueue_message_unpin(&message);
        }
        self.set(PacketizerState::Connected(ap));
        self.poll(cx, exiting, session, servers, default_watcher, logger)
    }
}

impl<S> Packetizer<S>
where
    S: SaberTransport,
{
    fn poll_enqueue(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), ()>> {
        let mut this = self.project();
        while let PacketizerStateProj::Connected(ref mut ap) = this.state.as_mut().project() {
            let (request, watch, tx) = match ready!(this.rx.poll_next_unpin(cx)) {
                Some(submitted) => submitted,
                None => return Poll::Ready(Err(())),
            };
            if let Request::Close = request {
                // close() resolves as soon as the frame is on its way out
                let _ = tx.send(Ok(Response::Empty));
                return Poll::Ready(Err(()));
            }
            debug!(this.logger, "enqueueing request {:?}", request;
                   "type" => ?request.message_type());
            let message = this.session.enqueue_op(request, watch, tx);
            ap.as_mut().enqueue_message(&message);
        }
        Poll::Pending
    }
}

impl<S> Future for Packetizer<S>
where
    S: SaberTransport,
{
    type Output = Result<(), failure::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        trace!(self.logger, "packetizer polled");
        if !self.exiting {
            trace!(self.logger, "poll_enqueue");
            match self.as_mut().poll_enqueue(cx) {
                Poll::Ready(Ok(())) | Poll::Pending => {}
                Poll::Ready(Err(())) => {
                    let this = self.as_mut().project();
                    // no more requests will be enqueued
                    *this.exiting = true;

                    if let PacketizerStateProj::Connected(ref mut ap) = this.state.project() {
                        // let the server tear down the session now rather
                        // than waiting for it to time out
                        ap.as_mut()
                            .enqueue_message(&SaberMessage::new(MessageType::Close, Vec::new()));
                    }
                }
            }
        }

        let mut this = self.as_mut().project();
        match this.state.as_mut().poll(
            cx,
            *this.exiting,
            this.session,
            &mut **this.servers,
            this.default_watcher,
            this.logger,
        ) {
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(v)),
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                if this.session.expired {
                    // terminal: pending requests were already failed with
                    // SessionExpired and the default watcher notified
                    return Poll::Ready(Err(format_err!("session expired")));
                }

                if *this.exiting {
                    debug!(this.logger, "connection lost during exit; not reconnecting");
                    return Poll::Ready(Ok(()));
                }

                let was_connected =
                    matches!(&*this.state, PacketizerState::Connected(_));
                if was_connected {
                    info!(this.logger, "connection lost; reconnecting";
                          "session_id" => this.session.session_id,
                          "error" => %e,
                    );
                    this.session.on_disconnect(this.default_watcher);
                    *this.disconnected_at = Some(Instant::now());
                } else {
                    debug!(this.logger, "connect attempt failed: {:?}", e);
                }

                // a session that cannot reach any server within its timeout
                // cannot retry its in-flight requests transparently
                if let Some(since) = *this.disconnected_at {
                    if since.elapsed() >= Duration::from_millis(u64::from(this.session.timeout_ms))
                    {
                        if this.session.has_pending() {
                            info!(
                                this.logger,
                                "reconnect deadline passed; failing pending requests"
                            );
                            this.session.fail_pending(Code::ConnectionLoss);
                        }
                        // requests still waiting to be picked up share the
                        // same fate
                        while let Poll::Ready(Some((_, _, tx))) =
                            this.rx.poll_next_unpin(cx)
                        {
                            let _ = tx.send(Err(Code::ConnectionLoss));
                        }
                    }
                }

                let limit = Duration::from_millis(u64::from(this.session.timeout_ms));
                let addr = this.servers.next();
                trace!(this.logger, "connecting"; "addr" => %addr);
                let retry = connect::<S>(addr, Some(Duration::from_millis(1)), limit);
                this.state.set(PacketizerState::Reconnecting(retry));
                self.poll(cx)
            }
        }
    }
}

/// Handle for submitting requests to the send loop.
#[derive(Clone, Debug)]
pub(crate) struct Enqueuer(mpsc::UnboundedSender<Submitted>);

impl Enqueuer {
    pub(crate) fn enqueue(
        &self,
        request: Request,
        watch: Watch,
    ) -> impl Future<Output = Result<Result<Response, Code>, failure::Error>> {
        let (tx, rx) = oneshot::channel();
        match self.0.unbounded_send((request, watch, tx)) {
            Ok(()) => {
                Either::Left(rx.map(|r| {
                    r.map_err(|e| format_err!("failed to enqueue new request: {:?}", e))
                }))
            }
            Err(e) => Either::Right(future::ready(Err(format_err!(
                "failed to enqueue new request: {:?}",
                e
            )))),
        }
    }
}
