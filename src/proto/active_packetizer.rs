use super::message::{SaberMessage, MAX_FRAME};
use crate::client::servers::ServerManager;
use crate::client::session::{Handled, Session};
use crate::WatchedEvent;
use byteorder::{BigEndian, ReadBytesExt};
use failure::format_err;
use futures::channel::mpsc;
use pin_project::pin_project;
use slog::{debug, trace};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The live half of a connection: the stream, the framing buffers, and the
/// heartbeat timer. All protocol decisions live in [`Session`]; this type
/// only moves bytes and keeps the connection warm.
#[pin_project]
pub(super) struct ActivePacketizer<S> {
    #[pin]
    stream: S,

    /// Heartbeat timer.
    #[pin]
    timer: tokio::time::Sleep,
    timeout: time::Duration,

    /// Bytes we have not yet sent.
    outbox: Vec<u8>,

    /// Prefix of outbox that has been sent.
    outstart: usize,

    /// Bytes we have not yet deserialized.
    inbox: Vec<u8>,

    /// Prefix of inbox that has been handled.
    instart: usize,
}

impl<S> ActivePacketizer<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub(super) fn new(stream: S, ping_interval: time::Duration) -> Self {
        ActivePacketizer {
            stream,
            timer: tokio::time::sleep(ping_interval),
            timeout: ping_interval,
            outbox: Vec::new(),
            outstart: 0,
            inbox: Vec::new(),
            instart: 0,
        }
    }

    fn outlen(&self) -> usize {
        self.outbox.len() - self.outstart
    }

    fn inlen(&self) -> usize {
        self.inbox.len() - self.instart
    }

    /// Frame `message` into the outbox; it goes out on the next write poll.
    pub(super) fn enqueue_message(self: Pin<&mut Self>, message: &SaberMessage) {
        message.encode_into(self.project().outbox);
    }

    pub(super) fn enqueue_message_unpin(&mut self, message: &SaberMessage) {
        message.encode_into(&mut self.outbox);
    }

    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        exiting: bool,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>>
    where
        S: AsyncWrite,
    {
        let mut wrote = false;
        while self.outlen() != 0 {
            let mut this = self.as_mut().project();
            let n = futures::ready!(this
                .stream
                .as_mut()
                .poll_write(cx, &this.outbox[*this.outstart..])?);
            wrote = true;
            *this.outstart += n;
            if *this.outstart == this.outbox.len() {
                this.outbox.clear();
                *this.outstart = 0;
            }
        }

        let mut this = self.project();
        if wrote {
            // heartbeat is since last write traffic!
            trace!(logger, "resetting heartbeat timer");
            this.timer
                .as_mut()
                .reset(tokio::time::Instant::now() + *this.timeout);
        }

        futures::ready!(this
            .stream
            .as_mut()
            .poll_flush(cx)
            .map_err(failure::Error::from)?);

        if exiting {
            debug!(logger, "shutting down writer");
            futures::ready!(this.stream.poll_shutdown(cx)?);
        }

        Poll::Ready(Ok(()))
    }

    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        session: &mut Session,
        servers: &mut dyn ServerManager,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>>
    where
        S: AsyncRead,
    {
        loop {
            let mut need = if self.inlen() >= 4 {
                let length = (&mut &self.inbox[self.instart..]).read_u32::<BigEndian>()? as usize;
                if length > MAX_FRAME as usize {
                    return Poll::Ready(Err(format_err!(
                        "frame of {} bytes exceeds limit; stream corrupt",
                        length
                    )));
                }
                length + 4
            } else {
                4
            };
            trace!(logger, "need {} bytes, have {}", need, self.inlen());

            while self.inlen() < need {
                let this = self.as_mut().project();
                let read_from = this.inbox.len();
                this.inbox.resize(*this.instart + need, 0);
                let mut inbox_buf = ReadBuf::new(&mut this.inbox[read_from..]);
                match this.stream.poll_read(cx, &mut inbox_buf)? {
                    Poll::Ready(()) => {
                        let n = inbox_buf.filled().len();
                        this.inbox.truncate(read_from + n);
                        if n == 0 {
                            if self.inlen() != 0 {
                                return Poll::Ready(Err(format_err!(
                                    "connection closed with {} bytes left in buffer: {:x?}",
                                    self.inlen(),
                                    &self.inbox[self.instart..]
                                )));
                            } else {
                                // server closed the connection at a frame boundary
                                debug!(logger, "server closed connection");
                                return Poll::Ready(Ok(()));
                            }
                        }

                        if self.inlen() >= 4 && need == 4 {
                            let length = (&mut &self.inbox[self.instart..])
                                .read_u32::<BigEndian>()?
                                as usize;
                            if length > MAX_FRAME as usize {
                                return Poll::Ready(Err(format_err!(
                                    "frame of {} bytes exceeds limit; stream corrupt",
                                    length
                                )));
                            }
                            need += length;
                        }
                    }
                    Poll::Pending => {
                        this.inbox.truncate(read_from);
                        return Poll::Pending;
                    }
                }
            }

            {
                let mut this = self.as_mut().project();
                let message =
                    SaberMessage::decode(&this.inbox[*this.instart + 4..*this.instart + need])?;
                *this.instart += need;

                match session.handle_message(message, servers, default_watcher, logger)? {
                    Handled::Continue => {}
                    Handled::SessionEstablished => {
                        let interval = session.ping_interval();
                        trace!(
                            logger,
                            "negotiated session timeout";
                            "ping_interval_ms" => interval.as_millis() as u64
                        );
                        *this.timeout = interval;
                        this.timer
                            .as_mut()
                            .reset(tokio::time::Instant::now() + interval);
                    }
                    Handled::Redirect => {
                        return Poll::Ready(Err(format_err!("redirected to master")));
                    }
                    Handled::Expired => {
                        return Poll::Ready(Err(format_err!("session expired")));
                    }
                }
            }

            if self.instart == self.inbox.len() {
                let this = self.as_mut().project();
                this.inbox.clear();
                *this.instart = 0;
            }
        }
    }

    pub(super) fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        exiting: bool,
        session: &mut Session,
        servers: &mut dyn ServerManager,
        default_watcher: &mut mpsc::UnboundedSender<WatchedEvent>,
        logger: &mut slog::Logger,
    ) -> Poll<Result<(), failure::Error>> {
        trace!(logger, "poll_read");
        let r = self
            .as_mut()
            .poll_read(cx, session, servers, default_watcher, logger)?;

        let mut this = self.as_mut().project();
        if let Poll::Ready(()) = this.timer.as_mut().poll(cx) {
            if this.outbox.is_empty() {
                // send a ping!
                SaberMessage::new(super::message::MessageType::Ping, Vec::new())
                    .encode_into(this.outbox);
                trace!(logger, "sending heartbeat");
            } else {
                // already request in flight, so no need to also send heartbeat
            }

            this.timer
                .as_mut()
                .reset(tokio::time::Instant::now() + *this.timeout);
        }

        trace!(logger, "poll_write");
        let w = self.poll_write(cx, exiting, logger)?;

        match (r, w) {
            (Poll::Ready(()), Poll::Ready(())) if exiting => {
                debug!(logger, "packetizer done");
                Poll::Ready(Ok(()))
            }
            (Poll::Ready(()), Poll::Ready(())) => Poll::Ready(Err(format_err!(
                "not exiting, but server closed connection"
            ))),
            (Poll::Ready(()), _) => Poll::Ready(Err(format_err!(
                "outstanding requests, but response channel closed"
            ))),
            _ => Poll::Pending,
        }
    }
}
