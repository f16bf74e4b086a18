//! One connected participant and its two I/O loops.
//!
//! A [`Session`] owns both halves of its connection. Once started it joins the
//! [`Room`], then runs a read loop (frames in, broadcasts out) and a write loop
//! (mailbox in, frames out) as separate tasks. The only thing the two loops
//! share is the session state, published on a `watch` channel, which doubles
//! as the cooperative cancellation signal.
//!
//! Other sessions never touch the socket. They reach a session through its
//! cloneable [`SessionHandle`], whose [`SessionHandle::write`] only enqueues
//! into the bounded mailbox.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionError, FrameReader, FrameWriter},
    frame::{FrameError, Message},
    room::Room,
};

/// Process-unique identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn is_stopping(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Why a session left the [`SessionState::Active`] state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Protocol,
    ReadFailed,
    WriteFailed,
    Shutdown,
    MailboxOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("mailbox is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

struct Lifecycle {
    state: watch::Sender<SessionState>,
    reason: OnceLock<CloseReason>,
}

/// Cheap, cloneable reference to a session, as held by the [`Room`].
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    mailbox: mpsc::Sender<Message>,
    lifecycle: Arc<Lifecycle>,
}

impl SessionHandle {
    /// Creates a handle plus the receiving end of its mailbox.
    ///
    /// [`Session::new`] uses this for socket-backed sessions; it is also the
    /// way to put an in-process participant into a [`Room`].
    pub fn new(
        peer: Option<SocketAddr>,
        mailbox_capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (mailbox, inbox) = mpsc::channel(mailbox_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Connecting);
        let handle = Self {
            id: SessionId::next(),
            peer,
            mailbox,
            lifecycle: Arc::new(Lifecycle {
                state,
                reason: OnceLock::new(),
            }),
        };
        (handle, inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.lifecycle.state.borrow()
    }

    /// True once the session has joined the room and until it starts closing.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The reason recorded by the first close, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.reason.get().copied()
    }

    /// Enqueues `message` for the write loop without waiting.
    pub fn write(&self, message: Message) -> Result<(), DeliveryError> {
        if self.state().is_stopping() {
            return Err(DeliveryError::Closed);
        }
        self.mailbox.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Asks both loops to stop. Calling it again has no effect.
    pub fn close(&self) {
        self.close_with(CloseReason::Shutdown);
    }

    /// Moves the session to [`SessionState::Closing`]. Returns `false` when it
    /// was already closing; the first reason wins.
    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        let transitioned = self.lifecycle.state.send_if_modified(|state| {
            if state.is_stopping() {
                return false;
            }
            *state = SessionState::Closing;
            true
        });
        if transitioned {
            let _ = self.lifecycle.reason.set(reason);
        }
        transitioned
    }

    /// Name used in join/leave notices.
    pub(crate) fn label(&self) -> String {
        match self.peer {
            Some(peer) => peer.to_string(),
            None => format!("session {}", self.id),
        }
    }

    fn activate(&self) -> bool {
        self.lifecycle.state.send_if_modified(|state| {
            if *state != SessionState::Connecting {
                return false;
            }
            *state = SessionState::Active;
            true
        })
    }

    fn finish(&self) {
        self.lifecycle.state.send_replace(SessionState::Closed);
    }

    /// Resolves once the session has left the active state.
    async fn stopped(&self) {
        let mut state = self.lifecycle.state.subscribe();
        // The sender lives inside `self`, so the channel cannot close here.
        let _ = state.wait_for(|state| state.is_stopping()).await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Summary logged and returned when a session ends.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub received: u64,
    pub sent: u64,
    pub reason: CloseReason,
}

pub struct Session<R, W> {
    handle: SessionHandle,
    inbox: mpsc::Receiver<Message>,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    room: Arc<Room>,
}

impl Session<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream, room: Arc<Room>, mailbox_capacity: usize) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer, room, mailbox_capacity)
    }
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
        room: Arc<Room>,
        mailbox_capacity: usize,
    ) -> Self {
        let (handle, inbox) = SessionHandle::new(peer, mailbox_capacity);
        Self {
            handle,
            inbox,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            room,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Runs the session on its own task.
    pub fn start(self) -> JoinHandle<SessionReport> {
        tokio::spawn(self.run())
    }

    /// Joins the room, drives both loops until either stops, then leaves.
    pub async fn run(self) -> SessionReport {
        let Session {
            handle,
            inbox,
            reader,
            writer,
            room,
        } = self;

        // A closed room refuses the join and moves the handle to `Closing`, so
        // both loops below return straight away.
        if room.join(handle.clone()).await && handle.activate() {
            info!(session = %handle.id(), peer = ?handle.peer(), "session active");
        }

        let read_task = tokio::spawn(read_loop(reader, handle.clone(), Arc::clone(&room)));
        let write_task = tokio::spawn(write_loop(writer, inbox, handle.clone()));
        let (received, sent) = tokio::join!(read_task, write_task);

        // A panicking loop still has to release the other one.
        handle.close_with(CloseReason::Shutdown);
        room.leave(handle.id()).await;
        handle.finish();

        let report = SessionReport {
            id: handle.id(),
            peer: handle.peer(),
            received: loop_count(received, "read"),
            sent: loop_count(sent, "write"),
            reason: handle.close_reason().unwrap_or(CloseReason::Shutdown),
        };
        info!(
            session = %report.id,
            peer = ?report.peer,
            received = report.received,
            sent = report.sent,
            reason = ?report.reason,
            "session closed"
        );
        report
    }
}

fn loop_count(result: Result<u64, tokio::task::JoinError>, name: &str) -> u64 {
    match result {
        Ok(count) => count,
        Err(err) => {
            warn!(error = ?err, "{name} loop panicked");
            0
        }
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, handle: SessionHandle, room: Arc<Room>) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut received = 0;
    loop {
        let result = select! {
            biased;
            _ = handle.stopped() => break,
            result = reader.read_message() => result,
        };

        match result {
            Ok(message) => {
                received += 1;
                room.broadcast(handle.id(), message).await;
            }
            Err(err) => {
                handle.close_with(read_close_reason(&handle, &err));
                break;
            }
        }
    }
    received
}

fn read_close_reason(handle: &SessionHandle, err: &ConnectionError) -> CloseReason {
    match err {
        err if err.is_closed() => {
            debug!(session = %handle.id(), error = %err, "peer closed connection");
            CloseReason::PeerClosed
        }
        ConnectionError::Protocol(FrameError::Empty | FrameError::Oversized { .. }) => {
            warn!(session = %handle.id(), error = ?err, "rejected frame header");
            CloseReason::Protocol
        }
        ConnectionError::Protocol(_) => {
            warn!(session = %handle.id(), error = ?err, "malformed frame");
            CloseReason::Protocol
        }
        _ => {
            warn!(session = %handle.id(), error = ?err, "read failed");
            CloseReason::ReadFailed
        }
    }
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut inbox: mpsc::Receiver<Message>,
    handle: SessionHandle,
) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    loop {
        let message = select! {
            biased;
            _ = handle.stopped() => break,
            message = inbox.recv() => message,
        };
        // The handle keeps a sender alive, so the mailbox never drains to None here.
        let Some(message) = message else { break };

        let result = select! {
            biased;
            _ = handle.stopped() => break,
            result = writer.write_message(&message) => result,
        };
        if let Err(err) = result {
            if err.is_closed() {
                debug!(session = %handle.id(), error = %err, "peer went away during write");
            } else {
                warn!(session = %handle.id(), error = ?err, "write failed");
            }
            handle.close_with(CloseReason::WriteFailed);
            break;
        }
        sent += 1;
    }

    inbox.close();
    if let Err(err) = writer.shutdown().await {
        debug!(session = %handle.id(), error = %err, "socket shutdown failed");
    }
    sent
}
