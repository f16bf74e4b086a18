//! The shared broadcast domain.
//!
//! Membership lives behind one mutex and every `join`, `leave` and
//! `broadcast` is a single critical section over it. Delivery only enqueues
//! into each member's mailbox, so the lock is never held across socket I/O and
//! a stalled peer cannot hold up the others.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    frame::Message,
    session::{CloseReason, DeliveryError, SessionHandle, SessionId},
};

#[derive(Debug, Clone, Default)]
pub struct RoomConfig {
    /// Enqueue a notice to the other members whenever someone joins or leaves.
    pub announce_membership: bool,
}

#[derive(Default)]
struct Membership {
    sessions: HashMap<SessionId, SessionHandle>,
    /// Set by [`Room::close_all`]; no session may join afterwards.
    closed: bool,
}

pub struct Room {
    members: Mutex<Membership>,
    config: RoomConfig,
}

impl Room {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            members: Mutex::new(Membership::default()),
            config,
        }
    }

    /// Adds `session` to the room. Returns `false` if it was already a member
    /// or the room has been closed; in the latter case the session is told to
    /// shut down.
    pub async fn join(&self, session: SessionHandle) -> bool {
        let mut members = self.members.lock().await;
        if members.closed {
            session.close_with(CloseReason::Shutdown);
            debug!(session = %session.id(), "room closed, refusing join");
            return false;
        }
        if members.sessions.contains_key(&session.id()) {
            return false;
        }

        if self.config.announce_membership {
            let notice = Message::notice(format!("{} joined the chat", session.label()));
            fan_out(&members.sessions, session.id(), &notice);
        }

        debug!(session = %session.id(), members = members.sessions.len() + 1, "joined room");
        members.sessions.insert(session.id(), session);
        true
    }

    /// Removes the session if present. Leaving twice is a no-op.
    pub async fn leave(&self, id: SessionId) -> Option<SessionHandle> {
        let mut members = self.members.lock().await;
        let session = members.sessions.remove(&id)?;

        if self.config.announce_membership {
            let notice = Message::notice(format!("{} left the chat", session.label()));
            fan_out(&members.sessions, id, &notice);
        }

        debug!(session = %id, members = members.sessions.len(), "left room");
        Some(session)
    }

    /// Enqueues `message` for every member except `sender` and returns how
    /// many members accepted it.
    pub async fn broadcast(&self, sender: SessionId, message: Message) -> usize {
        let members = self.members.lock().await;
        fan_out(&members.sessions, sender, &message)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.sessions.is_empty()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.members.lock().await.sessions.contains_key(&id)
    }

    pub async fn is_closed(&self) -> bool {
        self.members.lock().await.closed
    }

    /// Signals every member to shut down and closes the room to new joins.
    /// Members leave on their own as their loops wind down.
    pub async fn close_all(&self) {
        let mut members = self.members.lock().await;
        members.closed = true;
        for session in members.sessions.values() {
            session.close();
        }
    }
}

fn fan_out(
    members: &HashMap<SessionId, SessionHandle>,
    sender: SessionId,
    message: &Message,
) -> usize {
    let mut delivered = 0;
    for (id, member) in members {
        if *id == sender {
            continue;
        }

        match member.write(message.clone()) {
            Ok(()) => delivered += 1,
            Err(DeliveryError::Full) => {
                // Disconnect slow receivers instead of buffering without bound.
                if member.close_with(CloseReason::MailboxOverflow) {
                    warn!(
                        session = %id,
                        peer = ?member.peer(),
                        "mailbox overflow, disconnecting"
                    );
                }
            }
            Err(DeliveryError::Closed) => {
                debug!(session = %id, "skipping member that is shutting down");
            }
        }
    }
    delivered
}
