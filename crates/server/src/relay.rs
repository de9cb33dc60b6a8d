//! Process-wide fan-out hub. A single dispatch task owns the session table;
//! handlers talk to it through a clonable handle over an mpsc channel, so no
//! lock is ever taken on the hot broadcast path.
//!
//! Delivery is global: every event goes to every connected session,
//! including the sender's own, and clients filter by room id. Preserved as
//! documented behavior of the deployed design.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::{
    domain::{PresenceStatus, UserId},
    protocol::WireEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

/// Where a session's outbound events go. For websocket sessions this feeds
/// the per-connection writer task.
pub type EventSink = mpsc::UnboundedSender<WireEvent>;

enum Command {
    Connect {
        session: SessionId,
        sink: EventSink,
    },
    Register {
        session: SessionId,
        user_id: UserId,
    },
    Broadcast {
        event: WireEvent,
    },
    Disconnect {
        session: SessionId,
    },
}

struct SessionEntry {
    user_id: Option<UserId>,
    sink: EventSink,
}

#[derive(Clone)]
pub struct Relay {
    commands: mpsc::UnboundedSender<Command>,
    next_session: Arc<AtomicU64>,
}

impl Relay {
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self {
            commands,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a session sink. No presence event is emitted until the
    /// session registers a user id.
    pub fn connect(&self, sink: EventSink) -> SessionId {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let _ = self.commands.send(Command::Connect { session, sink });
        session
    }

    /// Records the user behind a session and broadcasts an Online presence
    /// event to all sessions.
    pub fn register(&self, session: SessionId, user_id: UserId) {
        let _ = self.commands.send(Command::Register { session, user_id });
    }

    /// Fans `event` out verbatim to every registered session, the
    /// originating one included; the sender reconciles its own echo by id.
    pub fn broadcast(&self, event: WireEvent) {
        let _ = self.commands.send(Command::Broadcast { event });
    }

    /// Drops the session. If a user was registered on it, an Offline
    /// presence event is broadcast; never-registered handles emit nothing.
    pub fn disconnect(&self, session: SessionId) {
        let _ = self.commands.send(Command::Disconnect { session });
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sessions: HashMap<SessionId, SessionEntry> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Connect { session, sink } => {
                sessions.insert(
                    session,
                    SessionEntry {
                        user_id: None,
                        sink,
                    },
                );
                debug!(session = session.0, "relay session connected");
            }
            Command::Register { session, user_id } => {
                let Some(entry) = sessions.get_mut(&session) else {
                    continue;
                };
                entry.user_id = Some(user_id.clone());
                info!(session = session.0, user_id = %user_id, "relay session registered");
                fan_out(
                    &sessions,
                    WireEvent::Presence {
                        user_id,
                        status: PresenceStatus::Online,
                    },
                );
            }
            Command::Broadcast { event } => fan_out(&sessions, event),
            Command::Disconnect { session } => {
                let Some(entry) = sessions.remove(&session) else {
                    continue;
                };
                debug!(session = session.0, "relay session disconnected");
                if let Some(user_id) = entry.user_id {
                    fan_out(
                        &sessions,
                        WireEvent::Presence {
                            user_id,
                            status: PresenceStatus::Offline,
                        },
                    );
                }
            }
        }
    }
}

// Best-effort, at-most-once: a session whose sink is gone is skipped and
// never retried; delivery to the remaining sessions continues.
fn fan_out(sessions: &HashMap<SessionId, SessionEntry>, event: WireEvent) {
    for entry in sessions.values() {
        let _ = entry.sink.send(event.clone());
    }
}
