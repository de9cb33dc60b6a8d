use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PresenceStatus, RoomId, UserId};

const PROVISIONAL_PREFIX: &str = "temp-";

/// True when `id` was minted client-side and has not yet been replaced by a
/// durable identifier.
pub fn is_provisional_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// One chat message as it travels between client, relay and durable store.
///
/// `id` is either a provisional id (client-generated, `temp-` prefixed) or
/// the identifier assigned by the durable store. `created_at` is
/// client-assigned while provisional and authoritative once confirmed.
/// `sender_avatar_url` is denormalized at creation time and never updated
/// retroactively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar_url: Option<String>,
}

impl MessagePayload {
    /// Builds the optimistic local echo for an outgoing message. The id
    /// carries the creation timestamp and a random suffix so that ids from
    /// the same client session never collide.
    pub fn provisional(
        room_id: RoomId,
        sender_id: UserId,
        body: impl Into<String>,
        sender_avatar_url: Option<String>,
    ) -> Self {
        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!(
                "{PROVISIONAL_PREFIX}{}-{}",
                created_at.timestamp_millis(),
                &suffix[..9]
            ),
            room_id,
            sender_id,
            body: body.into(),
            created_at,
            sender_avatar_url,
        }
    }

    pub fn is_provisional(&self) -> bool {
        is_provisional_id(&self.id)
    }
}

/// Events fanned out from the relay (or synthesized by the change-feed
/// binding) to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireEvent {
    Message {
        message: MessagePayload,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
}

/// One row of the durable status table, as served to change-feed pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// Frames a client sends over a relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Register { user_id: UserId },
    Message { message: MessagePayload },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_ids_are_tagged_and_unique() {
        let room = RoomId::new("r1");
        let sender = UserId::new("u1");
        let a = MessagePayload::provisional(room.clone(), sender.clone(), "hi", None);
        let b = MessagePayload::provisional(room, sender, "hi", None);
        assert!(a.is_provisional());
        assert!(b.is_provisional());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn wire_event_round_trips_tagged_json() {
        let event = WireEvent::Presence {
            user_id: UserId::new("u9"),
            status: PresenceStatus::Online,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "presence");
        assert_eq!(json["payload"]["status"], "online");
        let back: WireEvent = serde_json::from_value(json).expect("deserialize");
        assert!(matches!(
            back,
            WireEvent::Presence {
                status: PresenceStatus::Online,
                ..
            }
        ));
    }
}
