use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::str::FromStr;
use uuid::Uuid;

use shared::domain::{PresenceStatus, RoomId, RoomSummary, UserId, UserIdentity};

/// SQLite-backed durable store for users, two-party rooms and messages.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub sender_avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(
        &self,
        name: &str,
        email: &str,
        avatar_url: Option<&str>,
    ) -> Result<UserIdentity> {
        let id = Uuid::new_v4().to_string();
        let rec = sqlx::query(
            "INSERT INTO users (id, name, email, avatar_url) VALUES (?, ?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET name=excluded.name
             RETURNING id, name, email, avatar_url",
        )
        .bind(&id)
        .bind(name)
        .bind(email)
        .bind(avatar_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserIdentity {
            id: UserId::new(rec.get::<String, _>(0)),
            name: rec.get::<String, _>(1),
            email: rec.get::<String, _>(2),
            avatar_url: rec.get::<Option<String>, _>(3),
        })
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<Option<UserIdentity>> {
        let row = sqlx::query("SELECT id, name, email, avatar_url FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserIdentity {
            id: UserId::new(r.get::<String, _>(0)),
            name: r.get::<String, _>(1),
            email: r.get::<String, _>(2),
            avatar_url: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn user_exists(&self, user_id: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Case-insensitive substring match on name or email.
    pub async fn search_users(&self, query: &str) -> Result<Vec<UserIdentity>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let rows = sqlx::query(
            "SELECT id, name, email, avatar_url FROM users
             WHERE LOWER(name) LIKE ? OR LOWER(email) LIKE ?
             ORDER BY name",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserIdentity {
                id: UserId::new(r.get::<String, _>(0)),
                name: r.get::<String, _>(1),
                email: r.get::<String, _>(2),
                avatar_url: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    pub async fn set_user_status(&self, user_id: &UserId, status: PresenceStatus) -> Result<()> {
        sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_user_statuses(&self) -> Result<Vec<(UserId, PresenceStatus)>> {
        let rows = sqlx::query("SELECT id, status FROM users")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    UserId::new(r.get::<String, _>(0)),
                    parse_status(&r.get::<String, _>(1)),
                )
            })
            .collect())
    }

    /// Returns the existing room containing exactly these two users, or
    /// creates one. Idempotent: a second call with the same pair returns the
    /// same room id.
    pub async fn find_or_create_room(&self, user_a: &UserId, user_b: &UserId) -> Result<RoomId> {
        let existing = sqlx::query(
            "SELECT rm1.room_id FROM room_members rm1
             INNER JOIN room_members rm2 ON rm2.room_id = rm1.room_id
             WHERE rm1.user_id = ? AND rm2.user_id = ?
             LIMIT 1",
        )
        .bind(user_a.as_str())
        .bind(user_b.as_str())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok(RoomId::new(row.get::<String, _>(0)));
        }

        let room_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO rooms (id, owner_user_id) VALUES (?, ?)")
            .bind(&room_id)
            .bind(user_a.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?), (?, ?)")
            .bind(&room_id)
            .bind(user_a.as_str())
            .bind(&room_id)
            .bind(user_b.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(RoomId::new(room_id))
    }

    pub async fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM rooms WHERE id = ?")
            .bind(room_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn is_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM room_members WHERE room_id = ? AND user_id = ?")
            .bind(room_id.as_str())
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Rooms the user participates in, each with the other participant and
    /// the latest message (if any) denormalized for the sidebar.
    pub async fn list_room_summaries(&self, user_id: &UserId) -> Result<Vec<RoomSummary>> {
        let rows = sqlx::query(
            "SELECT r.id, u.id, u.name, u.email, u.avatar_url
             FROM rooms r
             INNER JOIN room_members me ON me.room_id = r.id AND me.user_id = ?
             INNER JOIN room_members other ON other.room_id = r.id AND other.user_id <> ?
             INNER JOIN users u ON u.id = other.user_id
             ORDER BY r.created_at DESC",
        )
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let room_id: String = row.get(0);
            let last = sqlx::query(
                "SELECT body, created_at FROM messages
                 WHERE room_id = ?
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
            )
            .bind(&room_id)
            .fetch_optional(&self.pool)
            .await?;

            let (preview, at) = match last {
                Some(m) => (
                    Some(m.get::<String, _>(0)),
                    Some(m.get::<DateTime<Utc>, _>(1)),
                ),
                None => (None, None),
            };

            summaries.push(RoomSummary {
                room_id: RoomId::new(room_id),
                other_participant: UserIdentity {
                    id: UserId::new(row.get::<String, _>(1)),
                    name: row.get::<String, _>(2),
                    email: row.get::<String, _>(3),
                    avatar_url: row.get::<Option<String>, _>(4),
                },
                last_message_preview: preview,
                last_message_at: at,
            });
        }
        Ok(summaries)
    }

    /// Persists a message, assigning the durable id and the authoritative
    /// timestamp. The sender's avatar is denormalized at creation time.
    pub async fn insert_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<StoredMessage> {
        let avatar: Option<String> = sqlx::query("SELECT avatar_url FROM users WHERE id = ?")
            .bind(sender_id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .and_then(|r| r.get::<Option<String>, _>(0));

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO messages (id, room_id, sender_id, body, sender_avatar_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(room_id.as_str())
        .bind(sender_id.as_str())
        .bind(body)
        .bind(&avatar)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(StoredMessage {
            id,
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            body: body.to_string(),
            sender_avatar_url: avatar,
            created_at,
        })
    }

    /// Messages for one room ascending by creation time, insertion order as
    /// tie-break. `after` scopes the result for change-feed polling; the
    /// cursor is inclusive so a second row persisted in the same millisecond
    /// as an already-observed one is never skipped. Pollers re-receive the
    /// boundary row and rely on id-keyed deduplication.
    pub async fn list_room_messages(
        &self,
        room_id: &RoomId,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query(
                    "SELECT id, room_id, sender_id, body, sender_avatar_url, created_at
                     FROM messages
                     WHERE room_id = ? AND created_at >= ?
                     ORDER BY created_at ASC, rowid ASC",
                )
                .bind(room_id.as_str())
                .bind(cursor)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, room_id, sender_id, body, sender_avatar_url, created_at
                     FROM messages
                     WHERE room_id = ?
                     ORDER BY created_at ASC, rowid ASC",
                )
                .bind(room_id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                id: r.get::<String, _>(0),
                room_id: RoomId::new(r.get::<String, _>(1)),
                sender_id: UserId::new(r.get::<String, _>(2)),
                body: r.get::<String, _>(3),
                sender_avatar_url: r.get::<Option<String>, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }
}

fn parse_status(raw: &str) -> PresenceStatus {
    match raw {
        "online" => PresenceStatus::Online,
        _ => PresenceStatus::Offline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Storage, UserIdentity, UserIdentity) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let alice = storage
            .create_user("Alice", "alice@example.com", Some("https://cdn/a.png"))
            .await
            .expect("alice");
        let bob = storage
            .create_user("Bob", "bob@example.com", None)
            .await
            .expect("bob");
        (storage, alice, bob)
    }

    #[tokio::test]
    async fn find_or_create_room_is_idempotent() {
        let (storage, alice, bob) = setup().await;
        let first = storage
            .find_or_create_room(&alice.id, &bob.id)
            .await
            .expect("room");
        let second = storage
            .find_or_create_room(&alice.id, &bob.id)
            .await
            .expect("room again");
        assert_eq!(first, second);

        let summaries = storage
            .list_room_summaries(&alice.id)
            .await
            .expect("summaries");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].other_participant.id, bob.id);
    }

    #[tokio::test]
    async fn search_users_is_case_insensitive_on_name_and_email() {
        let (storage, alice, bob) = setup().await;
        let by_name = storage.search_users("aLiC").await.expect("search");
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, alice.id);

        let by_email = storage.search_users("BOB@").await.expect("search");
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].id, bob.id);
    }

    #[tokio::test]
    async fn messages_list_ascending_with_inclusive_after_cursor() {
        let (storage, alice, bob) = setup().await;
        let room = storage
            .find_or_create_room(&alice.id, &bob.id)
            .await
            .expect("room");

        let first = storage
            .insert_message(&room, &alice.id, "one")
            .await
            .expect("insert");
        let second = storage
            .insert_message(&room, &bob.id, "two")
            .await
            .expect("insert");

        let all = storage
            .list_room_messages(&room, None)
            .await
            .expect("list");
        assert_eq!(
            all.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        // Avatar is denormalized at creation time.
        assert_eq!(all[0].sender_avatar_url.as_deref(), Some("https://cdn/a.png"));

        // The cursor is inclusive: a row sharing the cursor timestamp is
        // re-delivered rather than lost, even when both rows landed in the
        // same millisecond.
        let tail = storage
            .list_room_messages(&room, Some(first.created_at))
            .await
            .expect("tail");
        assert!(tail.iter().any(|m| m.id == first.id));
        assert!(tail.iter().any(|m| m.id == second.id));

        let beyond = storage
            .list_room_messages(&room, Some(second.created_at))
            .await
            .expect("beyond");
        assert!(beyond.iter().any(|m| m.id == second.id));
    }

    #[tokio::test]
    async fn statuses_default_offline_and_update() {
        let (storage, alice, _) = setup().await;
        let statuses = storage.list_user_statuses().await.expect("statuses");
        assert!(statuses
            .iter()
            .all(|(_, status)| *status == PresenceStatus::Offline));

        storage
            .set_user_status(&alice.id, PresenceStatus::Online)
            .await
            .expect("set");
        let statuses = storage.list_user_statuses().await.expect("statuses");
        assert!(statuses
            .iter()
            .any(|(id, status)| *id == alice.id && *status == PresenceStatus::Online));
    }

    #[tokio::test]
    async fn summaries_include_latest_message_preview() {
        let (storage, alice, bob) = setup().await;
        let room = storage
            .find_or_create_room(&alice.id, &bob.id)
            .await
            .expect("room");

        let empty = storage
            .list_room_summaries(&alice.id)
            .await
            .expect("summaries");
        assert!(empty[0].last_message_preview.is_none());

        storage
            .insert_message(&room, &bob.id, "hello there")
            .await
            .expect("insert");
        let summaries = storage
            .list_room_summaries(&alice.id)
            .await
            .expect("summaries");
        assert_eq!(
            summaries[0].last_message_preview.as_deref(),
            Some("hello there")
        );
        assert!(summaries[0].last_message_at.is_some());
    }
}
