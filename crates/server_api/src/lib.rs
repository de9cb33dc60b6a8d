use chrono::{DateTime, Utc};
use shared::{
    domain::{PresenceStatus, RoomId, RoomSummary, UserId, UserIdentity},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, WireEvent},
};
use storage::{Storage, StoredMessage};

/// Storage-backed operation layer shared by every HTTP handler.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn load_messages(
    ctx: &ApiContext,
    room_id: &RoomId,
    after: Option<DateTime<Utc>>,
) -> Result<Vec<MessagePayload>, ApiError> {
    if !ctx.storage.room_exists(room_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "room not found"));
    }
    let messages = ctx
        .storage
        .list_room_messages(room_id, after)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(to_payload).collect())
}

/// Persists a message and returns the confirmed record (durable id and
/// authoritative timestamp). Broadcasting the confirmed record is the
/// caller's concern; this path never touches the relay.
pub async fn create_message(
    ctx: &ApiContext,
    room_id: &RoomId,
    sender_id: &UserId,
    body: &str,
) -> Result<WireEvent, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message body cannot be empty",
        ));
    }
    if !ctx.storage.room_exists(room_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "room not found"));
    }
    if !ctx
        .storage
        .is_room_member(room_id, sender_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "sender is not a room participant",
        ));
    }

    let stored = ctx
        .storage
        .insert_message(room_id, sender_id, body)
        .await
        .map_err(internal)?;
    tracing::debug!(room_id = %room_id, message_id = %stored.id, "message persisted");
    Ok(WireEvent::Message {
        message: to_payload(stored),
    })
}

pub async fn load_room_summaries(
    ctx: &ApiContext,
    user_id: &UserId,
) -> Result<Vec<RoomSummary>, ApiError> {
    ctx.storage
        .list_room_summaries(user_id)
        .await
        .map_err(internal)
}

/// Idempotent: returns the existing room when one already contains exactly
/// these two users.
pub async fn find_or_create_room(
    ctx: &ApiContext,
    user_a: &UserId,
    user_b: &UserId,
) -> Result<RoomId, ApiError> {
    if user_a == user_b {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a direct-message room needs two distinct users",
        ));
    }
    for user in [user_a, user_b] {
        if !ctx.storage.user_exists(user).await.map_err(internal)? {
            return Err(ApiError::new(
                ErrorCode::NotFound,
                format!("user {user} not found"),
            ));
        }
    }
    ctx.storage
        .find_or_create_room(user_a, user_b)
        .await
        .map_err(internal)
}

pub async fn search_users(
    ctx: &ApiContext,
    query: &str,
) -> Result<Vec<UserIdentity>, ApiError> {
    ctx.storage.search_users(query).await.map_err(internal)
}

pub async fn get_user(ctx: &ApiContext, user_id: &UserId) -> Result<UserIdentity, ApiError> {
    ctx.storage
        .get_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "user not found"))
}

pub async fn create_user(
    ctx: &ApiContext,
    name: &str,
    email: &str,
    avatar_url: Option<&str>,
) -> Result<UserIdentity, ApiError> {
    if name.trim().is_empty() || email.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "name and email are required",
        ));
    }
    ctx.storage
        .create_user(name.trim(), email.trim(), avatar_url)
        .await
        .map_err(internal)
}

pub async fn user_statuses(
    ctx: &ApiContext,
) -> Result<Vec<(UserId, PresenceStatus)>, ApiError> {
    ctx.storage.list_user_statuses().await.map_err(internal)
}

/// Used by the change-feed transport strategy, where presence registration is
/// a write against the durable user record instead of a connection event.
pub async fn set_user_status(
    ctx: &ApiContext,
    user_id: &UserId,
    status: PresenceStatus,
) -> Result<(), ApiError> {
    if !ctx.storage.user_exists(user_id).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, "user not found"));
    }
    ctx.storage
        .set_user_status(user_id, status)
        .await
        .map_err(internal)
}

fn to_payload(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: stored.id,
        room_id: stored.room_id,
        sender_id: stored.sender_id,
        body: stored.body,
        created_at: stored.created_at,
        sender_avatar_url: stored.sender_avatar_url,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
