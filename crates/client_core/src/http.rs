//! Thin REST client for the chat server. Read paths are tolerant: a
//! malformed or unexpectedly-shaped response degrades to an empty list with
//! a warning, so one bad payload never takes down a room view. Write paths
//! surface their failures so the caller can mark delivery state.

use serde_json::Value;
use shared::domain::{PresenceStatus, RoomId, RoomSummary, UserId, UserIdentity};
use shared::protocol::{MessagePayload, PresenceRecord};
use tracing::warn;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Loads the message history for a room. Any failure (network, non-2xx,
    /// non-array body) yields an empty history rather than an error.
    pub async fn load_messages(&self, room_id: &RoomId) -> Vec<MessagePayload> {
        let url = format!("{}/rooms/{}/messages", self.base_url, room_id);
        self.tolerant_list(&url, &[], "message history").await
    }

    /// Loads messages created at or after `cursor`, for change-feed polling.
    /// The boundary row comes back again by design; the caller's id-keyed
    /// merge absorbs it. Same tolerance as `load_messages`.
    pub async fn load_messages_after(
        &self,
        room_id: &RoomId,
        cursor: chrono::DateTime<chrono::Utc>,
    ) -> Vec<MessagePayload> {
        let url = format!("{}/rooms/{}/messages", self.base_url, room_id);
        self.tolerant_list(&url, &[("after", cursor.to_rfc3339())], "message feed")
            .await
    }

    /// Durable message write. This is the one call whose failure the caller
    /// must observe, so it returns an error instead of degrading.
    pub async fn create_message(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        body: &str,
    ) -> Result<MessagePayload, ClientError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "room_id": room_id,
                "sender_id": sender_id,
                "body": body,
            }))
            .send()
            .await
            .map_err(|err| ClientError::DurableWriteFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::DurableWriteFailed(format!(
                "server returned {}",
                response.status()
            )));
        }
        response
            .json::<MessagePayload>()
            .await
            .map_err(|err| ClientError::MalformedServerResponse(err.to_string()))
    }

    pub async fn find_or_create_room(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<RoomId, ClientError> {
        #[derive(serde::Deserialize)]
        struct RoomResponse {
            room_id: RoomId,
        }

        let url = format!("{}/rooms", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "user_id_a": user_a,
                "user_id_b": user_b,
            }))
            .send()
            .await
            .map_err(|err| ClientError::TransportUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::MalformedServerResponse(format!(
                "room lookup returned {}",
                response.status()
            )));
        }
        let parsed: RoomResponse = response
            .json()
            .await
            .map_err(|err| ClientError::MalformedServerResponse(err.to_string()))?;
        Ok(parsed.room_id)
    }

    pub async fn room_summaries(&self, user_id: &UserId) -> Vec<RoomSummary> {
        let url = format!("{}/rooms", self.base_url);
        self.tolerant_list(&url, &[("user_id", user_id.to_string())], "room summaries")
            .await
    }

    pub async fn search_users(&self, query: &str) -> Vec<UserIdentity> {
        let url = format!("{}/users", self.base_url);
        self.tolerant_list(&url, &[("query", query.to_string())], "user search")
            .await
    }

    pub async fn user_statuses(&self) -> Vec<PresenceRecord> {
        let url = format!("{}/users/statuses", self.base_url);
        self.tolerant_list(&url, &[], "user statuses").await
    }

    pub async fn set_user_status(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
    ) -> Result<(), ClientError> {
        let url = format!("{}/users/{}/status", self.base_url, user_id);
        let response = self
            .http
            .put(&url)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|err| ClientError::TransportUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClientError::DurableWriteFailed(format!(
                "status update returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetches `url` and deserializes a JSON array of `T`, degrading to an
    /// empty vec on any failure. Query values go through reqwest's encoder
    /// so reserved characters in user input survive the round trip. Elements
    /// that fail to deserialize are dropped individually so one bad row does
    /// not discard the rest.
    async fn tolerant_list<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
        what: &str,
    ) -> Vec<T> {
        let response = match self.http.get(url).query(params).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, %err, "failed to fetch {what}; treating as empty");
                return Vec::new();
            }
        };
        if !response.status().is_success() {
            warn!(%url, status = %response.status(), "{what} request failed; treating as empty");
            return Vec::new();
        }
        let value: Value = match response.json().await {
            Ok(value) => value,
            Err(err) => {
                warn!(%url, %err, "{what} response was not JSON; treating as empty");
                return Vec::new();
            }
        };
        let Value::Array(items) = value else {
            warn!(%url, "{what} response was not an array; treating as empty");
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<T>(item) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    warn!(%url, %err, "skipping malformed {what} element");
                    None
                }
            })
            .collect()
    }
}
