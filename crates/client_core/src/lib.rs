//! Client-side synchronization core for the chat service: ordered message
//! stores, the optimistic-send reconciliation protocol, presence tracking,
//! and the two transport bindings (live relay session, polling change feed).

pub mod error;
pub mod http;
pub mod message_store;
pub mod presence;
pub mod room;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use shared::domain::{RoomId, RoomSummary, UserId, UserIdentity};

use crate::error::ClientError;
use crate::http::ApiClient;
use crate::presence::PresenceTracker;
use crate::room::RoomSession;
use crate::transport::{ChangeFeedTransport, SessionRelayTransport, TransportBinding};

/// How a client receives events. `SessionRelay` is the default; `ChangeFeed`
/// exists for environments that cannot hold a WebSocket open.
#[derive(Debug, Clone)]
pub enum TransportMode {
    SessionRelay,
    ChangeFeed { poll_interval: Duration },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub transport: TransportMode,
}

/// Entry point for a logged-in user. Presence is shared across every room
/// the client opens; message stores are per room.
pub struct ChatClient {
    user: UserIdentity,
    api: ApiClient,
    presence: Arc<PresenceTracker>,
    config: ClientConfig,
}

impl ChatClient {
    pub fn new(user: UserIdentity, config: ClientConfig) -> Self {
        Self {
            user,
            api: ApiClient::new(config.server_url.clone()),
            presence: Arc::new(PresenceTracker::new()),
            config,
        }
    }

    pub fn presence(&self) -> Arc<PresenceTracker> {
        Arc::clone(&self.presence)
    }

    pub async fn search_users(&self, query: &str) -> Vec<UserIdentity> {
        self.api.search_users(query).await
    }

    pub async fn load_room_summaries(&self) -> Vec<RoomSummary> {
        self.api.room_summaries(&self.user.id).await
    }

    pub async fn open_room_with(&self, other: &UserId) -> Result<RoomSession, ClientError> {
        let room_id = self.api.find_or_create_room(&self.user.id, other).await?;
        self.enter_room(room_id).await
    }

    pub async fn enter_room(&self, room_id: RoomId) -> Result<RoomSession, ClientError> {
        let transport: Arc<dyn TransportBinding> = match &self.config.transport {
            TransportMode::SessionRelay => Arc::new(
                SessionRelayTransport::connect(
                    &ws_url(self.api.base_url()),
                    self.user.id.clone(),
                )
                .await?,
            ),
            TransportMode::ChangeFeed { poll_interval } => Arc::new(
                ChangeFeedTransport::start(
                    self.api.clone(),
                    room_id.clone(),
                    self.user.id.clone(),
                    *poll_interval,
                )
                .await,
            ),
        };
        Ok(RoomSession::enter(
            room_id,
            self.user.clone(),
            self.api.clone(),
            transport,
            Arc::clone(&self.presence),
        )
        .await)
    }
}

fn ws_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{ws_base}/ws")
}

#[cfg(test)]
mod tests;
