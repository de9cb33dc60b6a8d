use std::collections::HashMap;

use shared::domain::{PresenceStatus, UserId};
use tokio::sync::RwLock;

/// Client-side view of who is reachable. Updates apply last-write-wins in
/// arrival order; a user with no recorded signal reads as offline.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    statuses: RwLock<HashMap<UserId, PresenceStatus>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, user_id: UserId, status: PresenceStatus) {
        self.statuses.write().await.insert(user_id, status);
    }

    pub async fn status(&self, user_id: &UserId) -> PresenceStatus {
        self.statuses
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Seeds statuses from a durable snapshot. Only fills users with no
    /// recorded status yet: a live signal that raced ahead of the snapshot
    /// must not be clobbered by older persisted state.
    pub async fn bulk_load(&self, snapshot: impl IntoIterator<Item = (UserId, PresenceStatus)>) {
        let mut statuses = self.statuses.write().await;
        for (user_id, status) in snapshot {
            statuses.entry(user_id).or_insert(status);
        }
    }
}
