//! One open room view: a message store plus the reconciliation protocol
//! that keeps the optimistic fast path and the durable write path from ever
//! showing the same message twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shared::domain::{RoomId, UserIdentity};
use shared::protocol::{is_provisional_id, MessagePayload, WireEvent};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::http::ApiClient;
use crate::message_store::MessageStore;
use crate::presence::PresenceTracker;
use crate::transport::TransportBinding;

const CLIENT_EVENT_CAPACITY: usize = 256;

/// Lifecycle of one outgoing message. There is no retry: `Failed` is
/// terminal and the provisional entry stays visible so the sender can see
/// what did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// Notifications a UI layer consumes to redraw.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        message: MessagePayload,
    },
    PresenceChanged {
        user_id: shared::domain::UserId,
        status: shared::domain::PresenceStatus,
    },
    DeliveryChanged {
        message_id: String,
        state: DeliveryState,
    },
}

pub struct RoomSession {
    room_id: RoomId,
    user: UserIdentity,
    api: ApiClient,
    transport: Arc<dyn TransportBinding>,
    presence: Arc<PresenceTracker>,
    store: Arc<Mutex<MessageStore>>,
    deliveries: Arc<Mutex<HashMap<String, DeliveryState>>>,
    // Provisional ids already swapped for durable ones. A relay echo of the
    // provisional payload can arrive after confirmation; without this set it
    // would re-insert the entry under its dead temp id.
    reconciled: Arc<Mutex<HashSet<String>>>,
    events: broadcast::Sender<ClientEvent>,
    event_task: JoinHandle<()>,
}

impl RoomSession {
    /// Opens the room: hydrates history from the durable store, seeds
    /// presence from the status snapshot, and starts consuming the
    /// transport's event stream. A failed or malformed history load opens
    /// the room empty instead of failing.
    pub async fn enter(
        room_id: RoomId,
        user: UserIdentity,
        api: ApiClient,
        transport: Arc<dyn TransportBinding>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        // Subscribe before the hydration round trip: events arriving while
        // the load is in flight buffer in the receiver instead of being
        // dropped, and the id-keyed merge absorbs any overlap with the
        // loaded history.
        let incoming = transport.subscribe();

        let mut store = MessageStore::new();
        store.hydrate(api.load_messages(&room_id).await);
        let store = Arc::new(Mutex::new(store));

        presence
            .bulk_load(
                api.user_statuses()
                    .await
                    .into_iter()
                    .map(|record| (record.user_id, record.status)),
            )
            .await;

        let reconciled = Arc::new(Mutex::new(HashSet::new()));
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let event_task = tokio::spawn(Self::run_event_loop(
            room_id.clone(),
            incoming,
            Arc::clone(&store),
            Arc::clone(&presence),
            events.clone(),
            Arc::clone(&reconciled),
        ));

        Self {
            room_id,
            user,
            api,
            transport,
            presence,
            store,
            deliveries: Arc::new(Mutex::new(HashMap::new())),
            reconciled,
            events,
            event_task,
        }
    }

    async fn run_event_loop(
        room_id: RoomId,
        mut incoming: broadcast::Receiver<WireEvent>,
        store: Arc<Mutex<MessageStore>>,
        presence: Arc<PresenceTracker>,
        events: broadcast::Sender<ClientEvent>,
        reconciled: Arc<Mutex<HashSet<String>>>,
    ) {
        loop {
            let event = match incoming.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged; some events were dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                WireEvent::Message { message } => {
                    // The fan-out is global; events for other rooms are
                    // discarded here.
                    if message.room_id != room_id {
                        continue;
                    }
                    if is_provisional_id(&message.id)
                        && reconciled.lock().await.contains(&message.id)
                    {
                        debug!(id = %message.id, "dropping echo of already-confirmed message");
                        continue;
                    }
                    store.lock().await.append(message.clone());
                    let _ = events.send(ClientEvent::MessageReceived { message });
                }
                WireEvent::Presence { user_id, status } => {
                    presence.set_status(user_id.clone(), status).await;
                    let _ = events.send(ClientEvent::PresenceChanged { user_id, status });
                }
            }
        }
    }

    /// Sends a message: optimistic insert, best-effort publish to peers,
    /// then the durable write whose result decides the delivery state. On
    /// success the provisional entry is swapped for the confirmed record; on
    /// failure it stays in the store marked `Failed`.
    pub async fn send_message(&self, body: &str) -> Result<MessagePayload, ClientError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ClientError::EmptyMessageBody);
        }

        let provisional = MessagePayload::provisional(
            self.room_id.clone(),
            self.user.id.clone(),
            body,
            self.user.avatar_url.clone(),
        );
        let temp_id = provisional.id.clone();

        self.store.lock().await.append(provisional.clone());
        self.set_delivery(&temp_id, DeliveryState::Pending).await;

        if let Err(err) = self.transport.publish(provisional.clone()).await {
            // Peers miss the fast copy; the durable write still proceeds and
            // they will catch up on their next load.
            warn!(%err, "optimistic publish failed");
        }

        match self
            .api
            .create_message(&self.room_id, &self.user.id, body)
            .await
        {
            Ok(confirmed) => {
                // Mark the temp id reconciled before touching the store: an
                // echo processed between the swap and this insert would
                // otherwise pass the event-loop check and re-add the entry
                // under its dead temp id.
                self.reconciled.lock().await.insert(temp_id.clone());
                {
                    let mut store = self.store.lock().await;
                    store.replace_provisional(&temp_id, confirmed.clone());
                }
                let mut deliveries = self.deliveries.lock().await;
                deliveries.remove(&temp_id);
                deliveries.insert(confirmed.id.clone(), DeliveryState::Confirmed);
                drop(deliveries);
                let _ = self.events.send(ClientEvent::DeliveryChanged {
                    message_id: confirmed.id.clone(),
                    state: DeliveryState::Confirmed,
                });
                Ok(confirmed)
            }
            Err(err) => {
                self.set_delivery(&temp_id, DeliveryState::Failed).await;
                let _ = self.events.send(ClientEvent::DeliveryChanged {
                    message_id: temp_id,
                    state: DeliveryState::Failed,
                });
                Err(err)
            }
        }
    }

    async fn set_delivery(&self, message_id: &str, state: DeliveryState) {
        self.deliveries
            .lock()
            .await
            .insert(message_id.to_string(), state);
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        self.store.lock().await.messages().cloned().collect()
    }

    pub async fn delivery_state(&self, message_id: &str) -> Option<DeliveryState> {
        self.deliveries.lock().await.get(message_id).copied()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Stops consuming events and releases the transport. Presence teardown
    /// is the transport's concern (socket close or durable offline write).
    pub async fn leave(&self) {
        self.event_task.abort();
        self.transport.close().await;
    }
}
