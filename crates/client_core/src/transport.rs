//! Transport bindings: how wire events reach a client session. Two
//! strategies implement the same interface. `SessionRelayTransport` holds a
//! live WebSocket to the relay and receives its fan-out directly.
//! `ChangeFeedTransport` has no persistent connection; it synthesizes the
//! same event stream by polling the durable store and status table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use shared::domain::{PresenceStatus, RoomId, UserId};
use shared::protocol::{ClientFrame, MessagePayload, WireEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::http::ApiClient;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Delivery seam between a room session and the server. Events arriving on
/// `subscribe` receivers carry no room filtering; the session discards what
/// it does not care about.
#[async_trait]
pub trait TransportBinding: Send + Sync {
    /// Hands an outgoing message to the fast path. Best-effort: a failure
    /// here means peers will not see the optimistic copy, nothing more.
    async fn publish(&self, message: MessagePayload) -> Result<(), ClientError>;

    fn subscribe(&self) -> broadcast::Receiver<WireEvent>;

    async fn close(&self);
}

/// WebSocket binding. Registration is the `register` frame sent right after
/// the connection opens; the relay answers every frame loss with silence, so
/// delivery is at-most-once by construction.
pub struct SessionRelayTransport {
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    events: broadcast::Sender<WireEvent>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl SessionRelayTransport {
    pub async fn connect(ws_url: &str, user_id: UserId) -> Result<Self, ClientError> {
        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|err| ClientError::TransportUnavailable(err.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let send_task = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "dropping unserializable client frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    debug!("relay socket closed while sending");
                    break;
                }
            }
        });

        let events_tx = events.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<WireEvent>(&text) {
                    Ok(event) => {
                        // No receivers is fine: the session may not have
                        // subscribed yet.
                        let _ = events_tx.send(event);
                    }
                    Err(err) => debug!(%err, "ignoring malformed relay event"),
                }
            }
            debug!("relay event stream ended");
        });

        let transport = Self {
            outgoing,
            events,
            send_task,
            recv_task,
        };
        transport
            .send_frame(ClientFrame::Register { user_id })
            .await?;
        Ok(transport)
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<(), ClientError> {
        self.outgoing
            .send(frame)
            .map_err(|_| ClientError::TransportUnavailable("relay session closed".into()))
    }
}

#[async_trait]
impl TransportBinding for SessionRelayTransport {
    async fn publish(&self, message: MessagePayload) -> Result<(), ClientError> {
        self.send_frame(ClientFrame::Message { message }).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.send_task.abort();
        self.recv_task.abort();
    }
}

/// Polling binding for clients that cannot hold a socket open. Registration
/// is a durable status write instead of a connection event, and incoming
/// messages are read back from storage with an `after` cursor.
pub struct ChangeFeedTransport {
    api: ApiClient,
    user_id: UserId,
    events: broadcast::Sender<WireEvent>,
    poll_task: JoinHandle<()>,
}

impl ChangeFeedTransport {
    pub async fn start(
        api: ApiClient,
        room_id: RoomId,
        user_id: UserId,
        poll_interval: std::time::Duration,
    ) -> Self {
        if let Err(err) = api.set_user_status(&user_id, PresenceStatus::Online).await {
            warn!(%err, "could not register presence via status write");
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let events_tx = events.clone();
        let poll_api = api.clone();
        let poll_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // The first poll replays full history; id-keyed merging on the
            // receiving side makes the replay harmless.
            let mut cursor: Option<DateTime<Utc>> = None;
            loop {
                ticker.tick().await;
                let batch = match cursor {
                    Some(cursor) => poll_api.load_messages_after(&room_id, cursor).await,
                    None => poll_api.load_messages(&room_id).await,
                };
                for message in batch {
                    cursor = Some(match cursor {
                        Some(current) => current.max(message.created_at),
                        None => message.created_at,
                    });
                    let _ = events_tx.send(WireEvent::Message { message });
                }
                for record in poll_api.user_statuses().await {
                    let _ = events_tx.send(WireEvent::Presence {
                        user_id: record.user_id,
                        status: record.status,
                    });
                }
            }
        });

        Self {
            api,
            user_id,
            events,
            poll_task,
        }
    }
}

#[async_trait]
impl TransportBinding for ChangeFeedTransport {
    /// No fast path exists here: the durable write the session performs in
    /// parallel is what lands the message in every peer's next poll.
    async fn publish(&self, _message: MessagePayload) -> Result<(), ClientError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.poll_task.abort();
        if let Err(err) = self
            .api
            .set_user_status(&self.user_id, PresenceStatus::Offline)
            .await
        {
            warn!(%err, "could not clear presence on close");
        }
    }
}
