use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use shared::domain::{PresenceStatus, RoomId, UserId};
use shared::protocol::{MessagePayload, WireEvent};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::transport::{ChangeFeedTransport, TransportBinding};

use super::{stub_server, wait_until, StubServer};

const POLL: Duration = Duration::from_millis(20);

async fn start_feed(server: &StubServer) -> ChangeFeedTransport {
    ChangeFeedTransport::start(
        crate::http::ApiClient::new(server.base_url()),
        RoomId::new("r1"),
        UserId::new("alice"),
        POLL,
    )
    .await
}

/// Reads events until one matches, tolerating lag and unrelated events.
async fn wait_for_event<F>(rx: &mut broadcast::Receiver<WireEvent>, matches: F) -> WireEvent
where
    F: Fn(&WireEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("matching event within deadline")
}

fn history_row(id: &str, body: &str) -> serde_json::Value {
    serde_json::to_value(MessagePayload {
        id: id.to_string(),
        room_id: RoomId::new("r1"),
        sender_id: UserId::new("bob"),
        body: body.to_string(),
        created_at: Utc::now(),
        sender_avatar_url: None,
    })
    .expect("row json")
}

#[tokio::test]
async fn feed_replays_history_then_delivers_new_rows() {
    let server = stub_server().await;
    *server.state.history.lock().expect("history lock") =
        serde_json::json!([history_row("m1", "first")]);

    let feed = start_feed(&server).await;
    let mut rx = feed.subscribe();

    wait_for_event(&mut rx, |event| {
        matches!(event, WireEvent::Message { message } if message.id == "m1")
    })
    .await;

    // A row persisted after the feed started shows up on a later poll.
    *server.state.history.lock().expect("history lock") =
        serde_json::json!([history_row("m1", "first"), history_row("m2", "second")]);
    wait_for_event(&mut rx, |event| {
        matches!(event, WireEvent::Message { message } if message.id == "m2")
    })
    .await;

    feed.close().await;
}

#[tokio::test]
async fn feed_registers_online_and_writes_offline_on_close() {
    let server = stub_server().await;
    let feed = start_feed(&server).await;

    {
        let writes = server.state.status_writes.lock().expect("writes lock");
        assert!(writes.contains(&("alice".to_string(), "online".to_string())));
    }

    feed.close().await;
    wait_until(|| async {
        server
            .state
            .status_writes
            .lock()
            .expect("writes lock")
            .contains(&("alice".to_string(), "offline".to_string()))
    })
    .await;
}

#[tokio::test]
async fn feed_emits_presence_from_the_status_table() {
    let server = stub_server().await;
    *server.state.statuses.lock().expect("statuses lock") =
        serde_json::json!([{ "user_id": "bob", "status": "online" }]);

    let feed = start_feed(&server).await;
    let mut rx = feed.subscribe();

    let event = wait_for_event(&mut rx, |event| {
        matches!(event, WireEvent::Presence { user_id, .. } if user_id.as_str() == "bob")
    })
    .await;
    assert!(matches!(
        event,
        WireEvent::Presence {
            status: PresenceStatus::Online,
            ..
        }
    ));

    feed.close().await;
}

#[tokio::test]
async fn feed_publish_never_hits_the_durable_write_path() {
    let server = stub_server().await;
    let feed = start_feed(&server).await;

    let message = MessagePayload::provisional(
        RoomId::new("r1"),
        UserId::new("alice"),
        "optimistic copy",
        None,
    );
    feed.publish(message).await.expect("publish is a no-op");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(server.state.create_calls.load(Ordering::SeqCst), 0);

    feed.close().await;
}
