//! Test support: a scripted transport double and a stub HTTP server that
//! stands in for the real chat server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use shared::domain::{RoomId, UserId, UserIdentity};
use shared::protocol::{MessagePayload, WireEvent};
use tokio::sync::{broadcast, Mutex};

use crate::error::ClientError;
use crate::transport::TransportBinding;

mod transport_tests;

pub(crate) fn test_user(id: &str) -> UserIdentity {
    UserIdentity {
        id: UserId::new(id),
        name: id.to_string(),
        email: format!("{id}@example.com"),
        avatar_url: None,
    }
}

/// Transport double driven entirely by the test: events are injected through
/// `emit`, and published payloads are captured for inspection. With
/// `echo_publishes` set it behaves like the relay and feeds every published
/// payload straight back into the event stream.
pub(crate) struct ScriptedTransport {
    events: broadcast::Sender<WireEvent>,
    pub published: Mutex<Vec<MessagePayload>>,
    pub fail_publish: bool,
    pub echo_publishes: bool,
    pub closed: AtomicBool,
}

impl ScriptedTransport {
    fn with_flags(fail_publish: bool, echo_publishes: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            published: Mutex::new(Vec::new()),
            fail_publish,
            echo_publishes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::with_flags(false, false)
    }

    pub fn failing_publish() -> Arc<Self> {
        Self::with_flags(true, false)
    }

    pub fn echoing() -> Arc<Self> {
        Self::with_flags(false, true)
    }

    pub fn emit(&self, event: WireEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl TransportBinding for ScriptedTransport {
    async fn publish(&self, message: MessagePayload) -> Result<(), ClientError> {
        if self.fail_publish {
            return Err(ClientError::TransportUnavailable("scripted failure".into()));
        }
        self.published.lock().await.push(message.clone());
        if self.echo_publishes {
            self.emit(WireEvent::Message { message });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct StubState {
    /// Body served for GET /rooms/:id/messages, verbatim.
    pub history: std::sync::Mutex<serde_json::Value>,
    /// Body served for GET /users/statuses, verbatim.
    pub statuses: std::sync::Mutex<serde_json::Value>,
    pub fail_create: AtomicBool,
    /// Artificial latency for the history and create routes, to widen the
    /// windows where events race an in-flight request.
    pub history_delay_ms: AtomicU64,
    pub create_delay_ms: AtomicU64,
    /// Every PUT /users/:id/status observed, as (user_id, status).
    pub status_writes: std::sync::Mutex<Vec<(String, String)>>,
    pub create_calls: AtomicU64,
    next_id: AtomicU64,
}

pub(crate) struct StubServer {
    pub addr: SocketAddr,
    pub state: Arc<StubState>,
}

impl StubServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Boots a minimal stand-in for the chat server on an ephemeral port.
pub(crate) async fn stub_server() -> StubServer {
    let state = Arc::new(StubState {
        history: std::sync::Mutex::new(serde_json::json!([])),
        statuses: std::sync::Mutex::new(serde_json::json!([])),
        ..Default::default()
    });

    let app = Router::new()
        .route("/rooms/:room_id/messages", get(stub_history))
        .route("/users", get(stub_search_users))
        .route("/users/statuses", get(stub_statuses))
        .route("/users/:user_id/status", put(stub_set_status))
        .route("/messages", post(stub_create_message))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });

    StubServer { addr, state }
}

async fn stub_history(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
    let delay = state.history_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Json(state.history.lock().expect("history lock").clone())
}

async fn stub_statuses(State(state): State<Arc<StubState>>) -> Json<serde_json::Value> {
    Json(state.statuses.lock().expect("statuses lock").clone())
}

// Echoes the decoded query back as a single matching user, so a test can
// verify what the server actually received.
async fn stub_search_users(
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<UserIdentity>> {
    let query = params.get("query").cloned().unwrap_or_default();
    Json(vec![UserIdentity {
        id: UserId::new("u-match"),
        name: query,
        email: "match@example.com".to_string(),
        avatar_url: None,
    }])
}

#[derive(serde::Deserialize)]
struct StubStatusRequest {
    status: String,
}

async fn stub_set_status(
    State(state): State<Arc<StubState>>,
    Path(user_id): Path<String>,
    Json(req): Json<StubStatusRequest>,
) -> StatusCode {
    state
        .status_writes
        .lock()
        .expect("status writes lock")
        .push((user_id, req.status));
    StatusCode::NO_CONTENT
}

#[derive(serde::Deserialize)]
struct StubSendRequest {
    room_id: String,
    sender_id: String,
    body: String,
}

async fn stub_create_message(
    State(state): State<Arc<StubState>>,
    Json(req): Json<StubSendRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), StatusCode> {
    state.create_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.create_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.fail_create.load(Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let message = MessagePayload {
        id: format!("m{n}"),
        room_id: RoomId::new(req.room_id),
        sender_id: UserId::new(req.sender_id),
        body: req.body,
        created_at: Utc::now(),
        sender_avatar_url: None,
    };
    Ok((StatusCode::CREATED, Json(message)))
}

/// Polls `check` until it passes or two seconds elapse.
pub(crate) async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}
