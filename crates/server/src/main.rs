use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use server_api::ApiContext;
use shared::{
    domain::{PresenceStatus, RoomId, RoomSummary, UserId, UserIdentity},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, PresenceRecord, WireEvent},
};
use storage::Storage;
use tracing::{error, info};

mod config;
mod relay;
mod ws;

use config::{load_settings, prepare_database_url};
use relay::Relay;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    relay: Relay,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    name: String,
    email: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    query: String,
}

#[derive(Debug, Deserialize)]
struct RoomsQuery {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomRequest {
    user_id_a: String,
    user_id_b: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateRoomResponse {
    room_id: RoomId,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    after: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    room_id: String,
    sender_id: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    status: PresenceStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let relay = Relay::spawn();

    let state = AppState { api, relay };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_create_user).get(http_search_users))
        .route("/users/statuses", get(http_user_statuses))
        .route("/users/:user_id", get(http_get_user))
        .route("/users/:user_id/status", put(http_set_user_status))
        .route("/rooms", post(http_find_or_create_room).get(http_room_summaries))
        .route("/rooms/:room_id/messages", get(http_load_messages))
        .route("/messages", post(http_create_message))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn api_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn http_create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserIdentity>, (StatusCode, Json<ApiError>)> {
    let user = server_api::create_user(&state.api, &req.name, &req.email, req.avatar_url.as_deref())
        .await
        .map_err(api_error)?;
    Ok(Json(user))
}

async fn http_search_users(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<UserIdentity>>, (StatusCode, Json<ApiError>)> {
    let users = server_api::search_users(&state.api, &q.query)
        .await
        .map_err(api_error)?;
    Ok(Json(users))
}

async fn http_get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserIdentity>, (StatusCode, Json<ApiError>)> {
    let user = server_api::get_user(&state.api, &UserId::new(user_id))
        .await
        .map_err(api_error)?;
    Ok(Json(user))
}

async fn http_user_statuses(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PresenceRecord>>, (StatusCode, Json<ApiError>)> {
    let statuses = server_api::user_statuses(&state.api)
        .await
        .map_err(api_error)?;
    Ok(Json(
        statuses
            .into_iter()
            .map(|(user_id, status)| PresenceRecord { user_id, status })
            .collect(),
    ))
}

async fn http_set_user_status(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::set_user_status(&state.api, &UserId::new(user_id), req.status)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_find_or_create_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, (StatusCode, Json<ApiError>)> {
    let room_id = server_api::find_or_create_room(
        &state.api,
        &UserId::new(req.user_id_a),
        &UserId::new(req.user_id_b),
    )
    .await
    .map_err(api_error)?;
    Ok(Json(CreateRoomResponse { room_id }))
}

async fn http_room_summaries(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RoomsQuery>,
) -> Result<Json<Vec<RoomSummary>>, (StatusCode, Json<ApiError>)> {
    let summaries = server_api::load_room_summaries(&state.api, &UserId::new(q.user_id))
        .await
        .map_err(api_error)?;
    Ok(Json(summaries))
}

async fn http_load_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let messages = server_api::load_messages(&state.api, &RoomId::new(room_id), q.after)
        .await
        .map_err(api_error)?;
    Ok(Json(messages))
}

/// Durable-write path for outgoing messages. Deliberately independent of the
/// relay fan-out: the optimistic payload travels over `/ws` while this call
/// is in flight, and the client converges the two by message id.
async fn http_create_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), (StatusCode, Json<ApiError>)> {
    let event = server_api::create_message(
        &state.api,
        &RoomId::new(req.room_id),
        &UserId::new(req.sender_id),
        &req.body,
    )
    .await
    .map_err(api_error)?;
    let WireEvent::Message { message } = event else {
        return Err(api_error(ApiError::new(
            ErrorCode::Internal,
            "unexpected event shape from create_message",
        )));
    };
    Ok((StatusCode::CREATED, Json(message)))
}
