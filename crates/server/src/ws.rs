use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, WireEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_session(state, socket))
}

/// One relay session per websocket connection. The client registers its user
/// id with an explicit frame after connecting; any termination of the read
/// loop, clean or abnormal, tears the session down exactly once.
async fn relay_session(state: Arc<AppState>, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (sink, mut outbound) = mpsc::unbounded_channel::<WireEvent>();
    let session_id = state.relay.connect(sink);

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = ws_receiver.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Register { user_id }) => state.relay.register(session_id, user_id),
            Ok(ClientFrame::Message { message }) => {
                state.relay.broadcast(WireEvent::Message { message });
            }
            Err(err) => debug!(%err, "ignoring malformed client frame"),
        }
    }

    state.relay.disconnect(session_id);
    send_task.abort();
}
