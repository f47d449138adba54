//! WebSocket fan-out of lifecycle and metrics events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use crate::api::AppState;

pub async fn events_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

/// Forwards broadcast events to one socket until either side closes. The
/// subscription is pruned on the way out, which is the only place
/// subscriptions get removed.
async fn stream_events(mut socket: WebSocket, state: AppState) {
    let (subscriber, mut rx) = state.broadcaster.subscribe();
    debug!(%subscriber, "event stream opened");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(payload) = event else { break };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Client pings and stray frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.unsubscribe(subscriber);
    debug!(%subscriber, "event stream closed");
}
