// =============================================================================
// WebSocket Handler: Push-based snapshot updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate full SessionSnapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the session version has changed
//      since the last push.
//
// Ping frames are answered with Pong; any other inbound text is ignored.
// =============================================================================

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::session::SessionHandle;

const PUSH_INTERVAL_MS: u64 = 500;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<SessionHandle>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, session))
}

/// Runs the push loop and the receive loop side by side until either ends.
async fn handle_ws_connection(socket: WebSocket, session: SessionHandle) {
    let (mut sender, mut receiver) = socket.split();

    let mut sequence: u64 = 0;
    let mut last_sent_version = match send_snapshot(&mut sender, &session, &mut sequence).await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "Failed to send initial WebSocket snapshot");
            return;
        }
    };

    let mut push_interval = interval(Duration::from_millis(PUSH_INTERVAL_MS));

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                if session.version() != last_sent_version {
                    match send_snapshot(&mut sender, &session, &mut sequence).await {
                        Ok(version) => last_sent_version = version,
                        Err(e) => {
                            debug!(error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(messages_sent = sequence, "WebSocket connection closed");
}

/// Serialize and send the current snapshot; returns the version that was sent.
async fn send_snapshot<S>(
    sender: &mut S,
    session: &SessionHandle,
    sequence: &mut u64,
) -> Result<u64, axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = session.snapshot();

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            *sequence += 1;
            debug!(version = snapshot.version, seq = *sequence, "WebSocket snapshot sent");
        }
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "Failed to serialize snapshot");
        }
    }
    Ok(snapshot.version)
}
