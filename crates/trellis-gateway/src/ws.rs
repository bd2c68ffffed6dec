use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::stream::StreamExt;
use tracing::{debug, info, warn};
use trellis_db::User;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(socket: WebSocket) {
    info!("new WebSocket connection");
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let payload = match msg {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(bytes)) => bytes.to_vec(),
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by client");
                break;
            }
            Err(e) => {
                warn!("WebSocket error: {e}");
                break;
            }
            _ => continue,
        };

        let reply = echo_user(&payload);
        if sender.send(reply).await.is_err() {
            break;
        }
    }

    debug!("WebSocket connection finished");
}

/// Parse a user from the frame and echo it back as binary JSON. Malformed
/// frames get a text error so the connection can carry on.
fn echo_user(payload: &[u8]) -> Message {
    let user = match serde_json::from_slice::<User>(payload) {
        Ok(user) => user,
        Err(e) => {
            warn!("invalid user frame: {e}");
            let error = serde_json::json!({ "error": format!("invalid user: {e}") });
            return Message::Text(error.to_string().into());
        }
    };

    info!("received user over WebSocket: name={}, age={}", user.name, user.age);
    match serde_json::to_vec(&user) {
        Ok(body) => Message::Binary(body.into()),
        Err(e) => Message::Text(serde_json::json!({ "error": e.to_string() }).to_string().into()),
    }
}
