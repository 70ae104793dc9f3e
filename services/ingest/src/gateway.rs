//! Device WebSocket gateway.
//!
//! Each frame is one JSON `DeviceMessage`.  The session registers a
//! directive sender under the device id on first sight of it, and outbound
//! directives stream back over the same socket.  A frame that does not
//! parse is discarded with a logged reason and no state mutation — the
//! device's own retry cadence is the recovery mechanism.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wake_protocol::{DeviceMessage, Directive};

use crate::state::AppState;

const SESSION_TIMEOUT: Duration = Duration::from_secs(90);

pub async fn ws_device_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state))
}

async fn handle_device_socket(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Directive>(8);
    let mut registered: Option<String> = None;

    loop {
        tokio::select! {
            msg = tokio::time::timeout(SESSION_TIMEOUT, socket.recv()) => {
                match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<DeviceMessage>(&text) {
                            Ok(msg) => {
                                let device_id = msg.device_id().to_owned();
                                if registered.as_deref() != Some(device_id.as_str()) {
                                    if let Some(old) = registered.take() {
                                        state.publisher.unregister(&old).await;
                                    }
                                    state.publisher.register(&device_id, tx.clone()).await;
                                    registered = Some(device_id.clone());
                                }
                                if let Err(e) = state.engine.handle_message(msg).await {
                                    tracing::error!(
                                        device_id = %device_id,
                                        error = %e,
                                        "error handling device message"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "discarding unparseable frame");
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        break;
                    }
                    Err(_) => {
                        warn!(device_id = ?registered, "session timeout");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(device_id = ?registered, error = %e, "WS error");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
            Some(directive) = rx.recv() => {
                match serde_json::to_string(&directive) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "directive serialization failed");
                    }
                }
            }
        }
    }

    if let Some(device_id) = registered {
        state.publisher.unregister(&device_id).await;
        info!(device_id = %device_id, "device session ended");
    }
}
