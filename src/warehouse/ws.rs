//! WebSocket endpoint for observers and operator intents.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::intent::{Intent, IntentReply};
use super::service::Warehouse;
use crate::broadcast::WarehouseEvent;

/// Build the router with the observer socket and the health endpoint.
pub fn warehouse_routes(warehouse: Arc<Warehouse>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(warehouse)
}

async fn health(State(warehouse): State<Arc<Warehouse>>) -> impl IntoResponse {
    let arm = warehouse.arm_snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "service": "smart-warehouse",
        "mode": arm.mode,
        "arm": arm.status,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(warehouse): State<Arc<Warehouse>>,
) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, warehouse))
}

async fn handle_socket(mut socket: WebSocket, warehouse: Arc<Warehouse>) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing published in between is lost.
    let mut rx = warehouse.events().subscribe();

    if !send_init(&mut socket, &warehouse).await {
        warn!("Failed to send initial snapshot, client disconnected");
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<IntentReply>(32);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_json(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_init(&mut socket, &warehouse).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            Some(reply) = reply_rx.recv() => {
                if !send_json(&mut socket, &reply).await {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_intent(text.as_str(), &warehouse, &reply_tx);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Parse a client frame and run it on its own task; the reply comes back
/// through `replies`.
fn dispatch_intent(text: &str, warehouse: &Arc<Warehouse>, replies: &mpsc::Sender<IntentReply>) {
    let intent = match serde_json::from_str::<Intent>(text) {
        Ok(intent) => intent,
        Err(e) => {
            debug!(error = %e, text, "Unrecognized WS message from client");
            let reply = IntentReply::IntentError {
                action: None,
                kind: "validation",
                message: format!("invalid intent: {e}"),
            };
            if replies.try_send(reply).is_err() {
                warn!("Reply channel full, dropping parse error");
            }
            return;
        }
    };

    let warehouse = Arc::clone(warehouse);
    let replies = replies.clone();
    tokio::spawn(async move {
        let action = intent.name();
        let reply = match warehouse.handle(intent).await {
            Ok(result) => IntentReply::IntentOk { action, result },
            Err(e) => {
                info!(action, kind = e.kind(), error = %e, "Intent rejected");
                IntentReply::IntentError {
                    action: Some(action),
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };
        // Client may have gone away while the intent ran.
        let _ = replies.send(reply).await;
    });
}

async fn send_init(socket: &mut WebSocket, warehouse: &Warehouse) -> bool {
    match warehouse.snapshot().await {
        Ok(snapshot) => {
            send_json(
                socket,
                &WarehouseEvent::Init {
                    snapshot: Box::new(snapshot),
                },
            )
            .await
        }
        Err(e) => {
            warn!(error = %e, "Could not build snapshot for client");
            true
        }
    }
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, message: &T) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize outbound message");
            true
        }
    }
}
