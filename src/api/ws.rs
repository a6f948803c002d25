// =============================================================================
// Dashboard WebSocket — account and trade update broadcast
// =============================================================================
//
// Clients connect to `/ws` and receive:
//   1. An immediate account snapshot and scheduler status.
//   2. Every engine event (account updates, trade opens/closes) as it
//      happens.
//   3. A status refresh every 30 seconds.
//
// Ping frames are answered with Pong; inbound text is ignored.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::orchestrator::EngineEvent;

const STATUS_PUSH_INTERVAL: Duration = Duration::from_secs(30);

type WsSender = SplitSink<WebSocket, Message>;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    info!("dashboard WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, engine))
}

async fn handle_connection(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = engine.subscribe_events();

    // Initial state so the dashboard renders without waiting for an event.
    if send_account(&mut sender, &engine).await.is_err()
        || send_status(&mut sender, &engine).await.is_err()
    {
        return;
    }

    let mut status_push = interval(STATUS_PUSH_INTERVAL);
    status_push.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dashboard client lagged — resyncing");
                        if send_account(&mut sender, &engine).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = status_push.tick() => {
                if send_status(&mut sender, &engine).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "dashboard WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("dashboard WebSocket connection closed");
}

async fn send_event(sender: &mut WsSender, event: &EngineEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize engine event");
            Ok(())
        }
    }
}

async fn send_account(sender: &mut WsSender, engine: &Engine) -> Result<(), axum::Error> {
    let Ok(snapshot) = engine.account_snapshot() else {
        return Ok(());
    };
    send_event(sender, &EngineEvent::Account(snapshot)).await
}

async fn send_status(sender: &mut WsSender, engine: &Engine) -> Result<(), axum::Error> {
    let body = serde_json::json!({ "type": "scheduler", "data": engine.status() });
    match serde_json::to_string(&body) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(_) => Ok(()),
    }
}
