use axum::extract::ws::{Message, WebSocket};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;

/// Event pushed to dashboard clients: inbound/outbound messages, delivery
/// receipts, read markers, connection changes, broadcast progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    Auth { token: Option<String> },
    Subscribe { events: Option<Vec<String>> },
    Ping,
}

/// Per-socket loop: commands in, filtered events out. Events are dropped
/// until the client authenticates (when a token is configured).
pub async fn handle_ws(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<WsEvent>,
    auth_token: Option<String>,
) {
    let mut authorized = auth_token.is_none();
    let mut subscriptions: Option<HashSet<String>> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Close(_) => break,
                    Message::Text(text) => {
                        let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) else { continue };
                        match cmd {
                            WsCommand::Auth { token } => {
                                if let Some(expected) = auth_token.as_ref() {
                                    if token.as_deref() != Some(expected.as_str()) {
                                        let _ = socket.send(Message::Close(None)).await;
                                        break;
                                    }
                                }
                                authorized = true;
                                let ack = WsEvent {
                                    event: "ready".to_string(),
                                    payload: serde_json::json!({"status": "authenticated"}),
                                };
                                let _ = send_event(&mut socket, &ack).await;
                            }
                            WsCommand::Subscribe { events } => {
                                subscriptions = events.map(|items| items.into_iter().collect());
                            }
                            WsCommand::Ping => {
                                let pong = WsEvent {
                                    event: "pong".to_string(),
                                    payload: serde_json::json!({}),
                                };
                                let _ = send_event(&mut socket, &pong).await;
                            }
                        }
                    }
                    _ => {}
                }
            }
            evt = rx.recv() => {
                let Ok(evt) = evt else { continue };
                if !authorized {
                    continue;
                }
                if let Some(subs) = subscriptions.as_ref() {
                    if !subs.contains(&evt.event) {
                        continue;
                    }
                }
                if send_event(&mut socket, &evt).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, evt: &WsEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(evt).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
