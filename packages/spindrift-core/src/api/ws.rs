//! WebSocket handler for real-time client communication.
//!
//! Push channel contract:
//! - `status_update` - endpoint snapshots, every 2s and immediately on
//!   subscribe (late subscribers never wait for the next tick)
//! - `device_list_changed` - enumeration events
//! - `log_entry` - streamed log records
//! - `event` - player/stream domain events, for richer clients
//!
//! Clients send `{"type": "HEARTBEAT"}` periodically; a silent client is
//! disconnected after the configured timeout.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use crate::api::AppState;
use crate::events::BroadcastEvent;
use crate::status::status_message;

/// Interval between heartbeat-timeout checks.
const HEARTBEAT_CHECK_SECS: u64 = 5;

/// Incoming WebSocket message envelope.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum WsIncoming {
    Heartbeat,
}

/// Converts a domain event to its wire message.
fn event_message(event: &BroadcastEvent) -> String {
    match event {
        BroadcastEvent::Device(_) => json!({ "type": "device_list_changed" }).to_string(),
        BroadcastEvent::Log(entry) => {
            json!({ "type": "log_entry", "payload": entry }).to_string()
        }
        other => json!({ "type": "event", "payload": other }).to_string(),
    }
}

/// Upgrades the connection and runs the session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (guard, mut outbound) = state.ws.register();
    let conn_id = guard.id().to_string();
    let (mut sink, mut stream) = socket.split();

    // Immediate snapshot so late subscribers see current state right away.
    let snapshot = status_message(&state.manager.status_all());
    if sink.send(Message::Text(snapshot.into())).await.is_err() {
        return;
    }

    let mut events = state.bridge.subscribe();
    let heartbeat_timeout = Duration::from_secs(state.core.ws_heartbeat_timeout_secs.max(5));
    let mut last_seen = Instant::now();
    let mut heartbeat_check =
        tokio::time::interval(Duration::from_secs(HEARTBEAT_CHECK_SECS));

    loop {
        tokio::select! {
            _ = guard.cancel_token().cancelled() => {
                log::debug!("[WS] {conn_id}: force-closed");
                break;
            }

            _ = heartbeat_check.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    log::info!("[WS] {conn_id}: heartbeat timeout");
                    break;
                }
            }

            // Broadcast fan-out (status updates and direct pushes).
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if sink.send(Message::Text(message.into())).await.is_err() {
                    break;
                }
            }

            // Domain events from the bridge.
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let message = event_message(&event);
                        if sink.send(Message::Text(message.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[WS] {conn_id}: lagged {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            // Client traffic: heartbeats and close.
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<WsIncoming>(&text) {
                            Ok(WsIncoming::Heartbeat) => {}
                            Err(_) => {
                                log::debug!("[WS] {conn_id}: ignoring unknown message");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        log::debug!("[WS] {conn_id}: ignoring binary frame");
                    }
                    Some(Err(e)) => {
                        log::debug!("[WS] {conn_id}: receive error: {e}");
                        break;
                    }
                }
            }
        }
    }
    // ConnectionGuard drop unregisters the connection.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceEvent, LogEvent, PlayerEvent};

    #[test]
    fn device_events_map_to_device_list_changed() {
        let message = event_message(&BroadcastEvent::Device(DeviceEvent::ListChanged {
            timestamp: 1,
        }));
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "device_list_changed");
    }

    #[test]
    fn log_events_map_to_log_entry() {
        let message = event_message(&BroadcastEvent::Log(LogEvent {
            level: "info".into(),
            target: "t".into(),
            message: "m".into(),
            timestamp: 2,
        }));
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "log_entry");
        assert_eq!(value["payload"]["message"], "m");
    }

    #[test]
    fn player_events_map_to_generic_event() {
        let message = event_message(&BroadcastEvent::Player(PlayerEvent::StateChanged {
            player: "kitchen".into(),
            state: "playing".into(),
            timestamp: 3,
        }));
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["payload"]["category"], "player");
    }
}
