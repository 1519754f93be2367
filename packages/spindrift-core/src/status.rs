//! Process-wide status broadcaster.
//!
//! One background task polls every endpoint runtime on a fixed interval
//! (2s by default) and publishes the snapshots to WebSocket subscribers.
//! Clients that subscribe late receive an immediate snapshot from the
//! WebSocket handler; this task only provides the steady cadence.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::api::WsConnectionManager;
use crate::manager::PlayerManager;
use crate::state::PlayerStatus;

/// Builds the `status_update` wire message.
#[must_use]
pub fn status_message(statuses: &[PlayerStatus]) -> String {
    json!({
        "type": "status_update",
        "payload": statuses,
    })
    .to_string()
}

/// Periodic status publisher.
pub struct StatusBroadcaster {
    manager: Arc<PlayerManager>,
    ws: Arc<WsConnectionManager>,
    interval_secs: u64,
}

impl StatusBroadcaster {
    /// Creates a broadcaster polling every `interval_secs` seconds.
    #[must_use]
    pub fn new(
        manager: Arc<PlayerManager>,
        ws: Arc<WsConnectionManager>,
        interval_secs: u64,
    ) -> Self {
        Self {
            manager,
            ws,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Runs until cancelled. Spawn as a background task.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.ws.connection_count() == 0 {
                        continue;
                    }
                    let statuses = self.manager.status_all();
                    self.ws.broadcast(status_message(&statuses)).await;
                }
            }
        }
        log::debug!("[Status] Broadcaster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerState;

    #[test]
    fn status_message_shape() {
        let statuses = vec![PlayerStatus {
            name: "kitchen".into(),
            state: PlayerState::Stopped,
            volume: 80,
            delay_ms: 0,
            buffer: None,
            drift_ppm: None,
            drift_reliable: false,
            resampler: None,
            last_error: None,
        }];
        let message = status_message(&statuses);
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["payload"][0]["name"], "kitchen");
        assert_eq!(value["payload"][0]["state"], "stopped");
    }
}
