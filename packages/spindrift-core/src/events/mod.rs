//! Event system for real-time client communication.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - Event types for the player, stream, device, and log domains
//!
//! The actual transport (WebSocket push) is handled separately in the `api`
//! module using [`BroadcastEventBridge`].

mod emitter;

pub use emitter::{BroadcastEventBridge, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events broadcast to clients.
///
/// Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Events from player lifecycle and the audio callback.
    Player(PlayerEvent),

    /// Events from the protocol adapter's stream session.
    Stream(StreamEvent),

    /// Events from device enumeration.
    Device(DeviceEvent),

    /// Streamed log records.
    Log(LogEvent),
}

/// Player lifecycle and callback events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlayerEvent {
    /// The player's state machine moved.
    StateChanged {
        /// Endpoint name.
        player: String,
        /// New state, serialized in lowercase.
        state: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A trapped error from the device callback or a failed transition.
    ErrorOccurred {
        /// Endpoint name.
        player: String,
        /// Human-readable description.
        message: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// Software volume changed.
    VolumeChanged {
        /// Endpoint name.
        player: String,
        /// New volume (0-100).
        volume: u8,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Stream-session events from the protocol adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// Decoded frames started arriving.
    Started {
        /// Endpoint name.
        player: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The stream paused at the transport level.
    Paused {
        /// Endpoint name.
        player: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The stream ended.
    Ended {
        /// Endpoint name.
        player: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The stream timeline jumped; buffered audio was discarded.
    Reanchored {
        /// Endpoint name.
        player: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Device enumeration events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    /// The set of playback devices changed.
    ListChanged {
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// A log record mirrored onto the push channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Log level as text (error, warn, info, debug, trace).
    pub level: String,
    /// Module path that produced the record.
    pub target: String,
    /// Formatted message.
    pub message: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_millis;

    #[test]
    fn events_serialize_with_category_and_type_tags() {
        let event = BroadcastEvent::Player(PlayerEvent::StateChanged {
            player: "kitchen".into(),
            state: "playing".into(),
            timestamp: now_millis(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "player");
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["player"], "kitchen");
    }

    #[test]
    fn log_events_carry_level_and_target() {
        let event = BroadcastEvent::Log(LogEvent {
            level: "warn".into(),
            target: "spindrift_core::player".into(),
            message: "xrun recovered".into(),
            timestamp: 1,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["category"], "log");
        assert_eq!(json["level"], "warn");
    }
}
