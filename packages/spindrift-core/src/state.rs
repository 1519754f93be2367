//! Core configuration and status types.
//!
//! Provides the per-endpoint [`PlayerConfiguration`], the published
//! [`PlayerStatus`] snapshot, and process-wide [`CoreConfig`] tunables.

use serde::{Deserialize, Serialize};

use crate::audio::resampler::ResamplerState;
use crate::audio::timed_buffer::BufferStats;
use crate::error::{SpindriftError, SpindriftResult};
use crate::player::backend::BackendKind;
use crate::player::PlayerState;
use crate::utils::validate_player_name;

/// Delay offset bounds in milliseconds.
pub const OFFSET_RANGE_MS: std::ops::RangeInclusive<i32> = -1000..=1000;

/// How rate correction is applied for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrectionMode {
    /// Continuous rate trimming through the adaptive resampler.
    #[default]
    Asrc,
    /// Legacy frame drop/insert with hysteresis.
    DropInsert,
}

/// One endpoint's persistent configuration.
///
/// Created and mutated only through the player manager; the YAML roster is
/// a mapping from endpoint name to this structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerConfiguration {
    /// Endpoint name; unique, max 64 chars, no `/\:*?"<>|`.
    pub name: String,

    /// Sendspin server endpoint (host:port).
    pub server: String,

    /// Output device id, `None` for the backend default.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Static playout delay offset in milliseconds (-1000..=1000).
    #[serde(default)]
    pub delay_ms: i32,

    /// Software volume 0-100.
    #[serde(default = "default_volume")]
    pub volume: u8,

    /// Start this endpoint when the process boots.
    #[serde(default)]
    pub autostart: bool,

    /// Rate-correction strategy.
    #[serde(default)]
    pub correction: CorrectionMode,
}

fn default_volume() -> u8 {
    100
}

impl PlayerConfiguration {
    /// Creates a configuration with defaults for the optional fields.
    #[must_use]
    pub fn new(name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            device_id: None,
            delay_ms: 0,
            volume: default_volume(),
            autostart: false,
            correction: CorrectionMode::default(),
        }
    }

    /// Validates every field, returning the first violation.
    ///
    /// # Errors
    ///
    /// [`SpindriftError::NameInvalid`] or [`SpindriftError::InvalidRequest`]
    /// with a message naming the offending field.
    pub fn validate(&self) -> SpindriftResult<()> {
        validate_player_name(&self.name)?;
        if self.server.trim().is_empty() {
            return Err(SpindriftError::InvalidRequest(
                "server endpoint must not be empty".into(),
            ));
        }
        if self.volume > 100 {
            return Err(SpindriftError::InvalidRequest(format!(
                "volume {} outside 0..=100",
                self.volume
            )));
        }
        if !OFFSET_RANGE_MS.contains(&self.delay_ms) {
            return Err(SpindriftError::InvalidRequest(format!(
                "delay_ms {} outside {}..={}",
                self.delay_ms,
                OFFSET_RANGE_MS.start(),
                OFFSET_RANGE_MS.end()
            )));
        }
        Ok(())
    }
}

/// Published per-endpoint snapshot, pushed over WebSocket every 2s.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    /// Endpoint name.
    pub name: String,
    /// Player state.
    pub state: PlayerState,
    /// Configured volume (0-100).
    pub volume: u8,
    /// Configured delay offset.
    pub delay_ms: i32,
    /// Buffer counters and sync error, when a pipeline exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferStats>,
    /// Drift estimate in ppm, when reliable data exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_ppm: Option<f64>,
    /// True once the drift estimate has converged.
    pub drift_reliable: bool,
    /// Resampler control state, when the ASRC strategy is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resampler: Option<ResamplerState>,
    /// Last error, if the endpoint faulted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Process-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Preferred port for the HTTP/WS server.
    pub bind_port: u16,

    /// Timed-buffer capacity per endpoint (milliseconds).
    pub buffer_capacity_ms: u32,

    /// Status broadcast interval (seconds).
    pub status_interval_secs: u64,

    /// WebSocket heartbeat timeout (seconds).
    pub ws_heartbeat_timeout_secs: u64,

    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,

    /// Deadline for lifecycle operations (seconds).
    pub lifecycle_timeout_secs: u64,

    /// Audio backend the endpoints open devices through.
    pub backend: BackendKind,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            bind_port: 8927,
            buffer_capacity_ms: 400,
            status_interval_secs: 2,
            ws_heartbeat_timeout_secs: 30,
            event_channel_capacity: 256,
            lifecycle_timeout_secs: 5,
            backend: BackendKind::Mock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_validates() {
        let config = PlayerConfiguration::new("kitchen", "ma.local:8097");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_forbidden_name() {
        let config = PlayerConfiguration::new("kitchen/main", "ma.local:8097");
        assert!(matches!(
            config.validate(),
            Err(SpindriftError::NameInvalid(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_volume_and_offset() {
        let mut config = PlayerConfiguration::new("kitchen", "ma.local:8097");
        config.volume = 101;
        assert!(config.validate().is_err());

        config.volume = 100;
        config.delay_ms = 1001;
        assert!(config.validate().is_err());
        config.delay_ms = -1001;
        assert!(config.validate().is_err());
        config.delay_ms = -1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn correction_mode_round_trips_kebab_case() {
        let yaml = "correction: drop-insert\nname: k\nserver: s\n";
        let config: PlayerConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.correction, CorrectionMode::DropInsert);
        let out = serde_yaml::to_string(&config).unwrap();
        assert!(out.contains("drop-insert"));
    }
}
