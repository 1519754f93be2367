//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The endpoint roster lives in its own YAML document (see
//! `spindrift_core::config`); this file only holds process-level settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use spindrift_core::{BackendKind, CoreConfig, Environment};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS server to.
    /// Override: `SPINDRIFT_BIND_PORT`
    pub bind_port: u16,

    /// Audio backend: `pulseaudio`, `alsa`, or `mock`.
    /// Defaults from environment detection when unset.
    /// Override: `SPINDRIFT_BACKEND`
    pub backend: Option<BackendKind>,

    /// Directory for persistent state (the endpoint roster).
    /// Defaults from environment detection when unset.
    /// Override: `SPINDRIFT_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    /// Timed-buffer capacity per endpoint (milliseconds).
    pub buffer_capacity_ms: u32,

    /// Status broadcast interval (seconds).
    pub status_interval_secs: u64,

    /// Deadline for lifecycle operations (seconds).
    pub lifecycle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = CoreConfig::default();
        Self {
            bind_port: core.bind_port,
            backend: None,
            data_dir: None,
            buffer_capacity_ms: core.buffer_capacity_ms,
            status_interval_secs: core.status_interval_secs,
            lifecycle_timeout_secs: core.lifecycle_timeout_secs,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides. A corrupt file is a fatal startup error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SPINDRIFT_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("SPINDRIFT_BACKEND") {
            match val.as_str() {
                "pulseaudio" => self.backend = Some(BackendKind::PulseAudio),
                "alsa" => self.backend = Some(BackendKind::AlsaDirect),
                "mock" => self.backend = Some(BackendKind::Mock),
                other => log::warn!("Unknown SPINDRIFT_BACKEND `{other}` ignored"),
            }
        }

        // Note: SPINDRIFT_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Resolves the data directory, falling back to environment detection.
    pub fn resolved_data_dir(&self, environment: &Environment) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| environment.data_dir.clone())
    }

    /// Converts to spindrift-core's config type.
    pub fn to_core_config(&self, environment: &Environment) -> CoreConfig {
        CoreConfig {
            bind_port: self.bind_port,
            buffer_capacity_ms: self.buffer_capacity_ms,
            status_interval_secs: self.status_interval_secs,
            lifecycle_timeout_secs: self.lifecycle_timeout_secs,
            backend: self.backend.unwrap_or(environment.default_backend),
            ..Default::default()
        }
    }
}
