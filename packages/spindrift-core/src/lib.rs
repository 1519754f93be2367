//! Spindrift Core - shared library for the Spindrift multi-room endpoint.
//!
//! This crate provides the audio synchronization core of a multi-room
//! endpoint: it receives timestamped PCM frames from a Sendspin decode
//! stream and plays them on a local device so that many endpoints on the
//! same LAN stay phase-aligned, despite independent clocks and unpredictable
//! OS scheduling.
//!
//! # Architecture
//!
//! - [`clock`]: the monotonic microsecond timebase everything shares
//! - [`audio`]: timed buffer, drift estimator, adaptive resampler, source
//! - [`player`]: device player state machine and backend abstraction
//! - [`protocol`]: adapter from decoded stream frames to the timed buffer
//! - [`manager`]: endpoint lifecycle (create/start/stop/delete, autostart)
//! - [`events`]: event system for real-time client communication
//! - [`api`]: REST + WebSocket control surface
//! - [`state`] / [`config`]: configuration types and YAML roster
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! - [`Clock`](clock::Clock): monotonic time, swappable in tests
//! - [`SampleSource`](audio::source::SampleSource): what the callback reads
//! - [`AudioBackend`](player::backend::AudioBackend): device access
//!   (PulseAudio / ALSA-direct / Mock)
//! - [`EventEmitter`](events::EventEmitter): emitting domain events

#![warn(clippy::all)]

pub mod api;
pub mod audio;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod player;
pub mod protocol;
pub mod state;
pub mod status;
pub mod utils;

// Re-export commonly used types at the crate root
pub use audio::drift::{ClockSyncStatus, DriftEstimator, DriftFilterConfig};
pub use audio::resampler::{AdaptiveResampler, ConverterError, ResamplerQuality, ResamplerState};
pub use audio::source::{BufferedSampleSource, CorrectionStrategy, SampleSource, SourceControl};
pub use audio::timed_buffer::{BufferStats, TimedAudioBuffer};
pub use audio::{AudioFormat, SampleCodec, TimedFrame};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ErrorCode, SpindriftError, SpindriftResult};
pub use events::{
    BroadcastEvent, BroadcastEventBridge, DeviceEvent, EventEmitter, LogEvent, PlayerEvent,
    StreamEvent,
};
pub use manager::PlayerManager;
pub use player::backend::{AudioBackend, AudioDevice, BackendKind, MockBackend};
pub use player::capabilities::{CapabilitySource, DeviceCapabilities};
pub use player::{AudioPlayer, PlayerState};
pub use protocol::{DecodedFrame, StreamAdapter, StreamInput};
pub use state::{CoreConfig, CorrectionMode, PlayerConfiguration, PlayerStatus};
pub use utils::{now_millis, validate_player_name, NameValidationError};

// Re-export bootstrap and API types
pub use api::{start_server, AppState, AppStateBuilder, ServerError, WsConnectionManager};
pub use bootstrap::{bootstrap_services, make_backend, BootstrappedServices};
pub use config::{load_roster, parse_roster, save_roster};
pub use env::{detect as detect_environment, environment, Environment};
pub use logging::TeeLogger;
pub use status::StatusBroadcaster;
