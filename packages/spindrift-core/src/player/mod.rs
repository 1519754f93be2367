//! Audio player: device stream lifecycle and the real-time write callback.
//!
//! [`AudioPlayer`] owns one device stream at a time and runs the callback
//! that pulls samples from the pipeline's sample source, applies software
//! volume and mute, and hands the block to the backend. Panics inside the
//! callback are trapped and surfaced as [`PlayerEvent::ErrorOccurred`]
//! events; the device thread itself never unwinds.
//!
//! State machine: Uninitialized -> Stopped -> Playing <-> Paused -> Stopped,
//! any state -> Error. `initialize` must run first and `set_sample_source`
//! before `play`.

pub mod backend;
pub mod capabilities;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::audio::source::SampleSource;
use crate::audio::AudioFormat;
use crate::events::{EventEmitter, PlayerEvent};
use crate::utils::now_millis;
use backend::{AudioBackend, BackendError, DevicePlayer, WriteCallback};

/// Device block size the callback is asked for (20ms at 48kHz).
pub const DEFAULT_PERIOD_FRAMES: usize = 960;

/// Player lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    /// Constructed but not yet given a format.
    Uninitialized,
    /// Ready; no device stream open.
    Stopped,
    /// Device stream running, callback live.
    Playing,
    /// Device stream open but suspended.
    Paused,
    /// A fault occurred; the device handle has been released.
    Error,
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Player operation failures.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Operation requires an initialized player.
    #[error("player not initialized")]
    NotInitialized,

    /// `play` was called without a sample source.
    #[error("no sample source set")]
    NoSource,

    /// The requested transition is not legal from the current state.
    #[error("cannot {operation} while {from}")]
    InvalidTransition {
        /// State the player was in.
        from: PlayerState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// The backend rejected an operation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One endpoint's device player.
pub struct AudioPlayer {
    name: String,
    backend: Arc<dyn AudioBackend>,
    emitter: Arc<dyn EventEmitter>,
    format: Option<AudioFormat>,
    device_id: Option<String>,
    period_frames: usize,
    state: PlayerState,
    last_error: Option<String>,
    source: Option<Arc<Mutex<Box<dyn SampleSource>>>>,
    /// Linear gain as f32 bits; the callback reads it lock-free.
    volume_bits: Arc<AtomicU32>,
    muted: Arc<AtomicBool>,
    stream: Option<Box<dyn DevicePlayer>>,
}

impl AudioPlayer {
    /// Creates a player for endpoint `name` on the given backend.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn AudioBackend>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            emitter,
            format: None,
            device_id: None,
            period_frames: DEFAULT_PERIOD_FRAMES,
            state: PlayerState::Uninitialized,
            last_error: None,
            source: None,
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            muted: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PlayerState {
        self.state
    }

    /// Last trapped or transition error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The device the player opens, or the backend default.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state == state {
            return;
        }
        log::info!("[Player] {}: {} -> {}", self.name, self.state, state);
        self.state = state;
        self.emitter.emit_player(PlayerEvent::StateChanged {
            player: self.name.clone(),
            state: state.to_string(),
            timestamp: now_millis(),
        });
    }

    /// Gives the player its immutable stream format. Must be called first.
    ///
    /// # Errors
    ///
    /// [`PlayerError::InvalidTransition`] unless Uninitialized.
    pub fn initialize(&mut self, format: AudioFormat) -> Result<(), PlayerError> {
        if self.state != PlayerState::Uninitialized {
            return Err(PlayerError::InvalidTransition {
                from: self.state,
                operation: "initialize",
            });
        }
        self.format = Some(format);
        self.set_state(PlayerState::Stopped);
        Ok(())
    }

    /// Sets the sample source the callback reads from. Required before play.
    pub fn set_sample_source(&mut self, source: Box<dyn SampleSource>) {
        self.source = Some(Arc::new(Mutex::new(source)));
    }

    /// Selects the output device; `None` means the backend default.
    ///
    /// # Errors
    ///
    /// [`PlayerError::Backend`] when validation fails.
    pub fn set_device(&mut self, device_id: Option<String>) -> Result<(), PlayerError> {
        if let Some(id) = &device_id {
            self.backend.validate_device(id)?;
        }
        self.device_id = device_id;
        Ok(())
    }

    /// Software volume 0-100, mapped to linear gain.
    pub fn set_volume(&mut self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.volume_bits.store(gain.to_bits(), Ordering::Relaxed);
        self.emitter.emit_player(PlayerEvent::VolumeChanged {
            player: self.name.clone(),
            volume: volume.min(100),
            timestamp: now_millis(),
        });
    }

    /// Mutes or unmutes the callback output.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn build_callback(&self) -> Result<WriteCallback, PlayerError> {
        let source = self.source.as_ref().ok_or(PlayerError::NoSource)?.clone();
        let volume_bits = self.volume_bits.clone();
        let muted = self.muted.clone();
        let emitter = self.emitter.clone();
        let name = self.name.clone();

        Ok(Box::new(move |block: &mut [f32]| {
            let result = catch_unwind(AssertUnwindSafe(|| {
                source.lock().read(block);
                if muted.load(Ordering::Relaxed) {
                    block.fill(0.0);
                    return;
                }
                let gain = f32::from_bits(volume_bits.load(Ordering::Relaxed));
                if (gain - 1.0).abs() > f32::EPSILON {
                    for sample in block.iter_mut() {
                        *sample *= gain;
                    }
                }
            }));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic in audio callback".into());
                // The block may be half-written garbage; silence it.
                block.fill(0.0);
                log::error!("[Player] {name}: callback panic trapped: {message}");
                emitter.emit_player(PlayerEvent::ErrorOccurred {
                    player: name.clone(),
                    message,
                    timestamp: now_millis(),
                });
            }
        }))
    }

    fn open_stream(&mut self) -> Result<(), PlayerError> {
        let format = self.format.ok_or(PlayerError::NotInitialized)?;
        let device_id = match &self.device_id {
            Some(id) => id.clone(),
            None => self.backend.default_device()?.id,
        };
        let callback = self.build_callback()?;
        let mut stream =
            self.backend
                .create_player(&device_id, format, callback, self.period_frames)?;
        stream.start()?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Starts playback, or resumes from pause.
    ///
    /// # Errors
    ///
    /// [`PlayerError`] on bad state, missing source, or device failure; a
    /// device failure moves the player to Error.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        match self.state {
            PlayerState::Stopped => {
                if let Err(err) = self.open_stream() {
                    self.enter_error(&err.to_string());
                    return Err(err);
                }
                self.set_state(PlayerState::Playing);
                Ok(())
            }
            PlayerState::Paused => self.resume(),
            from => Err(PlayerError::InvalidTransition {
                from,
                operation: "play",
            }),
        }
    }

    /// Suspends the device stream.
    ///
    /// # Errors
    ///
    /// [`PlayerError::InvalidTransition`] unless Playing.
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        if self.state != PlayerState::Playing {
            return Err(PlayerError::InvalidTransition {
                from: self.state,
                operation: "pause",
            });
        }
        if let Some(stream) = &mut self.stream {
            stream.pause()?;
        }
        self.set_state(PlayerState::Paused);
        Ok(())
    }

    /// Resumes a paused stream.
    ///
    /// # Errors
    ///
    /// [`PlayerError::InvalidTransition`] unless Paused.
    pub fn resume(&mut self) -> Result<(), PlayerError> {
        if self.state != PlayerState::Paused {
            return Err(PlayerError::InvalidTransition {
                from: self.state,
                operation: "resume",
            });
        }
        if let Some(stream) = &mut self.stream {
            stream.resume()?;
        }
        self.set_state(PlayerState::Playing);
        Ok(())
    }

    /// Stops playback and releases the device handle.
    ///
    /// # Errors
    ///
    /// [`PlayerError::InvalidTransition`] unless Playing or Paused.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        if !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(PlayerError::InvalidTransition {
                from: self.state,
                operation: "stop",
            });
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop()?;
        }
        self.set_state(PlayerState::Stopped);
        Ok(())
    }

    /// Reopens on `device_id` with the same format and source.
    ///
    /// Resumes playback if the player was playing; an open failure on the
    /// new device moves the player to Error with the old stream released.
    ///
    /// # Errors
    ///
    /// [`PlayerError`] on validation or reopen failure.
    pub fn switch_device(&mut self, device_id: String) -> Result<(), PlayerError> {
        self.backend.validate_device(&device_id)?;
        let was_playing = self.state == PlayerState::Playing;

        if let Some(mut stream) = self.stream.take() {
            stream.stop()?;
        }
        self.device_id = Some(device_id);

        if matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            if let Err(err) = self.open_stream() {
                self.enter_error(&err.to_string());
                return Err(err);
            }
            if !was_playing {
                // Reopened for a paused player: hold the stream suspended.
                if let Some(stream) = &mut self.stream {
                    stream.pause()?;
                }
            }
        }
        Ok(())
    }

    /// Moves the player to Error, releasing the device.
    pub fn enter_error(&mut self, message: &str) {
        self.last_error = Some(message.to_string());
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.stop();
        }
        self.set_state(PlayerState::Error);
        self.emitter.emit_player(PlayerEvent::ErrorOccurred {
            player: self.name.clone(),
            message: message.to_string(),
            timestamp: now_millis(),
        });
    }

    /// Releases all resources. Safe to call repeatedly, from any state.
    pub fn dispose(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.stop();
        }
        self.source = None;
        if self.state != PlayerState::Uninitialized {
            self.set_state(PlayerState::Uninitialized);
            self.format = None;
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.dispose();
    }
}
