//! Audio backend abstraction.
//!
//! The player delegates device enumeration and stream creation to an
//! [`AudioBackend`] with three variants: PulseAudio (behind the `pulse`
//! feature), direct ALSA (behind `alsa-backend`), and a Mock backend that is
//! always available and drives the write callback from a plain thread.
//!
//! Backends are capability sets, not class hierarchies: every variant
//! answers the same six operations and the player picks one by configuration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::capabilities::{CapabilitySource, DeviceCapabilities};
use crate::audio::AudioFormat;

/// Which backend family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PulseAudio server (or PipeWire's Pulse shim).
    #[serde(rename = "pulseaudio")]
    PulseAudio,
    /// Direct ALSA PCM access.
    #[serde(rename = "alsa")]
    AlsaDirect,
    /// In-process fake device for tests and headless development.
    Mock,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PulseAudio => "pulseaudio",
            Self::AlsaDirect => "alsa",
            Self::Mock => "mock",
        };
        write!(f, "{name}")
    }
}

/// One playback device as reported by a backend.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    /// Backend-scoped stable identifier (sink name, `hw:N,M`, ...).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Backend family providing this device.
    pub provider: BackendKind,
}

/// Backend operation failures.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The device id is unknown to this backend.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The device exists but could not be opened.
    #[error("failed to open device {device}: {reason}")]
    OpenFailed {
        /// Device id that failed.
        device: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// The operation is not supported by this backend variant.
    #[error("operation not supported by {backend} backend: {operation}")]
    Unsupported {
        /// Backend that rejected the operation.
        backend: BackendKind,
        /// Operation name.
        operation: &'static str,
    },

    /// Underlying system call failed.
    #[error("backend system error: {0}")]
    System(String),
}

/// Callback filling one interleaved device block. Runs on the device thread.
pub type WriteCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// A running (or pausable) device stream.
///
/// Implementations own the device handle; dropping the player releases it.
pub trait DevicePlayer: Send {
    /// Starts callback delivery.
    fn start(&mut self) -> Result<(), BackendError>;

    /// Suspends callback delivery without closing the device.
    fn pause(&mut self) -> Result<(), BackendError>;

    /// Resumes a paused stream.
    fn resume(&mut self) -> Result<(), BackendError>;

    /// Stops the stream and releases the device handle.
    fn stop(&mut self) -> Result<(), BackendError>;
}

/// Capability set every backend variant implements.
pub trait AudioBackend: Send + Sync {
    /// The backend family.
    fn kind(&self) -> BackendKind;

    /// Enumerates playback devices.
    fn list_devices(&self) -> Result<Vec<AudioDevice>, BackendError>;

    /// The device used when a configuration names none.
    fn default_device(&self) -> Result<AudioDevice, BackendError>;

    /// Checks that `device_id` exists and is openable.
    fn validate_device(&self, device_id: &str) -> Result<(), BackendError>;

    /// Reports what the device can do, with the source of that knowledge.
    fn capabilities(&self, device_id: &str) -> Result<DeviceCapabilities, BackendError>;

    /// Opens `device_id` with `format` and wires up the write callback.
    ///
    /// `period_frames` is the block size the callback will be asked for.
    fn create_player(
        &self,
        device_id: &str,
        format: AudioFormat,
        callback: WriteCallback,
        period_frames: usize,
    ) -> Result<Box<dyn DevicePlayer>, BackendError>;

    /// Sets hardware (mixer) volume, 0-100.
    fn set_hardware_volume(&self, device_id: &str, volume: u8) -> Result<(), BackendError>;

    /// Restores card profiles so sinks advertise the right channel maps.
    ///
    /// Must run before custom sinks are created at startup; default no-op
    /// for backends without a profile concept.
    fn restore_card_profiles(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Creates configured custom sinks (remap/combine).
    ///
    /// Runs after profile restoration and before player autostart.
    fn create_custom_sinks(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock backend
// ─────────────────────────────────────────────────────────────────────────────

/// Shared render counters for one mock device stream.
#[derive(Default)]
pub struct MockPlayback {
    /// Interleaved samples pulled through the callback.
    pub samples_rendered: AtomicU64,
    /// Callback invocations.
    pub callbacks: AtomicU64,
}

/// In-process backend that consumes audio on a timer thread.
///
/// The mock is deliberately boring: a fixed device list, instant open, and a
/// thread that calls the write callback at the real-time cadence the format
/// implies. Tests use [`MockBackend::last_playback`] to observe rendering.
pub struct MockBackend {
    devices: Vec<AudioDevice>,
    hw_volumes: parking_lot::Mutex<std::collections::HashMap<String, u8>>,
    last_playback: parking_lot::Mutex<Option<Arc<MockPlayback>>>,
}

impl MockBackend {
    /// Creates a mock backend with a default two-device roster.
    #[must_use]
    pub fn new() -> Self {
        Self::with_devices(vec![
            AudioDevice {
                id: "mock:0".into(),
                name: "Mock Primary Output".into(),
                provider: BackendKind::Mock,
            },
            AudioDevice {
                id: "mock:1".into(),
                name: "Mock Secondary Output".into(),
                provider: BackendKind::Mock,
            },
        ])
    }

    /// Creates a mock backend with an explicit device roster.
    #[must_use]
    pub fn with_devices(devices: Vec<AudioDevice>) -> Self {
        Self {
            devices,
            hw_volumes: parking_lot::Mutex::new(std::collections::HashMap::new()),
            last_playback: parking_lot::Mutex::new(None),
        }
    }

    /// Render counters of the most recently created player, if any.
    #[must_use]
    pub fn last_playback(&self) -> Option<Arc<MockPlayback>> {
        self.last_playback.lock().clone()
    }

    /// Hardware volume last set for `device_id`, if any.
    #[must_use]
    pub fn hardware_volume(&self, device_id: &str) -> Option<u8> {
        self.hw_volumes.lock().get(device_id).copied()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn list_devices(&self) -> Result<Vec<AudioDevice>, BackendError> {
        Ok(self.devices.clone())
    }

    fn default_device(&self) -> Result<AudioDevice, BackendError> {
        self.devices
            .first()
            .cloned()
            .ok_or_else(|| BackendError::UnknownDevice("<none>".into()))
    }

    fn validate_device(&self, device_id: &str) -> Result<(), BackendError> {
        if self.devices.iter().any(|d| d.id == device_id) {
            Ok(())
        } else {
            Err(BackendError::UnknownDevice(device_id.to_string()))
        }
    }

    fn capabilities(&self, device_id: &str) -> Result<DeviceCapabilities, BackendError> {
        self.validate_device(device_id)?;
        Ok(DeviceCapabilities::fallback(CapabilitySource::Alsa))
    }

    fn create_player(
        &self,
        device_id: &str,
        format: AudioFormat,
        callback: WriteCallback,
        period_frames: usize,
    ) -> Result<Box<dyn DevicePlayer>, BackendError> {
        self.validate_device(device_id)?;
        let playback = Arc::new(MockPlayback::default());
        *self.last_playback.lock() = Some(playback.clone());
        Ok(Box::new(MockDevicePlayer {
            format,
            period_frames: period_frames.max(64),
            callback: Some(callback),
            playback,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            thread: None,
        }))
    }

    fn set_hardware_volume(&self, device_id: &str, volume: u8) -> Result<(), BackendError> {
        self.validate_device(device_id)?;
        self.hw_volumes
            .lock()
            .insert(device_id.to_string(), volume.min(100));
        Ok(())
    }
}

/// Mock device stream: a thread pulling the callback at audio cadence.
struct MockDevicePlayer {
    format: AudioFormat,
    period_frames: usize,
    callback: Option<WriteCallback>,
    playback: Arc<MockPlayback>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DevicePlayer for MockDevicePlayer {
    fn start(&mut self) -> Result<(), BackendError> {
        let Some(mut callback) = self.callback.take() else {
            return Err(BackendError::System("player already started".into()));
        };
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let running = self.running.clone();
        let paused = self.paused.clone();
        let playback = self.playback.clone();
        let period = Duration::from_micros(self.format.frames_to_us(self.period_frames));
        let block_len = self.format.samples_for_frames(self.period_frames);

        let handle = thread::Builder::new()
            .name("mock-audio".into())
            .spawn(move || {
                let mut block = vec![0.0f32; block_len];
                while running.load(Ordering::SeqCst) {
                    if !paused.load(Ordering::SeqCst) {
                        callback(&mut block);
                        playback
                            .samples_rendered
                            .fetch_add(block.len() as u64, Ordering::Relaxed);
                        playback.callbacks.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(period);
                }
            })
            .map_err(|e| BackendError::System(e.to_string()))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), BackendError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), BackendError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for MockDevicePlayer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PulseAudio backend (feature "pulse")
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "pulse")]
pub use pulse_backend::PulseBackend;

#[cfg(feature = "pulse")]
mod pulse_backend {
    use super::*;
    use libpulse_binding as pulse;
    use libpulse_simple_binding as psimple;

    /// PulseAudio backend over the simple (blocking) API.
    ///
    /// The simple API routes through the server's default or a named sink;
    /// enumeration beyond the default requires the async introspection API
    /// and is reported as the default sink only.
    pub struct PulseBackend {
        app_name: String,
    }

    impl PulseBackend {
        /// Creates a backend identifying itself as `app_name` to the server.
        #[must_use]
        pub fn new(app_name: impl Into<String>) -> Self {
            Self {
                app_name: app_name.into(),
            }
        }

        fn spec_for(format: &AudioFormat) -> pulse::sample::Spec {
            pulse::sample::Spec {
                format: pulse::sample::Format::FLOAT32NE,
                channels: format.channels as u8,
                rate: format.sample_rate,
            }
        }
    }

    impl AudioBackend for PulseBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::PulseAudio
        }

        fn list_devices(&self) -> Result<Vec<AudioDevice>, BackendError> {
            Ok(vec![AudioDevice {
                id: "default".into(),
                name: "PulseAudio default sink".into(),
                provider: BackendKind::PulseAudio,
            }])
        }

        fn default_device(&self) -> Result<AudioDevice, BackendError> {
            Ok(AudioDevice {
                id: "default".into(),
                name: "PulseAudio default sink".into(),
                provider: BackendKind::PulseAudio,
            })
        }

        fn validate_device(&self, _device_id: &str) -> Result<(), BackendError> {
            // Named sinks are resolved by the server at open time; defer.
            Ok(())
        }

        fn capabilities(&self, _device_id: &str) -> Result<DeviceCapabilities, BackendError> {
            Ok(DeviceCapabilities::fallback(
                CapabilitySource::PulseAudioMax,
            ))
        }

        fn create_player(
            &self,
            device_id: &str,
            format: AudioFormat,
            callback: WriteCallback,
            period_frames: usize,
        ) -> Result<Box<dyn DevicePlayer>, BackendError> {
            let spec = Self::spec_for(&format);
            if !spec.is_valid() {
                return Err(BackendError::OpenFailed {
                    device: device_id.to_string(),
                    reason: format!("invalid sample spec for {format}"),
                });
            }
            let sink = if device_id == "default" {
                None
            } else {
                Some(device_id)
            };
            let simple = psimple::Simple::new(
                None,                               // Use default server
                &self.app_name,                     // Application name
                pulse::stream::Direction::Playback, // Playback stream
                sink,                               // Sink name or default
                "Spindrift endpoint",               // Description of the stream
                &spec,                              // Signal specification
                None,                               // Default channel map
                None,                               // Default buffering attributes
            )
            .map_err(|e| BackendError::OpenFailed {
                device: device_id.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Box::new(PulseDevicePlayer {
                simple: Some(simple),
                callback: Some(callback),
                block_len: format.samples_for_frames(period_frames.max(64)),
                running: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(AtomicBool::new(false)),
                thread: None,
            }))
        }

        fn set_hardware_volume(&self, _device_id: &str, _volume: u8) -> Result<(), BackendError> {
            // Volume on the simple API means per-stream soft volume, which the
            // player already applies; mixer control needs the async API.
            Err(BackendError::Unsupported {
                backend: BackendKind::PulseAudio,
                operation: "set_hardware_volume",
            })
        }
    }

    struct PulseDevicePlayer {
        simple: Option<psimple::Simple>,
        callback: Option<WriteCallback>,
        block_len: usize,
        running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl DevicePlayer for PulseDevicePlayer {
        fn start(&mut self) -> Result<(), BackendError> {
            let (Some(simple), Some(mut callback)) = (self.simple.take(), self.callback.take())
            else {
                return Err(BackendError::System("player already started".into()));
            };
            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            let paused = self.paused.clone();
            let block_len = self.block_len;

            let handle = std::thread::Builder::new()
                .name("pulse-audio".into())
                .spawn(move || {
                    let mut block = vec![0.0f32; block_len];
                    while running.load(Ordering::SeqCst) {
                        if paused.load(Ordering::SeqCst) {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            continue;
                        }
                        callback(&mut block);
                        let bytes: &[u8] = bytemuck::cast_slice(&block);
                        if let Err(e) = simple.write(bytes) {
                            log::error!("[Pulse] write failed: {e}");
                            break;
                        }
                    }
                    let _ = simple.drain();
                })
                .map_err(|e| BackendError::System(e.to_string()))?;
            self.thread = Some(handle);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), BackendError> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), BackendError> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), BackendError> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            Ok(())
        }
    }

    impl Drop for PulseDevicePlayer {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ALSA-direct backend (feature "alsa-backend")
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "alsa-backend")]
pub use alsa_backend::AlsaBackend;

#[cfg(feature = "alsa-backend")]
mod alsa_backend {
    use super::*;
    use alsa::device_name::HintIter;
    use alsa::pcm::{Access, Format, HwParams, PCM};
    use alsa::{Direction, ValueOr};

    /// Direct ALSA backend writing interleaved float PCM.
    pub struct AlsaBackend;

    impl AlsaBackend {
        /// Creates the ALSA backend.
        #[must_use]
        pub fn new() -> Self {
            Self
        }

        fn open(device_id: &str, format: &AudioFormat) -> Result<PCM, BackendError> {
            let pcm = PCM::new(device_id, Direction::Playback, false).map_err(|e| {
                BackendError::OpenFailed {
                    device: device_id.to_string(),
                    reason: e.to_string(),
                }
            })?;
            {
                let hwp = HwParams::any(&pcm).map_err(|e| BackendError::System(e.to_string()))?;
                hwp.set_channels(u32::from(format.channels))
                    .map_err(|e| BackendError::System(e.to_string()))?;
                hwp.set_rate(format.sample_rate, ValueOr::Nearest)
                    .map_err(|e| BackendError::System(e.to_string()))?;
                hwp.set_format(Format::float())
                    .map_err(|e| BackendError::System(e.to_string()))?;
                hwp.set_access(Access::RWInterleaved)
                    .map_err(|e| BackendError::System(e.to_string()))?;
                pcm.hw_params(&hwp)
                    .map_err(|e| BackendError::System(e.to_string()))?;
            }
            Ok(pcm)
        }
    }

    impl Default for AlsaBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioBackend for AlsaBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::AlsaDirect
        }

        fn list_devices(&self) -> Result<Vec<AudioDevice>, BackendError> {
            let hints = HintIter::new(None, c"pcm")
                .map_err(|e| BackendError::System(e.to_string()))?;
            let mut devices = Vec::new();
            for hint in hints {
                let Some(name) = hint.name else { continue };
                // Playback-capable or unspecified direction only.
                if matches!(hint.direction, Some(Direction::Capture)) {
                    continue;
                }
                devices.push(AudioDevice {
                    id: name.clone(),
                    name: hint.desc.unwrap_or(name),
                    provider: BackendKind::AlsaDirect,
                });
            }
            Ok(devices)
        }

        fn default_device(&self) -> Result<AudioDevice, BackendError> {
            Ok(AudioDevice {
                id: "default".into(),
                name: "ALSA default device".into(),
                provider: BackendKind::AlsaDirect,
            })
        }

        fn validate_device(&self, device_id: &str) -> Result<(), BackendError> {
            PCM::new(device_id, Direction::Playback, true)
                .map(|_| ())
                .map_err(|e| BackendError::OpenFailed {
                    device: device_id.to_string(),
                    reason: e.to_string(),
                })
        }

        fn capabilities(&self, device_id: &str) -> Result<DeviceCapabilities, BackendError> {
            // Prefer /proc/asound card records when the id names a card.
            if let Some(caps) = super::super::capabilities::probe_device(device_id) {
                return Ok(caps);
            }
            Ok(DeviceCapabilities::fallback(CapabilitySource::Alsa))
        }

        fn create_player(
            &self,
            device_id: &str,
            format: AudioFormat,
            callback: WriteCallback,
            period_frames: usize,
        ) -> Result<Box<dyn DevicePlayer>, BackendError> {
            let pcm = Self::open(device_id, &format)?;
            Ok(Box::new(AlsaDevicePlayer {
                pcm: Some(pcm),
                callback: Some(callback),
                channels: format.channels as usize,
                block_len: format.samples_for_frames(period_frames.max(64)),
                running: Arc::new(AtomicBool::new(false)),
                paused: Arc::new(AtomicBool::new(false)),
                thread: None,
            }))
        }

        fn set_hardware_volume(&self, device_id: &str, volume: u8) -> Result<(), BackendError> {
            use alsa::mixer::{Mixer, SelemId};
            let card = if device_id.starts_with("hw:") {
                device_id.to_string()
            } else {
                "default".to_string()
            };
            let mixer = Mixer::new(&card, false).map_err(|e| BackendError::System(e.to_string()))?;
            for name in ["Master", "PCM", "Speaker"] {
                let id = SelemId::new(name, 0);
                if let Some(selem) = mixer.find_selem(&id) {
                    let (min, max) = selem.get_playback_volume_range();
                    let target =
                        min + (max - min) * i64::from(volume.min(100)) / 100;
                    selem
                        .set_playback_volume_all(target)
                        .map_err(|e| BackendError::System(e.to_string()))?;
                    let _ = selem.set_playback_switch_all(1);
                    return Ok(());
                }
            }
            Err(BackendError::Unsupported {
                backend: BackendKind::AlsaDirect,
                operation: "set_hardware_volume (no Master/PCM control)",
            })
        }
    }

    struct AlsaDevicePlayer {
        pcm: Option<PCM>,
        callback: Option<WriteCallback>,
        channels: usize,
        block_len: usize,
        running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl DevicePlayer for AlsaDevicePlayer {
        fn start(&mut self) -> Result<(), BackendError> {
            let (Some(pcm), Some(mut callback)) = (self.pcm.take(), self.callback.take()) else {
                return Err(BackendError::System("player already started".into()));
            };
            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            let paused = self.paused.clone();
            let block_len = self.block_len;
            let channels = self.channels;

            let handle = std::thread::Builder::new()
                .name("alsa-audio".into())
                .spawn(move || {
                    let mut block = vec![0.0f32; block_len];
                    let io = match pcm.io_f32() {
                        Ok(io) => io,
                        Err(e) => {
                            log::error!("[Alsa] io_f32 failed: {e}");
                            return;
                        }
                    };
                    while running.load(Ordering::SeqCst) {
                        if paused.load(Ordering::SeqCst) {
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            continue;
                        }
                        callback(&mut block);
                        match io.writei(&block) {
                            Ok(frames) if frames * channels < block.len() => {
                                log::trace!("[Alsa] short write: {frames} frames");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                // xrun: recover and keep going.
                                if pcm.try_recover(e, true).is_err() {
                                    log::error!("[Alsa] unrecoverable write error: {e}");
                                    break;
                                }
                            }
                        }
                    }
                    let _ = pcm.drain();
                })
                .map_err(|e| BackendError::System(e.to_string()))?;
            self.thread = Some(handle);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), BackendError> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), BackendError> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), BackendError> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
            Ok(())
        }
    }

    impl Drop for AlsaDevicePlayer {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }
}
