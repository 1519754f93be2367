//! Endpoint lifecycle management.
//!
//! The [`PlayerManager`] owns the roster of named endpoints and is the only
//! path for creating, mutating, starting, and stopping them. Each running
//! endpoint gets a full pipeline: timed buffer, drift estimator, adaptive
//! resampler (or drop/insert corrector), sample source, device player, and
//! a protocol-adapter task consuming decoded frames.
//!
//! Concurrency: the endpoint map is a `DashMap` so read-only queries never
//! contend with lifecycle work; a per-endpoint async mutex serializes
//! transitions, and a held mutex answers `Busy` instead of queueing. Every
//! lifecycle operation runs under a deadline; a stop that cannot finish in
//! time forces the endpoint to Error rather than deadlocking.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::corrector::SyncCorrector;
use crate::audio::drift::DriftEstimator;
use crate::audio::resampler::{AdaptiveResampler, ResamplerQuality};
use crate::audio::source::{
    BufferedSampleSource, CorrectionStrategy, SharedSampleSource, SourceControl,
};
use crate::audio::timed_buffer::TimedAudioBuffer;
use crate::audio::{AudioFormat, SampleCodec};
use crate::clock::Clock;
use crate::config::save_roster;
use crate::error::{SpindriftError, SpindriftResult};
use crate::events::EventEmitter;
use crate::player::backend::AudioBackend;
use crate::player::{AudioPlayer, PlayerState, DEFAULT_PERIOD_FRAMES};
use crate::protocol::{StreamAdapter, StreamInput};
use crate::state::{CoreConfig, CorrectionMode, PlayerConfiguration, PlayerStatus};

/// Capacity of the decoded-frame channel between SDK and adapter.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Stream format until the SDK handshake negotiates otherwise.
fn default_stream_format() -> AudioFormat {
    AudioFormat::new(48_000, 2, SampleCodec::F32).expect("static format is valid")
}

/// Running pipeline owned by one endpoint.
struct PlayerRuntime {
    buffer: Arc<TimedAudioBuffer>,
    estimator: Arc<Mutex<DriftEstimator>>,
    source: Arc<Mutex<BufferedSampleSource>>,
    player: AudioPlayer,
    adapter: StreamAdapter,
    frame_tx: mpsc::Sender<StreamInput>,
    cancel: CancellationToken,
}

/// One named endpoint: configuration plus (optionally) a running pipeline.
struct Endpoint {
    config: RwLock<PlayerConfiguration>,
    /// Serializes lifecycle transitions; `try_lock` failure means Busy.
    transition: tokio::sync::Mutex<()>,
    runtime: Mutex<Option<PlayerRuntime>>,
    last_error: Mutex<Option<String>>,
}

impl Endpoint {
    fn new(config: PlayerConfiguration) -> Self {
        Self {
            config: RwLock::new(config),
            transition: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }
}

/// Lifecycle manager for all endpoints in the process.
pub struct PlayerManager {
    core: CoreConfig,
    backend: Arc<dyn AudioBackend>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn EventEmitter>,
    endpoints: DashMap<String, Arc<Endpoint>>,
    roster_path: Option<PathBuf>,
}

impl PlayerManager {
    /// Creates a manager with an empty roster.
    #[must_use]
    pub fn new(
        core: CoreConfig,
        backend: Arc<dyn AudioBackend>,
        clock: Arc<dyn Clock>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            core,
            backend,
            clock,
            emitter,
            endpoints: DashMap::new(),
            roster_path: None,
        }
    }

    /// Seeds from `roster`; a `Some(path)` also enables persistence there.
    pub fn with_roster(
        mut self,
        path: Option<PathBuf>,
        roster: BTreeMap<String, PlayerConfiguration>,
    ) -> Self {
        for (name, config) in roster {
            self.endpoints.insert(name, Arc::new(Endpoint::new(config)));
        }
        self.roster_path = path;
        self
    }

    /// The backend endpoints open devices through.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    fn persist(&self) {
        let Some(path) = &self.roster_path else {
            return;
        };
        let roster: BTreeMap<String, PlayerConfiguration> = self
            .endpoints
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().config.read().clone()))
            .collect();
        if let Err(err) = save_roster(path, &roster) {
            log::error!("[Manager] Roster save failed: {err}");
        }
    }

    fn endpoint(&self, name: &str) -> SpindriftResult<Arc<Endpoint>> {
        self.endpoints
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SpindriftError::NotFound(name.to_string()))
    }

    // ────────────────────────────────────────────────────────────────────
    // CRUD
    // ────────────────────────────────────────────────────────────────────

    /// Creates a new endpoint from `config`.
    ///
    /// # Errors
    ///
    /// `NameInvalid`, `NameConflict`, or `DeviceInvalid`.
    pub fn create(&self, config: PlayerConfiguration) -> SpindriftResult<PlayerConfiguration> {
        config.validate()?;
        if let Some(device) = &config.device_id {
            self.backend
                .validate_device(device)
                .map_err(|e| SpindriftError::DeviceInvalid(e.to_string()))?;
        }
        let name = config.name.clone();
        match self.endpoints.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SpindriftError::NameConflict(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Endpoint::new(config.clone())));
            }
        }
        self.persist();
        log::info!("[Manager] Created endpoint `{name}`");
        Ok(config)
    }

    /// Returns the configuration of `name`.
    ///
    /// # Errors
    ///
    /// `NotFound`.
    pub fn get(&self, name: &str) -> SpindriftResult<PlayerConfiguration> {
        Ok(self.endpoint(name)?.config.read().clone())
    }

    /// All configurations, name-ordered.
    #[must_use]
    pub fn list(&self) -> Vec<PlayerConfiguration> {
        let mut configs: Vec<PlayerConfiguration> = self
            .endpoints
            .iter()
            .map(|entry| entry.value().config.read().clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Replaces the configuration of `name`.
    ///
    /// The name itself is immutable; renames are delete + create. Volume
    /// and delay changes apply to a running pipeline immediately; a device
    /// change switches the live stream.
    ///
    /// # Errors
    ///
    /// `NotFound`, validation errors, or `DeviceInvalid`.
    pub fn update(&self, name: &str, config: PlayerConfiguration) -> SpindriftResult<()> {
        if config.name != name {
            return Err(SpindriftError::InvalidRequest(format!(
                "name is immutable: `{name}` cannot become `{}`",
                config.name
            )));
        }
        config.validate()?;
        if let Some(device) = &config.device_id {
            self.backend
                .validate_device(device)
                .map_err(|e| SpindriftError::DeviceInvalid(e.to_string()))?;
        }

        let endpoint = self.endpoint(name)?;
        let old_device = endpoint.config.read().device_id.clone();
        *endpoint.config.write() = config.clone();

        if let Some(runtime) = endpoint.runtime.lock().as_mut() {
            runtime.player.set_volume(config.volume);
            runtime.adapter.set_delay_ms(config.delay_ms);
            if config.device_id != old_device {
                if let Some(device) = config.device_id.clone() {
                    runtime
                        .player
                        .switch_device(device)
                        .map_err(|e| SpindriftError::Internal(e.to_string()))?;
                }
            }
        }
        self.persist();
        Ok(())
    }

    /// Deletes `name`, stopping it first when running.
    ///
    /// # Errors
    ///
    /// `NotFound` (deleting twice is a 404 the second time, not a 500).
    pub async fn delete(&self, name: &str) -> SpindriftResult<()> {
        let endpoint = self.endpoint(name)?;
        if endpoint.is_running() {
            // Best effort; a stuck stop still releases the map entry.
            if let Err(err) = self.stop(name).await {
                log::warn!("[Manager] Stop during delete of `{name}` failed: {err}");
            }
        }
        self.endpoints.remove(name);
        self.persist();
        log::info!("[Manager] Deleted endpoint `{name}`");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────────

    fn lifecycle_deadline(&self) -> Duration {
        Duration::from_secs(self.core.lifecycle_timeout_secs.max(1))
    }

    /// Starts `name`, building its pipeline and opening the device.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyRunning`, `Busy`, `Timeout`, or `DeviceInvalid`.
    pub async fn start(&self, name: &str) -> SpindriftResult<()> {
        let endpoint = self.endpoint(name)?;
        let _guard = endpoint
            .transition
            .try_lock()
            .map_err(|_| SpindriftError::Busy(name.to_string()))?;
        if endpoint.is_running() {
            return Err(SpindriftError::AlreadyRunning(name.to_string()));
        }

        let config = endpoint.config.read().clone();
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let emitter = self.emitter.clone();
        let capacity_ms = self.core.buffer_capacity_ms;

        let build = tokio::task::spawn_blocking(move || {
            build_runtime(&config, backend, clock, emitter, capacity_ms)
        });

        let built = match tokio::time::timeout(self.lifecycle_deadline(), build).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                let message = format!("pipeline build panicked: {join_err}");
                *endpoint.last_error.lock() = Some(message.clone());
                return Err(SpindriftError::Internal(message));
            }
            Err(_) => {
                // The blocking build may still finish later; its device
                // handle is dropped with the orphaned runtime.
                let message = format!("start of `{name}` exceeded deadline");
                *endpoint.last_error.lock() = Some(message.clone());
                log::error!("[Manager] {message}");
                return Err(SpindriftError::Timeout(name.to_string()));
            }
        };

        match built {
            Ok(mut runtime) => {
                // Spawn the network/decode task now that we own a runtime.
                let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
                let cancel = CancellationToken::new();
                let adapter = runtime.adapter.clone();
                let task_cancel = cancel.clone();
                tokio::spawn(async move { adapter.run(frame_rx, task_cancel).await });
                runtime.frame_tx = frame_tx;
                runtime.cancel = cancel;

                *endpoint.runtime.lock() = Some(runtime);
                *endpoint.last_error.lock() = None;
                log::info!("[Manager] Started endpoint `{name}`");
                Ok(())
            }
            Err(err) => {
                *endpoint.last_error.lock() = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Stops `name`, tearing down its pipeline and releasing the device.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning`, `Busy`, or `Timeout` (endpoint forced to
    /// Error, device handles dropped).
    pub async fn stop(&self, name: &str) -> SpindriftResult<()> {
        let endpoint = self.endpoint(name)?;
        let _guard = endpoint
            .transition
            .try_lock()
            .map_err(|_| SpindriftError::Busy(name.to_string()))?;

        let Some(mut runtime) = endpoint.runtime.lock().take() else {
            return Err(SpindriftError::NotRunning(name.to_string()));
        };
        runtime.cancel.cancel();

        let teardown = tokio::task::spawn_blocking(move || {
            if matches!(
                runtime.player.state(),
                PlayerState::Playing | PlayerState::Paused
            ) {
                if let Err(err) = runtime.player.stop() {
                    log::warn!("[Manager] Player stop error: {err}");
                }
            }
            runtime.player.dispose();
            drop(runtime);
        });

        match tokio::time::timeout(self.lifecycle_deadline(), teardown).await {
            Ok(_) => {
                log::info!("[Manager] Stopped endpoint `{name}`");
                Ok(())
            }
            Err(_) => {
                let message = format!("stop of `{name}` exceeded deadline");
                *endpoint.last_error.lock() = Some(message.clone());
                log::error!("[Manager] {message}");
                Err(SpindriftError::Timeout(name.to_string()))
            }
        }
    }

    /// Stops every running endpoint; used for graceful shutdown.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Err(err) = self.stop(&name).await {
                log::warn!("[Manager] Shutdown stop of `{name}` failed: {err}");
            }
        }
    }

    /// Boot orchestration: profiles, then sinks, then autostart players.
    ///
    /// Card profiles must be restored before custom sinks are created or
    /// remap/combine sinks come up with the wrong channel maps; players
    /// start only after both.
    pub async fn autostart_all_on_boot(&self) {
        if let Err(err) = self.backend.restore_card_profiles() {
            log::error!("[Manager] Card profile restore failed: {err}");
        }
        if let Err(err) = self.backend.create_custom_sinks() {
            log::error!("[Manager] Custom sink creation failed: {err}");
        }

        let names: Vec<String> = self
            .endpoints
            .iter()
            .filter(|entry| entry.value().config.read().autostart)
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            match self.start(&name).await {
                Ok(()) => {}
                Err(err) => log::error!("[Manager] Autostart of `{name}` failed: {err}"),
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Live setters
    // ────────────────────────────────────────────────────────────────────

    /// Sets software volume (0-100) and persists it.
    ///
    /// # Errors
    ///
    /// `NotFound` or `InvalidRequest` for out-of-range values.
    pub fn set_volume(&self, name: &str, volume: u8) -> SpindriftResult<()> {
        if volume > 100 {
            return Err(SpindriftError::InvalidRequest(format!(
                "volume {volume} outside 0..=100"
            )));
        }
        let endpoint = self.endpoint(name)?;
        endpoint.config.write().volume = volume;
        if let Some(runtime) = endpoint.runtime.lock().as_mut() {
            runtime.player.set_volume(volume);
        }
        self.persist();
        Ok(())
    }

    /// Sets the delay offset in milliseconds and persists it.
    ///
    /// # Errors
    ///
    /// `NotFound` or `InvalidRequest` for out-of-range values.
    pub fn set_offset(&self, name: &str, delay_ms: i32) -> SpindriftResult<()> {
        if !crate::state::OFFSET_RANGE_MS.contains(&delay_ms) {
            return Err(SpindriftError::InvalidRequest(format!(
                "delay_ms {delay_ms} outside -1000..=1000"
            )));
        }
        let endpoint = self.endpoint(name)?;
        endpoint.config.write().delay_ms = delay_ms;
        if let Some(runtime) = endpoint.runtime.lock().as_ref() {
            runtime.adapter.set_delay_ms(delay_ms);
        }
        self.persist();
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Queries
    // ────────────────────────────────────────────────────────────────────

    /// Sender for pushing decoded frames into a running endpoint.
    ///
    /// # Errors
    ///
    /// `NotFound` or `NotRunning`.
    pub fn frame_sender(&self, name: &str) -> SpindriftResult<mpsc::Sender<StreamInput>> {
        let endpoint = self.endpoint(name)?;
        let runtime = endpoint.runtime.lock();
        runtime
            .as_ref()
            .map(|r| r.frame_tx.clone())
            .ok_or_else(|| SpindriftError::NotRunning(name.to_string()))
    }

    /// Status snapshot of one endpoint.
    ///
    /// # Errors
    ///
    /// `NotFound`.
    pub fn status(&self, name: &str) -> SpindriftResult<PlayerStatus> {
        let endpoint = self.endpoint(name)?;
        let config = endpoint.config.read().clone();
        let runtime = endpoint.runtime.lock();
        let status = match runtime.as_ref() {
            Some(runtime) => {
                // Never hold the estimator and source locks together: the
                // callback thread acquires source then estimator.
                let (drift_ppm, drift_reliable) = {
                    let estimator = runtime.estimator.lock();
                    (estimator.drift_ppm(), estimator.is_reliable())
                };
                let resampler = runtime.source.lock().resampler_state();
                PlayerStatus {
                    name: config.name,
                    state: runtime.player.state(),
                    volume: config.volume,
                    delay_ms: config.delay_ms,
                    buffer: Some(runtime.buffer.stats()),
                    drift_ppm: Some(drift_ppm),
                    drift_reliable,
                    resampler,
                    last_error: endpoint.last_error.lock().clone(),
                }
            }
            None => PlayerStatus {
                name: config.name,
                state: PlayerState::Stopped,
                volume: config.volume,
                delay_ms: config.delay_ms,
                buffer: None,
                drift_ppm: None,
                drift_reliable: false,
                resampler: None,
                last_error: endpoint.last_error.lock().clone(),
            },
        };
        Ok(status)
    }

    /// Status snapshots for every endpoint, name-ordered.
    #[must_use]
    pub fn status_all(&self) -> Vec<PlayerStatus> {
        let mut names: Vec<String> =
            self.endpoints.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.status(&name).ok())
            .collect()
    }
}

/// Builds the full pipeline for one endpoint (blocking: opens the device).
fn build_runtime(
    config: &PlayerConfiguration,
    backend: Arc<dyn AudioBackend>,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn EventEmitter>,
    capacity_ms: u32,
) -> SpindriftResult<PlayerRuntime> {
    let format = default_stream_format();
    let buffer = Arc::new(TimedAudioBuffer::new(format, capacity_ms, clock.clone()));
    let estimator = Arc::new(Mutex::new(DriftEstimator::default()));
    let control = SourceControl::new();

    let strategy = match config.correction {
        CorrectionMode::Asrc => {
            let mut resampler = AdaptiveResampler::new(ResamplerQuality::High, format);
            resampler.reserve_input(DEFAULT_PERIOD_FRAMES * 4);
            CorrectionStrategy::Adaptive(Box::new(resampler))
        }
        CorrectionMode::DropInsert => {
            CorrectionStrategy::DropInsert(SyncCorrector::new(format.channels))
        }
    };

    let mut source =
        BufferedSampleSource::new(buffer.clone(), clock.clone(), strategy, control.clone());
    source.attach_estimator(estimator.clone());
    source.reserve_blocks(format.samples_for_frames(DEFAULT_PERIOD_FRAMES));
    let source = Arc::new(Mutex::new(source));

    let mut player = AudioPlayer::new(config.name.clone(), backend, emitter.clone());
    player
        .initialize(format)
        .map_err(|e| SpindriftError::Internal(e.to_string()))?;
    player.set_device(config.device_id.clone()).map_err(|e| match e {
        crate::player::PlayerError::Backend(backend_err) => backend_err.into(),
        other => SpindriftError::Internal(other.to_string()),
    })?;
    player.set_volume(config.volume);
    player.set_sample_source(Box::new(SharedSampleSource(source.clone())));
    player.play().map_err(|e| match e {
        crate::player::PlayerError::Backend(backend_err) => backend_err.into(),
        other => SpindriftError::Internal(other.to_string()),
    })?;

    let adapter = StreamAdapter::new(
        config.name.clone(),
        buffer.clone(),
        control,
        estimator.clone(),
        emitter,
    );
    adapter.set_delay_ms(config.delay_ms);

    // Placeholder channel/token; the caller wires the real ones when it
    // spawns the adapter task on the async runtime.
    let (frame_tx, _unused_rx) = mpsc::channel(1);
    Ok(PlayerRuntime {
        buffer,
        estimator,
        source,
        player,
        adapter,
        frame_tx,
        cancel: CancellationToken::new(),
    })
}
