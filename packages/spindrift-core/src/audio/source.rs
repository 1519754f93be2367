//! Sample source feeding the device callback.
//!
//! [`BufferedSampleSource`] is the single consumer of a pipeline's timed
//! buffer. On every device callback it pushes the latest sync measurements
//! into the drift estimator and resampler, pulls due samples, converts them,
//! and fills the device block - silence-padding any shortfall so the
//! callback never under-delivers to the hardware.
//!
//! Real-time discipline: the read path takes no locks beyond the buffer's
//! counter mutex and the estimator's (uncontended) mutex, and performs no
//! heap allocation once the scratch areas have been reserved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::corrector::SyncCorrector;
use super::drift::DriftEstimator;
use super::resampler::{AdaptiveResampler, ResamplerState};
use super::timed_buffer::TimedAudioBuffer;
use crate::clock::Clock;

/// Minimum spacing between hot-path diagnostic log lines (1s).
const DIAG_INTERVAL_US: u64 = 1_000_000;

/// A callback gap longer than this re-anchors the device-position error
/// (the stream was paused or the device stalled; elapsed wall time in the
/// gap is not playback).
const GAP_REANCHOR_US: u64 = 200_000;

/// Default scratch sizing: frames per device block the source is pre-pinned
/// for. Larger blocks grow the scratch once, outside steady state.
const DEFAULT_BLOCK_FRAMES: usize = 8_192;

/// Abstract sample provider for the device callback.
///
/// `read` must fill `out` completely (silence where no audio is due) and
/// never block; it runs on the real-time audio thread.
pub trait SampleSource: Send {
    /// Fills `out` with interleaved samples, returning the count of samples
    /// that carry real audio (the rest is silence padding).
    fn read(&mut self, out: &mut [f32]) -> usize;
}

/// Control flags shared between the protocol adapter and the callback side.
///
/// The adapter cannot touch the resampler directly - it lives on the
/// callback thread - so timeline events are handed over as atomic flags the
/// source consumes at the top of its next read.
#[derive(Default)]
pub struct SourceControl {
    reanchor_pending: AtomicBool,
}

impl SourceControl {
    /// Creates a cleared control block.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests a drift-preserving resampler reset on the next callback.
    pub fn request_reanchor(&self) {
        self.reanchor_pending.store(true, Ordering::Release);
    }

    /// Consumes a pending reanchor request. Called by the sample source at
    /// the top of each read.
    pub fn take_reanchor(&self) -> bool {
        self.reanchor_pending.swap(false, Ordering::AcqRel)
    }
}

/// Rate-correction strategy, fixed at construction.
pub enum CorrectionStrategy {
    /// Continuous rate trimming through the adaptive SINC converter.
    Adaptive(Box<AdaptiveResampler>),
    /// Legacy frame drop/insert with hysteresis.
    DropInsert(SyncCorrector),
}

/// Pulls timed samples, applies rate correction, fills device blocks.
pub struct BufferedSampleSource {
    buffer: Arc<TimedAudioBuffer>,
    clock: Arc<dyn Clock>,
    strategy: CorrectionStrategy,
    estimator: Option<Arc<Mutex<DriftEstimator>>>,
    control: Arc<SourceControl>,
    /// Input samples fetched but not yet consumed by the converter.
    leftover: Vec<f32>,
    /// Fetch area: leftover + fresh buffer reads.
    scratch: Vec<f32>,
    total_reads: u64,
    /// Consecutive reads that produced only silence.
    zero_read_streak: u64,
    first_samples_seen: bool,
    last_diag_us: u64,
    last_read_us: Option<u64>,
    /// Wall time the first real audio of this playback run was rendered.
    anchor_us: Option<u64>,
    /// Output frames rendered since the anchor, padding included. Against
    /// wall time this yields the device-clock error the drift filter eats:
    /// a fast device renders frames quicker than the wall advances.
    rendered_frames: u64,
}

impl BufferedSampleSource {
    /// Creates a source over `buffer` using the given correction strategy.
    #[must_use]
    pub fn new(
        buffer: Arc<TimedAudioBuffer>,
        clock: Arc<dyn Clock>,
        strategy: CorrectionStrategy,
        control: Arc<SourceControl>,
    ) -> Self {
        let channels = buffer.format().channels as usize;
        let mut source = Self {
            buffer,
            clock,
            strategy,
            estimator: None,
            control,
            leftover: Vec::new(),
            scratch: Vec::new(),
            total_reads: 0,
            zero_read_streak: 0,
            first_samples_seen: false,
            last_diag_us: 0,
            last_read_us: None,
            anchor_us: None,
            rendered_frames: 0,
        };
        source.reserve_blocks(DEFAULT_BLOCK_FRAMES * channels);
        source
    }

    /// Attaches the drift estimator the source feeds and consults.
    pub fn attach_estimator(&mut self, estimator: Arc<Mutex<DriftEstimator>>) {
        self.estimator = Some(estimator);
    }

    /// Pre-pins scratch for device blocks up to `samples` long (setup only).
    pub fn reserve_blocks(&mut self, samples: usize) {
        // Resampler input can exceed the output block during fast
        // acquisition; 4x covers the worst ratio plus leftovers.
        let reserve = samples * 4;
        if self.scratch.capacity() < reserve {
            self.scratch.reserve_exact(reserve - self.scratch.len());
        }
        if self.leftover.capacity() < reserve {
            self.leftover.reserve_exact(reserve - self.leftover.len());
        }
        if let CorrectionStrategy::Adaptive(resampler) = &mut self.strategy {
            let channels = self.buffer.format().channels as usize;
            resampler.reserve_input(reserve / channels.max(1));
        }
    }

    /// Total `read` invocations.
    #[must_use]
    pub fn total_reads(&self) -> u64 {
        self.total_reads
    }

    /// Ratio applied by the adaptive strategy, 1.0 for drop/insert.
    #[must_use]
    pub fn current_ratio(&self) -> f64 {
        match &self.strategy {
            CorrectionStrategy::Adaptive(resampler) => resampler.current_ratio(),
            CorrectionStrategy::DropInsert(_) => 1.0,
        }
    }

    /// Resampler control snapshot; `None` for the drop/insert strategy.
    #[must_use]
    pub fn resampler_state(&self) -> Option<ResamplerState> {
        match &self.strategy {
            CorrectionStrategy::Adaptive(resampler) => Some(resampler.state()),
            CorrectionStrategy::DropInsert(_) => None,
        }
    }

    /// Feeds the estimator and converter with this callback's measurements.
    ///
    /// Two distinct signals: the device-position error (wall elapsed vs
    /// frames rendered) carries the sound-card clock drift and goes to the
    /// Kalman filter; the buffer's content-schedule error carries residual
    /// latency and drives the slow offset trim.
    fn push_sync_measurements(&mut self, now_us: u64) {
        let device_error_us = self.anchor_us.map(|anchor| {
            let rendered_us = self.rendered_frames as f64 * 1_000_000.0
                / f64::from(self.buffer.format().sample_rate);
            now_us.saturating_sub(anchor) as f64 - rendered_us
        });
        let drift = match (&self.estimator, device_error_us) {
            (Some(estimator), Some(error_us)) => {
                let mut estimator = estimator.lock();
                estimator.update(error_us, now_us);
                Some((estimator.drift_ppm(), estimator.is_reliable()))
            }
            _ => None,
        };
        if let CorrectionStrategy::Adaptive(resampler) = &mut self.strategy {
            if let Some((ppm, reliable)) = drift {
                resampler.set_drift(ppm, reliable);
            }
            resampler.set_sync_error(self.buffer.smoothed_sync_error_us());
        }
    }

    /// Rate-limited (<=1/s) hot-path diagnostics.
    fn log_diagnostics(&mut self, now_us: u64, produced: usize, requested: usize) {
        if produced == 0 {
            self.zero_read_streak += 1;
        } else {
            if !self.first_samples_seen {
                self.first_samples_seen = true;
                log::info!(
                    "[Source] First samples delivered after {} reads",
                    self.total_reads
                );
            }
            self.zero_read_streak = 0;
        }

        if now_us.saturating_sub(self.last_diag_us) < DIAG_INTERVAL_US {
            return;
        }
        if produced == 0 && self.first_samples_seen && self.zero_read_streak > 0 {
            self.last_diag_us = now_us;
            log::warn!(
                "[Source] {} consecutive empty reads (buffer underrun or stream stall)",
                self.zero_read_streak
            );
        } else if produced < requested && self.first_samples_seen {
            self.last_diag_us = now_us;
            log::debug!(
                "[Source] Short read: {produced}/{requested} samples, padding silence"
            );
        }
    }

    fn read_adaptive(&mut self, out: &mut [f32], now_us: u64) -> usize {
        let channels = self.buffer.format().channels as usize;
        let out_frames = out.len() / channels;

        let CorrectionStrategy::Adaptive(resampler) = &mut self.strategy else {
            unreachable!("read_adaptive called with drop/insert strategy");
        };

        let needed_samples = resampler.input_frames_needed(out_frames) * channels;
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.leftover);
        self.leftover.clear();
        if self.scratch.len() < needed_samples {
            let fetch = needed_samples - self.scratch.len();
            let start = self.scratch.len();
            self.scratch.resize(start + fetch, 0.0);
            let got = self.buffer.read_raw(&mut self.scratch[start..], now_us);
            self.scratch.truncate(start + got);
        }

        if self.scratch.is_empty() {
            // Nothing due (pre-roll or stall): pure silence, converter state
            // untouched so resumed audio splices onto real history.
            out.fill(0.0);
            return 0;
        }

        match resampler.process(&self.scratch, out) {
            Ok((produced_frames, consumed_frames)) => {
                let consumed = consumed_frames * channels;
                self.leftover.extend_from_slice(&self.scratch[consumed..]);
                let produced = produced_frames * channels;
                out[produced..].fill(0.0);
                produced
            }
            Err(err) => {
                // Emit silence, keep converter state; the next block retries.
                log::error!("[Source] Converter failed: {err}");
                out.fill(0.0);
                0
            }
        }
    }

    fn read_drop_insert(&mut self, out: &mut [f32], now_us: u64) -> usize {
        let error_us = self.buffer.smoothed_sync_error_us();

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.leftover);
        self.leftover.clear();
        if self.scratch.len() < out.len() {
            let start = self.scratch.len();
            self.scratch.resize(out.len(), 0.0);
            let got = self.buffer.read_raw(&mut self.scratch[start..], now_us);
            self.scratch.truncate(start + got);
        }
        let produced_raw = self.scratch.len();

        let CorrectionStrategy::DropInsert(corrector) = &mut self.strategy else {
            unreachable!("read_drop_insert called with adaptive strategy");
        };
        let correction = if produced_raw > 0 {
            corrector.apply(&mut self.scratch, error_us)
        } else {
            Default::default()
        };
        if correction.dropped > 0 || correction.inserted > 0 {
            self.buffer
                .notify_external_correction(correction.dropped, correction.inserted);
        }

        let take = self.scratch.len().min(out.len());
        out[..take].copy_from_slice(&self.scratch[..take]);
        out[take..].fill(0.0);
        // An insertion can leave one frame more than the block holds.
        self.leftover.extend_from_slice(&self.scratch[take..]);
        take
    }
}

impl SampleSource for BufferedSampleSource {
    fn read(&mut self, out: &mut [f32]) -> usize {
        let now_us = self.clock.now_us();
        self.total_reads += 1;

        if self.control.take_reanchor() {
            if let CorrectionStrategy::Adaptive(resampler) = &mut self.strategy {
                resampler.reset(true);
            }
            self.leftover.clear();
            self.anchor_us = None;
            self.rendered_frames = 0;
            log::debug!("[Source] Reanchor applied: converter history cleared, drift kept");
        }

        // A long callback gap means the stream paused or the device stalled;
        // the elapsed wall time was not playback, so re-anchor.
        if let Some(last) = self.last_read_us {
            if now_us.saturating_sub(last) > GAP_REANCHOR_US {
                self.anchor_us = None;
                self.rendered_frames = 0;
            }
        }
        self.last_read_us = Some(now_us);

        self.push_sync_measurements(now_us);

        let adaptive = matches!(self.strategy, CorrectionStrategy::Adaptive(_));
        let produced = if adaptive {
            self.read_adaptive(out, now_us)
        } else {
            self.read_drop_insert(out, now_us)
        };

        if produced > 0 && self.anchor_us.is_none() {
            self.anchor_us = Some(now_us);
            self.rendered_frames = 0;
        }
        if self.anchor_us.is_some() {
            let channels = self.buffer.format().channels as usize;
            self.rendered_frames += (out.len() / channels) as u64;
        }

        self.log_diagnostics(now_us, produced, out.len());
        produced
    }
}

/// Cloneable handle letting the player read a source the manager still
/// observes for diagnostics.
///
/// The inner mutex is only ever contended by status snapshots; the device
/// callback acquires it uncontended in steady state.
pub struct SharedSampleSource(pub Arc<Mutex<BufferedSampleSource>>);

impl SampleSource for SharedSampleSource {
    fn read(&mut self, out: &mut [f32]) -> usize {
        self.0.lock().read(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::resampler::ResamplerQuality;
    use crate::audio::{AudioFormat, SampleCodec};
    use crate::clock::ManualClock;

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap()
    }

    fn adaptive_source(
        clock: Arc<ManualClock>,
        buffer: Arc<TimedAudioBuffer>,
    ) -> BufferedSampleSource {
        let resampler = AdaptiveResampler::new(ResamplerQuality::Fast, *buffer.format());
        BufferedSampleSource::new(
            buffer,
            clock,
            CorrectionStrategy::Adaptive(Box::new(resampler)),
            SourceControl::new(),
        )
    }

    #[test]
    fn preroll_produces_silence() {
        let clock = ManualClock::arc(1_000_000);
        let buffer = Arc::new(TimedAudioBuffer::new(stereo_48k(), 500, clock.clone()));
        buffer
            .write(&vec![0.5f32; 96 * 40], clock.now_us() + 80_000)
            .unwrap();

        let mut source = adaptive_source(clock.clone(), buffer);
        let mut out = vec![1.0f32; 1920];
        let produced = source.read(&mut out);
        assert_eq!(produced, 0);
        assert!(out.iter().all(|&s| s == 0.0), "pre-roll must be silence");
    }

    #[test]
    fn due_audio_flows_through_converter() {
        let clock = ManualClock::arc(1_000_000);
        let buffer = Arc::new(TimedAudioBuffer::new(stereo_48k(), 500, clock.clone()));
        // 100ms of DC 0.5 due immediately.
        buffer
            .write(&vec![0.5f32; 96 * 100], clock.now_us())
            .unwrap();

        let mut source = adaptive_source(clock.clone(), buffer);
        let mut out = vec![0.0f32; 1920];

        // First blocks flush the converter warm-up; later blocks carry DC.
        for _ in 0..4 {
            clock.advance_us(20_000);
            source.read(&mut out);
        }
        let produced = source.read(&mut out);
        assert_eq!(produced, out.len());
        let mid = out.len() / 2;
        assert!(
            (out[mid] - 0.5).abs() < 1e-2,
            "expected DC 0.5 after warm-up, got {}",
            out[mid]
        );
    }

    #[test]
    fn drop_insert_path_reports_corrections() {
        let clock = ManualClock::arc(1_000_000);
        let buffer = Arc::new(TimedAudioBuffer::new(stereo_48k(), 500, clock.clone()));
        buffer
            .write(&vec![0.5f32; 96 * 200], clock.now_us())
            .unwrap();

        let mut source = BufferedSampleSource::new(
            buffer.clone(),
            clock.clone(),
            CorrectionStrategy::DropInsert(SyncCorrector::new(2)),
            SourceControl::new(),
        );

        // Build up behind-schedule error: read slower than real time.
        let mut out = vec![0.0f32; 960];
        for _ in 0..20 {
            clock.advance_us(40_000);
            source.read(&mut out);
        }

        let stats = buffer.stats();
        assert!(
            stats.dropped_sync > 0,
            "behind-schedule playback should engage dropping"
        );
        // Accounting stays balanced despite the corrections.
        assert_eq!(
            stats.dropped_overflow + stats.dropped_sync + stats.total_read
                + buffer.buffered_samples(),
            stats.total_written
        );
    }

    #[test]
    fn reanchor_request_clears_leftover_keeps_ratio() {
        let clock = ManualClock::arc(1_000_000);
        let buffer = Arc::new(TimedAudioBuffer::new(stereo_48k(), 500, clock.clone()));
        buffer
            .write(&vec![0.5f32; 96 * 100], clock.now_us())
            .unwrap();

        let control = SourceControl::new();
        let resampler = AdaptiveResampler::new(ResamplerQuality::Fast, stereo_48k());
        let mut source = BufferedSampleSource::new(
            buffer,
            clock.clone(),
            CorrectionStrategy::Adaptive(Box::new(resampler)),
            control.clone(),
        );

        let mut out = vec![0.0f32; 960];
        source.read(&mut out);
        let ratio_before = source.current_ratio();

        control.request_reanchor();
        clock.advance_us(20_000);
        source.read(&mut out);
        assert!((source.current_ratio() - ratio_before).abs() < 100.0e-6);
        assert!(source.leftover.is_empty() || source.leftover.len() < 960);
    }

    #[test]
    fn silence_padding_fills_short_reads() {
        let clock = ManualClock::arc(1_000_000);
        let buffer = Arc::new(TimedAudioBuffer::new(stereo_48k(), 500, clock.clone()));
        // Only 1ms of audio available for a 20ms block.
        buffer.write(&vec![0.5f32; 96], clock.now_us()).unwrap();

        let mut source = adaptive_source(clock.clone(), buffer);
        let mut out = vec![1.0f32; 1920];
        let produced = source.read(&mut out);
        assert!(produced < out.len());
        assert!(out[produced..].iter().all(|&s| s == 0.0));
    }
}
