//! Adaptive sample-rate conversion.
//!
//! [`SincResampler`] is a stateful polyphase windowed-sinc converter: a bank
//! of Kaiser-windowed SINC filters indexed by sub-sample phase gives
//! constant-cost fractional-rate conversion, with filter history carried
//! across calls so block boundaries are seamless.
//!
//! [`AdaptiveResampler`] wraps it with the two-term control law that keeps a
//! playing endpoint phase-locked: a drift term from the Kalman estimator
//! (stable, immediate) plus a slow offset term that trims residual error,
//! smoothed so the ratio never moves fast enough to be audible as pitch.

use std::f64::consts::PI;

use thiserror::Error;

use super::AudioFormat;

/// Ratio clamp during fast acquisition (first ~10s of output).
const MAX_DEV_FAST: f64 = 0.02;

/// Ratio clamp during steady state.
const MAX_DEV_STEADY: f64 = 0.005;

/// Fast-acquisition window, in seconds of produced output.
const FAST_ACQUISITION_SECS: u64 = 10;

/// Offset-term deadband: errors inside this are OS scheduling jitter (30ms).
const OFFSET_DEADBAND_US: f64 = 30_000.0;

/// Offset-term time constant (60s). The drift term does the heavy lifting;
/// the offset term only has to bleed off residuals.
const OFFSET_TAU_US: f64 = 60_000_000.0;

/// Per-call smoothing factor toward the target ratio (~1s at 50 calls/s).
const RATIO_ALPHA: f64 = 0.02;

/// Kaiser window beta for the SINC bank design.
const KAISER_BETA: f64 = 6.0;

/// Anti-aliasing cutoff as a fraction of Nyquist. The ratio never departs
/// from unity by more than 2%, so a fixed cutoff with a 5% transition band
/// covers every reachable rate.
const CUTOFF: f64 = 0.95;

/// Conversion failure; callers emit silence and keep their state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConverterError {
    /// Input slice is not a whole number of frames.
    #[error("input of {samples} samples is not a whole number of {channels}-channel frames")]
    RaggedInput {
        /// Interleaved input sample count.
        samples: usize,
        /// Pipeline channel count.
        channels: u16,
    },

    /// Output slice is not a whole number of frames.
    #[error("output of {samples} samples is not a whole number of {channels}-channel frames")]
    RaggedOutput {
        /// Interleaved output sample count.
        samples: usize,
        /// Pipeline channel count.
        channels: u16,
    },

    /// The conversion ratio state became non-finite.
    #[error("conversion ratio is not finite")]
    BadRatio,
}

/// Filter-bank presets: phases x taps.
///
/// More phases lower phase-quantization distortion; more taps sharpen the
/// anti-aliasing skirt. All three are inaudible for the near-unity ratios
/// this pipeline uses; Fast exists for small ARM endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerQuality {
    /// 128 phases x 48 taps.
    #[default]
    High,
    /// 64 phases x 32 taps.
    Balanced,
    /// 32 phases x 24 taps.
    Fast,
}

impl ResamplerQuality {
    /// (phases, taps) for this preset.
    #[must_use]
    pub fn dimensions(self) -> (usize, usize) {
        match self {
            Self::High => (128, 48),
            Self::Balanced => (64, 32),
            Self::Fast => (32, 24),
        }
    }
}

/// Zeroth-order modified Bessel function of the first kind.
///
/// Power-series evaluation; converges in well under 30 terms for the
/// argument range a beta of 6 produces.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..=30 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < 1e-12 * sum {
            break;
        }
    }
    sum
}

/// Kaiser window value at offset `a` from center, half-width `half`.
fn kaiser(a: f64, half: f64) -> f64 {
    let t = a / half;
    if t.abs() >= 1.0 {
        return 0.0;
    }
    bessel_i0(KAISER_BETA * (1.0 - t * t).sqrt()) / bessel_i0(KAISER_BETA)
}

/// Normalized sinc with cutoff `c`: `c * sin(pi c a) / (pi c a)`.
fn sinc(a: f64, c: f64) -> f64 {
    if a.abs() < 1e-9 {
        return c;
    }
    let x = PI * c * a;
    c * x.sin() / x
}

/// Precomputed polyphase filter bank.
///
/// `coeffs[phase * taps + k]` weights input frame `k` of the window for a
/// read position whose fractional part is `phase / phases`. Each phase row
/// is normalized to unity DC gain so constant signals pass through exactly.
struct SincBank {
    phases: usize,
    taps: usize,
    coeffs: Vec<f32>,
}

impl SincBank {
    fn new(quality: ResamplerQuality) -> Self {
        let (phases, taps) = quality.dimensions();
        let half = taps as f64 / 2.0;
        let mut coeffs = vec![0.0f32; phases * taps];
        for phase in 0..phases {
            let frac = phase as f64 / phases as f64;
            let row = &mut coeffs[phase * taps..(phase + 1) * taps];
            let mut sum = 0.0f64;
            for (k, c) in row.iter_mut().enumerate() {
                // Window centered half a filter behind the newest frame the
                // position touches, so interpolation sees both sides.
                let a = (taps - 1) as f64 + frac - k as f64 - half;
                let v = sinc(a, CUTOFF) * kaiser(a, half);
                *c = v as f32;
                sum += v;
            }
            if sum.abs() > f64::EPSILON {
                let norm = (1.0 / sum) as f32;
                for c in row.iter_mut() {
                    *c *= norm;
                }
            }
        }
        Self {
            phases,
            taps,
            coeffs,
        }
    }

    #[inline]
    fn phase_row(&self, frac: f64) -> &[f32] {
        // Nearest-phase lookup; with >=32 phases the quantization noise sits
        // below the window's stopband.
        let idx = ((frac * self.phases as f64) as usize).min(self.phases - 1);
        &self.coeffs[idx * self.taps..(idx + 1) * self.taps]
    }
}

/// Stateful polyphase SINC converter for interleaved frames.
///
/// Holds the trailing `taps` input frames as filter history plus a
/// fractional read position, so consecutive `process` calls form one
/// continuous signal. Scratch is pre-pinned at construction and grown
/// geometrically, never shrunk.
pub struct SincResampler {
    bank: SincBank,
    channels: usize,
    /// Trailing `taps` frames of input, interleaved.
    history: Vec<f32>,
    /// Fractional read position within [history + input], in frames.
    pos: f64,
    /// Work area: history + current input, interleaved.
    work: Vec<f32>,
}

/// Default scratch pre-pin: covers a 100ms device buffer at 48kHz stereo.
const DEFAULT_SCRATCH_FRAMES: usize = 8_192;

impl SincResampler {
    /// Creates a converter for `channels`-channel interleaved audio.
    #[must_use]
    pub fn new(quality: ResamplerQuality, channels: u16) -> Self {
        let bank = SincBank::new(quality);
        let taps = bank.taps;
        let channels = channels as usize;
        let mut work = Vec::new();
        work.reserve_exact((taps + DEFAULT_SCRATCH_FRAMES) * channels);
        Self {
            history: vec![0.0; taps * channels],
            pos: (taps - 1) as f64,
            work,
            bank,
            channels,
        }
    }

    /// Grows the scratch area to fit `frames` input frames per call.
    ///
    /// Call from setup code, not the audio callback.
    pub fn reserve_input(&mut self, frames: usize) {
        let needed = (self.bank.taps + frames) * self.channels;
        if self.work.capacity() < needed {
            self.work
                .reserve_exact(needed.next_power_of_two() - self.work.len());
        }
    }

    /// Converts `input` into `output` at `step` input frames per output frame.
    ///
    /// Returns `(output_frames_written, input_frames_consumed)`. Frames not
    /// consumed must be re-fed at the front of the next call's input.
    ///
    /// # Errors
    ///
    /// [`ConverterError`] on ragged slices or a non-finite step.
    pub fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        step: f64,
    ) -> Result<(usize, usize), ConverterError> {
        let ch = self.channels;
        if input.len() % ch != 0 {
            return Err(ConverterError::RaggedInput {
                samples: input.len(),
                channels: ch as u16,
            });
        }
        if output.len() % ch != 0 {
            return Err(ConverterError::RaggedOutput {
                samples: output.len(),
                channels: ch as u16,
            });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(ConverterError::BadRatio);
        }

        let taps = self.bank.taps;
        let hist_frames = taps;
        let in_frames = input.len() / ch;
        let out_capacity = output.len() / ch;
        let total_frames = hist_frames + in_frames;

        self.work.clear();
        self.work.extend_from_slice(&self.history);
        self.work.extend_from_slice(input);

        let mut produced = 0usize;
        while produced < out_capacity && self.pos < total_frames as f64 {
            let ip = self.pos as usize;
            let frac = self.pos - ip as f64;
            let row = self.bank.phase_row(frac);
            let window_start = (ip + 1 - taps) * ch;
            let out_frame = &mut output[produced * ch..(produced + 1) * ch];
            out_frame.fill(0.0);
            for (k, &coeff) in row.iter().enumerate() {
                let frame = &self.work[window_start + k * ch..window_start + (k + 1) * ch];
                for (o, &s) in out_frame.iter_mut().zip(frame) {
                    *o += coeff * s;
                }
            }
            produced += 1;
            self.pos += step;
        }

        // Retire everything up to the current integer position into history;
        // anything past it goes back to the caller as leftover.
        let hist_end = (self.pos as usize).min(total_frames - 1);
        let consumed = (hist_end + 1).saturating_sub(hist_frames).min(in_frames);
        let hist_start = (hist_end + 1 - taps) * ch;
        // Copy within the work area, then back into pinned history.
        self.history
            .copy_from_slice(&self.work[hist_start..hist_start + taps * ch]);
        self.pos -= (hist_end + 1 - taps) as f64;

        Ok((produced, consumed))
    }

    /// Drops filter history and re-centers the read position.
    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.pos = (self.bank.taps - 1) as f64;
    }

    /// Filter length in frames (group delay is half of this).
    #[must_use]
    pub fn taps(&self) -> usize {
        self.bank.taps
    }
}

/// Snapshot of the adaptive converter's control state.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ResamplerState {
    /// Ratio currently applied (output rate / input rate).
    pub current_ratio: f64,
    /// Ratio the control law is steering toward.
    pub target_ratio: f64,
    /// Process calls since construction or full reset.
    pub process_calls: u64,
    /// True while the wide fast-acquisition clamp is active.
    pub fast_acquisition: bool,
}

/// SINC converter driven by the drift/offset control law.
pub struct AdaptiveResampler {
    inner: SincResampler,
    format: AudioFormat,
    current_ratio: f64,
    target_ratio: f64,
    drift_ppm: f64,
    drift_reliable: bool,
    sync_error_us: f64,
    process_calls: u64,
    /// Output frames produced, for scaling the fast-acquisition window.
    output_frames: u64,
}

impl AdaptiveResampler {
    /// Creates an adaptive converter for the pipeline format.
    #[must_use]
    pub fn new(quality: ResamplerQuality, format: AudioFormat) -> Self {
        Self {
            inner: SincResampler::new(quality, format.channels),
            format,
            current_ratio: 1.0,
            target_ratio: 1.0,
            drift_ppm: 0.0,
            drift_reliable: false,
            sync_error_us: 0.0,
            process_calls: 0,
            output_frames: 0,
        }
    }

    /// Grows scratch for up to `frames` input frames per call (setup only).
    pub fn reserve_input(&mut self, frames: usize) {
        self.inner.reserve_input(frames);
    }

    /// Latest drift estimate from the clock filter.
    pub fn set_drift(&mut self, drift_ppm: f64, reliable: bool) {
        self.drift_ppm = drift_ppm;
        self.drift_reliable = reliable;
    }

    /// Latest smoothed sync error from the timed buffer.
    pub fn set_sync_error(&mut self, error_us: f64) {
        self.sync_error_us = error_us;
    }

    /// True while the wide acquisition clamp applies.
    #[must_use]
    pub fn in_fast_acquisition(&self) -> bool {
        self.output_frames < FAST_ACQUISITION_SECS * u64::from(self.format.sample_rate)
    }

    fn max_deviation(&self) -> f64 {
        if self.in_fast_acquisition() {
            MAX_DEV_FAST
        } else {
            MAX_DEV_STEADY
        }
    }

    /// Applies the control law: drift term plus deadbanded offset term,
    /// clamped, then smoothed into the applied ratio.
    fn update_ratio(&mut self) {
        let drift_term = if self.drift_reliable {
            -self.drift_ppm / 1e6
        } else {
            0.0
        };
        let offset_term = if self.sync_error_us.abs() > OFFSET_DEADBAND_US {
            -self.sync_error_us / OFFSET_TAU_US
        } else {
            0.0
        };
        let max_dev = self.max_deviation();
        self.target_ratio = (1.0 + drift_term + offset_term).clamp(1.0 - max_dev, 1.0 + max_dev);
        self.current_ratio += RATIO_ALPHA * (self.target_ratio - self.current_ratio);
        // The clamp window narrows when acquisition ends; re-apply so the
        // applied ratio also respects the tighter bound.
        self.current_ratio = self
            .current_ratio
            .clamp(1.0 - max_dev, 1.0 + max_dev);
    }

    /// Converts due input into `output` at the adapted ratio.
    ///
    /// Returns `(output_frames, input_frames_consumed)`; unconsumed input is
    /// the caller's leftover for the next call.
    ///
    /// # Errors
    ///
    /// [`ConverterError`] as for [`SincResampler::process`]; callers treat a
    /// failure as "emit silence, keep state".
    pub fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<(usize, usize), ConverterError> {
        self.update_ratio();
        self.process_calls += 1;

        #[cfg(feature = "bypass-unity")]
        if (self.current_ratio - 1.0).abs() < f64::EPSILON {
            let frames = (input.len() / self.format.channels as usize)
                .min(output.len() / self.format.channels as usize);
            let samples = frames * self.format.channels as usize;
            output[..samples].copy_from_slice(&input[..samples]);
            self.output_frames += frames as u64;
            return Ok((frames, frames));
        }

        let step = 1.0 / self.current_ratio;
        let (produced, consumed) = self.inner.process(input, output, step)?;
        self.output_frames += produced as u64;
        Ok((produced, consumed))
    }

    /// Frames of input needed to produce `output_frames`, with margin.
    #[must_use]
    pub fn input_frames_needed(&self, output_frames: usize) -> usize {
        let base = output_frames as f64 / self.current_ratio;
        (base * 1.02).ceil() as usize + 16
    }

    /// Ratio currently applied.
    #[must_use]
    pub fn current_ratio(&self) -> f64 {
        self.current_ratio
    }

    /// Control-state snapshot for diagnostics.
    #[must_use]
    pub fn state(&self) -> ResamplerState {
        ResamplerState {
            current_ratio: self.current_ratio,
            target_ratio: self.target_ratio,
            process_calls: self.process_calls,
            fast_acquisition: self.in_fast_acquisition(),
        }
    }

    /// Clears filter history; `preserve_drift` keeps the learned ratio.
    ///
    /// After a reanchor the stream timeline jumps but the clocks have not
    /// changed, so preserving the ratio (the default) re-locks in a couple
    /// of seconds instead of re-acquiring from scratch.
    pub fn reset(&mut self, preserve_drift: bool) {
        self.inner.reset();
        self.sync_error_us = 0.0;
        if !preserve_drift {
            self.current_ratio = 1.0;
            self.target_ratio = 1.0;
            self.drift_ppm = 0.0;
            self.drift_reliable = false;
            self.process_calls = 0;
            self.output_frames = 0;
        }
    }
}
