//! Timed audio pipeline: buffer, sync estimation, and rate correction.
//!
//! The modules here form the per-endpoint data path between the protocol
//! adapter and the device callback:
//!
//! - [`timed_buffer`] - bounded queue of future-scheduled PCM frames
//! - [`drift`] - Kalman clock-drift estimator fed by buffer sync error
//! - [`resampler`] - adaptive polyphase SINC rate converter
//! - [`corrector`] - legacy drop/insert correction with hysteresis
//! - [`source`] - the sample source driving the device callback

pub mod corrector;
pub mod drift;
pub mod resampler;
pub mod source;
pub mod timed_buffer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum channel count the pipeline supports (7.1 surround).
pub const MAX_CHANNELS: u16 = 8;

/// Sample encoding tag carried alongside the stream format.
///
/// The pipeline itself processes interleaved `f32`; the tag records what the
/// device side negotiates so capability reporting stays accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleCodec {
    /// 32-bit float, the internal processing format.
    F32,
    /// 16-bit signed integer PCM.
    S16,
    /// 24-bit signed integer PCM (packed).
    S24,
    /// 32-bit signed integer PCM.
    S32,
}

impl SampleCodec {
    /// Bytes per single-channel sample for this codec.
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16 => 2,
            Self::S24 => 3,
            Self::F32 | Self::S32 => 4,
        }
    }
}

impl std::fmt::Display for SampleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::F32 => "f32",
            Self::S16 => "s16",
            Self::S24 => "s24",
            Self::S32 => "s32",
        };
        write!(f, "{tag}")
    }
}

/// Errors constructing or matching audio formats.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Sample rate was zero.
    #[error("sample rate must be positive")]
    ZeroSampleRate,

    /// Channel count outside 1..=8.
    #[error("channel count {0} outside supported range 1-{MAX_CHANNELS}")]
    BadChannelCount(u16),

    /// A frame was offered to a pipeline constructed with a different format.
    #[error("format mismatch: buffer is {expected}, frame is {actual}")]
    Mismatch {
        /// Format the pipeline was built with.
        expected: AudioFormat,
        /// Format of the offending frame.
        actual: AudioFormat,
    },

    /// A sample slice was not a whole number of frames for the channel count.
    #[error("ragged frame: {samples} samples do not divide into {channels} channels")]
    RaggedFrame {
        /// Interleaved sample count offered.
        samples: usize,
        /// Channel count of the buffer.
        channels: u16,
    },
}

/// Immutable stream/device format for one pipeline lifetime.
///
/// Changing any field requires tearing down and rebuilding the resampler,
/// sample source, and player; there is deliberately no setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count (1-8).
    pub channels: u16,
    /// Sample encoding tag.
    pub codec: SampleCodec,
}

impl AudioFormat {
    /// Creates a validated format.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] for a zero sample rate or a channel count
    /// outside 1..=8.
    pub fn new(sample_rate: u32, channels: u16, codec: SampleCodec) -> Result<Self, FormatError> {
        if sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(FormatError::BadChannelCount(channels));
        }
        Ok(Self {
            sample_rate,
            channels,
            codec,
        })
    }

    /// Duration of `frames` sample frames in microseconds.
    #[must_use]
    pub fn frames_to_us(&self, frames: usize) -> u64 {
        (frames as u64 * 1_000_000) / u64::from(self.sample_rate)
    }

    /// Number of sample frames covering `us` microseconds (rounded down).
    #[must_use]
    pub fn us_to_frames(&self, us: u64) -> usize {
        ((us * u64::from(self.sample_rate)) / 1_000_000) as usize
    }

    /// Interleaved sample count for `frames` frames.
    #[must_use]
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch/{}", self.sample_rate, self.channels, self.codec)
    }
}

/// One timestamped block of interleaved float samples.
///
/// `playout_ts_us` is the scheduled release time of the first sample on the
/// shared monotonic timeline.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    /// Scheduled playout time of the first sample (microseconds).
    pub playout_ts_us: u64,
    /// Interleaved samples, `frames * channels` long.
    pub samples: Vec<f32>,
}

impl TimedFrame {
    /// Creates a frame from a timestamp and interleaved samples.
    #[must_use]
    pub fn new(playout_ts_us: u64, samples: Vec<f32>) -> Self {
        Self {
            playout_ts_us,
            samples,
        }
    }

    /// Sample-frame count given the owning format.
    #[must_use]
    pub fn frame_count(&self, format: &AudioFormat) -> usize {
        self.samples.len() / format.channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap()
    }

    #[test]
    fn rejects_zero_sample_rate() {
        assert_eq!(
            AudioFormat::new(0, 2, SampleCodec::F32),
            Err(FormatError::ZeroSampleRate)
        );
    }

    #[test]
    fn rejects_out_of_range_channels() {
        assert_eq!(
            AudioFormat::new(48_000, 0, SampleCodec::F32),
            Err(FormatError::BadChannelCount(0))
        );
        assert_eq!(
            AudioFormat::new(48_000, 9, SampleCodec::F32),
            Err(FormatError::BadChannelCount(9))
        );
    }

    #[test]
    fn frame_time_conversions_round_trip() {
        let format = stereo_48k();
        // 960 frames at 48kHz = exactly 20ms
        assert_eq!(format.frames_to_us(960), 20_000);
        assert_eq!(format.us_to_frames(20_000), 960);
    }

    #[test]
    fn timed_frame_counts_frames_per_channel() {
        let format = stereo_48k();
        let frame = TimedFrame::new(0, vec![0.0; 1920]);
        assert_eq!(frame.frame_count(&format), 960);
    }
}
