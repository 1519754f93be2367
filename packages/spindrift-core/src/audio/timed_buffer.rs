//! Bounded buffer of future-scheduled PCM frames.
//!
//! The timed buffer sits between the protocol adapter (writer) and the
//! buffered sample source (reader). Frames carry their scheduled playout
//! timestamp; the reader only receives samples that are due, so pre-roll
//! silence and inter-frame gaps fall out of the release logic rather than
//! being special-cased by callers.
//!
//! Accounting invariant maintained at all times:
//! `dropped_overflow + dropped_sync + total_read + buffered == total_written`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::{AudioFormat, FormatError, TimedFrame};
use crate::clock::Clock;

/// How far ahead of `now` a frame may be and still count as due.
///
/// One device buffer of slack (20ms) absorbs callback scheduling jitter
/// without releasing audio meaningfully early.
pub const DUE_LOOKAHEAD_US: u64 = 20_000;

/// Time constant of the sync-error smoothing IIR (200ms).
const SYNC_ERROR_TAU_US: f64 = 200_000.0;

/// Counter snapshot plus derived state, taken under the buffer lock.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    /// Interleaved samples accepted from the writer (including later drops).
    pub total_written: u64,
    /// Interleaved samples handed to the reader.
    pub total_read: u64,
    /// Samples discarded because the buffer was full (oldest-first).
    pub dropped_overflow: u64,
    /// Samples discarded for timing reasons: stale on arrival or duplicates.
    pub dropped_sync: u64,
    /// Samples the reader reported inserting (duplication) downstream.
    pub inserted_sync: u64,
    /// Number of overflow events.
    pub overrun_count: u64,
    /// Number of reads that found due data missing mid-playback.
    pub underrun_count: u64,
    /// Audio currently buffered, in milliseconds of playback.
    pub buffered_ms: f64,
    /// Configured capacity, in milliseconds.
    pub target_ms: f64,
    /// True once the earliest scheduled timestamp has been reached.
    pub is_playback_active: bool,
    /// Smoothed scheduled-vs-actual error in microseconds (positive = behind).
    pub sync_error_us: f64,
}

struct Inner {
    /// Queued frames ordered by timestamp.
    frames: VecDeque<TimedFrame>,
    /// Read offset in interleaved samples into the front frame.
    front_offset: usize,
    /// Interleaved samples currently queued (net of `front_offset`).
    buffered_samples: u64,
    /// End timestamp (exclusive) of the newest queued frame.
    queue_end_ts_us: u64,
    /// End timestamp of the last accepted write, for duplicate detection.
    last_write_end_ts_us: Option<u64>,
    total_written: u64,
    total_read: u64,
    dropped_overflow: u64,
    dropped_sync: u64,
    inserted_sync: u64,
    overrun_count: u64,
    underrun_count: u64,
    playback_active: bool,
    smoothed_error_us: f64,
    error_initialized: bool,
    last_error_sample_us: u64,
}

/// Bounded queue of timestamped PCM, with sync-error measurement.
///
/// One mutex guards the queue and counters. The writer never blocks: a full
/// buffer sheds its oldest frames. The reader never blocks either: before the
/// first due sample `read_raw` simply returns 0.
pub struct TimedAudioBuffer {
    format: AudioFormat,
    capacity_samples: u64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    rate_tx: watch::Sender<f64>,
}

impl TimedAudioBuffer {
    /// Creates a buffer holding at most `capacity_ms` of audio.
    #[must_use]
    pub fn new(format: AudioFormat, capacity_ms: u32, clock: Arc<dyn Clock>) -> Self {
        let capacity_frames = format.us_to_frames(u64::from(capacity_ms) * 1_000);
        let (rate_tx, _) = watch::channel(1.0f64);
        Self {
            format,
            capacity_samples: format.samples_for_frames(capacity_frames) as u64,
            clock,
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                front_offset: 0,
                buffered_samples: 0,
                queue_end_ts_us: 0,
                last_write_end_ts_us: None,
                total_written: 0,
                total_read: 0,
                dropped_overflow: 0,
                dropped_sync: 0,
                inserted_sync: 0,
                overrun_count: 0,
                underrun_count: 0,
                playback_active: false,
                smoothed_error_us: 0.0,
                error_initialized: false,
                last_error_sample_us: 0,
            }),
            rate_tx,
        }
    }

    /// The format this buffer was constructed with.
    #[must_use]
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Subscribes to target playback-rate change notifications.
    ///
    /// Receivers must be dropped on pipeline teardown; the channel keeps no
    /// reference to subscribers beyond the watch handle.
    #[must_use]
    pub fn subscribe_playback_rate(&self) -> watch::Receiver<f64> {
        self.rate_tx.subscribe()
    }

    /// Publishes a new target playback rate to subscribers.
    pub fn set_target_playback_rate(&self, rate: f64) {
        // send_replace never fails; a channel with no receivers just drops it.
        let _ = self.rate_tx.send_replace(rate);
    }

    /// Appends interleaved samples scheduled at `playout_ts_us`.
    ///
    /// Stale frames (entirely older than `now - lookahead`) and duplicates
    /// (overlapping the previous write) are counted into `dropped_sync` and
    /// discarded. When the buffer is full the oldest frames are shed.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Mismatch`] when `samples` is not a whole number
    /// of frames for the constructed channel count.
    pub fn write(&self, samples: &[f32], playout_ts_us: u64) -> Result<(), FormatError> {
        if samples.is_empty() {
            return Ok(());
        }
        let channels = self.format.channels as usize;
        if samples.len() % channels != 0 {
            return Err(FormatError::RaggedFrame {
                samples: samples.len(),
                channels: self.format.channels,
            });
        }

        let now = self.clock.now_us();
        let frame_count = samples.len() / channels;
        let duration_us = self.format.frames_to_us(frame_count);
        let end_ts = playout_ts_us + duration_us;

        let mut inner = self.inner.lock();
        inner.total_written += samples.len() as u64;

        // Entirely stale: would have finished playing before the lookahead
        // window. Counts as a drop, never as playback.
        if end_ts + DUE_LOOKAHEAD_US < now {
            inner.dropped_sync += samples.len() as u64;
            return Ok(());
        }

        // Duplicate or rewound timestamp: the adapter re-sent audio we already
        // queued. Reanchors go through clear(), so this is always discard.
        if let Some(last_end) = inner.last_write_end_ts_us {
            if playout_ts_us < last_end {
                inner.dropped_sync += samples.len() as u64;
                return Ok(());
            }
        }

        inner.frames.push_back(TimedFrame::new(playout_ts_us, samples.to_vec()));
        inner.buffered_samples += samples.len() as u64;
        inner.last_write_end_ts_us = Some(end_ts);
        inner.queue_end_ts_us = end_ts;

        // Oldest-drop overflow: shed whole frames from the front until the
        // new frame fits. The writer is never the one to block.
        if inner.buffered_samples > self.capacity_samples {
            inner.overrun_count += 1;
            while inner.buffered_samples > self.capacity_samples {
                let Some(front) = inner.frames.front() else {
                    break;
                };
                let remaining = front.samples.len() - inner.front_offset;
                inner.dropped_overflow += remaining as u64;
                inner.buffered_samples -= remaining as u64;
                inner.front_offset = 0;
                inner.frames.pop_front();
            }
        }
        Ok(())
    }

    /// Copies due samples into `out`, returning the count written.
    ///
    /// A sample is due when its timestamp is at most `now + lookahead`.
    /// Returns 0 during pre-roll (first frame still in the future) without
    /// signalling failure; mid-playback shortfalls bump `underrun_count`.
    pub fn read_raw(&self, out: &mut [f32], now_us: u64) -> usize {
        let channels = self.format.channels as usize;
        if out.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock();
        // Error is sampled against the frame about to be released, before
        // the consume loop advances the cursor past everything due.
        self.update_sync_error(&mut inner, now_us);
        let mut written = 0usize;

        while written < out.len() {
            let Some(front) = inner.frames.front() else {
                break;
            };

            // Timestamp of the next unread sample inside the front frame.
            let offset_frames = inner.front_offset / channels;
            let next_ts = front.playout_ts_us + self.format.frames_to_us(offset_frames);
            if next_ts > now_us + DUE_LOOKAHEAD_US {
                break;
            }

            let frame_len = front.samples.len();
            let available = frame_len - inner.front_offset;
            let want = out.len() - written;
            let take = available.min(want);
            let start = inner.front_offset;
            out[written..written + take]
                .copy_from_slice(&front.samples[start..start + take]);
            written += take;
            inner.front_offset += take;
            if inner.front_offset == frame_len {
                inner.frames.pop_front();
                inner.front_offset = 0;
            }
        }

        inner.total_read += written as u64;
        inner.buffered_samples -= written as u64;

        if written > 0 && !inner.playback_active {
            inner.playback_active = true;
        }
        if inner.playback_active && written < out.len() {
            inner.underrun_count += 1;
        }
        written
    }

    /// Updates the smoothed scheduled-vs-actual error.
    ///
    /// Instantaneous error is `now - next_ts` of the sample about to be
    /// released: positive when that sample is already overdue (content
    /// running behind its schedule), negative when it is still early.
    /// External drop/insert corrections move the cursor and are therefore
    /// already reflected in the front timestamp.
    fn update_sync_error(&self, inner: &mut Inner, now_us: u64) {
        if !inner.playback_active {
            return;
        }
        let channels = self.format.channels as usize;
        let Some(front) = inner.frames.front() else {
            // Nothing queued: no measurement, hold the smoothed value.
            inner.last_error_sample_us = now_us;
            return;
        };
        let offset_frames = inner.front_offset / channels;
        let next_ts = front.playout_ts_us + self.format.frames_to_us(offset_frames);
        let raw_error = now_us as f64 - next_ts as f64;

        if !inner.error_initialized {
            inner.smoothed_error_us = raw_error;
            inner.error_initialized = true;
        } else {
            let dt = now_us.saturating_sub(inner.last_error_sample_us) as f64;
            let alpha = (dt / (SYNC_ERROR_TAU_US + dt)).clamp(0.0, 1.0);
            inner.smoothed_error_us += alpha * (raw_error - inner.smoothed_error_us);
        }
        inner.last_error_sample_us = now_us;
    }

    /// Records samples the reader dropped or inserted after `read_raw`.
    ///
    /// The buffer itself did not produce these samples; the counters keep its
    /// playback-position accounting honest when the legacy drop/insert
    /// strategy is active. Counts are interleaved samples.
    pub fn notify_external_correction(&self, dropped: usize, inserted: usize) {
        let mut inner = self.inner.lock();
        inner.dropped_sync += dropped as u64;
        // Dropped samples were read but never played; they must leave the
        // read-side tally for the accounting invariant to hold.
        inner.total_read -= dropped as u64;
        inner.inserted_sync += inserted as u64;
    }

    /// Smoothed sync error in microseconds; positive means behind schedule.
    #[must_use]
    pub fn smoothed_sync_error_us(&self) -> f64 {
        self.inner.lock().smoothed_error_us
    }

    /// Discards all queued audio and re-arms pre-roll detection.
    ///
    /// Counters survive (a reanchor is not amnesia about past drops), but the
    /// sync-error filter restarts so stale error does not leak into the new
    /// timeline.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let discarded = inner.buffered_samples;
        inner.dropped_sync += discarded;
        inner.frames.clear();
        inner.front_offset = 0;
        inner.buffered_samples = 0;
        inner.last_write_end_ts_us = None;
        inner.queue_end_ts_us = 0;
        inner.playback_active = false;
        inner.smoothed_error_us = 0.0;
        inner.error_initialized = false;
    }

    /// Snapshot of counters and derived state.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let now = self.clock.now_us();
        let inner = self.inner.lock();
        let buffered_ms = if inner.buffered_samples == 0 {
            0.0
        } else {
            // Time axis, not sample count: spans from now to the end of the
            // newest frame, so pre-roll lead time is included.
            (inner.queue_end_ts_us.saturating_sub(now)) as f64 / 1_000.0
        };
        BufferStats {
            total_written: inner.total_written,
            total_read: inner.total_read,
            dropped_overflow: inner.dropped_overflow,
            dropped_sync: inner.dropped_sync,
            inserted_sync: inner.inserted_sync,
            overrun_count: inner.overrun_count,
            underrun_count: inner.underrun_count,
            buffered_ms: buffered_ms.max(0.0),
            target_ms: self.capacity_samples as f64
                / f64::from(self.format.sample_rate)
                / f64::from(self.format.channels)
                * 1_000.0,
            is_playback_active: inner.playback_active,
            sync_error_us: inner.smoothed_error_us,
        }
    }

    /// Interleaved samples currently queued.
    #[must_use]
    pub fn buffered_samples(&self) -> u64 {
        self.inner.lock().buffered_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleCodec;
    use crate::clock::ManualClock;

    fn stereo_48k() -> AudioFormat {
        AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap()
    }

    /// 1ms of stereo 48kHz audio = 48 frames = 96 interleaved samples.
    fn block_ms(ms: u64, value: f32) -> Vec<f32> {
        vec![value; (48 * 2 * ms) as usize]
    }

    fn setup(capacity_ms: u32) -> (Arc<ManualClock>, TimedAudioBuffer) {
        let clock = ManualClock::arc(1_000_000);
        let buffer = TimedAudioBuffer::new(stereo_48k(), capacity_ms, clock.clone());
        (clock, buffer)
    }

    fn assert_accounting(buffer: &TimedAudioBuffer) {
        let stats = buffer.stats();
        let buffered = buffer.buffered_samples();
        assert_eq!(
            stats.dropped_overflow + stats.dropped_sync + stats.total_read + buffered,
            stats.total_written,
            "sample accounting must balance"
        );
    }

    #[test]
    fn preroll_returns_zero_then_releases_on_schedule() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();

        // 40ms of audio scheduled 80ms out.
        buffer.write(&block_ms(40, 0.5), now + 80_000).unwrap();

        let mut out = vec![0.0f32; 96];
        // Well before the schedule (beyond lookahead): nothing due.
        assert_eq!(buffer.read_raw(&mut out, clock.now_us()), 0);
        assert!(!buffer.stats().is_playback_active);

        clock.advance_us(40_000);
        assert_eq!(buffer.read_raw(&mut out, clock.now_us()), 0);

        // At the scheduled instant samples emerge.
        clock.advance_us(40_000);
        assert_eq!(buffer.read_raw(&mut out, clock.now_us()), 96);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < f32::EPSILON));
        assert!(buffer.stats().is_playback_active);
        assert_accounting(&buffer);
    }

    #[test]
    fn lookahead_releases_slightly_early() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();
        buffer.write(&block_ms(10, 1.0), now + 15_000).unwrap();

        // 15ms ahead is inside the 20ms lookahead window.
        let mut out = vec![0.0f32; 96];
        assert_eq!(buffer.read_raw(&mut out, now), 96);
    }

    #[test]
    fn total_read_never_exceeds_total_written() {
        let (clock, buffer) = setup(200);
        let now = clock.now_us();
        buffer.write(&block_ms(20, 0.1), now).unwrap();

        let mut out = vec![0.0f32; 4096];
        let read = buffer.read_raw(&mut out, clock.now_us());
        assert_eq!(read, 20 * 96);
        let stats = buffer.stats();
        assert!(stats.total_read <= stats.total_written);
        assert_accounting(&buffer);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let (clock, buffer) = setup(200);
        let now = clock.now_us();

        // 250ms into a 200ms buffer, written as 25 x 10ms frames.
        for i in 0..25u64 {
            buffer
                .write(&block_ms(10, i as f32), now + 10_000 * i)
                .unwrap();
        }

        let stats = buffer.stats();
        // At least 50ms worth of samples must have been shed.
        assert!(
            stats.dropped_overflow >= 50 * 96,
            "dropped {} samples, expected >= {}",
            stats.dropped_overflow,
            50 * 96
        );
        assert!(stats.overrun_count >= 1);
        assert_accounting(&buffer);

        // Oldest frames went first: the head of the queue is no longer 0.0.
        clock.advance_us(60_000);
        let mut out = vec![0.0f32; 96];
        assert_eq!(buffer.read_raw(&mut out, clock.now_us()), 96);
        assert!(out[0] > 0.0, "oldest frame should have been dropped");
    }

    #[test]
    fn stale_write_counts_as_drop_not_play() {
        let (clock, buffer) = setup(200);
        let now = clock.now_us();

        // Entirely in the past, beyond the lookahead window.
        buffer.write(&block_ms(10, 0.7), now - 100_000).unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.dropped_sync, 10 * 96);
        assert_eq!(buffer.buffered_samples(), 0);
        assert_accounting(&buffer);
    }

    #[test]
    fn duplicate_timestamps_are_discarded() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();

        buffer.write(&block_ms(10, 0.1), now + 50_000).unwrap();
        // Same timestamp again: duplicate delivery from the network.
        buffer.write(&block_ms(10, 0.2), now + 50_000).unwrap();

        let stats = buffer.stats();
        assert_eq!(stats.dropped_sync, 10 * 96);
        assert_eq!(buffer.buffered_samples(), 10 * 96);
        assert_accounting(&buffer);
    }

    #[test]
    fn far_future_write_defers_playback() {
        let (clock, buffer) = setup(10_000);
        let now = clock.now_us();

        buffer.write(&block_ms(20, 0.3), now + 5_000_000).unwrap();
        let mut out = vec![0.0f32; 96];
        assert_eq!(buffer.read_raw(&mut out, clock.now_us()), 0);
        assert!(buffer.stats().buffered_ms > 4_900.0);
        assert!(!buffer.stats().is_playback_active);
    }

    #[test]
    fn underrun_counted_only_after_playback_starts() {
        let (clock, buffer) = setup(200);
        let now = clock.now_us();
        buffer.write(&block_ms(1, 0.5), now).unwrap();

        let mut out = vec![0.0f32; 192];
        // Partial read: 96 due samples into a 192 request.
        let read = buffer.read_raw(&mut out, clock.now_us());
        assert_eq!(read, 96);
        assert_eq!(buffer.stats().underrun_count, 1);
    }

    #[test]
    fn sync_error_positive_when_behind() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();
        buffer.write(&block_ms(100, 0.5), now).unwrap();

        // Start playback, then let wall time advance without consuming.
        let mut out = vec![0.0f32; 96];
        buffer.read_raw(&mut out, clock.now_us());
        clock.advance_us(50_000);
        buffer.read_raw(&mut out, clock.now_us());
        clock.advance_us(50_000);
        buffer.read_raw(&mut out, clock.now_us());

        assert!(
            buffer.smoothed_sync_error_us() > 0.0,
            "stale queued audio must read as behind-schedule"
        );
    }

    #[test]
    fn clear_discards_audio_and_rearms_preroll() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();
        buffer.write(&block_ms(50, 0.5), now).unwrap();
        let mut out = vec![0.0f32; 96];
        buffer.read_raw(&mut out, clock.now_us());
        assert!(buffer.stats().is_playback_active);

        buffer.clear();
        assert_eq!(buffer.buffered_samples(), 0);
        assert!(!buffer.stats().is_playback_active);
        assert_eq!(buffer.smoothed_sync_error_us(), 0.0);
        assert_accounting(&buffer);
    }

    #[test]
    fn external_corrections_balance_accounting() {
        let (clock, buffer) = setup(500);
        let now = clock.now_us();
        buffer.write(&block_ms(50, 0.5), now).unwrap();

        let mut out = vec![0.0f32; 960];
        let read = buffer.read_raw(&mut out, clock.now_us());
        assert_eq!(read, 960);

        // Reader dropped one 2-sample frame and inserted none.
        buffer.notify_external_correction(2, 0);
        let stats = buffer.stats();
        assert_eq!(stats.dropped_sync, 2);
        assert_eq!(stats.inserted_sync, 0);
        assert_accounting(&buffer);
    }

    #[test]
    fn playback_rate_watch_notifies_subscribers() {
        let (_clock, buffer) = setup(200);
        let mut rx = buffer.subscribe_playback_rate();
        assert_eq!(*rx.borrow(), 1.0);
        buffer.set_target_playback_rate(1.001);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1.001);
    }
}
