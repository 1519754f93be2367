//! End-to-end timing scenarios for the audio pipeline.
//!
//! These tests wire the real components together - protocol adapter, timed
//! buffer, drift estimator, adaptive resampler, sample source, device
//! player - and replay the timing situations the pipeline exists to
//! handle: pre-roll, a constant device-clock drift, and a stream reanchor.
//! The manual-clock tests drive the chain deterministically; the last test
//! runs the whole thing against a mock device's real callback thread.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spindrift_core::audio::resampler::ResamplerQuality;
use spindrift_core::audio::source::{CorrectionStrategy, SharedSampleSource, SourceControl};
use spindrift_core::events::NoopEventEmitter;
use spindrift_core::{
    AdaptiveResampler, AudioFormat, AudioPlayer, BufferedSampleSource, Clock, DecodedFrame,
    DriftEstimator, ManualClock, MockBackend, MonotonicClock, PlayerState, SampleCodec,
    SampleSource, StreamAdapter, StreamInput, TimedAudioBuffer,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FRAME_US: u64 = 20_000;
const FRAMES_PER_BLOCK: usize = 960;
const SAMPLES_PER_BLOCK: usize = FRAMES_PER_BLOCK * 2;

struct Harness {
    clock: Arc<ManualClock>,
    buffer: Arc<TimedAudioBuffer>,
    estimator: Arc<Mutex<DriftEstimator>>,
    control: Arc<SourceControl>,
    source: BufferedSampleSource,
    /// Next frame's playout timestamp.
    next_stamp: u64,
    /// Device time at which the next frame is delivered.
    next_arrival: f64,
}

impl Harness {
    fn new(lead_us: u64) -> Self {
        let clock = ManualClock::arc(1_000_000);
        let format = AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap();
        let buffer = Arc::new(TimedAudioBuffer::new(format, 400, clock.clone()));
        let estimator = Arc::new(Mutex::new(DriftEstimator::default()));
        let control = SourceControl::new();
        let resampler = AdaptiveResampler::new(ResamplerQuality::Fast, format);
        let mut source = BufferedSampleSource::new(
            buffer.clone(),
            clock.clone(),
            CorrectionStrategy::Adaptive(Box::new(resampler)),
            control.clone(),
        );
        source.attach_estimator(estimator.clone());

        let start = clock.now_us();
        Self {
            clock,
            buffer,
            estimator,
            control,
            source,
            next_stamp: start + lead_us,
            next_arrival: start as f64,
        }
    }

    /// Delivers every frame whose (real-time) arrival moment has passed.
    /// Frames carry accurate wall-clock stamps spaced exactly 20ms.
    fn deliver_due_frames(&mut self) {
        let now = self.clock.now_us();
        while self.next_arrival <= now as f64 {
            self.buffer
                .write(&vec![0.25f32; SAMPLES_PER_BLOCK], self.next_stamp)
                .unwrap();
            self.next_stamp += FRAME_US;
            self.next_arrival += FRAME_US as f64;
        }
    }

    /// One device callback: the device clock is slow by `device_ppm`, so a
    /// 20ms output block takes slightly longer than 20ms of wall time.
    fn tick(&mut self, device_ppm: f64) -> usize {
        let wall_per_block = FRAME_US as f64 * (1.0 + device_ppm / 1e6);
        self.clock.advance_us(wall_per_block.round() as u64);
        self.deliver_due_frames();
        let mut out = vec![0.0f32; SAMPLES_PER_BLOCK];
        self.source.read(&mut out)
    }

    fn run_seconds(&mut self, seconds: u64, device_ppm: f64) {
        for _ in 0..seconds * 50 {
            self.tick(device_ppm);
        }
    }
}

#[test]
fn preroll_silence_then_on_schedule_release() {
    let mut harness = Harness::new(80_000);

    // 40ms of audio stamped 80ms out; nothing more arrives.
    harness.next_arrival = f64::MAX; // suppress the steady writer
    let start = harness.clock.now_us();
    harness
        .buffer
        .write(&vec![0.5f32; SAMPLES_PER_BLOCK * 2], start + 80_000)
        .unwrap();

    // Callbacks in the first 40ms deliver pure silence.
    for _ in 0..2 {
        harness.clock.advance_us(FRAME_US);
        let mut out = vec![1.0f32; SAMPLES_PER_BLOCK];
        let produced = harness.source.read(&mut out);
        assert_eq!(produced, 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    // One device period before the stamp the release window opens, so the
    // samples hit the DAC on schedule.
    let mut produced_at = None;
    for _ in 0..4 {
        harness.clock.advance_us(FRAME_US);
        let mut out = vec![0.0f32; SAMPLES_PER_BLOCK];
        if harness.source.read(&mut out) > 0 && produced_at.is_none() {
            produced_at = Some(harness.clock.now_us() - start);
        }
    }
    let produced_at = produced_at.expect("audio must emerge");
    assert!(
        (60_000..=80_000).contains(&produced_at),
        "audio emerged at +{produced_at}us"
    );

    // Content error equals the fixed one-period release lead, within 2ms.
    let error = harness.buffer.smoothed_sync_error_us();
    assert!(
        (error + FRAME_US as f64).abs() < 2_000.0,
        "release misaligned: {error}us"
    );
}

#[test]
fn constant_drift_converges_to_injected_rate() {
    let mut harness = Harness::new(100_000);

    // Device clock slow by 50ppm against the frame timeline.
    harness.run_seconds(15, 50.0);

    let drift = harness.estimator.lock().drift_ppm();
    assert!(
        (drift - 50.0).abs() < 5.0,
        "drift {drift} ppm, wanted 50 +/- 5 within 15s"
    );
    assert!(harness.estimator.lock().is_reliable());

    let ratio = harness.source.current_ratio();
    let expected = 1.0 - 50.0 / 1e6;
    assert!(
        (ratio - expected).abs() < 20.0e-6,
        "ratio {ratio} not within 20ppm of {expected}"
    );

    // Rate trimming, not frame surgery: no overflow, accounting intact.
    let stats = harness.buffer.stats();
    assert_eq!(stats.overrun_count, 0);
    assert_eq!(stats.dropped_overflow, 0);
    assert_eq!(stats.inserted_sync, 0);
    assert_eq!(
        stats.dropped_overflow + stats.dropped_sync + stats.total_read
            + harness.buffer.buffered_samples(),
        stats.total_written
    );
}

#[test]
fn reanchor_keeps_rate_and_resumes_within_one_period() {
    let mut harness = Harness::new(100_000);
    harness.run_seconds(15, 50.0);
    let ratio_before = harness.source.current_ratio();

    // Timeline jump: what the protocol adapter does on a reanchor event.
    harness.buffer.clear();
    harness.estimator.lock().reanchor();
    harness.control.request_reanchor();
    assert_eq!(harness.buffer.buffered_samples(), 0);

    // New timeline; the first post-jump frame is due immediately and the
    // writer continues contiguously after it.
    let now = harness.clock.now_us();
    harness.next_stamp = now + FRAME_US;
    harness.next_arrival = now as f64;
    harness
        .buffer
        .write(&vec![0.5f32; SAMPLES_PER_BLOCK], now)
        .unwrap();

    // First new samples render within one device period.
    harness.clock.advance_us(FRAME_US);
    let mut out = vec![0.0f32; SAMPLES_PER_BLOCK];
    let produced = harness.source.read(&mut out);
    assert!(produced > 0, "new-timeline audio must render immediately");

    // Learned rate survived the jump.
    let ratio_after = harness.source.current_ratio();
    assert!(
        (ratio_after - ratio_before).abs() < 100.0e-6,
        "reanchor moved ratio from {ratio_before} to {ratio_after}"
    );

    // Re-lock within 2 seconds of fresh playback.
    harness.run_seconds(2, 50.0);
    let expected = 1.0 - 50.0 / 1e6;
    let ratio = harness.source.current_ratio();
    assert!(
        (ratio - expected).abs() < 20.0e-6,
        "ratio {ratio} did not re-lock to {expected}"
    );
    assert!(harness.estimator.lock().is_reliable());
}

/// Lets spawned tasks on the current-thread runtime drain their queues.
async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn frames_through_adapter_emerge_rate_corrected() {
    // Full decode-to-callback chain on a manual clock: decoded frames enter
    // through the protocol adapter's task, cross the timed buffer, and come
    // out of the sample source rate-corrected against a 50ppm device error.
    let clock = ManualClock::arc(1_000_000);
    let format = AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap();
    let buffer = Arc::new(TimedAudioBuffer::new(format, 400, clock.clone()));
    let estimator = Arc::new(Mutex::new(DriftEstimator::default()));
    let control = SourceControl::new();
    let resampler = AdaptiveResampler::new(ResamplerQuality::Fast, format);
    let mut source = BufferedSampleSource::new(
        buffer.clone(),
        clock.clone(),
        CorrectionStrategy::Adaptive(Box::new(resampler)),
        control.clone(),
    );
    source.attach_estimator(estimator.clone());

    let adapter = StreamAdapter::new(
        "kitchen",
        buffer.clone(),
        control,
        estimator.clone(),
        Arc::new(NoopEventEmitter),
    );
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let adapter = adapter.clone();
        let cancel = cancel.clone();
        async move { adapter.run(rx, cancel).await }
    });

    let start = clock.now_us();
    let mut next_stamp = start + 100_000;
    let mut next_arrival = start as f64;
    let mut out = vec![0.0f32; SAMPLES_PER_BLOCK];

    for _ in 0..15 * 50 {
        // Device slow by 50ppm: a 20ms block spans 20.001ms of wall time.
        clock.advance_us(20_001);
        let now = clock.now_us();
        while next_arrival <= now as f64 {
            tx.send(StreamInput::Frame(DecodedFrame {
                playout_ts_us: next_stamp,
                samples: vec![0.25; SAMPLES_PER_BLOCK],
            }))
            .await
            .unwrap();
            next_stamp += FRAME_US;
            next_arrival += FRAME_US as f64;
        }
        settle().await;
        source.read(&mut out);
    }

    // The stream made it through: the last block carries audio, not padding.
    assert!(
        (out[SAMPLES_PER_BLOCK / 2] - 0.25).abs() < 1e-2,
        "expected stream audio at the output, got {}",
        out[SAMPLES_PER_BLOCK / 2]
    );

    let drift = estimator.lock().drift_ppm();
    assert!((drift - 50.0).abs() < 5.0, "drift {drift} ppm, wanted 50 +/- 5");
    let expected = 1.0 - 50.0 / 1e6;
    let ratio = source.current_ratio();
    assert!(
        (ratio - expected).abs() < 20.0e-6,
        "ratio {ratio} not within 20ppm of {expected}"
    );

    let stats = buffer.stats();
    assert_eq!(stats.overrun_count, 0);
    assert_eq!(
        stats.dropped_overflow + stats.dropped_sync + stats.total_read
            + buffer.buffered_samples(),
        stats.total_written
    );

    // Reanchor arrives over the protocol, not by poking the pipeline.
    let ratio_before = source.current_ratio();
    tx.send(StreamInput::Reanchor).await.unwrap();
    settle().await;
    assert_eq!(buffer.buffered_samples(), 0);
    assert!((source.current_ratio() - ratio_before).abs() < 100.0e-6);

    // First new-timeline frame renders within one device period.
    tx.send(StreamInput::Frame(DecodedFrame {
        playout_ts_us: clock.now_us(),
        samples: vec![0.5; SAMPLES_PER_BLOCK],
    }))
    .await
    .unwrap();
    settle().await;
    clock.advance_us(FRAME_US);
    assert!(source.read(&mut out) > 0);

    drop(tx);
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_chain_renders_stream_audio_on_device() {
    // Adapter task into the buffer, sample source behind the player's
    // callback, mock device thread pulling blocks: decoded frames end up
    // as rendered samples without the pipeline losing count of any.
    let clock = MonotonicClock::arc();
    let format = AudioFormat::new(48_000, 2, SampleCodec::F32).unwrap();
    let buffer = Arc::new(TimedAudioBuffer::new(format, 400, clock.clone()));
    let estimator = Arc::new(Mutex::new(DriftEstimator::default()));
    let control = SourceControl::new();
    let resampler = AdaptiveResampler::new(ResamplerQuality::Fast, format);
    let mut source = BufferedSampleSource::new(
        buffer.clone(),
        clock.clone(),
        CorrectionStrategy::Adaptive(Box::new(resampler)),
        control.clone(),
    );
    source.attach_estimator(estimator.clone());
    let source = Arc::new(Mutex::new(source));

    let backend = Arc::new(MockBackend::new());
    let mut player = AudioPlayer::new("kitchen", backend.clone(), Arc::new(NoopEventEmitter));
    player.initialize(format).unwrap();
    player.set_device(Some("mock:0".into())).unwrap();
    player.set_sample_source(Box::new(SharedSampleSource(source.clone())));

    let adapter = StreamAdapter::new(
        "kitchen",
        buffer.clone(),
        control,
        estimator,
        Arc::new(NoopEventEmitter),
    );
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let adapter = adapter.clone();
        let cancel = cancel.clone();
        async move { adapter.run(rx, cancel).await }
    });

    player.play().unwrap();

    // Half a second of stream, stamped a couple of device periods ahead.
    let first_stamp = clock.now_us() + 40_000;
    for i in 0..25u64 {
        tx.send(StreamInput::Frame(DecodedFrame {
            playout_ts_us: first_stamp + i * FRAME_US,
            samples: vec![0.25; SAMPLES_PER_BLOCK],
        }))
        .await
        .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(player.state(), PlayerState::Playing);
    let playback = backend.last_playback().unwrap();
    assert!(
        playback
            .samples_rendered
            .load(std::sync::atomic::Ordering::Relaxed)
            > 0
    );

    let stats = buffer.stats();
    assert!(
        stats.total_read > 0,
        "stream audio never reached the device path"
    );
    assert_eq!(
        stats.dropped_overflow + stats.dropped_sync + stats.total_read
            + buffer.buffered_samples(),
        stats.total_written
    );

    player.stop().unwrap();
    drop(tx);
    cancel.cancel();
    task.await.unwrap();
}
