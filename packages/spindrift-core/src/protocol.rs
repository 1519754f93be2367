//! Protocol adapter: decoded stream frames into the timed buffer.
//!
//! The Sendspin wire protocol, demux, and network decode live in the SDK;
//! this adapter consumes the SDK's decoded-frame stream and turns it into
//! timestamped writes on the endpoint's timed buffer, surfacing stream-level
//! transitions as events.
//!
//! State machine: Disconnected -> Handshaking -> Streaming <-> Paused ->
//! (Streaming | Disconnected), any state -> Error.
//!
//! On a reanchor the adapter clears buffered audio and requests a
//! drift-preserving converter reset - learned clock knowledge survives the
//! timeline jump.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::drift::DriftEstimator;
use crate::audio::source::SourceControl;
use crate::audio::timed_buffer::TimedAudioBuffer;
use crate::events::{EventEmitter, StreamEvent};
use crate::utils::now_millis;

/// One decoded audio frame from the SDK, stamped on the local monotonic
/// timeline.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Scheduled playout time of the first sample (local monotonic us).
    pub playout_ts_us: u64,
    /// Interleaved float samples.
    pub samples: Vec<f32>,
}

/// Input items delivered by the SDK's decode task.
#[derive(Debug)]
pub enum StreamInput {
    /// A decoded, timestamped PCM frame.
    Frame(DecodedFrame),
    /// Transport paused; buffered audio keeps playing out.
    Pause,
    /// Transport resumed.
    Resume,
    /// Timestamps jumped (seek / transport reset); drop buffered audio.
    Reanchor,
    /// The stream ended normally.
    End,
}

/// Stream-session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    /// No session.
    Disconnected,
    /// Session open, waiting for the first frame.
    Handshaking,
    /// Frames flowing.
    Streaming,
    /// Transport paused.
    Paused,
    /// The session failed.
    Error,
}

struct AdapterShared {
    name: String,
    buffer: Arc<TimedAudioBuffer>,
    control: Arc<SourceControl>,
    estimator: Arc<Mutex<DriftEstimator>>,
    emitter: Arc<dyn EventEmitter>,
    /// Per-endpoint delay offset applied to every frame timestamp (us).
    delay_us: AtomicI64,
    state: Mutex<AdapterState>,
}

/// Consumes a decoded-frame stream and feeds the timed buffer.
#[derive(Clone)]
pub struct StreamAdapter {
    shared: Arc<AdapterShared>,
}

impl StreamAdapter {
    /// Creates an adapter for endpoint `name`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        buffer: Arc<TimedAudioBuffer>,
        control: Arc<SourceControl>,
        estimator: Arc<Mutex<DriftEstimator>>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            shared: Arc::new(AdapterShared {
                name: name.into(),
                buffer,
                control,
                estimator,
                emitter,
                delay_us: AtomicI64::new(0),
                state: Mutex::new(AdapterState::Disconnected),
            }),
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        *self.shared.state.lock()
    }

    /// Sets the endpoint's static delay offset.
    pub fn set_delay_ms(&self, delay_ms: i32) {
        self.shared
            .delay_us
            .store(i64::from(delay_ms) * 1_000, Ordering::Relaxed);
    }

    fn set_state(&self, state: AdapterState) {
        let mut current = self.shared.state.lock();
        if *current != state {
            log::debug!(
                "[Adapter] {}: {:?} -> {:?}",
                self.shared.name,
                *current,
                state
            );
            *current = state;
        }
    }

    fn write_frame(&self, frame: DecodedFrame) {
        let delay = self.shared.delay_us.load(Ordering::Relaxed);
        let ts = frame.playout_ts_us.saturating_add_signed(delay);
        if let Err(err) = self.shared.buffer.write(&frame.samples, ts) {
            log::warn!("[Adapter] {}: dropped frame: {err}", self.shared.name);
        }
    }

    fn handle_reanchor(&self) {
        // Order matters: clear queued audio first so no stale-timeline frame
        // is released while the estimator/converter reset is pending.
        self.shared.buffer.clear();
        self.shared.estimator.lock().reanchor();
        self.shared.control.request_reanchor();
        self.shared.emitter.emit_stream(StreamEvent::Reanchored {
            player: self.shared.name.clone(),
            timestamp: now_millis(),
        });
        log::info!("[Adapter] {}: reanchored", self.shared.name);
    }

    /// Runs the session until the input channel closes, `End` arrives, or
    /// `cancel` fires. This is the endpoint's network/decode task.
    pub async fn run(&self, mut rx: mpsc::Receiver<StreamInput>, cancel: CancellationToken) {
        self.set_state(AdapterState::Handshaking);
        let name = self.shared.name.clone();

        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[Adapter] {name}: cancelled");
                    break;
                }
                input = rx.recv() => match input {
                    Some(input) => input,
                    None => {
                        log::debug!("[Adapter] {name}: input channel closed");
                        break;
                    }
                },
            };

            match input {
                StreamInput::Frame(frame) => {
                    if self.state() == AdapterState::Handshaking {
                        self.set_state(AdapterState::Streaming);
                        self.shared.emitter.emit_stream(StreamEvent::Started {
                            player: name.clone(),
                            timestamp: now_millis(),
                        });
                    }
                    if self.state() == AdapterState::Streaming {
                        self.write_frame(frame);
                    }
                    // Frames during Paused are transport echo; discard.
                }
                StreamInput::Pause => {
                    if self.state() == AdapterState::Streaming {
                        self.set_state(AdapterState::Paused);
                        self.shared.emitter.emit_stream(StreamEvent::Paused {
                            player: name.clone(),
                            timestamp: now_millis(),
                        });
                    }
                }
                StreamInput::Resume => {
                    if self.state() == AdapterState::Paused {
                        self.set_state(AdapterState::Streaming);
                    }
                }
                StreamInput::Reanchor => {
                    self.handle_reanchor();
                }
                StreamInput::End => {
                    self.shared.emitter.emit_stream(StreamEvent::Ended {
                        player: name.clone(),
                        timestamp: now_millis(),
                    });
                    break;
                }
            }
        }

        self.set_state(AdapterState::Disconnected);
    }
}
