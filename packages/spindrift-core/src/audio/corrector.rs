//! Legacy drop/insert sync correction.
//!
//! For device paths where resampling is disallowed, sync error is corrected
//! by occasionally removing or duplicating a single frame per block, spliced
//! with a 3-point weighted blend so the edit is not a hard discontinuity.
//!
//! A three-state hysteresis machine (Idle / Dropping / Inserting) gates the
//! edits: correction engages at 15ms of error, disengages at 3ms, and a
//! direct flip between Dropping and Inserting is forbidden - overshoot
//! always returns through Idle first.

use serde::Serialize;

/// Error magnitude that engages correction (15ms).
const ENTRY_THRESHOLD_US: f64 = 15_000.0;

/// Error magnitude that disengages correction (3ms).
const EXIT_THRESHOLD_US: f64 = 3_000.0;

/// Blend weights for the 3-point splice.
const BLEND: [f32; 3] = [0.25, 0.5, 0.25];

/// Hysteresis state of the corrector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CorrectionState {
    /// In sync; blocks pass through untouched.
    Idle,
    /// Output is behind schedule; frames are being removed.
    Dropping,
    /// Output is ahead of schedule; frames are being duplicated.
    Inserting,
}

/// Interleaved samples removed/added by one correction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Correction {
    /// Samples removed from the block.
    pub dropped: usize,
    /// Samples added to the block.
    pub inserted: usize,
}

/// Drop/insert corrector with hysteresis.
pub struct SyncCorrector {
    channels: usize,
    state: CorrectionState,
    total_dropped: u64,
    total_inserted: u64,
}

impl SyncCorrector {
    /// Creates a corrector for `channels`-channel interleaved blocks.
    #[must_use]
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels as usize,
            state: CorrectionState::Idle,
            total_dropped: 0,
            total_inserted: 0,
        }
    }

    /// Current hysteresis state.
    #[must_use]
    pub fn state(&self) -> CorrectionState {
        self.state
    }

    /// Lifetime totals of (dropped, inserted) interleaved samples.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (self.total_dropped, self.total_inserted)
    }

    /// Advances the hysteresis machine for the given error.
    ///
    /// Positive error = behind schedule = need to drop. Any exit condition,
    /// including overshoot past zero, lands in Idle; the opposite correction
    /// can only engage from there on a later block.
    fn advance_state(&mut self, error_us: f64) {
        self.state = match self.state {
            CorrectionState::Idle => {
                if error_us > ENTRY_THRESHOLD_US {
                    CorrectionState::Dropping
                } else if error_us < -ENTRY_THRESHOLD_US {
                    CorrectionState::Inserting
                } else {
                    CorrectionState::Idle
                }
            }
            CorrectionState::Dropping => {
                if error_us < EXIT_THRESHOLD_US {
                    CorrectionState::Idle
                } else {
                    CorrectionState::Dropping
                }
            }
            CorrectionState::Inserting => {
                if error_us > -EXIT_THRESHOLD_US {
                    CorrectionState::Idle
                } else {
                    CorrectionState::Inserting
                }
            }
        };
    }

    /// Applies at most one frame of correction to `block`.
    ///
    /// The block must hold whole frames; blocks shorter than three frames
    /// pass through untouched (nothing to blend against).
    pub fn apply(&mut self, block: &mut Vec<f32>, error_us: f64) -> Correction {
        self.advance_state(error_us);
        let ch = self.channels;
        let frames = block.len() / ch;
        if frames < 3 {
            return Correction::default();
        }
        let mid = frames / 2;

        match self.state {
            CorrectionState::Idle => Correction::default(),
            CorrectionState::Dropping => {
                // Blend the dropped frame into its predecessor, then remove it.
                for c in 0..ch {
                    let prev = block[(mid - 1) * ch + c];
                    let cur = block[mid * ch + c];
                    let next = block[(mid + 1) * ch + c];
                    block[(mid - 1) * ch + c] =
                        BLEND[0] * prev + BLEND[1] * cur + BLEND[2] * next;
                }
                block.drain(mid * ch..(mid + 1) * ch);
                self.total_dropped += ch as u64;
                Correction {
                    dropped: ch,
                    inserted: 0,
                }
            }
            CorrectionState::Inserting => {
                // Insert a blended frame between mid-1 and mid. Stack array
                // sized for the channel ceiling keeps this allocation-free.
                let mut frame = [0.0f32; super::MAX_CHANNELS as usize];
                for (c, f) in frame.iter_mut().enumerate().take(ch) {
                    let prev = block[(mid - 1) * ch + c];
                    let cur = block[mid * ch + c];
                    let next = block[(mid + 1) * ch + c];
                    *f = BLEND[0] * prev + BLEND[1] * cur + BLEND[2] * next;
                }
                block.splice(mid * ch..mid * ch, frame.into_iter().take(ch));
                self.total_inserted += ch as u64;
                Correction {
                    dropped: 0,
                    inserted: ch,
                }
            }
        }
    }
}
