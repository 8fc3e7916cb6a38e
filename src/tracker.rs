//! Rolling statistical error tracking.
//!
//! Every training step records one sample per error kind into a
//! fixed-capacity circular buffer. The rolling means over those buffers are
//! the only signal used for best/worst bookkeeping, curriculum stage
//! transitions, and sub-trainer decisions.
//!
//! # Why Fixed Capacity?
//!
//! Training history needs bounded memory regardless of run length, and the
//! window size is an invariant of the statistics, not an implementation
//! detail: a mean over the last `K` samples is comparable across the whole
//! run only if `K` never changes. The buffers are allocated once at
//! construction and never grow.
//!
//! # Warm-Up Gating
//!
//! A kind's mean is biased until a full buffer cycle has elapsed; callers
//! must not feed it into best/worst comparisons before [`ErrorTracker::is_warm`]
//! reports true. [`ErrorTracker::fill_buffer`] force-fills a buffer with one
//! value (used after a rollback) so the mean is immediately meaningful.

use serde::{Deserialize, Serialize};

/// Default rolling window size (`K`).
pub const DEFAULT_ERROR_WINDOW: usize = 1000;

/// The error kinds tracked for every training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// RMS of the per-timestep activation deltas (target minus output).
    ActivationRms,
    /// Fraction of timesteps where the winning class disagrees with the
    /// target's winning class.
    WinnerDelta,
    /// Fraction of ground-truth words not recovered by best-path decoding.
    WordRecall,
    /// Character-level edit distance divided by truth length.
    CharError,
    /// 1.0 for skipped samples, 0.0 for trained ones.
    SkipRatio,
}

impl ErrorKind {
    /// Number of tracked kinds.
    pub const COUNT: usize = 5;

    /// All kinds, in buffer order.
    pub const ALL: [ErrorKind; Self::COUNT] = [
        ErrorKind::ActivationRms,
        ErrorKind::WinnerDelta,
        ErrorKind::WordRecall,
        ErrorKind::CharError,
        ErrorKind::SkipRatio,
    ];

    /// Buffer index for this kind.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            ErrorKind::ActivationRms => 0,
            ErrorKind::WinnerDelta => 1,
            ErrorKind::WordRecall => 2,
            ErrorKind::CharError => 3,
            ErrorKind::SkipRatio => 4,
        }
    }

    /// Short name used in progress strings.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::ActivationRms => "rms",
            ErrorKind::WinnerDelta => "delta",
            ErrorKind::WordRecall => "word recall",
            ErrorKind::CharError => "char",
            ErrorKind::SkipRatio => "skip ratio",
        }
    }
}

/// Snapshot of the rolling mean for every error kind.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorRates {
    values: [f64; ErrorKind::COUNT],
}

impl ErrorRates {
    /// Returns the mean for one kind.
    #[must_use]
    pub fn get(&self, kind: ErrorKind) -> f64 {
        self.values[kind.index()]
    }

    /// Sets the mean for one kind.
    pub fn set(&mut self, kind: ErrorKind, value: f64) {
        self.values[kind.index()] = value;
    }
}

/// Fixed-capacity circular buffer of error samples for one kind.
///
/// Slot index is `count mod K`; the oldest entry is overwritten once the
/// buffer has cycled. Arena-style: allocated once, never resized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBuffer {
    values: Vec<f64>,
    count: u64,
}

impl ErrorBuffer {
    /// Creates a zeroed buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![0.0; capacity],
            count: 0,
        }
    }

    /// Records one sample, overwriting the oldest entry when full.
    pub fn record(&mut self, value: f64) {
        let capacity = self.values.len() as u64;
        self.values[(self.count % capacity) as usize] = value;
        self.count += 1;
    }

    /// Force-fills the entire buffer with one value and marks it warm.
    pub fn fill(&mut self, value: f64) {
        for slot in &mut self.values {
            *slot = value;
        }
        self.count = self.count.max(self.values.len() as u64);
    }

    /// Mean over the populated window, `min(count, K)` entries.
    #[must_use]
    pub fn mean(&self) -> f64 {
        let populated = (self.count as usize).min(self.values.len());
        if populated == 0 {
            return 0.0;
        }
        self.values[..populated].iter().sum::<f64>() / populated as f64
    }

    /// Whether at least one full buffer cycle has elapsed.
    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.count >= self.values.len() as u64
    }

    /// Number of samples recorded since construction (not capped at `K`).
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Rolling error buffers for all kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTracker {
    window: usize,
    buffers: Vec<ErrorBuffer>,
}

impl ErrorTracker {
    /// Creates a tracker with the given window size for every kind.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window,
            buffers: (0..ErrorKind::COUNT)
                .map(|_| ErrorBuffer::new(window))
                .collect(),
        }
    }

    /// Records one sample for one kind.
    pub fn record(&mut self, kind: ErrorKind, value: f64) {
        self.buffers[kind.index()].record(value);
    }

    /// Force-fills one kind's buffer, making its mean immediately
    /// meaningful (used when reinitializing after a rollback).
    pub fn fill_buffer(&mut self, kind: ErrorKind, value: f64) {
        self.buffers[kind.index()].fill(value);
    }

    /// Computes the rolling mean snapshot for every kind.
    ///
    /// Called once per training step after the step's errors have been
    /// recorded.
    #[must_use]
    pub fn roll_and_report(&self) -> ErrorRates {
        let mut rates = ErrorRates::default();
        for kind in ErrorKind::ALL {
            rates.set(kind, self.buffers[kind.index()].mean());
        }
        rates
    }

    /// Rolling mean for a single kind.
    #[must_use]
    pub fn mean(&self, kind: ErrorKind) -> f64 {
        self.buffers[kind.index()].mean()
    }

    /// Whether the kind's buffer has completed a full cycle.
    #[must_use]
    pub fn is_warm(&self, kind: ErrorKind) -> bool {
        self.buffers[kind.index()].is_warm()
    }

    /// Number of samples recorded for a kind.
    #[must_use]
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.buffers[kind.index()].count()
    }

    /// The window size `K` shared by all buffers.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }
}
