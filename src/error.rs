//! Error types and the per-sample trainability taxonomy.
//!
//! Two distinct notions of "failure" coexist in the trainer and must not be
//! conflated:
//!
//! - [`Trainability`] classifies individual samples. A sample that cannot be
//!   encoded or lacks required alignment is *skipped*, counted in the
//!   skip-ratio buffer, and the loop moves on. These are expected, recovered
//!   locally, and never abort training.
//! - [`TrainingError`] covers genuine operational failures: checkpoint
//!   serialization problems, invalid configuration, recognizer faults. They
//!   surface as explicit `Result` returns to the caller.
//!
//! Divergence (a sustained worsening of the error rate) is deliberately
//! neither: it is the designed trigger for the sub-trainer state machine in
//! [`crate::subtrainer`], not an exception path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operational errors surfaced to the caller.
///
/// Each variant carries enough context to diagnose the failure without a
/// debugger attached to a multi-day training run.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Checkpoint serialization, deserialization, or I/O failed.
    ///
    /// A failed load must leave previously-loaded state untouched; callers
    /// decode into a temporary and commit only on full success.
    #[error("checkpoint error: {reason}")]
    Checkpoint {
        /// Description of the checkpoint failure.
        reason: String,
    },

    /// A checkpoint was decodable but written by an incompatible version.
    ///
    /// Unknown or future versions are a load failure, never a crash.
    #[error("incompatible checkpoint version {found} (expected {expected})")]
    IncompatibleVersion {
        /// Version found in the checkpoint header.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },

    /// Invalid configuration (out-of-range parameter or inconsistent pair).
    #[error("configuration error: {detail}")]
    Config {
        /// Description of the configuration issue.
        detail: String,
    },

    /// The external recognizer reported a failure during forward, backward,
    /// or weight (de)serialization.
    #[error("recognizer error: {reason}")]
    Recognizer {
        /// Description of the recognizer failure.
        reason: String,
    },

    /// The sub-trainer machinery failed in a way that is not a normal
    /// discard (e.g. the recognizer factory rejected the best-trainer blob).
    #[error("sub-trainer error: {reason}")]
    SubTrainer {
        /// Description of the sub-trainer failure.
        reason: String,
    },
}

/// Result alias used throughout the crate.
pub type TrainResult<T> = Result<T, TrainingError>;

/// Classification of a single training sample.
///
/// Returned by every per-sample operation. Only `Trainable` and `Perfect`
/// mutate training state beyond the skip-ratio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trainability {
    /// Normal sample: errors recorded, backward pass applied.
    Trainable,

    /// Delta error was exactly zero. The backward pass may be skipped when
    /// perfect samples arrive more often than the configured perfect delay,
    /// to avoid overweighting already-solved samples.
    Perfect,

    /// The ground truth cannot be represented in the current label space.
    /// The sample is permanently unusable: skipped and counted.
    Unencodable,

    /// The sample lacks the precise per-character alignment required by the
    /// current training stage. Skipped, but may become usable once the
    /// stage relaxes the requirement.
    NotBoxed,

    /// The network is highly confident yet disagrees with the truth.
    /// Logged distinctly since this often indicates a labeling error in the
    /// data rather than a model deficiency; the sample still trains.
    HiPrecisionErr,
}

impl Trainability {
    /// Returns whether this sample is skipped without training.
    #[must_use]
    pub fn is_skipped(self) -> bool {
        matches!(self, Self::Unencodable | Self::NotBoxed)
    }

    /// Returns whether the delta error carried learning signal.
    #[must_use]
    pub fn teaches(self) -> bool {
        matches!(self, Self::Trainable | Self::HiPrecisionErr)
    }
}
