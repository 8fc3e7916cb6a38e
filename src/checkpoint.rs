//! Checkpoint serialization at three fidelity levels.
//!
//! Checkpoints use `bincode` for a compact, versioned binary body. Three
//! fidelity levels trade size for completeness:
//!
//! - [`SerializeAmount::Light`] omits both the nested `best_trainer` blob
//!   and the `sub_trainer` — for frequent, inexpensive dumps.
//! - [`SerializeAmount::NoBestTrainer`] omits only `best_trainer` — used
//!   when saving the current best itself, so "best of best" never nests
//!   unboundedly.
//! - [`SerializeAmount::Full`] keeps everything; a `Full` dump reloaded
//!   reproduces bit-identical continuation behavior.
//!
//! File I/O goes through injected [`FileReader`]/[`FileWriter`] callbacks;
//! the codec never calls filesystem APIs itself, so every property is
//! testable with in-memory stand-ins. A failed load leaves previous state
//! untouched: callers decode into a temporary and commit on success.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{TrainResult, TrainingError};
use crate::state::TrainerState;
use crate::tracker::{ErrorKind, ErrorRates};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// How much of the trainer state a dump includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializeAmount {
    /// Strip `best_trainer` and `sub_trainer` (frequent cheap dumps).
    Light,
    /// Strip only `best_trainer` (saving the current best itself).
    NoBestTrainer,
    /// Keep everything (durable external snapshots).
    Full,
}

/// Metadata travelling in the checkpoint header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Training iteration when the dump was taken.
    pub iteration: u64,

    /// Wall-clock timestamp (RFC 3339, whole seconds).
    pub timestamp: String,

    /// Hostname where the dump was written.
    pub hostname: String,
}

impl CheckpointMetadata {
    /// Creates metadata with the current timestamp and hostname.
    #[must_use]
    pub fn new(iteration: u64) -> Self {
        Self {
            iteration,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Versioned checkpoint envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    metadata: CheckpointMetadata,
    state: TrainerState,
}

/// Serializes and deserializes trainer state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointCodec;

impl CheckpointCodec {
    /// Serializes `state` at the requested fidelity level.
    ///
    /// # Errors
    ///
    /// Returns a `Checkpoint` error if encoding fails.
    pub fn serialize(amount: SerializeAmount, state: &TrainerState) -> TrainResult<Vec<u8>> {
        let mut snapshot = state.clone();
        match amount {
            SerializeAmount::Light => {
                snapshot.best_trainer = None;
                snapshot.sub_trainer = None;
            }
            SerializeAmount::NoBestTrainer => {
                snapshot.best_trainer = None;
            }
            SerializeAmount::Full => {}
        }
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            metadata: CheckpointMetadata::new(state.training_iteration),
            state: snapshot,
        };
        bincode::serialize(&checkpoint).map_err(|e| TrainingError::Checkpoint {
            reason: format!("failed to encode checkpoint: {e}"),
        })
    }

    /// Deserializes a checkpoint, validating the format version.
    ///
    /// Truncated or corrupt input and unknown versions are recoverable
    /// errors; nothing is committed on failure.
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` on decode failure and `IncompatibleVersion`
    /// when the version does not match this build.
    pub fn deserialize(bytes: &[u8]) -> TrainResult<TrainerState> {
        let checkpoint: Checkpoint =
            bincode::deserialize(bytes).map_err(|e| TrainingError::Checkpoint {
                reason: format!("failed to decode checkpoint: {e}"),
            })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TrainingError::IncompatibleVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(checkpoint.state)
    }

    /// Canonical checkpoint filename encoding the model base, headline
    /// error rate, and iteration.
    ///
    /// Repeated dumps naturally sort by quality, and a worse dump can never
    /// silently overwrite a better one under an identical name.
    #[must_use]
    pub fn canonical_filename(
        model_base: &str,
        rates: &ErrorRates,
        headline: ErrorKind,
        iteration: u64,
    ) -> String {
        format!(
            "{model_base}{:.3}_{iteration}.checkpoint",
            rates.get(headline)
        )
    }
}

/// Injected file-read callback.
pub type FileReader = Box<dyn FnMut(&Path) -> TrainResult<Vec<u8>> + Send>;

/// Injected file-write callback.
pub type FileWriter = Box<dyn FnMut(&Path, &[u8]) -> TrainResult<()> + Send>;

/// Default reader backed by `std::fs`.
#[must_use]
pub fn fs_reader() -> FileReader {
    Box::new(|path| {
        std::fs::read(path).map_err(|e| TrainingError::Checkpoint {
            reason: format!("failed to read {}: {e}", path.display()),
        })
    })
}

/// Default writer backed by `std::fs`.
#[must_use]
pub fn fs_writer() -> FileWriter {
    Box::new(|path, bytes| {
        std::fs::write(path, bytes).map_err(|e| TrainingError::Checkpoint {
            reason: format!("failed to write {}: {e}", path.display()),
        })
    })
}
