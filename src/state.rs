//! Serializable snapshot of training progress.
//!
//! [`TrainerState`] is the single shared object of the component: it has
//! exactly one mutator (the orchestrator) at a time, and the sub-trainer's
//! state is a disjoint, independently owned copy. It is created empty,
//! populated incrementally every training step, periodically frozen into a
//! checkpoint, and can be wholly replaced (never merged) by deserializing an
//! earlier checkpoint on rollback.
//!
//! # Invariants
//!
//! - `learning_iteration <= training_iteration`, always.
//! - `training_stage` never decreases.
//! - `best_iteration` changes only when the headline mean strictly improves
//!   on `best_error_rate`; `worst_*` tracks the maximum since the last best.

use serde::{Deserialize, Serialize};

use crate::tracker::{ErrorKind, ErrorRates, ErrorTracker};

/// Complete trainer state at a point in time.
///
/// Equality is bit-exact over all rolling buffers, iteration counters, and
/// best/worst snapshots, and structural over the optional nested blobs;
/// this is what the checkpoint round-trip contract is defined against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Trained steps (skipped samples do not count).
    pub training_iteration: u64,

    /// Steps whose delta error was non-zero (the network learned something).
    /// Never exceeds `training_iteration`.
    pub learning_iteration: u64,

    /// Index of the next sample in the external cache; wraps at cache size.
    pub sample_iteration: usize,

    /// Lowest headline error mean observed while warm.
    pub best_error_rate: f64,

    /// Iteration at which `best_error_rate` was recorded.
    pub best_iteration: u64,

    /// Snapshot of all error kinds at the best iteration.
    pub best_error_rates: ErrorRates,

    /// Highest headline error mean observed since the last best.
    pub worst_error_rate: f64,

    /// Iteration at which `worst_error_rate` was recorded.
    pub worst_iteration: u64,

    /// Snapshot of all error kinds at the worst iteration.
    pub worst_error_rates: ErrorRates,

    /// Curriculum stage; advances on first crossings of caller thresholds,
    /// never decreases.
    pub training_stage: u32,

    /// Lowest stage threshold already crossed. Re-crossing a threshold at
    /// or above this watermark does not advance the stage again.
    pub stage_threshold_crossed: f64,

    /// Iteration of the most recent perfect sample, for perfect-delay
    /// gating of the backward pass.
    pub last_perfect_iteration: Option<u64>,

    /// Rolling error buffers.
    pub tracker: ErrorTracker,

    /// Serialized recognizer weights, captured at snapshot time.
    pub network: Vec<u8>,

    /// Serialized prior state+network of the best trainer seen, used to
    /// revert or to branch a sub-trainer. Omitted from `Light` dumps and
    /// from the blob itself (no "best of best" nesting).
    pub best_trainer: Option<Vec<u8>>,

    /// Nested sub-trainer state, exclusively owned, never aliased.
    /// Populated only inside serialized checkpoints; the live sub-trainer
    /// is owned by the controller.
    pub sub_trainer: Option<Box<TrainerState>>,
}

impl TrainerState {
    /// Creates an empty state with the given rolling window size.
    #[must_use]
    pub fn new(error_window: usize) -> Self {
        Self {
            training_iteration: 0,
            learning_iteration: 0,
            sample_iteration: 0,
            best_error_rate: f64::MAX,
            best_iteration: 0,
            best_error_rates: ErrorRates::default(),
            worst_error_rate: 0.0,
            worst_iteration: 0,
            worst_error_rates: ErrorRates::default(),
            training_stage: 0,
            stage_threshold_crossed: f64::INFINITY,
            last_perfect_iteration: None,
            tracker: ErrorTracker::new(error_window),
            network: Vec::new(),
            best_trainer: None,
            sub_trainer: None,
        }
    }

    /// Updates best bookkeeping from freshly rolled means.
    ///
    /// Returns `true` when the headline mean is a strict new minimum; the
    /// worst tracker is reset so it measures the excursion since this best.
    pub fn update_best(&mut self, rates: &ErrorRates, headline: ErrorKind) -> bool {
        let rate = rates.get(headline);
        if rate < self.best_error_rate {
            self.best_error_rate = rate;
            self.best_iteration = self.training_iteration;
            self.best_error_rates = *rates;
            self.worst_error_rate = rate;
            self.worst_iteration = self.training_iteration;
            self.worst_error_rates = *rates;
            true
        } else {
            false
        }
    }

    /// Updates worst bookkeeping from freshly rolled means.
    ///
    /// Returns `true` when the headline mean is a new maximum since the
    /// last best (the divergence signal).
    pub fn update_worst(&mut self, rates: &ErrorRates, headline: ErrorKind) -> bool {
        let rate = rates.get(headline);
        if rate > self.worst_error_rate {
            self.worst_error_rate = rate;
            self.worst_iteration = self.training_iteration;
            self.worst_error_rates = *rates;
            true
        } else {
            false
        }
    }

    /// Advances the curriculum stage if the headline mean has just crossed
    /// below `threshold` for the first time.
    ///
    /// Returns `true` on a transition. The stage never decreases, and a
    /// threshold already crossed does not fire again even if the error
    /// later rises back above it.
    pub fn transition_training_stage(&mut self, threshold: f64, headline_mean: f64) -> bool {
        if headline_mean < threshold && threshold < self.stage_threshold_crossed {
            self.training_stage += 1;
            self.stage_threshold_crossed = threshold;
            // Restart stall measurement for the new stage.
            self.best_iteration = self.training_iteration;
            true
        } else {
            false
        }
    }

    /// Iterations elapsed since the last best (stall measure).
    #[must_use]
    pub fn iterations_since_best(&self) -> u64 {
        self.training_iteration.saturating_sub(self.best_iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rates(char_error: f64) -> ErrorRates {
        let mut r = ErrorRates::default();
        r.set(ErrorKind::CharError, char_error);
        r
    }

    #[test]
    fn best_updates_only_on_strict_improvement() {
        let mut state = TrainerState::new(10);
        state.training_iteration = 5;
        assert!(state.update_best(&rates(0.4), ErrorKind::CharError));
        assert_eq!(state.best_iteration, 5);

        state.training_iteration = 6;
        assert!(!state.update_best(&rates(0.4), ErrorKind::CharError));
        assert_eq!(state.best_iteration, 5);

        state.training_iteration = 7;
        assert!(state.update_best(&rates(0.39), ErrorKind::CharError));
        assert_eq!(state.best_iteration, 7);
    }

    #[test]
    fn worst_resets_with_each_best() {
        let mut state = TrainerState::new(10);
        state.update_best(&rates(0.4), ErrorKind::CharError);
        assert!(state.update_worst(&rates(0.5), ErrorKind::CharError));
        assert_relative_eq!(state.worst_error_rate, 0.5);

        // New best resets the excursion baseline.
        state.update_best(&rates(0.3), ErrorKind::CharError);
        assert_relative_eq!(state.worst_error_rate, 0.3);
        assert!(!state.update_worst(&rates(0.29), ErrorKind::CharError));
    }

    #[test]
    fn stage_advances_once_per_threshold() {
        let mut state = TrainerState::new(10);
        for mean in [0.5, 0.4, 0.3] {
            assert!(!state.transition_training_stage(0.2, mean));
        }
        assert!(state.transition_training_stage(0.2, 0.19));
        assert_eq!(state.training_stage, 1);

        // Rising back above and re-crossing does not fire again.
        assert!(!state.transition_training_stage(0.2, 0.25));
        assert!(!state.transition_training_stage(0.2, 0.19));
        assert_eq!(state.training_stage, 1);

        // A strictly lower threshold does.
        assert!(state.transition_training_stage(0.1, 0.09));
        assert_eq!(state.training_stage, 2);
    }

    #[test]
    fn iterations_since_best_saturates() {
        let mut state = TrainerState::new(10);
        state.training_iteration = 100;
        state.best_iteration = 40;
        assert_eq!(state.iterations_since_best(), 60);
    }
}
