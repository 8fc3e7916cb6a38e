//! Shadow sub-trainer state machine.
//!
//! When the primary trainer stalls, a sub-trainer is branched from the
//! best-trainer blob with reduced learning rates and trained in lock-step
//! on the same samples. It is promoted to replace the primary only when it
//! has caught up in iterations and beats the primary's error rate by a
//! configured margin; otherwise it is eventually discarded. Training
//! continues at full speed either way, so a failed experiment costs
//! nothing but the extra compute.
//!
//! # Lifecycle
//!
//! ```text
//!   None ──start──▶ Running ──┬──▶ Merged (take_for_merge)
//!                             └──▶ Discarded (attempts exhausted)
//! ```
//!
//! The sub-trainer owns a disjoint copy of state and recognizer; nothing
//! is shared with the primary, so no locking is needed anywhere.

use crate::checkpoint::CheckpointCodec;
use crate::config::TrainerConfig;
use crate::error::TrainResult;
use crate::state::TrainerState;
use crate::targets::TargetBuilder;
use crate::{run_training_step, Recognizer, RecognizerFactory, SampleSource};

/// What the sub-trainer machine did during one controller update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubTrainerResult {
    /// No sub-trainer activity this step.
    #[default]
    None,
    /// The sub-trainer trained but has not yet qualified for promotion.
    Updated,
    /// The sub-trainer qualified; the caller must merge it via
    /// [`SubtrainerController::take_for_merge`].
    Replaced,
}

/// A running sub-trainer: disjoint state and recognizer copies.
pub struct SubTrainer {
    /// The sub-trainer's own state, branched from the best-trainer blob.
    pub state: TrainerState,
    /// The sub-trainer's own recognizer with reduced learning rates.
    pub recognizer: Box<dyn Recognizer>,
}

/// Drives the sub-trainer lifecycle on behalf of the orchestrator.
#[derive(Default)]
pub struct SubtrainerController {
    sub: Option<SubTrainer>,
    attempts: u32,
}

impl SubtrainerController {
    /// Creates an idle controller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a sub-trainer is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sub.is_some()
    }

    /// Branches a sub-trainer from the primary's best-trainer blob.
    ///
    /// Returns `Ok(false)` if no blob exists yet (nothing to branch from).
    /// Learning rates are reduced uniformly, or per-layer when the probe
    /// is enabled.
    pub fn start(
        &mut self,
        primary: &TrainerState,
        factory: &RecognizerFactory,
        samples: &dyn SampleSource,
        builder: &TargetBuilder,
        config: &TrainerConfig,
    ) -> TrainResult<bool> {
        let Some(blob) = &primary.best_trainer else {
            return Ok(false);
        };
        let mut state = CheckpointCodec::deserialize(blob)?;
        let mut recognizer = factory(&state.network)?;
        state.best_trainer = None;
        state.sub_trainer = None;

        if config.per_layer_rates {
            let reduced =
                reduce_layer_learning_rates(recognizer.as_mut(), &state, samples, builder, config)?;
            tracing::info!(layers = reduced, "sub-trainer branched with per-layer rate reduction");
        } else {
            for layer in 0..recognizer.num_layers() {
                recognizer.scale_learning_rate(layer, config.lr_reduction_factor);
            }
            tracing::info!(
                factor = config.lr_reduction_factor,
                from_iteration = state.training_iteration,
                "sub-trainer branched with uniform rate reduction"
            );
        }

        self.attempts = 0;
        self.sub = Some(SubTrainer { state, recognizer });
        Ok(true)
    }

    /// Trains the sub-trainer up to the primary's iteration and evaluates
    /// the promotion margin.
    ///
    /// Promotion requires all three at once: the sub-trainer has caught up
    /// to the primary's iteration, its headline error is a new best, and
    /// it improves on the primary's current error by at least
    /// `margin_fraction`. Every caught-up update that fails the margin
    /// burns one attempt; exhausting `subtrainer_max_attempts` discards
    /// the sub-trainer, which frees the slot for a later branch with
    /// different rates.
    pub fn update(
        &mut self,
        primary: &TrainerState,
        samples: &dyn SampleSource,
        builder: &TargetBuilder,
        config: &TrainerConfig,
    ) -> TrainResult<SubTrainerResult> {
        let Some(sub) = self.sub.as_mut() else {
            return Ok(SubTrainerResult::None);
        };

        let mut trained = false;
        let mut absent_streak = 0_usize;
        while sub.state.training_iteration < primary.training_iteration {
            if let Some(sample) = samples.get_page_by_serial(sub.state.sample_iteration) {
                run_training_step(
                    sub.recognizer.as_mut(),
                    &mut sub.state,
                    builder,
                    config,
                    &sample,
                    samples.len(),
                    None,
                )?;
                trained = true;
                absent_streak = 0;
            } else {
                sub.state.sample_iteration = if samples.is_empty() {
                    0
                } else {
                    (sub.state.sample_iteration + 1) % samples.len()
                };
                absent_streak += 1;
                // A full cycle of absent serials means nothing to train on.
                if absent_streak > samples.len() {
                    break;
                }
            }
        }

        let headline = config.headline_kind;
        let sub_error = sub.state.tracker.mean(headline);
        let primary_current = primary.tracker.mean(headline);
        let caught_up = sub.state.training_iteration >= primary.training_iteration;
        let margin_met = sub_error < primary.best_error_rate
            && sub_error < primary_current * (1.0 - config.margin_fraction);

        if caught_up && margin_met {
            return Ok(SubTrainerResult::Replaced);
        }

        if caught_up {
            self.attempts += 1;
            if self.attempts > config.subtrainer_max_attempts {
                tracing::info!(
                    attempts = self.attempts,
                    sub_error,
                    primary_current,
                    "sub-trainer discarded without qualifying"
                );
                self.sub = None;
                return Ok(SubTrainerResult::None);
            }
        }

        Ok(if trained {
            SubTrainerResult::Updated
        } else {
            SubTrainerResult::None
        })
    }

    /// Hands the qualified sub-trainer to the caller for merging.
    pub fn take_for_merge(&mut self) -> Option<SubTrainer> {
        self.attempts = 0;
        self.sub.take()
    }

    /// Discards the running sub-trainer, if any.
    pub fn discard(&mut self) {
        self.sub = None;
        self.attempts = 0;
    }

    /// Snapshots the running sub-trainer's state (with fresh weights) for
    /// embedding in a `Full` checkpoint.
    pub fn snapshot_state(&mut self) -> TrainResult<Option<Box<TrainerState>>> {
        let Some(sub) = self.sub.as_mut() else {
            return Ok(None);
        };
        sub.state.network = sub.recognizer.serialize_weights()?;
        Ok(Some(Box::new(sub.state.clone())))
    }

    /// Resurrects a sub-trainer from a checkpointed state.
    pub fn restore(
        &mut self,
        state: Box<TrainerState>,
        factory: &RecognizerFactory,
    ) -> TrainResult<()> {
        let recognizer = factory(&state.network)?;
        self.attempts = 0;
        self.sub = Some(SubTrainer {
            state: *state,
            recognizer,
        });
        Ok(())
    }
}

/// Per-layer learning-rate probe.
///
/// For each layer, clones the recognizer twice (current rate vs reduced
/// rate on that layer only) and runs both through the same probe samples
/// with two consecutive updates per sample. A step where the two copies'
/// mean weight updates for the layer disagree in sign is a flip; a layer
/// whose flips exceed half its probe steps gets its rate reduced. If no
/// layer crosses the majority, the layer with the most flips is reduced
/// anyway (ties to the lowest index), so at least one rate always changes.
///
/// Returns the number of layers reduced.
fn reduce_layer_learning_rates(
    recognizer: &mut dyn Recognizer,
    state: &TrainerState,
    samples: &dyn SampleSource,
    builder: &TargetBuilder,
    config: &TrainerConfig,
) -> TrainResult<usize> {
    let num_layers = recognizer.num_layers();
    if num_layers == 0 {
        return Ok(0);
    }
    let mut flip_counts = vec![0_usize; num_layers];
    let mut probe_steps = vec![0_usize; num_layers];
    let cache_len = samples.len();

    for layer in 0..num_layers {
        let mut base = recognizer.clone_box();
        let mut reduced = recognizer.clone_box();
        reduced.scale_learning_rate(layer, config.lr_reduction_factor);
        let mut base_state = state.clone();
        let mut reduced_state = state.clone();

        for offset in 0..config.probe_samples {
            let serial = (state.sample_iteration + offset) % cache_len.max(1);
            let Some(sample) = samples.get_page_by_serial(serial) else {
                continue;
            };
            // Two consecutive updates per sample sharpen the sign signal.
            for _ in 0..2 {
                let a = run_training_step(
                    base.as_mut(),
                    &mut base_state,
                    builder,
                    config,
                    &sample,
                    cache_len,
                    None,
                )?;
                let b = run_training_step(
                    reduced.as_mut(),
                    &mut reduced_state,
                    builder,
                    config,
                    &sample,
                    cache_len,
                    None,
                )?;
                let (Some(ga), Some(gb)) = (a.gradient, b.gradient) else {
                    continue;
                };
                let ua = ga.layer_updates.get(layer).copied().unwrap_or(0.0);
                let ub = gb.layer_updates.get(layer).copied().unwrap_or(0.0);
                if ua != 0.0 && ub != 0.0 {
                    probe_steps[layer] += 1;
                    if ua.signum() != ub.signum() {
                        flip_counts[layer] += 1;
                    }
                }
            }
        }
    }

    let mut reduced_layers: Vec<usize> = (0..num_layers)
        .filter(|&l| probe_steps[l] > 0 && flip_counts[l] * 2 > probe_steps[l])
        .collect();
    if reduced_layers.is_empty() {
        let mut pick = 0;
        for layer in 1..num_layers {
            if flip_counts[layer] > flip_counts[pick] {
                pick = layer;
            }
        }
        reduced_layers.push(pick);
    }
    for &layer in &reduced_layers {
        recognizer.scale_learning_rate(layer, config.lr_reduction_factor);
    }
    tracing::debug!(?flip_counts, ?probe_steps, ?reduced_layers, "learning-rate probe");
    Ok(reduced_layers.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_controller_reports_none() {
        let mut controller = SubtrainerController::new();
        assert!(!controller.is_running());
        assert!(controller.take_for_merge().is_none());
        assert!(controller.snapshot_state().unwrap().is_none());
    }

    #[test]
    fn discard_clears_running_state() {
        let mut controller = SubtrainerController::new();
        controller.attempts = 3;
        controller.discard();
        assert_eq!(controller.attempts, 0);
        assert!(!controller.is_running());
    }
}
