//! # lstm-ocr-trainer
//!
//! Incremental trainer for an LSTM-based OCR line recognizer: turns a
//! stream of labeled line samples into network weight updates while
//! guaranteeing that training never silently diverges.
//!
//! ## Overview
//!
//! The trainer combines four pieces of machinery:
//!
//! 1. **Target alignment** - exact/padded or CTC conversion of ground-truth
//!    transcriptions into per-timestep target distributions
//! 2. **Rolling error tracking** - fixed-window means over five error kinds
//!    drive every best/worst and curriculum decision
//! 3. **Checkpoint/rollback** - versioned snapshots at three fidelity
//!    levels, with an embedded best-trainer blob for reverting divergence
//! 4. **Shadow sub-trainer** - a disposable nested trainer probing reduced
//!    learning rates, promoted only when it beats the primary by a margin
//!
//! ```text
//!   sample ──▶ TargetBuilder ──▶ Recognizer.forward
//!                                     │
//!               ErrorTracker ◀── deltas/errors
//!                    │                │
//!              best/worst      Recognizer.backward
//!                    │
//!       ┌────────────┴─────────────┐
//!   CheckpointCodec        SubtrainerController
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lstm_ocr_trainer::{LineTrainer, TrainerConfig};
//!
//! let config = TrainerConfig::builder().error_window(1000).build();
//! let mut trainer = LineTrainer::new(recognizer, samples, config)?;
//! loop {
//!     let result = trainer.train_step()?;
//!     if let Some(t) = result.trainability {
//!         tracing::debug!(?t, "step");
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - trainer configuration and TOML serialization
//! - [`error`] - error types and the `Trainability` taxonomy
//! - [`targets`] - ground-truth-to-target alignment (exact + CTC)
//! - [`tracker`] - rolling statistical error tracking
//! - [`state`] - the serializable `TrainerState` snapshot
//! - [`checkpoint`] - three-fidelity checkpoint codec and injected file I/O
//! - [`subtrainer`] - the shadow-trainer state machine
//!
//! The tensor/network layer itself is an external collaborator behind the
//! [`Recognizer`] trait; this crate only orchestrates it. The whole
//! component assumes cooperative, synchronous execution: one logical thread
//! drives each step, the sub-trainer is trained by interleaved calls on the
//! same thread, and there is no internal locking anywhere.

#![warn(missing_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod state;
pub mod subtrainer;
pub mod targets;
pub mod tracker;

pub use checkpoint::{CheckpointCodec, FileReader, FileWriter, SerializeAmount};
pub use config::TrainerConfig;
pub use error::{TrainResult, Trainability, TrainingError};
pub use state::TrainerState;
pub use subtrainer::{SubTrainerResult, SubtrainerController};
pub use targets::{TargetBuilder, TargetMode};
pub use tracker::{ErrorKind, ErrorRates, ErrorTracker};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::targets::{argmax, edit_distance};

/// One immutable unit of training data.
///
/// Owned by an external cache keyed by a serial index; the trainer borrows
/// samples by index and never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    /// Rasterized line image features, timestep-major. Handed to the
    /// recognizer opaquely; the trainer only reads its length.
    pub features: Vec<Vec<f32>>,

    /// Ground-truth transcription as class codes.
    pub transcription: Vec<u32>,

    /// Precise per-character alignment ("boxed" truth), when available.
    pub char_boxes: Option<Vec<CharBox>>,
}

/// Timestep span of one ground-truth character.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CharBox {
    /// First timestep covered by the character.
    pub begin: u32,
    /// One past the last timestep covered.
    pub end: u32,
}

impl TrainingSample {
    /// Whether the sample carries per-character alignment.
    #[must_use]
    pub fn has_boxes(&self) -> bool {
        self.char_boxes.is_some()
    }
}

/// Activations produced by a forward pass: timestep-major class scores.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    /// One probability distribution per timestep.
    pub activations: Vec<Vec<f32>>,
}

/// Gradient summary from a backward pass.
#[derive(Debug, Clone)]
pub struct GradientInfo {
    /// RMS of the applied deltas.
    pub delta_rms: f64,

    /// Mean signed weight update per layer; the learning-rate probe
    /// compares the sign of these between full- and reduced-rate runs.
    pub layer_updates: Vec<f64>,
}

/// The forward-inference engine being trained.
///
/// # Why This Trait?
///
/// The trainer never touches tensors. By requiring only forward, backward,
/// per-layer learning-rate access, and weight (de)serialization, it works
/// against any network implementation, and every orchestration property is
/// testable with a deterministic mock.
pub trait Recognizer: Send {
    /// Runs the forward pass and returns per-timestep activations.
    fn forward(&mut self, sample: &TrainingSample) -> TrainResult<NetworkOutput>;

    /// Applies the gradient of the given deltas (target minus output,
    /// aligned with the most recent forward pass) to the weights.
    fn backward(&mut self, deltas: &[Vec<f32>]) -> TrainResult<GradientInfo>;

    /// Number of trainable layers.
    fn num_layers(&self) -> usize;

    /// Current learning rate of one layer.
    fn learning_rate(&self, layer: usize) -> f32;

    /// Scales one layer's learning rate by `factor`.
    fn scale_learning_rate(&mut self, layer: usize, factor: f32);

    /// Serializes the network weights to an opaque blob.
    fn serialize_weights(&self) -> TrainResult<Vec<u8>>;

    /// Replaces the network weights from a blob produced by
    /// [`Recognizer::serialize_weights`].
    fn deserialize_weights(&mut self, bytes: &[u8]) -> TrainResult<()>;

    /// Clones the recognizer, weights and all, behind a fresh box.
    /// Used by the learning-rate probe and by atomic checkpoint loads.
    fn clone_box(&self) -> Box<dyn Recognizer>;
}

/// Source of training samples, keyed by serial index.
///
/// Generation of the data (image synthesis, font rendering, degradation)
/// is entirely outside this crate.
pub trait SampleSource: Send {
    /// Returns the sample with the given serial, or `None` if absent.
    /// An absent sample is a no-op step for the trainer, not an error.
    fn get_page_by_serial(&self, serial: usize) -> Option<Arc<TrainingSample>>;

    /// Number of serials in the cache (the wrap point).
    fn len(&self) -> usize;

    /// Whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Vec-backed in-memory sample source.
#[derive(Debug, Default)]
pub struct MemorySampleSource {
    pages: Vec<Option<Arc<TrainingSample>>>,
}

impl MemorySampleSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sample at the next serial.
    pub fn push(&mut self, sample: TrainingSample) {
        self.pages.push(Some(Arc::new(sample)));
    }

    /// Appends an absent serial (a hole in the cache).
    pub fn push_absent(&mut self) {
        self.pages.push(None);
    }
}

impl SampleSource for MemorySampleSource {
    fn get_page_by_serial(&self, serial: usize) -> Option<Arc<TrainingSample>> {
        self.pages.get(serial).and_then(Clone::clone)
    }

    fn len(&self) -> usize {
        self.pages.len()
    }
}

/// Optional sink for visualizing alignments during training.
///
/// Injected rather than global so headless runs and tests pay nothing.
pub trait DebugSink: Send {
    /// Receives the outputs and targets of a debugged step.
    fn display_alignment(&mut self, iteration: u64, outputs: &[Vec<f32>], targets: &[Vec<f32>]) {
        let _ = (iteration, outputs, targets);
    }
}

/// No-op default sink.
#[derive(Debug, Default)]
pub struct NullDebugSink;

impl DebugSink for NullDebugSink {}

/// Advisory held-out evaluation hook.
///
/// Invoked whenever a new best or worst error rate is recorded, with
/// `(iteration, error_rates, serialized_model, training_stage)`. The
/// returned report is logged, never fed back into training decisions.
pub type TestCallback = Box<dyn FnMut(u64, &ErrorRates, &[u8], u32) -> String + Send>;

/// Builds a recognizer from a serialized weight blob.
///
/// Required for branching a sub-trainer from the best-trainer blob and for
/// resurrecting a checkpointed sub-trainer.
pub type RecognizerFactory = Box<dyn Fn(&[u8]) -> TrainResult<Box<dyn Recognizer>> + Send>;

/// Result of a single orchestrated training step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Per-sample classification, or `None` when the serial was absent
    /// (no-op step).
    pub trainability: Option<Trainability>,

    /// Rolling error means after this step.
    pub error_rates: ErrorRates,

    /// Whether this step recorded a new best error rate.
    pub new_best: bool,

    /// What the sub-trainer machine did this step.
    pub sub_trainer: SubTrainerResult,
}

/// Outcome of the shared per-sample training core.
pub(crate) struct StepOutcome {
    pub(crate) trainability: Trainability,
    pub(crate) rates: ErrorRates,
    pub(crate) gradient: Option<GradientInfo>,
}

/// The per-sample training core, shared by the primary trainer and the
/// sub-trainer: build targets, compute errors, apply the backward pass,
/// advance counters.
///
/// Skipped samples (`Unencodable`/`NotBoxed`) touch nothing except the
/// skip-ratio buffer and `sample_iteration`.
pub(crate) fn run_training_step(
    recognizer: &mut dyn Recognizer,
    state: &mut TrainerState,
    builder: &TargetBuilder,
    config: &TrainerConfig,
    sample: &TrainingSample,
    cache_len: usize,
    mut debug_sink: Option<&mut (dyn DebugSink + '_)>,
) -> TrainResult<StepOutcome> {
    let require_boxed = state.training_stage < config.require_boxed_until_stage;
    let output = recognizer.forward(sample)?;
    let alignment = builder.build_targets(
        &sample.transcription,
        sample.has_boxes(),
        require_boxed,
        &output.activations,
    );

    if alignment.trainability.is_skipped() {
        state.tracker.record(ErrorKind::SkipRatio, 1.0);
        advance_sample(state, cache_len);
        tracing::debug!(
            trainability = ?alignment.trainability,
            sample = state.sample_iteration,
            "sample skipped"
        );
        return Ok(StepOutcome {
            trainability: alignment.trainability,
            rates: state.tracker.roll_and_report(),
            gradient: None,
        });
    }

    let deltas: Vec<Vec<f32>> = alignment
        .targets
        .iter()
        .zip(&output.activations)
        .map(|(trow, orow)| trow.iter().zip(orow).map(|(&t, &o)| t - o).collect())
        .collect();

    let activation_rms = rms(&deltas);
    let winner_delta = winner_delta_error(&alignment.targets, &output.activations);
    let decoded = builder.decode_best_path(&output.activations);
    let char_error =
        edit_distance(&decoded, &sample.transcription) as f64 / sample.transcription.len().max(1) as f64;
    let word_recall = word_recall_error(&decoded, &sample.transcription, config.space_class);

    let mut trainability = alignment.trainability;
    if trainability == Trainability::Trainable
        && char_error > 0.0
        && activation_rms < config.hi_precision_threshold
    {
        // Confident but wrong: more often a labeling error than a model
        // deficiency, so it gets its own classification in the logs.
        trainability = Trainability::HiPrecisionErr;
        tracing::warn!(
            iteration = state.training_iteration,
            char_error,
            activation_rms,
            "high-precision disagreement: check ground truth"
        );
    }

    let mut skip_backward = false;
    if trainability == Trainability::Perfect {
        if let Some(last) = state.last_perfect_iteration {
            skip_backward = state.training_iteration.saturating_sub(last) < config.perfect_delay;
        }
        state.last_perfect_iteration = Some(state.training_iteration);
    }

    state.tracker.record(ErrorKind::ActivationRms, activation_rms);
    state.tracker.record(ErrorKind::WinnerDelta, winner_delta);
    state.tracker.record(ErrorKind::WordRecall, word_recall);
    state.tracker.record(ErrorKind::CharError, char_error);
    state.tracker.record(ErrorKind::SkipRatio, 0.0);

    let gradient = if skip_backward {
        None
    } else {
        Some(recognizer.backward(&deltas)?)
    };

    state.training_iteration += 1;
    if trainability.teaches() {
        state.learning_iteration += 1;
    }
    advance_sample(state, cache_len);

    if let Some(sink) = debug_sink.as_deref_mut() {
        sink.display_alignment(state.training_iteration, &output.activations, &alignment.targets);
    }

    Ok(StepOutcome {
        trainability,
        rates: state.tracker.roll_and_report(),
        gradient,
    })
}

fn advance_sample(state: &mut TrainerState, cache_len: usize) {
    state.sample_iteration = if cache_len > 0 {
        (state.sample_iteration + 1) % cache_len
    } else {
        0
    };
}

fn rms(deltas: &[Vec<f32>]) -> f64 {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for row in deltas {
        for &d in row {
            sum += f64::from(d) * f64::from(d);
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

fn winner_delta_error(targets: &[Vec<f32>], outputs: &[Vec<f32>]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let mismatches = targets
        .iter()
        .zip(outputs)
        .filter(|(t, o)| argmax(t) != argmax(o))
        .count();
    mismatches as f64 / targets.len() as f64
}

/// Fraction of ground-truth words not recovered by decoding. With no space
/// class the whole line counts as one word.
fn word_recall_error(decoded: &[u32], truth: &[u32], space_class: Option<u32>) -> f64 {
    match space_class {
        None => {
            if truth.is_empty() {
                0.0
            } else if decoded == truth {
                0.0
            } else {
                1.0
            }
        }
        Some(space) => {
            let truth_words: Vec<&[u32]> = truth.split(|&c| c == space).filter(|w| !w.is_empty()).collect();
            if truth_words.is_empty() {
                return 0.0;
            }
            let mut decoded_words: Vec<&[u32]> =
                decoded.split(|&c| c == space).filter(|w| !w.is_empty()).collect();
            let mut matched = 0_usize;
            for word in &truth_words {
                if let Some(pos) = decoded_words.iter().position(|w| w == word) {
                    decoded_words.swap_remove(pos);
                    matched += 1;
                }
            }
            1.0 - matched as f64 / truth_words.len() as f64
        }
    }
}

/// The top-level training orchestrator.
///
/// Owns the recognizer, the trainer state, and the sub-trainer controller;
/// pulls samples from the injected [`SampleSource`] and drives one
/// synchronous training step per [`LineTrainer::train_step`] call.
pub struct LineTrainer {
    recognizer: Box<dyn Recognizer>,
    state: TrainerState,
    config: TrainerConfig,
    target_builder: TargetBuilder,
    subtrainer: SubtrainerController,
    samples: Box<dyn SampleSource>,
    file_reader: FileReader,
    file_writer: FileWriter,
    test_callback: Option<TestCallback>,
    debug_sink: Box<dyn DebugSink>,
    recognizer_factory: Option<RecognizerFactory>,
    last_branch_attempt: u64,
}

impl LineTrainer {
    /// Creates a trainer over the given recognizer and sample source.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the configuration is invalid.
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        samples: Box<dyn SampleSource>,
        config: TrainerConfig,
    ) -> TrainResult<Self> {
        config.validate()?;
        let target_builder = TargetBuilder::new(
            config.target_mode,
            config.null_class,
            config.min_ctc_prob,
            config.zero_delta_threshold,
        );
        let state = TrainerState::new(config.error_window);
        Ok(Self {
            recognizer,
            state,
            config,
            target_builder,
            subtrainer: SubtrainerController::new(),
            samples,
            file_reader: checkpoint::fs_reader(),
            file_writer: checkpoint::fs_writer(),
            test_callback: None,
            debug_sink: Box::new(NullDebugSink),
            recognizer_factory: None,
            last_branch_attempt: 0,
        })
    }

    /// Replaces the file I/O callbacks (in-memory stand-ins in tests).
    #[must_use]
    pub fn with_file_io(mut self, reader: FileReader, writer: FileWriter) -> Self {
        self.file_reader = reader;
        self.file_writer = writer;
        self
    }

    /// Installs the advisory held-out evaluation callback.
    #[must_use]
    pub fn with_test_callback(mut self, callback: TestCallback) -> Self {
        self.test_callback = Some(callback);
        self
    }

    /// Installs a debug sink for alignment visualization.
    #[must_use]
    pub fn with_debug_sink(mut self, sink: Box<dyn DebugSink>) -> Self {
        self.debug_sink = sink;
        self
    }

    /// Installs the recognizer factory enabling sub-trainer branching and
    /// sub-trainer resurrection on checkpoint load.
    #[must_use]
    pub fn with_recognizer_factory(mut self, factory: RecognizerFactory) -> Self {
        self.recognizer_factory = Some(factory);
        self
    }

    /// Current trainer state (read-only).
    #[must_use]
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Rolling error means at this point.
    #[must_use]
    pub fn error_rates(&self) -> ErrorRates {
        self.state.tracker.roll_and_report()
    }

    /// Whether a sub-trainer is currently running.
    #[must_use]
    pub fn subtrainer_running(&self) -> bool {
        self.subtrainer.is_running()
    }

    /// Executes one training step: fetch the sample for the current
    /// serial, train on it, and run the periodic duties (best/worst
    /// bookkeeping, checkpointing, sub-trainer lock-step).
    ///
    /// An absent serial advances `sample_iteration` and returns a no-op
    /// result; it is not an error.
    pub fn train_step(&mut self) -> TrainResult<StepResult> {
        let Some(sample) = self.samples.get_page_by_serial(self.state.sample_iteration) else {
            advance_sample(&mut self.state, self.samples.len());
            return Ok(StepResult {
                trainability: None,
                error_rates: self.state.tracker.roll_and_report(),
                new_best: false,
                sub_trainer: SubTrainerResult::None,
            });
        };
        self.train_on_line(&sample)
    }

    /// Trains on one sample and runs the periodic duties.
    pub fn train_on_line(&mut self, sample: &TrainingSample) -> TrainResult<StepResult> {
        let debug_step = self.config.debug_interval > 0
            && (self.state.training_iteration + 1) % self.config.debug_interval == 0;
        let sink = if debug_step {
            Some(&mut *self.debug_sink)
        } else {
            None
        };

        let outcome = run_training_step(
            self.recognizer.as_mut(),
            &mut self.state,
            &self.target_builder,
            &self.config,
            sample,
            self.samples.len(),
            sink,
        )?;

        // Partial-failure isolation: a skipped sample touches nothing else.
        if outcome.trainability.is_skipped() {
            return Ok(StepResult {
                trainability: Some(outcome.trainability),
                error_rates: outcome.rates,
                new_best: false,
                sub_trainer: SubTrainerResult::None,
            });
        }

        let new_best = self.maintain_error_bookkeeping(&outcome.rates)?;
        let sub_result = self.maintain_subtrainer()?;
        self.maintain_checkpoints()?;

        if debug_step {
            tracing::info!("{}", self.progress_string());
            if let Ok(json) = serde_json::to_string(&outcome.rates) {
                tracing::debug!(rates = %json, "error rates");
            }
        }

        Ok(StepResult {
            trainability: Some(outcome.trainability),
            error_rates: outcome.rates,
            new_best,
            sub_trainer: sub_result,
        })
    }

    /// Advances the curriculum stage if the headline error has just
    /// crossed below `threshold` for the first time. Returns `true` on a
    /// transition.
    pub fn transition_training_stage(&mut self, threshold: f64) -> bool {
        let headline_mean = self.state.tracker.mean(self.config.headline_kind);
        let transitioned = self.state.transition_training_stage(threshold, headline_mean);
        if transitioned {
            tracing::info!(
                stage = self.state.training_stage,
                threshold,
                headline_mean,
                "training stage advanced"
            );
        }
        transitioned
    }

    /// Serializes the complete trainer (state, network weights, nested
    /// blobs, live sub-trainer) at `Full` fidelity.
    pub fn checkpoint(&mut self) -> TrainResult<Vec<u8>> {
        let mut snapshot = self.state.clone();
        snapshot.network = self.recognizer.serialize_weights()?;
        snapshot.sub_trainer = self.subtrainer.snapshot_state()?;
        CheckpointCodec::serialize(SerializeAmount::Full, &snapshot)
    }

    /// Writes a `Full` checkpoint under the canonical filename.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if no `model_base` is configured, or a
    /// `Checkpoint` error if serialization or the injected writer fails.
    pub fn save_checkpoint(&mut self) -> TrainResult<PathBuf> {
        let Some(base) = self.config.model_base.clone() else {
            return Err(TrainingError::Config {
                detail: "model_base must be set to write checkpoints".to_string(),
            });
        };
        let rates = self.state.tracker.roll_and_report();
        let name = CheckpointCodec::canonical_filename(
            &base,
            &rates,
            self.config.headline_kind,
            self.state.training_iteration,
        );
        let bytes = self.checkpoint()?;
        let path = PathBuf::from(name);
        (self.file_writer)(&path, &bytes)?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "checkpoint written");
        Ok(path)
    }

    /// Loads a checkpoint, replacing (not merging) the trainer state and
    /// network weights.
    ///
    /// Atomic-swap semantics: everything is decoded and applied to
    /// temporaries first; a failure at any point leaves the current state
    /// untouched.
    pub fn load_checkpoint(&mut self, bytes: &[u8]) -> TrainResult<()> {
        let mut loaded = CheckpointCodec::deserialize(bytes)?;

        let mut recognizer = self.recognizer.clone_box();
        if !loaded.network.is_empty() {
            recognizer.deserialize_weights(&loaded.network)?;
        }

        let sub_state = loaded.sub_trainer.take();
        let mut subtrainer = SubtrainerController::new();
        if let Some(sub) = sub_state {
            if let Some(factory) = &self.recognizer_factory {
                subtrainer.restore(sub, factory)?;
            } else {
                tracing::warn!("checkpoint carried a sub-trainer but no factory is installed; dropping it");
            }
        }

        // Commit point: nothing above mutated self.
        self.recognizer = recognizer;
        self.state = loaded;
        self.subtrainer = subtrainer;
        tracing::info!(
            iteration = self.state.training_iteration,
            "checkpoint loaded"
        );
        Ok(())
    }

    /// Reads and loads a checkpoint through the injected reader.
    pub fn load_checkpoint_file(&mut self, path: &std::path::Path) -> TrainResult<()> {
        let bytes = (self.file_reader)(path)?;
        self.load_checkpoint(&bytes)
    }

    /// Human-readable progress line.
    #[must_use]
    pub fn progress_string(&self) -> String {
        let rates = self.state.tracker.roll_and_report();
        format!(
            "At iteration {}/{}, stage {}: rms={:.3}%, delta={:.3}%, char={:.3}%, word recall={:.3}%, skip ratio={:.1}%",
            self.state.learning_iteration,
            self.state.training_iteration,
            self.state.training_stage,
            rates.get(ErrorKind::ActivationRms) * 100.0,
            rates.get(ErrorKind::WinnerDelta) * 100.0,
            rates.get(ErrorKind::CharError) * 100.0,
            rates.get(ErrorKind::WordRecall) * 100.0,
            rates.get(ErrorKind::SkipRatio) * 100.0,
        )
    }

    /// Best/worst bookkeeping from freshly rolled means. Gated on the
    /// headline buffer being warm: early means are biased toward zero and
    /// must not drive decisions.
    fn maintain_error_bookkeeping(&mut self, rates: &ErrorRates) -> TrainResult<bool> {
        if !self.state.tracker.is_warm(self.config.headline_kind) {
            return Ok(false);
        }
        let headline = self.config.headline_kind;
        if self.state.update_best(rates, headline) {
            self.on_new_best(rates)?;
            return Ok(true);
        }
        if self.state.update_worst(rates, headline) {
            tracing::debug!(
                worst = self.state.worst_error_rate,
                best = self.state.best_error_rate,
                "new worst error rate since last best"
            );
            self.invoke_test_callback(rates)?;
        }
        Ok(false)
    }

    fn on_new_best(&mut self, rates: &ErrorRates) -> TrainResult<()> {
        tracing::info!(
            iteration = self.state.training_iteration,
            best = self.state.best_error_rate,
            "new best error rate"
        );
        // Freeze the current trainer+network as the revert/branch point.
        // NoBestTrainer fidelity avoids nesting "best of best".
        self.state.network = self.recognizer.serialize_weights()?;
        let blob = CheckpointCodec::serialize(SerializeAmount::NoBestTrainer, &self.state)?;
        self.state.best_trainer = Some(blob);
        self.invoke_test_callback(rates)?;
        if self.config.model_base.is_some() {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn invoke_test_callback(&mut self, rates: &ErrorRates) -> TrainResult<()> {
        if let Some(callback) = &mut self.test_callback {
            if self.state.network.is_empty() {
                self.state.network = self.recognizer.serialize_weights()?;
            }
            let report = callback(
                self.state.training_iteration,
                rates,
                &self.state.network,
                self.state.training_stage,
            );
            tracing::info!(report = %report, "held-out evaluation");
        }
        Ok(())
    }

    /// Drives the sub-trainer state machine: lock-step updates while one
    /// is running, branching on sustained stall, merging on success.
    fn maintain_subtrainer(&mut self) -> TrainResult<SubTrainerResult> {
        if self.subtrainer.is_running() {
            let result = self.subtrainer.update(
                &self.state,
                self.samples.as_ref(),
                &self.target_builder,
                &self.config,
            )?;
            if result == SubTrainerResult::Replaced {
                if let Some(sub) = self.subtrainer.take_for_merge() {
                    tracing::info!(
                        sub_iteration = sub.state.training_iteration,
                        sub_error = sub.state.tracker.mean(self.config.headline_kind),
                        "sub-trainer replaced the primary trainer"
                    );
                    self.recognizer = sub.recognizer;
                    self.state = sub.state;
                }
            }
            return Ok(result);
        }

        let warm = self.state.tracker.is_warm(self.config.headline_kind);
        let stalled = self.state.iterations_since_best() >= self.config.stall_iterations;
        let retry_due = self.state.training_iteration
            >= self.last_branch_attempt + self.config.stall_iterations;
        if warm && stalled && retry_due {
            self.last_branch_attempt = self.state.training_iteration;
            if let Some(factory) = &self.recognizer_factory {
                let started = self.subtrainer.start(
                    &self.state,
                    factory,
                    self.samples.as_ref(),
                    &self.target_builder,
                    &self.config,
                )?;
                if !started {
                    tracing::debug!("sub-trainer could not start (no best-trainer blob yet)");
                }
            } else if let Some(blob) = self.state.best_trainer.clone() {
                // No factory means no shadow trainer; revert to the best
                // known point once the error rate has doubled from it.
                let rates = self.state.tracker.roll_and_report();
                if rates.get(self.config.headline_kind) > 2.0 * self.state.best_error_rate {
                    self.rollback_to_best(&blob)?;
                }
            }
        }
        Ok(SubTrainerResult::None)
    }

    fn rollback_to_best(&mut self, blob: &[u8]) -> TrainResult<()> {
        let best = self.state.best_error_rates;
        tracing::warn!(
            current = self.state.tracker.mean(self.config.headline_kind),
            best = self.state.best_error_rate,
            "divergence: rolling back to best trainer"
        );
        self.load_checkpoint(blob)?;
        // Re-warm the buffers at the reverted level so the rolling means
        // are immediately meaningful instead of biased toward zero.
        for kind in ErrorKind::ALL {
            self.state.tracker.fill_buffer(kind, best.get(kind));
        }
        Ok(())
    }

    /// Timer-driven inexpensive dumps.
    fn maintain_checkpoints(&mut self) -> TrainResult<()> {
        if self.config.checkpoint_interval == 0 || self.config.model_base.is_none() {
            return Ok(());
        }
        if self.state.training_iteration % self.config.checkpoint_interval != 0 {
            return Ok(());
        }
        let base = self.config.model_base.clone().unwrap_or_default();
        self.state.network = self.recognizer.serialize_weights()?;
        let bytes = CheckpointCodec::serialize(SerializeAmount::Light, &self.state)?;
        let rates = self.state.tracker.roll_and_report();
        let name = CheckpointCodec::canonical_filename(
            &base,
            &rates,
            self.config.headline_kind,
            self.state.training_iteration,
        );
        (self.file_writer)(&PathBuf::from(name), &bytes)?;
        Ok(())
    }
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use lstm_ocr_trainer::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CharBox, DebugSink, ErrorKind, ErrorRates, GradientInfo, LineTrainer, NetworkOutput,
        Recognizer, SampleSource, SerializeAmount, StepResult, SubTrainerResult, TargetMode,
        TrainResult, Trainability, TrainerConfig, TrainerState, TrainingError, TrainingSample,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_recall_whole_line() {
        assert_eq!(word_recall_error(&[1, 2], &[1, 2], None), 0.0);
        assert_eq!(word_recall_error(&[1, 3], &[1, 2], None), 1.0);
        assert_eq!(word_recall_error(&[], &[], None), 0.0);
    }

    #[test]
    fn word_recall_with_space_class() {
        // Words: [1,2] and [3]; decoded recovers only [3].
        let err = word_recall_error(&[9, 9, 0, 3], &[1, 2, 0, 3], Some(0));
        assert!((err - 0.5).abs() < 1e-12);
    }

    #[test]
    fn winner_delta_counts_mismatched_timesteps() {
        let targets = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let outputs = vec![vec![0.0, 1.0], vec![0.0, 1.0]];
        assert!((winner_delta_error(&targets, &outputs) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rms_of_zeros_is_zero() {
        assert_eq!(rms(&[vec![0.0, 0.0], vec![0.0]]), 0.0);
    }

    #[test]
    fn memory_source_serves_holes() {
        let mut source = MemorySampleSource::new();
        source.push(TrainingSample {
            features: vec![vec![0.0]],
            transcription: vec![1],
            char_boxes: None,
        });
        source.push_absent();
        assert_eq!(source.len(), 2);
        assert!(source.get_page_by_serial(0).is_some());
        assert!(source.get_page_by_serial(1).is_none());
        assert!(source.get_page_by_serial(2).is_none());
    }
}
