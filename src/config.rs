//! Trainer configuration.
//!
//! The configuration system is designed to be:
//! - **Serializable** - load/save from TOML files
//! - **Validated** - out-of-range parameters are rejected before training
//! - **Defaulted** - the defaults are workable for a typical line-OCR run
//!
//! # Example
//!
//! ```rust
//! use lstm_ocr_trainer::config::TrainerConfig;
//! use lstm_ocr_trainer::targets::TargetMode;
//!
//! let config = TrainerConfig::builder()
//!     .target_mode(TargetMode::Ctc)
//!     .error_window(1000)
//!     .stall_iterations(10_000)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{TrainResult, TrainingError};
use crate::targets::TargetMode;
use crate::tracker::{ErrorKind, DEFAULT_ERROR_WINDOW};

/// Configuration for the line trainer.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `error_window` | 1000 | Rolling error window `K` |
/// | `perfect_delay` | 4 | Min iterations between trained perfect samples |
/// | `stall_iterations` | 10000 | Iterations past best before branching |
/// | `margin_fraction` | 0.02 | Relative improvement a sub-trainer must show |
/// | `lr_reduction_factor` | 0.5 | Learning-rate scale applied when branching |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Ground-truth-to-target alignment strategy.
    #[serde(default)]
    pub target_mode: TargetMode,

    /// Class code of the null (CTC blank) class.
    #[serde(default)]
    pub null_class: u32,

    /// Class code treated as the word separator when computing word recall.
    /// With `None` the whole line counts as one word.
    #[serde(default)]
    pub space_class: Option<u32>,

    /// Floor applied to output activations before CTC alignment, to avoid
    /// zero-probability blowup in the log-loss. Range: 1e-12 to 1e-2.
    #[serde(default = "default_min_ctc_prob")]
    pub min_ctc_prob: f64,

    /// Deltas with max absolute value at or below this count as zero
    /// (`Trainability::Perfect`).
    #[serde(default = "default_zero_delta_threshold")]
    pub zero_delta_threshold: f64,

    /// Activation-RMS level below which a wrong answer is flagged as
    /// `HiPrecisionErr` (confident but wrong, likely a labeling error).
    #[serde(default = "default_hi_precision_threshold")]
    pub hi_precision_threshold: f64,

    /// Minimum iterations between backward passes on perfect samples.
    /// Zero trains every perfect sample.
    #[serde(default = "default_perfect_delay")]
    pub perfect_delay: u64,

    /// Training stages below this one require boxed (per-character aligned)
    /// ground truth; samples without boxes are skipped as `NotBoxed`.
    /// Zero never requires boxes.
    #[serde(default)]
    pub require_boxed_until_stage: u32,

    /// Rolling error window size `K`, fixed at construction.
    #[serde(default = "default_error_window")]
    pub error_window: usize,

    /// The error kind driving best/worst tracking and stage transitions.
    #[serde(default = "default_headline_kind")]
    pub headline_kind: ErrorKind,

    /// Iterations without a new best before a sub-trainer is branched.
    #[serde(default = "default_stall_iterations")]
    pub stall_iterations: u64,

    /// Minimum relative improvement over the primary's current error rate
    /// before a sub-trainer may replace it. Prevents thrashing on
    /// noise-level differences. Range: (0, 1).
    #[serde(default = "default_margin_fraction")]
    pub margin_fraction: f64,

    /// Learning-rate scale factor used when branching a sub-trainer.
    #[serde(default = "default_lr_reduction_factor")]
    pub lr_reduction_factor: f32,

    /// Reduce learning rates independently per layer (probe-driven) rather
    /// than uniformly when starting a sub-trainer.
    #[serde(default)]
    pub per_layer_rates: bool,

    /// Samples used per layer by the learning-rate reduction probe.
    #[serde(default = "default_probe_samples")]
    pub probe_samples: usize,

    /// Update calls a caught-up sub-trainer may spend failing the margin
    /// condition before it is discarded.
    #[serde(default = "default_subtrainer_max_attempts")]
    pub subtrainer_max_attempts: u32,

    /// Base name used for canonical checkpoint filenames. `None` disables
    /// automatic checkpoint writes.
    #[serde(default)]
    pub model_base: Option<String>,

    /// Emit a progress string and drive the debug sink every N trained
    /// iterations. Zero disables.
    #[serde(default = "default_debug_interval")]
    pub debug_interval: u64,

    /// Write an inexpensive `Light` checkpoint every N trained iterations.
    /// Zero disables the timer (best-checkpoint writes still happen).
    #[serde(default)]
    pub checkpoint_interval: u64,
}

// Default value functions for serde
fn default_min_ctc_prob() -> f64 {
    1e-6
}
fn default_zero_delta_threshold() -> f64 {
    1e-6
}
fn default_hi_precision_threshold() -> f64 {
    0.05
}
fn default_perfect_delay() -> u64 {
    4
}
fn default_error_window() -> usize {
    DEFAULT_ERROR_WINDOW
}
fn default_headline_kind() -> ErrorKind {
    ErrorKind::CharError
}
fn default_stall_iterations() -> u64 {
    10_000
}
fn default_margin_fraction() -> f64 {
    0.02
}
fn default_lr_reduction_factor() -> f32 {
    0.5
}
fn default_probe_samples() -> usize {
    8
}
fn default_subtrainer_max_attempts() -> u32 {
    8
}
fn default_debug_interval() -> u64 {
    100
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            target_mode: TargetMode::default(),
            null_class: 0,
            space_class: None,
            min_ctc_prob: default_min_ctc_prob(),
            zero_delta_threshold: default_zero_delta_threshold(),
            hi_precision_threshold: default_hi_precision_threshold(),
            perfect_delay: default_perfect_delay(),
            require_boxed_until_stage: 0,
            error_window: default_error_window(),
            headline_kind: default_headline_kind(),
            stall_iterations: default_stall_iterations(),
            margin_fraction: default_margin_fraction(),
            lr_reduction_factor: default_lr_reduction_factor(),
            per_layer_rates: false,
            probe_samples: default_probe_samples(),
            subtrainer_max_attempts: default_subtrainer_max_attempts(),
            model_base: None,
            debug_interval: default_debug_interval(),
            checkpoint_interval: 0,
        }
    }
}

impl TrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TrainerConfigBuilder {
        TrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TrainingError::Config {
                detail: format!("failed to read config file: {e}"),
            }
        })?;
        toml::from_str(&content).map_err(|e| TrainingError::Config {
            detail: format!("failed to parse config: {e}"),
        })
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> TrainResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TrainingError::Config {
            detail: format!("failed to serialize config: {e}"),
        })?;
        std::fs::write(path.as_ref(), content).map_err(|e| TrainingError::Config {
            detail: format!("failed to write config file: {e}"),
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error describing the first violated constraint.
    pub fn validate(&self) -> TrainResult<()> {
        if self.error_window == 0 {
            return Err(TrainingError::Config {
                detail: "error_window must be at least 1".to_string(),
            });
        }
        if !(self.margin_fraction > 0.0 && self.margin_fraction < 1.0) {
            return Err(TrainingError::Config {
                detail: format!(
                    "margin_fraction must be in (0, 1), got {}",
                    self.margin_fraction
                ),
            });
        }
        if !(self.min_ctc_prob > 0.0 && self.min_ctc_prob < 1.0) {
            return Err(TrainingError::Config {
                detail: format!("min_ctc_prob must be in (0, 1), got {}", self.min_ctc_prob),
            });
        }
        if !(self.lr_reduction_factor > 0.0 && self.lr_reduction_factor < 1.0) {
            return Err(TrainingError::Config {
                detail: format!(
                    "lr_reduction_factor must be in (0, 1), got {}",
                    self.lr_reduction_factor
                ),
            });
        }
        if self.per_layer_rates && self.probe_samples == 0 {
            return Err(TrainingError::Config {
                detail: "probe_samples must be at least 1 when per_layer_rates is set".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default)]
pub struct TrainerConfigBuilder {
    config: TrainerConfig,
}

impl TrainerConfigBuilder {
    /// Sets the alignment mode.
    #[must_use]
    pub fn target_mode(mut self, mode: TargetMode) -> Self {
        self.config.target_mode = mode;
        self
    }

    /// Sets the null (blank) class code.
    #[must_use]
    pub fn null_class(mut self, class: u32) -> Self {
        self.config.null_class = class;
        self
    }

    /// Sets the word-separator class code.
    #[must_use]
    pub fn space_class(mut self, class: u32) -> Self {
        self.config.space_class = Some(class);
        self
    }

    /// Sets the rolling error window size `K`.
    #[must_use]
    pub fn error_window(mut self, window: usize) -> Self {
        self.config.error_window = window;
        self
    }

    /// Sets the headline error kind.
    #[must_use]
    pub fn headline_kind(mut self, kind: ErrorKind) -> Self {
        self.config.headline_kind = kind;
        self
    }

    /// Sets the perfect-sample delay.
    #[must_use]
    pub fn perfect_delay(mut self, delay: u64) -> Self {
        self.config.perfect_delay = delay;
        self
    }

    /// Sets the stage below which boxed truth is required.
    #[must_use]
    pub fn require_boxed_until_stage(mut self, stage: u32) -> Self {
        self.config.require_boxed_until_stage = stage;
        self
    }

    /// Sets the stall threshold for sub-trainer branching.
    #[must_use]
    pub fn stall_iterations(mut self, iterations: u64) -> Self {
        self.config.stall_iterations = iterations;
        self
    }

    /// Sets the sub-trainer replacement margin.
    #[must_use]
    pub fn margin_fraction(mut self, fraction: f64) -> Self {
        self.config.margin_fraction = fraction;
        self
    }

    /// Sets the learning-rate reduction factor.
    #[must_use]
    pub fn lr_reduction_factor(mut self, factor: f32) -> Self {
        self.config.lr_reduction_factor = factor;
        self
    }

    /// Enables per-layer learning-rate selection.
    #[must_use]
    pub fn per_layer_rates(mut self, enabled: bool) -> Self {
        self.config.per_layer_rates = enabled;
        self
    }

    /// Sets the probe sample count.
    #[must_use]
    pub fn probe_samples(mut self, samples: usize) -> Self {
        self.config.probe_samples = samples;
        self
    }

    /// Sets the model base name for canonical checkpoint filenames.
    #[must_use]
    pub fn model_base(mut self, base: impl Into<String>) -> Self {
        self.config.model_base = Some(base.into());
        self
    }

    /// Sets the debug/progress interval.
    #[must_use]
    pub fn debug_interval(mut self, interval: u64) -> Self {
        self.config.debug_interval = interval;
        self
    }

    /// Sets the light-checkpoint timer interval.
    #[must_use]
    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TrainerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainerConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = TrainerConfig::builder()
            .target_mode(TargetMode::Exact)
            .error_window(50)
            .margin_fraction(0.1)
            .model_base("eng_lstm")
            .build();
        assert_eq!(config.target_mode, TargetMode::Exact);
        assert_eq!(config.error_window, 50);
        assert_eq!(config.model_base.as_deref(), Some("eng_lstm"));
    }

    #[test]
    fn zero_window_rejected() {
        let config = TrainerConfig::builder().error_window(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_margin_rejected() {
        let config = TrainerConfig::builder().margin_fraction(1.5).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = TrainerConfig::builder()
            .space_class(3)
            .stall_iterations(123)
            .build();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: TrainerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.space_class, Some(3));
        assert_eq!(parsed.stall_iterations, 123);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let parsed: TrainerConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.error_window, DEFAULT_ERROR_WINDOW);
        assert_eq!(parsed.headline_kind, ErrorKind::CharError);
    }
}
