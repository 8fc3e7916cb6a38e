//! Ground-truth-to-target alignment.
//!
//! Converts a transcription (sequence of class codes) into a per-timestep
//! tensor of target class distributions, in one of two modes:
//!
//! - **Exact/padded**: truth labels occupy the leading timesteps, the
//!   remainder is filled with the null class. Requires the transcription to
//!   fit the output length.
//! - **CTC**: labels may be interspersed with null-class positions anywhere;
//!   the target is the forward-backward occupancy over all label sequences
//!   consistent with collapsing adjacent duplicates and removing nulls.
//!   Activations are floor-clipped to a minimum probability first, so a
//!   zero-probability output cannot blow up the log-loss.
//!
//! Target building is a pure function of (truth, current output); it never
//! touches the network.

use serde::{Deserialize, Serialize};

use crate::error::Trainability;

/// Alignment strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetMode {
    /// Padded exact alignment: labels first, null-class padding after.
    Exact,
    /// Alignment-free CTC targets.
    #[default]
    Ctc,
}

/// Result of target construction for one sample.
#[derive(Debug, Clone)]
pub struct TargetAlignment {
    /// Per-timestep target class distributions. Empty when the sample is
    /// skipped (`Unencodable`/`NotBoxed`).
    pub targets: Vec<Vec<f32>>,
    /// Classification of the sample.
    pub trainability: Trainability,
}

impl TargetAlignment {
    fn skipped(trainability: Trainability) -> Self {
        Self {
            targets: Vec::new(),
            trainability,
        }
    }
}

/// Builds target distributions from transcriptions and network output.
#[derive(Debug, Clone)]
pub struct TargetBuilder {
    mode: TargetMode,
    null_class: u32,
    min_ctc_prob: f64,
    zero_delta_threshold: f64,
}

impl TargetBuilder {
    /// Creates a builder for the given mode and null class.
    #[must_use]
    pub fn new(mode: TargetMode, null_class: u32, min_ctc_prob: f64, zero_delta_threshold: f64) -> Self {
        Self {
            mode,
            null_class,
            min_ctc_prob,
            zero_delta_threshold,
        }
    }

    /// The configured alignment mode.
    #[must_use]
    pub fn mode(&self) -> TargetMode {
        self.mode
    }

    /// The configured null class code.
    #[must_use]
    pub fn null_class(&self) -> u32 {
        self.null_class
    }

    /// Builds targets for one sample.
    ///
    /// `has_boxes` reports whether the sample carries precise per-character
    /// alignment; `require_boxed` is the current curriculum requirement.
    /// Returns `Unencodable` if the transcription or the configured null
    /// class cannot be mapped into the class space, or the transcription
    /// cannot fit the output length, `NotBoxed` if boxes are
    /// required but absent, `Perfect` if the resulting delta error is zero,
    /// and `Trainable` otherwise.
    #[must_use]
    pub fn build_targets(
        &self,
        transcription: &[u32],
        has_boxes: bool,
        require_boxed: bool,
        outputs: &[Vec<f32>],
    ) -> TargetAlignment {
        if require_boxed && !has_boxes {
            return TargetAlignment::skipped(Trainability::NotBoxed);
        }
        if outputs.is_empty() || outputs[0].is_empty() {
            return TargetAlignment::skipped(Trainability::Unencodable);
        }
        let num_classes = outputs[0].len() as u32;
        if self.null_class >= num_classes {
            return TargetAlignment::skipped(Trainability::Unencodable);
        }
        if transcription.iter().any(|&c| c >= num_classes) {
            return TargetAlignment::skipped(Trainability::Unencodable);
        }

        let targets = match self.mode {
            TargetMode::Exact => match self.exact_targets(transcription, outputs) {
                Some(t) => t,
                None => return TargetAlignment::skipped(Trainability::Unencodable),
            },
            TargetMode::Ctc => match self.ctc_targets(transcription, outputs) {
                Some(t) => t,
                None => return TargetAlignment::skipped(Trainability::Unencodable),
            },
        };

        let max_delta = targets
            .iter()
            .zip(outputs)
            .flat_map(|(trow, orow)| {
                trow.iter()
                    .zip(orow)
                    .map(|(&t, &o)| f64::from((t - o).abs()))
            })
            .fold(0.0_f64, f64::max);
        let trainability = if max_delta <= self.zero_delta_threshold {
            Trainability::Perfect
        } else {
            Trainability::Trainable
        };

        TargetAlignment {
            targets,
            trainability,
        }
    }

    /// Padded exact alignment. Fails when the transcription is longer than
    /// the output sequence.
    fn exact_targets(&self, transcription: &[u32], outputs: &[Vec<f32>]) -> Option<Vec<Vec<f32>>> {
        let width = outputs.len();
        let num_classes = outputs[0].len();
        if transcription.len() > width {
            return None;
        }
        let mut targets = vec![vec![0.0_f32; num_classes]; width];
        for (t, row) in targets.iter_mut().enumerate() {
            let class = transcription
                .get(t)
                .copied()
                .unwrap_or(self.null_class) as usize;
            row[class] = 1.0;
        }
        Some(targets)
    }

    /// CTC forward-backward occupancy over the blank-interleaved label
    /// sequence, normalized per timestep.
    fn ctc_targets(&self, transcription: &[u32], outputs: &[Vec<f32>]) -> Option<Vec<Vec<f32>>> {
        let width = outputs.len();
        let num_classes = outputs[0].len();
        let null = self.null_class;

        // Blank-interleaved label sequence: b, l0, b, l1, ..., b.
        let mut ext = Vec::with_capacity(2 * transcription.len() + 1);
        ext.push(null);
        for &label in transcription {
            ext.push(label);
            ext.push(null);
        }
        let s_len = ext.len();
        if s_len > 2 * width + 1 || transcription.len() > width {
            return None;
        }

        // Floor-clipped log probabilities.
        let log_prob = |t: usize, s: usize| -> f64 {
            f64::from(outputs[t][ext[s] as usize]).max(self.min_ctc_prob).ln()
        };

        let neg_inf = f64::NEG_INFINITY;
        let mut alpha = vec![vec![neg_inf; s_len]; width];
        alpha[0][0] = log_prob(0, 0);
        if s_len > 1 {
            alpha[0][1] = log_prob(0, 1);
        }
        for t in 1..width {
            for s in 0..s_len {
                let mut acc = alpha[t - 1][s];
                if s >= 1 {
                    acc = log_add(acc, alpha[t - 1][s - 1]);
                }
                if s >= 2 && ext[s] != null && ext[s] != ext[s - 2] {
                    acc = log_add(acc, alpha[t - 1][s - 2]);
                }
                if acc > neg_inf {
                    alpha[t][s] = acc + log_prob(t, s);
                }
            }
        }

        let mut beta = vec![vec![neg_inf; s_len]; width];
        beta[width - 1][s_len - 1] = 0.0;
        if s_len > 1 {
            beta[width - 1][s_len - 2] = 0.0;
        }
        for t in (0..width.saturating_sub(1)).rev() {
            for s in 0..s_len {
                let mut acc = beta[t + 1][s] + log_prob(t + 1, s);
                if s + 1 < s_len {
                    acc = log_add(acc, beta[t + 1][s + 1] + log_prob(t + 1, s + 1));
                }
                if s + 2 < s_len && ext[s + 2] != null && ext[s + 2] != ext[s] {
                    acc = log_add(acc, beta[t + 1][s + 2] + log_prob(t + 1, s + 2));
                }
                beta[t][s] = acc;
            }
        }

        let mut log_z = alpha[width - 1][s_len - 1];
        if s_len > 1 {
            log_z = log_add(log_z, alpha[width - 1][s_len - 2]);
        }
        if log_z == neg_inf {
            return None;
        }

        let mut targets = vec![vec![0.0_f32; num_classes]; width];
        for t in 0..width {
            let mut row = vec![0.0_f64; num_classes];
            for s in 0..s_len {
                let gamma = alpha[t][s] + beta[t][s] - log_z;
                if gamma > neg_inf {
                    row[ext[s] as usize] += gamma.exp();
                }
            }
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                for (target, &value) in targets[t].iter_mut().zip(&row) {
                    *target = (value / sum) as f32;
                }
            } else {
                // Unreachable alignment at this timestep; fall back to null.
                targets[t][null as usize] = 1.0;
            }
        }
        Some(targets)
    }

    /// Best-path decoding: argmax per timestep, collapse adjacent
    /// duplicates, drop nulls.
    #[must_use]
    pub fn decode_best_path(&self, outputs: &[Vec<f32>]) -> Vec<u32> {
        let mut decoded = Vec::new();
        let mut previous = None;
        for row in outputs {
            let winner = argmax(row) as u32;
            if Some(winner) != previous && winner != self.null_class {
                decoded.push(winner);
            }
            previous = Some(winner);
        }
        decoded
    }
}

/// Index of the maximum element. Ties break to the lowest index.
#[must_use]
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Levenshtein edit distance between two class-code sequences.
#[must_use]
pub fn edit_distance(a: &[u32], b: &[u32]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0_usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}
