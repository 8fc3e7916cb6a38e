//! Shared test fixtures: a scriptable mock recognizer and sample helpers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lstm_ocr_trainer::prelude::*;

/// Shared call counters, visible after the recognizer is boxed away.
#[derive(Debug, Default)]
pub struct Probe {
    pub forward_calls: usize,
    pub backward_calls: usize,
}

/// Deterministic recognizer: returns scripted activations per forward
/// call (the last script entry repeats forever) and fixed per-layer
/// update summaries from backward.
pub struct MockRecognizer {
    script: Vec<Vec<Vec<f32>>>,
    cursor: usize,
    rates: Vec<f32>,
    layer_updates: Vec<f64>,
    weights: Vec<u8>,
    pub probe: Arc<Mutex<Probe>>,
}

impl MockRecognizer {
    pub fn new(script: Vec<Vec<Vec<f32>>>, num_layers: usize) -> Self {
        assert!(!script.is_empty(), "script must have at least one entry");
        Self {
            script,
            cursor: 0,
            rates: vec![0.1; num_layers],
            layer_updates: vec![1.0; num_layers],
            weights: vec![1, 2, 3],
            probe: Arc::new(Mutex::new(Probe::default())),
        }
    }

    pub fn boxed(script: Vec<Vec<Vec<f32>>>, num_layers: usize) -> Box<dyn Recognizer> {
        Box::new(Self::new(script, num_layers))
    }
}

impl Recognizer for MockRecognizer {
    fn forward(&mut self, _sample: &TrainingSample) -> TrainResult<NetworkOutput> {
        self.probe.lock().unwrap().forward_calls += 1;
        let index = self.cursor.min(self.script.len() - 1);
        self.cursor += 1;
        Ok(NetworkOutput {
            activations: self.script[index].clone(),
        })
    }

    fn backward(&mut self, deltas: &[Vec<f32>]) -> TrainResult<GradientInfo> {
        self.probe.lock().unwrap().backward_calls += 1;
        let mut sum = 0.0_f64;
        let mut count = 0_usize;
        for row in deltas {
            for &d in row {
                sum += f64::from(d) * f64::from(d);
                count += 1;
            }
        }
        let delta_rms = if count == 0 { 0.0 } else { (sum / count as f64).sqrt() };
        Ok(GradientInfo {
            delta_rms,
            layer_updates: self.layer_updates.clone(),
        })
    }

    fn num_layers(&self) -> usize {
        self.rates.len()
    }

    fn learning_rate(&self, layer: usize) -> f32 {
        self.rates[layer]
    }

    fn scale_learning_rate(&mut self, layer: usize, factor: f32) {
        self.rates[layer] *= factor;
    }

    fn serialize_weights(&self) -> TrainResult<Vec<u8>> {
        Ok(self.weights.clone())
    }

    fn deserialize_weights(&mut self, bytes: &[u8]) -> TrainResult<()> {
        self.weights = bytes.to_vec();
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Recognizer> {
        Box::new(Self {
            script: self.script.clone(),
            cursor: self.cursor,
            rates: self.rates.clone(),
            layer_updates: self.layer_updates.clone(),
            weights: self.weights.clone(),
            probe: Arc::clone(&self.probe),
        })
    }
}

/// A line sample with dummy features of the given width.
pub fn line(transcription: &[u32], width: usize) -> TrainingSample {
    TrainingSample {
        features: vec![vec![0.0]; width],
        transcription: transcription.to_vec(),
        char_boxes: None,
    }
}

/// Activations where `winners[t]` is confidently on top at timestep `t`.
pub fn winners(winners: &[usize], num_classes: usize) -> Vec<Vec<f32>> {
    let spread = 0.1 / (num_classes - 1) as f32;
    winners
        .iter()
        .map(|&w| {
            let mut row = vec![spread; num_classes];
            row[w] = 0.9;
            row
        })
        .collect()
}

/// A source holding one sample, served at every wrap of serial 0.
pub fn single_sample_source(sample: TrainingSample) -> Box<dyn SampleSource> {
    let mut source = lstm_ocr_trainer::MemorySampleSource::new();
    source.push(sample);
    Box::new(source)
}

/// Base config for scenario tests: exact alignment, silent, no automatic
/// checkpoint writes, stalls effectively disabled.
pub fn test_config(error_window: usize) -> TrainerConfig {
    TrainerConfig::builder()
        .target_mode(TargetMode::Exact)
        .error_window(error_window)
        .debug_interval(0)
        .stall_iterations(1_000_000)
        .build()
}
