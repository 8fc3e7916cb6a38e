//! End-to-end orchestrator scenarios against a scripted mock recognizer.

mod common;

use std::sync::{Arc, Mutex};

use common::{line, single_sample_source, test_config, winners, MockRecognizer};
use lstm_ocr_trainer::prelude::*;
use lstm_ocr_trainer::{LineTrainer, MemorySampleSource, RecognizerFactory};

#[test]
fn skipped_sample_touches_nothing_but_skip_ratio() {
    // Serial 1 carries a label outside the 3-class space.
    let mut source = MemorySampleSource::new();
    source.push(line(&[1], 2));
    source.push(line(&[9], 2));
    source.push(line(&[1], 2));

    let recognizer = MockRecognizer::boxed(vec![winners(&[2, 0], 3)], 1);
    let mut trainer = LineTrainer::new(recognizer, Box::new(source), test_config(4)).unwrap();

    let r1 = trainer.train_step().unwrap();
    assert_eq!(r1.trainability, Some(Trainability::Trainable));
    assert_eq!(trainer.state().training_iteration, 1);

    let r2 = trainer.train_step().unwrap();
    assert_eq!(r2.trainability, Some(Trainability::Unencodable));
    assert_eq!(trainer.state().training_iteration, 1);
    assert_eq!(trainer.state().tracker.count(ErrorKind::SkipRatio), 2);
    assert_eq!(trainer.state().tracker.count(ErrorKind::CharError), 1);

    let r3 = trainer.train_step().unwrap();
    assert_eq!(r3.trainability, Some(Trainability::Trainable));
    assert_eq!(trainer.state().training_iteration, 2);
    assert_eq!(trainer.state().tracker.count(ErrorKind::SkipRatio), 3);

    // Serial wrapped around the 3-sample cache.
    assert_eq!(trainer.state().sample_iteration, 0);
}

#[test]
fn absent_serial_is_a_noop_step() {
    let mut source = MemorySampleSource::new();
    source.push_absent();
    source.push(line(&[1], 2));

    let recognizer = MockRecognizer::boxed(vec![winners(&[2, 0], 3)], 1);
    let mut trainer = LineTrainer::new(recognizer, Box::new(source), test_config(4)).unwrap();

    let r1 = trainer.train_step().unwrap();
    assert_eq!(r1.trainability, None);
    assert_eq!(trainer.state().training_iteration, 0);
    assert_eq!(trainer.state().sample_iteration, 1);

    let r2 = trainer.train_step().unwrap();
    assert_eq!(r2.trainability, Some(Trainability::Trainable));
    assert_eq!(trainer.state().training_iteration, 1);
}

#[test]
fn best_is_monotone_and_worst_tracks_excursions() {
    // Char error sequence 1.0, 0.5, 1.0, 0.5 over a window of 1.
    let script = vec![
        winners(&[0, 0, 0, 0], 3),
        winners(&[1, 0, 0, 0], 3),
        winners(&[0, 0, 0, 0], 3),
        winners(&[1, 0, 0, 0], 3),
    ];
    let recognizer = MockRecognizer::boxed(script, 1);
    let source = single_sample_source(line(&[1, 2], 4));

    let callback_iterations: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&callback_iterations);
    let mut trainer = LineTrainer::new(recognizer, source, test_config(1))
        .unwrap()
        .with_test_callback(Box::new(move |iteration, _rates, _model, _stage| {
            captured.lock().unwrap().push(iteration);
            format!("eval at {iteration}")
        }));

    let mut best_history = Vec::new();
    let mut new_best_flags = Vec::new();
    for _ in 0..4 {
        let result = trainer.train_step().unwrap();
        new_best_flags.push(result.new_best);
        best_history.push(trainer.state().best_error_rate);
        assert!(trainer.state().learning_iteration <= trainer.state().training_iteration);
    }

    assert_eq!(new_best_flags, vec![true, true, false, false]);
    assert!(best_history.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(trainer.state().best_error_rate, 0.5);
    assert_eq!(trainer.state().worst_error_rate, 1.0);
    assert!(trainer.state().best_trainer.is_some());

    // Two new bests plus one new worst.
    assert_eq!(callback_iterations.lock().unwrap().len(), 3);
}

#[test]
fn perfect_samples_train_at_most_once_per_delay() {
    // Output exactly equals the padded targets for truth [1].
    let exact = vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]];
    let recognizer = Box::new(MockRecognizer::new(vec![exact], 1));
    let probe = Arc::clone(&recognizer.probe);
    let source = single_sample_source(line(&[1], 2));

    let mut config = test_config(8);
    config.perfect_delay = 4;
    let mut trainer = LineTrainer::new(recognizer, source, config).unwrap();

    for _ in 0..5 {
        let result = trainer.train_step().unwrap();
        assert_eq!(result.trainability, Some(Trainability::Perfect));
    }

    assert_eq!(trainer.state().training_iteration, 5);
    assert_eq!(trainer.state().learning_iteration, 0);
    assert_eq!(trainer.state().last_perfect_iteration, Some(4));
    // Only the first perfect sample reached the backward pass.
    assert_eq!(probe.lock().unwrap().backward_calls, 1);
}

#[test]
fn confident_disagreement_is_flagged_and_still_trains() {
    // Truth [1,1] decodes to [1] after collapsing, so char error is 0.5
    // while the deltas against the exact targets stay tiny.
    let near_perfect = vec![vec![0.02, 0.98, 0.0], vec![0.02, 0.98, 0.0]];
    let recognizer = MockRecognizer::boxed(vec![near_perfect], 1);
    let source = single_sample_source(line(&[1, 1], 2));

    let mut trainer = LineTrainer::new(recognizer, source, test_config(4)).unwrap();
    let result = trainer.train_step().unwrap();

    assert_eq!(result.trainability, Some(Trainability::HiPrecisionErr));
    assert_eq!(trainer.state().learning_iteration, 1);
}

#[test]
fn stage_advances_only_on_first_crossing() {
    let script = vec![winners(&[0, 0, 0, 0], 3), winners(&[1, 0, 0, 0], 3)];
    let recognizer = MockRecognizer::boxed(script, 1);
    let source = single_sample_source(line(&[1, 2], 4));
    let mut trainer = LineTrainer::new(recognizer, source, test_config(1)).unwrap();

    trainer.train_step().unwrap();
    assert!(!trainer.transition_training_stage(0.6));

    trainer.train_step().unwrap();
    assert!(trainer.transition_training_stage(0.6));
    assert_eq!(trainer.state().training_stage, 1);

    assert!(!trainer.transition_training_stage(0.6));
    assert!(!trainer.transition_training_stage(0.4));
    assert_eq!(trainer.state().training_stage, 1);
}

#[test]
fn debug_sink_sees_alignments_at_the_configured_interval() {
    struct CapturingSink(Arc<Mutex<Vec<u64>>>);
    impl DebugSink for CapturingSink {
        fn display_alignment(
            &mut self,
            iteration: u64,
            outputs: &[Vec<f32>],
            targets: &[Vec<f32>],
        ) {
            assert_eq!(outputs.len(), targets.len());
            self.0.lock().unwrap().push(iteration);
        }
    }

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let recognizer = MockRecognizer::boxed(vec![winners(&[2, 0], 3)], 1);
    let source = single_sample_source(line(&[1], 2));
    let mut config = test_config(4);
    config.debug_interval = 2;

    let mut trainer = LineTrainer::new(recognizer, source, config)
        .unwrap()
        .with_debug_sink(Box::new(CapturingSink(Arc::clone(&seen))));
    for _ in 0..4 {
        trainer.train_step().unwrap();
    }

    assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
    assert_eq!(trainer.state().training_iteration, 4);
}

#[test]
fn stall_branches_a_subtrainer_that_merges_on_margin() {
    // Primary gets one good step (char 0.5) then stays at 1.0.
    let script = vec![winners(&[1, 0, 0, 0], 3), winners(&[0, 0, 0, 0], 3)];
    let recognizer = MockRecognizer::boxed(script, 2);
    let source = single_sample_source(line(&[1, 2], 4));

    // The factory's recognizer decodes the truth exactly.
    let factory: RecognizerFactory = Box::new(|_weights| {
        Ok(MockRecognizer::boxed(vec![winners(&[1, 0, 2, 0], 3)], 2))
    });

    let config = TrainerConfig::builder()
        .target_mode(TargetMode::Exact)
        .error_window(1)
        .debug_interval(0)
        .stall_iterations(3)
        .margin_fraction(0.2)
        .build();
    let mut trainer = LineTrainer::new(recognizer, source, config)
        .unwrap()
        .with_recognizer_factory(factory);

    let mut saw_replacement = false;
    for _ in 0..8 {
        let result = trainer.train_step().unwrap();
        if result.sub_trainer == SubTrainerResult::Replaced {
            saw_replacement = true;
        }
    }

    assert!(saw_replacement);
    assert!(!trainer.subtrainer_running());
    // The merged trainer carries the sub-trainer's error level, and the
    // primary keeps improving with the promoted weights.
    assert_eq!(trainer.state().tracker.mean(ErrorKind::CharError), 0.0);
    assert_eq!(trainer.state().best_error_rate, 0.0);
}
