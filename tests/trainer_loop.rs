//! End-to-end training: minibatch sources, learners, exhaustion, and
//! checkpoint round trips.

use std::collections::HashMap;

use symnet::{
    trainer::logger, Binding, DeviceDescriptor, GraphBuilder, InMemorySource, Learner, SgdLearner, Shape,
    Trainer, TrainingControl, Value, ValueMap, Variable,
};

const CPU: DeviceDescriptor = DeviceDescriptor::Cpu;

/// Linear regression: predict y = 2x - 1 from noisy-free samples.
fn build_trainer(lr: f32) -> (Trainer, Variable, Variable) {
    logger::set_quiet(true);

    let mut g = GraphBuilder::new();
    let x = g.input("x", [1]).unwrap();
    let target = g.input("target", [1]).unwrap();

    let w = g.parameter("w", Value::from_slice([1, 1], None, &[0.0], CPU).unwrap()).unwrap();
    let b = g.parameter("b", Value::from_slice([1], None, &[0.0], CPU).unwrap()).unwrap();

    let wx = g.times(w, x).unwrap();
    let pred = g.plus(wx, b).unwrap();
    let loss = g.squared_error(pred, target).unwrap();
    let model = g.owner(loss).unwrap();

    let learner = SgdLearner::new(&[w, b], lr, 0);
    let trainer = Trainer::new(g, model, loss, vec![Box::new(learner)]);

    (trainer, x, target)
}

fn regression_samples(n: usize) -> (Vec<f32>, Vec<f32>) {
    let xs = (0..n).map(|i| (i % 10) as f32 / 5.0 - 1.0).collect::<Vec<_>>();
    let ys = xs.iter().map(|&x| 2.0 * x - 1.0).collect::<Vec<_>>();
    (xs, ys)
}

#[test]
fn minibatch_training_reduces_loss() {
    let (mut trainer, x, target) = build_trainer(0.02);
    let (xs, ys) = regression_samples(8);

    let bind = |xs: &[f32], ys: &[f32]| {
        let mut args = ValueMap::new();
        args.insert(x, Binding::Batch(Value::from_slice([1], Some(xs.len()), xs, CPU).unwrap()));
        args.insert(target, Binding::Batch(Value::from_slice([1], Some(ys.len()), ys, CPU).unwrap()));
        args
    };

    let args = bind(&xs, &ys);

    trainer.train_minibatch(&args).unwrap();
    let initial = trainer.previous_minibatch_loss();

    for _ in 0..200 {
        trainer.train_minibatch(&args).unwrap();
    }

    let trained = trainer.previous_minibatch_loss();
    assert!(trained < initial / 10.0, "loss {trained} did not drop from {initial}");
    assert_eq!(trainer.samples_seen(), 8 * 201);
}

#[test]
fn train_minibatch_reports_learner_exhaustion() {
    logger::set_quiet(true);

    let mut g = GraphBuilder::new();
    let x = g.input("x", [1]).unwrap();
    let w = g.parameter("w", Value::from_slice([1, 1], None, &[1.0], CPU).unwrap()).unwrap();
    let wx = g.times(w, x).unwrap();
    let loss = g.squared_error(wx, x).unwrap();
    let model = g.owner(loss).unwrap();

    let learner = SgdLearner::new(&[w], 0.01, 0).with_max_samples(3);
    let mut trainer = Trainer::new(g, model, loss, vec![Box::new(learner)]);

    let mut args = ValueMap::new();
    args.insert(x, Binding::Batch(Value::from_slice([1], Some(2), &[1.0, 2.0], CPU).unwrap()));

    // Two samples per call; the learner stops after three.
    assert!(trainer.train_minibatch(&args).unwrap());
    assert!(!trainer.train_minibatch(&args).unwrap());
}

struct FixedControl {
    batch: usize,
    max_minibatches: usize,
    seen: usize,
}

impl TrainingControl for FixedControl {
    fn next_minibatch_size(&self, _variable: Variable) -> usize {
        self.batch
    }

    fn pre_minibatch_callback(&mut self, _trainer: &Trainer) -> Result<bool, symnet::trainer::TrainerError> {
        self.seen += 1;
        Ok(self.seen <= self.max_minibatches)
    }
}

#[test]
fn train_drives_source_until_control_stops() {
    let (mut trainer, x, target) = build_trainer(0.01);
    let (xs, ys) = regression_samples(40);

    let mut source = InMemorySource::new(
        vec![
            ("features".to_string(), Shape::from([1]), xs),
            ("targets".to_string(), Shape::from([1]), ys),
        ],
        CPU,
    );

    let mut stream_map = HashMap::new();
    stream_map.insert(x, "features".to_string());
    stream_map.insert(target, "targets".to_string());

    let mut control = FixedControl { batch: 4, max_minibatches: 5, seen: 0 };
    trainer.train(&mut source, &stream_map, &mut control).unwrap();

    // Cooperative stop after five minibatches of four samples.
    assert_eq!(trainer.samples_seen(), 20);
}

#[test]
fn train_stops_on_source_exhaustion() {
    let (mut trainer, x, target) = build_trainer(0.01);
    let (xs, ys) = regression_samples(10);

    let mut source = InMemorySource::new(
        vec![
            ("features".to_string(), Shape::from([1]), xs),
            ("targets".to_string(), Shape::from([1]), ys),
        ],
        CPU,
    );

    let mut stream_map = HashMap::new();
    stream_map.insert(x, "features".to_string());
    stream_map.insert(target, "targets".to_string());

    let mut control = FixedControl { batch: 4, max_minibatches: 1000, seen: 0 };
    trainer.train(&mut source, &stream_map, &mut control).unwrap();

    assert_eq!(trainer.samples_seen(), 10);
}

#[test]
fn checkpoint_round_trip_resumes_identically() {
    let dir = std::env::temp_dir().join(format!("symnet-ckpt-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let model_path = dir.join("model.bin");
    let ckpt_path = dir.join("trainer.json");
    let model_path = model_path.to_str().unwrap();
    let ckpt_path = ckpt_path.to_str().unwrap();

    let (xs, ys) = regression_samples(8);
    let (mut trainer, x, target) = build_trainer(0.05);

    let bind = |x: Variable, target: Variable| {
        let mut args = ValueMap::new();
        args.insert(x, Binding::Batch(Value::from_slice([1], Some(xs.len()), &xs, CPU).unwrap()));
        args.insert(target, Binding::Batch(Value::from_slice([1], Some(ys.len()), &ys, CPU).unwrap()));
        args
    };

    let args = bind(x, target);
    for _ in 0..10 {
        trainer.train_minibatch(&args).unwrap();
    }

    trainer.write_checkpoint(model_path, ckpt_path).unwrap();

    // Continue the original for a few more steps.
    for _ in 0..5 {
        trainer.train_minibatch(&args).unwrap();
    }
    let reference_loss = trainer.previous_minibatch_loss();
    let reference_samples = trainer.samples_seen();

    // A fresh trainer restored from the checkpoint replays the same steps.
    let (mut restored, x2, target2) = build_trainer(0.05);
    restored.restore_from_checkpoint(model_path, ckpt_path).unwrap();
    assert_eq!(restored.samples_seen(), 8 * 10);

    let args2 = bind(x2, target2);
    for _ in 0..5 {
        restored.train_minibatch(&args2).unwrap();
    }

    assert_eq!(restored.previous_minibatch_loss(), reference_loss);
    assert_eq!(restored.samples_seen(), reference_samples);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn extra_outputs_are_computed_each_minibatch() {
    logger::set_quiet(true);

    let mut g = GraphBuilder::new();
    let x = g.input("x", [2]).unwrap();
    let labels = g.input("labels", [2]).unwrap();
    let w = g.parameter("w", Value::from_slice([2, 2], None, &[0.1, 0.2, 0.3, 0.4], CPU).unwrap()).unwrap();

    let scores = g.times(w, x).unwrap();
    let loss = g.cross_entropy_with_softmax(scores, labels).unwrap();
    let metric = g.prediction_error(scores, labels).unwrap();
    let loss_fn = g.owner(loss).unwrap();
    let metric_fn = g.owner(metric).unwrap();
    let model = g.combined(&[loss_fn, metric_fn], "model").unwrap();

    let learner = SgdLearner::new(&[w], 0.01, 0);
    let mut trainer = Trainer::new(g, model, loss, vec![Box::new(learner)]).with_outputs(&[metric]);

    let mut args = ValueMap::new();
    args.insert(x, Binding::Batch(Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap()));
    args.insert(labels, Binding::Batch(Value::from_slice([2], None, &[0.0, 1.0], CPU).unwrap()));

    trainer.train_minibatch(&args).unwrap();

    let outputs = trainer.previous_minibatch_outputs();
    assert!(outputs.contains_key(&metric));
    assert!(outputs[&metric].as_value().unwrap().get_scalar().is_some());
}

#[test]
fn learner_checkpoint_capability_is_detectable() {
    let mut g = GraphBuilder::new();
    let w = g.parameter("w", Value::from_slice([1], None, &[1.0], CPU).unwrap()).unwrap();
    let mut learner = SgdLearner::new(&[w], 0.1, 32);

    assert!(learner.as_checkpoint().is_some());

    let dict = learner.as_checkpoint().unwrap().checkpoint();
    assert_eq!(dict.get_string("type"), Some("sgd"));

    learner.as_checkpoint_mut().unwrap().restore_from_checkpoint(&dict).unwrap();
}
