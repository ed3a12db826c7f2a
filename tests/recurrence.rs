//! Composite wiring, recurrence unrolling, and backpropagation through
//! time, checked against hand-unrolled static graphs.

mod common;

use common::{retaining, CPU};
use symnet::{backward, forward, Binding, GraphBuilder, OutputMap, Value, ValueMap, Variable};

fn scalar_val(x: f32) -> Value {
    Value::from_slice([1], None, &[x], CPU).unwrap()
}

/// h_t = w * x_t + h_{t-1}, h_{-1} = 0, built through a placeholder wired
/// back onto the cell output.
fn build_accumulator(g: &mut GraphBuilder) -> (Variable, Variable, Variable) {
    let w = g.parameter("w", scalar_val(0.5)).unwrap();
    let x = g.sequence_input("x", [1]).unwrap();
    let init = g.constant(Value::scalar(0.0, CPU));

    let ph = g.placeholder([1], true);
    let delayed = g.past_value(init, ph).unwrap();
    let wx = g.element_times(w, x).unwrap();
    let h = g.plus(wx, delayed).unwrap();
    let cell = g.owner(h).unwrap();

    let rec = g.composite(cell, &[(ph, h)], "accumulator").unwrap();
    let out = g.output(rec);

    (w, x, out)
}

#[test]
fn recurrence_unrolls_along_the_sequence() {
    let mut g = GraphBuilder::new();
    let (_, x, out) = build_accumulator(&mut g);

    let mut args = ValueMap::new();
    args.insert(x, Binding::Steps(vec![scalar_val(1.0), scalar_val(2.0), scalar_val(4.0)]));

    let mut outputs = OutputMap::new();
    outputs.insert(out, None);
    forward(&g, g.owner(out).unwrap(), &args, &mut outputs, common::opts()).unwrap();

    let steps = outputs[&out].as_ref().unwrap().as_steps().unwrap();
    let values = steps.iter().map(|v| v.get_scalar().unwrap()).collect::<Vec<_>>();

    // 0.5 * [1, 2, 4] accumulated: 0.5, 1.5, 3.5.
    assert_eq!(values, vec![0.5, 1.5, 3.5]);
}

#[test]
fn unroll_length_follows_the_bound_sequence() {
    let mut g = GraphBuilder::new();
    let (_, x, out) = build_accumulator(&mut g);

    for len in [1usize, 5] {
        let mut args = ValueMap::new();
        args.insert(x, Binding::Steps((0..len).map(|_| scalar_val(1.0)).collect()));

        let mut outputs = OutputMap::new();
        outputs.insert(out, None);
        forward(&g, g.owner(out).unwrap(), &args, &mut outputs, common::opts()).unwrap();

        let steps = outputs[&out].as_ref().unwrap().as_steps().unwrap();
        assert_eq!(steps.len(), len);
        assert_eq!(steps.last().unwrap().get_scalar().unwrap(), 0.5 * len as f32);
    }
}

/// The same three-step computation as a hand-built static graph.
fn static_unrolled_grad(xs: [f32; 3]) -> f32 {
    let mut g = GraphBuilder::new();
    let w = g.parameter("w", scalar_val(0.5)).unwrap();

    let mut h = None;
    for &xv in &xs {
        let x = g.constant(scalar_val(xv));
        let wx = g.element_times(w, x).unwrap();

        h = Some(match h {
            None => wx,
            Some(prev) => g.plus(wx, prev).unwrap(),
        });
    }

    let last = h.unwrap();
    let f = g.owner(last).unwrap();

    let mut outputs = OutputMap::new();
    outputs.insert(last, None);
    let state = forward(&g, f, &ValueMap::new(), &mut outputs, retaining()).unwrap().unwrap();

    let mut root = ValueMap::new();
    root.insert(last, Binding::Batch(scalar_val(1.0)));

    let mut grads = OutputMap::new();
    grads.insert(w, None);
    backward(&g, &state, &root, &mut grads).unwrap();

    grads[&w].as_ref().unwrap().as_value().unwrap().get_scalar().unwrap()
}

#[test]
fn backprop_through_time_matches_static_unroll() {
    let xs = [1.0f32, 2.0, 4.0];

    let mut g = GraphBuilder::new();
    let (w, x, out) = build_accumulator(&mut g);

    let mut args = ValueMap::new();
    args.insert(x, Binding::Steps(xs.iter().map(|&v| scalar_val(v)).collect()));

    let mut outputs = OutputMap::new();
    outputs.insert(out, None);
    let state = forward(&g, g.owner(out).unwrap(), &args, &mut outputs, retaining()).unwrap().unwrap();

    // Gradient of the final step only.
    let mut root = ValueMap::new();
    root.insert(out, Binding::Steps(vec![scalar_val(0.0), scalar_val(0.0), scalar_val(1.0)]));

    let mut grads = OutputMap::new();
    grads.insert(w, None);
    grads.insert(x, None);
    backward(&g, &state, &root, &mut grads).unwrap();

    let dw = grads[&w].as_ref().unwrap().as_value().unwrap().get_scalar().unwrap();

    // d h_3 / dw threads through every step: x1 + x2 + x3.
    assert_eq!(dw, xs.iter().sum::<f32>());
    assert_eq!(dw, static_unrolled_grad(xs));

    // Each step's input receives d h_3 / d x_t = w.
    let dx = grads[&x].as_ref().unwrap().as_steps().unwrap();
    for step in dx {
        assert_eq!(step.get_scalar().unwrap(), 0.5);
    }
}

#[test]
fn block_executes_like_its_composite() {
    let mut g = GraphBuilder::new();
    let x = g.input("x", [2]).unwrap();
    let c = g.constant(Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap());
    let doubled = g.plus(x, x).unwrap();
    let shifted = g.plus(doubled, c).unwrap();
    let inner = g.owner(shifted).unwrap();

    let block = g.block(inner, "layer").unwrap();
    let block_out = g.output(block);

    let mut args = ValueMap::new();
    args.insert(x, Binding::Batch(Value::from_slice([2], None, &[3.0, 4.0], CPU).unwrap()));

    let mut outputs = OutputMap::new();
    outputs.insert(block_out, None);
    outputs.insert(shifted, None);
    forward(&g, block, &args, &mut outputs, common::opts()).unwrap();

    let through_block = outputs[&block_out].as_ref().unwrap().as_value().unwrap().to_vec().unwrap();
    let direct = outputs[&shifted].as_ref().unwrap().as_value().unwrap().to_vec().unwrap();

    assert_eq!(through_block, vec![7.0, 10.0]);
    assert_eq!(through_block, direct);

    // Externally the block is one opaque node.
    let visible = g.visible_functions(block);
    assert_eq!(visible, vec![block]);
}

#[test]
fn combined_exposes_loss_and_metric_from_one_pass() {
    let mut g = GraphBuilder::new();
    let x = g.input("x", [2]).unwrap();
    let labels = g.constant(Value::from_slice([2], None, &[0.0, 1.0], CPU).unwrap());
    let w = g.parameter("w", Value::from_slice([2, 2], None, &[0.6, -0.2, 0.3, 0.8], CPU).unwrap()).unwrap();

    let scores = g.times(w, x).unwrap();
    let loss = g.cross_entropy_with_softmax(scores, labels).unwrap();
    let metric = g.prediction_error(scores, labels).unwrap();

    let joint = g
        .combined(&[g.owner(loss).unwrap(), g.owner(metric).unwrap()], "loss_and_metric")
        .unwrap();

    let mut args = ValueMap::new();
    args.insert(x, Binding::Batch(Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap()));

    let mut outputs = OutputMap::new();
    outputs.insert(loss, None);
    outputs.insert(metric, None);
    forward(&g, joint, &args, &mut outputs, common::opts()).unwrap();

    // scores = [0.2, 1.9]; argmax matches the label, so the error metric
    // is zero while the loss is positive.
    let metric_val = outputs[&metric].as_ref().unwrap().as_value().unwrap().get_scalar().unwrap();
    let loss_val = outputs[&loss].as_ref().unwrap().as_value().unwrap().get_scalar().unwrap();

    assert_eq!(metric_val, 0.0);
    assert!(loss_val > 0.0);
}

#[test]
fn stacked_recurrent_layers_compose() {
    // Two accumulator layers stacked: the second consumes the first's
    // output sequence.
    let mut g = GraphBuilder::new();
    let x = g.sequence_input("x", [1]).unwrap();
    let init = g.constant(Value::scalar(0.0, CPU));

    let mut layer_out = x;
    for i in 0..2 {
        let ph = g.placeholder([1], true);
        let delayed = g.past_value(init, ph).unwrap();
        let sum = g.plus(layer_out, delayed).unwrap();
        let cell = g.owner(sum).unwrap();
        let rec = g.composite(cell, &[(ph, sum)], &format!("layer{i}")).unwrap();
        layer_out = g.output(rec);
    }

    let mut args = ValueMap::new();
    args.insert(x, Binding::Steps(vec![scalar_val(1.0), scalar_val(1.0), scalar_val(1.0)]));

    let mut outputs = OutputMap::new();
    outputs.insert(layer_out, None);
    forward(&g, g.owner(layer_out).unwrap(), &args, &mut outputs, common::opts()).unwrap();

    let steps = outputs[&layer_out].as_ref().unwrap().as_steps().unwrap();
    let values = steps.iter().map(|v| v.get_scalar().unwrap()).collect::<Vec<_>>();

    // First layer: 1, 2, 3. Second layer accumulates that: 1, 3, 6.
    assert_eq!(values, vec![1.0, 3.0, 6.0]);
}
