//! Analytic gradients checked against central finite differences.

mod common;

use common::{assert_grad_close, numeric_grad, retaining, CPU};
use symnet::{backward, forward, Binding, GraphBuilder, OutputMap, PoolingKind, ReduceAxis, Value, ValueMap, Variable};

fn analytic_grads(
    g: &GraphBuilder,
    f: symnet::Function,
    loss: Variable,
    args: &ValueMap,
    params: &[Variable],
) -> Vec<Vec<f32>> {
    let mut outputs = OutputMap::new();
    outputs.insert(loss, None);
    let state = forward(g, f, args, &mut outputs, retaining()).unwrap().unwrap();

    let mut root = ValueMap::new();
    root.insert(loss, Binding::Batch(Value::scalar(1.0, CPU)));

    let mut grads = OutputMap::new();
    for &p in params {
        grads.insert(p, None);
    }

    backward(g, &state, &root, &mut grads).unwrap();

    params
        .iter()
        .map(|p| grads[p].as_ref().unwrap().as_value().unwrap().to_vec().unwrap())
        .collect()
}

fn check_all(g: &GraphBuilder, f: symnet::Function, loss: Variable, params: &[Variable]) {
    let args = ValueMap::new();
    let analytic = analytic_grads(g, f, loss, &args, params);

    for (&param, grad) in params.iter().zip(&analytic) {
        let numeric = numeric_grad(g, f, loss, &args, param);
        assert_grad_close(grad, &numeric);
    }
}

#[test]
fn mlp_with_tanh_and_squared_error() {
    let mut g = GraphBuilder::new();

    let x = g.constant(Value::from_slice([3], None, &[0.3, -0.7, 1.1], CPU).unwrap());
    let target = g.constant(Value::from_slice([2], None, &[0.5, -0.25], CPU).unwrap());

    let w1 = g
        .parameter("w1", Value::from_slice([4, 3], None, &[0.2, -0.1, 0.4, 0.7, 0.05, -0.3, -0.6, 0.25, 0.9, 0.15, -0.45, 0.35], CPU).unwrap())
        .unwrap();
    let b1 = g.parameter("b1", Value::from_slice([4], None, &[0.1, -0.2, 0.05, 0.3], CPU).unwrap()).unwrap();
    let w2 = g
        .parameter("w2", Value::from_slice([2, 4], None, &[0.5, -0.35, 0.2, 0.1, -0.15, 0.6, 0.45, -0.55], CPU).unwrap())
        .unwrap();
    let b2 = g.parameter("b2", Value::from_slice([2], None, &[0.0, 0.2], CPU).unwrap()).unwrap();

    let a1 = g.times(w1, x).unwrap();
    let z1 = g.plus(a1, b1).unwrap();
    let h = g.tanh(z1).unwrap();
    let a2 = g.times(w2, h).unwrap();
    let pred = g.plus(a2, b2).unwrap();
    let loss = g.squared_error(pred, target).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[w1, b1, w2, b2]);
}

#[test]
fn cross_entropy_with_softmax_classifier() {
    let mut g = GraphBuilder::new();

    let x = g.constant(Value::from_slice([4], None, &[1.2, -0.4, 0.6, 0.1], CPU).unwrap());
    let labels = g.constant(Value::from_slice([3], None, &[0.0, 1.0, 0.0], CPU).unwrap());

    let w = g
        .parameter("w", Value::from_slice([3, 4], None, &[0.3, -0.2, 0.5, 0.1, -0.4, 0.25, 0.15, -0.05, 0.6, -0.3, 0.2, 0.45], CPU).unwrap())
        .unwrap();
    let b = g.parameter("b", Value::from_slice([3], None, &[0.1, 0.0, -0.1], CPU).unwrap()).unwrap();

    let logits = g.times(w, x).unwrap();
    let scored = g.plus(logits, b).unwrap();
    let loss = g.cross_entropy_with_softmax(scored, labels).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[w, b]);
}

#[test]
fn sigmoid_exp_and_scale() {
    let mut g = GraphBuilder::new();

    let s = g.parameter("s", Value::from_slice([1], None, &[0.4], CPU).unwrap()).unwrap();
    let v = g.parameter("v", Value::from_slice([3], None, &[0.25, -0.8, 0.55], CPU).unwrap()).unwrap();

    let scaled = g.scale(s, v).unwrap();
    let act = g.sigmoid(scaled).unwrap();
    let boosted = g.exp(act).unwrap();
    let loss = g.reduce_sum(boosted, ReduceAxis::Elements).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[s, v]);
}

#[test]
fn relu_and_reduce_mean() {
    let mut g = GraphBuilder::new();

    // Values kept away from the relu kink so the finite difference is
    // well defined.
    let v = g.parameter("v", Value::from_slice([4], None, &[0.8, -0.9, 0.35, -0.15], CPU).unwrap()).unwrap();
    let r = g.relu(v).unwrap();
    let loss = g.reduce_mean(r, ReduceAxis::Elements).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[v]);
}

#[test]
fn convolution_and_max_pool() {
    let mut g = GraphBuilder::new();

    let x = g
        .parameter("x", Value::from_slice([1, 3, 3], None, &[0.9, 0.1, -0.5, 0.3, 0.7, -0.2, -0.8, 0.45, 0.6], CPU).unwrap())
        .unwrap();
    let kernel = g.parameter("k", Value::from_slice([1, 1, 2, 2], None, &[0.5, -0.25, 0.75, 0.1], CPU).unwrap()).unwrap();

    let conv = g.convolution(kernel, x, (1, 1), false).unwrap();
    let pooled = g.pooling(conv, PoolingKind::Max, (2, 2), (1, 1)).unwrap();
    let loss = g.reduce_sum(pooled, ReduceAxis::Elements).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[x, kernel]);
}

#[test]
fn convolution_with_padding_and_avg_pool() {
    let mut g = GraphBuilder::new();

    let x = g
        .parameter("x", Value::from_slice([1, 3, 3], None, &[0.2, -0.4, 0.6, 0.1, 0.9, -0.7, 0.5, -0.3, 0.8], CPU).unwrap())
        .unwrap();
    let kernel = g
        .parameter("k", Value::from_slice([2, 1, 3, 3], None, &[
            0.3, -0.1, 0.2, 0.4, -0.5, 0.15, 0.25, 0.05, -0.35,
            -0.2, 0.45, 0.1, -0.15, 0.55, -0.05, 0.35, -0.25, 0.3,
        ], CPU).unwrap())
        .unwrap();

    let conv = g.convolution(kernel, x, (1, 1), true).unwrap();
    let pooled = g.pooling(conv, PoolingKind::Average, (3, 3), (1, 1)).unwrap();
    let loss = g.reduce_sum(pooled, ReduceAxis::Elements).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[x, kernel]);
}

#[test]
fn reshape_and_minus() {
    let mut g = GraphBuilder::new();

    let v = g.parameter("v", Value::from_slice([2, 2], None, &[0.9, -0.3, 0.4, 0.7], CPU).unwrap()).unwrap();
    let c = g.constant(Value::from_slice([4], None, &[0.1, 0.2, 0.3, 0.4], CPU).unwrap());

    let flat = g.reshape(v, [4]).unwrap();
    let diff = g.minus(flat, c).unwrap();
    let sq = g.element_times(diff, diff).unwrap();
    let loss = g.reduce_sum(sq, ReduceAxis::Elements).unwrap();
    let f = g.owner(loss).unwrap();

    check_all(&g, f, loss, &[v]);
}
