//! Shared helpers for numerical gradient checking.

use std::collections::HashMap;

use symnet::{forward, Binding, DeviceDescriptor, EvalOptions, Function, GraphBuilder, OutputMap, Variable};

pub const CPU: DeviceDescriptor = DeviceDescriptor::Cpu;

pub fn opts() -> EvalOptions {
    EvalOptions { device: Some(CPU), retain_state: false }
}

pub fn retaining() -> EvalOptions {
    EvalOptions { device: Some(CPU), retain_state: true }
}

/// Evaluates a scalar loss with the graph's current parameter values.
pub fn loss_value(
    g: &GraphBuilder,
    f: Function,
    loss: Variable,
    args: &HashMap<Variable, Binding>,
) -> f32 {
    let mut outputs = OutputMap::new();
    outputs.insert(loss, None);

    forward(g, f, args, &mut outputs, opts()).unwrap();

    outputs[&loss].as_ref().unwrap().as_value().unwrap().get_scalar().unwrap()
}

fn perturb(g: &GraphBuilder, param: Variable, i: usize, delta: f32) {
    g.update_parameter(param, |v| v.dense_mut().unwrap()[i] += delta).unwrap();
}

/// Central finite-difference gradient of the loss w.r.t. one parameter.
pub fn numeric_grad(
    g: &GraphBuilder,
    f: Function,
    loss: Variable,
    args: &HashMap<Variable, Binding>,
    param: Variable,
) -> Vec<f32> {
    let eps = 1e-3;
    let size = g.shape(param).size();

    (0..size)
        .map(|i| {
            perturb(g, param, i, eps);
            let hi = loss_value(g, f, loss, args);
            perturb(g, param, i, -2.0 * eps);
            let lo = loss_value(g, f, loss, args);
            perturb(g, param, i, eps);

            (hi - lo) / (2.0 * eps)
        })
        .collect()
}

/// Asserts an analytic gradient agrees with its finite-difference estimate.
pub fn assert_grad_close(analytic: &[f32], numeric: &[f32]) {
    assert_eq!(analytic.len(), numeric.len());

    for (&a, &n) in analytic.iter().zip(numeric) {
        approx::assert_relative_eq!(a, n, max_relative = 0.02, epsilon = 5e-3);
    }
}
