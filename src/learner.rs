//! Learners: pluggable parameter-update algorithms driven by the trainer
//! with first-order gradients.

mod adagrad;
mod rmsprop;
mod sgd;

pub use adagrad::AdaGradLearner;
pub use rmsprop::RmsPropLearner;
pub use sgd::SgdLearner;

use std::collections::HashMap;

use crate::{
    dictionary::{DictValue, Dictionary},
    graph::{GraphBuilder, GraphError, Variable},
    value::{Value, ValueError},
};

#[derive(Debug)]
pub enum LearnerError {
    Graph(GraphError),
    Value(ValueError),
    MissingGradient(Variable),
    BadCheckpoint(String),
}

impl From<GraphError> for LearnerError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<ValueError> for LearnerError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Updates a subset of a model's parameters from gradient values.
///
/// `update` mutates parameter values in place, strictly between minibatch
/// boundaries. Returning `false` reports that learning has stopped for all
/// of this learner's parameters; this is voluntary exhaustion, not an
/// error. Checkpointing is a separate, optional capability surfaced
/// through `as_checkpoint` / `as_checkpoint_mut`.
pub trait Learner {
    fn parameters(&self) -> &[Variable];

    fn update(
        &mut self,
        graph: &GraphBuilder,
        gradients: &HashMap<Variable, Value>,
        sample_count: usize,
    ) -> Result<bool, LearnerError>;

    fn as_checkpoint(&self) -> Option<&dyn LearnerCheckpoint> {
        None
    }

    fn as_checkpoint_mut(&mut self) -> Option<&mut dyn LearnerCheckpoint> {
        None
    }
}

/// Optional checkpoint capability for learners that carry state.
pub trait LearnerCheckpoint {
    fn checkpoint(&self) -> Dictionary;

    fn restore_from_checkpoint(&mut self, checkpoint: &Dictionary) -> Result<(), LearnerError>;
}

/// Serializes one per-parameter state buffer into a dictionary list.
pub(crate) fn buffer_to_dict(buf: &[f32]) -> DictValue {
    DictValue::List(buf.iter().map(|&v| DictValue::Double(v as f64)).collect())
}

pub(crate) fn buffer_from_dict(value: &DictValue, expected_len: usize) -> Result<Vec<f32>, LearnerError> {
    let DictValue::List(items) = value else {
        return Err(LearnerError::BadCheckpoint("state buffer is not a list".to_string()));
    };

    if items.len() != expected_len {
        return Err(LearnerError::BadCheckpoint(format!(
            "state buffer has {} entries, expected {expected_len}",
            items.len()
        )));
    }

    items
        .iter()
        .map(|item| match item {
            DictValue::Double(v) => Ok(*v as f32),
            _ => Err(LearnerError::BadCheckpoint("state buffer entry is not a double".to_string())),
        })
        .collect()
}

/// Applies `step` to a parameter, pulling its gradient out of the supplied
/// gradient map. Shared plumbing for the builtin learners.
pub(crate) fn update_parameter_with(
    graph: &GraphBuilder,
    gradients: &HashMap<Variable, Value>,
    param: Variable,
    step: impl FnOnce(&mut [f32], &[f32]),
) -> Result<(), LearnerError> {
    let grad = gradients.get(&param).ok_or(LearnerError::MissingGradient(param))?;
    let grad_vals = grad.dense()?.to_vec();

    let mut failure = None;
    graph.update_parameter(param, |value| match value.dense_mut() {
        Ok(buf) => step(buf, &grad_vals),
        Err(e) => failure = Some(e),
    })?;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
