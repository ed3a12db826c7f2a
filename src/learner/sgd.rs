use std::collections::HashMap;

use crate::{
    dictionary::Dictionary,
    graph::{GraphBuilder, Variable},
    value::Value,
};

use super::{buffer_from_dict, buffer_to_dict, update_parameter_with, Learner, LearnerCheckpoint, LearnerError};

/// Stochastic gradient descent with momentum expressed as a time constant:
/// the momentum factor is `exp(-1 / time_constant)`, zero when the constant
/// is zero.
pub struct SgdLearner {
    parameters: Vec<Variable>,
    learning_rate_per_sample: f32,
    momentum: f32,
    velocity: HashMap<Variable, Vec<f32>>,
    samples_seen: usize,
    /// Stop learning after this many samples; `None` never stops.
    max_samples: Option<usize>,
}

impl SgdLearner {
    pub fn new(parameters: &[Variable], learning_rate_per_sample: f32, momentum_time_constant: usize) -> Self {
        let momentum = if momentum_time_constant == 0 {
            0.0
        } else {
            (-1.0 / momentum_time_constant as f32).exp()
        };

        Self {
            parameters: parameters.to_vec(),
            learning_rate_per_sample,
            momentum,
            velocity: HashMap::new(),
            samples_seen: 0,
            max_samples: None,
        }
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = Some(max_samples);
        self
    }
}

impl Learner for SgdLearner {
    fn parameters(&self) -> &[Variable] {
        &self.parameters
    }

    fn update(
        &mut self,
        graph: &GraphBuilder,
        gradients: &HashMap<Variable, Value>,
        sample_count: usize,
    ) -> Result<bool, LearnerError> {
        if let Some(max) = self.max_samples {
            if self.samples_seen >= max {
                return Ok(false);
            }
        }

        let lr = self.learning_rate_per_sample;
        let momentum = self.momentum;

        for &param in &self.parameters.clone() {
            let size = graph.shape(param).size();
            let velocity = self.velocity.entry(param).or_insert_with(|| vec![0.0; size]);

            if velocity.len() != size {
                *velocity = vec![0.0; size];
            }

            update_parameter_with(graph, gradients, param, |weights, grads| {
                for i in 0..weights.len() {
                    velocity[i] = momentum * velocity[i] + grads[i];
                    weights[i] -= lr * velocity[i];
                }
            })?;
        }

        self.samples_seen += sample_count;

        Ok(self.max_samples.is_none_or(|max| self.samples_seen < max))
    }

    fn as_checkpoint(&self) -> Option<&dyn LearnerCheckpoint> {
        Some(self)
    }

    fn as_checkpoint_mut(&mut self) -> Option<&mut dyn LearnerCheckpoint> {
        Some(self)
    }
}

impl LearnerCheckpoint for SgdLearner {
    fn checkpoint(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("type", "sgd");
        dict.insert("samples_seen", self.samples_seen);

        let mut state = Dictionary::new();
        for (&param, velocity) in &self.velocity {
            state.insert(&format!("{}", param.0), buffer_to_dict(velocity));
        }
        dict.insert("velocity", state);

        dict
    }

    fn restore_from_checkpoint(&mut self, checkpoint: &Dictionary) -> Result<(), LearnerError> {
        self.samples_seen = checkpoint
            .get_int("samples_seen")
            .ok_or_else(|| LearnerError::BadCheckpoint("missing samples_seen".to_string()))?
            as usize;

        self.velocity.clear();

        if let Some(state) = checkpoint.get_dict("velocity") {
            for &param in &self.parameters {
                if let Some(entry) = state.get(&format!("{}", param.0)) {
                    let len = match entry {
                        crate::dictionary::DictValue::List(items) => items.len(),
                        _ => 0,
                    };
                    self.velocity.insert(param, buffer_from_dict(entry, len)?);
                }
            }
        }

        Ok(())
    }
}
