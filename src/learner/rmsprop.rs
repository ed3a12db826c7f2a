use std::collections::HashMap;

use crate::{
    dictionary::Dictionary,
    graph::{GraphBuilder, Variable},
    value::Value,
};

use super::{buffer_from_dict, buffer_to_dict, update_parameter_with, Learner, LearnerCheckpoint, LearnerError};

const EPSILON: f32 = 1e-8;

/// RmsProp: exponentially-decayed squared-gradient normalisation.
pub struct RmsPropLearner {
    parameters: Vec<Variable>,
    learning_rate_per_sample: f32,
    gamma: f32,
    mean_square: HashMap<Variable, Vec<f32>>,
}

impl RmsPropLearner {
    pub fn new(parameters: &[Variable], learning_rate_per_sample: f32, gamma: f32) -> Self {
        assert!((0.0..1.0).contains(&gamma), "rms gamma must be in [0, 1)!");

        Self {
            parameters: parameters.to_vec(),
            learning_rate_per_sample,
            gamma,
            mean_square: HashMap::new(),
        }
    }
}

impl Learner for RmsPropLearner {
    fn parameters(&self) -> &[Variable] {
        &self.parameters
    }

    fn update(
        &mut self,
        graph: &GraphBuilder,
        gradients: &HashMap<Variable, Value>,
        _sample_count: usize,
    ) -> Result<bool, LearnerError> {
        let lr = self.learning_rate_per_sample;
        let gamma = self.gamma;

        for &param in &self.parameters.clone() {
            let size = graph.shape(param).size();
            let ms = self.mean_square.entry(param).or_insert_with(|| vec![0.0; size]);

            if ms.len() != size {
                *ms = vec![0.0; size];
            }

            update_parameter_with(graph, gradients, param, |weights, grads| {
                for i in 0..weights.len() {
                    let g = grads[i];
                    ms[i] = gamma * ms[i] + (1.0 - gamma) * g * g;
                    weights[i] -= lr * g / (ms[i].sqrt() + EPSILON);
                }
            })?;
        }

        Ok(true)
    }

    fn as_checkpoint(&self) -> Option<&dyn LearnerCheckpoint> {
        Some(self)
    }

    fn as_checkpoint_mut(&mut self) -> Option<&mut dyn LearnerCheckpoint> {
        Some(self)
    }
}

impl LearnerCheckpoint for RmsPropLearner {
    fn checkpoint(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("type", "rmsprop");

        let mut state = Dictionary::new();
        for (&param, ms) in &self.mean_square {
            state.insert(&format!("{}", param.0), buffer_to_dict(ms));
        }
        dict.insert("mean_square", state);

        dict
    }

    fn restore_from_checkpoint(&mut self, checkpoint: &Dictionary) -> Result<(), LearnerError> {
        self.mean_square.clear();

        if let Some(state) = checkpoint.get_dict("mean_square") {
            for &param in &self.parameters {
                if let Some(entry) = state.get(&format!("{}", param.0)) {
                    let len = match entry {
                        crate::dictionary::DictValue::List(items) => items.len(),
                        _ => 0,
                    };
                    self.mean_square.insert(param, buffer_from_dict(entry, len)?);
                }
            }
        }

        Ok(())
    }
}
