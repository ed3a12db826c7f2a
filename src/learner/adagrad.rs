use std::collections::HashMap;

use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{
    dictionary::Dictionary,
    graph::{GraphBuilder, Variable},
    value::Value,
};

use super::{buffer_from_dict, buffer_to_dict, update_parameter_with, Learner, LearnerCheckpoint, LearnerError};

const EPSILON: f32 = 1e-8;

/// AdaGrad: per-element learning rates scaled by accumulated squared
/// gradients, with optional gaussian gradient noise injection.
pub struct AdaGradLearner {
    parameters: Vec<Variable>,
    learning_rate_per_sample: f32,
    noise_std: f32,
    accumulators: HashMap<Variable, Vec<f32>>,
    rng: StdRng,
}

impl AdaGradLearner {
    pub fn new(parameters: &[Variable], learning_rate_per_sample: f32, noise_std: f32) -> Self {
        Self {
            parameters: parameters.to_vec(),
            learning_rate_per_sample,
            noise_std,
            accumulators: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }
}

impl Learner for AdaGradLearner {
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
        let noise = (self.noise_std > 0.0)
            .then(|| Normal::new(0.0, self.noise_std).expect("noise_std must be finite"));

        for &param in &self.parameters.clone() {
            let size = graph.shape(param).size();
            let acc = self.accumulators.entry(param).or_insert_with(|| vec![0.0; size]);

            if acc.len() != size {
                *acc = vec![0.0; size];
            }

            let rng = &mut self.rng;
            update_parameter_with(graph, gradients, param, |weights, grads| {
                for i in 0..weights.len() {
                    let mut g = grads[i];
                    if let Some(dist) = &noise {
                        g += dist.sample(rng);
                    }

                    acc[i] += g * g;
                    weights[i] -= lr * g / (acc[i].sqrt() + EPSILON);
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

impl LearnerCheckpoint for AdaGradLearner {
    fn checkpoint(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("type", "adagrad");

        let mut state = Dictionary::new();
        for (&param, acc) in &self.accumulators {
            state.insert(&format!("{}", param.0), buffer_to_dict(acc));
        }
        dict.insert("accumulators", state);

        dict
    }

    fn restore_from_checkpoint(&mut self, checkpoint: &Dictionary) -> Result<(), LearnerError> {
        self.accumulators.clear();

        if let Some(state) = checkpoint.get_dict("accumulators") {
            for &param in &self.parameters {
                if let Some(entry) = state.get(&format!("{}", param.0)) {
                    let len = match entry {
                        crate::dictionary::DictValue::List(items) => items.len(),
                        _ => 0,
                    };
                    self.accumulators.insert(param, buffer_from_dict(entry, len)?);
                }
            }
        }

        Ok(())
    }
}
