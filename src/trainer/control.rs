//! Cooperative training-duration control, evaluated once per minibatch
//! boundary.

use crate::graph::Variable;

use super::{Trainer, TrainerError};

/// Decides minibatch sizes and when training ends. The callback's return
/// value is the only cancellation mechanism: `false` ends training
/// normally at the next minibatch boundary.
pub trait TrainingControl {
    /// Desired size of the next minibatch for the given model argument.
    /// When sizes differ across arguments the actual size is their minimum.
    fn next_minibatch_size(&self, variable: Variable) -> usize;

    /// Called before each minibatch; `false` ends training.
    fn pre_minibatch_callback(&mut self, _trainer: &Trainer) -> Result<bool, TrainerError> {
        Ok(true)
    }

    /// Called once when training ends, normally or by callback.
    fn training_finished(&mut self, _trainer: &Trainer) -> Result<(), TrainerError> {
        Ok(())
    }
}

/// Trains for a fixed number of samples with periodic checkpoints, writing
/// a final checkpoint when training ends.
pub struct BasicTrainingControl {
    max_samples: usize,
    checkpoint_frequency: usize,
    minibatch_size: usize,
    model_path: String,
    checkpoint_path: String,
    last_checkpoint: usize,
}

impl BasicTrainingControl {
    pub fn new(
        max_samples: usize,
        checkpoint_frequency: usize,
        minibatch_size: usize,
        model_path: &str,
        checkpoint_path: &str,
    ) -> Self {
        Self {
            max_samples,
            checkpoint_frequency,
            minibatch_size,
            model_path: model_path.to_string(),
            checkpoint_path: checkpoint_path.to_string(),
            last_checkpoint: 0,
        }
    }
}

impl TrainingControl for BasicTrainingControl {
    fn next_minibatch_size(&self, _variable: Variable) -> usize {
        self.minibatch_size
    }

    fn pre_minibatch_callback(&mut self, trainer: &Trainer) -> Result<bool, TrainerError> {
        let seen = trainer.samples_seen();

        if self.checkpoint_frequency > 0 && seen - self.last_checkpoint >= self.checkpoint_frequency {
            trainer.write_checkpoint(&self.model_path, &self.checkpoint_path)?;
            self.last_checkpoint = seen;
        }

        Ok(seen < self.max_samples)
    }

    fn training_finished(&mut self, trainer: &Trainer) -> Result<(), TrainerError> {
        trainer.write_checkpoint(&self.model_path, &self.checkpoint_path)
    }
}
