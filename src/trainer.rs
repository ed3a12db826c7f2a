//! The training loop: repeatedly pulls minibatches, drives forward and
//! backward through the execution engine, and feeds gradients to learners.

mod checkpoint;
pub mod control;
pub mod logger;
pub mod minibatch;

pub use control::{BasicTrainingControl, TrainingControl};
pub use minibatch::{InMemorySource, MinibatchSource, StreamDescription};

use std::{collections::HashMap, time::Instant};

use crate::{
    device::{default_device, DeviceDescriptor},
    dictionary::{DictValue, Dictionary},
    distributed::{DistributedError, DistributedTrain},
    engine::{self, Binding, EvalError, EvalOptions, OutputMap, ValueMap},
    graph::{Function, GraphBuilder, GraphError, Variable},
    learner::{Learner, LearnerError},
    value::Value,
};

#[derive(Debug)]
pub enum TrainerError {
    Eval(EvalError),
    Learner(LearnerError),
    Distributed(DistributedError),
    Graph(GraphError),
    /// No minibatch stream is mapped to a model argument.
    MissingStream(String),
    Io(std::io::Error),
    Checkpoint(String),
}

impl From<EvalError> for TrainerError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

impl From<LearnerError> for TrainerError {
    fn from(value: LearnerError) -> Self {
        Self::Learner(value)
    }
}

impl From<DistributedError> for TrainerError {
    fn from(value: DistributedError) -> Self {
        Self::Distributed(value)
    }
}

impl From<GraphError> for TrainerError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}

impl From<std::io::Error> for TrainerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<crate::value::ValueError> for TrainerError {
    fn from(value: crate::value::ValueError) -> Self {
        Self::Eval(value.into())
    }
}

impl From<serde_json::Error> for TrainerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Checkpoint(value.to_string())
    }
}

/// Orchestrates training of a model function against a loss variable.
///
/// Owns the graph; learners mutate parameter values strictly between
/// minibatch boundaries, never while a forward or backward referencing
/// them is in flight.
pub struct Trainer {
    graph: GraphBuilder,
    model: Function,
    loss: Variable,
    extra_outputs: Vec<Variable>,
    learners: Vec<Box<dyn Learner>>,
    distributed: Option<Box<dyn DistributedTrain>>,
    device: DeviceDescriptor,
    samples_seen: usize,
    minibatches_seen: usize,
    last_loss: f32,
    last_outputs: ValueMap,
    /// Log every n-th minibatch; 0 silences progress output.
    pub log_rate: usize,
}

impl Trainer {
    pub fn new(
        graph: GraphBuilder,
        model: Function,
        loss: Variable,
        learners: Vec<Box<dyn Learner>>,
    ) -> Self {
        Self {
            graph,
            model,
            loss,
            extra_outputs: Vec::new(),
            learners,
            distributed: None,
            device: default_device(),
            samples_seen: 0,
            minibatches_seen: 0,
            last_loss: 0.0,
            last_outputs: ValueMap::new(),
            log_rate: 0,
        }
    }

    /// Additional output variables (an evaluation metric, say) computed on
    /// every minibatch alongside the loss.
    pub fn with_outputs(mut self, outputs: &[Variable]) -> Self {
        self.extra_outputs = outputs.to_vec();
        self
    }

    pub fn with_distributed(mut self, distributed: Box<dyn DistributedTrain>) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub fn graph(&self) -> &GraphBuilder {
        &self.graph
    }

    pub fn model(&self) -> Function {
        self.model
    }

    pub fn loss_variable(&self) -> Variable {
        self.loss
    }

    pub fn samples_seen(&self) -> usize {
        self.samples_seen
    }

    /// Mean per-sample loss of the most recent minibatch.
    pub fn previous_minibatch_loss(&self) -> f32 {
        self.last_loss
    }

    pub fn previous_minibatch_outputs(&self) -> &ValueMap {
        &self.last_outputs
    }

    /// Runs one forward/backward/update cycle over the bound arguments.
    /// Returns `false` once every learner reports exhaustion; this is
    /// normal termination, not an error.
    pub fn train_minibatch(&mut self, arguments: &ValueMap) -> Result<bool, TrainerError> {
        let sample_count = arguments
            .values()
            .map(|binding| match binding {
                Binding::Batch(v) => v.batch_size().unwrap_or(1),
                Binding::Steps(steps) => steps.first().and_then(Value::batch_size).unwrap_or(1),
            })
            .max()
            .unwrap_or(1);

        if let Some(distributed) = self.distributed.as_mut() {
            distributed.per_minibatch(sample_count)?;
        }

        // Forward, retaining state for the backward pass.
        let mut outputs: OutputMap = OutputMap::new();
        outputs.insert(self.loss, None);
        for &out in &self.extra_outputs {
            outputs.insert(out, None);
        }

        let opts = EvalOptions { device: Some(self.device), retain_state: true };
        let state = engine::forward(&self.graph, self.model, arguments, &mut outputs, opts)?
            .expect("retain_state was requested");

        let loss_value = outputs
            .get(&self.loss)
            .and_then(|slot| slot.as_ref())
            .and_then(Binding::as_value)
            .ok_or(TrainerError::Eval(EvalError::SequenceBindingMismatch(self.loss)))?;
        let loss_sum = loss_value.dense()?.iter().sum::<f32>();
        let loss_batch = loss_value.batch_size().unwrap_or(1);

        // Backward to every learner-owned parameter, with a unit root
        // gradient so parameter gradients are sums over the minibatch.
        let mut root = ValueMap::new();
        root.insert(self.loss, Binding::Batch(Value::scalar(1.0, self.device)));

        let mut requested: OutputMap = OutputMap::new();
        for learner in &self.learners {
            for &param in learner.parameters() {
                requested.insert(param, None);
            }
        }

        engine::backward(&self.graph, &state, &root, &mut requested)?;

        // Release the leased forward state before any parameter mutation.
        drop(state);

        let mut gradients: HashMap<Variable, Value> = HashMap::new();
        for (param, slot) in requested {
            if let Some(Binding::Batch(grad)) = slot {
                gradients.insert(param, grad);
            }
        }

        if let Some(distributed) = self.distributed.as_mut() {
            distributed.pre_parameter_update(&self.graph, &mut gradients, sample_count)?;
        }

        let mut any_learning = false;
        for learner in &mut self.learners {
            if learner.update(&self.graph, &gradients, sample_count)? {
                any_learning = true;
            }
        }

        self.samples_seen += sample_count;
        self.minibatches_seen += 1;
        self.last_loss = loss_sum / loss_batch as f32;
        self.last_outputs = outputs
            .into_iter()
            .filter_map(|(var, slot)| slot.map(|binding| (var, binding)))
            .collect();

        Ok(any_learning)
    }

    /// Trains against a minibatch source until it is exhausted, every
    /// learner stops, or the control callback ends training. The stream
    /// map is the 1:1 correspondence between model arguments and source
    /// streams.
    pub fn train(
        &mut self,
        source: &mut dyn MinibatchSource,
        stream_map: &HashMap<Variable, String>,
        control: &mut dyn TrainingControl,
    ) -> Result<(), TrainerError> {
        logger::report_training_started();
        let timer = Instant::now();

        loop {
            if !control.pre_minibatch_callback(self)? {
                break;
            }

            let requested = stream_map
                .iter()
                .map(|(&var, stream)| (stream.clone(), control.next_minibatch_size(var)))
                .collect::<HashMap<_, _>>();

            let Some(mut minibatch) = source.next_minibatch(&requested) else {
                break;
            };

            let mut arguments = ValueMap::new();
            for (&var, stream) in stream_map {
                let value = minibatch
                    .remove(stream)
                    .ok_or_else(|| TrainerError::MissingStream(stream.clone()))?;
                arguments.insert(var, Binding::Batch(value));
            }

            let keep_going = self.train_minibatch(&arguments)?;

            if self.log_rate > 0 && self.minibatches_seen % self.log_rate == 0 {
                logger::report_minibatch(self.minibatches_seen, self.last_loss, self.samples_seen, &timer);
            }

            if !keep_going {
                break;
            }
        }

        control.training_finished(self)?;
        logger::report_training_finished(self.samples_seen, &timer);

        Ok(())
    }

    /// Writes the model weights and the trainer/learner state. The state
    /// dictionary carries everything needed to resume without re-applying
    /// an already-applied update.
    pub fn write_checkpoint(&self, model_path: &str, checkpoint_path: &str) -> Result<(), TrainerError> {
        checkpoint::write_model(&self.graph, self.model, model_path)?;

        let mut dict = Dictionary::new();
        dict.insert("samples_seen", self.samples_seen);
        dict.insert("minibatches_seen", self.minibatches_seen);

        let learner_states = self
            .learners
            .iter()
            .map(|learner| match learner.as_checkpoint() {
                Some(ckpt) => DictValue::Dict(ckpt.checkpoint()),
                None => DictValue::Dict(Dictionary::new()),
            })
            .collect::<Vec<_>>();
        dict.insert("learners", learner_states);

        if let Some(state) = self.distributed.as_ref().and_then(|d| d.checkpoint()) {
            dict.insert("distributed", state);
        }

        let file = std::fs::File::create(checkpoint_path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &dict)?;

        Ok(())
    }

    pub fn restore_from_checkpoint(
        &mut self,
        model_path: &str,
        checkpoint_path: &str,
    ) -> Result<(), TrainerError> {
        checkpoint::load_model(&self.graph, self.model, model_path)?;

        let file = std::fs::File::open(checkpoint_path)?;
        let dict: Dictionary = serde_json::from_reader(std::io::BufReader::new(file))?;

        self.samples_seen = dict
            .get_int("samples_seen")
            .ok_or_else(|| TrainerError::Checkpoint("missing samples_seen".to_string()))?
            as usize;
        self.minibatches_seen = dict.get_int("minibatches_seen").unwrap_or(0) as usize;

        let states = dict
            .get_list("learners")
            .ok_or_else(|| TrainerError::Checkpoint("missing learner states".to_string()))?;

        if states.len() != self.learners.len() {
            return Err(TrainerError::Checkpoint(format!(
                "checkpoint holds {} learner states, trainer has {} learners",
                states.len(),
                self.learners.len()
            )));
        }

        for (learner, state) in self.learners.iter_mut().zip(states) {
            let DictValue::Dict(state) = state else {
                return Err(TrainerError::Checkpoint("learner state is not a dictionary".to_string()));
            };

            if let Some(ckpt) = learner.as_checkpoint_mut() {
                ckpt.restore_from_checkpoint(state)?;
            }
        }

        if let (Some(distributed), Some(state)) = (self.distributed.as_mut(), dict.get_dict("distributed")) {
            distributed.restore_from_checkpoint(state)?;
        }

        Ok(())
    }
}
