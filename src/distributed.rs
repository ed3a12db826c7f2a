//! Distributed-training hooks: worker descriptors, collective operations
//! scoped to a destination subset, and the data-parallel gradient exchange.

pub mod local;

pub use local::LocalCommunicator;

use std::collections::HashMap;

use crate::{
    dictionary::Dictionary,
    graph::{GraphBuilder, Variable},
    value::{Value, ValueError},
};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerDescriptor {
    pub global_rank: usize,
    pub host_id: String,
}

#[derive(Debug)]
pub enum DistributedError {
    /// A peer worker dropped out of the collective.
    Disconnected,
    /// The calling worker is not part of the addressed group.
    NotAMember(usize),
    /// Participants disagreed on the collective's value layout.
    MismatchedContributions,
    Value(ValueError),
}

impl From<ValueError> for DistributedError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Collective communication among a fixed worker set. Inputs are read-only
/// for the duration of a collective; results are delivered only to the
/// workers in `send_to` — every other worker receives `None`, an explicit
/// absent result rather than a zero or stale value.
pub trait Communicator: Send {
    fn workers(&self) -> Vec<WorkerDescriptor>;

    fn this_worker(&self) -> WorkerDescriptor;

    /// A new communicator over a subset of this one's workers. Every member
    /// of the subset must call this with the same subset to obtain its own
    /// handle on the group.
    fn sub_group(&self, workers: &[WorkerDescriptor]) -> Result<Box<dyn Communicator>, DistributedError>;

    /// Concatenates each worker's value in rank order, flattened.
    fn concatenate(
        &mut self,
        value: &Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError>;

    /// Elementwise sum across workers.
    fn aggregate(
        &mut self,
        value: &Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError>;

    /// Sign-quantized aggregation carrying per-worker quantization residues
    /// forward, so quantization error is fed back rather than lost.
    fn quantized_aggregate(
        &mut self,
        value: &Value,
        residue: &mut Value,
        send_to: &[WorkerDescriptor],
    ) -> Result<Option<Value>, DistributedError>;
}

/// Hook invoked by the trainer around parameter updates.
pub trait DistributedTrain {
    /// Called after gradient computation and before any learner update;
    /// the gradient exchange point.
    fn pre_parameter_update(
        &mut self,
        graph: &GraphBuilder,
        gradients: &mut HashMap<Variable, Value>,
        sample_count: usize,
    ) -> Result<(), DistributedError>;

    /// Called once per minibatch before evaluation.
    fn per_minibatch(&mut self, _sample_count: usize) -> Result<(), DistributedError> {
        Ok(())
    }

    fn checkpoint(&self) -> Option<Dictionary> {
        None
    }

    fn restore_from_checkpoint(&mut self, _checkpoint: &Dictionary) -> Result<(), DistributedError> {
        Ok(())
    }
}

/// Data-parallel training: gradients are summed across all workers before
/// each update, optionally with sign quantization and residue feedback.
pub struct DataParallel {
    communicator: Box<dyn Communicator>,
    quantized: bool,
    residues: HashMap<Variable, Value>,
}

impl DataParallel {
    pub fn new(communicator: Box<dyn Communicator>, quantized: bool) -> Self {
        Self { communicator, quantized, residues: HashMap::new() }
    }

    pub fn communicator(&self) -> &dyn Communicator {
        self.communicator.as_ref()
    }
}

impl DistributedTrain for DataParallel {
    fn pre_parameter_update(
        &mut self,
        graph: &GraphBuilder,
        gradients: &mut HashMap<Variable, Value>,
        _sample_count: usize,
    ) -> Result<(), DistributedError> {
        let everyone = self.communicator.workers();

        // Exchange in a deterministic order so all workers line up on the
        // same sequence of collectives.
        let mut params = gradients.keys().copied().collect::<Vec<_>>();
        params.sort_by_key(|v| graph.var_name(*v).map(str::to_string));

        for param in params {
            let grad = gradients.get(&param).unwrap().clone();

            let aggregated = if self.quantized {
                let residue = self
                    .residues
                    .entry(param)
                    .or_insert_with(|| Value::zeroed_batched(grad.shape().clone(), grad.batch_size(), grad.device()));

                self.communicator.quantized_aggregate(&grad, residue, &everyone)?
            } else {
                self.communicator.aggregate(&grad, &everyone)?
            };

            // Every worker is a destination here, so an absent result means
            // the group broke underneath us.
            let aggregated = aggregated.ok_or(DistributedError::Disconnected)?;
            gradients.insert(param, aggregated);
        }

        Ok(())
    }

    fn checkpoint(&self) -> Option<Dictionary> {
        let mut dict = Dictionary::new();
        dict.insert("type", "data_parallel");
        dict.insert("quantized", self.quantized);
        Some(dict)
    }
}
