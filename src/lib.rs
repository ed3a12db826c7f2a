//! A symbolic, graph-based neural-network computation and training
//! library: composable differentiable functions over symbolic variables,
//! a forward/backward execution engine with recurrence unrolling, and a
//! training loop with pluggable learners and distributed hooks.

/// Reference CPU kernels backing the execution engine.
pub mod cpu;
/// Device descriptors and the process-wide default device.
pub mod device;
/// The checkpoint dictionary: a closed set of serializable value kinds.
pub mod dictionary;
/// Distributed-training hooks and collective operations.
pub mod distributed;
/// Forward and backward execution of function graphs.
pub mod engine;
/// Symbolic graph construction: variables, functions, composition.
pub mod graph;
/// Pluggable parameter-update algorithms.
pub mod learner;
/// Static tensor shapes.
pub mod shape;
/// The `Trainer` and its minibatch/control collaborators.
pub mod trainer;
/// Concrete tensor values.
pub mod value;

pub use device::{set_default_device, DeviceDescriptor};
pub use dictionary::{DictValue, Dictionary};
pub use engine::{backward, forward, BackPropState, Binding, EvalError, EvalOptions, OutputMap, ValueMap};
pub use graph::{Function, GraphBuilder, GraphError, PoolingKind, ReduceAxis, VarKind, Variable};
pub use learner::{AdaGradLearner, Learner, LearnerCheckpoint, RmsPropLearner, SgdLearner};
pub use shape::Shape;
pub use trainer::{BasicTrainingControl, InMemorySource, MinibatchSource, Trainer, TrainingControl};
pub use value::{DataType, StorageKind, Value};
