//! The execution engine: topological forward evaluation of a function
//! graph over concrete values, and reverse-mode backward evaluation
//! bridged by a [`BackPropState`].

mod bwd;
mod fwd;
mod plan;
pub(crate) mod util;

use std::collections::HashMap;

use plan::{Plan, PlanStep};

use crate::{
    device::{default_device, DeviceDescriptor},
    graph::{Function, GraphBuilder, GraphError, Op, VarKind, Variable},
    shape::Shape,
    value::{Value, ValueError},
};

/// A concrete value bound to (or produced for) a variable. Variables with a
/// sequence axis bind a time-major list of per-step values; everything else
/// binds a single, possibly batched, value.
#[derive(Clone, Debug)]
pub enum Binding {
    Batch(Value),
    Steps(Vec<Value>),
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Batch(value)
    }
}

impl Binding {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Binding::Batch(v) => Some(v),
            Binding::Steps(_) => None,
        }
    }

    pub fn as_steps(&self) -> Option<&[Value]> {
        match self {
            Binding::Steps(s) => Some(s),
            Binding::Batch(_) => None,
        }
    }
}

pub type ValueMap = HashMap<Variable, Binding>;

/// Requested variables mapped to optional caller-supplied storage. `None`
/// entries are allocated by the engine; `Some` entries are written (forward)
/// or accumulated into (backward).
pub type OutputMap = HashMap<Variable, Option<Binding>>;

#[derive(Debug)]
pub enum EvalError {
    ShapeMismatch { expected: Shape, got: Shape },
    MissingInput(Variable),
    /// The retained state no longer matches the graph, typically because a
    /// parameter was updated between forward and backward.
    InvalidState,
    UnsupportedGradient(Variable),
    DeviceUnavailable(DeviceDescriptor),
    SequenceLengthMismatch { expected: usize, got: usize },
    BatchSizeMismatch { expected: usize, got: usize },
    /// The binding form does not match the variable's dynamic axes.
    SequenceBindingMismatch(Variable),
    Value(ValueError),
    Graph(GraphError),
}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        match value {
            ValueError::ShapeMismatch { expected, got } => EvalError::ShapeMismatch { expected, got },
            other => EvalError::Value(other),
        }
    }
}

impl From<GraphError> for EvalError {
    fn from(value: GraphError) -> Self {
        EvalError::Graph(value)
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::ShapeMismatch { expected, got } => {
                write!(f, "value shape [{got}] does not match expected [{expected}]")
            }
            EvalError::MissingInput(v) => write!(f, "no value bound for required input {v:?}"),
            EvalError::InvalidState => write!(f, "retained backprop state is no longer valid"),
            EvalError::UnsupportedGradient(v) => write!(f, "{v:?} is not eligible for gradients"),
            EvalError::DeviceUnavailable(d) => write!(f, "device {d} cannot execute this computation"),
            EvalError::SequenceLengthMismatch { expected, got } => {
                write!(f, "sequence of length {got} where {expected} was expected")
            }
            EvalError::BatchSizeMismatch { expected, got } => {
                write!(f, "batch of size {got} where {expected} was expected")
            }
            EvalError::SequenceBindingMismatch(v) => {
                write!(f, "binding form for {v:?} does not match its dynamic axes")
            }
            EvalError::Value(e) => write!(f, "value error: {e:?}"),
            EvalError::Graph(e) => write!(f, "graph error: {e}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EvalOptions {
    /// Overrides the process-wide default device for this call.
    pub device: Option<DeviceDescriptor>,
    /// Retain the values each primitive declares required for backward,
    /// bundled into a [`BackPropState`].
    pub retain_state: bool,
}

impl EvalOptions {
    pub fn retaining() -> Self {
        Self { retain_state: true, ..Self::default() }
    }
}

/// Bridges one forward invocation to its backward invocations: the expanded
/// schedule, the values retained for gradient rules, and references to the
/// invocation's inputs and outputs. The caller must keep referenced values
/// alive and unchanged until backward completes; parameter updates in
/// between invalidate the state.
#[derive(Debug)]
pub struct BackPropState {
    function: Function,
    device: DeviceDescriptor,
    plan: Plan,
    seq_len: usize,
    generation: u64,
    retained: HashMap<(Variable, usize), Value>,
    val_batch: HashMap<Variable, Option<usize>>,
    inputs: ValueMap,
    outputs: ValueMap,
}

impl BackPropState {
    pub fn function(&self) -> Function {
        self.function
    }

    pub fn device(&self) -> DeviceDescriptor {
        self.device
    }

    /// The outputs computed by the forward invocation this state belongs to.
    pub fn outputs(&self) -> &ValueMap {
        &self.outputs
    }

    fn var_batch(&self, graph: &GraphBuilder, v: Variable) -> Option<usize> {
        match graph.kind(v) {
            VarKind::Output => self.val_batch.get(&v).copied().flatten(),
            VarKind::Constant | VarKind::Parameter => None,
            VarKind::Input | VarKind::Placeholder => match self.inputs.get(&v) {
                Some(Binding::Batch(val)) => val.batch_size(),
                Some(Binding::Steps(steps)) => steps.first().and_then(Value::batch_size),
                None => None,
            },
        }
    }
}

fn time_index(graph: &GraphBuilder, v: Variable, t: usize) -> usize {
    if graph.has_sequence_axis(v) {
        t
    } else {
        0
    }
}

struct ForwardPass<'a> {
    graph: &'a GraphBuilder,
    arguments: &'a ValueMap,
    device: DeviceDescriptor,
    batch: Option<usize>,
    seq_len: usize,
    vals: HashMap<(Variable, usize), Value>,
    retained: HashMap<(Variable, usize), Value>,
    val_batch: HashMap<Variable, Option<usize>>,
}

impl ForwardPass<'_> {
    fn fetch(&self, v: Variable, t: usize) -> Result<Value, EvalError> {
        match self.graph.kind(v) {
            VarKind::Constant | VarKind::Parameter => Ok(self.graph.value(v).unwrap().view()),
            VarKind::Input | VarKind::Placeholder => match self.arguments.get(&v) {
                Some(Binding::Batch(val)) => Ok(val.view()),
                Some(Binding::Steps(steps)) => Ok(steps[t].view()),
                None => Err(EvalError::MissingInput(v)),
            },
            VarKind::Output => {
                let key = (v, time_index(self.graph, v, t));
                Ok(self.vals[&key].clone())
            }
        }
    }

    fn exec_step(&mut self, step: &PlanStep, t: usize, retain: bool) -> Result<(), EvalError> {
        let out_val = if step.op == Op::PastValue {
            if t == 0 {
                let init = self.fetch(step.inputs[0], 0)?;
                let out_shape = self.graph.shape(step.output);
                let nbatch = self.batch.unwrap_or(1);
                let expanded = util::expand(&init, out_shape.size(), nbatch)?;
                Value::from_slice(out_shape.clone(), self.batch, &expanded, self.device)?
            } else {
                self.fetch(step.inputs[1], t - 1)?
            }
        } else {
            let fetched = step
                .inputs
                .iter()
                .map(|&v| self.fetch(v, t))
                .collect::<Result<Vec<_>, _>>()?;

            if retain {
                for (i, val) in fetched.iter().enumerate() {
                    if step.op.requires_input_for_backward(i) {
                        let key = (step.inputs[i], time_index(self.graph, step.inputs[i], t));
                        self.retained.entry(key).or_insert_with(|| val.view());
                    }
                }
            }

            let refs = fetched.iter().collect::<Vec<_>>();
            fwd::execute(&step.op, &refs, self.graph.shape(step.output), self.device)?
        };

        if retain && step.op.requires_output_for_backward() {
            self.retained.insert((step.output, t), out_val.view());
        }

        self.val_batch.insert(step.output, out_val.batch_size());
        self.vals.insert((step.output, time_index(self.graph, step.output, t)), out_val);

        Ok(())
    }

    fn collect(&self, v: Variable) -> Result<Binding, EvalError> {
        if self.graph.has_sequence_axis(v) {
            let steps = (0..self.seq_len).map(|t| self.fetch(v, t)).collect::<Result<Vec<_>, _>>()?;
            Ok(Binding::Steps(steps))
        } else {
            Ok(Binding::Batch(self.fetch(v, 0)?))
        }
    }
}

/// Evaluates `function` forward: resolves the primitive graph, walks it in
/// topological order, unrolls recurrences along the bound sequence length,
/// and fills `outputs` with a value per requested variable. Caller-supplied
/// output storage is written in place. With `retain_state`, returns the
/// [`BackPropState`] bridging to backward.
pub fn forward(
    graph: &GraphBuilder,
    function: Function,
    arguments: &ValueMap,
    outputs: &mut OutputMap,
    opts: EvalOptions,
) -> Result<Option<BackPropState>, EvalError> {
    let device = opts.device.unwrap_or_else(default_device);

    if device != DeviceDescriptor::Cpu {
        return Err(EvalError::DeviceUnavailable(device));
    }

    let mut targets: Vec<Variable> = outputs.keys().copied().collect();

    // Retained state references the invocation's declared outputs, so they
    // are computed alongside whatever the caller asked for.
    if opts.retain_state {
        for &out in graph.outputs(function) {
            if !targets.contains(&out) {
                targets.push(out);
            }
        }
    }

    let plan = plan::build_plan(graph, &targets)?;

    // Validate every binding up front: structural errors surface before any
    // computation runs.
    let mut batch: Option<usize> = None;
    let mut seq_len: Option<usize> = None;

    let merge_batch = |current: &mut Option<usize>, candidate: Option<usize>| -> Result<(), EvalError> {
        if let Some(b) = candidate {
            match current {
                None => *current = Some(b),
                Some(existing) if *existing == b => {}
                Some(existing) => return Err(EvalError::BatchSizeMismatch { expected: *existing, got: b }),
            }
        }
        Ok(())
    };

    let check_shape = |v: Variable, val: &Value| -> Result<(), EvalError> {
        if val.shape() != graph.shape(v) {
            return Err(EvalError::ShapeMismatch { expected: graph.shape(v).clone(), got: val.shape().clone() });
        }
        Ok(())
    };

    for &leaf in &plan.leaves {
        let binding = arguments.get(&leaf).ok_or(EvalError::MissingInput(leaf))?;

        match (graph.has_sequence_axis(leaf), binding) {
            (false, Binding::Batch(val)) => {
                check_shape(leaf, val)?;
                merge_batch(&mut batch, val.batch_size())?;
            }
            (true, Binding::Steps(steps)) => {
                if steps.is_empty() {
                    return Err(EvalError::SequenceLengthMismatch { expected: 1, got: 0 });
                }

                match seq_len {
                    None => seq_len = Some(steps.len()),
                    Some(t) if t == steps.len() => {}
                    Some(t) => {
                        return Err(EvalError::SequenceLengthMismatch { expected: t, got: steps.len() })
                    }
                }

                for val in steps {
                    check_shape(leaf, val)?;
                    merge_batch(&mut batch, val.batch_size())?;
                }
            }
            _ => return Err(EvalError::SequenceBindingMismatch(leaf)),
        }
    }

    let seq_len = seq_len.unwrap_or(1);

    let mut pass = ForwardPass {
        graph,
        arguments,
        device,
        batch,
        seq_len,
        vals: HashMap::new(),
        retained: HashMap::new(),
        val_batch: HashMap::new(),
    };

    for step in &plan.static_steps {
        pass.exec_step(step, 0, opts.retain_state)?;
    }

    for t in 0..seq_len {
        for step in &plan.seq_steps {
            pass.exec_step(step, t, opts.retain_state)?;
        }
    }

    for (&requested, slot) in outputs.iter_mut() {
        let computed = pass.collect(graph.resolve(requested))?;

        match slot {
            Some(storage) => write_into(requested, storage, &computed)?,
            None => *slot = Some(computed),
        }
    }

    if !opts.retain_state {
        return Ok(None);
    }

    let mut state_outputs = ValueMap::new();
    for &out in graph.outputs(function) {
        state_outputs.insert(out, pass.collect(graph.resolve(out))?);
    }

    Ok(Some(BackPropState {
        function,
        device,
        plan,
        seq_len,
        generation: graph.parameter_generation(),
        retained: pass.retained,
        val_batch: pass.val_batch,
        inputs: arguments.clone(),
        outputs: state_outputs,
    }))
}

fn write_into(variable: Variable, storage: &mut Binding, computed: &Binding) -> Result<(), EvalError> {
    match (storage, computed) {
        (Binding::Batch(dst), Binding::Batch(src)) => {
            dst.copy_from(src)?;
            Ok(())
        }
        (Binding::Steps(dst), Binding::Steps(src)) => {
            if dst.len() != src.len() {
                return Err(EvalError::SequenceLengthMismatch { expected: src.len(), got: dst.len() });
            }

            for (d, s) in dst.iter_mut().zip(src) {
                d.copy_from(s)?;
            }

            Ok(())
        }
        (Binding::Batch(_), Binding::Steps(_)) | (Binding::Steps(_), Binding::Batch(_)) => {
            Err(EvalError::SequenceBindingMismatch(variable))
        }
    }
}

/// Propagates `root_gradients` backwards through the retained schedule,
/// producing a gradient per requested input. Gradients fan in additively:
/// a variable consumed by several functions receives the sum of their
/// contributions, and unrolled recurrences thread gradient from step t to
/// step t-1. Caller-supplied gradient storage is accumulated into rather
/// than overwritten. Repeated calls with the same state and roots yield
/// identical results.
pub fn backward(
    graph: &GraphBuilder,
    state: &BackPropState,
    root_gradients: &ValueMap,
    input_gradients: &mut OutputMap,
) -> Result<(), EvalError> {
    if state.generation != graph.parameter_generation() {
        return Err(EvalError::InvalidState);
    }

    for &requested in input_gradients.keys() {
        let r = graph.resolve(requested);
        if !graph.requires_grad(r) {
            return Err(EvalError::UnsupportedGradient(requested));
        }
    }

    let mut grads: HashMap<(Variable, usize), Value> = HashMap::new();

    let zero_layout = |v: Variable| -> Value {
        Value::zeroed_batched(graph.shape(v).clone(), state.var_batch(graph, v), state.device)
    };

    // Seed the roots, expanding or folding the supplied gradient into each
    // variable's forward layout.
    let seed = |grads: &mut HashMap<(Variable, usize), Value>,
                v: Variable,
                t: usize,
                val: &Value|
     -> Result<(), EvalError> {
        if val.shape() != graph.shape(v) && !val.shape().is_scalar_like() {
            return Err(EvalError::ShapeMismatch {
                expected: graph.shape(v).clone(),
                got: val.shape().clone(),
            });
        }

        if graph.kind(v) == VarKind::Output && !state.val_batch.contains_key(&v) {
            return Err(EvalError::UnsupportedGradient(v));
        }

        let entry = grads.entry((v, t)).or_insert_with(|| zero_layout(v));

        if let (Some(got), None) = (val.batch_size(), entry.batch_size()) {
            return Err(EvalError::BatchSizeMismatch { expected: 1, got });
        }

        let nbatch = entry.batch_size().unwrap_or(1);
        let expanded = util::expand(val, entry.single_size(), nbatch)?;
        util::reduce_into(&expanded, entry.single_size(), nbatch, entry)?;

        Ok(())
    };

    for (&v, binding) in root_gradients {
        let r = graph.resolve(v);

        match (graph.has_sequence_axis(r), binding) {
            (false, Binding::Batch(val)) => seed(&mut grads, r, 0, val)?,
            (true, Binding::Steps(steps)) => {
                if steps.len() != state.seq_len {
                    return Err(EvalError::SequenceLengthMismatch {
                        expected: state.seq_len,
                        got: steps.len(),
                    });
                }

                for (t, val) in steps.iter().enumerate() {
                    seed(&mut grads, r, t, val)?;
                }
            }
            _ => return Err(EvalError::SequenceBindingMismatch(v)),
        }
    }

    // Reverse topological walk, reverse time order first so recurrent
    // gradients thread from step t into step t-1.
    for t in (0..state.seq_len).rev() {
        for step in state.plan.seq_steps.iter().rev() {
            step_backward(graph, state, step, t, &mut grads, &zero_layout)?;
        }
    }

    for step in state.plan.static_steps.iter().rev() {
        step_backward(graph, state, step, 0, &mut grads, &zero_layout)?;
    }

    for (&requested, slot) in input_gradients.iter_mut() {
        let r = graph.resolve(requested);

        let computed = if graph.has_sequence_axis(r) {
            let steps = (0..state.seq_len)
                .map(|t| grads.get(&(r, t)).cloned().unwrap_or_else(|| zero_layout(r)))
                .collect();
            Binding::Steps(steps)
        } else {
            Binding::Batch(grads.get(&(r, 0)).cloned().unwrap_or_else(|| zero_layout(r)))
        };

        match slot {
            Some(storage) => accumulate_into(requested, storage, &computed)?,
            None => *slot = Some(computed),
        }
    }

    Ok(())
}

fn accumulate_into(variable: Variable, storage: &mut Binding, computed: &Binding) -> Result<(), EvalError> {
    match (storage, computed) {
        (Binding::Batch(dst), Binding::Batch(src)) => {
            if dst.shape() != src.shape() {
                return Err(EvalError::ShapeMismatch {
                    expected: src.shape().clone(),
                    got: dst.shape().clone(),
                });
            }

            util::add_assign_value(dst, src)
        }
        (Binding::Steps(dst), Binding::Steps(src)) => {
            if dst.len() != src.len() {
                return Err(EvalError::SequenceLengthMismatch { expected: src.len(), got: dst.len() });
            }

            for (d, s) in dst.iter_mut().zip(src) {
                util::add_assign_value(d, s)?;
            }

            Ok(())
        }
        (Binding::Batch(_), Binding::Steps(_)) | (Binding::Steps(_), Binding::Batch(_)) => {
            Err(EvalError::SequenceBindingMismatch(variable))
        }
    }
}

fn step_backward(
    graph: &GraphBuilder,
    state: &BackPropState,
    step: &PlanStep,
    t: usize,
    grads: &mut HashMap<(Variable, usize), Value>,
    zero_layout: &impl Fn(Variable) -> Value,
) -> Result<(), EvalError> {
    let Some(dout) = grads.get(&(step.output, t)).cloned() else {
        return Ok(());
    };

    if !step.op.differentiable() {
        return Ok(());
    }

    if step.op == Op::PastValue {
        let (initial, operand) = (step.inputs[0], step.inputs[1]);

        let (target, target_t) = if t == 0 { (initial, 0) } else { (operand, t - 1) };
        if !graph.requires_grad(target) {
            return Ok(());
        }

        let entry = grads.entry((target, target_t)).or_insert_with(|| zero_layout(target));
        let nbatch = dout.batch_size().unwrap_or(1);
        let expanded = util::expand_raw(dout.dense()?, dout.single_size(), dout.batch_size(), nbatch);
        util::reduce_into(&expanded, dout.single_size(), nbatch, entry)?;

        return Ok(());
    }

    let input_meta = step
        .inputs
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let wants = step.op.backprops_to(i) && graph.requires_grad(v);
            (graph.shape(v).clone(), state.var_batch(graph, v), wants)
        })
        .collect::<Vec<_>>();

    if input_meta.iter().all(|(_, _, wants)| !wants) {
        return Ok(());
    }

    let retained_inputs = step
        .inputs
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if step.op.requires_input_for_backward(i) {
                state.retained.get(&(v, time_index(graph, v, t)))
            } else {
                None
            }
        })
        .collect::<Vec<_>>();

    let ctx = bwd::BwdCtx {
        op: &step.op,
        dout: &dout,
        inputs: retained_inputs,
        output: state.retained.get(&(step.output, t)),
        input_meta,
        device: state.device,
    };

    let contributions = bwd::execute(&ctx)?;

    for (i, contribution) in contributions.into_iter().enumerate() {
        let Some(contribution) = contribution else {
            continue;
        };

        let v = step.inputs[i];
        let key = (v, time_index(graph, v, t));
        let entry = grads.entry(key).or_insert_with(|| zero_layout(v));
        util::add_assign_value(entry, &contribution)?;
    }

    Ok(())
}
