use std::{
    cell::{Cell, Ref, RefCell},
    collections::{HashMap, HashSet},
};

use crate::{
    shape::Shape,
    value::{DataType, Value},
};

use super::{
    op::{CmpOp, ConvSpec, Op, PoolSpec, PoolingKind, Reduce, ReduceAxis},
    Function, GraphError, VarKind, Variable,
};

pub(crate) struct VarData {
    pub kind: VarKind,
    pub shape: Shape,
    pub dtype: DataType,
    pub has_sequence_axis: bool,
    pub name: Option<String>,
    pub owner: Option<Function>,
    pub value: Option<RefCell<Value>>,
    pub requires_grad: bool,
    /// Wrapper outputs are distinct aliases of an inner variable.
    pub alias_of: Option<Variable>,
}

pub(crate) enum FuncKind {
    Primitive(Op),
    Composite { root: Function, opaque: bool },
    Combined(Vec<Function>),
}

pub(crate) struct FuncData {
    pub name: String,
    pub kind: FuncKind,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
}

/// Arena owning the symbolic graph. Variables and functions are cheap
/// handles into it; construction never executes anything.
#[derive(Default)]
pub struct GraphBuilder {
    vars: Vec<VarData>,
    funcs: Vec<FuncData>,
    names: HashSet<String>,
    param_generation: Cell<u64>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn var_data(&self, v: Variable) -> &VarData {
        &self.vars[v.0]
    }

    pub(crate) fn func_data(&self, f: Function) -> &FuncData {
        &self.funcs[f.0]
    }

    pub fn shape(&self, v: Variable) -> &Shape {
        &self.vars[v.0].shape
    }

    pub fn kind(&self, v: Variable) -> VarKind {
        self.vars[v.0].kind
    }

    pub fn dtype(&self, v: Variable) -> DataType {
        self.vars[v.0].dtype
    }

    pub fn var_name(&self, v: Variable) -> Option<&str> {
        self.vars[v.0].name.as_deref()
    }

    pub fn has_sequence_axis(&self, v: Variable) -> bool {
        self.vars[v.0].has_sequence_axis
    }

    /// The function that produced an `Output` variable.
    pub fn owner(&self, v: Variable) -> Option<Function> {
        self.vars[v.0].owner
    }

    pub fn requires_grad(&self, v: Variable) -> bool {
        self.vars[v.0].requires_grad
    }

    /// The value owned by a `Constant` or `Parameter`.
    pub fn value(&self, v: Variable) -> Option<Ref<'_, Value>> {
        self.vars[v.0].value.as_ref().map(RefCell::borrow)
    }

    /// Monotonic counter bumped on every parameter mutation. Backward
    /// passes use it to detect stale retained state.
    pub fn parameter_generation(&self) -> u64 {
        self.param_generation.get()
    }

    pub fn set_parameter_value(&self, v: Variable, value: Value) -> Result<(), GraphError> {
        let data = &self.vars[v.0];

        if data.kind != VarKind::Parameter {
            return Err(GraphError::WrongKind { variable: v, expected: VarKind::Parameter, got: data.kind });
        }

        if *value.shape() != data.shape {
            return Err(GraphError::ValueShapeMismatch { expected: data.shape.clone(), got: value.shape().clone() });
        }

        *data.value.as_ref().unwrap().borrow_mut() = value;
        self.param_generation.set(self.param_generation.get() + 1);

        Ok(())
    }

    /// In-place mutation of a parameter's value, as performed by learners.
    pub fn update_parameter(
        &self,
        v: Variable,
        f: impl FnOnce(&mut Value),
    ) -> Result<(), GraphError> {
        let data = &self.vars[v.0];

        if data.kind != VarKind::Parameter {
            return Err(GraphError::WrongKind { variable: v, expected: VarKind::Parameter, got: data.kind });
        }

        f(&mut data.value.as_ref().unwrap().borrow_mut());
        self.param_generation.set(self.param_generation.get() + 1);

        Ok(())
    }

    fn claim_name(&mut self, name: &str) -> Result<(), GraphError> {
        if !self.names.insert(name.to_string()) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }

        Ok(())
    }

    fn push_var(&mut self, data: VarData) -> Variable {
        let v = Variable(self.vars.len());
        self.vars.push(data);
        v
    }

    /// A batched input bound to a concrete value per evaluation.
    pub fn input(&mut self, name: &str, shape: impl Into<Shape>) -> Result<Variable, GraphError> {
        self.claim_name(name)?;

        Ok(self.push_var(VarData {
            kind: VarKind::Input,
            shape: shape.into(),
            dtype: DataType::F32,
            has_sequence_axis: false,
            name: Some(name.to_string()),
            owner: None,
            value: None,
            requires_grad: true,
            alias_of: None,
        }))
    }

    /// An input carrying a sequence axis in addition to the batch axis.
    pub fn sequence_input(&mut self, name: &str, shape: impl Into<Shape>) -> Result<Variable, GraphError> {
        let v = self.input(name, shape)?;
        self.vars[v.0].has_sequence_axis = true;
        Ok(v)
    }

    pub fn parameter(&mut self, name: &str, value: Value) -> Result<Variable, GraphError> {
        self.claim_name(name)?;

        Ok(self.push_var(VarData {
            kind: VarKind::Parameter,
            shape: value.shape().clone(),
            dtype: value.dtype(),
            has_sequence_axis: false,
            name: Some(name.to_string()),
            owner: None,
            value: Some(RefCell::new(value)),
            requires_grad: true,
            alias_of: None,
        }))
    }

    pub fn constant(&mut self, value: Value) -> Variable {
        self.push_var(VarData {
            kind: VarKind::Constant,
            shape: value.shape().clone(),
            dtype: value.dtype(),
            has_sequence_axis: false,
            name: None,
            owner: None,
            value: Some(RefCell::new(value)),
            requires_grad: false,
            alias_of: None,
        })
    }

    pub fn constant_scalar(&mut self, val: f32, device: crate::device::DeviceDescriptor) -> Variable {
        self.constant(Value::scalar(val, device))
    }

    /// An unbound variable, wired to a real source when composing.
    pub fn placeholder(&mut self, shape: impl Into<Shape>, has_sequence_axis: bool) -> Variable {
        self.push_var(VarData {
            kind: VarKind::Placeholder,
            shape: shape.into(),
            dtype: DataType::F32,
            has_sequence_axis,
            name: None,
            owner: None,
            value: None,
            requires_grad: true,
            alias_of: None,
        })
    }

    /// Applies a primitive operation. Shape inference runs first: on
    /// mismatch no output variable is ever allocated.
    pub fn apply(&mut self, op: Op, inputs: &[Variable], name: &str) -> Result<Function, GraphError> {
        assert_eq!(inputs.len(), op.arity(), "Wrong operand count for {}!", op.name());

        let shapes = inputs.iter().map(|&v| self.shape(v)).collect::<Vec<_>>();
        let out_shape = op.output_shape(&shapes)?;

        let out_seq = if op == Op::PastValue {
            let (initial, operand) = (inputs[0], inputs[1]);

            if !self.has_sequence_axis(operand) {
                return Err(GraphError::SequenceAxisRequired(operand));
            }

            if self.has_sequence_axis(initial) {
                return Err(GraphError::SequenceAxisForbidden(initial));
            }

            true
        } else {
            inputs.iter().any(|&v| self.has_sequence_axis(v))
        };

        let requires_grad = op.differentiable()
            && inputs.iter().enumerate().any(|(i, &v)| op.backprops_to(i) && self.requires_grad(v));

        let func = Function(self.funcs.len());
        let out = self.push_var(VarData {
            kind: VarKind::Output,
            shape: out_shape,
            dtype: DataType::F32,
            has_sequence_axis: out_seq,
            name: if name.is_empty() { None } else { Some(name.to_string()) },
            owner: Some(func),
            value: None,
            requires_grad,
            alias_of: None,
        });

        self.funcs.push(FuncData {
            name: if name.is_empty() { op.name() } else { name.to_string() },
            kind: FuncKind::Primitive(op),
            inputs: inputs.to_vec(),
            outputs: vec![out],
        });

        Ok(func)
    }

    fn apply_var(&mut self, op: Op, inputs: &[Variable]) -> Result<Variable, GraphError> {
        let f = self.apply(op, inputs, "")?;
        Ok(self.output(f))
    }

    pub fn plus(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Plus, &[a, b])
    }

    pub fn minus(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Minus, &[a, b])
    }

    pub fn element_times(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::ElementTimes, &[a, b])
    }

    pub fn scale(&mut self, factor: Variable, operand: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Scale, &[factor, operand])
    }

    pub fn times(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Times, &[lhs, rhs])
    }

    pub fn relu(&mut self, v: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Relu, &[v])
    }

    pub fn sigmoid(&mut self, v: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Sigmoid, &[v])
    }

    pub fn tanh(&mut self, v: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Tanh, &[v])
    }

    pub fn exp(&mut self, v: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Exp, &[v])
    }

    pub fn reduce_sum(&mut self, v: Variable, axis: ReduceAxis) -> Result<Variable, GraphError> {
        self.apply_var(Op::Reduce { reduction: Reduce::Sum, axis }, &[v])
    }

    pub fn reduce_mean(&mut self, v: Variable, axis: ReduceAxis) -> Result<Variable, GraphError> {
        self.apply_var(Op::Reduce { reduction: Reduce::Mean, axis }, &[v])
    }

    pub fn reshape(&mut self, v: Variable, shape: impl Into<Shape>) -> Result<Variable, GraphError> {
        self.apply_var(Op::Reshape(shape.into()), &[v])
    }

    pub fn select(&mut self, cond: Variable, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Select, &[cond, a, b])
    }

    pub fn less(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Compare(CmpOp::Less), &[a, b])
    }

    pub fn greater(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Compare(CmpOp::Greater), &[a, b])
    }

    pub fn equal(&mut self, a: Variable, b: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::Compare(CmpOp::Equal), &[a, b])
    }

    pub fn cross_entropy_with_softmax(
        &mut self,
        prediction: Variable,
        labels: Variable,
    ) -> Result<Variable, GraphError> {
        self.apply_var(Op::CrossEntropyWithSoftmax, &[prediction, labels])
    }

    pub fn squared_error(&mut self, prediction: Variable, target: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::SquaredError, &[prediction, target])
    }

    pub fn prediction_error(&mut self, prediction: Variable, labels: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::PredictionError, &[prediction, labels])
    }

    /// One-step delay along the sequence axis: the unrolled value at step t
    /// is `operand` at step t-1, and `initial` at t = 0.
    pub fn past_value(&mut self, initial: Variable, operand: Variable) -> Result<Variable, GraphError> {
        self.apply_var(Op::PastValue, &[initial, operand])
    }

    pub fn convolution(
        &mut self,
        kernel: Variable,
        operand: Variable,
        strides: (usize, usize),
        zero_padding: bool,
    ) -> Result<Variable, GraphError> {
        self.apply_var(Op::Convolution(ConvSpec { strides, zero_padding }), &[kernel, operand])
    }

    pub fn pooling(
        &mut self,
        operand: Variable,
        kind: PoolingKind,
        window: (usize, usize),
        strides: (usize, usize),
    ) -> Result<Variable, GraphError> {
        self.apply_var(Op::Pooling(PoolSpec { kind, window, strides }), &[operand])
    }

    pub fn inputs(&self, f: Function) -> &[Variable] {
        &self.funcs[f.0].inputs
    }

    pub fn outputs(&self, f: Function) -> &[Variable] {
        &self.funcs[f.0].outputs
    }

    /// First output, the conventional handle when composing.
    pub fn output(&self, f: Function) -> Variable {
        self.funcs[f.0].outputs[0]
    }

    pub fn func_name(&self, f: Function) -> &str {
        &self.funcs[f.0].name
    }

    pub fn is_primitive(&self, f: Function) -> bool {
        matches!(self.funcs[f.0].kind, FuncKind::Primitive(_))
    }

    /// Chases wrapper-output aliases down to the producing variable.
    pub(crate) fn resolve(&self, mut v: Variable) -> Variable {
        while let Some(inner) = self.vars[v.0].alias_of {
            v = inner;
        }

        v
    }

    /// Leaf variables feeding `f`, in discovery order.
    fn leaves(&self, f: Function, want: impl Fn(VarKind) -> bool) -> Vec<Variable> {
        let mut out = Vec::new();
        let mut seen_funcs = HashSet::new();
        let mut seen_vars = HashSet::new();

        self.walk_leaves(f, &want, &mut seen_funcs, &mut seen_vars, &mut out);
        out
    }

    fn walk_leaves(
        &self,
        f: Function,
        want: &impl Fn(VarKind) -> bool,
        seen_funcs: &mut HashSet<Function>,
        seen_vars: &mut HashSet<Variable>,
        out: &mut Vec<Variable>,
    ) {
        if !seen_funcs.insert(f) {
            return;
        }

        match &self.funcs[f.0].kind {
            FuncKind::Combined(members) => {
                for &m in members {
                    self.walk_leaves(m, want, seen_funcs, seen_vars, out);
                }
            }
            FuncKind::Composite { root, .. } => {
                self.walk_leaves(*root, want, seen_funcs, seen_vars, out);
            }
            FuncKind::Primitive(_) => {
                for &v in &self.funcs[f.0].inputs {
                    let resolved = self.resolve(v);

                    if let Some(owner) = self.vars[resolved.0].owner {
                        self.walk_leaves(owner, want, seen_funcs, seen_vars, out);
                    } else if seen_vars.insert(resolved) && want(self.vars[resolved.0].kind) {
                        out.push(resolved);
                    }
                }
            }
        }
    }

    /// Leaf inputs that require a bound value: `Input` and unwired
    /// `Placeholder` variables.
    pub fn arguments(&self, f: Function) -> Vec<Variable> {
        self.leaves(f, |k| matches!(k, VarKind::Input | VarKind::Placeholder))
    }

    pub fn parameters(&self, f: Function) -> Vec<Variable> {
        self.leaves(f, |k| k == VarKind::Parameter)
    }

    pub fn constants(&self, f: Function) -> Vec<Variable> {
        self.leaves(f, |k| k == VarKind::Constant)
    }

    pub fn named_parameters(&self, f: Function) -> Vec<(String, Variable)> {
        self.parameters(f)
            .into_iter()
            .map(|v| (self.var_name(v).unwrap_or_default().to_string(), v))
            .collect()
    }

    /// Functions visible to an external traversal. Blocks appear as single
    /// opaque nodes; plain composites and combined functions are looked
    /// through.
    pub fn visible_functions(&self, f: Function) -> Vec<Function> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.walk_visible(f, &mut seen, &mut out);
        out
    }

    fn walk_visible(&self, f: Function, seen: &mut HashSet<Function>, out: &mut Vec<Function>) {
        if !seen.insert(f) {
            return;
        }

        match &self.funcs[f.0].kind {
            FuncKind::Combined(members) => {
                for &m in members {
                    self.walk_visible(m, seen, out);
                }
            }
            FuncKind::Composite { root, opaque } => {
                if *opaque {
                    out.push(f);
                    // Traverse past the block through its external inputs.
                    for &v in self.funcs[f.0].inputs.clone().iter() {
                        if let Some(owner) = self.vars[self.resolve(v).0].owner {
                            self.walk_visible(owner, seen, out);
                        }
                    }
                } else {
                    self.walk_visible(*root, seen, out);
                }
            }
            FuncKind::Primitive(_) => {
                out.push(f);
                for &v in &self.funcs[f.0].inputs {
                    // A block's alias output keeps the block visible; any
                    // other alias resolves through.
                    let producer = self.vars[v.0].owner.or_else(|| self.vars[self.resolve(v).0].owner);

                    if let Some(owner) = producer {
                        self.walk_visible(owner, seen, out);
                    }
                }
            }
        }
    }

    /// Clones `root`'s subgraph, rewiring each placeholder key in `wiring`
    /// to its actual source. Wiring targets inside the cloned subgraph are
    /// remapped onto the clone, which is how a recurrence closes on itself.
    pub fn composite(
        &mut self,
        root: Function,
        wiring: &[(Variable, Variable)],
        name: &str,
    ) -> Result<Function, GraphError> {
        let wiring_map: HashMap<Variable, Variable> = wiring.iter().copied().collect();

        for &(ph, target) in wiring {
            if self.kind(ph) != VarKind::Placeholder {
                return Err(GraphError::NotAPlaceholder(ph));
            }

            if self.shape(ph) != self.shape(target) {
                return Err(GraphError::ShapeMismatch {
                    op: "composite".to_string(),
                    shapes: vec![self.shape(ph).clone(), self.shape(target).clone()],
                });
            }

            if self.has_sequence_axis(ph) != self.has_sequence_axis(target) {
                return Err(GraphError::SequenceAxisRequired(target));
            }
        }

        let first_new_var = self.vars.len();
        let first_new_func = self.funcs.len();

        // Collect root's subgraph: functions of any kind plus their
        // produced variables. Wiring is not traversed here: a target inside
        // the subgraph is remapped onto its clone during fixup (closing a
        // recurrence on itself), while an external target stays shared.
        let mut funcs = Vec::new();
        let mut seen_funcs = HashSet::new();
        let mut stack = vec![root];

        while let Some(f) = stack.pop() {
            if !seen_funcs.insert(f) {
                continue;
            }

            funcs.push(f);

            let feed = |v: Variable, stack: &mut Vec<Function>| {
                if let Some(owner) = self.vars[v.0].owner {
                    stack.push(owner);
                }
            };

            match &self.funcs[f.0].kind {
                FuncKind::Combined(members) => stack.extend(members.iter().copied()),
                FuncKind::Composite { root, .. } => {
                    stack.push(*root);
                    for &v in &self.funcs[f.0].inputs {
                        feed(v, &mut stack);
                    }
                }
                FuncKind::Primitive(_) => {
                    for &v in &self.funcs[f.0].inputs {
                        feed(v, &mut stack);
                    }
                }
            }
        }

        // Allocate clones: one function and one output variable per
        // original. Leaves are shared, not cloned.
        let mut func_map = HashMap::new();
        let mut var_map = HashMap::new();

        for &f in &funcs {
            let clone = Function(self.funcs.len() + func_map.len());
            func_map.insert(f, clone);

            for &out in &self.funcs[f.0].outputs.clone() {
                var_map.insert(out, Variable(first_new_var + var_map.len()));
            }
        }

        let map_var = |v: Variable, var_map: &HashMap<Variable, Variable>| -> Variable {
            let v = *wiring_map.get(&v).unwrap_or(&v);
            *var_map.get(&v).unwrap_or(&v)
        };

        // Push cloned variables in allocation order.
        let mut cloned_vars: Vec<(usize, VarData)> = Vec::new();
        for &f in &funcs {
            let clone_f = func_map[&f];

            for &out in &self.funcs[f.0].outputs {
                let data = &self.vars[out.0];
                cloned_vars.push((
                    var_map[&out].0,
                    VarData {
                        kind: data.kind,
                        shape: data.shape.clone(),
                        dtype: data.dtype,
                        has_sequence_axis: data.has_sequence_axis,
                        name: data.name.clone(),
                        owner: Some(clone_f),
                        value: None,
                        requires_grad: data.requires_grad,
                        alias_of: data.alias_of.map(|a| map_var(a, &var_map)),
                    },
                ));
            }
        }

        cloned_vars.sort_by_key(|(idx, _)| *idx);
        for (idx, data) in cloned_vars {
            debug_assert_eq!(idx, self.vars.len());
            self.vars.push(data);
        }

        // Push cloned functions with remapped edges.
        for &f in &funcs {
            let data = &self.funcs[f.0];

            let kind = match &data.kind {
                FuncKind::Primitive(op) => FuncKind::Primitive(op.clone()),
                FuncKind::Composite { root, opaque } => {
                    FuncKind::Composite { root: func_map[root], opaque: *opaque }
                }
                FuncKind::Combined(members) => {
                    FuncKind::Combined(members.iter().map(|m| func_map[m]).collect())
                }
            };

            let inputs = data.inputs.iter().map(|&v| map_var(v, &var_map)).collect();
            let outputs = data.outputs.iter().map(|&v| var_map[&v]).collect();
            let name = data.name.clone();

            debug_assert_eq!(func_map[&f].0, self.funcs.len());
            self.funcs.push(FuncData { name, kind, inputs, outputs });
        }

        let cloned_root = func_map[&root];

        // A recurrence is only legal through past_value; reject any cycle
        // that survives with the delay edges cut, rolling the arena back so
        // the failed construction leaves nothing behind.
        if self.has_delay_free_cycle(cloned_root) {
            self.vars.truncate(first_new_var);
            self.funcs.truncate(first_new_func);
            return Err(GraphError::CycleWithoutDelay);
        }

        self.finish_wrapper(FuncKind::Composite { root: cloned_root, opaque: false }, cloned_root, name)
    }

    /// Wraps a function so external traversal sees a single opaque node
    /// while its identity survives for further composition.
    pub fn block(&mut self, root: Function, name: &str) -> Result<Function, GraphError> {
        self.finish_wrapper(FuncKind::Composite { root, opaque: true }, root, name)
    }

    /// Unions the outputs of several functions into one multi-output
    /// function without altering any wiring.
    pub fn combined(&mut self, members: &[Function], name: &str) -> Result<Function, GraphError> {
        if members.is_empty() {
            return Err(GraphError::EmptyCombine);
        }

        let inner_outputs: Vec<Variable> =
            members.iter().flat_map(|&m| self.funcs[m.0].outputs.clone()).collect();

        self.push_wrapper(FuncKind::Combined(members.to_vec()), inner_outputs, name)
    }

    fn finish_wrapper(
        &mut self,
        kind: FuncKind,
        root: Function,
        name: &str,
    ) -> Result<Function, GraphError> {
        let inner_outputs = self.funcs[root.0].outputs.clone();
        self.push_wrapper(kind, inner_outputs, name)
    }

    fn push_wrapper(
        &mut self,
        kind: FuncKind,
        inner_outputs: Vec<Variable>,
        name: &str,
    ) -> Result<Function, GraphError> {
        let func = Function(self.funcs.len());

        // Probe the wrapper's leaves through a temporary record, then fill
        // in the alias outputs.
        self.funcs.push(FuncData { name: name.to_string(), kind, inputs: Vec::new(), outputs: Vec::new() });

        let inputs = self.leaves(func, |k| {
            matches!(k, VarKind::Input | VarKind::Placeholder | VarKind::Parameter | VarKind::Constant)
        });

        let outputs = inner_outputs
            .iter()
            .map(|&inner| {
                let data = &self.vars[inner.0];
                let alias = VarData {
                    kind: VarKind::Output,
                    shape: data.shape.clone(),
                    dtype: data.dtype,
                    has_sequence_axis: data.has_sequence_axis,
                    name: data.name.clone(),
                    owner: Some(func),
                    value: None,
                    requires_grad: data.requires_grad,
                    alias_of: Some(inner),
                };
                self.push_var(alias)
            })
            .collect();

        self.funcs[func.0].inputs = inputs;
        self.funcs[func.0].outputs = outputs;

        Ok(func)
    }

    /// Detects cycles that do not pass through the delayed operand edge of
    /// a `past_value`.
    fn has_delay_free_cycle(&self, root: Function) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(graph: &GraphBuilder, f: Function, marks: &mut HashMap<usize, Mark>) -> bool {
            match marks.get(&f.0) {
                Some(Mark::Done) => return false,
                Some(Mark::Visiting) => return true,
                None => {}
            }

            marks.insert(f.0, Mark::Visiting);

            let data = &graph.funcs[f.0];

            let cyclic = match &data.kind {
                FuncKind::Combined(members) => members.iter().any(|&m| visit(graph, m, marks)),
                FuncKind::Composite { root, .. } => visit(graph, *root, marks),
                FuncKind::Primitive(op) => {
                    let delayed = matches!(op, Op::PastValue);

                    data.inputs.iter().enumerate().any(|(i, &v)| {
                        if delayed && i == 1 {
                            return false;
                        }

                        match graph.vars[graph.resolve(v).0].owner {
                            Some(owner) => visit(graph, owner, marks),
                            None => false,
                        }
                    })
                }
            };

            marks.insert(f.0, Mark::Done);
            cyclic
        }

        let mut marks = HashMap::new();
        visit(self, root, &mut marks)
    }
}
