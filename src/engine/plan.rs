//! Lowering of a function graph into a flat primitive schedule.

use std::collections::HashSet;

use crate::graph::{builder::FuncKind, GraphBuilder, GraphError, Op, VarKind, Variable};

use super::EvalError;

#[derive(Debug)]
pub(crate) struct PlanStep {
    pub op: Op,
    pub inputs: Vec<Variable>,
    pub output: Variable,
    pub seq: bool,
}

/// The expanded primitive graph behind one forward invocation. Composite
/// and block wrappers are resolved away; `past_value` operand edges are
/// excluded from ordering since they reference the previous unrolled step.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Steps free of any sequence axis, evaluated once.
    pub static_steps: Vec<PlanStep>,
    /// Steps evaluated per unrolled time step.
    pub seq_steps: Vec<PlanStep>,
    /// `Input` and `Placeholder` leaves that require bindings.
    pub leaves: Vec<Variable>,
    /// Resolved variables the caller asked for.
    pub targets: Vec<Variable>,
}

enum Mark {
    Visiting,
    Done,
}

pub(crate) fn build_plan(graph: &GraphBuilder, targets: &[Variable]) -> Result<Plan, EvalError> {
    let mut plan = Plan {
        static_steps: Vec::new(),
        seq_steps: Vec::new(),
        leaves: Vec::new(),
        targets: targets.iter().map(|&v| graph.resolve(v)).collect(),
    };

    let mut marks = std::collections::HashMap::new();
    let mut seen_leaves = HashSet::new();
    // Producers reachable only through delay edges still need scheduling,
    // but impose no within-step ordering.
    let mut delayed = Vec::new();

    for &target in plan.targets.clone().iter() {
        visit(graph, target, &mut marks, &mut seen_leaves, &mut delayed, &mut plan)?;
    }

    while let Some(v) = delayed.pop() {
        visit(graph, v, &mut marks, &mut seen_leaves, &mut delayed, &mut plan)?;
    }

    Ok(plan)
}

fn visit(
    graph: &GraphBuilder,
    v: Variable,
    marks: &mut std::collections::HashMap<Variable, Mark>,
    seen_leaves: &mut HashSet<Variable>,
    delayed: &mut Vec<Variable>,
    plan: &mut Plan,
) -> Result<(), EvalError> {
    let v = graph.resolve(v);

    match marks.get(&v) {
        Some(Mark::Done) => return Ok(()),
        // A cycle survived to execution; construction should have caught
        // it, but a malformed graph must not hang the engine.
        Some(Mark::Visiting) => return Err(EvalError::Graph(GraphError::CycleWithoutDelay)),
        None => {}
    }

    match graph.kind(v) {
        VarKind::Constant | VarKind::Parameter => return Ok(()),
        VarKind::Input | VarKind::Placeholder => {
            if seen_leaves.insert(v) {
                plan.leaves.push(v);
            }
            return Ok(());
        }
        VarKind::Output => {}
    }

    marks.insert(v, Mark::Visiting);

    let owner = graph.owner(v).expect("resolved output variables always have an owner");
    let FuncKind::Primitive(op) = &graph.func_data(owner).kind else {
        unreachable!("resolution ends at a primitive producer");
    };

    let inputs = graph.inputs(owner).iter().map(|&i| graph.resolve(i)).collect::<Vec<_>>();
    let is_delay = matches!(op, Op::PastValue);

    for (i, &input) in inputs.iter().enumerate() {
        if is_delay && i == 1 {
            delayed.push(input);
        } else {
            visit(graph, input, marks, seen_leaves, delayed, plan)?;
        }
    }

    let step = PlanStep { op: op.clone(), inputs, output: v, seq: graph.has_sequence_axis(v) };

    if step.seq {
        plan.seq_steps.push(step);
    } else {
        plan.static_steps.push(step);
    }

    marks.insert(v, Mark::Done);

    Ok(())
}
