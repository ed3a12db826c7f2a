use crate::shape::Shape;

pub use crate::cpu::base::CmpOp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    Sum,
    Mean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceAxis {
    /// Collapse the static shape to a scalar, one result per sample.
    Elements,
    /// Collapse the batch axis, preserving the static shape.
    Batch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvSpec {
    pub strides: (usize, usize),
    pub zero_padding: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolingKind {
    Max,
    Average,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSpec {
    pub kind: PoolingKind,
    pub window: (usize, usize),
    pub strides: (usize, usize),
}

/// A primitive operation. Operands are the owning function's ordered
/// inputs; the variants only carry operation-specific attributes.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Plus,
    Minus,
    ElementTimes,
    /// `(scalar, operand)`
    Scale,
    /// Matrix product `(lhs, rhs)`.
    Times,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Reduce { reduction: Reduce, axis: ReduceAxis },
    Reshape(Shape),
    /// `(condition, then, else)` elementwise select.
    Select,
    Compare(CmpOp),
    /// `(prediction, labels)`, per-sample scalar loss.
    CrossEntropyWithSoftmax,
    /// `(prediction, target)`, per-sample scalar loss.
    SquaredError,
    /// `(prediction, labels)`, 1.0 when the argmaxes disagree.
    PredictionError,
    /// `(initial, operand)`: one-step delay along the sequence axis.
    PastValue,
    /// `(kernel, operand)`
    Convolution(ConvSpec),
    /// `(operand)`
    Pooling(PoolSpec),
}

impl Op {
    pub fn name(&self) -> String {
        let dbg = format!("{self:?}");
        dbg.split(|c| c == '(' || c == ' ').next().unwrap().to_string()
    }

    fn mismatch(&self, shapes: &[&Shape]) -> crate::graph::GraphError {
        crate::graph::GraphError::ShapeMismatch {
            op: self.name(),
            shapes: shapes.iter().map(|&s| s.clone()).collect(),
        }
    }

    /// The operation-specific shape-inference rule. Fails before any output
    /// node exists, so structural errors never survive into execution.
    pub fn output_shape(&self, inputs: &[&Shape]) -> Result<Shape, crate::graph::GraphError> {
        let same_or_scalar = |a: &Shape, b: &Shape| -> Option<Shape> {
            if a == b {
                Some(a.clone())
            } else if a.is_scalar_like() {
                Some(b.clone())
            } else if b.is_scalar_like() {
                Some(a.clone())
            } else {
                None
            }
        };

        match self {
            Op::Plus | Op::Minus | Op::ElementTimes => {
                same_or_scalar(inputs[0], inputs[1]).ok_or_else(|| self.mismatch(inputs))
            }
            Op::Scale => {
                if inputs[0].is_scalar_like() {
                    Ok(inputs[1].clone())
                } else {
                    Err(self.mismatch(inputs))
                }
            }
            Op::Times => inputs[0].matmul(inputs[1]).ok_or_else(|| self.mismatch(inputs)),
            Op::Relu | Op::Sigmoid | Op::Tanh | Op::Exp => Ok(inputs[0].clone()),
            Op::Reduce { axis, .. } => match axis {
                ReduceAxis::Elements => Ok(Shape::scalar()),
                ReduceAxis::Batch => Ok(inputs[0].clone()),
            },
            Op::Reshape(new_shape) => {
                if inputs[0].reshapeable_to(new_shape) {
                    Ok(new_shape.clone())
                } else {
                    Err(self.mismatch(inputs))
                }
            }
            Op::Select => {
                let branches = same_or_scalar(inputs[1], inputs[2]).ok_or_else(|| self.mismatch(inputs))?;
                same_or_scalar(inputs[0], &branches)
                    .filter(|s| *s == branches)
                    .ok_or_else(|| self.mismatch(inputs))
            }
            Op::Compare(_) => same_or_scalar(inputs[0], inputs[1]).ok_or_else(|| self.mismatch(inputs)),
            Op::CrossEntropyWithSoftmax | Op::SquaredError | Op::PredictionError => {
                if inputs[0] == inputs[1] {
                    Ok(Shape::scalar())
                } else {
                    Err(self.mismatch(inputs))
                }
            }
            Op::PastValue => {
                if inputs[0] == inputs[1] || inputs[0].is_scalar_like() {
                    Ok(inputs[1].clone())
                } else {
                    Err(self.mismatch(inputs))
                }
            }
            Op::Convolution(spec) => {
                let (kernel, x) = (inputs[0], inputs[1]);

                if kernel.rank() != 4 || x.rank() != 3 || kernel.dim(1) != x.dim(0) {
                    return Err(self.mismatch(inputs));
                }

                let dims = conv_dims(spec, kernel, x);
                if !dims.is_valid() {
                    return Err(self.mismatch(inputs));
                }

                Ok(Shape::from([dims.out_channels, dims.out_h(), dims.out_w()]))
            }
            Op::Pooling(spec) => {
                let x = inputs[0];

                if x.rank() != 3 {
                    return Err(self.mismatch(inputs));
                }

                let dims = pool_dims(spec, x);
                if !dims.is_valid() {
                    return Err(self.mismatch(inputs));
                }

                Ok(Shape::from([x.dim(0), dims.out_h(), dims.out_w()]))
            }
        }
    }

    /// Whether gradients flow through this operation at all. Comparisons and
    /// error counting are evaluation-only surfaces.
    pub fn differentiable(&self) -> bool {
        !matches!(self, Op::Compare(_) | Op::PredictionError)
    }

    /// Whether gradients from the output are backpropagated to input `idx`.
    /// The default is every input; the exceptions are part of each
    /// operation's contract.
    pub fn backprops_to(&self, idx: usize) -> bool {
        if !self.differentiable() {
            return false;
        }

        match self {
            // The branch condition is not differentiated through.
            Op::Select => idx != 0,
            // Labels are ground truth.
            Op::CrossEntropyWithSoftmax => idx == 0,
            _ => true,
        }
    }

    /// Whether the forward value of input `idx` must be retained for the
    /// backward pass. Defaults to "all inputs"; operations that can
    /// reconstruct their gradient from less declare it here, bounding
    /// retained memory for long unrolled sequences.
    pub fn requires_input_for_backward(&self, idx: usize) -> bool {
        match self {
            Op::Plus | Op::Minus | Op::Reshape(_) | Op::Reduce { .. } | Op::PastValue => false,
            // Only the condition is needed to route gradients.
            Op::Select => idx == 0,
            // These differentiate from their own output instead.
            Op::Sigmoid | Op::Tanh | Op::Exp => false,
            Op::Compare(_) | Op::PredictionError => false,
            Op::Pooling(spec) => spec.kind == PoolingKind::Max,
            _ => true,
        }
    }

    /// Whether the forward output must be retained for the backward pass.
    pub fn requires_output_for_backward(&self) -> bool {
        matches!(self, Op::Sigmoid | Op::Tanh | Op::Exp)
    }

    /// Number of operands.
    pub fn arity(&self) -> usize {
        match self {
            Op::Relu | Op::Sigmoid | Op::Tanh | Op::Exp | Op::Reduce { .. } | Op::Reshape(_) | Op::Pooling(_) => 1,
            Op::Select => 3,
            _ => 2,
        }
    }
}

pub(crate) fn conv_dims(spec: &ConvSpec, kernel: &Shape, x: &Shape) -> crate::cpu::conv::ConvDims {
    let (kh, kw) = (kernel.dim(2), kernel.dim(3));
    let (pad_h, pad_w) = if spec.zero_padding { ((kh - 1) / 2, (kw - 1) / 2) } else { (0, 0) };

    crate::cpu::conv::ConvDims {
        in_channels: x.dim(0),
        out_channels: kernel.dim(0),
        in_h: x.dim(1),
        in_w: x.dim(2),
        kernel_h: kh,
        kernel_w: kw,
        stride_h: spec.strides.0,
        stride_w: spec.strides.1,
        pad_h,
        pad_w,
    }
}

pub(crate) fn pool_dims(spec: &PoolSpec, x: &Shape) -> crate::cpu::conv::PoolDims {
    crate::cpu::conv::PoolDims {
        channels: x.dim(0),
        in_h: x.dim(1),
        in_w: x.dim(2),
        window_h: spec.window.0,
        window_w: spec.window.1,
        stride_h: spec.strides.0,
        stride_w: spec.strides.1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_shape_rule() {
        let w = Shape::from([1, 2]);
        let x = Shape::from([2]);
        assert_eq!(Op::Times.output_shape(&[&w, &x]).unwrap(), Shape::from([1]));

        let bad = Shape::from([3]);
        assert!(Op::Times.output_shape(&[&w, &bad]).is_err());
    }

    #[test]
    fn elementwise_broadcasts_scalars_only() {
        let v = Shape::from([4]);
        let s = Shape::scalar();
        assert_eq!(Op::Plus.output_shape(&[&v, &s]).unwrap(), v);
        assert_eq!(Op::ElementTimes.output_shape(&[&s, &v]).unwrap(), v);

        let w = Shape::from([3]);
        assert!(Op::Plus.output_shape(&[&v, &w]).is_err());
    }

    #[test]
    fn comparisons_do_not_backprop() {
        let op = Op::Compare(CmpOp::Less);
        assert!(!op.differentiable());
        assert!(!op.backprops_to(0));
    }

    #[test]
    fn select_condition_is_not_differentiated() {
        assert!(!Op::Select.backprops_to(0));
        assert!(Op::Select.backprops_to(1));
        assert!(Op::Select.backprops_to(2));
    }

    #[test]
    fn retention_defaults() {
        // Plus reconstructs its gradient from nothing.
        assert!(!Op::Plus.requires_input_for_backward(0));
        assert!(!Op::Plus.requires_output_for_backward());

        // Product rule needs both operands.
        assert!(Op::ElementTimes.requires_input_for_backward(0));
        assert!(Op::ElementTimes.requires_input_for_backward(1));

        // Sigmoid differentiates from its own output.
        assert!(!Op::Sigmoid.requires_input_for_backward(0));
        assert!(Op::Sigmoid.requires_output_for_backward());
    }

    #[test]
    fn conv_shape_inference() {
        let spec = ConvSpec { strides: (1, 1), zero_padding: false };
        let kernel = Shape::from([2, 1, 2, 2]);
        let x = Shape::from([1, 3, 3]);

        let out = Op::Convolution(spec).output_shape(&[&kernel, &x]).unwrap();
        assert_eq!(out, Shape::from([2, 2, 2]));

        // Channel mismatch.
        let bad = Shape::from([2, 3, 3]);
        assert!(Op::Convolution(spec).output_shape(&[&kernel, &bad]).is_err());
    }
}
