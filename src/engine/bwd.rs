//! Backward dispatch: local gradient rules per primitive operation.

use crate::{
    cpu::{base, blas, conv},
    device::DeviceDescriptor,
    graph::{
        op::{conv_dims, pool_dims},
        Op, PoolingKind, Reduce, ReduceAxis,
    },
    shape::Shape,
    value::Value,
};

use super::{util, EvalError};

pub(crate) struct BwdCtx<'a> {
    pub op: &'a Op,
    pub dout: &'a Value,
    /// Retained forward input values, present exactly where the operation
    /// declared them required for backward.
    pub inputs: Vec<Option<&'a Value>>,
    /// Retained forward output, when declared required.
    pub output: Option<&'a Value>,
    /// Per input: shape, forward batch size, and whether a gradient is
    /// wanted at all.
    pub input_meta: Vec<(Shape, Option<usize>, bool)>,
    pub device: DeviceDescriptor,
}

impl BwdCtx<'_> {
    fn zero_grad(&self, idx: usize) -> Value {
        let (shape, batch, _) = &self.input_meta[idx];
        Value::zeroed_batched(shape.clone(), *batch, self.device)
    }

    fn wants(&self, idx: usize) -> bool {
        self.input_meta[idx].2
    }

    fn retained(&self, idx: usize) -> Result<&Value, EvalError> {
        self.inputs[idx].ok_or(EvalError::InvalidState)
    }

    fn retained_output(&self) -> Result<&Value, EvalError> {
        self.output.ok_or(EvalError::InvalidState)
    }
}

/// Computes the gradient contribution for every wanted input, each in that
/// input's own layout (batch and scalar broadcasts already folded back).
pub(crate) fn execute(ctx: &BwdCtx) -> Result<Vec<Option<Value>>, EvalError> {
    let mut grads: Vec<Option<Value>> = ctx.input_meta.iter().map(|_| None).collect();

    let single = ctx.dout.single_size();
    let nbatch = ctx.dout.batch_size().unwrap_or(1);
    let dout = ctx.dout.dense()?;
    let dout_batch = ctx.dout.batch_size();

    match ctx.op {
        Op::Plus | Op::Minus => {
            for idx in 0..2 {
                if !ctx.wants(idx) {
                    continue;
                }

                let mut g = ctx.zero_grad(idx);

                if *ctx.op == Op::Minus && idx == 1 {
                    let negated = dout.iter().map(|&v| -v).collect::<Vec<_>>();
                    util::reduce_into(&util::expand_raw(&negated, single, dout_batch, nbatch), single, nbatch, &mut g)?;
                } else {
                    util::reduce_into(&util::expand_raw(dout, single, dout_batch, nbatch), single, nbatch, &mut g)?;
                }

                grads[idx] = Some(g);
            }
        }
        Op::ElementTimes | Op::Scale => {
            for (idx, other) in [(0, 1), (1, 0)] {
                if !ctx.wants(idx) {
                    continue;
                }

                let other_vals = util::expand(ctx.retained(other)?, single, nbatch)?;
                let expanded = util::expand_raw(dout, single, dout_batch, nbatch);
                let mut product = vec![0.0; single * nbatch];
                base::mul(&expanded, &other_vals, &mut product);

                let mut g = ctx.zero_grad(idx);
                util::reduce_into(&product, single, nbatch, &mut g)?;
                grads[idx] = Some(g);
            }
        }
        Op::Times => {
            let lhs = ctx.retained(0)?;
            let rhs = ctx.retained(1)?;
            let (sa, sb) = (lhs.shape().clone(), rhs.shape().clone());
            let (m, k, n) = (sa.rows(), sa.cols(), sb.cols());

            let a = lhs.dense()?;
            let b = rhs.dense()?;

            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                let g_batch = g.batch_size();
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    blas::gemm_nt(
                        m,
                        k,
                        n,
                        util::sample(dout, single, dout_batch, s),
                        util::sample(b, sb.size(), rhs.batch_size(), s),
                        util::sample_mut(buf, sa.size(), g_batch, s),
                        true,
                    );
                }

                grads[0] = Some(g);
            }

            if ctx.wants(1) {
                let mut g = ctx.zero_grad(1);
                let g_batch = g.batch_size();
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    blas::gemm_tn(
                        k,
                        n,
                        m,
                        util::sample(a, sa.size(), lhs.batch_size(), s),
                        util::sample(dout, single, dout_batch, s),
                        util::sample_mut(buf, sb.size(), g_batch, s),
                        true,
                    );
                }

                grads[1] = Some(g);
            }
        }
        Op::Relu => {
            if ctx.wants(0) {
                let x = ctx.retained(0)?.dense()?;
                let mut g = ctx.zero_grad(0);
                base::relu_backward(x, dout, g.dense_mut()?);
                grads[0] = Some(g);
            }
        }
        Op::Sigmoid | Op::Tanh | Op::Exp => {
            if ctx.wants(0) {
                let y = ctx.retained_output()?.dense()?;
                let mut g = ctx.zero_grad(0);
                let buf = g.dense_mut()?;

                match ctx.op {
                    Op::Sigmoid => base::sigmoid_backward(y, dout, buf),
                    Op::Tanh => base::tanh_backward(y, dout, buf),
                    _ => base::exp_backward(y, dout, buf),
                }

                grads[0] = Some(g);
            }
        }
        Op::Reduce { reduction, axis: ReduceAxis::Elements } => {
            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                let x_single = g.single_size();
                let g_batch = g.batch_size();
                let norm = match reduction {
                    Reduce::Sum => 1.0,
                    Reduce::Mean => 1.0 / x_single as f32,
                };

                let buf = g.dense_mut()?;
                for s in 0..nbatch {
                    let gs = dout[if dout_batch.is_some() { s } else { 0 }] * norm;
                    for v in util::sample_mut(buf, x_single, g_batch, s) {
                        *v += gs;
                    }
                }

                grads[0] = Some(g);
            }
        }
        Op::Reduce { reduction, axis: ReduceAxis::Batch } => {
            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                let x_single = g.single_size();
                let g_batch = g.batch_size();
                let samples = g_batch.unwrap_or(1);
                let norm = match reduction {
                    Reduce::Sum => 1.0,
                    Reduce::Mean => 1.0 / samples as f32,
                };

                let buf = g.dense_mut()?;
                for s in 0..samples {
                    base::axpy(norm, dout, util::sample_mut(buf, x_single, g_batch, s));
                }

                grads[0] = Some(g);
            }
        }
        Op::Reshape(_) => {
            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                base::axpy(1.0, dout, g.dense_mut()?);
                grads[0] = Some(g);
            }
        }
        Op::Select => {
            let cond = util::expand(ctx.retained(0)?, single, nbatch)?;
            let expanded = util::expand_raw(dout, single, dout_batch, nbatch);

            let mut da = vec![0.0; single * nbatch];
            let mut db = vec![0.0; single * nbatch];
            base::select_backward(&cond, &expanded, &mut da, &mut db);

            for (idx, routed) in [(1, &da), (2, &db)] {
                if ctx.wants(idx) {
                    let mut g = ctx.zero_grad(idx);
                    util::reduce_into(routed, single, nbatch, &mut g)?;
                    grads[idx] = Some(g);
                }
            }
        }
        Op::CrossEntropyWithSoftmax => {
            if ctx.wants(0) {
                let pred = ctx.retained(0)?;
                let labels = ctx.retained(1)?;
                let size = pred.single_size();
                let p = pred.dense()?;
                let l = labels.dense()?;

                let mut g = ctx.zero_grad(0);
                let g_batch = g.batch_size();
                let mut scratch = vec![0.0; size];
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    base::softmax(util::sample(p, size, pred.batch_size(), s), &mut scratch);
                    let ls = util::sample(l, size, labels.batch_size(), s);
                    let gs = dout[if dout_batch.is_some() { s } else { 0 }];

                    let gbuf = util::sample_mut(buf, size, g_batch, s);
                    for i in 0..size {
                        gbuf[i] += gs * (scratch[i] - ls[i]);
                    }
                }

                grads[0] = Some(g);
            }
        }
        Op::SquaredError => {
            let pred = ctx.retained(0)?;
            let target = ctx.retained(1)?;
            let size = pred.single_size();
            let p = pred.dense()?;
            let t = target.dense()?;

            for (idx, sign) in [(0, 2.0f32), (1, -2.0f32)] {
                if !ctx.wants(idx) {
                    continue;
                }

                let mut g = ctx.zero_grad(idx);
                let g_batch = g.batch_size();
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    let ps = util::sample(p, size, pred.batch_size(), s);
                    let ts = util::sample(t, size, target.batch_size(), s);
                    let gs = dout[if dout_batch.is_some() { s } else { 0 }];

                    let gbuf = util::sample_mut(buf, size, g_batch, s);
                    for i in 0..size {
                        gbuf[i] += sign * gs * (ps[i] - ts[i]);
                    }
                }

                grads[idx] = Some(g);
            }
        }
        Op::Convolution(spec) => {
            let kernel = ctx.retained(0)?;
            let x = ctx.retained(1)?;
            let dims = conv_dims(spec, kernel.shape(), x.shape());
            let kv = kernel.dense()?;
            let xv = x.dense()?;

            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                let g_batch = g.batch_size();
                let k_single = kernel.single_size();
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    conv::conv2d_backward_kernel(
                        &dims,
                        util::sample(xv, x.single_size(), x.batch_size(), s),
                        util::sample(dout, single, dout_batch, s),
                        util::sample_mut(buf, k_single, g_batch, s),
                    );
                }

                grads[0] = Some(g);
            }

            if ctx.wants(1) {
                let mut g = ctx.zero_grad(1);
                let g_batch = g.batch_size();
                let x_single = x.single_size();
                let buf = g.dense_mut()?;

                for s in 0..nbatch {
                    conv::conv2d_backward_input(
                        &dims,
                        util::sample(kv, kernel.single_size(), kernel.batch_size(), s),
                        util::sample(dout, single, dout_batch, s),
                        util::sample_mut(buf, x_single, g_batch, s),
                    );
                }

                grads[1] = Some(g);
            }
        }
        Op::Pooling(spec) => {
            if ctx.wants(0) {
                let mut g = ctx.zero_grad(0);
                let g_batch = g.batch_size();
                let x_single = g.single_size();

                match spec.kind {
                    PoolingKind::Max => {
                        let x = ctx.retained(0)?;
                        let dims = pool_dims(spec, x.shape());
                        let xv = x.dense()?;
                        let buf = g.dense_mut()?;

                        for s in 0..nbatch {
                            conv::max_pool_backward(
                                &dims,
                                util::sample(xv, x_single, x.batch_size(), s),
                                util::sample(dout, single, dout_batch, s),
                                util::sample_mut(buf, x_single, g_batch, s),
                            );
                        }
                    }
                    PoolingKind::Average => {
                        let dims = pool_dims(spec, &ctx.input_meta[0].0);
                        let buf = g.dense_mut()?;

                        for s in 0..nbatch {
                            conv::avg_pool_backward(
                                &dims,
                                util::sample(dout, single, dout_batch, s),
                                util::sample_mut(buf, x_single, g_batch, s),
                            );
                        }
                    }
                }

                grads[0] = Some(g);
            }
        }
        Op::Compare(_) | Op::PredictionError => {
            // Not differentiable; the scheduler never routes gradients here.
        }
        Op::PastValue => unreachable!("past_value gradients are routed by the scheduler"),
    }

    Ok(grads)
}
