//! Forward dispatch of a single primitive application.

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

/// Evaluates `op` over concrete per-step input values, producing a freshly
/// allocated output. `past_value` never reaches this path; the scheduler
/// resolves it by reindexing time.
pub(crate) fn execute(
    op: &Op,
    inputs: &[&Value],
    out_shape: &Shape,
    device: DeviceDescriptor,
) -> Result<Value, EvalError> {
    let batch = match op {
        Op::Reduce { axis: ReduceAxis::Batch, .. } => None,
        _ => inputs.iter().find_map(|v| v.batch_size()),
    };

    let single = out_shape.size();
    let nbatch = batch.unwrap_or(1);
    let mut out = Value::zeroed_batched(out_shape.clone(), batch, device);

    match op {
        Op::Plus | Op::Minus | Op::ElementTimes | Op::Scale => {
            let a = util::expand(inputs[0], single, nbatch)?;
            let b = util::expand(inputs[1], single, nbatch)?;
            let buf = out.dense_mut()?;

            match op {
                Op::Plus => base::add(&a, &b, buf),
                Op::Minus => base::sub(&a, &b, buf),
                _ => base::mul(&a, &b, buf),
            }
        }
        Op::Times => {
            let (sa, sb) = (inputs[0].shape().clone(), inputs[1].shape().clone());
            let (m, k, n) = (sa.rows(), sa.cols(), sb.cols());

            let a = inputs[0].dense()?.to_vec();
            let b = inputs[1].dense()?.to_vec();
            let (ab, bb) = (inputs[0].batch_size(), inputs[1].batch_size());
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                blas::gemm_nn(
                    m,
                    n,
                    k,
                    util::sample(&a, sa.size(), ab, s),
                    util::sample(&b, sb.size(), bb, s),
                    util::sample_mut(buf, single, batch, s),
                    false,
                );
            }
        }
        Op::Relu | Op::Sigmoid | Op::Tanh | Op::Exp => {
            let x = inputs[0].dense()?.to_vec();
            let buf = out.dense_mut()?;

            match op {
                Op::Relu => base::relu(&x, buf),
                Op::Sigmoid => base::sigmoid(&x, buf),
                Op::Tanh => base::tanh(&x, buf),
                _ => base::exp(&x, buf),
            }
        }
        Op::Reduce { reduction, axis: ReduceAxis::Elements } => {
            let x = inputs[0].dense()?.to_vec();
            let x_single = inputs[0].single_size();
            let xb = inputs[0].batch_size();
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                let mut acc = base::sum(util::sample(&x, x_single, xb, s));
                if *reduction == Reduce::Mean {
                    acc /= x_single as f32;
                }
                buf[s] = acc;
            }
        }
        Op::Reduce { reduction, axis: ReduceAxis::Batch } => {
            let x = inputs[0].dense()?.to_vec();
            let x_single = inputs[0].single_size();
            let xb = inputs[0].batch_size();
            let samples = xb.unwrap_or(1);
            let buf = out.dense_mut()?;

            for s in 0..samples {
                base::axpy(1.0, util::sample(&x, x_single, xb, s), buf);
            }

            if *reduction == Reduce::Mean {
                let norm = 1.0 / samples as f32;
                for v in buf.iter_mut() {
                    *v *= norm;
                }
            }
        }
        Op::Reshape(_) => {
            let x = inputs[0].dense()?.to_vec();
            out.dense_mut()?.copy_from_slice(&x);
        }
        Op::Select => {
            let cond = util::expand(inputs[0], single, nbatch)?;
            let a = util::expand(inputs[1], single, nbatch)?;
            let b = util::expand(inputs[2], single, nbatch)?;
            base::select(&cond, &a, &b, out.dense_mut()?);
        }
        Op::Compare(cmp) => {
            let a = util::expand(inputs[0], single, nbatch)?;
            let b = util::expand(inputs[1], single, nbatch)?;
            base::compare(*cmp, &a, &b, out.dense_mut()?);
        }
        Op::CrossEntropyWithSoftmax => {
            let pred = inputs[0].dense()?.to_vec();
            let labels = inputs[1].dense()?.to_vec();
            let size = inputs[0].single_size();
            let (pb, lb) = (inputs[0].batch_size(), inputs[1].batch_size());
            let mut scratch = vec![0.0; size];
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                buf[s] = base::cross_entropy_with_softmax(
                    util::sample(&pred, size, pb, s),
                    util::sample(&labels, size, lb, s),
                    &mut scratch,
                );
            }
        }
        Op::SquaredError => {
            let pred = inputs[0].dense()?.to_vec();
            let target = inputs[1].dense()?.to_vec();
            let size = inputs[0].single_size();
            let (pb, tb) = (inputs[0].batch_size(), inputs[1].batch_size());
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                let p = util::sample(&pred, size, pb, s);
                let t = util::sample(&target, size, tb, s);
                buf[s] = p.iter().zip(t).map(|(&x, &y)| (x - y) * (x - y)).sum();
            }
        }
        Op::PredictionError => {
            let pred = inputs[0].dense()?.to_vec();
            let labels = inputs[1].dense()?.to_vec();
            let size = inputs[0].single_size();
            let (pb, lb) = (inputs[0].batch_size(), inputs[1].batch_size());
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                let p = base::argmax(util::sample(&pred, size, pb, s));
                let l = base::argmax(util::sample(&labels, size, lb, s));
                buf[s] = if p == l { 0.0 } else { 1.0 };
            }
        }
        Op::Convolution(spec) => {
            let dims = conv_dims(spec, inputs[0].shape(), inputs[1].shape());
            let kernel = inputs[0].dense()?.to_vec();
            let x = inputs[1].dense()?.to_vec();
            let (kb, xb) = (inputs[0].batch_size(), inputs[1].batch_size());
            let (k_single, x_single) = (inputs[0].single_size(), inputs[1].single_size());
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                conv::conv2d(
                    &dims,
                    util::sample(&x, x_single, xb, s),
                    util::sample(&kernel, k_single, kb, s),
                    util::sample_mut(buf, single, batch, s),
                );
            }
        }
        Op::Pooling(spec) => {
            let dims = pool_dims(spec, inputs[0].shape());
            let x = inputs[0].dense()?.to_vec();
            let xb = inputs[0].batch_size();
            let x_single = inputs[0].single_size();
            let buf = out.dense_mut()?;

            for s in 0..nbatch {
                let x_s = util::sample(&x, x_single, xb, s);
                let out_s = util::sample_mut(buf, single, batch, s);

                match spec.kind {
                    PoolingKind::Max => conv::max_pool(&dims, x_s, out_s),
                    PoolingKind::Average => conv::avg_pool(&dims, x_s, out_s),
                }
            }
        }
        Op::PastValue => unreachable!("past_value is resolved by the scheduler"),
    }

    Ok(out)
}
