//! Broadcast and layout helpers shared by the forward and backward passes.

use crate::{cpu::base, value::Value};

use super::EvalError;

/// Slice of sample `b`, or the whole buffer for an unbatched value.
pub fn sample(vals: &[f32], single: usize, batch: Option<usize>, b: usize) -> &[f32] {
    match batch {
        Some(_) => &vals[b * single..(b + 1) * single],
        None => vals,
    }
}

pub fn sample_mut(vals: &mut [f32], single: usize, batch: Option<usize>, b: usize) -> &mut [f32] {
    match batch {
        Some(_) => &mut vals[b * single..(b + 1) * single],
        None => vals,
    }
}

/// Materializes a value as a fully-expanded `single x batch` buffer,
/// broadcasting scalars across elements and unbatched values across
/// samples. Shape compatibility was established at construction.
pub fn expand(v: &Value, single: usize, batch: usize) -> Result<Vec<f32>, EvalError> {
    let vals = v.dense()?;
    let v_single = v.single_size();
    let mut out = Vec::with_capacity(single * batch);

    for b in 0..batch {
        let s = sample(vals, v_single, v.batch_size(), b);

        if v_single == single {
            out.extend_from_slice(s);
        } else {
            debug_assert_eq!(v_single, 1);
            out.extend(std::iter::repeat(s[0]).take(single));
        }
    }

    Ok(out)
}

/// Folds an expanded `single x batch` gradient back into `dst`'s layout:
/// summing across samples when `dst` is unbatched and across elements when
/// `dst` is scalar. This is where fan-out contributions accumulate rather
/// than overwrite.
pub fn reduce_into(expanded: &[f32], single: usize, batch: usize, dst: &mut Value) -> Result<(), EvalError> {
    let d_single = dst.single_size();
    let d_batch = dst.batch_size();
    let buf = dst.dense_mut()?;

    for b in 0..batch {
        let src = &expanded[b * single..(b + 1) * single];
        let dst_sample = sample_mut(buf, d_single, d_batch, b);

        if d_single == single {
            base::axpy(1.0, src, dst_sample);
        } else {
            debug_assert_eq!(d_single, 1);
            dst_sample[0] += base::sum(src);
        }
    }

    Ok(())
}

/// Expands a raw per-output buffer across samples when unbatched.
pub fn expand_raw(vals: &[f32], single: usize, batch: Option<usize>, nbatch: usize) -> Vec<f32> {
    match batch {
        Some(_) => vals.to_vec(),
        None => {
            let mut out = Vec::with_capacity(single * nbatch);
            for _ in 0..nbatch {
                out.extend_from_slice(vals);
            }
            out
        }
    }
}

/// `dst += src` for values with identical layout.
pub fn add_assign_value(dst: &mut Value, src: &Value) -> Result<(), EvalError> {
    let vals = src.dense()?.to_vec();
    let buf = dst.dense_mut()?;
    base::axpy(1.0, &vals, buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;

    const CPU: DeviceDescriptor = DeviceDescriptor::Cpu;

    #[test]
    fn expand_tiles_unbatched() {
        let v = Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap();
        assert_eq!(expand(&v, 2, 3).unwrap(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn expand_broadcasts_scalars() {
        let v = Value::scalar(5.0, CPU);
        assert_eq!(expand(&v, 3, 2).unwrap(), vec![5.0; 6]);
    }

    #[test]
    fn reduce_sums_batch_and_elements() {
        let mut scalar_dst = Value::zeroed(crate::shape::Shape::scalar(), CPU);
        reduce_into(&[1.0, 2.0, 3.0, 4.0], 2, 2, &mut scalar_dst).unwrap();
        assert_eq!(scalar_dst.dense().unwrap(), &[10.0]);

        let mut unbatched = Value::zeroed([2], CPU);
        reduce_into(&[1.0, 2.0, 3.0, 4.0], 2, 2, &mut unbatched).unwrap();
        assert_eq!(unbatched.dense().unwrap(), &[4.0, 6.0]);
    }
}
