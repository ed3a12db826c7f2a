use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{device::DeviceDescriptor, shape::Shape};

/// Element type of a value. The reference CPU backend computes in `F32`;
/// the remaining kinds are carried as stream/value metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    I32,
    I64,
    F16,
    F32,
    F64,
}

/// Storage form of a value's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Dense,
    SparseCsc,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueError {
    ReadOnly,
    /// A write was attempted through a view whose buffer is shared.
    SharedBuffer,
    NotDense,
    NotSparse,
    LengthMismatch { expected: usize, got: usize },
    ShapeMismatch { expected: Shape, got: Shape },
    SparseIndexOutOfBounds { index: i32, size: usize },
}

#[derive(Clone, Debug)]
enum Buffer {
    Dense(Vec<f32>),
    /// Per-sample compressed indices: `nnz` active rows per sample, index
    /// -1 marks an absent entry.
    Sparse { nnz: usize, indices: Vec<i32> },
}

/// A concrete multi-dimensional array bound to a device.
///
/// The static shape and element type are fixed at creation. The underlying
/// buffer is reference counted: `view` produces a read-only alias, while
/// mutation requires exclusive ownership of the buffer. An optional batch
/// axis holds `batch_size` independent samples laid out contiguously.
#[derive(Clone, Debug)]
pub struct Value {
    shape: Shape,
    dtype: DataType,
    device: DeviceDescriptor,
    batch_size: Option<usize>,
    read_only: bool,
    buf: Arc<Buffer>,
}

impl Value {
    pub fn zeroed(shape: impl Into<Shape>, device: DeviceDescriptor) -> Self {
        Self::zeroed_batched(shape, None, device)
    }

    pub fn zeroed_batched(shape: impl Into<Shape>, batch_size: Option<usize>, device: DeviceDescriptor) -> Self {
        let shape = shape.into();
        let len = shape.size() * batch_size.unwrap_or(1);

        Self {
            shape,
            dtype: DataType::F32,
            device,
            batch_size,
            read_only: false,
            buf: Arc::new(Buffer::Dense(vec![0.0; len])),
        }
    }

    pub fn scalar(val: f32, device: DeviceDescriptor) -> Self {
        Self {
            shape: Shape::scalar(),
            dtype: DataType::F32,
            device,
            batch_size: None,
            read_only: false,
            buf: Arc::new(Buffer::Dense(vec![val])),
        }
    }

    pub fn from_slice(
        shape: impl Into<Shape>,
        batch_size: Option<usize>,
        vals: &[f32],
        device: DeviceDescriptor,
    ) -> Result<Self, ValueError> {
        let shape = shape.into();
        let expected = shape.size() * batch_size.unwrap_or(1);

        if vals.len() != expected {
            return Err(ValueError::LengthMismatch { expected, got: vals.len() });
        }

        Ok(Self {
            shape,
            dtype: DataType::F32,
            device,
            batch_size,
            read_only: false,
            buf: Arc::new(Buffer::Dense(vals.to_vec())),
        })
    }

    /// A sparse value: `nnz` active row indices per sample, `-1` for absent
    /// entries. Indices are validated against the shape here so downstream
    /// kernels can trust them.
    pub fn sparse(
        shape: impl Into<Shape>,
        nnz: usize,
        batch_size: Option<usize>,
        indices: &[i32],
        device: DeviceDescriptor,
    ) -> Result<Self, ValueError> {
        let shape = shape.into();
        let expected = nnz * batch_size.unwrap_or(1);

        if indices.len() != expected {
            return Err(ValueError::LengthMismatch { expected, got: indices.len() });
        }

        let size = shape.size();
        for &idx in indices {
            if idx >= size as i32 || idx < -1 {
                return Err(ValueError::SparseIndexOutOfBounds { index: idx, size });
            }
        }

        Ok(Self {
            shape,
            dtype: DataType::F32,
            device,
            batch_size,
            read_only: false,
            buf: Arc::new(Buffer::Sparse { nnz, indices: indices.to_vec() }),
        })
    }

    pub fn random_uniform(shape: impl Into<Shape>, lo: f32, hi: f32, device: DeviceDescriptor) -> Self {
        let shape = shape.into();
        let mut rng = StdRng::from_entropy();
        let vals = (0..shape.size()).map(|_| rng.gen_range(lo..hi)).collect::<Vec<_>>();

        Self {
            shape,
            dtype: DataType::F32,
            device,
            batch_size: None,
            read_only: false,
            buf: Arc::new(Buffer::Dense(vals)),
        }
    }

    pub fn random_normal(shape: impl Into<Shape>, mean: f32, stdev: f32, device: DeviceDescriptor) -> Self {
        let shape = shape.into();
        let mut rng = StdRng::from_entropy();
        let dist = Normal::new(mean, stdev).expect("stdev must be finite and non-negative");
        let vals = (0..shape.size()).map(|_| dist.sample(&mut rng)).collect::<Vec<_>>();

        Self {
            shape,
            dtype: DataType::F32,
            device,
            batch_size: None,
            read_only: false,
            buf: Arc::new(Buffer::Dense(vals)),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> DeviceDescriptor {
        self.device
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn storage_kind(&self) -> StorageKind {
        match &*self.buf {
            Buffer::Dense(_) => StorageKind::Dense,
            Buffer::Sparse { .. } => StorageKind::SparseCsc,
        }
    }

    /// Elements in one sample.
    pub fn single_size(&self) -> usize {
        self.shape.size()
    }

    /// Elements across all samples.
    pub fn total_size(&self) -> usize {
        self.shape.size() * self.batch_size.unwrap_or(1)
    }

    /// A read-only alias sharing this value's buffer.
    pub fn view(&self) -> Value {
        Value { read_only: true, ..self.clone() }
    }

    pub fn deep_clone(&self, read_only: bool) -> Value {
        Value { read_only, buf: Arc::new((*self.buf).clone()), ..self.clone() }
    }

    pub fn dense(&self) -> Result<&[f32], ValueError> {
        match &*self.buf {
            Buffer::Dense(vals) => Ok(vals),
            Buffer::Sparse { .. } => Err(ValueError::NotDense),
        }
    }

    /// Mutable access to the dense buffer. Fails on read-only views and on
    /// buffers aliased by other views: a view holder never gets to write
    /// through shared storage.
    pub fn dense_mut(&mut self) -> Result<&mut [f32], ValueError> {
        if self.read_only {
            return Err(ValueError::ReadOnly);
        }

        match Arc::get_mut(&mut self.buf) {
            Some(Buffer::Dense(vals)) => Ok(vals),
            Some(Buffer::Sparse { .. }) => Err(ValueError::NotDense),
            None => Err(ValueError::SharedBuffer),
        }
    }

    pub fn sparse_indices(&self) -> Result<(usize, &[i32]), ValueError> {
        match &*self.buf {
            Buffer::Sparse { nnz, indices } => Ok((*nnz, indices)),
            Buffer::Dense(_) => Err(ValueError::NotSparse),
        }
    }

    /// Expands a sparse value into a dense one-hot form. Dense values are
    /// deep-cloned unchanged.
    pub fn to_dense(&self) -> Value {
        match &*self.buf {
            Buffer::Dense(_) => self.deep_clone(false),
            Buffer::Sparse { nnz, indices } => {
                let size = self.single_size();
                let batch = self.batch_size.unwrap_or(1);
                let mut vals = vec![0.0; size * batch];

                for b in 0..batch {
                    for &idx in &indices[b * nnz..(b + 1) * nnz] {
                        if idx >= 0 {
                            vals[b * size + idx as usize] = 1.0;
                        }
                    }
                }

                Value {
                    shape: self.shape.clone(),
                    dtype: self.dtype,
                    device: self.device,
                    batch_size: self.batch_size,
                    read_only: false,
                    buf: Arc::new(Buffer::Dense(vals)),
                }
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<f32>, ValueError> {
        Ok(self.dense()?.to_vec())
    }

    pub fn get_scalar(&self) -> Option<f32> {
        if self.total_size() == 1 {
            self.dense().ok().map(|vals| vals[0])
        } else {
            None
        }
    }

    /// Writes `other`'s contents into this value's storage. Shape, batch
    /// size, and storage form must already match.
    pub fn copy_from(&mut self, other: &Value) -> Result<(), ValueError> {
        if self.shape != other.shape {
            return Err(ValueError::ShapeMismatch { expected: self.shape.clone(), got: other.shape.clone() });
        }

        if self.batch_size != other.batch_size {
            return Err(ValueError::LengthMismatch { expected: self.total_size(), got: other.total_size() });
        }

        let src = other.dense()?.to_vec();
        self.dense_mut()?.copy_from_slice(&src);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: DeviceDescriptor = DeviceDescriptor::Cpu;

    #[test]
    fn from_slice_checks_length() {
        assert!(Value::from_slice([2, 2], None, &[1.0; 4], CPU).is_ok());
        assert!(matches!(
            Value::from_slice([2, 2], None, &[1.0; 3], CPU),
            Err(ValueError::LengthMismatch { expected: 4, got: 3 })
        ));

        assert!(Value::from_slice([2], Some(3), &[0.0; 6], CPU).is_ok());
    }

    #[test]
    fn views_cannot_write() {
        let mut val = Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap();
        let mut view = val.view();

        assert_eq!(view.dense_mut(), Err(ValueError::ReadOnly));

        // The original cannot write either while the view is alive.
        assert_eq!(val.dense_mut(), Err(ValueError::SharedBuffer));

        drop(view);
        assert!(val.dense_mut().is_ok());
    }

    #[test]
    fn deep_clone_detaches() {
        let val = Value::from_slice([2], None, &[1.0, 2.0], CPU).unwrap();
        let mut copy = val.deep_clone(false);

        copy.dense_mut().unwrap()[0] = 9.0;
        assert_eq!(val.dense().unwrap(), &[1.0, 2.0]);
        assert_eq!(copy.dense().unwrap(), &[9.0, 2.0]);
    }

    #[test]
    fn sparse_to_dense() {
        let val = Value::sparse([4], 1, Some(2), &[2, -1], CPU).unwrap();
        let dense = val.to_dense();

        assert_eq!(dense.dense().unwrap(), &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn sparse_rejects_out_of_range() {
        assert!(matches!(
            Value::sparse([4], 1, None, &[4], CPU),
            Err(ValueError::SparseIndexOutOfBounds { index: 4, size: 4 })
        ));
    }

    #[test]
    fn copy_from_validates_shape() {
        let mut dst = Value::zeroed([2], CPU);
        let src = Value::from_slice([3], None, &[1.0; 3], CPU).unwrap();

        assert!(matches!(dst.copy_from(&src), Err(ValueError::ShapeMismatch { .. })));
    }
}
