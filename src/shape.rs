/// The static shape of a tensor: an ordered list of positive dimensions.
///
/// Rank 0 denotes a scalar. Batch and sequence axes are dynamic and are
/// never part of the static shape.
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "scalar");
        }

        let dims = self.dims.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "{}", dims.join(" x "))
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        assert!(dims.iter().all(|&d| d > 0), "Shape dimensions must be positive!");
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    /// Total number of elements, 1 for a scalar.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// A shape is scalar-like if it holds exactly one element.
    pub fn is_scalar_like(&self) -> bool {
        self.size() == 1
    }

    /// Number of rows when viewed as a matrix: rank 0 and 1 shapes are
    /// column vectors, higher ranks use the leading dimension.
    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    /// Number of columns when viewed as a matrix.
    pub fn cols(&self) -> usize {
        if self.rank() < 2 {
            1
        } else {
            self.dims[1..].iter().product()
        }
    }

    /// Shape of the matrix product `self * rhs`, contracting `self.cols()`
    /// against `rhs.rows()`. `None` if the contracted dimensions differ or
    /// either operand has rank above 2.
    pub fn matmul(&self, rhs: &Shape) -> Option<Shape> {
        if self.rank() > 2 || rhs.rank() > 2 {
            return None;
        }

        if self.cols() != rhs.rows() {
            return None;
        }

        let out = match rhs.rank() {
            2 => Shape::new(vec![self.rows(), rhs.dim(1)]),
            _ => Shape::new(vec![self.rows()]),
        };

        Some(out)
    }

    /// Transpose of a rank <= 2 shape.
    pub fn transpose(&self) -> Shape {
        match self.rank() {
            0 | 1 => Shape::new(vec![1, self.rows()]),
            2 => Shape::new(vec![self.dim(1), self.dim(0)]),
            _ => panic!("Cannot transpose a rank {} shape!", self.rank()),
        }
    }

    /// Whether `self` can be reshaped into `other` without moving data.
    pub fn reshapeable_to(&self, other: &Shape) -> bool {
        self.size() == other.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_rule() {
        let w = Shape::from([1, 2]);
        let x = Shape::from([2]);
        assert_eq!(w.matmul(&x), Some(Shape::from([1])));

        let a = Shape::from([3, 4]);
        let b = Shape::from([4, 2]);
        assert_eq!(a.matmul(&b), Some(Shape::from([3, 2])));

        let bad = Shape::from([3, 4]);
        assert_eq!(bad.matmul(&Shape::from([3])), None);
    }

    #[test]
    fn scalar_shapes() {
        let s = Shape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.size(), 1);
        assert!(s.is_scalar_like());
    }

    #[test]
    fn rows_cols() {
        assert_eq!(Shape::from([5]).rows(), 5);
        assert_eq!(Shape::from([5]).cols(), 1);
        assert_eq!(Shape::from([2, 3]).cols(), 3);
    }

    #[test]
    #[should_panic]
    fn zero_dim_rejected() {
        let _ = Shape::from([1, 0]);
    }
}
