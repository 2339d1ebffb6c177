use std::fmt;

// Shape: per-sample tensor dimensions
//
// Activations in Kiln are stored one sample per matrix column, so a Shape
// describes a single sample, channel axis first:
//   - 1-D signal: Shape([C, L])
//   - image:      Shape([C, H, W])
//   - volume:     Shape([C, D, H, W])
//
// The flattened sample is laid out in row-major (C-order) over these dims,
// which is the same order an NCHW tensor descriptor expects once the batch
// axis is prepended.

/// Dimensions of one sample (channel axis first).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// An empty shape has 1 element; any zero dimension gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Size of the leading (channel) axis, 0 for an empty shape.
    pub fn channels(&self) -> usize {
        self.0.first().copied().unwrap_or(0)
    }

    /// The spatial dimensions (everything after the channel axis).
    pub fn spatial(&self) -> &[usize] {
        self.0.get(1..).unwrap_or(&[])
    }

    /// Number of elements per channel.
    pub fn spatial_size(&self) -> usize {
        self.spatial().iter().product()
    }

    /// Shape with a leading batch axis of size `n`, as a native tensor
    /// descriptor wants it (`[N, C, *spatial]`).
    pub fn with_batch(&self, n: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.rank() + 1);
        dims.push(n);
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}]", dims.join(", "))
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}
