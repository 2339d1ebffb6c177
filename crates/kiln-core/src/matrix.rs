// Local dense matrices
//
// Kiln exchanges activations, error signals and parameters as column-major
// dense matrices that hold the locally owned partition of a (possibly
// distributed) tensor. For activations each column is one mini-batch sample
// and the rows are the flattened sample (channel-major, see `Shape`).
//
// Three types cover ownership:
//   Mat        owned storage
//   MatRef<'a> read-only view (e.g. a column range of a Mat)
//   MatMut<'a> mutable view
//
// Views never copy. `reshape` reinterprets the same contiguous buffer with
// different dimensions, which is how a kernel stored as one long column is
// seen as a [K, C_out] GEMM operand.

use std::ops::{Index, IndexMut, Range};

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::DataType;

fn check_len(height: usize, width: usize, len: usize) -> Result<()> {
    if height * width != len {
        return Err(Error::ShapeMismatch {
            expected: Shape::from((height, width)),
            got: Shape::new(vec![len]),
        });
    }
    Ok(())
}

fn check_columns(cols: &Range<usize>, width: usize) -> Result<()> {
    if cols.start > cols.end || cols.end > width {
        return Err(Error::msg(format!(
            "column range {}..{} out of bounds for matrix with {} columns",
            cols.start, cols.end, width
        )));
    }
    Ok(())
}

/// Owned column-major matrix.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mat {
    height: usize,
    width: usize,
    data: Vec<DataType>,
}

impl Mat {
    /// Matrix of zeros.
    pub fn zeros(height: usize, width: usize) -> Self {
        Mat {
            height,
            width,
            data: vec![0.0; height * width],
        }
    }

    /// Matrix filled with `value`.
    pub fn full(height: usize, width: usize, value: DataType) -> Self {
        Mat {
            height,
            width,
            data: vec![value; height * width],
        }
    }

    /// Wrap column-major `data`.
    pub fn from_vec(height: usize, width: usize, data: Vec<DataType>) -> Result<Self> {
        check_len(height, width, data.len())?;
        Ok(Mat {
            height,
            width,
            data,
        })
    }

    /// Build a matrix from `f(row, col)`.
    pub fn from_fn(height: usize, width: usize, mut f: impl FnMut(usize, usize) -> DataType) -> Self {
        let mut data = Vec::with_capacity(height * width);
        for col in 0..width {
            for row in 0..height {
                data.push(f(row, col));
            }
        }
        Mat {
            height,
            width,
            data,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// True when the matrix has no rows or no columns.
    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    pub fn as_slice(&self) -> &[DataType] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [DataType] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<DataType> {
        self.data
    }

    /// Column `col` as a contiguous slice.
    pub fn col(&self, col: usize) -> &[DataType] {
        &self.data[col * self.height..(col + 1) * self.height]
    }

    pub fn col_mut(&mut self, col: usize) -> &mut [DataType] {
        &mut self.data[col * self.height..(col + 1) * self.height]
    }

    /// Read-only view of the whole matrix.
    pub fn view(&self) -> MatRef<'_> {
        MatRef {
            height: self.height,
            width: self.width,
            data: &self.data,
        }
    }

    /// Mutable view of the whole matrix.
    pub fn view_mut(&mut self) -> MatMut<'_> {
        MatMut {
            height: self.height,
            width: self.width,
            data: &mut self.data,
        }
    }

    /// Read-only view of the columns in `cols`.
    pub fn columns(&self, cols: Range<usize>) -> Result<MatRef<'_>> {
        self.view().columns(cols)
    }

    /// Mutable view of the columns in `cols`.
    pub fn columns_mut(&mut self, cols: Range<usize>) -> Result<MatMut<'_>> {
        self.view_mut().columns_mut(cols)
    }

    /// Change dimensions, zero-filling the storage.
    pub fn resize(&mut self, height: usize, width: usize) {
        self.height = height;
        self.width = width;
        self.data.clear();
        self.data.resize(height * width, 0.0);
    }

    /// Multiply every entry by `alpha`. A zero `alpha` clears the matrix.
    pub fn scale(&mut self, alpha: DataType) {
        self.view_mut().scale(alpha);
    }

    pub fn fill(&mut self, value: DataType) {
        self.data.fill(value);
    }
}

impl Index<(usize, usize)> for Mat {
    type Output = DataType;

    fn index(&self, (row, col): (usize, usize)) -> &DataType {
        &self.data[col * self.height + row]
    }
}

impl IndexMut<(usize, usize)> for Mat {
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut DataType {
        &mut self.data[col * self.height + row]
    }
}

/// Read-only column-major view.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    height: usize,
    width: usize,
    data: &'a [DataType],
}

impl<'a> MatRef<'a> {
    /// View `data` as a `height x width` column-major matrix.
    pub fn new(height: usize, width: usize, data: &'a [DataType]) -> Result<Self> {
        check_len(height, width, data.len())?;
        Ok(MatRef {
            height,
            width,
            data,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    pub fn as_slice(&self) -> &'a [DataType] {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> DataType {
        self.data[col * self.height + row]
    }

    pub fn col(&self, col: usize) -> &'a [DataType] {
        &self.data[col * self.height..(col + 1) * self.height]
    }

    pub fn columns(&self, cols: Range<usize>) -> Result<MatRef<'a>> {
        check_columns(&cols, self.width)?;
        Ok(MatRef {
            height: self.height,
            width: cols.end - cols.start,
            data: &self.data[cols.start * self.height..cols.end * self.height],
        })
    }

    /// Reinterpret the same storage with new dimensions.
    pub fn reshape(self, height: usize, width: usize) -> Result<MatRef<'a>> {
        MatRef::new(height, width, self.data)
    }

    pub fn to_mat(&self) -> Mat {
        Mat {
            height: self.height,
            width: self.width,
            data: self.data.to_vec(),
        }
    }
}

/// Mutable column-major view.
#[derive(Debug)]
pub struct MatMut<'a> {
    height: usize,
    width: usize,
    data: &'a mut [DataType],
}

impl<'a> MatMut<'a> {
    pub fn new(height: usize, width: usize, data: &'a mut [DataType]) -> Result<Self> {
        check_len(height, width, data.len())?;
        Ok(MatMut {
            height,
            width,
            data,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    pub fn as_slice(&self) -> &[DataType] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [DataType] {
        &mut *self.data
    }

    /// Reborrow as a read-only view.
    pub fn rb(&self) -> MatRef<'_> {
        MatRef {
            height: self.height,
            width: self.width,
            data: &*self.data,
        }
    }

    /// Reborrow as a shorter-lived mutable view.
    pub fn rb_mut(&mut self) -> MatMut<'_> {
        MatMut {
            height: self.height,
            width: self.width,
            data: &mut *self.data,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> DataType {
        self.data[col * self.height + row]
    }

    pub fn set(&mut self, row: usize, col: usize, value: DataType) {
        self.data[col * self.height + row] = value;
    }

    pub fn col(&self, col: usize) -> &[DataType] {
        &self.data[col * self.height..(col + 1) * self.height]
    }

    pub fn col_mut(&mut self, col: usize) -> &mut [DataType] {
        &mut self.data[col * self.height..(col + 1) * self.height]
    }

    pub fn columns_mut(self, cols: Range<usize>) -> Result<MatMut<'a>> {
        check_columns(&cols, self.width)?;
        let height = self.height;
        Ok(MatMut {
            height,
            width: cols.end - cols.start,
            data: &mut self.data[cols.start * height..cols.end * height],
        })
    }

    /// Reinterpret the same storage with new dimensions.
    pub fn reshape(self, height: usize, width: usize) -> Result<MatMut<'a>> {
        MatMut::new(height, width, self.data)
    }

    /// Multiply every entry by `alpha`. A zero `alpha` clears the view so
    /// that stale NaN/Inf values do not survive a reset.
    pub fn scale(&mut self, alpha: DataType) {
        if alpha == 0.0 {
            self.data.fill(0.0);
        } else if alpha != 1.0 {
            self.data.iter_mut().for_each(|v| *v *= alpha);
        }
    }

    pub fn fill(&mut self, value: DataType) {
        self.data.fill(value);
    }
}
