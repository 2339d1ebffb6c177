// GEMM on local column-major matrices
//
//   C = alpha * op(A) * op(B) + beta * C
//
// with op(X) = X or X^T. This is the only dense kernel the portable
// convolution path needs: im2col turns every convolution into one of these
// per mini-batch sample.
//
// beta == 0 overwrites C (stale contents, NaN included, are discarded);
// beta == 1 accumulates into C.

use crate::error::{Error, Result};
use crate::matrix::{MatMut, MatRef};
use crate::shape::Shape;
use crate::DataType;

/// Whether a GEMM operand is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    Normal,
    Trans,
}

impl Transpose {
    /// Dimensions of op(X) for a stored `height x width` matrix.
    fn apply(self, height: usize, width: usize) -> (usize, usize) {
        match self {
            Transpose::Normal => (height, width),
            Transpose::Trans => (width, height),
        }
    }
}

/// General matrix multiply with an `(alpha, beta)` scale pair.
pub fn gemm(
    trans_a: Transpose,
    trans_b: Transpose,
    alpha: DataType,
    a: MatRef<'_>,
    b: MatRef<'_>,
    beta: DataType,
    mut c: MatMut<'_>,
) -> Result<()> {
    let (m, k1) = trans_a.apply(a.height(), a.width());
    let (k2, n) = trans_b.apply(b.height(), b.width());
    if k1 != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
    }
    if c.height() != m || c.width() != n {
        return Err(Error::ShapeMismatch {
            expected: Shape::from((m, n)),
            got: Shape::from((c.height(), c.width())),
        });
    }

    c.scale(beta);
    if alpha == 0.0 || k1 == 0 {
        return Ok(());
    }

    let k = k1;
    let lda = a.height();
    let ldb = b.height();
    let a = a.as_slice();
    let b = b.as_slice();
    let b_at = |p: usize, j: usize| match trans_b {
        Transpose::Normal => b[j * ldb + p],
        Transpose::Trans => b[p * ldb + j],
    };
    let out = c.as_mut_slice();

    match trans_a {
        // Column j of C is a linear combination of the columns of A.
        Transpose::Normal => {
            for j in 0..n {
                let c_col = &mut out[j * m..(j + 1) * m];
                for p in 0..k {
                    let scale = alpha * b_at(p, j);
                    if scale == 0.0 {
                        continue;
                    }
                    let a_col = &a[p * lda..p * lda + m];
                    for (ci, ai) in c_col.iter_mut().zip(a_col) {
                        *ci += ai * scale;
                    }
                }
            }
        }
        // Rows of op(A) are stored columns of A: dot products.
        Transpose::Trans => {
            for j in 0..n {
                for i in 0..m {
                    let a_row = &a[i * lda..i * lda + k];
                    let mut acc: DataType = 0.0;
                    for (p, ap) in a_row.iter().enumerate() {
                        acc += ap * b_at(p, j);
                    }
                    out[j * m + i] += alpha * acc;
                }
            }
        }
    }
    Ok(())
}
