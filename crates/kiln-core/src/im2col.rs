// im2col / col2im: convolution via matrix multiplication
//
// im2col unfolds every sliding-window patch of one sample into a column:
//
//   columns = im2col(image)   shape: [C * window_volume, output_volume]
//
// Row r = c * window_volume + w holds channel c at window offset w (window
// offsets in row-major order), column p is output position p (row-major over
// the output spatial dims). Out-of-image taps read as zero padding. Both
// matrices are column-major, so one patch is contiguous in memory.
//
// col2im is the adjoint: it scatters the columns back into an image and
// ADDS overlapping contributions, so a pixel covered by several windows
// receives the sum of all of them.
//
// Output spatial size per axis: (image + 2 * pad - window) / stride + 1.
// Dilation is not handled here; the portable convolution path rejects it
// at setup time.

use crate::error::{Error, Result};
use crate::DataType;

/// Advance a row-major multi-index. Returns false once it wraps around.
fn advance(index: &mut [usize], dims: &[usize]) -> bool {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] {
            return true;
        }
        index[axis] = 0;
    }
    false
}

/// Spatial output dims of a window sweep over `image_dims`.
pub fn output_dims(
    image_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Result<Vec<usize>> {
    let rank = image_dims.len();
    if pads.len() != rank || window_dims.len() != rank || strides.len() != rank {
        return Err(Error::msg(format!(
            "im2col: spatial rank {} does not match pads {:?}, window {:?}, strides {:?}",
            rank, pads, window_dims, strides
        )));
    }
    image_dims
        .iter()
        .zip(pads)
        .zip(window_dims.iter().zip(strides))
        .map(|((&img, &pad), (&win, &stride))| {
            if stride == 0 || win == 0 {
                return Err(Error::msg("im2col: window and stride must be positive"));
            }
            (img + 2 * pad)
                .checked_sub(win)
                .map(|span| span / stride + 1)
                .ok_or_else(|| {
                    Error::msg(format!(
                        "im2col: window {win} larger than padded extent {}",
                        img + 2 * pad
                    ))
                })
        })
        .collect()
}

/// Precomputed tap table: for output position p and window offset w, the
/// flat spatial offset into the image, or None when the tap falls into
/// padding. Indexed as `p * window_volume + w`.
struct Taps {
    positions: usize,
    window_volume: usize,
    offsets: Vec<Option<usize>>,
}

impl Taps {
    fn new(
        image_dims: &[usize],
        pads: &[usize],
        window_dims: &[usize],
        strides: &[usize],
    ) -> Result<Self> {
        let out_dims = output_dims(image_dims, pads, window_dims, strides)?;
        let rank = image_dims.len();
        let positions: usize = out_dims.iter().product();
        let window_volume: usize = window_dims.iter().product();

        let mut offsets = Vec::with_capacity(positions * window_volume);
        let mut pos = vec![0usize; rank];
        for _ in 0..positions {
            let mut win = vec![0usize; rank];
            for _ in 0..window_volume {
                let mut offset = 0usize;
                let mut inside = true;
                for axis in 0..rank {
                    let coord = (pos[axis] * strides[axis] + win[axis]) as isize - pads[axis] as isize;
                    if coord < 0 || coord >= image_dims[axis] as isize {
                        inside = false;
                        break;
                    }
                    offset = offset * image_dims[axis] + coord as usize;
                }
                offsets.push(inside.then_some(offset));
                advance(&mut win, window_dims);
            }
            advance(&mut pos, &out_dims);
        }

        Ok(Taps {
            positions,
            window_volume,
            offsets,
        })
    }

    fn check_buffers(
        &self,
        channels: usize,
        image_volume: usize,
        image_len: usize,
        columns_len: usize,
    ) -> Result<()> {
        let expected_columns = channels * self.window_volume * self.positions;
        if image_len != channels * image_volume || columns_len != expected_columns {
            return Err(Error::msg(format!(
                "im2col: buffer sizes image={} columns={} do not match {} channels x {} pixels -> [{} x {}]",
                image_len,
                columns_len,
                channels,
                image_volume,
                channels * self.window_volume,
                self.positions
            )));
        }
        Ok(())
    }
}

/// Unfold one sample `[C, *image_dims]` into `columns`
/// (`[C * window_volume, output_volume]`, column-major). Overwrites `columns`.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    image: &[DataType],
    columns: &mut [DataType],
    channels: usize,
    image_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Result<()> {
    let taps = Taps::new(image_dims, pads, window_dims, strides)?;
    let image_volume: usize = image_dims.iter().product();
    taps.check_buffers(channels, image_volume, image.len(), columns.len())?;

    let wv = taps.window_volume;
    let rows = channels * wv;
    for (p, column) in columns.chunks_exact_mut(rows.max(1)).enumerate().take(taps.positions) {
        let window = &taps.offsets[p * wv..(p + 1) * wv];
        for c in 0..channels {
            let channel = &image[c * image_volume..(c + 1) * image_volume];
            let dst = &mut column[c * wv..(c + 1) * wv];
            for (d, tap) in dst.iter_mut().zip(window) {
                *d = tap.map_or(0.0, |off| channel[off]);
            }
        }
    }
    Ok(())
}

/// Fold `columns` back into one sample `[C, *image_dims]`.
///
/// `image` is cleared first; overlapping window contributions are summed.
#[allow(clippy::too_many_arguments)]
pub fn col2im(
    columns: &[DataType],
    image: &mut [DataType],
    channels: usize,
    image_dims: &[usize],
    pads: &[usize],
    window_dims: &[usize],
    strides: &[usize],
) -> Result<()> {
    let taps = Taps::new(image_dims, pads, window_dims, strides)?;
    let image_volume: usize = image_dims.iter().product();
    taps.check_buffers(channels, image_volume, image.len(), columns.len())?;

    image.fill(0.0);
    let wv = taps.window_volume;
    let rows = channels * wv;
    for (p, column) in columns.chunks_exact(rows.max(1)).enumerate().take(taps.positions) {
        let window = &taps.offsets[p * wv..(p + 1) * wv];
        for c in 0..channels {
            let channel = &mut image[c * image_volume..(c + 1) * image_volume];
            let src = &column[c * wv..(c + 1) * wv];
            for (s, tap) in src.iter().zip(window) {
                if let Some(off) = tap {
                    channel[*off] += s;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_size_formula() -> Result<()> {
        assert_eq!(output_dims(&[5, 7], &[1, 0], &[3, 3], &[2, 1])?, vec![3, 5]);
        assert!(output_dims(&[2], &[0], &[3], &[1]).is_err());
        Ok(())
    }

    #[test]
    fn unfold_2d_with_padding() -> Result<()> {
        // 1 channel, 2x2 image, 2x2 window, pad 1, stride 1 -> 3x3 positions
        let image = [1.0, 2.0, 3.0, 4.0];
        let mut cols = vec![-1.0; 4 * 9];
        im2col(&image, &mut cols, 1, &[2, 2], &[1, 1], &[2, 2], &[1, 1])?;
        // top-left position sees only pixel (0,0) at window offset (1,1)
        assert_eq!(&cols[0..4], &[0.0, 0.0, 0.0, 1.0]);
        // centre position sees the whole image
        assert_eq!(&cols[4 * 4..4 * 5], &[1.0, 2.0, 3.0, 4.0]);
        // bottom-right position sees pixel (1,1) at window offset (0,0)
        assert_eq!(&cols[4 * 8..4 * 9], &[4.0, 0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn unfold_channel_major_rows() -> Result<()> {
        // 2 channels, length-3 signal, window 2, stride 1 -> 2 positions
        let image = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let mut cols = vec![0.0; 4 * 2];
        im2col(&image, &mut cols, 2, &[3], &[0], &[2], &[1])?;
        assert_eq!(cols, vec![1.0, 2.0, 10.0, 20.0, 2.0, 3.0, 20.0, 30.0]);
        Ok(())
    }

    #[test]
    fn fold_accumulates_overlaps() -> Result<()> {
        // window 2, stride 1 over length 3: the middle pixel is covered twice
        let cols = vec![1.0; 2 * 2];
        let mut image = vec![5.0; 3];
        col2im(&cols, &mut image, 1, &[3], &[0], &[2], &[1])?;
        assert_eq!(image, vec![1.0, 2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn fold_is_adjoint_of_unfold() -> Result<()> {
        // <im2col(x), y> == <x, col2im(y)>
        let dims = [4, 5];
        let (pads, win, strides) = ([1, 2], [3, 2], [2, 1]);
        let channels = 2;
        let out = output_dims(&dims, &pads, &win, &strides)?;
        let rows = channels * win.iter().product::<usize>();
        let cols_len = rows * out.iter().product::<usize>();

        let x: Vec<DataType> = (0..channels * 20).map(|i| (i as DataType * 0.37).sin()).collect();
        let y: Vec<DataType> = (0..cols_len).map(|i| (i as DataType * 0.11).cos()).collect();

        let mut ux = vec![0.0; cols_len];
        im2col(&x, &mut ux, channels, &dims, &pads, &win, &strides)?;
        let mut fy = vec![0.0; x.len()];
        col2im(&y, &mut fy, channels, &dims, &pads, &win, &strides)?;

        let lhs: f64 = ux.iter().zip(&y).map(|(a, b)| (*a as f64) * (*b as f64)).sum();
        let rhs: f64 = x.iter().zip(&fy).map(|(a, b)| (*a as f64) * (*b as f64)).sum();
        assert!((lhs - rhs).abs() < 1e-4, "{lhs} vs {rhs}");
        Ok(())
    }

    #[test]
    fn buffer_size_checked() {
        let image = [0.0; 4];
        let mut cols = vec![0.0; 3];
        assert!(im2col(&image, &mut cols, 1, &[2, 2], &[0, 0], &[1, 1], &[1, 1]).is_err());
    }
}
