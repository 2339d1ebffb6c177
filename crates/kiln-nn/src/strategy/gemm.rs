// Portable convolution: im2col + GEMM
//
// Every operation works one sample (column) at a time, because the unfolded
// patch matrix of a sample is [C * window_volume, positions] and has to be
// rebuilt for each of them.
//
// For a primitive run with source dims [C_s, *S] and destination dims
// [C_d, *D] (see ConvGeometry::dims):
//
//   convolution:  cols = im2col(src)                      [K, M]
//                 dst  = cols^T * kernel                   [M, C_d]
//                 K = kernel_size / C_d, M = |D|
//
//   transposed:   cols = kernel * src^T                    [kernel_size / C_s, |S|]
//                 dst  = col2im(cols)      (additive fold)
//
// A destination column viewed as [M, C_d] is exactly the channel-major
// flattened sample, so no copies are needed around the GEMM calls.
//
// Kernel gradient, accumulated over samples with beta = 1 after one decay:
//
//   standard:    dW += gs * im2col(input) * grad_col        [kernel_size / C_out, C_out]
//   transposed:  dW += gs * im2col(grad) * input_col        [kernel_size / C_in, C_in]
//
// Bias gradient is a per-channel compensated sum over the upstream gradient.

use kiln_core::{
    col2im, gemm, im2col, DataType, Error, KahanSum, Mat, MatMut, MatRef, Result, Shape, Transpose,
};
use rayon::prelude::*;

use super::{check_samples, ConvolutionStrategy, GradientTarget};
use crate::geometry::{ConvGeometry, Device, Direction};

/// im2col/GEMM execution on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct GemmStrategy;

impl GemmStrategy {
    pub fn new() -> Self {
        GemmStrategy
    }
}

/// Per-channel compensated sums of a gradient matrix whose rows are
/// `channels` consecutive blocks of `channel_size` entries.
pub fn channel_sums(gradient: MatRef<'_>, channels: usize, channel_size: usize) -> Vec<DataType> {
    (0..channels)
        .into_par_iter()
        .map(|c| {
            let rows = c * channel_size..(c + 1) * channel_size;
            let mut sum = KahanSum::new();
            for j in 0..gradient.width() {
                sum.extend(&gradient.col(j)[rows.clone()]);
            }
            sum.value()
        })
        .collect()
}

impl ConvolutionStrategy for GemmStrategy {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn prepare(&mut self, _geometry: &ConvGeometry) -> Result<()> {
        Ok(())
    }

    fn apply_convolution(
        &mut self,
        geometry: &ConvGeometry,
        direction: Direction,
        kernel: MatRef<'_>,
        input: MatRef<'_>,
        mut output: MatMut<'_>,
    ) -> Result<()> {
        if input.is_empty() || output.is_empty() {
            return Ok(());
        }
        let (src, dst) = geometry.dims(direction);
        check_samples(src, input.height(), input.width(), input.width())?;
        check_samples(dst, output.height(), output.width(), input.width())?;

        let n = dst.channels();
        let m = dst.elem_count() / n;
        let k = geometry.kernel_size() / n;
        let kernel = kernel.reshape(k, n)?;
        let mut columns = Mat::zeros(k, m);

        for j in 0..input.width() {
            im2col(
                input.col(j),
                columns.as_mut_slice(),
                src.channels(),
                src.spatial(),
                geometry.pads(),
                geometry.spatial_kernel_dims(),
                geometry.strides(),
            )?;
            let out = output.rb_mut().columns_mut(j..j + 1)?.reshape(m, n)?;
            gemm(Transpose::Trans, Transpose::Normal, 1.0, columns.view(), kernel, 0.0, out)?;
        }
        Ok(())
    }

    fn apply_transposed_convolution(
        &mut self,
        geometry: &ConvGeometry,
        direction: Direction,
        kernel: MatRef<'_>,
        input: MatRef<'_>,
        mut output: MatMut<'_>,
    ) -> Result<()> {
        if input.is_empty() || output.is_empty() {
            return Ok(());
        }
        let (src, dst) = geometry.dims(direction);
        check_samples(src, input.height(), input.width(), input.width())?;
        check_samples(dst, output.height(), output.width(), input.width())?;

        let k = src.channels();
        let m = geometry.kernel_size() / k;
        let n = src.elem_count() / k;
        let kernel = kernel.reshape(m, k)?;
        let mut columns = Mat::zeros(m, n);

        for j in 0..input.width() {
            let in_col = input.columns(j..j + 1)?.reshape(n, k)?;
            gemm(
                Transpose::Normal,
                Transpose::Trans,
                1.0,
                kernel,
                in_col,
                0.0,
                columns.view_mut(),
            )?;
            col2im(
                columns.as_slice(),
                output.col_mut(j),
                dst.channels(),
                dst.spatial(),
                geometry.pads(),
                geometry.spatial_kernel_dims(),
                geometry.strides(),
            )?;
        }
        Ok(())
    }

    fn apply_bias(
        &mut self,
        geometry: &ConvGeometry,
        bias: MatRef<'_>,
        mut output: MatMut<'_>,
    ) -> Result<()> {
        if !geometry.bias_enabled() || output.is_empty() {
            return Ok(());
        }
        let dims = geometry.output_dims();
        check_samples(dims, output.height(), output.width(), output.width())?;
        let channel_size = dims.spatial_size();
        let height = output.height();
        let terms: Vec<DataType> = bias
            .as_slice()
            .iter()
            .map(|b| geometry.bias_scaling_factor() * b)
            .collect();
        if terms.len() != dims.channels() {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(vec![dims.channels()]),
                got: Shape::new(vec![terms.len()]),
            });
        }

        // Columns are disjoint, so samples are updated in parallel.
        output
            .as_mut_slice()
            .par_chunks_mut(height)
            .for_each(|column| {
                for (block, term) in column.chunks_mut(channel_size).zip(&terms) {
                    block.iter_mut().for_each(|v| *v += term);
                }
            });
        Ok(())
    }

    fn compute_gradients(
        &mut self,
        geometry: &ConvGeometry,
        using_transposed: bool,
        input: MatRef<'_>,
        grad_wrt_output: MatRef<'_>,
        kernel: Option<GradientTarget<'_>>,
        bias: Option<GradientTarget<'_>>,
    ) -> Result<()> {
        let has_data = !input.is_empty() && !grad_wrt_output.is_empty();
        let in_dims = geometry.input_dims();
        let out_dims = geometry.output_dims();
        if has_data {
            check_samples(in_dims, input.height(), input.width(), input.width())?;
            check_samples(
                out_dims,
                grad_wrt_output.height(),
                grad_wrt_output.width(),
                input.width(),
            )?;
        }

        if let Some(mut target) = bias {
            if !has_data {
                target.decay();
            } else {
                let sums = channel_sums(grad_wrt_output, out_dims.channels(), out_dims.spatial_size());
                let values = target.values.as_mut_slice();
                for (v, sum) in values.iter_mut().zip(sums) {
                    *v = if target.dst_scale == 0.0 {
                        target.gradient_scale * sum
                    } else {
                        target.dst_scale * *v + target.gradient_scale * sum
                    };
                }
            }
        }

        if let Some(mut target) = kernel {
            target.decay();
            if !has_data {
                return Ok(());
            }
            let kernel_size = geometry.kernel_size();
            let window = geometry.spatial_kernel_dims();
            // (unfolded operand dims, other operand, its channel count)
            let (unfold_dims, unfold_src, other, other_dims) = if using_transposed {
                (out_dims, grad_wrt_output, input, in_dims)
            } else {
                (in_dims, input, grad_wrt_output, out_dims)
            };
            let n = other_dims.channels();
            let m = kernel_size / n;
            let k = other_dims.elem_count() / n;
            let mut columns = Mat::zeros(m, k);
            let mut kernel_grad = target.values.reshape(m, n)?;

            for j in 0..input.width() {
                im2col(
                    unfold_src.col(j),
                    columns.as_mut_slice(),
                    unfold_dims.channels(),
                    unfold_dims.spatial(),
                    geometry.pads(),
                    window,
                    geometry.strides(),
                )?;
                let other_col = other.columns(j..j + 1)?.reshape(k, n)?;
                gemm(
                    Transpose::Normal,
                    Transpose::Normal,
                    target.gradient_scale,
                    columns.view(),
                    other_col,
                    1.0,
                    kernel_grad.rb_mut(),
                )?;
            }
        }
        Ok(())
    }

    fn try_clone_box(&self) -> Result<Box<dyn ConvolutionStrategy>> {
        Ok(Box::new(*self))
    }
}
