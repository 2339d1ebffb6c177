// Execution strategies
//
// A ConvolutionStrategy runs the four primitive operations of a convolution
// layer on local column-major matrices (one sample per column):
//
//   apply_convolution             output  = conv(input, kernel)
//   apply_transposed_convolution  output  = conv^T(input, kernel)
//   apply_bias                    output += bias_scaling_factor * bias
//   compute_gradients             kernel / bias gradient accumulation
//
// The strategy is chosen once, when the layer is set up for a device, and
// stored as a boxed trait object. Two implementations exist:
//
//   GemmStrategy         portable CPU path (im2col + GEMM + col2im)
//   AcceleratorStrategy  native descriptor-based convolution library
//
// Every operation is a no-op when the local input or output partition is
// empty. Gradient targets are still decayed by their dst_scale in that case
// so that a later cross-worker reduction sees consistent buffers.
//
// `using_transposed` in compute_gradients is true when the layer's forward
// pass was a transposed convolution (deconvolution); it swaps which operand
// is unfolded and which plays the "other" GEMM operand.

pub mod gemm;

use std::fmt;

use kiln_core::{DataType, Error, MatMut, MatRef, Result, Shape};

use crate::geometry::{ConvGeometry, Device, Direction};

pub use gemm::GemmStrategy;

/// A local activation matrix must hold `samples` whole samples of `dims`.
pub(crate) fn check_samples(dims: &Shape, height: usize, width: usize, samples: usize) -> Result<()> {
    if height != dims.elem_count() || width != samples {
        return Err(Error::ShapeMismatch {
            expected: Shape::from((dims.elem_count(), samples)),
            got: Shape::from((height, width)),
        });
    }
    Ok(())
}

/// Destination of a gradient computation:
/// `values = dst_scale * values + gradient_scale * gradient`.
///
/// `gradient_scale` already includes the division by the effective
/// mini-batch size.
#[derive(Debug)]
pub struct GradientTarget<'a> {
    pub dst_scale: DataType,
    pub gradient_scale: DataType,
    pub values: MatMut<'a>,
}

impl GradientTarget<'_> {
    /// Apply the decay half of the update only.
    pub fn decay(&mut self) {
        self.values.scale(self.dst_scale);
    }
}

/// Executes the primitive operations of a convolution layer.
pub trait ConvolutionStrategy: fmt::Debug + Send {
    /// Device this strategy computes on.
    fn device(&self) -> Device;

    /// Acquire whatever per-layer resources the strategy needs. Called once
    /// after shape validation.
    fn prepare(&mut self, geometry: &ConvGeometry) -> Result<()>;

    /// `output = conv(input, kernel)`, overwriting `output`.
    fn apply_convolution(
        &mut self,
        geometry: &ConvGeometry,
        direction: Direction,
        kernel: MatRef<'_>,
        input: MatRef<'_>,
        output: MatMut<'_>,
    ) -> Result<()>;

    /// `output = conv^T(input, kernel)`, overwriting `output`.
    fn apply_transposed_convolution(
        &mut self,
        geometry: &ConvGeometry,
        direction: Direction,
        kernel: MatRef<'_>,
        input: MatRef<'_>,
        output: MatMut<'_>,
    ) -> Result<()>;

    /// Add the per-channel bias to a layer output.
    fn apply_bias(
        &mut self,
        geometry: &ConvGeometry,
        bias: MatRef<'_>,
        output: MatMut<'_>,
    ) -> Result<()>;

    /// Accumulate kernel and bias gradients from the layer input and the
    /// gradient with respect to the layer output.
    fn compute_gradients(
        &mut self,
        geometry: &ConvGeometry,
        using_transposed: bool,
        input: MatRef<'_>,
        grad_wrt_output: MatRef<'_>,
        kernel: Option<GradientTarget<'_>>,
        bias: Option<GradientTarget<'_>>,
    ) -> Result<()>;

    /// Deep copy, including any native resources.
    fn try_clone_box(&self) -> Result<Box<dyn ConvolutionStrategy>>;
}
