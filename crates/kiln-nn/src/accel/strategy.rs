use std::sync::Arc;

use kiln_core::{MatMut, MatRef, Result};
use log::debug;

use super::descriptor::{ConvolutionDescriptor, FilterDescriptor, TensorDescriptor};
use super::library::{
    select_algorithm, ConvLibrary, ConvolutionMode, ConvolutionParams, FilterParams,
    NativeDataType, TensorFormat, TensorParams,
};
use crate::algo_cache::AlgorithmCache;
use crate::config::AcceleratorConfig;
use crate::geometry::{ConvGeometry, Device, Direction};
use crate::strategy::{check_samples, ConvolutionStrategy, GradientTarget};

/// Convolution through a descriptor-based native library.
///
/// Owns the filter, convolution and bias descriptors created in `prepare`,
/// the activation tensor descriptors for the current local batch width, and
/// one algorithm cache per operation. Cloning (`try_clone_box`) deep-copies
/// every descriptor and carries the cached algorithms over.
#[derive(Debug)]
pub struct AcceleratorStrategy<L: ConvLibrary> {
    library: Arc<L>,
    config: AcceleratorConfig,
    kernel_desc: FilterDescriptor<L>,
    convolution_desc: ConvolutionDescriptor<L>,
    bias_desc: TensorDescriptor<L>,
    input_desc: TensorDescriptor<L>,
    output_desc: TensorDescriptor<L>,
    tensor_width: Option<usize>,
    forward_algos: AlgorithmCache<L::FwdAlgo>,
    backward_data_algos: AlgorithmCache<L::BwdDataAlgo>,
    backward_filter_algos: AlgorithmCache<L::BwdFilterAlgo>,
}

impl<L: ConvLibrary> AcceleratorStrategy<L> {
    pub fn new(library: L, config: AcceleratorConfig) -> Self {
        Self::with_shared(Arc::new(library), config)
    }

    pub fn with_shared(library: Arc<L>, config: AcceleratorConfig) -> Self {
        AcceleratorStrategy {
            kernel_desc: FilterDescriptor::null(Arc::clone(&library)),
            convolution_desc: ConvolutionDescriptor::null(Arc::clone(&library)),
            bias_desc: TensorDescriptor::null(Arc::clone(&library)),
            input_desc: TensorDescriptor::null(Arc::clone(&library)),
            output_desc: TensorDescriptor::null(Arc::clone(&library)),
            tensor_width: None,
            forward_algos: AlgorithmCache::new("forward"),
            backward_data_algos: AlgorithmCache::new("backward data"),
            backward_filter_algos: AlgorithmCache::new("backward filter"),
            library,
            config,
        }
    }

    pub fn library(&self) -> &L {
        &self.library
    }

    pub fn config(&self) -> &AcceleratorConfig {
        &self.config
    }

    pub fn kernel_descriptor(&self) -> &FilterDescriptor<L> {
        &self.kernel_desc
    }

    pub fn convolution_descriptor(&self) -> &ConvolutionDescriptor<L> {
        &self.convolution_desc
    }

    pub fn bias_descriptor(&self) -> &TensorDescriptor<L> {
        &self.bias_desc
    }

    pub fn forward_algorithms(&self) -> &AlgorithmCache<L::FwdAlgo> {
        &self.forward_algos
    }

    pub fn backward_data_algorithms(&self) -> &AlgorithmCache<L::BwdDataAlgo> {
        &self.backward_data_algos
    }

    pub fn backward_filter_algorithms(&self) -> &AlgorithmCache<L::BwdFilterAlgo> {
        &self.backward_filter_algos
    }

    /// Deep copy: fresh descriptor handles with the same properties, and
    /// the cached algorithms.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(AcceleratorStrategy {
            library: Arc::clone(&self.library),
            config: self.config,
            kernel_desc: self.kernel_desc.try_clone()?,
            convolution_desc: self.convolution_desc.try_clone()?,
            bias_desc: self.bias_desc.try_clone()?,
            input_desc: self.input_desc.try_clone()?,
            output_desc: self.output_desc.try_clone()?,
            tensor_width: self.tensor_width,
            forward_algos: self.forward_algos.clone(),
            backward_data_algos: self.backward_data_algos.clone(),
            backward_filter_algos: self.backward_filter_algos.clone(),
        })
    }

    /// Size the activation descriptors for `width` local samples.
    fn ensure_tensor_descriptors(&mut self, geometry: &ConvGeometry, width: usize) -> Result<()> {
        if self.tensor_width == Some(width) {
            return Ok(());
        }
        self.input_desc
            .set(&TensorParams::packed(geometry.input_dims().with_batch(width).dims().to_vec()))?;
        self.output_desc
            .set(&TensorParams::packed(geometry.output_dims().with_batch(width).dims().to_vec()))?;
        self.tensor_width = Some(width);
        debug!("tensor descriptors resized to local batch width {width}");
        Ok(())
    }

    /// `(source, destination)` activation descriptors for `direction`.
    fn tensors(&self, direction: Direction) -> (&TensorDescriptor<L>, &TensorDescriptor<L>) {
        match direction {
            Direction::Forward => (&self.input_desc, &self.output_desc),
            Direction::Backward => (&self.output_desc, &self.input_desc),
        }
    }
}

impl<L: ConvLibrary> ConvolutionStrategy for AcceleratorStrategy<L> {
    fn device(&self) -> Device {
        Device::Gpu
    }

    fn prepare(&mut self, geometry: &ConvGeometry) -> Result<()> {
        self.kernel_desc.set(&FilterParams {
            data_type: NativeDataType::Float,
            format: TensorFormat::Nchw,
            dims: geometry.kernel_dims().dims().to_vec(),
        })?;
        self.convolution_desc.set(&ConvolutionParams {
            pads: geometry.pads().to_vec(),
            strides: geometry.strides().to_vec(),
            dilations: geometry.dilations().to_vec(),
            mode: ConvolutionMode::CrossCorrelation,
            data_type: NativeDataType::Float,
            groups: geometry.groups(),
        })?;
        if geometry.bias_enabled() {
            // [1, C_out, 1, ...]
            let mut dims = vec![1; geometry.output_dims().rank() + 1];
            dims[1] = geometry.output_dims().channels();
            self.bias_desc.set(&TensorParams::packed(dims))?;
        } else {
            self.bias_desc.release()?;
        }
        self.tensor_width = None;
        debug!(
            "accelerator descriptors ready: kernel {}, workspace cap {} bytes, deterministic {}",
            geometry.kernel_dims(),
            self.config.workspace_bytes,
            self.config.deterministic
        );
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
        let width = input.width();
        let (src, dst) = geometry.dims(direction);
        check_samples(src, input.height(), width, width)?;
        check_samples(dst, output.height(), output.width(), width)?;
        self.ensure_tensor_descriptors(geometry, width)?;

        let lib = &*self.library;
        let (x, y) = self.tensors(direction);
        let (x, y) = (x.handle()?, y.handle()?);
        let w = self.kernel_desc.handle()?;
        let conv = self.convolution_desc.handle()?;
        let config = self.config;
        let algo = self.forward_algos.get_or_try_insert_with(width, || {
            let candidates = lib.find_forward_algorithms(x, w, conv, y)?;
            select_algorithm(
                "find_forward_algorithms",
                &candidates,
                config.workspace_bytes,
                config.deterministic,
            )
        })?;
        lib.convolution_forward(
            1.0,
            x,
            input.as_slice(),
            w,
            kernel.as_slice(),
            conv,
            algo,
            config.workspace_bytes,
            0.0,
            y,
            output.as_mut_slice(),
        )
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
        let width = input.width();
        let (src, dst) = geometry.dims(direction);
        check_samples(src, input.height(), width, width)?;
        check_samples(dst, output.height(), output.width(), width)?;
        self.ensure_tensor_descriptors(geometry, width)?;

        let lib = &*self.library;
        let (dy, dx) = self.tensors(direction);
        let (dy, dx) = (dy.handle()?, dx.handle()?);
        let w = self.kernel_desc.handle()?;
        let conv = self.convolution_desc.handle()?;
        let config = self.config;
        let algo = self.backward_data_algos.get_or_try_insert_with(width, || {
            let candidates = lib.find_backward_data_algorithms(w, dy, conv, dx)?;
            select_algorithm(
                "find_backward_data_algorithms",
                &candidates,
                config.workspace_bytes,
                config.deterministic,
            )
        })?;
        lib.convolution_backward_data(
            1.0,
            w,
            kernel.as_slice(),
            dy,
            input.as_slice(),
            conv,
            algo,
            config.workspace_bytes,
            0.0,
            dx,
            output.as_mut_slice(),
        )
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
        let width = output.width();
        check_samples(geometry.output_dims(), output.height(), width, width)?;
        self.ensure_tensor_descriptors(geometry, width)?;
        self.library.add_tensor(
            geometry.bias_scaling_factor(),
            self.bias_desc.handle()?,
            bias.as_slice(),
            1.0,
            self.output_desc.handle()?,
            output.as_mut_slice(),
        )
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
        if input.is_empty() || grad_wrt_output.is_empty() {
            for mut target in kernel.into_iter().chain(bias) {
                target.decay();
            }
            return Ok(());
        }
        let width = input.width();
        check_samples(geometry.input_dims(), input.height(), width, width)?;
        check_samples(geometry.output_dims(), grad_wrt_output.height(), grad_wrt_output.width(), width)?;
        self.ensure_tensor_descriptors(geometry, width)?;

        let lib = &*self.library;
        let input_desc = self.input_desc.handle()?;
        let output_desc = self.output_desc.handle()?;

        if let Some(mut target) = bias {
            lib.convolution_backward_bias(
                target.gradient_scale,
                output_desc,
                grad_wrt_output.as_slice(),
                target.dst_scale,
                self.bias_desc.handle()?,
                target.values.as_mut_slice(),
            )?;
        }

        if let Some(mut target) = kernel {
            // A transposed forward pass maps the layer output back onto the
            // layer input, so the operands of the filter gradient swap.
            let (x_desc, x, dy_desc, dy) = if using_transposed {
                (output_desc, grad_wrt_output, input_desc, input)
            } else {
                (input_desc, input, output_desc, grad_wrt_output)
            };
            let dw = self.kernel_desc.handle()?;
            let conv = self.convolution_desc.handle()?;
            let config = self.config;
            let algo = self.backward_filter_algos.get_or_try_insert_with(width, || {
                let candidates = lib.find_backward_filter_algorithms(x_desc, dy_desc, conv, dw)?;
                select_algorithm(
                    "find_backward_filter_algorithms",
                    &candidates,
                    config.workspace_bytes,
                    config.deterministic,
                )
            })?;
            lib.convolution_backward_filter(
                target.gradient_scale,
                x_desc,
                x.as_slice(),
                dy_desc,
                dy.as_slice(),
                conv,
                algo,
                config.workspace_bytes,
                target.dst_scale,
                dw,
                target.values.as_mut_slice(),
            )?;
        }
        Ok(())
    }

    fn try_clone_box(&self) -> Result<Box<dyn ConvolutionStrategy>> {
        Ok(Box::new(self.try_clone()?))
    }
}
