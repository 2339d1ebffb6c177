// Convolution and deconvolution layers
//
// A ConvolutionLayer is set up in three phases, once per topology change:
//
//   setup_dims    validate the configuration against the input dims and
//                 derive the output dims and the kernel dims
//   setup_data    bind the kernel (and optional bias) Weights
//   setup_device  choose the execution strategy and let it acquire its
//                 per-layer resources (descriptors, caches)
//
// after which fp_compute / bp_compute run once per mini-batch on local
// column-major matrices holding one sample per column.
//
// The two layer kinds share every primitive; they only differ in which
// primitive plays which role:
//
//   kind            forward           backward data     gradients
//   convolution     convolution       transposed conv   using_transposed = false
//   deconvolution   transposed conv   convolution       using_transposed = true
//
// PARAMETERS:
//
//   weights[0]  kernel  dims from ConvGeometry::kernel_dims, He normal
//   weights[1]  bias    dims [C_out], zeros, only when bias is enabled

use kiln_core::{DataType, Error, MatMut, MatRef, Result, Shape};
use log::{debug, info};

use crate::accel::{AcceleratorStrategy, ConvLibrary, HostConvLibrary};
use crate::config::{AcceleratorConfig, ConvolutionConfig};
use crate::context::ExecutionContext;
use crate::geometry::{validate, ConvGeometry, ConvolutionKind, Device, Direction};
use crate::init::{ConstantInitializer, VarianceScalingInitializer};
use crate::optim::OptimizerFactory;
use crate::strategy::{ConvolutionStrategy, GemmStrategy, GradientTarget};
use crate::weights::Weights;

/// Execution backend requested in [`ConvolutionLayer::setup_device`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backend {
    /// Portable im2col + GEMM on the CPU.
    Gemm,
    /// Accelerator strategy over the host implementation of the
    /// descriptor API.
    Host(AcceleratorConfig),
    /// Accelerator strategy over cuDNN on GPU `ordinal`. Needs the `cudnn`
    /// feature.
    Cudnn {
        ordinal: usize,
        config: AcceleratorConfig,
    },
}

/// An N-dimensional convolution or deconvolution layer.
#[derive(Debug)]
pub struct ConvolutionLayer {
    name: String,
    kind: ConvolutionKind,
    config: ConvolutionConfig,
    frozen: bool,
    geometry: Option<ConvGeometry>,
    weights: Vec<Weights>,
    strategy: Option<Box<dyn ConvolutionStrategy>>,
}

impl ConvolutionLayer {
    pub fn new(name: impl Into<String>, kind: ConvolutionKind, config: ConvolutionConfig) -> Self {
        ConvolutionLayer {
            name: name.into(),
            kind,
            config,
            frozen: false,
            geometry: None,
            weights: Vec::new(),
            strategy: None,
        }
    }

    /// Convolution layer shorthand.
    pub fn convolution(name: impl Into<String>, config: ConvolutionConfig) -> Self {
        Self::new(name, ConvolutionKind::Convolution, config)
    }

    /// Deconvolution layer shorthand.
    pub fn deconvolution(name: impl Into<String>, config: ConvolutionConfig) -> Self {
        Self::new(name, ConvolutionKind::Deconvolution, config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConvolutionKind {
        self.kind
    }

    pub fn config(&self) -> &ConvolutionConfig {
        &self.config
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze or unfreeze the layer. Takes effect on bound weights at the
    /// next `setup_data`.
    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn geometry(&self) -> Option<&ConvGeometry> {
        self.geometry.as_ref()
    }

    pub fn weights(&self) -> &[Weights] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [Weights] {
        &mut self.weights
    }

    pub fn kernel(&self) -> Option<&Weights> {
        self.weights.first()
    }

    pub fn bias(&self) -> Option<&Weights> {
        self.weights.get(1)
    }

    pub fn strategy(&self) -> Option<&dyn ConvolutionStrategy> {
        self.strategy.as_deref()
    }

    fn not_ready(&self, phase: &str) -> Error {
        Error::configuration(&self.name, format!("has not completed {phase}"))
    }

    fn ready_geometry(&self) -> Result<&ConvGeometry> {
        self.geometry.as_ref().ok_or_else(|| self.not_ready("setup_dims"))
    }

    /// Validate the configuration for `input_dims` (`[C_in, *spatial]`) on
    /// `device` and return the derived output dims.
    ///
    /// Any previous geometry and strategy are dropped first, so a failed
    /// call leaves the layer unusable until it is set up again.
    pub fn setup_dims(&mut self, input_dims: &Shape, device: Device) -> Result<Shape> {
        self.geometry = None;
        self.strategy = None;
        let geometry = validate(&self.name, self.kind, &self.config, input_dims, device)?;
        let output_dims = geometry.output_dims().clone();
        self.geometry = Some(geometry);
        Ok(output_dims)
    }

    /// Bind the kernel and bias parameters.
    ///
    /// `weights` are parameters supplied by the model (for example shared
    /// with another layer): the first is used as the kernel, the second as
    /// the bias. Missing ones are created with an optimizer from `factory`.
    pub fn setup_data(&mut self, weights: Vec<Weights>, factory: &dyn OptimizerFactory) -> Result<()> {
        let geometry = self.ready_geometry()?.clone();
        if weights.len() > 2 {
            return Err(Error::configuration(
                &self.name,
                format!(
                    "has an invalid number of weights (expected at most 2, found {})",
                    weights.len()
                ),
            ));
        }
        let mut weights = weights;

        if weights.is_empty() {
            weights.push(
                Weights::new(format!("{}_kernel", self.name))
                    .with_initializer(Box::new(VarianceScalingInitializer::he_normal()))
                    .with_optimizer(factory.create()),
            );
        }
        if geometry.bias_enabled() {
            if weights.len() < 2 {
                weights.push(
                    Weights::new(format!("{}_bias", self.name))
                        .with_initializer(Box::new(ConstantInitializer(0.0)))
                        .with_optimizer(factory.create()),
                );
            }
        } else if weights.len() == 2 {
            debug!(
                "layer \"{}\" has bias disabled, ignoring weights \"{}\"",
                self.name,
                weights[1].name()
            );
            weights.truncate(1);
        }

        let kernel_size = geometry.kernel_size();
        let fan_in = (kernel_size / geometry.output_dims().channels()) as f64;
        let fan_out = (kernel_size / geometry.input_dims().channels()) as f64;
        let kernel = &mut weights[0];
        if let Some(vs) = kernel
            .initializer_mut()
            .and_then(|init| init.as_variance_scaling_mut())
        {
            vs.set_fan_in(fan_in);
            vs.set_fan_out(fan_out);
        }
        kernel.set_dims(geometry.kernel_dims().clone());
        kernel.setup()?;
        if let Some(bias) = weights.get_mut(1) {
            bias.set_dims(Shape::new(vec![geometry.output_dims().channels()]));
            bias.setup()?;
        }

        for w in &mut weights {
            if self.frozen {
                w.freeze();
            } else {
                w.unfreeze();
            }
            if w.is_frozen() != self.frozen {
                return Err(Error::configuration(
                    &self.name,
                    format!(
                        "failed to {} weights \"{}\"",
                        if self.frozen { "freeze" } else { "unfreeze" },
                        w.name()
                    ),
                ));
            }
        }

        self.weights = weights;
        Ok(())
    }

    /// Install an execution strategy and let it acquire its resources.
    pub fn setup_strategy(&mut self, mut strategy: Box<dyn ConvolutionStrategy>) -> Result<()> {
        let geometry = self.ready_geometry()?;
        if strategy.device() != geometry.device() {
            return Err(Error::configuration(
                &self.name,
                format!(
                    "was set up for {} but the execution strategy runs on {}",
                    geometry.device(),
                    strategy.device()
                ),
            ));
        }
        strategy.prepare(geometry)?;
        debug!("layer \"{}\" uses {:?}", self.name, strategy);
        self.strategy = Some(strategy);
        Ok(())
    }

    /// Accelerator strategy over an arbitrary descriptor library.
    pub fn setup_accelerator<L: ConvLibrary>(&mut self, library: L, config: AcceleratorConfig) -> Result<()> {
        self.setup_strategy(Box::new(AcceleratorStrategy::new(library, config)))
    }

    pub fn setup_device(&mut self, backend: Backend) -> Result<()> {
        match backend {
            Backend::Gemm => self.setup_strategy(Box::new(GemmStrategy::new())),
            Backend::Host(config) => self.setup_accelerator(HostConvLibrary::new(), config),
            Backend::Cudnn { ordinal, config } => self.setup_cudnn(ordinal, config),
        }
    }

    #[cfg(feature = "cudnn")]
    fn setup_cudnn(&mut self, ordinal: usize, config: AcceleratorConfig) -> Result<()> {
        let library = crate::accel::CudnnLibrary::new(ordinal)?;
        info!("layer \"{}\" bound to cuDNN on cuda:{ordinal}", self.name);
        self.setup_accelerator(library, config)
    }

    #[cfg(not(feature = "cudnn"))]
    fn setup_cudnn(&mut self, ordinal: usize, _config: AcceleratorConfig) -> Result<()> {
        info!(
            "layer \"{}\" requested cuDNN on cuda:{ordinal} in a build without it",
            self.name
        );
        Err(Error::UnsupportedPlatform { feature: "cuDNN" })
    }

    /// Borrow everything a compute call needs.
    fn parts(&mut self) -> Result<(&ConvGeometry, &mut dyn ConvolutionStrategy, &mut [Weights])> {
        let not_ready = |phase: &str| Error::configuration(&self.name, format!("has not completed {phase}"));
        let geometry = self.geometry.as_ref().ok_or_else(|| not_ready("setup_dims"))?;
        let strategy = self
            .strategy
            .as_deref_mut()
            .ok_or_else(|| not_ready("setup_device"))?;
        if self.weights.is_empty() {
            return Err(not_ready("setup_data"));
        }
        Ok((geometry, strategy, &mut self.weights))
    }

    /// `output = conv(input, kernel)` in `direction`.
    pub fn apply_convolution(&mut self, direction: Direction, input: MatRef<'_>, output: MatMut<'_>) -> Result<()> {
        let (geometry, strategy, weights) = self.parts()?;
        strategy.apply_convolution(geometry, direction, weights[0].view(), input, output)
    }

    /// `output = conv^T(input, kernel)` in `direction`.
    pub fn apply_transposed_convolution(
        &mut self,
        direction: Direction,
        input: MatRef<'_>,
        output: MatMut<'_>,
    ) -> Result<()> {
        let (geometry, strategy, weights) = self.parts()?;
        strategy.apply_transposed_convolution(geometry, direction, weights[0].view(), input, output)
    }

    /// `output += bias_scaling_factor * bias`, per channel.
    pub fn apply_bias(&mut self, output: MatMut<'_>) -> Result<()> {
        let (geometry, strategy, weights) = self.parts()?;
        match weights.get(1) {
            Some(bias) if geometry.bias_enabled() => strategy.apply_bias(geometry, bias.view(), output),
            _ => Ok(()),
        }
    }

    /// Accumulate kernel and bias gradients into the optimizers' buffers.
    ///
    /// Frozen weights, and weights without an optimizer, get no gradient.
    pub fn compute_gradients(
        &mut self,
        ctx: &dyn ExecutionContext,
        using_transposed: bool,
        input: MatRef<'_>,
        grad_wrt_output: MatRef<'_>,
    ) -> Result<()> {
        let mini_batch_size = ctx.effective_mini_batch_size();
        if mini_batch_size == 0 {
            return Err(Error::configuration(
                &self.name,
                "got an effective mini-batch size of 0",
            ));
        }
        let (geometry, strategy, weights) = self.parts()?;
        let (kernel, rest) = weights
            .split_first_mut()
            .ok_or_else(|| Error::msg("kernel weights missing"))?;
        let kernel = gradient_target(kernel, mini_batch_size)?;
        let bias = match rest.first_mut() {
            Some(bias) if geometry.bias_enabled() => gradient_target(bias, mini_batch_size)?,
            _ => None,
        };
        strategy.compute_gradients(geometry, using_transposed, input, grad_wrt_output, kernel, bias)
    }

    /// Forward propagation: the layer's forward primitive, then the bias.
    pub fn fp_compute(&mut self, input: MatRef<'_>, mut output: MatMut<'_>) -> Result<()> {
        match self.kind {
            ConvolutionKind::Convolution => {
                self.apply_convolution(Direction::Forward, input, output.rb_mut())?
            }
            ConvolutionKind::Deconvolution => {
                self.apply_transposed_convolution(Direction::Forward, input, output.rb_mut())?
            }
        }
        self.apply_bias(output)
    }

    /// Backward propagation: error signal for the layer input, then the
    /// parameter gradients.
    pub fn bp_compute(
        &mut self,
        ctx: &dyn ExecutionContext,
        input: MatRef<'_>,
        grad_wrt_output: MatRef<'_>,
        grad_wrt_input: MatMut<'_>,
    ) -> Result<()> {
        match self.kind {
            ConvolutionKind::Convolution => {
                self.apply_transposed_convolution(Direction::Backward, grad_wrt_output, grad_wrt_input)?;
                self.compute_gradients(ctx, false, input, grad_wrt_output)
            }
            ConvolutionKind::Deconvolution => {
                self.apply_convolution(Direction::Backward, grad_wrt_output, grad_wrt_input)?;
                self.compute_gradients(ctx, true, input, grad_wrt_output)
            }
        }
    }

    /// Human-readable summary of the configuration, in display order.
    pub fn description(&self) -> Vec<(String, String)> {
        fn join(values: &[i64]) -> String {
            values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
        }
        let c = &self.config;
        vec![
            ("Convolution dimensions".to_string(), join(c.kernel_dims())),
            ("Strides".to_string(), join(c.strides())),
            ("Pads".to_string(), join(c.pads())),
            ("Dilations".to_string(), join(c.dilations())),
            ("Groups".to_string(), c.groups().to_string()),
            (
                "Bias".to_string(),
                if c.bias_enabled() { "enabled" } else { "disabled" }.to_string(),
            ),
        ]
    }

    /// Deep copy: weights, native descriptors and algorithm caches.
    pub fn try_clone(&self) -> Result<Self> {
        let strategy = match &self.strategy {
            Some(s) => Some(s.try_clone_box()?),
            None => None,
        };
        Ok(ConvolutionLayer {
            name: self.name.clone(),
            kind: self.kind,
            config: self.config.clone(),
            frozen: self.frozen,
            geometry: self.geometry.clone(),
            weights: self.weights.clone(),
            strategy,
        })
    }
}

fn gradient_target(weights: &mut Weights, mini_batch_size: usize) -> Result<Option<GradientTarget<'_>>> {
    let Some(optimizer) = weights.optimizer_mut() else {
        return Ok(None);
    };
    let buffer = optimizer.gradient_buffer(true)?;
    let values = buffer.values;
    Ok(Some(GradientTarget {
        dst_scale: buffer.dst_scale,
        gradient_scale: buffer.gradient_scale / mini_batch_size as DataType,
        values: values.view_mut(),
    }))
}
