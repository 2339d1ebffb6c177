// Shape validation and derived convolution geometry
//
// `validate` checks a ConvolutionConfig against the per-sample input dims
// `[C_in, *spatial_in]` and derives everything the execution strategies
// need: output dims, full kernel dims, and usize copies of the window
// parameters. Checks run in a fixed order and stop at the first failure:
//
//   1. output channels >= 1
//   2. groups >= 1
//   3. groups divides both channel counts
//   4. one kernel dim (>= 1) per spatial axis
//   5. one pad (>= 0) per spatial axis
//   6. one stride (>= 1) per spatial axis
//   7. one dilation (>= 1) per spatial axis
//   8. the portable CPU path has no dilation and no groups
//
// Output size per spatial axis:
//
//   convolution:   floor((in + 2p - d(k-1) - 1) / s) + 1
//   deconvolution: (in - 1)s - 2p + d(k-1) + 1
//
// Kernel dims:
//
//   convolution:   [C_out, C_in / groups, *k]
//   deconvolution: [C_in, C_out / groups, *k]

use std::fmt;

use kiln_core::{DataType, Error, Result, Shape};
use log::debug;

use crate::config::ConvolutionConfig;

/// Whether a layer computes a convolution or its transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvolutionKind {
    Convolution,
    Deconvolution,
}

impl ConvolutionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConvolutionKind::Convolution => "convolution",
            ConvolutionKind::Deconvolution => "deconvolution",
        }
    }
}

impl fmt::Display for ConvolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target device of a layer, fixed at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("CPU"),
            Device::Gpu => f.write_str("GPU"),
        }
    }
}

/// Which pass a convolution primitive runs in.
///
/// In the backward pass the operation maps error signals of the layer
/// output back onto the layer input, so the roles of the input and output
/// dims are exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Validated shapes and window parameters of one convolution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvGeometry {
    kind: ConvolutionKind,
    device: Device,
    input_dims: Shape,
    output_dims: Shape,
    kernel_dims: Shape,
    pads: Vec<usize>,
    strides: Vec<usize>,
    dilations: Vec<usize>,
    groups: usize,
    bias_scaling_factor: DataType,
}

impl ConvGeometry {
    pub fn kind(&self) -> ConvolutionKind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Per-sample layer input dims `[C_in, *spatial_in]`.
    pub fn input_dims(&self) -> &Shape {
        &self.input_dims
    }

    /// Per-sample layer output dims `[C_out, *spatial_out]`.
    pub fn output_dims(&self) -> &Shape {
        &self.output_dims
    }

    /// Full kernel dims, channel factors included.
    pub fn kernel_dims(&self) -> &Shape {
        &self.kernel_dims
    }

    /// Spatial part of the kernel dims.
    pub fn spatial_kernel_dims(&self) -> &[usize] {
        self.kernel_dims.dims().get(2..).unwrap_or(&[])
    }

    /// Number of kernel entries (product of all kernel dims).
    pub fn kernel_size(&self) -> usize {
        self.kernel_dims.elem_count()
    }

    pub fn input_size(&self) -> usize {
        self.input_dims.elem_count()
    }

    pub fn output_size(&self) -> usize {
        self.output_dims.elem_count()
    }

    pub fn pads(&self) -> &[usize] {
        &self.pads
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dilations(&self) -> &[usize] {
        &self.dilations
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn bias_enabled(&self) -> bool {
        self.bias_scaling_factor != 0.0
    }

    pub fn bias_scaling_factor(&self) -> DataType {
        self.bias_scaling_factor
    }

    /// `(source, destination)` dims of a convolution primitive run in
    /// `direction`.
    pub fn dims(&self, direction: Direction) -> (&Shape, &Shape) {
        match direction {
            Direction::Forward => (&self.input_dims, &self.output_dims),
            Direction::Backward => (&self.output_dims, &self.input_dims),
        }
    }
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_usize(values: &[i64]) -> Option<Vec<usize>> {
    values.iter().map(|&v| usize::try_from(v).ok()).collect()
}

/// Output extent of one spatial axis, or None when an intermediate term
/// overflows. Inputs are already range-checked (`i, k, s, d >= 1`, `p >= 0`).
fn output_extent(kind: ConvolutionKind, i: i64, k: i64, p: i64, s: i64, d: i64) -> Option<i64> {
    let reach = d.checked_mul(k - 1)?;
    let padding = p.checked_mul(2)?;
    match kind {
        ConvolutionKind::Convolution => {
            let span = i.checked_add(padding)?.checked_sub(reach)?.checked_sub(1)?;
            Some(if span < 0 { 0 } else { span / s + 1 })
        }
        ConvolutionKind::Deconvolution => (i - 1)
            .checked_mul(s)?
            .checked_sub(padding)?
            .checked_add(reach)?
            .checked_add(1),
    }
}

fn volume(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Validate `config` for the layer `name` and derive its geometry.
///
/// Every failure is an [`Error::Configuration`] naming the layer, the
/// violated constraint and the offending values.
pub fn validate(
    name: &str,
    kind: ConvolutionKind,
    config: &ConvolutionConfig,
    input_dims: &Shape,
    device: Device,
) -> Result<ConvGeometry> {
    let err = |message: String| Err(Error::configuration(name, message));

    if input_dims.rank() == 0
        || input_dims.dims().iter().any(|&d| d == 0 || i64::try_from(d).is_err())
        || volume(input_dims.dims()).is_none()
    {
        return err(format!("has invalid input dimensions ({input_dims})"));
    }
    let input_channels = input_dims.channels() as i64;
    let spatial_in = input_dims.spatial();
    let rank = spatial_in.len();
    let output_channels = config.output_channels();
    let groups = config.groups();

    // 1
    if output_channels < 1 {
        return err(format!(
            "has an invalid number of output channels ({output_channels})"
        ));
    }
    // 2
    if groups < 1 {
        return err(format!("has an invalid number of groups ({groups})"));
    }
    // 3
    if input_channels % groups != 0 || output_channels % groups != 0 {
        return err(format!(
            "has {groups} groups, which does not divide the input channels \
             ({input_channels}) or the output channels ({output_channels})"
        ));
    }
    // 4
    let kernel = config.kernel_dims();
    if rank == 0 || kernel.len() != rank || kernel.iter().any(|&k| k < 1) {
        return err(format!(
            "has invalid spatial dimensions for convolution kernel ({}, \
             expected {rank} spatial dimensions)",
            join(kernel)
        ));
    }
    // 5
    let pads = config.pads();
    if pads.len() != rank || pads.iter().any(|&p| p < 0) {
        return err(format!(
            "has invalid convolution pads ({}, expected {rank} spatial dimensions)",
            join(pads)
        ));
    }
    // 6
    let strides = config.strides();
    if strides.len() != rank || strides.iter().any(|&s| s < 1) {
        return err(format!(
            "has invalid convolution strides ({}, expected {rank} spatial dimensions)",
            join(strides)
        ));
    }
    // 7
    let dilations = config.dilations();
    if dilations.len() != rank || dilations.iter().any(|&d| d < 1) {
        return err(format!(
            "has invalid convolution dilations ({}, expected {rank} spatial dimensions)",
            join(dilations)
        ));
    }
    // 8
    if device == Device::Cpu {
        if dilations.iter().any(|&d| d != 1) {
            return err(format!(
                "has non-unit dilation ({}), which is not supported on CPU",
                join(dilations)
            ));
        }
        if groups != 1 {
            return err(format!(
                "has {groups} groups, but only one group is supported on CPU"
            ));
        }
    }

    let mut output_spatial = Vec::with_capacity(rank);
    for axis in 0..rank {
        let (i, k, p, s, d) = (
            spatial_in[axis] as i64,
            kernel[axis],
            pads[axis],
            strides[axis],
            dilations[axis],
        );
        let Some(out) = output_extent(kind, i, k, p, s, d) else {
            return err(format!(
                "overflows computing the output dimension along spatial axis {axis} \
                 (input {i}, kernel {k}, pad {p}, stride {s}, dilation {d})"
            ));
        };
        if out < 1 {
            return err(format!(
                "has invalid output dimension {out} along spatial axis {axis} \
                 (input {i}, kernel {k}, pad {p}, stride {s}, dilation {d})"
            ));
        }
        match usize::try_from(out) {
            Ok(out) => output_spatial.push(out),
            Err(_) => {
                return err(format!(
                    "has output dimension {out} along spatial axis {axis} that does not fit in memory"
                ))
            }
        }
    }

    let c_in = input_channels as usize;
    let c_out = output_channels as usize;
    let g = groups as usize;
    let mut output = vec![c_out];
    output.extend_from_slice(&output_spatial);
    let mut kernel_dims = match kind {
        ConvolutionKind::Convolution => vec![c_out, c_in / g],
        ConvolutionKind::Deconvolution => vec![c_in, c_out / g],
    };
    let (Some(spatial_kernel), Some(pads), Some(strides), Some(dilations)) =
        (to_usize(kernel), to_usize(pads), to_usize(strides), to_usize(dilations))
    else {
        return err(format!(
            "has convolution parameters that do not fit in memory (kernel {}, pads {}, \
             strides {}, dilations {})",
            join(kernel),
            join(pads),
            join(strides),
            join(dilations)
        ));
    };
    kernel_dims.extend_from_slice(&spatial_kernel);
    if volume(&kernel_dims).is_none() {
        return err(format!(
            "has a kernel ({}) whose element count overflows",
            Shape::new(kernel_dims)
        ));
    }
    if volume(&output).is_none() {
        return err(format!(
            "has an output ({}) whose element count overflows",
            Shape::new(output)
        ));
    }

    let geometry = ConvGeometry {
        kind,
        device,
        input_dims: input_dims.clone(),
        output_dims: Shape::new(output),
        kernel_dims: Shape::new(kernel_dims),
        pads,
        strides,
        dilations,
        groups: g,
        bias_scaling_factor: config.bias_scaling_factor(),
    };
    debug!(
        "{kind} layer \"{name}\" on {device}: input {} -> output {}, kernel {}, \
         pads {:?}, strides {:?}, dilations {:?}, groups {g}",
        geometry.input_dims,
        geometry.output_dims,
        geometry.kernel_dims,
        geometry.pads,
        geometry.strides,
        geometry.dilations,
    );
    Ok(geometry)
}
