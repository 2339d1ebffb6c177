// Layer and accelerator configuration
//
// ConvolutionConfig carries the already-parsed integer sequences that define
// a convolution: output channels, spatial kernel dims, pads, strides,
// dilations, group count and whether a bias is added. Values are i64 so a
// negative or zero entry survives until the validator can name it.
//
// AcceleratorConfig holds the knobs of the native-library path: the scratch
// workspace cap and whether algorithm selection must be reproducible.

use kiln_core::DataType;

/// Default cap on the scratch workspace handed to native convolution calls.
pub const DEFAULT_WORKSPACE_BYTES: usize = 1 << 30;

/// Environment variable that forces deterministic algorithm selection.
pub const DETERMINISTIC_ENV: &str = "KILN_DETERMINISTIC";

/// Convolution hyper-parameters, immutable once a layer has been set up.
///
/// ```ignore
/// let config = ConvolutionConfig::new(16, vec![3, 3])
///     .with_pads(vec![1, 1])
///     .with_strides(vec![2, 2]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionConfig {
    output_channels: i64,
    kernel_dims: Vec<i64>,
    pads: Vec<i64>,
    strides: Vec<i64>,
    dilations: Vec<i64>,
    groups: i64,
    bias: bool,
}

impl ConvolutionConfig {
    /// A configuration with zero padding, unit strides and dilations, one
    /// group and bias enabled.
    pub fn new(output_channels: i64, kernel_dims: Vec<i64>) -> Self {
        let rank = kernel_dims.len();
        ConvolutionConfig {
            output_channels,
            kernel_dims,
            pads: vec![0; rank],
            strides: vec![1; rank],
            dilations: vec![1; rank],
            groups: 1,
            bias: true,
        }
    }

    pub fn with_pads(mut self, pads: Vec<i64>) -> Self {
        self.pads = pads;
        self
    }

    pub fn with_strides(mut self, strides: Vec<i64>) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_dilations(mut self, dilations: Vec<i64>) -> Self {
        self.dilations = dilations;
        self
    }

    pub fn with_groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn output_channels(&self) -> i64 {
        self.output_channels
    }

    pub fn kernel_dims(&self) -> &[i64] {
        &self.kernel_dims
    }

    pub fn pads(&self) -> &[i64] {
        &self.pads
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn dilations(&self) -> &[i64] {
        &self.dilations
    }

    pub fn groups(&self) -> i64 {
        self.groups
    }

    pub fn bias_enabled(&self) -> bool {
        self.bias
    }

    /// Factor multiplied into the bias term: 1 when enabled, 0 otherwise.
    pub fn bias_scaling_factor(&self) -> DataType {
        if self.bias {
            1.0
        } else {
            0.0
        }
    }
}

/// Settings of the native-library (accelerator) execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorConfig {
    /// Upper bound on the scratch memory of one native call. Algorithms
    /// that need more are never selected.
    pub workspace_bytes: usize,
    /// Restrict algorithm selection to bitwise-reproducible algorithms.
    pub deterministic: bool,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        AcceleratorConfig {
            workspace_bytes: DEFAULT_WORKSPACE_BYTES,
            deterministic: false,
        }
    }
}

impl AcceleratorConfig {
    /// Defaults, with `deterministic` taken from `KILN_DETERMINISTIC`.
    pub fn from_env() -> Self {
        let deterministic = std::env::var(DETERMINISTIC_ENV)
            .ok()
            .and_then(|v| parse_flag(&v))
            .unwrap_or(false);
        AcceleratorConfig {
            deterministic,
            ..Self::default()
        }
    }

    pub fn with_workspace_bytes(mut self, workspace_bytes: usize) -> Self {
        self.workspace_bytes = workspace_bytes;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }
}

/// Parse a boolean switch from an environment value.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_kernel_rank() {
        let c = ConvolutionConfig::new(8, vec![3, 5, 1]);
        assert_eq!(c.pads(), &[0, 0, 0]);
        assert_eq!(c.strides(), &[1, 1, 1]);
        assert_eq!(c.dilations(), &[1, 1, 1]);
        assert_eq!(c.groups(), 1);
        assert!(c.bias_enabled());
        assert_eq!(c.bias_scaling_factor(), 1.0);
    }

    #[test]
    fn bias_disabled_scales_to_zero() {
        let c = ConvolutionConfig::new(8, vec![3]).with_bias(false);
        assert_eq!(c.bias_scaling_factor(), 0.0);
    }

    #[test]
    fn accelerator_defaults() {
        let c = AcceleratorConfig::default();
        assert_eq!(c.workspace_bytes, 1 << 30);
        assert!(!c.deterministic);
    }

    #[test]
    fn flag_parsing() {
        for on in ["1", "true", "YES", " on "] {
            assert_eq!(parse_flag(on), Some(true), "{on}");
        }
        for off in ["0", "false", "No", "off"] {
            assert_eq!(parse_flag(off), Some(false), "{off}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }
}
