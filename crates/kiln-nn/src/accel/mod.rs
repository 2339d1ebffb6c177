//! Descriptor-based accelerator path.
//!
//! [`AcceleratorStrategy`] is generic over a [`ConvLibrary`]. Two libraries
//! ship with the crate:
//!
//! - [`HostConvLibrary`], a host implementation of the descriptor API with
//!   real algorithm candidates and workspace accounting, always available;
//! - `CudnnLibrary` (feature `cudnn`), cuDNN through `cudarc`.

pub mod descriptor;
pub mod host;
pub mod library;
pub mod strategy;

#[cfg(feature = "cudnn")]
pub mod cudnn;

pub use descriptor::{ConvolutionDescriptor, Descriptor, FilterDescriptor, TensorDescriptor};
pub use host::{HostAlgorithm, HostConvLibrary, HostStats};
pub use library::{
    select_algorithm, AlgorithmCandidate, ConvLibrary, ConvolutionMode, ConvolutionParams,
    FilterParams, NativeDataType, TensorFormat, TensorParams,
};
pub use strategy::AcceleratorStrategy;

#[cfg(feature = "cudnn")]
pub use cudnn::CudnnLibrary;
