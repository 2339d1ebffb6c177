//! # kiln-nn
//!
//! N-dimensional convolution and deconvolution layers for Kiln.
//!
//! A [`ConvolutionLayer`] validates its configuration against the input
//! dims, binds its kernel and bias [`Weights`], and runs its four
//! primitives through a [`ConvolutionStrategy`] chosen once per device:
//!
//! 1. **GemmStrategy**: portable CPU path: im2col, GEMM and an additive
//!    col2im fold, with compensated bias-gradient sums
//! 2. **AcceleratorStrategy**: a descriptor-based native library
//!    ([`accel::ConvLibrary`]) with scoped descriptors and per-batch-width
//!    algorithm caches; cuDNN is available behind the `cudnn` feature
//!
//! Gradients go into buffers owned by each weight's [`Optimizer`], scaled
//! by the `(dst_scale, gradient_scale)` pair it hands out.

pub mod accel;
pub mod algo_cache;
pub mod config;
pub mod context;
pub mod conv;
pub mod geometry;
pub mod init;
pub mod optim;
pub mod strategy;
pub mod weights;

pub use accel::{AcceleratorStrategy, HostConvLibrary};
pub use algo_cache::AlgorithmCache;
pub use config::{AcceleratorConfig, ConvolutionConfig};
pub use context::{ExecutionContext, TrainingContext};
pub use conv::{Backend, ConvolutionLayer};
pub use geometry::{validate, ConvGeometry, ConvolutionKind, Device, Direction};
pub use init::{ConstantInitializer, Initializer, Sampling, VarianceScaling, VarianceScalingInitializer};
pub use optim::{FixedScaleOptimizer, GradientBuffer, Optimizer, OptimizerFactory, Sgd};
pub use strategy::{ConvolutionStrategy, GemmStrategy, GradientTarget};
pub use weights::Weights;
