//! # kiln-core
//!
//! Leaf primitives shared by the Kiln convolution engine:
//! - [`Error`] / [`ErrorKind`]: the error taxonomy used across the workspace
//! - [`Shape`]: per-sample dimensions, channel axis first
//! - [`Mat`], [`MatRef`], [`MatMut`]: column-major local matrices and views
//! - [`gemm`]: general matrix multiply with transpose flags and a scale pair
//! - [`im2col`] / [`col2im`]: N-dimensional unfold and additive fold
//! - [`KahanSum`]: compensated summation

pub mod error;
pub mod gemm;
pub mod im2col;
pub mod matrix;
pub mod shape;
pub mod summation;

/// Element type of every matrix in Kiln.
pub type DataType = f32;

pub use error::{Error, ErrorKind, Result};
pub use gemm::{gemm, Transpose};
pub use im2col::{col2im, im2col};
pub use matrix::{Mat, MatMut, MatRef};
pub use shape::Shape;
pub use summation::KahanSum;
