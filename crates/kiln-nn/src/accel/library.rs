// Native convolution library contract
//
// The accelerator strategy talks to its vendor library through this trait,
// which mirrors the descriptor-based API such libraries expose:
//
//   - opaque descriptor handles (filter, convolution, tensor) with explicit
//     create / set / get / destroy calls; handles are not reference counted
//   - algorithm discovery (`find_*`) returning every candidate the library
//     benchmarked, with its status, workspace need and determinism
//   - compute calls with an (alpha, beta) pair:
//       dst = alpha * op(...) + beta * dst
//
// Buffers are local host slices in NCHW order (one contiguous sample after
// the other); an implementation bound to device memory stages them.

use std::fmt;

use kiln_core::{DataType, Error, Result};

/// Element type a descriptor declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeDataType {
    Float,
    Double,
}

/// Memory layout a filter descriptor declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorFormat {
    Nchw,
    Nhwc,
}

/// Whether the kernel is flipped (true convolution) or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvolutionMode {
    Convolution,
    CrossCorrelation,
}

/// Properties of a filter descriptor: `[K, C / groups, *window]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterParams {
    pub data_type: NativeDataType,
    pub format: TensorFormat,
    pub dims: Vec<usize>,
}

/// Properties of a convolution descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConvolutionParams {
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub mode: ConvolutionMode,
    pub data_type: NativeDataType,
    pub groups: usize,
}

/// Properties of a tensor descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorParams {
    pub data_type: NativeDataType,
    pub dims: Vec<usize>,
    pub strides: Vec<usize>,
}

impl TensorParams {
    /// Fully packed row-major float tensor of `dims`.
    pub fn packed(dims: Vec<usize>) -> Self {
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        TensorParams {
            data_type: NativeDataType::Float,
            dims,
            strides,
        }
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }
}

/// One benchmarked algorithm returned by a `find_*` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmCandidate<A> {
    pub algo: A,
    /// The library managed to run this algorithm.
    pub succeeded: bool,
    /// Scratch memory the algorithm needs.
    pub workspace_bytes: usize,
    /// Bitwise reproducible across runs.
    pub deterministic: bool,
}

/// Pick the first usable candidate. Candidates arrive ordered from fastest
/// to slowest; a candidate is usable when it ran successfully, fits in
/// `workspace_limit` and, if `deterministic` is requested, is deterministic.
pub fn select_algorithm<A: Copy + fmt::Debug>(
    call: &'static str,
    candidates: &[AlgorithmCandidate<A>],
    workspace_limit: usize,
    deterministic: bool,
) -> Result<A> {
    candidates
        .iter()
        .find(|c| {
            c.succeeded
                && c.workspace_bytes <= workspace_limit
                && (!deterministic || c.deterministic)
        })
        .map(|c| c.algo)
        .ok_or_else(|| {
            Error::native(
                call,
                format!(
                    "no suitable algorithm among {} candidates (workspace limit {} bytes, deterministic {})",
                    candidates.len(),
                    workspace_limit,
                    deterministic
                ),
            )
        })
}

/// A descriptor-based convolution library.
pub trait ConvLibrary: fmt::Debug + Send + Sync + 'static {
    type Filter: Copy + fmt::Debug + PartialEq + Send + Sync;
    type Convolution: Copy + fmt::Debug + PartialEq + Send + Sync;
    type Tensor: Copy + fmt::Debug + PartialEq + Send + Sync;
    type FwdAlgo: Copy + fmt::Debug + PartialEq + Send + Sync;
    type BwdDataAlgo: Copy + fmt::Debug + PartialEq + Send + Sync;
    type BwdFilterAlgo: Copy + fmt::Debug + PartialEq + Send + Sync;

    fn create_filter(&self) -> Result<Self::Filter>;
    fn set_filter(&self, desc: Self::Filter, params: &FilterParams) -> Result<()>;
    fn get_filter(&self, desc: Self::Filter) -> Result<FilterParams>;
    fn destroy_filter(&self, desc: Self::Filter) -> Result<()>;

    fn create_convolution(&self) -> Result<Self::Convolution>;
    fn set_convolution(&self, desc: Self::Convolution, params: &ConvolutionParams) -> Result<()>;
    fn get_convolution(&self, desc: Self::Convolution) -> Result<ConvolutionParams>;
    fn destroy_convolution(&self, desc: Self::Convolution) -> Result<()>;

    fn create_tensor(&self) -> Result<Self::Tensor>;
    fn set_tensor(&self, desc: Self::Tensor, params: &TensorParams) -> Result<()>;
    fn get_tensor(&self, desc: Self::Tensor) -> Result<TensorParams>;
    fn destroy_tensor(&self, desc: Self::Tensor) -> Result<()>;

    /// Benchmark forward algorithms for `y = conv(x, w)`.
    fn find_forward_algorithms(
        &self,
        x: Self::Tensor,
        w: Self::Filter,
        conv: Self::Convolution,
        y: Self::Tensor,
    ) -> Result<Vec<AlgorithmCandidate<Self::FwdAlgo>>>;

    /// Benchmark backward-data algorithms for `dx = conv^T(dy, w)`.
    fn find_backward_data_algorithms(
        &self,
        w: Self::Filter,
        dy: Self::Tensor,
        conv: Self::Convolution,
        dx: Self::Tensor,
    ) -> Result<Vec<AlgorithmCandidate<Self::BwdDataAlgo>>>;

    /// Benchmark backward-filter algorithms for `dw = x (*) dy`.
    fn find_backward_filter_algorithms(
        &self,
        x: Self::Tensor,
        dy: Self::Tensor,
        conv: Self::Convolution,
        dw: Self::Filter,
    ) -> Result<Vec<AlgorithmCandidate<Self::BwdFilterAlgo>>>;

    #[allow(clippy::too_many_arguments)]
    fn convolution_forward(
        &self,
        alpha: DataType,
        x_desc: Self::Tensor,
        x: &[DataType],
        w_desc: Self::Filter,
        w: &[DataType],
        conv: Self::Convolution,
        algo: Self::FwdAlgo,
        workspace_limit: usize,
        beta: DataType,
        y_desc: Self::Tensor,
        y: &mut [DataType],
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_data(
        &self,
        alpha: DataType,
        w_desc: Self::Filter,
        w: &[DataType],
        dy_desc: Self::Tensor,
        dy: &[DataType],
        conv: Self::Convolution,
        algo: Self::BwdDataAlgo,
        workspace_limit: usize,
        beta: DataType,
        dx_desc: Self::Tensor,
        dx: &mut [DataType],
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn convolution_backward_filter(
        &self,
        alpha: DataType,
        x_desc: Self::Tensor,
        x: &[DataType],
        dy_desc: Self::Tensor,
        dy: &[DataType],
        conv: Self::Convolution,
        algo: Self::BwdFilterAlgo,
        workspace_limit: usize,
        beta: DataType,
        dw_desc: Self::Filter,
        dw: &mut [DataType],
    ) -> Result<()>;

    /// `db = alpha * sum_{n, spatial} dy + beta * db`, per channel.
    fn convolution_backward_bias(
        &self,
        alpha: DataType,
        dy_desc: Self::Tensor,
        dy: &[DataType],
        beta: DataType,
        db_desc: Self::Tensor,
        db: &mut [DataType],
    ) -> Result<()>;

    /// `c = alpha * broadcast(a) + beta * c`.
    fn add_tensor(
        &self,
        alpha: DataType,
        a_desc: Self::Tensor,
        a: &[DataType],
        beta: DataType,
        c_desc: Self::Tensor,
        c: &mut [DataType],
    ) -> Result<()>;
}
