// cuDNN binding for the accelerator strategy
//
// Descriptor handles are raw cuDNN pointers wrapped in newtypes. Compute
// calls stage their host buffers through device memory: every operand is
// copied to the GPU, the cuDNN call runs on the device stream, and the
// destination is copied back. The destination is uploaded too because the
// calls blend with `beta * dst`.
//
// cuDNN wants tensors and filters of rank >= 4, so 1-D problems are padded
// with a trailing unit spatial dimension (and pad 0, stride 1, dilation 1).

use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

use cudarc::cudnn::sys;
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr, DevicePtrMut};
use kiln_core::{DataType, Error, Result};
use log::debug;

use super::library::{
    AlgorithmCandidate, ConvLibrary, ConvolutionMode, ConvolutionParams, FilterParams,
    NativeDataType, TensorFormat, TensorParams,
};

const MIN_TENSOR_RANK: usize = 4;
const MIN_SPATIAL_RANK: usize = 2;
const MAX_RANK: usize = 8;

fn check(call: &'static str, status: sys::cudnnStatus_t) -> Result<()> {
    if status == sys::cudnnStatus_t::CUDNN_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(Error::native(call, format!("{status:?}")))
    }
}

fn driver_err(what: &str) -> impl FnOnce(cudarc::driver::DriverError) -> Error + '_ {
    move |e| Error::msg(format!("CUDA {what} failed: {e}"))
}

fn to_c(values: &[usize], min_len: usize, fill: usize) -> Result<Vec<c_int>> {
    let mut out = Vec::with_capacity(values.len().max(min_len));
    for &v in values.iter().chain(std::iter::repeat(&fill)).take(values.len().max(min_len)) {
        out.push(c_int::try_from(v).map_err(|_| Error::msg(format!("dimension {v} overflows a C int")))?);
    }
    Ok(out)
}

fn from_c(values: &[c_int]) -> Vec<usize> {
    values.iter().map(|&v| v.max(0) as usize).collect()
}

fn data_type(t: NativeDataType) -> sys::cudnnDataType_t {
    match t {
        NativeDataType::Float => sys::cudnnDataType_t::CUDNN_DATA_FLOAT,
        NativeDataType::Double => sys::cudnnDataType_t::CUDNN_DATA_DOUBLE,
    }
}

fn native_data_type(t: sys::cudnnDataType_t) -> Result<NativeDataType> {
    match t {
        sys::cudnnDataType_t::CUDNN_DATA_FLOAT => Ok(NativeDataType::Float),
        sys::cudnnDataType_t::CUDNN_DATA_DOUBLE => Ok(NativeDataType::Double),
        other => Err(Error::native("cudnnGetDescriptor", format!("unsupported data type {other:?}"))),
    }
}

macro_rules! handle_newtype {
    ($name:ident, $raw:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($raw);

        // cuDNN descriptors are plain configuration objects; they are only
        // mutated through the owning Descriptor.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}
    };
}

handle_newtype!(CudnnFilter, sys::cudnnFilterDescriptor_t);
handle_newtype!(CudnnConvolution, sys::cudnnConvolutionDescriptor_t);
handle_newtype!(CudnnTensor, sys::cudnnTensorDescriptor_t);

struct RawHandle(sys::cudnnHandle_t);

unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl Drop for RawHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was created by cudnnCreate and is destroyed once.
        let status = unsafe { sys::lib().cudnnDestroy(self.0) };
        if let Err(e) = check("cudnnDestroy", status) {
            log::warn!("{e}");
        }
    }
}

/// cuDNN bound to one CUDA device.
pub struct CudnnLibrary {
    dev: Arc<CudaDevice>,
    handle: RawHandle,
}

impl CudnnLibrary {
    /// Open cuDNN on GPU `ordinal`.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = CudaDevice::new(ordinal).map_err(driver_err("device creation"))?;
        let mut raw: sys::cudnnHandle_t = std::ptr::null_mut();
        // SAFETY: out-pointer to a local handle.
        check("cudnnCreate", unsafe { sys::lib().cudnnCreate(&mut raw) })?;
        let handle = RawHandle(raw);
        // SAFETY: the stream belongs to `dev`, which outlives the handle.
        check("cudnnSetStream", unsafe {
            sys::lib().cudnnSetStream(handle.0, *dev.cu_stream() as sys::cudaStream_t)
        })?;
        debug!("cuDNN opened on cuda:{ordinal}");
        Ok(CudnnLibrary { dev, handle })
    }

    fn upload(&self, data: &[DataType]) -> Result<CudaSlice<DataType>> {
        self.dev.htod_sync_copy(data).map_err(driver_err("host to device copy"))
    }

    fn download(&self, src: &CudaSlice<DataType>, dst: &mut [DataType]) -> Result<()> {
        self.dev
            .dtoh_sync_copy_into(src, dst)
            .map_err(driver_err("device to host copy"))
    }

    fn workspace(&self, bytes: usize, limit: usize) -> Result<Option<CudaSlice<u8>>> {
        if bytes > limit {
            return Err(Error::native(
                "cudnnGetWorkspaceSize",
                format!("algorithm needs {bytes} bytes, limit is {limit}"),
            ));
        }
        if bytes == 0 {
            return Ok(None);
        }
        self.dev
            .alloc_zeros::<u8>(bytes)
            .map(Some)
            .map_err(driver_err("workspace allocation"))
    }
}

fn ptr(slice: &CudaSlice<DataType>) -> *const c_void {
    *slice.device_ptr() as *const c_void
}

fn ptr_mut(slice: &mut CudaSlice<DataType>) -> *mut c_void {
    *slice.device_ptr_mut() as *mut c_void
}

fn workspace_ptr(ws: &mut Option<CudaSlice<u8>>) -> *mut c_void {
    match ws {
        Some(ws) => *ws.device_ptr_mut() as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

fn scalar(v: &DataType) -> *const c_void {
    v as *const DataType as *const c_void
}

fn candidates<A: Copy>(
    perf: impl Iterator<Item = (A, sys::cudnnStatus_t, usize, sys::cudnnDeterminism_t)>,
) -> Vec<AlgorithmCandidate<A>> {
    perf.map(|(algo, status, memory, determinism)| AlgorithmCandidate {
        algo,
        succeeded: status == sys::cudnnStatus_t::CUDNN_STATUS_SUCCESS,
        workspace_bytes: memory,
        deterministic: determinism == sys::cudnnDeterminism_t::CUDNN_DETERMINISTIC,
    })
    .collect()
}

impl ConvLibrary for CudnnLibrary {
    type Filter = CudnnFilter;
    type Convolution = CudnnConvolution;
    type Tensor = CudnnTensor;
    type FwdAlgo = sys::cudnnConvolutionFwdAlgo_t;
    type BwdDataAlgo = sys::cudnnConvolutionBwdDataAlgo_t;
    type BwdFilterAlgo = sys::cudnnConvolutionBwdFilterAlgo_t;

    fn create_filter(&self) -> Result<CudnnFilter> {
        let mut raw = std::ptr::null_mut();
        check("cudnnCreateFilterDescriptor", unsafe {
            sys::lib().cudnnCreateFilterDescriptor(&mut raw)
        })?;
        Ok(CudnnFilter(raw))
    }

    fn set_filter(&self, desc: CudnnFilter, params: &FilterParams) -> Result<()> {
        let dims = to_c(&params.dims, MIN_TENSOR_RANK, 1)?;
        let format = match params.format {
            TensorFormat::Nchw => sys::cudnnTensorFormat_t::CUDNN_TENSOR_NCHW,
            TensorFormat::Nhwc => sys::cudnnTensorFormat_t::CUDNN_TENSOR_NHWC,
        };
        check("cudnnSetFilterNdDescriptor", unsafe {
            sys::lib().cudnnSetFilterNdDescriptor(
                desc.0,
                data_type(params.data_type),
                format,
                dims.len() as c_int,
                dims.as_ptr(),
            )
        })
    }

    fn get_filter(&self, desc: CudnnFilter) -> Result<FilterParams> {
        let mut dt = sys::cudnnDataType_t::CUDNN_DATA_FLOAT;
        let mut format = sys::cudnnTensorFormat_t::CUDNN_TENSOR_NCHW;
        let mut rank: c_int = 0;
        let mut dims = [0 as c_int; MAX_RANK];
        check("cudnnGetFilterNdDescriptor", unsafe {
            sys::lib().cudnnGetFilterNdDescriptor(
                desc.0,
                MAX_RANK as c_int,
                &mut dt,
                &mut format,
                &mut rank,
                dims.as_mut_ptr(),
            )
        })?;
        Ok(FilterParams {
            data_type: native_data_type(dt)?,
            format: if format == sys::cudnnTensorFormat_t::CUDNN_TENSOR_NHWC {
                TensorFormat::Nhwc
            } else {
                TensorFormat::Nchw
            },
            dims: from_c(&dims[..rank as usize]),
        })
    }

    fn destroy_filter(&self, desc: CudnnFilter) -> Result<()> {
        check("cudnnDestroyFilterDescriptor", unsafe {
            sys::lib().cudnnDestroyFilterDescriptor(desc.0)
        })
    }

    fn create_convolution(&self) -> Result<CudnnConvolution> {
        let mut raw = std::ptr::null_mut();
        check("cudnnCreateConvolutionDescriptor", unsafe {
            sys::lib().cudnnCreateConvolutionDescriptor(&mut raw)
        })?;
        Ok(CudnnConvolution(raw))
    }

    fn set_convolution(&self, desc: CudnnConvolution, params: &ConvolutionParams) -> Result<()> {
        let pads = to_c(&params.pads, MIN_SPATIAL_RANK, 0)?;
        let strides = to_c(&params.strides, MIN_SPATIAL_RANK, 1)?;
        let dilations = to_c(&params.dilations, MIN_SPATIAL_RANK, 1)?;
        let mode = match params.mode {
            ConvolutionMode::Convolution => sys::cudnnConvolutionMode_t::CUDNN_CONVOLUTION,
            ConvolutionMode::CrossCorrelation => sys::cudnnConvolutionMode_t::CUDNN_CROSS_CORRELATION,
        };
        check("cudnnSetConvolutionNdDescriptor", unsafe {
            sys::lib().cudnnSetConvolutionNdDescriptor(
                desc.0,
                pads.len() as c_int,
                pads.as_ptr(),
                strides.as_ptr(),
                dilations.as_ptr(),
                mode,
                data_type(params.data_type),
            )
        })?;
        check("cudnnSetConvolutionGroupCount", unsafe {
            sys::lib().cudnnSetConvolutionGroupCount(desc.0, params.groups as c_int)
        })
    }

    fn get_convolution(&self, desc: CudnnConvolution) -> Result<ConvolutionParams> {
        let mut len: c_int = 0;
        let mut pads = [0 as c_int; MAX_RANK];
        let mut strides = [0 as c_int; MAX_RANK];
        let mut dilations = [0 as c_int; MAX_RANK];
        let mut mode = sys::cudnnConvolutionMode_t::CUDNN_CROSS_CORRELATION;
        let mut dt = sys::cudnnDataType_t::CUDNN_DATA_FLOAT;
        check("cudnnGetConvolutionNdDescriptor", unsafe {
            sys::lib().cudnnGetConvolutionNdDescriptor(
                desc.0,
                MAX_RANK as c_int,
                &mut len,
                pads.as_mut_ptr(),
                strides.as_mut_ptr(),
                dilations.as_mut_ptr(),
                &mut mode,
                &mut dt,
            )
        })?;
        let mut groups: c_int = 0;
        check("cudnnGetConvolutionGroupCount", unsafe {
            sys::lib().cudnnGetConvolutionGroupCount(desc.0, &mut groups)
        })?;
        let len = len as usize;
        Ok(ConvolutionParams {
            pads: from_c(&pads[..len]),
            strides: from_c(&strides[..len]),
            dilations: from_c(&dilations[..len]),
            mode: if mode == sys::cudnnConvolutionMode_t::CUDNN_CONVOLUTION {
                ConvolutionMode::Convolution
            } else {
                ConvolutionMode::CrossCorrelation
            },
            data_type: native_data_type(dt)?,
            groups: groups.max(0) as usize,
        })
    }

    fn destroy_convolution(&self, desc: CudnnConvolution) -> Result<()> {
        check("cudnnDestroyConvolutionDescriptor", unsafe {
            sys::lib().cudnnDestroyConvolutionDescriptor(desc.0)
        })
    }

    fn create_tensor(&self) -> Result<CudnnTensor> {
        let mut raw = std::ptr::null_mut();
        check("cudnnCreateTensorDescriptor", unsafe {
            sys::lib().cudnnCreateTensorDescriptor(&mut raw)
        })?;
        Ok(CudnnTensor(raw))
    }

    fn set_tensor(&self, desc: CudnnTensor, params: &TensorParams) -> Result<()> {
        let dims = to_c(&params.dims, MIN_TENSOR_RANK, 1)?;
        let strides = to_c(&params.strides, MIN_TENSOR_RANK, 1)?;
        check("cudnnSetTensorNdDescriptor", unsafe {
            sys::lib().cudnnSetTensorNdDescriptor(
                desc.0,
                data_type(params.data_type),
                dims.len() as c_int,
                dims.as_ptr(),
                strides.as_ptr(),
            )
        })
    }

    fn get_tensor(&self, desc: CudnnTensor) -> Result<TensorParams> {
        let mut dt = sys::cudnnDataType_t::CUDNN_DATA_FLOAT;
        let mut rank: c_int = 0;
        let mut dims = [0 as c_int; MAX_RANK];
        let mut strides = [0 as c_int; MAX_RANK];
        check("cudnnGetTensorNdDescriptor", unsafe {
            sys::lib().cudnnGetTensorNdDescriptor(
                desc.0,
                MAX_RANK as c_int,
                &mut dt,
                &mut rank,
                dims.as_mut_ptr(),
                strides.as_mut_ptr(),
            )
        })?;
        let rank = rank as usize;
        Ok(TensorParams {
            data_type: native_data_type(dt)?,
            dims: from_c(&dims[..rank]),
            strides: from_c(&strides[..rank]),
        })
    }

    fn destroy_tensor(&self, desc: CudnnTensor) -> Result<()> {
        check("cudnnDestroyTensorDescriptor", unsafe {
            sys::lib().cudnnDestroyTensorDescriptor(desc.0)
        })
    }

    fn find_forward_algorithms(
        &self,
        x: CudnnTensor,
        w: CudnnFilter,
        conv: CudnnConvolution,
        y: CudnnTensor,
    ) -> Result<Vec<AlgorithmCandidate<Self::FwdAlgo>>> {
        const REQUESTED: usize = 8;
        let mut returned: c_int = 0;
        // SAFETY: zeroed perf records are valid plain-old-data.
        let mut perf: [sys::cudnnConvolutionFwdAlgoPerf_t; REQUESTED] = unsafe { std::mem::zeroed() };
        check("cudnnFindConvolutionForwardAlgorithm", unsafe {
            sys::lib().cudnnFindConvolutionForwardAlgorithm(
                self.handle.0,
                x.0,
                w.0,
                conv.0,
                y.0,
                REQUESTED as c_int,
                &mut returned,
                perf.as_mut_ptr(),
            )
        })?;
        Ok(candidates(
            perf[..returned as usize]
                .iter()
                .map(|p| (p.algo, p.status, p.memory, p.determinism)),
        ))
    }

    fn find_backward_data_algorithms(
        &self,
        w: CudnnFilter,
        dy: CudnnTensor,
        conv: CudnnConvolution,
        dx: CudnnTensor,
    ) -> Result<Vec<AlgorithmCandidate<Self::BwdDataAlgo>>> {
        const REQUESTED: usize = 8;
        let mut returned: c_int = 0;
        // SAFETY: zeroed perf records are valid plain-old-data.
        let mut perf: [sys::cudnnConvolutionBwdDataAlgoPerf_t; REQUESTED] = unsafe { std::mem::zeroed() };
        check("cudnnFindConvolutionBackwardDataAlgorithm", unsafe {
            sys::lib().cudnnFindConvolutionBackwardDataAlgorithm(
                self.handle.0,
                w.0,
                dy.0,
                conv.0,
                dx.0,
                REQUESTED as c_int,
                &mut returned,
                perf.as_mut_ptr(),
            )
        })?;
        Ok(candidates(
            perf[..returned as usize]
                .iter()
                .map(|p| (p.algo, p.status, p.memory, p.determinism)),
        ))
    }

    fn find_backward_filter_algorithms(
        &self,
        x: CudnnTensor,
        dy: CudnnTensor,
        conv: CudnnConvolution,
        dw: CudnnFilter,
    ) -> Result<Vec<AlgorithmCandidate<Self::BwdFilterAlgo>>> {
        const REQUESTED: usize = 8;
        let mut returned: c_int = 0;
        // SAFETY: zeroed perf records are valid plain-old-data.
        let mut perf: [sys::cudnnConvolutionBwdFilterAlgoPerf_t; REQUESTED] = unsafe { std::mem::zeroed() };
        check("cudnnFindConvolutionBackwardFilterAlgorithm", unsafe {
            sys::lib().cudnnFindConvolutionBackwardFilterAlgorithm(
                self.handle.0,
                x.0,
                dy.0,
                conv.0,
                dw.0,
                REQUESTED as c_int,
                &mut returned,
                perf.as_mut_ptr(),
            )
        })?;
        Ok(candidates(
            perf[..returned as usize]
                .iter()
                .map(|p| (p.algo, p.status, p.memory, p.determinism)),
        ))
    }

    fn convolution_forward(
        &self,
        alpha: DataType,
        x_desc: CudnnTensor,
        x: &[DataType],
        w_desc: CudnnFilter,
        w: &[DataType],
        conv: CudnnConvolution,
        algo: Self::FwdAlgo,
        workspace_limit: usize,
        beta: DataType,
        y_desc: CudnnTensor,
        y: &mut [DataType],
    ) -> Result<()> {
        let mut bytes = 0usize;
        check("cudnnGetConvolutionForwardWorkspaceSize", unsafe {
            sys::lib().cudnnGetConvolutionForwardWorkspaceSize(
                self.handle.0,
                x_desc.0,
                w_desc.0,
                conv.0,
                y_desc.0,
                algo,
                &mut bytes,
            )
        })?;
        let mut ws = self.workspace(bytes, workspace_limit)?;
        let d_x = self.upload(x)?;
        let d_w = self.upload(w)?;
        let mut d_y = self.upload(y)?;
        check("cudnnConvolutionForward", unsafe {
            sys::lib().cudnnConvolutionForward(
                self.handle.0,
                scalar(&alpha),
                x_desc.0,
                ptr(&d_x),
                w_desc.0,
                ptr(&d_w),
                conv.0,
                algo,
                workspace_ptr(&mut ws),
                bytes,
                scalar(&beta),
                y_desc.0,
                ptr_mut(&mut d_y),
            )
        })?;
        self.download(&d_y, y)
    }

    fn convolution_backward_data(
        &self,
        alpha: DataType,
        w_desc: CudnnFilter,
        w: &[DataType],
        dy_desc: CudnnTensor,
        dy: &[DataType],
        conv: CudnnConvolution,
        algo: Self::BwdDataAlgo,
        workspace_limit: usize,
        beta: DataType,
        dx_desc: CudnnTensor,
        dx: &mut [DataType],
    ) -> Result<()> {
        let mut bytes = 0usize;
        check("cudnnGetConvolutionBackwardDataWorkspaceSize", unsafe {
            sys::lib().cudnnGetConvolutionBackwardDataWorkspaceSize(
                self.handle.0,
                w_desc.0,
                dy_desc.0,
                conv.0,
                dx_desc.0,
                algo,
                &mut bytes,
            )
        })?;
        let mut ws = self.workspace(bytes, workspace_limit)?;
        let d_w = self.upload(w)?;
        let d_dy = self.upload(dy)?;
        let mut d_dx = self.upload(dx)?;
        check("cudnnConvolutionBackwardData", unsafe {
            sys::lib().cudnnConvolutionBackwardData(
                self.handle.0,
                scalar(&alpha),
                w_desc.0,
                ptr(&d_w),
                dy_desc.0,
                ptr(&d_dy),
                conv.0,
                algo,
                workspace_ptr(&mut ws),
                bytes,
                scalar(&beta),
                dx_desc.0,
                ptr_mut(&mut d_dx),
            )
        })?;
        self.download(&d_dx, dx)
    }

    fn convolution_backward_filter(
        &self,
        alpha: DataType,
        x_desc: CudnnTensor,
        x: &[DataType],
        dy_desc: CudnnTensor,
        dy: &[DataType],
        conv: CudnnConvolution,
        algo: Self::BwdFilterAlgo,
        workspace_limit: usize,
        beta: DataType,
        dw_desc: CudnnFilter,
        dw: &mut [DataType],
    ) -> Result<()> {
        let mut bytes = 0usize;
        check("cudnnGetConvolutionBackwardFilterWorkspaceSize", unsafe {
            sys::lib().cudnnGetConvolutionBackwardFilterWorkspaceSize(
                self.handle.0,
                x_desc.0,
                dy_desc.0,
                conv.0,
                dw_desc.0,
                algo,
                &mut bytes,
            )
        })?;
        let mut ws = self.workspace(bytes, workspace_limit)?;
        let d_x = self.upload(x)?;
        let d_dy = self.upload(dy)?;
        let mut d_dw = self.upload(dw)?;
        check("cudnnConvolutionBackwardFilter", unsafe {
            sys::lib().cudnnConvolutionBackwardFilter(
                self.handle.0,
                scalar(&alpha),
                x_desc.0,
                ptr(&d_x),
                dy_desc.0,
                ptr(&d_dy),
                conv.0,
                algo,
                workspace_ptr(&mut ws),
                bytes,
                scalar(&beta),
                dw_desc.0,
                ptr_mut(&mut d_dw),
            )
        })?;
        self.download(&d_dw, dw)
    }

    fn convolution_backward_bias(
        &self,
        alpha: DataType,
        dy_desc: CudnnTensor,
        dy: &[DataType],
        beta: DataType,
        db_desc: CudnnTensor,
        db: &mut [DataType],
    ) -> Result<()> {
        let d_dy = self.upload(dy)?;
        let mut d_db = self.upload(db)?;
        check("cudnnConvolutionBackwardBias", unsafe {
            sys::lib().cudnnConvolutionBackwardBias(
                self.handle.0,
                scalar(&alpha),
                dy_desc.0,
                ptr(&d_dy),
                scalar(&beta),
                db_desc.0,
                ptr_mut(&mut d_db),
            )
        })?;
        self.download(&d_db, db)
    }

    fn add_tensor(
        &self,
        alpha: DataType,
        a_desc: CudnnTensor,
        a: &[DataType],
        beta: DataType,
        c_desc: CudnnTensor,
        c: &mut [DataType],
    ) -> Result<()> {
        let d_a = self.upload(a)?;
        let mut d_c = self.upload(c)?;
        check("cudnnAddTensor", unsafe {
            sys::lib().cudnnAddTensor(
                self.handle.0,
                scalar(&alpha),
                a_desc.0,
                ptr(&d_a),
                scalar(&beta),
                c_desc.0,
                ptr_mut(&mut d_c),
            )
        })?;
        self.download(&d_c, c)
    }
}

impl fmt::Debug for CudnnLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudnnLibrary(cuda:{})", self.dev.ordinal())
    }
}
