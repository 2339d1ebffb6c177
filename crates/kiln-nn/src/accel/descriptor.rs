// Scoped native descriptors
//
// Native descriptor handles are plain pointers into the vendor library:
// copying the handle would alias it and destroying it twice is undefined.
// A Descriptor owns at most one handle and gives it value semantics:
//
//   copy_from(src)   src null, dst set   -> destroy dst, leave it null
//                    src set,  dst null  -> create a fresh dst handle
//                    src set             -> query every property of src and
//                                           apply it to dst
//   try_clone()      a null Descriptor followed by copy_from
//   release() / Drop destroy the handle exactly once
//
// A failed destroy during Drop is logged, never raised.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use kiln_core::{Error, Result};
use log::{trace, warn};

use super::library::{ConvLibrary, ConvolutionParams, FilterParams, TensorParams};

/// Native calls for one kind of descriptor.
pub trait DescriptorKind<L: ConvLibrary> {
    type Handle: Copy + fmt::Debug + PartialEq + Send + Sync;
    type Params: Clone + fmt::Debug + PartialEq;
    const NAME: &'static str;

    fn create(lib: &L) -> Result<Self::Handle>;
    fn set(lib: &L, handle: Self::Handle, params: &Self::Params) -> Result<()>;
    fn get(lib: &L, handle: Self::Handle) -> Result<Self::Params>;
    fn destroy(lib: &L, handle: Self::Handle) -> Result<()>;
}

/// Filter (kernel) descriptors.
#[derive(Debug)]
pub enum FilterDesc {}

/// Convolution operation descriptors.
#[derive(Debug)]
pub enum ConvolutionDesc {}

/// Tensor descriptors.
#[derive(Debug)]
pub enum TensorDesc {}

impl<L: ConvLibrary> DescriptorKind<L> for FilterDesc {
    type Handle = L::Filter;
    type Params = FilterParams;
    const NAME: &'static str = "filter";

    fn create(lib: &L) -> Result<Self::Handle> {
        lib.create_filter()
    }
    fn set(lib: &L, handle: Self::Handle, params: &FilterParams) -> Result<()> {
        lib.set_filter(handle, params)
    }
    fn get(lib: &L, handle: Self::Handle) -> Result<FilterParams> {
        lib.get_filter(handle)
    }
    fn destroy(lib: &L, handle: Self::Handle) -> Result<()> {
        lib.destroy_filter(handle)
    }
}

impl<L: ConvLibrary> DescriptorKind<L> for ConvolutionDesc {
    type Handle = L::Convolution;
    type Params = ConvolutionParams;
    const NAME: &'static str = "convolution";

    fn create(lib: &L) -> Result<Self::Handle> {
        lib.create_convolution()
    }
    fn set(lib: &L, handle: Self::Handle, params: &ConvolutionParams) -> Result<()> {
        lib.set_convolution(handle, params)
    }
    fn get(lib: &L, handle: Self::Handle) -> Result<ConvolutionParams> {
        lib.get_convolution(handle)
    }
    fn destroy(lib: &L, handle: Self::Handle) -> Result<()> {
        lib.destroy_convolution(handle)
    }
}

impl<L: ConvLibrary> DescriptorKind<L> for TensorDesc {
    type Handle = L::Tensor;
    type Params = TensorParams;
    const NAME: &'static str = "tensor";

    fn create(lib: &L) -> Result<Self::Handle> {
        lib.create_tensor()
    }
    fn set(lib: &L, handle: Self::Handle, params: &TensorParams) -> Result<()> {
        lib.set_tensor(handle, params)
    }
    fn get(lib: &L, handle: Self::Handle) -> Result<TensorParams> {
        lib.get_tensor(handle)
    }
    fn destroy(lib: &L, handle: Self::Handle) -> Result<()> {
        lib.destroy_tensor(handle)
    }
}

/// An owned, possibly null, native descriptor.
pub struct Descriptor<L: ConvLibrary, K: DescriptorKind<L>> {
    lib: Arc<L>,
    handle: Option<K::Handle>,
    _kind: PhantomData<fn() -> K>,
}

pub type FilterDescriptor<L> = Descriptor<L, FilterDesc>;
pub type ConvolutionDescriptor<L> = Descriptor<L, ConvolutionDesc>;
pub type TensorDescriptor<L> = Descriptor<L, TensorDesc>;

impl<L: ConvLibrary, K: DescriptorKind<L>> Descriptor<L, K> {
    /// A descriptor without a native handle.
    pub fn null(lib: Arc<L>) -> Self {
        Descriptor {
            lib,
            handle: None,
            _kind: PhantomData,
        }
    }

    /// Create a handle and apply `params` to it.
    pub fn new(lib: Arc<L>, params: &K::Params) -> Result<Self> {
        let mut desc = Self::null(lib);
        desc.set(params)?;
        Ok(desc)
    }

    pub fn is_null(&self) -> bool {
        self.handle.is_none()
    }

    /// The native handle, failing when the descriptor is null.
    pub fn handle(&self) -> Result<K::Handle> {
        self.handle
            .ok_or_else(|| Error::msg(format!("{} descriptor has not been created", K::NAME)))
    }

    fn ensure_handle(&mut self) -> Result<K::Handle> {
        match self.handle {
            Some(h) => Ok(h),
            None => {
                let h = K::create(&self.lib)?;
                trace!("created {} descriptor {h:?}", K::NAME);
                self.handle = Some(h);
                Ok(h)
            }
        }
    }

    /// Apply `params`, creating the handle first if needed.
    pub fn set(&mut self, params: &K::Params) -> Result<()> {
        let h = self.ensure_handle()?;
        K::set(&self.lib, h, params)
    }

    /// Query the native properties; None for a null descriptor.
    pub fn params(&self) -> Result<Option<K::Params>> {
        self.handle.map(|h| K::get(&self.lib, h)).transpose()
    }

    /// Make `self` a deep copy of `src`.
    pub fn copy_from(&mut self, src: &Self) -> Result<()> {
        match src.handle {
            None => self.release(),
            Some(src_handle) => {
                let params = K::get(&src.lib, src_handle)?;
                let h = self.ensure_handle()?;
                K::set(&self.lib, h, &params)
            }
        }
    }

    /// Deep copy with a handle of its own.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::null(Arc::clone(&self.lib));
        copy.copy_from(self)?;
        Ok(copy)
    }

    /// Destroy the handle now. The descriptor is null afterwards even if
    /// the native destroy call fails.
    pub fn release(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(h) => {
                trace!("destroying {} descriptor {h:?}", K::NAME);
                K::destroy(&self.lib, h)
            }
            None => Ok(()),
        }
    }
}

impl<L: ConvLibrary, K: DescriptorKind<L>> Drop for Descriptor<L, K> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to destroy {} descriptor: {e}", K::NAME);
        }
    }
}

impl<L: ConvLibrary, K: DescriptorKind<L>> fmt::Debug for Descriptor<L, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &K::NAME)
            .field("handle", &self.handle)
            .finish()
    }
}
