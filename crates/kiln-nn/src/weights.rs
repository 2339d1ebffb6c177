use kiln_core::{Mat, MatRef, Result, Shape};
use log::debug;

use crate::init::Initializer;
use crate::optim::Optimizer;

/// A trainable parameter tensor: values, an initializer that fills them on
/// allocation, and the optimizer owning the gradient buffer.
///
/// Values are stored as a single `size x 1` column; compute strategies
/// reinterpret that column as whatever GEMM operand they need.
#[derive(Debug, Clone)]
pub struct Weights {
    name: String,
    dims: Shape,
    values: Mat,
    initializer: Option<Box<dyn Initializer>>,
    optimizer: Option<Box<dyn Optimizer>>,
    frozen: bool,
    locked_frozen: Option<bool>,
}

impl Weights {
    pub fn new(name: impl Into<String>) -> Self {
        Weights {
            name: name.into(),
            dims: Shape::default(),
            values: Mat::default(),
            initializer: None,
            optimizer: None,
            frozen: false,
            locked_frozen: None,
        }
    }

    pub fn with_initializer(mut self, initializer: Box<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &Shape {
        &self.dims
    }

    pub fn set_dims(&mut self, dims: Shape) {
        self.dims = dims;
    }

    /// Number of entries (product of the dims).
    pub fn size(&self) -> usize {
        self.dims.elem_count()
    }

    pub fn values(&self) -> &Mat {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Mat {
        &mut self.values
    }

    /// Replace the values, keeping the `size x 1` layout.
    pub fn set_values(&mut self, values: &[kiln_core::DataType]) -> Result<()> {
        self.values = Mat::from_vec(values.len(), 1, values.to_vec())?;
        Ok(())
    }

    pub fn view(&self) -> MatRef<'_> {
        self.values.view()
    }

    pub fn initializer(&self) -> Option<&dyn Initializer> {
        self.initializer.as_deref()
    }

    pub fn initializer_mut(&mut self) -> Option<&mut (dyn Initializer + 'static)> {
        self.initializer.as_deref_mut()
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    /// The optimizer, or None while the weights are frozen.
    pub fn optimizer_mut(&mut self) -> Option<&mut (dyn Optimizer + 'static)> {
        if self.frozen {
            return None;
        }
        self.optimizer.as_deref_mut()
    }

    pub fn has_optimizer(&self) -> bool {
        self.optimizer.is_some()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.set_frozen(true);
    }

    pub fn unfreeze(&mut self) {
        self.set_frozen(false);
    }

    fn set_frozen(&mut self, frozen: bool) {
        self.frozen = self.locked_frozen.unwrap_or(frozen);
    }

    /// Pin the freeze state. Weights shared with another model keep the
    /// state its owner chose; later freeze/unfreeze requests are ignored.
    pub fn lock_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
        self.locked_frozen = Some(frozen);
    }

    /// Allocate values and the gradient buffer for the current dims.
    ///
    /// Values that already have the right size are kept, so pre-trained
    /// weights survive; anything else is reallocated and filled by the
    /// initializer (zeros without one).
    pub fn setup(&mut self) -> Result<()> {
        let size = self.size();
        if self.values.height() != size || self.values.width() != 1 {
            self.values = Mat::zeros(size, 1);
            if let Some(init) = &self.initializer {
                init.fill(&mut self.values)?;
            }
            debug!("weights \"{}\" allocated with dims {}", self.name, self.dims);
        }
        if let Some(opt) = self.optimizer.as_deref_mut() {
            opt.setup(size, 1);
        }
        Ok(())
    }

    /// Let the optimizer consume the accumulated gradient.
    pub fn step(&mut self) -> Result<()> {
        if self.frozen {
            return Ok(());
        }
        match self.optimizer.as_deref_mut() {
            Some(opt) => opt.step(&mut self.values),
            None => Ok(()),
        }
    }
}
