// Optimizers: gradient buffers with a decay/accumulate scale pair
//
// A layer never owns its gradient storage. It asks the optimizer of each
// Weights object for the buffer and receives two scales with it:
//
//   buffer = dst_scale * buffer + gradient_scale * new_gradient
//
// dst_scale = 0 starts a fresh accumulation (stale contents are cleared),
// dst_scale = 1 adds on top of what earlier contributors wrote in the same
// step. The layer divides gradient_scale by the effective mini-batch size
// before using it. This pair is the only coordination contract between the
// layer and whatever reduces gradients across workers.

use std::fmt;

use dyn_clone::DynClone;
use kiln_core::{DataType, Error, Mat, Result};

/// Gradient accumulation target handed out by an [`Optimizer`].
#[derive(Debug)]
pub struct GradientBuffer<'a> {
    pub dst_scale: DataType,
    pub gradient_scale: DataType,
    pub values: &'a mut Mat,
}

/// Owner of the gradient buffer of one Weights object.
pub trait Optimizer: DynClone + fmt::Debug + Send + Sync {
    /// Size the gradient buffer for weights of `height x width`.
    fn setup(&mut self, height: usize, width: usize);

    /// Borrow the gradient buffer together with its scale pair.
    ///
    /// With `initialize` set, a buffer that was never sized is allocated
    /// (zero-filled) at the size given to `setup` instead of failing.
    fn gradient_buffer(&mut self, initialize: bool) -> Result<GradientBuffer<'_>>;

    /// The accumulated gradient.
    fn gradient(&self) -> &Mat;

    /// Apply the accumulated gradient to `values` and open a new step.
    fn step(&mut self, values: &mut Mat) -> Result<()>;
}

dyn_clone::clone_trait_object!(Optimizer);

/// Creates one optimizer per Weights object a layer allocates.
pub trait OptimizerFactory {
    fn create(&self) -> Box<dyn Optimizer>;
}

impl<F> OptimizerFactory for F
where
    F: Fn() -> Box<dyn Optimizer>,
{
    fn create(&self) -> Box<dyn Optimizer> {
        self()
    }
}

/// Shared sizing logic of the optimizers below.
#[derive(Debug, Clone, Default)]
struct GradientStore {
    dims: (usize, usize),
    gradient: Mat,
}

impl GradientStore {
    fn setup(&mut self, height: usize, width: usize) {
        self.dims = (height, width);
        self.gradient = Mat::zeros(height, width);
    }

    fn buffer(&mut self, initialize: bool) -> Result<&mut Mat> {
        let (height, width) = self.dims;
        if self.gradient.height() != height || self.gradient.width() != width {
            if !initialize {
                return Err(Error::msg(format!(
                    "gradient buffer is {}x{}, expected {height}x{width}",
                    self.gradient.height(),
                    self.gradient.width()
                )));
            }
            self.gradient = Mat::zeros(height, width);
        }
        Ok(&mut self.gradient)
    }
}

/// Plain stochastic gradient descent: `values -= learning_rate * gradient`.
///
/// The first buffer request of a step clears the buffer (`dst_scale = 0`);
/// later requests in the same step accumulate (`dst_scale = 1`).
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: DataType,
    store: GradientStore,
    accumulating: bool,
}

impl Sgd {
    pub fn new(learning_rate: DataType) -> Self {
        Sgd {
            learning_rate,
            store: GradientStore::default(),
            accumulating: false,
        }
    }

    pub fn learning_rate(&self) -> DataType {
        self.learning_rate
    }
}

impl Optimizer for Sgd {
    fn setup(&mut self, height: usize, width: usize) {
        self.store.setup(height, width);
        self.accumulating = false;
    }

    fn gradient_buffer(&mut self, initialize: bool) -> Result<GradientBuffer<'_>> {
        let dst_scale = if self.accumulating { 1.0 } else { 0.0 };
        self.accumulating = true;
        Ok(GradientBuffer {
            dst_scale,
            gradient_scale: 1.0,
            values: self.store.buffer(initialize)?,
        })
    }

    fn gradient(&self) -> &Mat {
        &self.store.gradient
    }

    fn step(&mut self, values: &mut Mat) -> Result<()> {
        let gradient = &self.store.gradient;
        if values.height() != gradient.height() || values.width() != gradient.width() {
            return Err(Error::ShapeMismatch {
                expected: (gradient.height(), gradient.width()).into(),
                got: (values.height(), values.width()).into(),
            });
        }
        for (v, g) in values.as_mut_slice().iter_mut().zip(gradient.as_slice()) {
            *v -= self.learning_rate * g;
        }
        self.accumulating = false;
        Ok(())
    }
}

/// Hands out the same scale pair on every request and never updates the
/// weights. Useful to accumulate raw gradients across several mini-batches
/// (`dst_scale = 1`) or to inspect one contribution in isolation.
#[derive(Debug, Clone)]
pub struct FixedScaleOptimizer {
    dst_scale: DataType,
    gradient_scale: DataType,
    store: GradientStore,
}

impl FixedScaleOptimizer {
    pub fn new(dst_scale: DataType, gradient_scale: DataType) -> Self {
        FixedScaleOptimizer {
            dst_scale,
            gradient_scale,
            store: GradientStore::default(),
        }
    }

    /// Overwrite the gradient buffer, e.g. to seed a known prior value.
    pub fn set_gradient(&mut self, gradient: Mat) -> Result<()> {
        let (height, width) = self.store.dims;
        if gradient.height() != height || gradient.width() != width {
            return Err(Error::ShapeMismatch {
                expected: (height, width).into(),
                got: (gradient.height(), gradient.width()).into(),
            });
        }
        self.store.gradient = gradient;
        Ok(())
    }
}

impl Optimizer for FixedScaleOptimizer {
    fn setup(&mut self, height: usize, width: usize) {
        self.store.setup(height, width);
    }

    fn gradient_buffer(&mut self, initialize: bool) -> Result<GradientBuffer<'_>> {
        Ok(GradientBuffer {
            dst_scale: self.dst_scale,
            gradient_scale: self.gradient_scale,
            values: self.store.buffer(initialize)?,
        })
    }

    fn gradient(&self) -> &Mat {
        &self.store.gradient
    }

    fn step(&mut self, _values: &mut Mat) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd_scale_pair_per_step() -> Result<()> {
        let mut opt = Sgd::new(0.1);
        opt.setup(2, 1);
        let first = opt.gradient_buffer(true)?;
        assert_eq!((first.dst_scale, first.gradient_scale), (0.0, 1.0));
        let second = opt.gradient_buffer(true)?;
        assert_eq!((second.dst_scale, second.gradient_scale), (1.0, 1.0));

        let mut values = Mat::zeros(2, 1);
        opt.step(&mut values)?;
        let next = opt.gradient_buffer(true)?;
        assert_eq!(next.dst_scale, 0.0);
        Ok(())
    }

    #[test]
    fn sgd_step_descends() -> Result<()> {
        let mut opt = Sgd::new(0.5);
        opt.setup(2, 1);
        opt.gradient_buffer(true)?.values.as_mut_slice().copy_from_slice(&[2.0, -4.0]);
        let mut values = Mat::full(2, 1, 1.0);
        opt.step(&mut values)?;
        assert_eq!(values.as_slice(), &[0.0, 3.0]);
        Ok(())
    }

    #[test]
    fn sgd_step_checks_shape() {
        let mut opt = Sgd::new(0.5);
        opt.setup(2, 1);
        let mut values = Mat::zeros(3, 1);
        assert!(opt.step(&mut values).is_err());
    }

    #[test]
    fn fixed_scale_pair() -> Result<()> {
        let mut opt = FixedScaleOptimizer::new(0.5, 0.25);
        opt.setup(1, 1);
        for _ in 0..2 {
            let buf = opt.gradient_buffer(false)?;
            assert_eq!((buf.dst_scale, buf.gradient_scale), (0.5, 0.25));
        }
        Ok(())
    }

    #[test]
    fn closure_factory() {
        let factory = || -> Box<dyn Optimizer> { Box::new(Sgd::new(0.01)) };
        let opt = factory.create();
        assert!(opt.gradient().is_empty());
    }
}
