// Weight initializers
//
// An Initializer fills the value matrix of a Weights object once, when the
// owning layer allocates it. Two families are provided:
//
//   ConstantInitializer(v)          every entry = v (bias default: 0)
//   VarianceScalingInitializer      N(0, var) or U(-sqrt(3 var), sqrt(3 var))
//
// Variance scaling needs the fan-in / fan-out of the weights, which only the
// owning layer knows. Layers inject them through the capability query
// `Initializer::as_variance_scaling_mut`; initializers that do not scale by
// fan simply return None and are left untouched.
//
//   He (Kaiming):   var = 2 / fan_in
//   Glorot (Xavier): var = 2 / (fan_in + fan_out)
//   LeCun:          var = 1 / fan_in

use std::fmt;

use dyn_clone::DynClone;
use kiln_core::{DataType, Error, Mat, Result};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{thread_rng, SeedableRng};
use rand_distr::Normal;

/// Fills weight values at allocation time.
pub trait Initializer: DynClone + fmt::Debug + Send + Sync {
    fn fill(&self, values: &mut Mat) -> Result<()>;

    /// Fan-in/fan-out configuration, when this initializer supports it.
    fn as_variance_scaling_mut(&mut self) -> Option<&mut VarianceScalingInitializer> {
        None
    }
}

dyn_clone::clone_trait_object!(Initializer);

/// Every entry set to the same value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantInitializer(pub DataType);

impl Initializer for ConstantInitializer {
    fn fill(&self, values: &mut Mat) -> Result<()> {
        values.fill(self.0);
        Ok(())
    }
}

/// How the variance is derived from the fans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceScaling {
    /// He et al.: `2 / fan_in`.
    He,
    /// Glorot & Bengio: `2 / (fan_in + fan_out)`.
    Glorot,
    /// LeCun: `1 / fan_in`.
    Lecun,
}

/// Shape of the sampling distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Normal,
    Uniform,
}

/// Zero-mean random values whose variance is scaled by the fans.
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceScalingInitializer {
    scaling: VarianceScaling,
    sampling: Sampling,
    fan_in: Option<f64>,
    fan_out: Option<f64>,
    seed: Option<u64>,
}

impl VarianceScalingInitializer {
    pub fn new(scaling: VarianceScaling, sampling: Sampling) -> Self {
        VarianceScalingInitializer {
            scaling,
            sampling,
            fan_in: None,
            fan_out: None,
            seed: None,
        }
    }

    /// He normal, the default for convolution kernels.
    pub fn he_normal() -> Self {
        Self::new(VarianceScaling::He, Sampling::Normal)
    }

    pub fn glorot_uniform() -> Self {
        Self::new(VarianceScaling::Glorot, Sampling::Uniform)
    }

    /// Draw from a fixed seed instead of the thread RNG.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn set_fan_in(&mut self, fan_in: f64) {
        self.fan_in = Some(fan_in);
    }

    pub fn set_fan_out(&mut self, fan_out: f64) {
        self.fan_out = Some(fan_out);
    }

    pub fn fan_in(&self) -> Option<f64> {
        self.fan_in
    }

    pub fn fan_out(&self) -> Option<f64> {
        self.fan_out
    }

    /// Target variance, once the fans it depends on are known.
    pub fn variance(&self) -> Result<f64> {
        let positive = |name: &str, fan: Option<f64>| match fan {
            Some(f) if f > 0.0 => Ok(f),
            other => Err(Error::msg(format!(
                "variance scaling initializer has invalid {name} ({other:?})"
            ))),
        };
        Ok(match self.scaling {
            VarianceScaling::He => 2.0 / positive("fan-in", self.fan_in)?,
            VarianceScaling::Lecun => 1.0 / positive("fan-in", self.fan_in)?,
            VarianceScaling::Glorot => {
                let fan_in = positive("fan-in", self.fan_in)?;
                let fan_out = positive("fan-out", self.fan_out)?;
                2.0 / (fan_in + fan_out)
            }
        })
    }

    fn sample(&self, values: &mut Mat, rng: &mut impl rand::Rng) -> Result<()> {
        let variance = self.variance()?;
        match self.sampling {
            Sampling::Normal => {
                let dist = Normal::new(0.0, variance.sqrt()).map_err(|e| Error::msg(e.to_string()))?;
                for v in values.as_mut_slice() {
                    *v = dist.sample(rng) as DataType;
                }
            }
            Sampling::Uniform => {
                let bound = (3.0 * variance).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                for v in values.as_mut_slice() {
                    *v = dist.sample(rng) as DataType;
                }
            }
        }
        Ok(())
    }
}

impl Initializer for VarianceScalingInitializer {
    fn fill(&self, values: &mut Mat) -> Result<()> {
        match self.seed {
            Some(seed) => self.sample(values, &mut StdRng::seed_from_u64(seed)),
            None => self.sample(values, &mut thread_rng()),
        }
    }

    fn as_variance_scaling_mut(&mut self) -> Option<&mut VarianceScalingInitializer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_fills() -> Result<()> {
        let mut m = Mat::zeros(3, 2);
        ConstantInitializer(7.0).fill(&mut m)?;
        assert!(m.as_slice().iter().all(|&v| v == 7.0));
        Ok(())
    }

    #[test]
    fn constant_has_no_fan_capability() {
        let mut init: Box<dyn Initializer> = Box::new(ConstantInitializer(0.0));
        assert!(init.as_variance_scaling_mut().is_none());
    }

    #[test]
    fn he_normal_requires_fan_in() {
        let init = VarianceScalingInitializer::he_normal();
        let mut m = Mat::zeros(4, 1);
        assert!(init.fill(&mut m).is_err());
    }

    #[test]
    fn glorot_uniform_bounds() -> Result<()> {
        let mut init = VarianceScalingInitializer::glorot_uniform().with_seed(3);
        init.set_fan_in(40.0);
        init.set_fan_out(20.0);
        let mut m = Mat::zeros(500, 1);
        init.fill(&mut m)?;
        let bound = (3.0 * 2.0 / 60.0_f64).sqrt() as DataType;
        assert!(m.as_slice().iter().all(|v| v.abs() <= bound + 1e-6));
        Ok(())
    }

    #[test]
    fn he_normal_stats() -> Result<()> {
        let mut init = VarianceScalingInitializer::he_normal().with_seed(11);
        init.set_fan_in(50.0);
        let mut m = Mat::zeros(20_000, 1);
        init.fill(&mut m)?;
        let n = m.as_slice().len() as f64;
        let mean: f64 = m.as_slice().iter().map(|&v| v as f64).sum::<f64>() / n;
        let var: f64 = m.as_slice().iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!((var - 0.04).abs() < 0.004, "variance {var}");
        Ok(())
    }

    #[test]
    fn seeded_fill_is_reproducible() -> Result<()> {
        let mut init = VarianceScalingInitializer::he_normal().with_seed(5);
        init.set_fan_in(9.0);
        let (mut a, mut b) = (Mat::zeros(16, 1), Mat::zeros(16, 1));
        init.fill(&mut a)?;
        init.fill(&mut b)?;
        assert_eq!(a, b);
        Ok(())
    }
}
