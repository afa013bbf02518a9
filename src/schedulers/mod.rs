//! # Noise schedule
//!
//! The square-root schedule maps a discrete timestep to the fraction of the
//! clean signal kept in a noisy sample. It is shared by the forward corruption
//! used in training and by the reverse DDIM recurrence, so both sides stay
//! numerically consistent.

use crate::error::{Error, Result};
use tch::{Kind, Tensor};

pub mod ddim;

/// Added to the current step alpha of the reverse process so that the last
/// (pure noise) timestep never divides by zero.
pub const ALPHA_EPS: f64 = 1e-5;

/// `alpha(t) = 1 - sqrt((t + 1) / max_step)`, alpha is 1 for a clean sample
/// and reaches 0 at `t = max_step - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseSchedule {
    max_step: usize,
}

impl NoiseSchedule {
    pub fn new(max_step: usize) -> Result<Self> {
        if max_step == 0 {
            return Err(Error::Config("max_step must be at least 1".to_string()));
        }
        Ok(Self { max_step })
    }

    pub fn max_step(&self) -> usize {
        self.max_step
    }

    // The numerator is the number of noising steps applied so far, t + 1.
    fn alpha_for(&self, numerator: usize, timestep: usize) -> Result<f64> {
        let alpha = 1. - (numerator as f64 / self.max_step as f64).sqrt();
        if !alpha.is_finite() || !(0. ..=1.).contains(&alpha) {
            return Err(Error::NonFiniteAlpha { timestep, max_step: self.max_step, alpha });
        }
        Ok(alpha)
    }

    /// The signal coefficient at timestep `t`, `t` has to be below `max_step`.
    pub fn alpha(&self, t: usize) -> Result<f64> {
        if t >= self.max_step {
            return Err(Error::Config(format!(
                "timestep {t} out of range for max_step {}",
                self.max_step
            )));
        }
        self.alpha_for(t + 1, t)
    }

    /// Alpha of the current step of the reverse process, offset by
    /// [`ALPHA_EPS`].
    pub fn alpha_current(&self, t: usize) -> Result<f64> {
        Ok(self.alpha(t)? + ALPHA_EPS)
    }

    /// Alpha of the step `stride` below `t`. The numerator `t + 1 - stride`
    /// is clamped at zero, a target below the first timestep is the clean
    /// sample with alpha equal to 1.
    pub fn alpha_target(&self, t: usize, stride: usize) -> Result<f64> {
        if t >= self.max_step {
            return Err(Error::Config(format!(
                "timestep {t} out of range for max_step {}",
                self.max_step
            )));
        }
        self.alpha_for((t + 1).saturating_sub(stride), t)
    }

    /// Elementwise alpha for a batch of integer timesteps, returned as a
    /// float tensor with the same shape.
    pub fn alphas(&self, timesteps: &Tensor) -> Tensor {
        let steps = (timesteps.to_kind(Kind::Float) + 1.) / self.max_step as f64;
        1. - steps.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn alpha_is_non_increasing() {
        let schedule = NoiseSchedule::new(2000).unwrap();
        let mut prev = f64::INFINITY;
        for t in 0..2000 {
            let alpha = schedule.alpha(t).unwrap();
            assert!(alpha <= prev, "alpha increased at {t}");
            prev = alpha;
        }
    }

    #[test]
    fn alpha_bounds() {
        let schedule = NoiseSchedule::new(1_000_000).unwrap();
        assert!((schedule.alpha(0).unwrap() - 1.).abs() < 1e-2);
        assert_eq!(schedule.alpha(999_999).unwrap(), 0.);
        let schedule = NoiseSchedule::new(10).unwrap();
        assert_eq!(schedule.alpha(9).unwrap(), 0.);
        assert!((schedule.alpha_current(9).unwrap() - ALPHA_EPS).abs() < 1e-12);
    }

    #[test]
    fn alpha_is_pure() {
        let schedule = NoiseSchedule::new(2000).unwrap();
        for t in [0, 17, 1999] {
            assert_eq!(schedule.alpha(t).unwrap(), schedule.alpha(t).unwrap());
        }
    }

    #[test]
    fn alpha_target_clamps_at_clean_signal() {
        let schedule = NoiseSchedule::new(10).unwrap();
        // 9 + 1 - 4 = 6 steps of noise left.
        let expected = 1. - (6f64 / 10.).sqrt();
        assert!((schedule.alpha_target(9, 4).unwrap() - expected).abs() < 1e-12);
        assert_eq!(schedule.alpha_target(1, 4).unwrap(), 1.);
        assert_eq!(schedule.alpha_target(9, 10).unwrap(), 1.);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(matches!(NoiseSchedule::new(0), Err(Error::Config(_))));
        let schedule = NoiseSchedule::new(10).unwrap();
        assert!(matches!(schedule.alpha(10), Err(Error::Config(_))));
        assert!(matches!(schedule.alpha_target(10, 1), Err(Error::Config(_))));
    }

    #[test]
    fn tensor_alphas_match_scalar_alphas() {
        let schedule = NoiseSchedule::new(50).unwrap();
        let timesteps = Tensor::from_slice(&[0i64, 7, 49]).to_device(Device::Cpu);
        let alphas = Vec::<f64>::try_from(schedule.alphas(&timesteps).to_kind(Kind::Double))
            .unwrap();
        for (alpha, t) in alphas.iter().zip([0, 7, 49]) {
            assert!((alpha - schedule.alpha(t).unwrap()).abs() < 1e-6);
        }
    }
}
