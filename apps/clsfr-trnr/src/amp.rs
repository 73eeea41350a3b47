//! Dynamic loss scaling for mixed-precision training.

use anyhow::Result;
use tch::nn::VarStore;
use tch::Tensor;

const INITIAL_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;
const MIN_SCALE: f64 = 1.0;

/// Keeps the loss in a range where reduced-precision gradients stay
/// representable.
///
/// The loss is multiplied by the current scale before backward; gradients
/// are divided by it before clipping and the optimizer step. A non-finite
/// gradient voids the step and shrinks the scale; a long run of clean steps
/// grows it back. Inert when disabled (CPU runs).
#[derive(Debug)]
pub struct GradScaler {
    scale: f64,
    growth_tracker: u32,
    enabled: bool,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self { scale: INITIAL_SCALE, growth_tracker: 0, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_scale(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Scaled copy of the loss, ready for backward.
    pub fn scale(&self, loss: &Tensor) -> Tensor {
        if self.enabled {
            loss * self.scale
        } else {
            loss.shallow_clone()
        }
    }

    /// Divides all trainable gradients by the scale in place. Returns true
    /// when any gradient came out non-finite, in which case the step must be
    /// skipped.
    pub fn unscale(&self, vs: &VarStore) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        let _guard = tch::no_grad_guard();
        for var in vs.trainable_variables() {
            let mut grad = var.grad();
            if !grad.defined() {
                continue;
            }
            let _ = grad.f_mul_scalar_(inv)?;
            if grad.isfinite().all().int64_value(&[]) == 0 {
                found_inf = true;
            }
        }
        Ok(found_inf)
    }

    /// Shrinks the scale after an overflow, grows it after a clean stretch.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale = (self.scale * BACKOFF_FACTOR).max(MIN_SCALE);
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
    }
}
