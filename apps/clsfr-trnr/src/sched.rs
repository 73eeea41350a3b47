//! Cosine annealing learning rate schedule.

use std::f64::consts::PI;

use tch::nn::Optimizer;

/// Decays the learning rate from `lr_max` to `lr_min` along a cosine curve.
///
/// Formula: `lr(t) = lr_min + (lr_max - lr_min) * 0.5 * (1 + cos(pi * t / t_max))`
///
/// Stepped once per epoch; past `t_max` the rate stays at `lr_min`.
#[derive(Debug)]
pub struct CosineAnnealing {
    lr_max: f64,
    lr_min: f64,
    t_max: usize,
    current_step: usize,
}

impl CosineAnnealing {
    pub fn new(lr_max: f64, t_max: usize) -> Self {
        Self { lr_max, lr_min: 0.0, t_max, current_step: 0 }
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step >= self.t_max {
            return self.lr_min;
        }
        let progress = self.current_step as f64 / self.t_max as f64;
        self.lr_min + (self.lr_max - self.lr_min) * 0.5 * (1.0 + (PI * progress).cos())
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Pushes the current rate into the optimizer.
    pub fn apply(&self, optimizer: &mut Optimizer) {
        optimizer.set_lr(self.get_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_lr_max() {
        let sched = CosineAnnealing::new(1e-3, 10);
        assert!((sched.get_lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn midpoint_is_half() {
        let mut sched = CosineAnnealing::new(1e-3, 10);
        for _ in 0..5 {
            sched.step();
        }
        assert!((sched.get_lr() - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn clamps_to_lr_min_at_and_past_t_max() {
        let mut sched = CosineAnnealing::new(1e-3, 10);
        for _ in 0..10 {
            sched.step();
        }
        assert_eq!(sched.get_lr(), 0.0);
        sched.step();
        assert_eq!(sched.get_lr(), 0.0);
    }

    #[test]
    fn rate_is_monotonically_non_increasing() {
        let mut sched = CosineAnnealing::new(1e-3, 20);
        let mut last = sched.get_lr();
        for _ in 0..25 {
            sched.step();
            let lr = sched.get_lr();
            assert!(lr <= last);
            last = lr;
        }
    }
}
