//! Learning rate ramp used by the direction search.
//!
//! A short linear warmup over the first `rampup` fraction of the run,
//! composed with a cosine rampdown over the last `rampdown` fraction.

use std::f64::consts::PI;

use candle_nn::Optimizer;

/// Learning rate at progress `t` in `[0, 1]`.
pub fn ramp_lr(t: f64, initial_lr: f64, rampdown: f64, rampup: f64) -> f64 {
    let lr_ramp = ((1.0 - t) / rampdown).min(1.0);
    let lr_ramp = 0.5 - 0.5 * (lr_ramp * PI).cos();
    let lr_ramp = lr_ramp * (t / rampup).min(1.0);

    initial_lr * lr_ramp
}

#[derive(Debug, Clone)]
pub struct RampSchedule {
    initial_lr: f64,
    total_steps: usize,
    rampdown: f64,
    rampup: f64,
    current_step: usize,
}

impl RampSchedule {
    pub fn new(initial_lr: f64, total_steps: usize, rampdown: f64, rampup: f64) -> Self {
        Self {
            initial_lr,
            total_steps,
            rampdown,
            rampup,
            current_step: 0,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 1.0;
        }
        self.current_step as f64 / self.total_steps as f64
    }

    pub fn get_lr(&self) -> f64 {
        ramp_lr(self.progress(), self.initial_lr, self.rampdown, self.rampup)
    }

    /// Pushes the learning rate for the current step into `opt`, then
    /// advances.
    pub fn step<O: Optimizer>(&mut self, opt: &mut O) -> f64 {
        let lr = self.get_lr();
        opt.set_learning_rate(lr);
        self.current_step += 1;
        lr
    }
}
