// ============================================================
// Layer 5 — Learning-Rate Schedule
// ============================================================
// Linear warmup followed by cosine decay to a floor:
//
//   lr
//   ▲   peak ┌─╮
//   │       ╱   ╲_
//   │      ╱      ╲_
//   │     ╱         ╲__
//   │    ╱              ╲______ min
//   └───┴──────┴──────────┴──────▶ step
//       0   warmup      decay
//
//   step <  warmup          → peak · step / warmup
//   step >  decay           → min
//   otherwise               → min + ½(1 + cos πr)(peak − min)
//                             r = (step − warmup)/(decay − warmup)
//
// With decay disabled the rate is simply `peak` forever.
//
// Reference: Loshchilov & Hutter (2017) SGDR

use std::f64::consts::PI;

use crate::domain::error::{TrainError, TrainResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub peak_rate:     f64,
    pub warmup_steps:  u64,
    pub decay_steps:   u64,
    pub min_rate:      f64,
    pub decay_enabled: bool,
}

impl LrSchedule {
    /// Build a schedule, rejecting parameter sets whose cosine
    /// branch would leave [0, 1].
    pub fn new(
        peak_rate:     f64,
        warmup_steps:  u64,
        decay_steps:   u64,
        min_rate:      f64,
        decay_enabled: bool,
    ) -> TrainResult<Self> {
        let s = Self { peak_rate, warmup_steps, decay_steps, min_rate, decay_enabled };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> TrainResult<()> {
        if !self.peak_rate.is_finite() || self.peak_rate < 0.0 {
            return Err(TrainError::config(format!(
                "learning_rate must be a finite non-negative number, got {}",
                self.peak_rate
            )));
        }
        if !self.decay_enabled {
            return Ok(());
        }
        if self.warmup_steps >= self.decay_steps {
            return Err(TrainError::config(format!(
                "warmup_iters ({}) must be smaller than lr_decay_iters ({}) when decay is enabled",
                self.warmup_steps, self.decay_steps
            )));
        }
        if self.min_rate < 0.0 || self.min_rate > self.peak_rate {
            return Err(TrainError::config(format!(
                "min_lr ({}) must lie in [0, learning_rate ({})]",
                self.min_rate, self.peak_rate
            )));
        }
        Ok(())
    }

    /// Learning rate for optimizer step `step`.
    pub fn lr(&self, step: u64) -> TrainResult<f64> {
        if !self.decay_enabled {
            return Ok(self.peak_rate);
        }

        // 1) linear warmup
        if step < self.warmup_steps {
            return Ok(self.peak_rate * step as f64 / self.warmup_steps as f64);
        }

        // 2) past the decay horizon
        if step > self.decay_steps {
            return Ok(self.min_rate);
        }

        // 3) cosine between the two
        let r = (step - self.warmup_steps) as f64
            / (self.decay_steps - self.warmup_steps) as f64;
        if !(0.0..=1.0).contains(&r) {
            return Err(TrainError::config(format!(
                "decay ratio {r} at step {step} is outside [0, 1]; check warmup_iters and lr_decay_iters"
            )));
        }
        let coeff = 0.5 * (1.0 + (PI * r).cos());
        Ok(self.min_rate + coeff * (self.peak_rate - self.min_rate))
    }
}
