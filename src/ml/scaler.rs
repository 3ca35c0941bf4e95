// ============================================================
// Layer 5 — Dynamic Loss Scaling
// ============================================================
// fp16 gradients underflow to zero for small losses. The usual
// fix is to multiply the loss by a large factor S before
// backward, divide the gradients by S afterwards, and adapt S:
//
//   - gradients contain inf/NaN → skip this optimizer step,
//                                  S ← S × 0.5
//   - 2000 clean steps in a row → S ← S × 2
//
// Per optimizer step the call order is:
//
//   backward(loss × scale_factor())   (once per micro-step)
//   unscale(model)                    (optional, before clipping)
//   step(optimizer, model)            (unscales if not done yet)
//   update()
//
// When disabled (fp32 / bf16) the factor is 1, unscale() and
// update() do nothing, and step() always applies the update.
//
// Reference: Micikevicius et al. (2018) Mixed Precision Training

use crate::domain::error::TrainResult;
use crate::domain::traits::{LanguageModel, Optimizer};

const INITIAL_SCALE:   f32   = 65536.0; // 2^16
const GROWTH_FACTOR:   f32   = 2.0;
const BACKOFF_FACTOR:  f32   = 0.5;
const GROWTH_INTERVAL: usize = 2000;

/// What happened to one optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied,
    /// Non-finite gradients were found; the update was skipped.
    /// `scale` is the factor that overflowed.
    SkippedNonFinite { scale: f32 },
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled:        bool,
    scale:          f32,
    growth_tracker: usize,
    unscaled:       bool,
    found_inf:      bool,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale:          INITIAL_SCALE,
            growth_tracker: 0,
            unscaled:       false,
            found_inf:      false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Multiplier to fold into the loss before backward
    pub fn scale_factor(&self) -> f32 {
        if self.enabled { self.scale } else { 1.0 }
    }

    /// Divide gradients by the current scale and record whether
    /// any are non-finite. Only the first call per step acts.
    pub fn unscale<M: LanguageModel>(&mut self, model: &mut M) -> TrainResult<()> {
        if !self.enabled || self.unscaled {
            return Ok(());
        }
        model.scale_grads(1.0 / self.scale)?;
        self.found_inf = !model.grad_norm()?.is_finite();
        self.unscaled  = true;
        Ok(())
    }

    /// Apply the optimizer step unless the gradients overflowed.
    pub fn step<M: LanguageModel, O: Optimizer<M> + ?Sized>(
        &mut self,
        optimizer: &mut O,
        model:     &mut M,
    ) -> TrainResult<StepOutcome> {
        if !self.enabled {
            optimizer.step(model)?;
            return Ok(StepOutcome::Applied);
        }

        self.unscale(model)?;
        if self.found_inf {
            return Ok(StepOutcome::SkippedNonFinite { scale: self.scale });
        }
        optimizer.step(model)?;
        Ok(StepOutcome::Applied)
    }

    /// Adapt the scale for the next step and reset per-step flags.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if self.found_inf {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
        self.unscaled  = false;
        self.found_inf = false;
    }
}
