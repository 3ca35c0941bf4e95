// ============================================================
// Layer 5 — Loss Estimator
// ============================================================
// A single minibatch loss is noisy. estimate_loss() averages
// `eval_iters` fresh batches per split so the numbers used for
// checkpoint decisions are stable.
//
// The model runs in eval mode (no dropout, no activations kept
// for backward) for the whole estimate. EvalModeGuard puts it
// there and switches it back to training mode when dropped,
// so an error half-way through cannot leave the model stuck in
// eval mode.
//
// Reference: Rust Book §15.3 (Running Code on Cleanup with Drop)

use std::ops::{Deref, DerefMut};

use crate::data::sampler::BatchSampler;
use crate::data::token_file::DatasetAccessor;
use crate::domain::error::TrainResult;
use crate::domain::state::Split;
use crate::domain::traits::{LanguageModel, ModelMode};

/// Mean loss on each split
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossEstimate {
    pub train: f32,
    pub val:   f32,
}

// ─── EvalModeGuard ────────────────────────────────────────────────────────────
/// Holds the model in eval mode for as long as it lives.
pub struct EvalModeGuard<'a, M: LanguageModel + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: LanguageModel + ?Sized> EvalModeGuard<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        model.set_mode(ModelMode::Eval);
        Self { model }
    }
}

impl<M: LanguageModel + ?Sized> Deref for EvalModeGuard<'_, M> {
    type Target = M;
    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: LanguageModel + ?Sized> DerefMut for EvalModeGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: LanguageModel + ?Sized> Drop for EvalModeGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_mode(ModelMode::Train);
    }
}

// ─── estimate_loss ────────────────────────────────────────────────────────────
/// Average the loss of `eval_iters` forward-only passes on the
/// train split and then on the val split.
pub fn estimate_loss<M: LanguageModel + ?Sized>(
    model:      &mut M,
    sampler:    &mut BatchSampler,
    data:       &DatasetAccessor,
    eval_iters: usize,
) -> TrainResult<LossEstimate> {
    let mut guard = EvalModeGuard::new(model);

    let mut means = [0.0f32; 2];
    for (slot, split) in means.iter_mut().zip(Split::ALL) {
        let mut sum = 0.0f64;
        for _ in 0..eval_iters {
            let batch = guard.transfer(sampler.sample(data, split)?).join()?;
            sum += guard.forward(&batch)? as f64;
        }
        *slot = (sum / eval_iters.max(1) as f64) as f32;
        tracing::debug!("{} loss over {} batches: {:.4}", split, eval_iters, *slot);
    }

    Ok(LossEstimate { train: means[0], val: means[1] })
}
