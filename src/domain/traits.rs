// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The training loop is written against two capabilities and
// never sees a concrete architecture, backend or update rule:
//
//   LanguageModel → transfer / forward / backward / gradients /
//                   weights / crop / MFU
//   Optimizer<M>  → step / state / per-group lr
//
// Implementations:
//   - ml::model::GptLm<B>        implements LanguageModel
//   - ml::adamw::BurnAdamW<B>    implements Optimizer<GptLm<B>>
//   - ml::testing (tests only)   scripted fakes of both
//
// Gradients stay inside the model between backward() and the
// optimizer step. The loss scaler and the clipper reach them
// through the gradient methods below; the optimizer is typed
// over the model it updates, so it can take them out in the
// backend's own representation.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)
//            Rust Book §19.2 (Associated Types)

use serde::{Deserialize, Serialize};

use crate::domain::error::TrainResult;
use crate::domain::hyperparams::ArchitectureHyperparams;
use crate::domain::record::StateDict;
use crate::domain::state::TokenBatch;
use crate::domain::transfer::PendingBatch;

/// Training mode enables dropout and keeps the graph for
/// backward; eval mode does neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    Eval,
}

// ─── LanguageModel ────────────────────────────────────────────────────────────
/// An autoregressive next-token model.
pub trait LanguageModel {
    /// A token batch as it lives on the model's device
    type Batch: Send + 'static;

    /// Start moving a host batch onto the model's device.
    fn transfer(&self, batch: TokenBatch) -> PendingBatch<Self::Batch>;

    /// Mean cross-entropy of predicting the batch targets. In
    /// training mode the graph needed by backward() is kept
    /// until the next forward.
    fn forward(&mut self, batch: &Self::Batch) -> TrainResult<f32>;

    /// Accumulate d(loss × loss_multiplier)/dθ, using the graph
    /// of the last forward. The multiplier carries both the
    /// dynamic loss scale and the 1/accumulation_steps factor.
    fn backward(&mut self, loss_multiplier: f32) -> TrainResult<()>;

    fn set_mode(&mut self, mode: ModelMode);

    fn mode(&self) -> ModelMode;

    fn hyperparams(&self) -> &ArchitectureHyperparams;

    // ── Accumulated gradients ────────────────────────────────────────────────

    /// Global L2 norm over every accumulated gradient. Non-finite
    /// when any gradient is.
    fn grad_norm(&mut self) -> TrainResult<f32>;

    fn scale_grads(&mut self, factor: f32) -> TrainResult<()>;

    fn zero_grads(&mut self);

    /// Rescale all gradients so their global norm is at most
    /// `max_norm`. Returns the norm before clipping.
    fn clip_grad_norm(&mut self, max_norm: f32) -> TrainResult<f32> {
        let norm = self.grad_norm()?;
        if norm.is_finite() && norm > max_norm {
            self.scale_grads(max_norm / (norm + 1e-6))?;
        }
        Ok(norm)
    }

    // ── Weights ──────────────────────────────────────────────────────────────

    fn state_dict(&self) -> TrainResult<StateDict>;

    /// Strict load: every parameter must be present with the
    /// same shape, and no extra names are allowed.
    fn load_state_dict(&mut self, state: &StateDict) -> TrainResult<()>;

    /// Shrink every position-dependent parameter to `window`
    /// positions. Growing is an error.
    fn crop_context_window(&mut self, window: usize) -> TrainResult<()>;

    /// Fraction of a reference accelerator's peak throughput
    /// achieved by processing `tokens_per_iter` tokens
    /// (forward + backward) in `elapsed_secs` seconds.
    fn estimate_utilization(&self, tokens_per_iter: usize, elapsed_secs: f64) -> f64;
}

// ─── Optimizer ────────────────────────────────────────────────────────────────
/// Hyperparameters of one parameter group. The learning rate is
/// rewritten by the orchestrator before every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name:          String,
    pub learning_rate: f64,
    pub weight_decay:  f32,
}

/// A parameter the persisted moments belong to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSlot {
    pub name:  String,
    pub shape: Vec<usize>,
}

/// Everything an optimizer needs to resume where it left off.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step:    u64,
    pub groups:  Vec<ParamGroup>,
    /// Moment blobs refer to parameters by their index here
    pub slots:   Vec<ParamSlot>,
    /// Backend-encoded moment buffers, one blob per group
    pub payload: Vec<Vec<u8>>,
}

pub trait Optimizer<M: LanguageModel> {
    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Apply one update to `model` using its accumulated
    /// gradients.
    fn step(&mut self, model: &mut M) -> TrainResult<()>;

    fn zero_gradients(&mut self, model: &mut M) {
        model.zero_grads();
    }

    fn state_dict(&self, model: &M) -> TrainResult<OptimizerState>;

    /// Restore moments for the parameters `model` has now.
    /// Moments recorded for a different shape are dropped.
    fn load_state_dict(&mut self, state: OptimizerState, model: &M) -> TrainResult<()>;

    /// Set the same learning rate on every group
    fn set_learning_rate(&mut self, lr: f64) {
        for group in self.param_groups_mut() {
            group.learning_rate = lr;
        }
    }
}
