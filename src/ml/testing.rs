// Scripted stand-ins for the model and optimizer, so loop
// behaviour (eval schedule, checkpoint policy, termination,
// resume, overflow handling) can be asserted exactly.

use std::collections::VecDeque;

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::hyperparams::ArchitectureHyperparams;
use crate::domain::record::{ParamRecord, StateDict};
use crate::domain::state::TokenBatch;
use crate::domain::traits::{LanguageModel, ModelMode, OptimizerState, Optimizer, ParamGroup};
use crate::domain::transfer::PendingBatch;

/// "w.weight" [2, 2] followed by "w.bias" [2]
const WEIGHT_LEN: usize = 4;
const PARAM_LEN:  usize = 6;

pub fn tiny_hyperparams() -> ArchitectureHyperparams {
    ArchitectureHyperparams {
        layer_count:     1,
        head_count:      1,
        embedding_width: 4,
        context_window:  8,
        use_bias:        false,
        dropout_rate:    0.0,
        vocab_size:      16,
    }
}

// ─── ScriptedModel ────────────────────────────────────────────────────────────
/// Eval-mode forwards return the scripted losses in order (the
/// last one repeats once the script runs out). Train-mode
/// forwards return `train_loss`, and backward adds
/// `grad_value × multiplier` to each of the six gradients.
#[derive(Debug)]
pub struct ScriptedModel {
    weights:     Vec<f32>,
    grads:       Vec<f32>,
    hp:          ArchitectureHyperparams,
    mode:        ModelMode,
    eval_losses: VecDeque<f32>,
    last_eval:   f32,
    has_cache:   bool,

    pub async_transfer:       bool,
    pub train_loss:           f32,
    pub grad_value:           f32,
    pub fail_eval_forward:    bool,
    pub train_forwards:       usize,
    pub eval_forwards:        usize,
    pub backward_multipliers: Vec<f32>,
    /// Batches seen by train-mode forwards, in order
    pub train_batches:        Vec<TokenBatch>,
}

impl ScriptedModel {
    pub fn with_eval_losses(losses: &[f32]) -> Self {
        let mut weights = vec![1.0; WEIGHT_LEN];
        weights.resize(PARAM_LEN, 0.0);
        Self {
            weights,
            grads:       vec![0.0; PARAM_LEN],
            hp:          tiny_hyperparams(),
            mode:        ModelMode::Train,
            eval_losses: losses.iter().copied().collect(),
            last_eval:   losses.last().copied().unwrap_or(1.0),
            has_cache:   false,
            async_transfer:       false,
            train_loss:           1.0,
            grad_value:           0.5,
            fail_eval_forward:    false,
            train_forwards:       0,
            eval_forwards:        0,
            backward_multipliers: Vec::new(),
            train_batches:        Vec::new(),
        }
    }

    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    pub fn set_grads(&mut self, value: f32) {
        self.grads.iter_mut().for_each(|g| *g = value);
    }

    /// Plain SGD over every weight
    fn apply_sgd(&mut self, lr: f32) {
        for (w, g) in self.weights.iter_mut().zip(&self.grads) {
            *w -= lr * g;
        }
    }
}

impl LanguageModel for ScriptedModel {
    type Batch = TokenBatch;

    fn transfer(&self, batch: TokenBatch) -> PendingBatch<TokenBatch> {
        if self.async_transfer {
            PendingBatch::spawn(move || Ok(batch))
        } else {
            PendingBatch::ready(Ok(batch))
        }
    }

    fn forward(&mut self, batch: &TokenBatch) -> TrainResult<f32> {
        match self.mode {
            ModelMode::Eval => {
                if self.fail_eval_forward {
                    return Err(TrainError::Model("scripted failure".into()));
                }
                self.eval_forwards += 1;
                Ok(self.eval_losses.pop_front().unwrap_or(self.last_eval))
            }
            ModelMode::Train => {
                self.train_forwards += 1;
                self.has_cache = true;
                self.train_batches.push(batch.clone());
                Ok(self.train_loss)
            }
        }
    }

    fn backward(&mut self, loss_multiplier: f32) -> TrainResult<()> {
        if !self.has_cache {
            return Err(TrainError::Model("backward without forward".into()));
        }
        self.has_cache = false;
        self.backward_multipliers.push(loss_multiplier);
        let g = self.grad_value * loss_multiplier;
        self.grads.iter_mut().for_each(|x| *x += g);
        Ok(())
    }

    fn set_mode(&mut self, mode: ModelMode) {
        if mode == ModelMode::Eval {
            self.has_cache = false;
        }
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn hyperparams(&self) -> &ArchitectureHyperparams {
        &self.hp
    }

    fn grad_norm(&mut self) -> TrainResult<f32> {
        Ok(self.grads.iter().map(|g| g * g).sum::<f32>().sqrt())
    }

    fn scale_grads(&mut self, factor: f32) -> TrainResult<()> {
        self.grads.iter_mut().for_each(|g| *g *= factor);
        Ok(())
    }

    fn zero_grads(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    fn state_dict(&self) -> TrainResult<StateDict> {
        let mut state = StateDict::new();
        state.insert("w.weight".into(), ParamRecord::new(vec![2, 2], self.weights[..WEIGHT_LEN].to_vec())?);
        state.insert("w.bias".into(), ParamRecord::new(vec![2], self.weights[WEIGHT_LEN..].to_vec())?);
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &StateDict) -> TrainResult<()> {
        let (Some(weight), Some(bias)) = (state.get("w.weight"), state.get("w.bias")) else {
            return Err(TrainError::Model("state dict is missing 'w'".into()));
        };
        if state.len() != 2 || weight.numel() != WEIGHT_LEN || bias.numel() != PARAM_LEN - WEIGHT_LEN {
            return Err(TrainError::Model("state dict does not fit".into()));
        }
        self.weights = weight.data.iter().chain(&bias.data).copied().collect();
        Ok(())
    }

    fn crop_context_window(&mut self, window: usize) -> TrainResult<()> {
        if window > self.hp.context_window {
            return Err(TrainError::config("cannot grow context window"));
        }
        self.hp.context_window = window;
        Ok(())
    }

    fn estimate_utilization(&self, _tokens_per_iter: usize, _elapsed_secs: f64) -> f64 {
        0.5
    }
}

// ─── CountingOptimizer ────────────────────────────────────────────────────────
/// Plain SGD that records the learning rate of every step.
#[derive(Debug)]
pub struct CountingOptimizer {
    groups:         Vec<ParamGroup>,
    pub steps:      u64,
    pub lrs:        Vec<f64>,
    /// Gradient norm seen by each applied step
    pub grad_norms: Vec<f32>,
}

impl CountingOptimizer {
    pub fn new() -> Self {
        Self {
            groups: vec![
                ParamGroup { name: "decay".into(), learning_rate: 0.0, weight_decay: 0.1 },
                ParamGroup { name: "no_decay".into(), learning_rate: 0.0, weight_decay: 0.0 },
            ],
            steps:      0,
            lrs:        Vec::new(),
            grad_norms: Vec::new(),
        }
    }
}

impl Optimizer<ScriptedModel> for CountingOptimizer {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, model: &mut ScriptedModel) -> TrainResult<()> {
        let lr = self.groups[0].learning_rate;
        self.steps += 1;
        self.lrs.push(lr);
        self.grad_norms.push(model.grad_norm()?);
        model.apply_sgd(lr as f32);
        Ok(())
    }

    fn state_dict(&self, _model: &ScriptedModel) -> TrainResult<OptimizerState> {
        Ok(OptimizerState {
            step:   self.steps,
            groups: self.groups.clone(),
            ..Default::default()
        })
    }

    fn load_state_dict(&mut self, state: OptimizerState, _model: &ScriptedModel) -> TrainResult<()> {
        self.steps  = state.step;
        self.groups = state.groups;
        Ok(())
    }
}
