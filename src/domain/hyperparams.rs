// ============================================================
// Layer 3 — Architecture Hyperparameters
// ============================================================
// The numbers that fix the *shape* of a model.
//
// On resume, six of them are frozen by the checkpoint (see
// infra::checkpoint::reconcile_hyperparams). Dropout is the
// odd one out: it changes no tensor shape, so a resumed run
// may choose a different rate.

use serde::{Deserialize, Serialize};

use crate::domain::error::{TrainError, TrainResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureHyperparams {
    pub layer_count:     usize,
    pub head_count:      usize,
    pub embedding_width: usize,
    /// Longest sequence the position table covers
    pub context_window:  usize,
    pub use_bias:        bool,
    pub dropout_rate:    f32,
    pub vocab_size:      usize,
}

impl ArchitectureHyperparams {
    pub fn validate(&self) -> TrainResult<()> {
        if self.layer_count == 0 {
            return Err(TrainError::config("layer_count must be at least 1"));
        }
        if self.head_count == 0 || self.embedding_width % self.head_count != 0 {
            return Err(TrainError::config(format!(
                "embedding_width ({}) must be a positive multiple of head_count ({})",
                self.embedding_width, self.head_count
            )));
        }
        if self.context_window == 0 {
            return Err(TrainError::config("context_window must be at least 1"));
        }
        if self.vocab_size == 0 {
            return Err(TrainError::config("vocab_size must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(TrainError::config(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }

    /// Per-head width, Q in the utilization formula
    pub fn head_width(&self) -> usize {
        self.embedding_width / self.head_count
    }
}
