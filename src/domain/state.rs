// ============================================================
// Layer 3 — Batches and Training State
// ============================================================

use serde::{Deserialize, Serialize};

/// Which partition of the corpus a read comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Val];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val   => "val",
        }
    }

    /// File name of the flat token array for this split
    pub fn file_name(&self) -> &'static str {
        match self {
            Split::Train => "train.bin",
            Split::Val   => "val.bin",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── TokenBatch ───────────────────────────────────────────────────────────────
/// One minibatch: `inputs` and `targets` are both
/// (batch_size × window) stored row-major, and every target row
/// is the corresponding input row shifted one token forward.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    pub batch_size: usize,
    pub window:     usize,
    pub inputs:     Vec<u32>,
    pub targets:    Vec<u32>,
}

impl TokenBatch {
    /// Number of (input, target) token pairs in the batch
    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.window
    }
}

#[cfg(test)]
impl TokenBatch {
    pub fn input_row(&self, b: usize) -> &[u32] {
        &self.inputs[b * self.window..(b + 1) * self.window]
    }

    pub fn target_row(&self, b: usize) -> &[u32] {
        &self.targets[b * self.window..(b + 1) * self.window]
    }
}

// ─── TrainingState ────────────────────────────────────────────────────────────
/// Loop counters owned by the orchestrator. Model weights and
/// optimizer moments live inside the model and optimizer
/// objects; this struct carries the rest of what a checkpoint
/// must restore.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps taken so far, across resumes
    pub step_index:    u64,
    pub best_val_loss: f32,
}

impl TrainingState {
    /// Sentinel used before any evaluation has happened
    pub const INITIAL_BEST_VAL_LOSS: f32 = 1e9;

    pub fn fresh() -> Self {
        Self {
            step_index:    0,
            best_val_loss: Self::INITIAL_BEST_VAL_LOSS,
        }
    }
}
