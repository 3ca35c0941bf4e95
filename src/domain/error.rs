// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every library layer (domain, data, ml, infra) returns
// TrainResult<T>. The application and CLI layers wrap these
// in anyhow with extra context before printing them.
//
// Variants map onto the failure classes of a training run:
//
//   Configuration      → bad config, rejected before any compute
//   DatasetNotFound    → train.bin / val.bin missing at open time
//   VocabularyNotFound → from-scratch run without meta.json
//   CheckpointNotFound → resume requested, slot is empty
//   CheckpointCorrupt  → slot exists but cannot be decoded
//   ShapeMismatch      → state dict does not fit the model
//   Model              → anything raised inside forward/backward
//   Io                 → any other filesystem failure
//
// Overflow under fp16 is deliberately absent: the loss scaler
// reports it as a StepOutcome and the loop keeps going.
//
// Reference: Rust Book §9 (Recoverable Errors with Result)

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("dataset split '{split}' not found at '{}'", .path.display())]
    DatasetNotFound { split: String, path: PathBuf },

    #[error(
        "vocabulary metadata not found at '{}' (required when training from scratch)",
        .0.display()
    )]
    VocabularyNotFound(PathBuf),

    #[error("no checkpoint found at '{}'", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("checkpoint '{}' is corrupt: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name:     String,
        expected: Vec<usize>,
        actual:   Vec<usize>,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainError {
    /// Shorthand used by every validate() in the crate
    pub fn config(msg: impl Into<String>) -> Self {
        TrainError::Configuration(msg.into())
    }

    /// True for failures that are detected before the loop starts
    /// because the configuration itself is unusable.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, TrainError::Configuration(_))
    }

    /// True for the "a required input is missing" family
    pub fn is_resource_not_found(&self) -> bool {
        matches!(
            self,
            TrainError::DatasetNotFound { .. }
                | TrainError::VocabularyNotFound(_)
                | TrainError::CheckpointNotFound(_)
        )
    }
}

pub type TrainResult<T> = Result<T, TrainError>;
