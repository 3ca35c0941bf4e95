// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// One slot per output directory holds the complete state
// needed to resume training bit-for-bit:
//
//   <out_dir>/ckpt.bin
//     [0..8]  magic  b"TLMCKPT1"
//     [8..]   bincode(Checkpoint)
//               model_state      — name → shape + f32 values
//               optimizer_state  — step, groups, named moment blobs
//               hyperparams      — architecture the weights fit
//               step_index       — next optimizer step to run
//               best_val_loss
//               config_snapshot  — TrainConfig as JSON
//
// Writes are atomic: the bytes go to ckpt.bin.tmp, are flushed
// and fsync'd, then renamed over the slot. A crash mid-write
// leaves the previous checkpoint untouched.
//
// Two pure helpers sit next to the file format because they
// only make sense when loading one:
//
//   reconcile_hyperparams()      — which architecture to build
//   normalize_state_dict_keys()  — drop the "_orig_mod." prefix
//                                  that graph compilation leaves
//                                  on parameter names
//
// Reference: Rust Book §9 (Error Handling)
//            bincode crate documentation

use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::domain::error::{TrainError, TrainResult};
use crate::domain::hyperparams::ArchitectureHyperparams;
use crate::domain::record::StateDict;
use crate::domain::traits::OptimizerState;

const MAGIC: &[u8; 8] = b"TLMCKPT1";
pub const CHECKPOINT_FILE: &str = "ckpt.bin";

/// Prefix a graph-compiled model adds to every parameter name
pub const COMPILED_PREFIX: &str = "_orig_mod.";

/// Everything persisted in the checkpoint slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub model_state:     StateDict,
    pub optimizer_state: OptimizerState,
    pub hyperparams:     ArchitectureHyperparams,
    pub step_index:      u64,
    pub best_val_loss:   f32,
    /// The run's TrainConfig serialised as JSON
    pub config_snapshot: String,
}

/// Owns the checkpoint slot inside one output directory.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Full path of the slot
    pub fn slot_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Atomically replace the slot with `ckpt`.
    pub fn save(&self, ckpt: &Checkpoint) -> TrainResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self.slot_path();
        let tmp  = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));

        {
            let file = File::create(&tmp)?;
            let mut w = BufWriter::new(file);
            w.write_all(MAGIC)?;
            bincode::serialize_into(&mut w, ckpt)
                .map_err(|e| TrainError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            let file = w.into_inner().map_err(|e| TrainError::Io(e.into_error()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        tracing::info!(
            "Saved checkpoint to '{}' (step {}, best val loss {:.4})",
            path.display(),
            ckpt.step_index,
            ckpt.best_val_loss
        );
        Ok(path)
    }

    /// Load the slot of this manager's directory.
    pub fn load(&self) -> TrainResult<Checkpoint> {
        load_checkpoint(&self.slot_path())
    }
}

/// Read and validate a checkpoint file.
///
/// Missing file → CheckpointNotFound. Wrong magic, truncated
/// payload, empty weights or malformed hyperparameters →
/// CheckpointCorrupt. There is no fallback to an older file.
pub fn load_checkpoint(path: &Path) -> TrainResult<Checkpoint> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TrainError::CheckpointNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let corrupt = |reason: String| TrainError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic header".into()));
    }

    let ckpt: Checkpoint = bincode::deserialize(&bytes[MAGIC.len()..])
        .map_err(|e| corrupt(format!("cannot decode payload: {e}")))?;

    if ckpt.model_state.is_empty() {
        return Err(corrupt("model state is empty".into()));
    }
    ckpt.hyperparams
        .validate()
        .map_err(|e| corrupt(format!("stored hyperparameters are invalid: {e}")))?;

    tracing::info!(
        "Loaded checkpoint '{}' at step {}",
        path.display(),
        ckpt.step_index
    );
    Ok(ckpt)
}

// ─── Resume helpers ───────────────────────────────────────────────────────────

/// Architecture for a resumed run: the shape-defining fields
/// come from the checkpoint, everything else (dropout) from the
/// requested config.
pub fn reconcile_hyperparams(
    requested: &ArchitectureHyperparams,
    loaded:    &ArchitectureHyperparams,
) -> ArchitectureHyperparams {
    ArchitectureHyperparams {
        layer_count:     loaded.layer_count,
        head_count:      loaded.head_count,
        embedding_width: loaded.embedding_width,
        context_window:  loaded.context_window,
        use_bias:        loaded.use_bias,
        vocab_size:      loaded.vocab_size,
        dropout_rate:    requested.dropout_rate,
    }
}

/// Strip COMPILED_PREFIX from every key that carries it.
pub fn normalize_state_dict_keys(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(COMPILED_PREFIX) {
            Some(stripped) => (stripped.to_string(), v),
            None => (k, v),
        })
        .collect()
}
