// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Persistence that outlives a single run:
//
//   checkpoint.rs — the atomic ckpt.bin slot, plus the resume
//                   helpers (hyperparameter reconciliation and
//                   state-dict key normalisation)
//
//   metrics.rs    — per-evaluation learning-curve CSV
//
// Reference: Rust Book §7 (Modules)
//            Rust Book §9 (Error Handling)

/// Checkpoint save / load / resume helpers
pub mod checkpoint;

/// Training metrics CSV logger
pub mod metrics;
