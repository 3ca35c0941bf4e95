// ============================================================
// Layer 5 — ML Layer
// ============================================================
// The numerical half of training.
//
//   schedule.rs  — warmup + cosine learning-rate schedule
//   scaler.rs    — dynamic loss scaling for fp16
//   device.rs    — device / dtype parsing, burn backends
//   grads.rs     — accumulate, norm, scale and split gradients
//   weights.rs   — named parameters ↔ StateDict
//   evaluator.rs — averaged train/val loss under an eval-mode guard
//   trainer.rs   — the loop: accumulate, clip, step, evaluate,
//                  checkpoint, terminate
//
//   model.rs     — reference LanguageModel (burn GPT)
//   adamw.rs     — reference Optimizer (burn AdamW, two groups)
//
// trainer.rs depends only on the traits in domain::traits, so
// model.rs and adamw.rs are the only files that change when a
// different architecture or update rule is plugged in.
//
// Reference: Kingma & Ba (2015) Adam
//            Loshchilov & Hutter (2017, 2019)

/// Learning-rate schedule
pub mod schedule;

/// Dynamic loss scaler
pub mod scaler;

/// Compute device, precision, backends
pub mod device;

/// Whole-model gradient operations
pub mod grads;

/// Parameter names and state dicts
pub mod weights;

/// Loss estimation over both splits
pub mod evaluator;

/// Reference GPT language model
pub mod model;

/// Reference AdamW optimizer
pub mod adamw;

/// Training orchestrator
pub mod trainer;

#[cfg(test)]
pub mod testing;
