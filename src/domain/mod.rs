// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust structs and traits that define what a training
// run is made of: token batches, weight records, hyperparameters,
// loop state, and the two capabilities (model, optimizer) the
// loop is written against.
//
// Rules for this layer:
//   - NO file I/O
//   - NO concrete model or optimizer code
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

/// Typed error taxonomy shared by every lower layer
pub mod error;

/// Portable parameter records and name → record state dicts
pub mod record;

/// Shape-defining model hyperparameters
pub mod hyperparams;

/// Token batches, corpus splits, and loop counters
pub mod state;

/// Batches on their way to the compute device
pub mod transfer;

/// LanguageModel and Optimizer capabilities
pub mod traits;
