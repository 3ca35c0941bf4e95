// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between the preprocessed token arrays on disk and
// a TokenBatch handed to the model:
//
//   data/<dataset>/train.bin, val.bin, meta.json
//       │
//       ▼
//   DatasetAccessor   → random-access reads, no full residency
//       │
//       ▼
//   BatchSampler      → uniform offsets / record indices,
//                       inputs + next-token targets
//       │
//       ▼
//   TokenBatch        → handed to ml::device for the transfer
//
// Reference: Rust Book §12 (I/O), rand crate documentation

/// Flat u16 token arrays and the DatasetAccessor over both splits
pub mod token_file;

/// Optional vocabulary metadata (meta.json)
pub mod vocab;

/// Contiguous-stream and fixed-record minibatch sampling
pub mod sampler;
