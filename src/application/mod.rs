// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Turns a validated configuration into a training run by
// wiring the data, ml and infra layers together.
//
// Rules for this layer:
//   - No ML math or model code here
//   - No argument parsing here (that's Layer 1)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The training workflow: fresh start or resume
pub mod train_use_case;
