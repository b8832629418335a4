// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that define what a QE experiment IS:
// its configuration, its examples and labels, its metrics,
// its failure modes, and the seams the training loop drives.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only structs, enums, traits and pure functions
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

/// Typed experiment configuration and its validation
pub mod config;

/// QeError / BatchDataError taxonomy
pub mod error;

/// Parallel-corpus examples and word-level tags
pub mod example;

/// Metric names, directions and the streaming accumulator
pub mod metrics;

/// Seams between the training loop and its collaborators
pub mod traits;

/// Hyperparameter search space and trial sampling
pub mod search;
