// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches the file system on behalf of a run:
//
//   config_resolver.rs — `defaults` fragment composition and
//                        typed parsing of the YAML documents
//
//   checkpoint.rs      — top-k checkpoint directories, the
//                        resumable `last/` state, best.json
//
//   tokenizer_store.rs — pretrained transformer directories
//                        (config.json + tokenizer.json)
//
//   metrics.rs         — validation metrics CSV log
//
//   tracking.rs        — ExperimentTracker implementation with
//                        an optional MLflow file store
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Root document + `defaults` fragments → ExperimentConfig
pub mod config_resolver;

/// Checkpoint retention, persistence and resume state
pub mod checkpoint;

/// Pretrained model directories and their tokenizers
pub mod tokenizer_store;

/// Validation metrics CSV logger
pub mod metrics;

/// Run tracking (local files, MLflow file store)
pub mod tracking;
