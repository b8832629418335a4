// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// Every failure the training pipeline can surface, grouped by
// how the caller must react to it:
//
//   Config / MissingField   → fatal, raised before any computation
//   ResumeState             → fatal, raised before the first step
//   DivergedTraining        → fatal, raised mid-training
//   CheckpointIo            → fatal, best model must never be lost
//   BatchData               → recoverable, the batch is skipped
//
// Reference: thiserror crate documentation

use std::path::PathBuf;

use thiserror::Error;

pub type QeResult<T> = std::result::Result<T, QeError>;

#[derive(Debug, Error)]
pub enum QeError {
    /// Malformed or contradictory configuration. `path` is the dotted
    /// field path (e.g. `system.optimizer.learning_rate`).
    #[error("invalid configuration at `{path}`: {message}")]
    Config { path: String, message: String },

    /// An enabled output head needs a data field that is not provided.
    #[error("output `{head}` is enabled but data field `{field}` is missing")]
    MissingField { head: String, field: String },

    #[error("training diverged at step {step}: loss is {loss}")]
    DivergedTraining { step: usize, loss: f64 },

    #[error(transparent)]
    BatchData(#[from] BatchDataError),

    #[error("checkpoint I/O failed for '{path}': {message}")]
    CheckpointIo { path: PathBuf, message: String },

    #[error("cannot resume from '{path}': {message}")]
    ResumeState { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QeError {
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config { path: path.into(), message: message.into() }
    }

    pub fn missing_field(head: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField { head: head.into(), field: field.into() }
    }

    pub fn checkpoint_io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::CheckpointIo { path: path.into(), message: message.to_string() }
    }

    pub fn resume_state(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ResumeState { path: path.into(), message: message.into() }
    }

    /// True for errors the training loop recovers from by skipping a batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BatchData(_))
    }
}

/// A single malformed example. Cheap to clone so it can travel through
/// the data loader's worker threads inside a batch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed example #{line} in {field}: {reason}")]
pub struct BatchDataError {
    pub line:   usize,
    pub field:  String,
    pub reason: String,
}

impl BatchDataError {
    pub fn new(line: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { line, field: field.into(), reason: reason.into() }
    }
}
