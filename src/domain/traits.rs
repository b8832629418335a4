// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The training loop only ever talks to these three seams,
// and the data pipeline starts from a fourth:
//
//   ExampleSource      → yields parsed corpus examples
//   BatchSource        → hands out training / validation batches
//   TrainableSystem    → runs one step, validates, (re)stores state
//   ExperimentTracker  → records config, metrics, artifacts, status
//
// The concrete Burn-backed system lives in ml::system, the file
// trackers in infra::tracking. Tests drive the loop with small
// in-memory fakes implementing the same traits.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::config::ExperimentConfig;
use crate::domain::error::{BatchDataError, QeResult};
use crate::domain::example::QeExample;
use crate::domain::metrics::MetricValues;

/// A batch, or the reason it had to be dropped.
pub type BatchOutcome<T> = Result<T, BatchDataError>;

pub type BatchIter<'a, T> = Box<dyn Iterator<Item = BatchOutcome<T>> + 'a>;

/// A parsed corpus line, or why it is malformed.
pub type ExampleOutcome = Result<QeExample, BatchDataError>;

// ─── ExampleSource ────────────────────────────────────────────────────────────
/// Any component that can produce QE examples.
///
/// Implementations:
///   - ParallelCorpusLoader → line-aligned WMT-style files
pub trait ExampleSource {
    /// Fatal problems (unreadable or misaligned files) are errors;
    /// a malformed line is returned in place as an `Err` outcome.
    fn load_all(&self) -> QeResult<Vec<ExampleOutcome>>;
}

// ─── BatchSource ──────────────────────────────────────────────────────────────
pub trait BatchSource {
    type TrainBatch;
    type ValidBatch;

    /// A fresh (reshuffled) pass over the training split.
    fn train_batches(&self) -> BatchIter<'_, Self::TrainBatch>;

    fn valid_batches(&self) -> BatchIter<'_, Self::ValidBatch>;

    fn num_train_batches(&self) -> usize;
}

// ─── TrainableSystem ──────────────────────────────────────────────────────────

/// Everything a training step needs to know that the loop decides.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    /// Optimizer steps completed before this batch.
    pub global_step:   usize,
    pub epoch:         usize,
    pub learning_rate: f64,
    /// Batches per optimizer step; the loss is scaled by its inverse.
    pub accumulation:  usize,
    /// False while gradients are still being accumulated.
    pub apply_update:  bool,
    pub encoder_frozen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Unscaled batch loss.
    pub loss: f64,
}

pub trait TrainableSystem {
    type TrainBatch;
    type ValidBatch;

    /// Forward + backward on one batch, stepping the optimizer when
    /// `ctx.apply_update` is set. A non-finite loss must be reported as
    /// `QeError::DivergedTraining` before any parameter changes.
    fn train_step(&mut self, batch: Self::TrainBatch, ctx: &StepContext) -> QeResult<StepReport>;

    /// Step the optimizer with the gradients accumulated since the last
    /// update. Called when an epoch ends before `accumulation` batches.
    fn apply_accumulated(&mut self, ctx: &StepContext) -> QeResult<()>;

    /// Metrics of the enabled heads over the validation split.
    fn evaluate(&mut self, batches: BatchIter<'_, Self::ValidBatch>) -> QeResult<MetricValues>;

    /// Persist model and optimizer state into `dir` (created by the caller).
    fn save_checkpoint(&self, dir: &Path) -> QeResult<()>;

    fn restore_checkpoint(&mut self, dir: &Path) -> QeResult<()>;
}

// ─── ExperimentTracker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    EarlyStopped,
    Interrupted,
    Failed,
}

pub trait ExperimentTracker {
    fn log_config(&mut self, config: &ExperimentConfig) -> QeResult<()>;

    fn log_metrics(&mut self, step: usize, metrics: &MetricValues) -> QeResult<()>;

    fn log_artifact(&mut self, path: &Path) -> QeResult<()>;

    fn finish(&mut self, status: RunStatus) -> QeResult<()>;
}
