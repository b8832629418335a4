// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Drives any TrainableSystem over any BatchSource:
//
//   Initializing ─► Training ─► Validating ─► CheckpointDecision
//                      ▲                             │
//                      └─────────────────────────────┤
//                                                    ├─► EarlyStopped
//                                                    └─► Completed
//   (any batch boundary) ─► Interrupted
//
// Per batch:   lr from the schedule, freeze decision, forward +
//              backward, optimizer step every `accumulation`
//              batches (one global step).
// Per N steps: validate, log metrics, rank the result against
//              the retained checkpoints, update early stopping,
//              rewrite the resumable `last/` state.
//
// Malformed batches are skipped and counted; a non-finite loss
// aborts the run.
//
// Reference: Burn Book §5 (Training)
//            Prechelt (1998) Early Stopping — But When?

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics::{self, MetricValues};
use crate::domain::traits::{
    BatchSource, ExperimentTracker, RunStatus, StepContext, TrainableSystem,
};
use crate::infra::checkpoint::{CheckpointDecision, CheckpointEntry, CheckpointManager, TrainingState};
use crate::ml::optim::{FreezePolicy, LrSchedule};

/// Share of skipped batches above which a warning is logged.
const SKIP_WARNING_RATE: f64 = 0.10;

// ─── Run context ──────────────────────────────────────────────────────────────

/// Cooperative stop request, checked at every batch boundary.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity and external controls of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id:     String,
    pub seed:       u64,
    pub output_dir: PathBuf,
    pub interrupt:  InterruptHandle,
}

// ─── Early stopping ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopState {
    patience: usize,
    count:    usize,
    best:     Option<f64>,
}

impl EarlyStopState {
    /// `patience` 0 never stops.
    pub fn new(patience: usize) -> Self {
        Self { patience, count: 0, best: None }
    }

    pub fn restore(patience: usize, count: usize, best: Option<f64>) -> Self {
        Self { patience, count, best }
    }

    /// Record a validation result; true when it improved on the best.
    /// A non-finite value never improves and never becomes the best.
    pub fn observe(&mut self, metric: &str, value: f64) -> bool {
        let improved = value.is_finite()
            && self.best.map_or(true, |best| metrics::is_improvement(metric, value, best));
        if improved {
            self.best  = Some(value);
            self.count = 0;
        } else {
            self.count += 1;
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.patience > 0 && self.count >= self.patience
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

// ─── Settings and report ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub epochs:              usize,
    pub log_interval:        usize,
    /// Validate every this many optimizer steps.
    pub validation_interval: usize,
    pub accumulation:        usize,
    pub save_top_k:          i64,
    pub patience:            usize,
    pub main_metrics:        Vec<String>,
    pub schedule:            LrSchedule,
    pub freeze:              FreezePolicy,
    pub resume:              bool,
    /// Canonical description of the run a resumable state must match.
    pub fingerprint:         String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Initializing,
    Training,
    Validating,
    CheckpointDecision,
    Completed,
    EarlyStopped,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub status:          RunStatus,
    pub global_step:     usize,
    pub epochs_started:  usize,
    pub best:            Option<CheckpointEntry>,
    pub best_path:       Option<PathBuf>,
    pub retained:        Vec<CheckpointEntry>,
    pub last_metrics:    Option<MetricValues>,
    pub skipped_batches: usize,
    pub seen_batches:    usize,
}

// ─── TrainingLoop ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct LossWindow {
    sum:   f64,
    count: usize,
}

impl LossWindow {
    fn add(&mut self, loss: f64) {
        self.sum   += loss;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

struct Counters {
    epoch:              usize,
    batches_into_epoch: usize,
    global_step:        usize,
    pending:            usize,
    skipped:            usize,
    seen:               usize,
}

pub struct TrainingLoop<'a, S, D, T> {
    system:   &'a mut S,
    data:     &'a D,
    tracker:  &'a mut T,
    ctx:      &'a RunContext,
    settings: LoopSettings,
    phase:    LoopPhase,
}

impl<'a, S, D, T> TrainingLoop<'a, S, D, T>
where
    S: TrainableSystem,
    D: BatchSource<TrainBatch = S::TrainBatch, ValidBatch = S::ValidBatch>,
    T: ExperimentTracker,
{
    pub fn new(system: &'a mut S, data: &'a D, tracker: &'a mut T, ctx: &'a RunContext, settings: LoopSettings) -> Self {
        Self { system, data, tracker, ctx, settings, phase: LoopPhase::Initializing }
    }

    fn enter(&mut self, phase: LoopPhase) {
        tracing::debug!("Training loop: {:?} → {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn run(mut self) -> QeResult<TrainingReport> {
        match self.run_inner() {
            Ok(report) => {
                if let Some(best) = &report.best_path {
                    self.tracker.log_artifact(best)?;
                }
                self.tracker.finish(report.status)?;
                Ok(report)
            }
            Err(e) => {
                if let Err(finish_err) = self.tracker.finish(RunStatus::Failed) {
                    tracing::warn!("Could not mark run as failed: {finish_err}");
                }
                Err(e)
            }
        }
    }

    fn run_inner(&mut self) -> QeResult<TrainingReport> {
        let s = self.settings.clone();
        let data = self.data;
        let mut checkpoints = CheckpointManager::new(&self.ctx.output_dir, s.save_top_k)?;
        let mut early = EarlyStopState::new(s.patience);
        let mut c = Counters { epoch: 1, batches_into_epoch: 0, global_step: 0, pending: 0, skipped: 0, seen: 0 };
        let mut last_metrics = None;

        if s.resume {
            self.resume(&mut checkpoints, &mut early, &mut c)?;
        }

        let train_batches = data.num_train_batches();
        let validation_interval = s.validation_interval.max(1);
        let accumulation        = s.accumulation.max(1);
        tracing::info!(
            "Run {} (seed {}): {} epochs, {} batches/epoch, validating every {} steps",
            self.ctx.run_id, self.ctx.seed, s.epochs, train_batches, validation_interval,
        );

        let start_epoch = c.epoch;
        for epoch in start_epoch..=s.epochs {
            self.enter(LoopPhase::Training);
            c.epoch = epoch;
            let skip = if epoch == start_epoch { c.batches_into_epoch } else { 0 };
            c.batches_into_epoch = 0;

            let mut epoch_loss  = LossWindow::default();
            let mut log_window  = LossWindow::default();
            let mut epoch_seen  = 0usize;
            let mut epoch_skips = 0usize;

            for outcome in data.train_batches() {
                c.batches_into_epoch += 1;
                if c.batches_into_epoch <= skip {
                    continue;
                }
                if self.ctx.interrupt.is_interrupted() {
                    c.batches_into_epoch -= 1;
                    self.enter(LoopPhase::Interrupted);
                    tracing::warn!("Interrupted at step {}; saving resumable state", c.global_step);
                    self.save_last(&checkpoints, &early, &c)?;
                    return Ok(self.report(RunStatus::Interrupted, &checkpoints, &c, last_metrics));
                }
                c.seen     += 1;
                epoch_seen += 1;

                let batch = match outcome {
                    Ok(batch) => batch,
                    Err(e) => {
                        c.skipped   += 1;
                        epoch_skips += 1;
                        tracing::warn!("Skipping batch: {e}");
                        continue;
                    }
                };

                c.pending += 1;
                let step_ctx = StepContext {
                    global_step:    c.global_step,
                    epoch,
                    learning_rate:  s.schedule.rate(c.global_step, epoch),
                    accumulation,
                    apply_update:   c.pending >= accumulation,
                    encoder_frozen: s.freeze.is_frozen(c.global_step),
                };

                let report = match self.system.train_step(batch, &step_ctx) {
                    Ok(report) => report,
                    Err(QeError::BatchData(e)) => {
                        c.pending   -= 1;
                        c.skipped   += 1;
                        epoch_skips += 1;
                        tracing::warn!("Skipping batch: {e}");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                epoch_loss.add(report.loss);
                log_window.add(report.loss);

                if step_ctx.apply_update
                    && self.after_update(&s, &mut checkpoints, &mut early, &mut c, &mut log_window, &step_ctx, &mut last_metrics)?
                {
                    return Ok(self.report(RunStatus::EarlyStopped, &checkpoints, &c, last_metrics));
                }
            }

            // Gradients of a trailing partial group belong to this epoch.
            if c.pending > 0 {
                let step_ctx = StepContext {
                    global_step:    c.global_step,
                    epoch,
                    learning_rate:  s.schedule.rate(c.global_step, epoch),
                    accumulation,
                    apply_update:   true,
                    encoder_frozen: s.freeze.is_frozen(c.global_step),
                };
                tracing::debug!("Applying {} leftover accumulated batches at the end of epoch {epoch}", c.pending);
                self.system.apply_accumulated(&step_ctx)?;
                if self.after_update(&s, &mut checkpoints, &mut early, &mut c, &mut log_window, &step_ctx, &mut last_metrics)? {
                    return Ok(self.report(RunStatus::EarlyStopped, &checkpoints, &c, last_metrics));
                }
            }

            let avg_train_loss = epoch_loss.mean().unwrap_or(f64::NAN);
            println!(
                "Epoch {:>3}/{} | train_loss={:.4} | steps={} | skipped={}",
                epoch, s.epochs, avg_train_loss, c.global_step, epoch_skips,
            );
            if epoch_seen > 0 && epoch_skips as f64 / epoch_seen as f64 > SKIP_WARNING_RATE {
                tracing::warn!(
                    "{} of {} batches in epoch {} were malformed and skipped",
                    epoch_skips, epoch_seen, epoch,
                );
            }

            // Next resume starts at the beginning of the following epoch.
            c.epoch = epoch + 1;
            c.batches_into_epoch = 0;
            self.save_last(&checkpoints, &early, &c)?;
        }

        self.enter(LoopPhase::Completed);
        tracing::info!("Training complete after {} steps", c.global_step);
        Ok(self.report(RunStatus::Completed, &checkpoints, &c, last_metrics))
    }

    /// Bookkeeping once the optimizer stepped: count the step, log the
    /// train loss, validate on schedule. True when early stopping fired.
    #[allow(clippy::too_many_arguments)]
    fn after_update(
        &mut self,
        s:            &LoopSettings,
        checkpoints:  &mut CheckpointManager,
        early:        &mut EarlyStopState,
        c:            &mut Counters,
        log_window:   &mut LossWindow,
        step_ctx:     &StepContext,
        last_metrics: &mut Option<MetricValues>,
    ) -> QeResult<bool> {
        c.pending = 0;
        c.global_step += 1;

        if s.log_interval > 0 && c.global_step % s.log_interval == 0 {
            if let Some(avg) = log_window.mean() {
                tracing::info!(
                    "step {:>6} | epoch {} | loss {:.4} | lr {:.3e}",
                    c.global_step, step_ctx.epoch, avg, step_ctx.learning_rate,
                );
                let train = MetricValues::from([("train_loss".to_string(), avg)]);
                self.tracker.log_metrics(c.global_step, &train)?;
            }
            *log_window = LossWindow::default();
        }

        if c.global_step % s.validation_interval.max(1) != 0 {
            return Ok(false);
        }
        *last_metrics = Some(self.validate(s, checkpoints, early, c)?);
        if early.should_stop() {
            self.enter(LoopPhase::EarlyStopped);
            tracing::info!(
                "Early stopping at step {}: no improvement in {} validations",
                c.global_step, early.count(),
            );
            return Ok(true);
        }
        self.enter(LoopPhase::Training);
        Ok(false)
    }

    fn resume(
        &mut self,
        checkpoints: &mut CheckpointManager,
        early:       &mut EarlyStopState,
        c:           &mut Counters,
    ) -> QeResult<()> {
        let Some(state) = checkpoints.load_last_state()? else {
            tracing::warn!(
                "resume is set but '{}' holds no saved state; starting from scratch",
                checkpoints.last_dir().display()
            );
            return Ok(());
        };
        if state.fingerprint != self.settings.fingerprint {
            return Err(QeError::resume_state(
                checkpoints.last_dir(),
                "saved state was produced by a different model or metric configuration",
            ));
        }
        self.system.restore_checkpoint(&checkpoints.last_dir())?;
        checkpoints.restore_retained(self.settings.save_top_k, state.retained);
        *early = EarlyStopState::restore(self.settings.patience, state.early_stop_count, state.best_value);
        c.epoch              = state.epoch;
        c.batches_into_epoch = state.batches_into_epoch;
        c.global_step        = state.global_step;
        tracing::info!(
            "Resumed at epoch {}, step {} ({} batches into the epoch)",
            c.epoch, c.global_step, c.batches_into_epoch,
        );
        Ok(())
    }

    fn validate(
        &mut self,
        s:           &LoopSettings,
        checkpoints: &mut CheckpointManager,
        early:       &mut EarlyStopState,
        c:           &Counters,
    ) -> QeResult<MetricValues> {
        self.enter(LoopPhase::Validating);
        let data = self.data;
        let metrics = self.system.evaluate(data.valid_batches())?;
        self.tracker.log_metrics(c.global_step, &metrics)?;

        let primary = match metrics::primary_metric(&s.main_metrics, &metrics) {
            Some((name, value)) => Some((name.to_string(), value)),
            None => {
                tracing::warn!(
                    "None of the main metrics {:?} was produced; ranking by `{}`",
                    s.main_metrics, metrics::LOSS,
                );
                metrics.get(metrics::LOSS).map(|v| (metrics::LOSS.to_string(), *v))
            }
        };
        let Some((name, value)) = primary else {
            return Ok(metrics);
        };
        let summary: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        tracing::info!("Validation at step {}: {}", c.global_step, summary.join(" "));

        self.enter(LoopPhase::CheckpointDecision);
        let improved = early.observe(&name, value);
        if improved {
            tracing::info!("New best {name}={value:.4} at step {}", c.global_step);
        }

        let entry  = CheckpointEntry::new(c.global_step, c.epoch, &name, value, metrics.clone());
        let system = &*self.system;
        match checkpoints.consider(entry, |dir| system.save_checkpoint(dir))? {
            CheckpointDecision::Saved { path, pruned } => {
                tracing::info!("Saved checkpoint '{}'", path.display());
                if !pruned.is_empty() {
                    tracing::debug!("Pruned {:?}", pruned);
                }
            }
            CheckpointDecision::Rejected => {
                tracing::debug!("Checkpoint at step {} not in the top-k set", c.global_step);
            }
        }

        self.save_last(checkpoints, early, c)?;
        Ok(metrics)
    }

    fn save_last(&self, checkpoints: &CheckpointManager, early: &EarlyStopState, c: &Counters) -> QeResult<()> {
        let state = TrainingState {
            epoch:              c.epoch,
            batches_into_epoch: c.batches_into_epoch,
            global_step:        c.global_step,
            early_stop_count:   early.count(),
            best_value:         early.best(),
            retained:           checkpoints.retained().to_vec(),
            fingerprint:        self.settings.fingerprint.clone(),
            saved_at:           Utc::now(),
        };
        let system = &*self.system;
        checkpoints.save_last(&state, |dir| system.save_checkpoint(dir))
    }

    fn report(
        &self,
        status:       RunStatus,
        checkpoints:  &CheckpointManager,
        c:            &Counters,
        last_metrics: Option<MetricValues>,
    ) -> TrainingReport {
        let best = checkpoints.best().cloned();
        TrainingReport {
            status,
            global_step:     c.global_step,
            epochs_started:  c.epoch,
            best_path:       best.as_ref().map(|b| checkpoints.path_of(b)),
            best,
            retained:        checkpoints.retained().to_vec(),
            last_metrics,
            skipped_batches: c.skipped,
            seen_batches:    c.seen,
        }
    }
}
