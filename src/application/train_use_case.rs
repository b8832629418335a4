// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates one training run in order:
//
//   Step 1: Resolve the system plan      (Layer 2 - system_plan)
//   Step 2: Assign run id + output dir   (Layer 6 - infra)
//   Step 3: Load train / valid splits    (Layer 4 - data)
//   Step 4: Build or reuse vocabularies  (Layer 4 - data)
//   Step 5: Encode into Burn datasets    (Layer 4 - data)
//   Step 6: Pick the device backend      (gpus: 0 → NdArray, else Wgpu)
//   Step 7: Build model + optimizer      (Layer 5 - ml)
//   Step 8: Run the training loop        (Layer 5 - ml)
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    optim::{AdamConfig, AdamWConfig, Optimizer},
    tensor::backend::AutodiffBackend,
};

use crate::application::system_plan::{Indexers, SystemPlan};
use crate::data::dataset::{check_required_fields, QeDataset};
use crate::data::splitter::split_train_val;
use crate::data::vocabulary::{Vocabularies, VOCABULARIES_FILE};
use crate::domain::config::{ExperimentConfig, OptimizerKind};
use crate::domain::error::{QeError, QeResult};
use crate::domain::traits::{BatchSource, ExampleOutcome, ExperimentTracker};
use crate::infra::tracking::{RunIdentity, RunTracker};
use crate::ml::model::QeModel;
use crate::ml::optim::{FreezePolicy, LrSchedule};
use crate::ml::system::{BurnBatchSource, LoaderSettings, QeSystem};
use crate::ml::trainer::{InterruptHandle, LoopSettings, RunContext, TrainingLoop, TrainingReport};

// ─── TrainUseCase ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub run_id:     String,
    pub output_dir: PathBuf,
    pub report:     TrainingReport,
}

pub struct TrainUseCase {
    config:    ExperimentConfig,
    interrupt: InterruptHandle,
}

impl TrainUseCase {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config, interrupt: InterruptHandle::new() }
    }

    /// Share a stop flag with the caller; setting it ends the run at the
    /// next batch boundary with a resumable `last/` checkpoint.
    pub fn with_interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn execute(&self) -> Result<TrainOutcome> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1-2: system plan and run identity ───────────────────────────
        let mut plan = SystemPlan::resolve(cfg).context("resolving the system to train")?;
        let identity = RunIdentity::assign(&cfg.run);
        fs::create_dir_all(&identity.output_dir)
            .with_context(|| format!("creating output directory '{}'", identity.output_dir.display()))?;
        tracing::info!("Run {} writing to '{}'", identity.run_id, identity.output_dir.display());

        let saved_vocabs = identity.output_dir.join(VOCABULARIES_FILE);
        if cfg.trainer.resume && plan.vocabularies.is_none() && saved_vocabs.exists() {
            plan.vocabularies = Some(Vocabularies::load(&saved_vocabs)?);
        }

        // ── Step 3: corpus ────────────────────────────────────────────────────
        let (train, valid) = load_training_data(cfg, &plan).context("loading training data")?;
        check_required_fields(&train, &plan.model.outputs)?;
        check_required_fields(&valid, &plan.model.outputs)?;

        // ── Step 4: vocabularies / tokenizer ─────────────────────────────────
        let indexers = plan.indexers(Some(&train))?;
        if let Some(vocabs) = &indexers.vocabularies {
            let path = vocabs.save(&identity.output_dir)?;
            tracing::info!("Vocabularies written to '{}'", path.display());
        }

        // ── Step 5: datasets ──────────────────────────────────────────────────
        let train_set = QeDataset::from_examples(&train, &indexers.source, &indexers.target);
        let valid_set = QeDataset::from_examples(&valid, &indexers.source, &indexers.target);
        tracing::info!(
            "Datasets: {} train ({} malformed), {} valid ({} malformed)",
            train_set.sample_count(),
            train_set.malformed_count(),
            valid_set.sample_count(),
            valid_set.malformed_count(),
        );

        // ── Step 6-8: device, model, loop ─────────────────────────────────────
        let job = TrainJob { cfg, plan: &plan, indexers: &indexers, identity: &identity, interrupt: &self.interrupt };
        let report = match cfg.trainer.gpus {
            0 => job.run::<Autodiff<NdArray>>(train_set, valid_set, NdArrayDevice::Cpu)?,
            gpus => {
                if gpus > 1 {
                    tracing::warn!("trainer.gpus = {gpus}: multi-device training is not supported; using one device");
                }
                job.run::<Autodiff<Wgpu>>(train_set, valid_set, WgpuDevice::default())?
            }
        };

        Ok(TrainOutcome { run_id: identity.run_id, output_dir: identity.output_dir, report })
    }
}

/// Train and valid examples; without `data.valid`, `data.split` carves
/// the validation set out of the shuffled training corpus.
fn load_training_data(
    cfg:  &ExperimentConfig,
    plan: &SystemPlan,
) -> QeResult<(Vec<ExampleOutcome>, Vec<ExampleOutcome>)> {
    let files = cfg
        .data
        .train
        .as_ref()
        .ok_or_else(|| QeError::config("data.train", "is required for training"))?;
    let train = plan.load_split("train", files)?;

    match (&cfg.data.valid, cfg.data.split) {
        (Some(valid), _) => Ok((train, plan.load_split("valid", valid)?)),
        (None, Some(fraction)) => {
            let (train, valid) = split_train_val(train, fraction, cfg.run.seed);
            tracing::info!("Split data.train: {} train, {} validation", train.len(), valid.len());
            Ok((train, valid))
        }
        (None, None) => Err(QeError::config(
            "data.valid",
            "is required unless data.split carves a validation set out of data.train",
        )),
    }
}

// ─── Backend-generic part ─────────────────────────────────────────────────────

struct TrainJob<'a> {
    cfg:       &'a ExperimentConfig,
    plan:      &'a SystemPlan,
    indexers:  &'a Indexers,
    identity:  &'a RunIdentity,
    interrupt: &'a InterruptHandle,
}

impl TrainJob<'_> {
    fn run<B: AutodiffBackend>(&self, train: QeDataset, valid: QeDataset, device: B::Device) -> QeResult<TrainingReport> {
        let cfg = self.cfg;
        B::seed(cfg.run.seed);

        let model = self.plan.build_model::<B>(self.indexers, &device)?;
        let loader = LoaderSettings {
            train_batch_size: cfg.system.batch_size.train(),
            valid_batch_size: cfg.system.batch_size.valid(),
            num_workers:      cfg.system.num_data_workers,
            seed:             cfg.run.seed,
            pad_id:           self.indexers.pad_id(),
            interleave:       self.plan.model.encoder.interleave_input,
        };
        let data = BurnBatchSource::<B>::new(train, valid, &loader, device.clone());

        match cfg.system.optimizer.class_name {
            OptimizerKind::Adam => {
                let optim = AdamConfig::new().with_epsilon(1e-8).init::<B, QeModel<B>>();
                self.drive(model, optim, &data, device)
            }
            OptimizerKind::Adamw => {
                let optim = AdamWConfig::new().with_epsilon(1e-8).init::<B, QeModel<B>>();
                self.drive(model, optim, &data, device)
            }
        }
    }

    fn drive<B, O>(
        &self,
        model:  QeModel<B>,
        optim:  O,
        data:   &BurnBatchSource<B>,
        device: B::Device,
    ) -> QeResult<TrainingReport>
    where
        B: AutodiffBackend,
        O: Optimizer<QeModel<B>, B>,
    {
        let cfg = self.cfg;
        let accumulation = cfg.trainer.gradient_accumulation_steps.max(1);
        let updates_per_epoch = data.num_train_batches().div_ceil(accumulation).max(1);
        let main_metrics = self.plan.main_metrics(cfg);

        let settings = LoopSettings {
            epochs:              cfg.trainer.epochs,
            log_interval:        cfg.trainer.log_interval,
            validation_interval: cfg.trainer.checkpoint.validation_steps.in_steps(updates_per_epoch),
            accumulation,
            save_top_k:          cfg.trainer.checkpoint.save_top_k,
            patience:            cfg.trainer.checkpoint.early_stop_patience,
            schedule:            LrSchedule::from_config(&cfg.system.optimizer, updates_per_epoch * cfg.trainer.epochs),
            freeze:              FreezePolicy::from_config(&self.plan.model.encoder),
            resume:              cfg.trainer.resume,
            fingerprint:         self.plan.fingerprint(&main_metrics)?,
            main_metrics,
        };

        let mut system = QeSystem::new(model, optim, cfg.trainer.gradient_max_norm, device);
        let mut tracker = RunTracker::new(&cfg.run, self.identity)?;
        tracker.log_config(&self.plan.logged_config(cfg))?;

        let ctx = RunContext {
            run_id:     self.identity.run_id.clone(),
            seed:       cfg.run.seed,
            output_dir: self.identity.output_dir.clone(),
            interrupt:  self.interrupt.clone(),
        };
        TrainingLoop::new(&mut system, data, &mut tracker, &ctx, settings).run()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fixtures::tiny_experiment;
    use crate::domain::traits::RunStatus;
    use crate::infra::checkpoint::{LAST_DIR, STATE_FILE};

    #[test]
    fn test_missing_validation_source_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = tiny_experiment(tmp.path());
        cfg.data.valid = None;
        let plan = SystemPlan::resolve(&cfg).unwrap();
        assert!(matches!(load_training_data(&cfg, &plan), Err(QeError::Config { .. })));

        cfg.data.split = Some(0.5);
        let (train, valid) = load_training_data(&cfg, &plan).unwrap();
        assert_eq!((train.len(), valid.len()), (3, 3));
    }

    #[test]
    fn test_training_run_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tiny_experiment(tmp.path());
        let outcome = TrainUseCase::new(cfg).execute().unwrap();

        assert_eq!(outcome.run_id, "test-run");
        assert_eq!(outcome.report.status, RunStatus::Completed);
        assert_eq!(outcome.report.global_step, 3);
        assert!(outcome.report.best.is_some());

        let run = outcome.output_dir;
        assert!(run.join("config.yaml").exists());
        assert!(run.join(VOCABULARIES_FILE).exists());
        assert!(run.join("metrics.csv").exists());
        assert!(run.join("checkpoints").join(LAST_DIR).join(STATE_FILE).exists());
        assert!(outcome.report.best_path.unwrap().join("model.mpk").exists());
    }

    #[test]
    fn test_interrupted_run_stops_before_the_first_step() {
        let tmp = tempfile::tempdir().unwrap();
        let interrupt = InterruptHandle::new();
        interrupt.interrupt();
        let outcome = TrainUseCase::new(tiny_experiment(tmp.path()))
            .with_interrupt(interrupt)
            .execute()
            .unwrap();
        assert_eq!(outcome.report.status, RunStatus::Interrupted);
        assert_eq!(outcome.report.global_step, 0);
    }
}
