// ============================================================
// Layer 2 — EvaluateUseCase
// ============================================================
// Scores a trained checkpoint on held-out data:
//
//   Step 1: Resolve the loaded system    (config.yaml of the run)
//   Step 2: Load data.valid (or data.test)
//   Step 3: Index with the run's vocabularies / tokenizer
//   Step 4: Rebuild the model, load its record
//   Step 5: Metrics of every enabled head
//
// Runs on the plain backend: no autodiff graph, dropout off.
//
// Reference: Burn Book §5 (Inference)

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    prelude::*,
};

use crate::application::system_plan::{Indexers, SystemPlan};
use crate::data::dataset::{check_required_fields, QeDataset};
use crate::domain::config::ExperimentConfig;
use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics::MetricValues;
use crate::ml::system::{evaluate_model, evaluation_loader, LoaderSettings};

#[derive(Debug, Clone)]
pub struct EvaluateOutcome {
    pub checkpoint: PathBuf,
    /// `valid` or `test`, whichever split was scored.
    pub split:      String,
    pub metrics:    MetricValues,
}

pub struct EvaluateUseCase {
    config: ExperimentConfig,
}

impl EvaluateUseCase {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvaluateOutcome> {
        let cfg = &self.config;
        let checkpoint = cfg
            .system
            .load
            .clone()
            .ok_or_else(|| QeError::config("system.load", "evaluate needs a trained checkpoint"))?;
        let plan = SystemPlan::resolve(cfg).context("resolving the trained system")?;

        let (split, files) = match (&cfg.data.valid, &cfg.data.test) {
            (Some(files), _) => ("valid", files),
            (None, Some(files)) => ("test", files),
            (None, None) => {
                return Err(QeError::config("data.valid", "evaluate needs data.valid or data.test").into())
            }
        };
        let examples = plan.load_split(split, files).with_context(|| format!("loading data.{split}"))?;
        check_required_fields(&examples, &plan.model.outputs)?;

        let indexers = plan.indexers(None)?;
        let dataset = QeDataset::from_examples(&examples, &indexers.source, &indexers.target);

        let metrics = match cfg.trainer.gpus {
            0 => evaluate_on::<NdArray>(cfg, &plan, &indexers, dataset, NdArrayDevice::Cpu)?,
            _ => evaluate_on::<Wgpu>(cfg, &plan, &indexers, dataset, WgpuDevice::default())?,
        };
        let summary: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        tracing::info!("Checkpoint '{}' on {split}: {}", checkpoint.display(), summary.join(" "));

        Ok(EvaluateOutcome { checkpoint, split: split.to_string(), metrics })
    }
}

fn evaluate_on<B: Backend>(
    cfg:      &ExperimentConfig,
    plan:     &SystemPlan,
    indexers: &Indexers,
    dataset:  QeDataset,
    device:   B::Device,
) -> QeResult<MetricValues> {
    let model = plan.build_model::<B>(indexers, &device)?;
    let settings = LoaderSettings {
        train_batch_size: cfg.system.batch_size.train(),
        valid_batch_size: cfg.system.batch_size.valid(),
        num_workers:      cfg.system.num_data_workers,
        seed:             cfg.run.seed,
        pad_id:           indexers.pad_id(),
        interleave:       plan.model.encoder.interleave_input,
    };
    let loader = evaluation_loader::<B>(dataset, &settings, device);
    Ok(evaluate_model(&model, Box::new(loader.iter())))
}
