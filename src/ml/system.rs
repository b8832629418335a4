// ============================================================
// Layer 5 — Burn Training System
// ============================================================
// The concrete TrainableSystem and BatchSource the training
// loop drives in production:
//
//   QeSystem        — owns the model, the optimizer and the
//                     gradient accumulator; one call = one
//                     forward/backward pass, plus an optimizer
//                     step when the loop asks for it
//   BurnBatchSource — Burn DataLoaders for both splits
//
// Validation runs on `model.valid()`, i.e. the inner backend
// without autodiff, so the validation batcher must build its
// tensors on B::InnerBackend as well.
//
// Checkpoint directory contents (full-precision named MessagePack, .mpk):
//   model      — the whole QeModel record
//   encoder    — the encoder alone, for `load_encoder`
//   optimizer  — optimizer moments, for resume
//
// Reference: Burn Book §5 (Training, Records)

use std::path::Path;
use std::sync::Arc;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};

use crate::data::batcher::{QeBatch, QeBatcher};
use crate::data::dataset::QeDataset;
use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics::{MetricAccumulator, MetricValues};
use crate::domain::traits::{BatchIter, BatchOutcome, BatchSource, StepContext, StepReport, TrainableSystem};
use crate::ml::encoder::Encoder;
use crate::ml::model::QeModel;
use crate::ml::optim::{clip_global_norm, drop_encoder_grads};

pub const MODEL_RECORD:     &str = "model";
pub const ENCODER_RECORD:   &str = "encoder";
pub const OPTIMIZER_RECORD: &str = "optimizer";

/// Records keep f32 weights and optimizer moments.
pub type QeRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

// ─── Record helpers ───────────────────────────────────────────────────────────

/// Load a full model record saved by `QeSystem::save_checkpoint` from `dir`.
pub fn load_model_record<B: Backend>(model: QeModel<B>, dir: &Path, device: &B::Device) -> QeResult<QeModel<B>> {
    let path = dir.join(MODEL_RECORD);
    let record = QeRecorder::new()
        .load(path.clone(), device)
        .map_err(|e| QeError::checkpoint_io(path, e))?;
    Ok(model.load_record(record))
}

/// Replace only the encoder weights with the record at `stem`
/// (a path without the `.mpk` extension).
pub fn load_encoder_record<B: Backend>(mut model: QeModel<B>, stem: &Path, device: &B::Device) -> QeResult<QeModel<B>> {
    let record = QeRecorder::new()
        .load(stem.to_path_buf(), device)
        .map_err(|e| QeError::checkpoint_io(stem, e))?;
    model.encoder = model.encoder.load_record(record);
    Ok(model)
}

/// Write the encoder weights alone to `stem`.
pub fn save_encoder_record<B: Backend>(encoder: &Encoder<B>, stem: &Path) -> QeResult<()> {
    QeRecorder::new()
        .record(encoder.clone().into_record(), stem.to_path_buf())
        .map_err(|e| QeError::checkpoint_io(stem, e))
}

/// Loss and enabled-head metrics of `model` over `batches`.
/// Malformed batches are skipped with a warning.
pub fn evaluate_model<B: Backend>(model: &QeModel<B>, batches: BatchIter<'_, QeBatch<B>>) -> MetricValues {
    let mut acc = MetricAccumulator::new();
    let mut skipped = 0usize;

    for outcome in batches {
        let forward = outcome.and_then(|batch| model.forward_loss(&batch).map(|f| (f, batch)));
        match forward {
            Ok((forward, batch)) => {
                acc.add_loss(forward.loss.into_scalar().elem::<f64>());
                model.outputs.record_metrics(forward.heads, &batch, &mut acc);
            }
            Err(e) => {
                skipped += 1;
                tracing::warn!("Skipping validation batch: {e}");
            }
        }
    }
    if skipped > 0 {
        tracing::warn!("{skipped} validation batches were malformed");
    }
    acc.finish()
}

/// Unshuffled loader over an evaluation split.
pub fn evaluation_loader<B: Backend>(
    dataset:  QeDataset,
    settings: &LoaderSettings,
    device:   B::Device,
) -> Arc<dyn DataLoader<BatchOutcome<QeBatch<B>>>> {
    let batcher = QeBatcher::<B>::new(device, settings.pad_id, settings.interleave);
    DataLoaderBuilder::new(batcher)
        .batch_size(settings.valid_batch_size.max(1))
        .num_workers(settings.num_workers.max(1))
        .build(dataset)
}

// ─── QeSystem ─────────────────────────────────────────────────────────────────

pub struct QeSystem<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<QeModel<B>, B>,
{
    model:         QeModel<B>,
    optim:         Option<O>,
    accumulator:   GradientsAccumulator<QeModel<B>>,
    max_grad_norm: Option<f64>,
    device:        B::Device,
}

impl<B, O> QeSystem<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<QeModel<B>, B>,
{
    pub fn new(model: QeModel<B>, optim: O, max_grad_norm: Option<f64>, device: B::Device) -> Self {
        Self {
            model,
            optim: Some(optim),
            accumulator: GradientsAccumulator::new(),
            max_grad_norm,
            device,
        }
    }

    pub fn model(&self) -> &QeModel<B> {
        &self.model
    }

    pub fn into_model(self) -> QeModel<B> {
        self.model
    }

    /// Clip and apply the accumulated gradients, then reset the accumulator.
    fn step_optimizer(&mut self, learning_rate: f64) -> QeResult<()> {
        let mut grads = self.accumulator.grads();
        if let Some(max_norm) = self.max_grad_norm {
            let norm = clip_global_norm::<B, _>(&self.model, &mut grads, max_norm);
            tracing::trace!("Gradient norm {norm:.4} (max {max_norm})");
        }
        let optim = self
            .optim
            .as_mut()
            .ok_or_else(|| QeError::resume_state(".", "optimizer state was lost during restore"))?;
        self.model = optim.step(learning_rate, self.model.clone(), grads);
        Ok(())
    }
}

impl<B, O> TrainableSystem for QeSystem<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<QeModel<B>, B>,
{
    type TrainBatch = QeBatch<B>;
    type ValidBatch = QeBatch<B::InnerBackend>;

    fn train_step(&mut self, batch: QeBatch<B>, ctx: &StepContext) -> QeResult<StepReport> {
        let forward = self.model.forward_loss(&batch)?;
        let loss = forward.loss.clone().into_scalar().elem::<f64>();
        if !loss.is_finite() {
            return Err(QeError::DivergedTraining { step: ctx.global_step, loss });
        }

        let scaled = if ctx.accumulation > 1 {
            forward.loss.div_scalar(ctx.accumulation as f64)
        } else {
            forward.loss
        };
        let mut grads = GradientsParams::from_grads(scaled.backward(), &self.model);
        if ctx.encoder_frozen {
            let dropped = drop_encoder_grads(&self.model, &mut grads);
            tracing::trace!("Encoder frozen: dropped {dropped} gradients");
        }
        self.accumulator.accumulate(&self.model, grads);

        if ctx.apply_update {
            self.step_optimizer(ctx.learning_rate)?;
        }

        Ok(StepReport { loss })
    }

    fn apply_accumulated(&mut self, ctx: &StepContext) -> QeResult<()> {
        self.step_optimizer(ctx.learning_rate)
    }

    fn evaluate(&mut self, batches: BatchIter<'_, QeBatch<B::InnerBackend>>) -> QeResult<MetricValues> {
        // model.valid() → QeModel<B::InnerBackend>, dropout disabled
        Ok(evaluate_model(&self.model.valid(), batches))
    }

    fn save_checkpoint(&self, dir: &Path) -> QeResult<()> {
        let recorder = QeRecorder::new();
        let model_path = dir.join(MODEL_RECORD);
        recorder
            .record(self.model.clone().into_record(), model_path.clone())
            .map_err(|e| QeError::checkpoint_io(model_path, e))?;

        save_encoder_record(&self.model.encoder, &dir.join(ENCODER_RECORD))?;

        if let Some(optim) = &self.optim {
            let optim_path = dir.join(OPTIMIZER_RECORD);
            Recorder::<B>::record(&recorder, optim.to_record(), optim_path.clone())
                .map_err(|e| QeError::checkpoint_io(optim_path, e))?;
        }
        Ok(())
    }

    fn restore_checkpoint(&mut self, dir: &Path) -> QeResult<()> {
        self.model = load_model_record(self.model.clone(), dir, &self.device)?;

        let optim_path = dir.join(OPTIMIZER_RECORD);
        if optim_path.with_extension("mpk").exists() {
            let record: O::Record = Recorder::<B>::load(&QeRecorder::new(), optim_path.clone(), &self.device)
                .map_err(|e| QeError::resume_state(&optim_path, e.to_string()))?;
            self.optim = self.optim.take().map(|optim| optim.load_record(record));
        } else {
            tracing::warn!("No optimizer state in '{}'; moments start from zero", dir.display());
        }
        self.accumulator = GradientsAccumulator::new();
        Ok(())
    }
}

// ─── BurnBatchSource ──────────────────────────────────────────────────────────

pub struct LoaderSettings {
    pub train_batch_size: usize,
    pub valid_batch_size: usize,
    pub num_workers:      usize,
    pub seed:             u64,
    pub pad_id:           u32,
    pub interleave:       bool,
}

pub struct BurnBatchSource<B: AutodiffBackend> {
    train:         Arc<dyn DataLoader<BatchOutcome<QeBatch<B>>>>,
    valid:         Arc<dyn DataLoader<BatchOutcome<QeBatch<B::InnerBackend>>>>,
    train_batches: usize,
}

impl<B: AutodiffBackend> BurnBatchSource<B> {
    pub fn new(train: QeDataset, valid: QeDataset, settings: &LoaderSettings, device: B::Device) -> Self {
        let train_batch_size = settings.train_batch_size.max(1);
        let train_batches = train.sample_count().div_ceil(train_batch_size);

        let train_batcher = QeBatcher::<B>::new(device.clone(), settings.pad_id, settings.interleave);
        let train = DataLoaderBuilder::new(train_batcher)
            .batch_size(train_batch_size)
            .shuffle(settings.seed)
            .num_workers(settings.num_workers.max(1))
            .build(train);
        let valid = evaluation_loader::<B::InnerBackend>(valid, settings, device);

        Self { train, valid, train_batches }
    }
}

impl<B: AutodiffBackend> BatchSource for BurnBatchSource<B> {
    type TrainBatch = QeBatch<B>;
    type ValidBatch = QeBatch<B::InnerBackend>;

    fn train_batches(&self) -> BatchIter<'_, QeBatch<B>> {
        Box::new(self.train.iter())
    }

    fn valid_batches(&self) -> BatchIter<'_, QeBatch<B::InnerBackend>> {
        Box::new(self.valid.iter())
    }

    fn num_train_batches(&self) -> usize {
        self.train_batches
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    use crate::domain::config::{ArchitectureKind, EncoderConfig, ModelConfig};
    use crate::ml::fixtures::{tiny_batch_with, tiny_samples};
    use crate::ml::model::{QeModelBuilder, SpecialIds};

    type AB = Autodiff<NdArray>;

    fn small_model(device: &<AB as Backend>::Device) -> QeModel<AB> {
        let mut cfg = ModelConfig {
            encoder: EncoderConfig { hidden_size: 6, rnn_layers: 1, out_embeddings_dim: 4, dropout: 0.0, ..EncoderConfig::default() },
            ..ModelConfig::default()
        };
        cfg.encoder.embeddings.source.dim = 4;
        cfg.encoder.embeddings.target.dim = 4;
        cfg.decoder.hidden_size = 5;
        cfg.decoder.bottleneck_size = 3;
        cfg.outputs.word_level.target = true;
        cfg.outputs.sentence_level.hter = true;
        QeModelBuilder {
            architecture:      ArchitectureKind::Predictor,
            model:             &cfg,
            source_vocab_size: 10,
            target_vocab_size: 10,
            shared_vocabulary: false,
            pretrained:        None,
            special:           SpecialIds { pad: 0, bos: 2, eos: 3 },
        }
        .build::<AB>(device)
        .unwrap()
    }

    fn step(global_step: usize, apply_update: bool, encoder_frozen: bool) -> StepContext {
        StepContext { global_step, epoch: 1, learning_rate: 1e-2, accumulation: 1, apply_update, encoder_frozen }
    }

    fn first_value(tensor: Tensor<NdArray, 2>) -> f32 {
        tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()[0]
    }

    fn head_weight(model: &QeModel<AB>) -> f32 {
        first_value(model.outputs.hter.as_ref().unwrap().projection.weight.val().inner())
    }

    fn embedding_weight(model: &QeModel<AB>) -> f32 {
        match &model.encoder {
            Encoder::Predictor(p) => first_value(p.target_embedding.weight.val().inner()),
            Encoder::Transformer(_) => unreachable!(),
        }
    }

    #[test]
    fn test_step_updates_parameters() {
        let device = Default::default();
        let model = small_model(&device);
        let before = head_weight(&model);
        let mut system = QeSystem::new(model, AdamConfig::new().init(), Some(1.0), device);

        let report = system.train_step(tiny_batch_with::<AB>(false), &step(0, true, false)).unwrap();
        assert!(report.loss.is_finite());
        let after = head_weight(system.model());
        assert_ne!(before, after);
    }

    #[test]
    fn test_accumulated_gradients_are_applied_on_flush() {
        let device = Default::default();
        let model = small_model(&device);
        let before = head_weight(&model);
        let mut system = QeSystem::new(model, AdamConfig::new().init(), None, device);

        let mut ctx = step(0, false, false);
        ctx.accumulation = 3;
        system.train_step(tiny_batch_with::<AB>(false), &ctx).unwrap();
        assert_eq!(head_weight(system.model()), before);

        system.apply_accumulated(&ctx).unwrap();
        assert_ne!(head_weight(system.model()), before);
    }

    #[test]
    fn test_frozen_encoder_is_untouched() {
        let device = Default::default();
        let model = small_model(&device);
        let before = embedding_weight(&model);
        let mut system = QeSystem::new(model, AdamConfig::new().init(), None, device);

        system.train_step(tiny_batch_with::<AB>(false), &step(0, true, true)).unwrap();
        let after = embedding_weight(system.model());
        assert_eq!(before, after);
    }

    #[test]
    fn test_checkpoint_round_trip_restores_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut system = QeSystem::new(small_model(&device), AdamConfig::new().init(), None, device);
        system.train_step(tiny_batch_with::<AB>(false), &step(0, true, false)).unwrap();
        system.save_checkpoint(tmp.path()).unwrap();
        assert!(tmp.path().join("model.mpk").exists());
        assert!(tmp.path().join("encoder.mpk").exists());
        assert!(tmp.path().join("optimizer.mpk").exists());
        let saved = head_weight(system.model());

        let mut fresh = QeSystem::new(small_model(&device), AdamConfig::new().init(), None, device);
        fresh.restore_checkpoint(tmp.path()).unwrap();
        assert_eq!(head_weight(fresh.model()), saved);
    }

    #[test]
    fn test_evaluate_reports_enabled_heads() {
        let device = Default::default();
        let mut system = QeSystem::new(small_model(&device), AdamConfig::new().init(), None, device);
        let batch = tiny_batch_with::<NdArray>(false);
        let metrics = system.evaluate(Box::new(std::iter::once(Ok(batch)))).unwrap();
        assert!(metrics.contains_key("loss"));
        assert!(metrics.contains_key("target_tags_MCC"));
        assert!(metrics.contains_key("PEARSON"));
    }

    #[test]
    fn test_batch_source_counts_batches() {
        let samples = tiny_samples();
        let n = samples.len();
        let dataset = || QeDataset::new(tiny_samples().into_iter().map(Ok).collect());
        let settings = LoaderSettings {
            train_batch_size: 1,
            valid_batch_size: 2,
            num_workers:      1,
            seed:             7,
            pad_id:           0,
            interleave:       false,
        };
        let source = BurnBatchSource::<AB>::new(dataset(), dataset(), &settings, Default::default());
        assert_eq!(source.num_train_batches(), n);
        assert_eq!(source.train_batches().count(), n);
        assert_eq!(source.valid_batches().count(), 1);
    }
}
