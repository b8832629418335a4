// ============================================================
// Layer 5 — Optimizer, Schedules and Gradient Policies
// ============================================================
// Everything that decides how gradients become updates:
//
//   LrSchedule    — learning rate as a pure function of the
//                   optimizer step and the epoch
//   FreezePolicy  — whether encoder gradients are dropped
//   clip_global_norm / drop_encoder_grads — gradient edits
//                   applied between backward and step
//
// Adam with epoch decay:
//   rate = lr                                 epoch ≤ decay_start
//   rate = lr · decay^(epoch − decay_start)   afterwards
//
// AdamW with linear warmup and decay:
//   rate(s) = lr · s / warmup                        s < warmup
//   rate(s) = lr · (total − s) / (total − warmup)    warmup ≤ s ≤ total
//   rate(s) = 0                                      s > total
//
// Reference: Kingma & Ba (2015) Adam
//            Loshchilov & Hutter (2019) Decoupled Weight Decay
//            Burn Book §5 (Optimizers)

use std::marker::PhantomData;

use burn::{
    module::{ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::domain::config::{EncoderConfig, OptimizerConfig, OptimizerKind};
use crate::ml::model::QeModel;

// ─── Learning rate schedule ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrPhase {
    Warmup,
    Steady,
    Decay,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrSchedule {
    Constant { lr: f64 },
    EpochDecay { lr: f64, decay: f64, start_epoch: usize },
    WarmupLinear { lr: f64, warmup_steps: usize, training_steps: usize },
}

impl LrSchedule {
    /// `estimated_steps` (updates per epoch × epochs) stands in for a
    /// missing `training_steps`.
    pub fn from_config(cfg: &OptimizerConfig, estimated_steps: usize) -> Self {
        match cfg.class_name {
            OptimizerKind::Adamw => {
                let training_steps = cfg.training_steps.unwrap_or(estimated_steps).max(1);
                Self::WarmupLinear {
                    lr: cfg.learning_rate,
                    warmup_steps: cfg.resolve_warmup_steps(training_steps),
                    training_steps,
                }
            }
            OptimizerKind::Adam if cfg.learning_rate_decay < 1.0 => Self::EpochDecay {
                lr:          cfg.learning_rate,
                decay:       cfg.learning_rate_decay,
                start_epoch: cfg.learning_rate_decay_start,
            },
            OptimizerKind::Adam => Self::Constant { lr: cfg.learning_rate },
        }
    }

    /// Rate for the update following `step` completed updates, in `epoch` (1-based).
    pub fn rate(&self, step: usize, epoch: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::EpochDecay { lr, decay, start_epoch } => {
                lr * decay.powi(epoch.saturating_sub(start_epoch) as i32)
            }
            Self::WarmupLinear { lr, warmup_steps, training_steps } => {
                if step < warmup_steps {
                    lr * step as f64 / warmup_steps as f64
                } else if step >= training_steps {
                    0.0
                } else {
                    lr * (training_steps - step) as f64 / (training_steps - warmup_steps) as f64
                }
            }
        }
    }

    pub fn phase(&self, step: usize, epoch: usize) -> LrPhase {
        match *self {
            Self::Constant { .. } => LrPhase::Steady,
            Self::EpochDecay { start_epoch, .. } if epoch > start_epoch => LrPhase::Decay,
            Self::EpochDecay { .. } => LrPhase::Steady,
            Self::WarmupLinear { warmup_steps, .. } if step < warmup_steps => LrPhase::Warmup,
            Self::WarmupLinear { .. } => LrPhase::Decay,
        }
    }
}

// ─── Encoder freezing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    Never,
    Always,
    /// Frozen while fewer than this many updates have been applied.
    UntilStep(usize),
}

impl FreezePolicy {
    pub fn from_config(cfg: &EncoderConfig) -> Self {
        match (cfg.freeze, cfg.freeze_for_number_of_steps) {
            (false, _) => Self::Never,
            (true, 0) => Self::Always,
            (true, steps) => Self::UntilStep(steps),
        }
    }

    pub fn is_frozen(&self, global_step: usize) -> bool {
        match *self {
            Self::Never => false,
            Self::Always => true,
            Self::UntilStep(steps) => global_step < steps,
        }
    }
}

// ─── Gradient visitors ────────────────────────────────────────────────────────

struct SquaredNorm<'a, B: AutodiffBackend> {
    grads:  &'a GradientsParams,
    sum:    f64,
    _marker: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct ScaleGrads<'a, B: AutodiffBackend> {
    grads:  &'a mut GradientsParams,
    factor: f64,
    _marker: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
    }
}

struct DropGrads<'a, B: AutodiffBackend> {
    grads:   &'a mut GradientsParams,
    dropped: usize,
    _marker: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for DropGrads<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if self.grads.remove::<B::InnerBackend, D>(id).is_some() {
            self.dropped += 1;
        }
    }
}

/// L2 norm over every gradient of `model`.
pub fn global_grad_norm<B: AutodiffBackend, M: Module<B>>(model: &M, grads: &GradientsParams) -> f64 {
    let mut visitor = SquaredNorm::<B> { grads, sum: 0.0, _marker: PhantomData };
    model.visit(&mut visitor);
    visitor.sum.sqrt()
}

/// Rescale all gradients so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_global_norm<B: AutodiffBackend, M: Module<B>>(
    model:    &M,
    grads:    &mut GradientsParams,
    max_norm: f64,
) -> f64 {
    let norm = global_grad_norm::<B, M>(model, grads);
    if norm > max_norm && norm.is_finite() {
        let mut visitor = ScaleGrads::<B> { grads, factor: max_norm / (norm + 1e-6), _marker: PhantomData };
        model.visit(&mut visitor);
    }
    norm
}

/// Remove every encoder gradient so the optimizer leaves the encoder untouched.
pub fn drop_encoder_grads<B: AutodiffBackend>(model: &QeModel<B>, grads: &mut GradientsParams) -> usize {
    let mut visitor = DropGrads::<B> { grads, dropped: 0, _marker: PhantomData };
    model.encoder.visit(&mut visitor);
    visitor.dropped
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};

    type AB = Autodiff<NdArray>;

    fn adamw(warmup: f64, training_steps: usize) -> LrSchedule {
        let cfg = OptimizerConfig {
            class_name:     OptimizerKind::Adamw,
            learning_rate:  1e-3,
            warmup_steps:   Some(warmup),
            training_steps: Some(training_steps),
            ..OptimizerConfig::default()
        };
        LrSchedule::from_config(&cfg, 0)
    }

    #[test]
    fn test_fractional_warmup_resolves_against_training_steps() {
        let schedule = adamw(0.15, 7000);
        assert!(matches!(schedule, LrSchedule::WarmupLinear { warmup_steps: 1050, .. }));
        assert_eq!(schedule.phase(1049, 1), LrPhase::Warmup);
        assert_eq!(schedule.phase(1050, 1), LrPhase::Decay);
    }

    #[test]
    fn test_warmup_shape() {
        let schedule = adamw(100.0, 1000);
        assert_eq!(schedule.rate(0, 1), 0.0);
        assert!((schedule.rate(100, 1) - 1e-3).abs() < 1e-12);
        assert_eq!(schedule.rate(1000, 1), 0.0);

        let rates: Vec<f64> = (0..=1000).map(|s| schedule.rate(s, 1)).collect();
        assert!(rates[..=100].windows(2).all(|w| w[0] <= w[1]));
        assert!(rates[100..].windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_epoch_decay() {
        let cfg = OptimizerConfig { learning_rate_decay: 0.5, learning_rate_decay_start: 2, ..OptimizerConfig::default() };
        let schedule = LrSchedule::from_config(&cfg, 0);
        assert_eq!(schedule.rate(0, 1), 1e-3);
        assert_eq!(schedule.rate(0, 2), 1e-3);
        assert_eq!(schedule.rate(0, 3), 5e-4);
        assert_eq!(schedule.rate(0, 4), 2.5e-4);
    }

    #[test]
    fn test_freeze_policy() {
        let mut cfg = EncoderConfig { freeze: true, ..EncoderConfig::default() };
        assert!(FreezePolicy::from_config(&cfg).is_frozen(1_000_000));

        cfg.freeze_for_number_of_steps = 10;
        let policy = FreezePolicy::from_config(&cfg);
        assert!(policy.is_frozen(9));
        assert!(!policy.is_frozen(10));

        cfg.freeze = false;
        assert_eq!(FreezePolicy::from_config(&cfg), FreezePolicy::Never);
    }

    #[test]
    fn test_clipping_bounds_the_global_norm() {
        let device = Default::default();
        let layer: Linear<AB> = LinearConfig::new(4, 3).init(&device);
        let x = Tensor::<AB, 2>::ones([2, 4], &device).mul_scalar(100.0);
        let loss = layer.forward(x).sum();
        let mut grads = GradientsParams::from_grads(loss.backward(), &layer);

        let before = clip_global_norm::<AB, _>(&layer, &mut grads, 1.0);
        assert!(before > 1.0);
        let after = global_grad_norm::<AB, _>(&layer, &grads);
        assert!(after <= 1.0 + 1e-4);
    }
}
