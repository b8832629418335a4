// ============================================================
// Layer 5 — Output Heads
// ============================================================
// Independently toggleable prediction heads on top of the
// decoder features. A disabled head is simply `None`: it has
// no weights, contributes no loss term and produces no metric.
//
//   target_tags   per target word   OK/BAD   weighted CE
//   gap_tags      per gap           OK/BAD   weighted CE
//   source_tags   per source word   OK/BAD   weighted CE
//   hter          per sentence      [0, 1]   MSE, or truncated-normal NLL
//   binary        per sentence      OK/BAD   CE on hter > threshold
//
//   total = Σ word losses + sentence_loss_weight · Σ sentence losses
//
// Reference: Burn Book §3 (Building Blocks)
//            Specia et al. (2018) Quality Estimation for MT

use std::f64::consts::{PI, SQRT_2};

use burn::{
    nn::{loss::{MseLoss, Reduction}, Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::{sigmoid, softplus},
};

use crate::data::batcher::QeBatch;
use crate::domain::config::OutputsConfig;
use crate::domain::error::BatchDataError;
use crate::domain::example::{TagField, PAD_INDEX};
use crate::domain::metrics::MetricAccumulator;
use crate::ml::decoder::DecoderOutput;
use crate::ml::tensor_ops::{argmax_last, gap_features, masked_cross_entropy, to_f32_vec, to_i32_vec};

// ─── Heads ────────────────────────────────────────────────────────────────────

/// OK/BAD classifier over a sequence of feature rows.
#[derive(Module, Debug)]
pub struct TagHead<B: Backend> {
    pub projection: Linear<B>,
    pub weight_ok:  f32,
    pub weight_bad: f32,
}

impl<B: Backend> TagHead<B> {
    fn new(input_dim: usize, weights: [f32; 2], device: &B::Device) -> Self {
        Self {
            projection: LinearConfig::new(input_dim, 2).init(device),
            weight_ok:  weights[0],
            weight_bad: weights[1],
        }
    }

    /// features [N, W, D] → logits [N, W, 2]
    pub fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        self.projection.forward(features)
    }

    pub fn loss(&self, logits: Tensor<B, 3>, tags: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let weights = Tensor::<B, 1>::from_floats([self.weight_ok, self.weight_bad], &logits.device());
        masked_cross_entropy(logits, tags, Some(weights), PAD_INDEX as i64)
    }
}

#[derive(Module, Debug)]
pub struct HterHead<B: Backend> {
    pub projection: Linear<B>,
    /// Present when the head predicts a distribution instead of a point.
    pub sigma:      Option<Linear<B>>,
}

impl<B: Backend> HterHead<B> {
    /// sentence [N, D] → (mean [N], sigma [N])
    pub fn forward(&self, sentence: Tensor<B, 2>) -> (Tensor<B, 1>, Option<Tensor<B, 1>>) {
        let n     = sentence.dims()[0];
        let mean  = sigmoid(self.projection.forward(sentence.clone())).reshape([n]);
        let sigma = self.sigma.as_ref().map(|s| (softplus(s.forward(sentence), 1.0) + 1e-4).reshape([n]));
        (mean, sigma)
    }

    pub fn loss(&self, mean: Tensor<B, 1>, sigma: Option<Tensor<B, 1>>, gold: Tensor<B, 1>) -> Tensor<B, 1> {
        match sigma {
            Some(sigma) => truncated_normal_nll(mean, sigma, gold),
            None => MseLoss::new().forward(mean, gold, Reduction::Mean),
        }
    }
}

/// Mean negative log-likelihood of `gold` under N(mean, sigma²)
/// truncated to [0, 1].
pub fn truncated_normal_nll<B: Backend>(
    mean:  Tensor<B, 1>,
    sigma: Tensor<B, 1>,
    gold:  Tensor<B, 1>,
) -> Tensor<B, 1> {
    let cdf = |x: Tensor<B, 1>| (x / SQRT_2).erf().add_scalar(1.0).mul_scalar(0.5);

    let z       = (gold - mean.clone()) / sigma.clone();
    let upper   = cdf((mean.clone().neg().add_scalar(1.0)) / sigma.clone());
    let lower   = cdf(mean.neg() / sigma.clone());
    let log_pdf = z.powf_scalar(2.0).mul_scalar(-0.5).sub_scalar(0.5 * (2.0 * PI).ln());
    let log_z   = (upper - lower).clamp_min(1e-12).log();

    (log_z + sigma.log() - log_pdf).mean()
}

#[derive(Module, Debug)]
pub struct BinaryHead<B: Backend> {
    pub projection: Linear<B>,
    pub threshold:  f32,
}

impl<B: Backend> BinaryHead<B> {
    /// sentence [N, D] → logits [N, 2]
    pub fn forward(&self, sentence: Tensor<B, 2>) -> Tensor<B, 2> {
        self.projection.forward(sentence)
    }

    /// BAD (1) when the HTER exceeds the threshold. → [N]
    pub fn labels(&self, hter: Tensor<B, 1>) -> Tensor<B, 1, Int> {
        hter.greater_elem(self.threshold).int()
    }

    pub fn loss(&self, logits: Tensor<B, 2>, hter: Tensor<B, 1>) -> Tensor<B, 1> {
        let [n, c] = logits.dims();
        let labels = self.labels(hter).reshape([n, 1]);
        masked_cross_entropy(logits.reshape([n, 1, c]), labels, None, -1)
    }
}

// ─── OutputHeads ──────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct OutputHeads<B: Backend> {
    pub target_tags: Option<TagHead<B>>,
    pub gap_tags:    Option<TagHead<B>>,
    pub source_tags: Option<TagHead<B>>,
    pub hter:        Option<HterHead<B>>,
    pub binary:      Option<BinaryHead<B>>,
    pub dropout:     Dropout,
    pub sentence_loss_weight: f32,
}

/// Raw predictions of the enabled heads.
pub struct HeadOutputs<B: Backend> {
    pub target_tags: Option<Tensor<B, 3>>,
    pub gap_tags:    Option<Tensor<B, 3>>,
    pub source_tags: Option<Tensor<B, 3>>,
    pub hter:        Option<Tensor<B, 1>>,
    pub hter_sigma:  Option<Tensor<B, 1>>,
    pub binary:      Option<Tensor<B, 2>>,
}

impl<B: Backend> HeadOutputs<B> {
    fn tags(&self, field: TagField) -> Option<&Tensor<B, 3>> {
        match field {
            TagField::TargetTags => self.target_tags.as_ref(),
            TagField::GapTags    => self.gap_tags.as_ref(),
            TagField::SourceTags => self.source_tags.as_ref(),
        }
    }
}

/// One weighted loss term per enabled head.
pub struct LossTerm<B: Backend> {
    pub name:   &'static str,
    pub weight: f64,
    pub value:  Tensor<B, 1>,
}

/// Σ weight · value over the given terms.
pub fn weighted_total<B: Backend>(terms: &[LossTerm<B>], device: &B::Device) -> Tensor<B, 1> {
    terms.iter().fold(Tensor::zeros([1], device), |acc, term| {
        acc + term.value.clone().mul_scalar(term.weight)
    })
}

impl<B: Backend> OutputHeads<B> {
    /// Build the heads enabled in `cfg` for the given feature widths.
    pub fn new(
        cfg:          &OutputsConfig,
        target_dim:   usize,
        source_dim:   usize,
        sentence_dim: usize,
        device:       &B::Device,
    ) -> Self {
        let word     = &cfg.word_level;
        let sentence = &cfg.sentence_level;
        let weights  = &word.class_weights;
        Self {
            target_tags: word.target.then(|| TagHead::new(target_dim, weights.target_tags.as_array(), device)),
            gap_tags:    word.gaps.then(|| TagHead::new(2 * target_dim, weights.gap_tags.as_array(), device)),
            source_tags: word.source.then(|| TagHead::new(source_dim, weights.source_tags.as_array(), device)),
            hter: sentence.hter.then(|| HterHead {
                projection: LinearConfig::new(sentence_dim, 1).init(device),
                sigma: sentence
                    .use_distribution
                    .then(|| LinearConfig::new(sentence_dim, 1).init(device)),
            }),
            binary: sentence.binary.then(|| BinaryHead {
                projection: LinearConfig::new(sentence_dim, 2).init(device),
                threshold:  sentence.binary_threshold as f32,
            }),
            dropout: DropoutConfig::new(cfg.dropout).init(),
            sentence_loss_weight: cfg.sentence_loss_weight as f32,
        }
    }

    pub fn forward(&self, features: &DecoderOutput<B>, target_pad: Tensor<B, 2, Bool>) -> HeadOutputs<B> {
        let target   = self.dropout.forward(features.target.clone());
        let source   = self.dropout.forward(features.source.clone());
        let sentence = self.dropout.forward(features.sentence.clone());

        let (hter, hter_sigma) = match &self.hter {
            Some(head) => {
                let (mean, sigma) = head.forward(sentence.clone());
                (Some(mean), sigma)
            }
            None => (None, None),
        };

        HeadOutputs {
            gap_tags:    self.gap_tags.as_ref().map(|h| h.forward(gap_features(target.clone(), target_pad))),
            target_tags: self.target_tags.as_ref().map(|h| h.forward(target)),
            source_tags: self.source_tags.as_ref().map(|h| h.forward(source)),
            binary:      self.binary.as_ref().map(|h| h.forward(sentence)),
            hter,
            hter_sigma,
        }
    }

    /// Loss terms of the enabled heads. A batch missing the labels of an
    /// enabled head is malformed.
    pub fn losses(&self, outputs: &HeadOutputs<B>, batch: &QeBatch<B>) -> Result<Vec<LossTerm<B>>, BatchDataError> {
        let missing = |field: &str| {
            BatchDataError::new(batch.lines.first().copied().unwrap_or(0), field, "labels missing in batch")
        };
        let mut terms = Vec::new();

        let tag_heads = [
            (TagField::TargetTags, self.target_tags.as_ref()),
            (TagField::GapTags, self.gap_tags.as_ref()),
            (TagField::SourceTags, self.source_tags.as_ref()),
        ];
        for (field, head) in tag_heads {
            let (Some(head), Some(logits)) = (head, outputs.tags(field)) else { continue };
            let gold = batch.tags(field).ok_or_else(|| missing(field.name()))?;
            terms.push(LossTerm { name: field.name(), weight: 1.0, value: head.loss(logits.clone(), gold.clone()) });
        }

        let sentence_weight = self.sentence_loss_weight as f64;
        if let (Some(head), Some(mean)) = (&self.hter, &outputs.hter) {
            let gold = batch.hter.clone().ok_or_else(|| missing("sentence_scores"))?;
            terms.push(LossTerm {
                name:   "hter",
                weight: sentence_weight,
                value:  head.loss(mean.clone(), outputs.hter_sigma.clone(), gold),
            });
        }
        if let (Some(head), Some(logits)) = (&self.binary, &outputs.binary) {
            let gold = batch.hter.clone().ok_or_else(|| missing("sentence_scores"))?;
            terms.push(LossTerm { name: "binary", weight: sentence_weight, value: head.loss(logits.clone(), gold) });
        }
        Ok(terms)
    }

    /// Feed predictions and gold labels of one batch into `acc`.
    pub fn record_metrics(&self, outputs: HeadOutputs<B>, batch: &QeBatch<B>, acc: &mut MetricAccumulator) {
        let predicted = [
            (TagField::TargetTags, outputs.target_tags),
            (TagField::GapTags, outputs.gap_tags),
            (TagField::SourceTags, outputs.source_tags),
        ];
        for (field, logits) in predicted {
            let (Some(logits), Some(gold)) = (logits, batch.tags(field)) else { continue };
            let pred = narrow(to_i32_vec(argmax_last(logits)));
            let gold = narrow(to_i32_vec(gold.clone()));
            acc.add_tags(field, &gold, &pred);
        }

        let Some(gold) = batch.hter.clone() else { return };
        if let Some(mean) = outputs.hter {
            let gold: Vec<f64> = to_f32_vec(gold.clone()).into_iter().map(f64::from).collect();
            let pred: Vec<f64> = to_f32_vec(mean).into_iter().map(f64::from).collect();
            acc.add_scores(&gold, &pred);
        }
        if let (Some(head), Some(logits)) = (&self.binary, outputs.binary) {
            let [n, c] = logits.dims();
            let pred = narrow(to_i32_vec(argmax_last(logits.reshape([n, 1, c]))));
            let gold = narrow(to_i32_vec(head.labels(gold)));
            acc.add_binary(&gold, &pred);
        }
    }
}

fn narrow(values: Vec<i32>) -> Vec<u8> {
    values.into_iter().map(|v| v.clamp(0, u8::MAX as i32) as u8).collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::domain::config::TagWeights;
    use crate::ml::fixtures::tiny_batch;

    type TB = NdArray;

    fn decoded(device: &<TB as Backend>::Device) -> DecoderOutput<TB> {
        DecoderOutput {
            target:   Tensor::random([2, 3, 4], burn::tensor::Distribution::Default, device),
            source:   Tensor::random([2, 2, 4], burn::tensor::Distribution::Default, device),
            sentence: Tensor::random([2, 5], burn::tensor::Distribution::Default, device),
        }
    }

    fn all_heads() -> OutputsConfig {
        let mut cfg = OutputsConfig::default();
        cfg.word_level.target = true;
        cfg.word_level.gaps   = true;
        cfg.word_level.source = true;
        cfg.word_level.class_weights.target_tags = TagWeights::bad(3.0);
        cfg.sentence_level.hter   = true;
        cfg.sentence_level.binary = true;
        cfg.sentence_level.binary_threshold = 0.5;
        cfg.sentence_loss_weight = 2.0;
        cfg
    }

    #[test]
    fn test_total_is_weighted_sum_of_enabled_heads() {
        let device = Default::default();
        let batch  = tiny_batch();
        let heads  = OutputHeads::<TB>::new(&all_heads(), 4, 4, 5, &device);
        let outputs = heads.forward(&decoded(&device), batch.target.word_pad.clone());
        let terms  = heads.losses(&outputs, &batch).unwrap();

        let names: Vec<&str> = terms.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["target_tags", "gap_tags", "source_tags", "hter", "binary"]);

        let expected: f64 = terms
            .iter()
            .map(|t| t.weight * t.value.clone().into_scalar() as f64)
            .sum();
        let total = weighted_total(&terms, &device).into_scalar() as f64;
        assert!((total - expected).abs() < 1e-4);
        assert_eq!(terms[3].weight, 2.0);
    }

    #[test]
    fn test_disabled_heads_have_no_terms_or_metrics() {
        let device = Default::default();
        let batch  = tiny_batch();
        let mut cfg = OutputsConfig::default();
        cfg.word_level.target = true;
        let heads = OutputHeads::<TB>::new(&cfg, 4, 4, 5, &device);
        assert!(heads.gap_tags.is_none() && heads.hter.is_none());

        let outputs = heads.forward(&decoded(&device), batch.target.word_pad.clone());
        assert_eq!(heads.losses(&outputs, &batch).unwrap().len(), 1);

        let mut acc = MetricAccumulator::new();
        heads.record_metrics(outputs, &batch, &mut acc);
        let metrics = acc.finish();
        assert!(metrics.contains_key("target_tags_MCC"));
        assert!(!metrics.contains_key("gap_tags_MCC"));
        assert!(!metrics.contains_key("PEARSON"));
    }

    #[test]
    fn test_distribution_nll_is_finite() {
        let device = Default::default();
        let mean  = Tensor::<TB, 1>::from_floats([0.2, 0.8], &device);
        let sigma = Tensor::<TB, 1>::from_floats([0.1, 0.3], &device);
        let gold  = Tensor::<TB, 1>::from_floats([0.25, 0.5], &device);
        let nll: f32 = truncated_normal_nll(mean, sigma, gold).into_scalar();
        assert!(nll.is_finite());
    }

    #[test]
    fn test_binary_labels_use_threshold() {
        let device = Default::default();
        let head = BinaryHead::<TB> { projection: LinearConfig::new(2, 2).init(&device), threshold: 0.5 };
        let labels = head.labels(Tensor::from_floats([0.2, 0.7, 0.5], &device));
        assert_eq!(to_i32_vec(labels), vec![0, 1, 0]);
    }
}
