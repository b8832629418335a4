// ============================================================
// Layer 3 — Quality Metrics
// ============================================================
// Pure metric arithmetic shared by validation and evaluation.
//
// Word level (per tag stream, BAD is the positive class):
//   <tags>_F1_OK, <tags>_F1_BAD, <tags>_F1_MULT = F1_OK * F1_BAD,
//   <tags>_MCC (Matthews correlation)
//   WMT19_* pools target and gap tags into one confusion matrix.
//
// Sentence level:
//   PEARSON, SPEARMAN, RMSE over HTER predictions
//   binary_F1_MULT, binary_MCC over thresholded HTER
//
// `loss` is always reported. RMSE and losses are minimised,
// everything else is maximised.
//
// Reference: Matthews (1975), WMT19 QE shared task definitions

use std::collections::BTreeMap;

use crate::domain::config::OutputsConfig;
use crate::domain::example::{TagField, PAD_INDEX};

pub type MetricValues = BTreeMap<String, f64>;

pub const LOSS:           &str = "loss";
pub const PEARSON:        &str = "PEARSON";
pub const SPEARMAN:       &str = "SPEARMAN";
pub const RMSE:           &str = "RMSE";
pub const WMT19_MCC:      &str = "WMT19_MCC";
pub const WMT19_F1_MULT:  &str = "WMT19_F1_MULT";
pub const BINARY_F1_MULT: &str = "binary_F1_MULT";
pub const BINARY_MCC:     &str = "binary_MCC";

const TAG_SUFFIXES: [&str; 4] = ["F1_OK", "F1_BAD", "F1_MULT", "MCC"];

// ─── Direction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Minimize,
    Maximize,
}

pub fn direction(metric: &str) -> Direction {
    if metric == RMSE || metric == LOSS || metric.ends_with("_loss") {
        Direction::Minimize
    } else {
        Direction::Maximize
    }
}

/// True when `candidate` is strictly better than `reference` for `metric`.
pub fn is_improvement(metric: &str, candidate: f64, reference: f64) -> bool {
    match direction(metric) {
        Direction::Minimize => candidate < reference,
        Direction::Maximize => candidate > reference,
    }
}

/// The first entry of `main_metrics` present in `values`.
pub fn primary_metric<'a>(main_metrics: &'a [String], values: &MetricValues) -> Option<(&'a str, f64)> {
    main_metrics
        .iter()
        .find_map(|name| values.get(name).map(|v| (name.as_str(), *v)))
}

// ─── Catalogue ────────────────────────────────────────────────────────────────

/// Every metric name the enabled heads can produce.
pub fn available_metrics(outputs: &OutputsConfig) -> Vec<String> {
    let word = &outputs.word_level;
    let mut names = Vec::new();
    let enabled = [
        (TagField::TargetTags, word.target),
        (TagField::GapTags, word.gaps),
        (TagField::SourceTags, word.source),
    ];
    for (field, on) in enabled {
        if on {
            names.extend(TAG_SUFFIXES.iter().map(|s| format!("{}_{s}", field.name())));
        }
    }
    if word.target && word.gaps {
        names.push(WMT19_MCC.to_string());
        names.push(WMT19_F1_MULT.to_string());
    }
    if outputs.sentence_level.hter {
        names.extend([PEARSON, SPEARMAN, RMSE].map(String::from));
    }
    if outputs.sentence_level.binary {
        names.extend([BINARY_F1_MULT, BINARY_MCC].map(String::from));
    }
    names.push(LOSS.to_string());
    names
}

/// Main metrics used when the configuration leaves `main_metric` empty.
pub fn default_main_metrics(outputs: &OutputsConfig) -> Vec<String> {
    let word = &outputs.word_level;
    let mut names = Vec::new();
    if word.target && word.gaps {
        names.push(WMT19_MCC.to_string());
    } else if word.target {
        names.push(format!("{}_MCC", TagField::TargetTags.name()));
    } else if word.gaps {
        names.push(format!("{}_MCC", TagField::GapTags.name()));
    }
    if word.source {
        names.push(format!("{}_MCC", TagField::SourceTags.name()));
    }
    if outputs.sentence_level.hter {
        names.push(PEARSON.to_string());
    }
    if outputs.sentence_level.binary {
        names.push(BINARY_MCC.to_string());
    }
    if names.is_empty() {
        names.push(LOSS.to_string());
    }
    names
}

// ─── BinaryConfusion ──────────────────────────────────────────────────────────
/// OK/BAD confusion counts with BAD as the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryConfusion {
    pub tp: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tn: u64,
}

impl BinaryConfusion {
    pub fn add(&mut self, gold: u8, pred: u8) {
        match (gold == 1, pred == 1) {
            (true, true)   => self.tp += 1,
            (false, true)  => self.fp += 1,
            (true, false)  => self.fn_ += 1,
            (false, false) => self.tn += 1,
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.tp  += other.tp;
        self.fp  += other.fp;
        self.fn_ += other.fn_;
        self.tn  += other.tn;
    }

    pub fn f1_bad(&self) -> f64 {
        f1(self.tp, self.fp, self.fn_)
    }

    pub fn f1_ok(&self) -> f64 {
        f1(self.tn, self.fn_, self.fp)
    }

    pub fn f1_mult(&self) -> f64 {
        self.f1_ok() * self.f1_bad()
    }

    pub fn mcc(&self) -> f64 {
        let (tp, fp, fn_, tn) = (self.tp as f64, self.fp as f64, self.fn_ as f64, self.tn as f64);
        let denom = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        if denom == 0.0 {
            0.0
        } else {
            (tp * tn - fp * fn_) / denom
        }
    }
}

fn f1(tp: u64, fp: u64, fn_: u64) -> f64 {
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        0.0
    } else {
        (2 * tp) as f64 / denom as f64
    }
}

// ─── Correlations ─────────────────────────────────────────────────────────────

pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov   += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 { 0.0 } else { cov / denom }
}

/// Pearson correlation of the ranks; ties share their average rank.
pub fn spearman(xs: &[f64], ys: &[f64]) -> f64 {
    pearson(&ranks(xs), &ranks(ys))
}

fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        i = j + 1;
    }
    ranks
}

pub fn rmse(gold: &[f64], pred: &[f64]) -> f64 {
    let n = gold.len().min(pred.len());
    if n == 0 {
        return 0.0;
    }
    let sq: f64 = gold.iter().zip(pred).map(|(g, p)| (g - p).powi(2)).sum();
    (sq / n as f64).sqrt()
}

// ─── MetricAccumulator ────────────────────────────────────────────────────────
/// Streams predictions batch by batch and produces the final metric map.
/// Only streams that received data produce metrics, so a disabled head
/// never shows up in the output.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    tags:         BTreeMap<TagField, BinaryConfusion>,
    binary:       Option<BinaryConfusion>,
    hter_gold:    Vec<f64>,
    hter_pred:    Vec<f64>,
    loss_sum:     f64,
    loss_batches: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions whose gold label is PAD are ignored.
    pub fn add_tags(&mut self, field: TagField, gold: &[u8], pred: &[u8]) {
        let confusion = self.tags.entry(field).or_default();
        for (&g, &p) in gold.iter().zip(pred) {
            if g != PAD_INDEX {
                confusion.add(g, p);
            }
        }
    }

    pub fn add_binary(&mut self, gold: &[u8], pred: &[u8]) {
        let confusion = self.binary.get_or_insert_with(BinaryConfusion::default);
        for (&g, &p) in gold.iter().zip(pred) {
            confusion.add(g, p);
        }
    }

    pub fn add_scores(&mut self, gold: &[f64], pred: &[f64]) {
        self.hter_gold.extend_from_slice(gold);
        self.hter_pred.extend_from_slice(pred);
    }

    pub fn add_loss(&mut self, loss: f64) {
        self.loss_sum     += loss;
        self.loss_batches += 1;
    }

    pub fn finish(&self) -> MetricValues {
        let mut values = MetricValues::new();

        for (field, confusion) in &self.tags {
            let prefix = field.name();
            values.insert(format!("{prefix}_F1_OK"), confusion.f1_ok());
            values.insert(format!("{prefix}_F1_BAD"), confusion.f1_bad());
            values.insert(format!("{prefix}_F1_MULT"), confusion.f1_mult());
            values.insert(format!("{prefix}_MCC"), confusion.mcc());
        }

        if let (Some(target), Some(gaps)) =
            (self.tags.get(&TagField::TargetTags), self.tags.get(&TagField::GapTags))
        {
            let mut joint = *target;
            joint.merge(gaps);
            values.insert(WMT19_MCC.to_string(), joint.mcc());
            values.insert(WMT19_F1_MULT.to_string(), joint.f1_mult());
        }

        if !self.hter_gold.is_empty() {
            values.insert(PEARSON.to_string(), pearson(&self.hter_pred, &self.hter_gold));
            values.insert(SPEARMAN.to_string(), spearman(&self.hter_pred, &self.hter_gold));
            values.insert(RMSE.to_string(), rmse(&self.hter_gold, &self.hter_pred));
        }

        if let Some(binary) = &self.binary {
            values.insert(BINARY_F1_MULT.to_string(), binary.f1_mult());
            values.insert(BINARY_MCC.to_string(), binary.mcc());
        }

        if self.loss_batches > 0 {
            values.insert(LOSS.to_string(), self.loss_sum / self.loss_batches as f64);
        }
        values
    }
}
