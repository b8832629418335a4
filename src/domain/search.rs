// ============================================================
// Layer 3 — Hyperparameter Search Space
// ============================================================
// Declarative search configuration and the seeded random
// sampler that turns it into concrete trial parameters.
//
//   base_config: config/bert.yaml
//   directory:   search
//   num_trials:  50
//   options:
//     learning_rate: {lower: 5e-7, upper: 5e-5}
//     hidden_size:   [256, 512, 768]
//     dropout:       {lower: 0.0, upper: 0.3, step: 0.05}
//
// `search_name` names the tracking experiment every trial logs
// under, and `load_trials` points at the trials.json of an
// earlier search to continue: its trials keep their numbers and
// the sampler resumes where that search stopped.
//
// A list is a categorical choice, `{lower, upper}` a uniform
// interval, and `{lower, upper, step}` a discrete grid on it.
// Word-level and sentence-level heads can each be toggled per
// trial, but never both in one search: no single metric would
// rank trials that train disjoint objectives.
//
// Reference: Bergstra & Bengio (2012) Random Search for
//            Hyper-Parameter Optimization

use std::path::PathBuf;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::config::{ExperimentConfig, TagWeights, ValidationInterval};
use crate::domain::error::{QeError, QeResult};

// ─── Ranges ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamRange {
    Choices(Vec<f64>),
    Interval {
        lower: f64,
        upper: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step:  Option<f64>,
    },
}

impl ParamRange {
    pub const fn interval(lower: f64, upper: f64) -> Self {
        Self::Interval { lower, upper, step: None }
    }

    pub fn sample(&self, rng: &mut StdRng) -> f64 {
        match *self {
            Self::Choices(ref values) => values[rng.gen_range(0..values.len())],
            Self::Interval { lower, upper, step: Some(step) } => {
                let slots = ((upper - lower) / step + 1e-9).floor() as usize;
                lower + rng.gen_range(0..=slots) as f64 * step
            }
            Self::Interval { lower, upper, step: None } if lower < upper => rng.gen_range(lower..upper),
            Self::Interval { lower, .. } => lower,
        }
    }

    fn validate(&self, path: &str) -> QeResult<()> {
        match *self {
            Self::Choices(ref values) if values.is_empty() => {
                Err(QeError::config(path, "needs at least one choice"))
            }
            Self::Interval { lower, upper, .. } if !(lower.is_finite() && upper.is_finite() && lower <= upper) => {
                Err(QeError::config(path, "needs finite bounds with lower <= upper"))
            }
            Self::Interval { step: Some(step), .. } if !(step > 0.0) => {
                Err(QeError::config(path, "step must be > 0"))
            }
            _ => Ok(()),
        }
    }
}

fn validate_opt(range: &Option<ParamRange>, path: &str) -> QeResult<()> {
    range.as_ref().map_or(Ok(()), |r| r.validate(path))
}

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassWeightRanges {
    pub target_tags: Option<ParamRange>,
    pub gap_tags:    Option<ParamRange>,
    pub source_tags: Option<ParamRange>,
}

impl Default for ClassWeightRanges {
    fn default() -> Self {
        Self {
            target_tags: Some(ParamRange::interval(1.0, 5.0)),
            gap_tags:    Some(ParamRange::interval(1.0, 10.0)),
            source_tags: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Early-stopping patience every trial trains with.
    pub patience:          usize,
    pub validation_steps:  ValidationInterval,
    pub search_mlp:        bool,
    pub search_word_level: bool,
    pub search_hter:       bool,

    pub learning_rate:        Option<ParamRange>,
    pub dropout:              Option<ParamRange>,
    pub warmup_steps:         Option<ParamRange>,
    pub freeze_epochs:        Option<ParamRange>,
    pub class_weights:        Option<ClassWeightRanges>,
    pub sentence_loss_weight: Option<ParamRange>,
    pub hidden_size:          Option<ParamRange>,
    pub bottleneck_size:      Option<ParamRange>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            patience:             10,
            validation_steps:     ValidationInterval::EpochFraction(0.2),
            search_mlp:           false,
            search_word_level:    false,
            search_hter:          false,
            learning_rate:        Some(ParamRange::interval(5e-7, 5e-5)),
            dropout:              Some(ParamRange::interval(0.0, 0.3)),
            warmup_steps:         Some(ParamRange::interval(0.05, 0.4)),
            freeze_epochs:        Some(ParamRange::interval(0.0, 5.0)),
            class_weights:        Some(ClassWeightRanges::default()),
            sentence_loss_weight: None,
            hidden_size:          None,
            bottleneck_size:      None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Training configuration every trial starts from (relative paths
    /// resolve against the search file's directory).
    pub base_config:        PathBuf,
    pub directory:          PathBuf,
    pub seed:               u64,
    pub num_trials:         usize,
    /// Checkpoints kept after the search; -1 keeps all of them.
    pub num_models_to_keep: i64,
    /// Experiment the trial runs are tracked under; the base config's
    /// `run.experiment_name` when unset.
    pub search_name:        Option<String>,
    /// Ledger of an earlier search; `num_trials` more trials are run.
    pub load_trials:        Option<PathBuf>,
    pub options:            SearchOptions,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_config:        PathBuf::new(),
            directory:          PathBuf::from("search"),
            seed:               42,
            num_trials:         50,
            num_models_to_keep: 5,
            search_name:        None,
            load_trials:        None,
            options:            SearchOptions::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> QeResult<()> {
        if self.base_config.as_os_str().is_empty() {
            return Err(QeError::config("base_config", "is required"));
        }
        if self.num_trials == 0 {
            return Err(QeError::config("num_trials", "must be >= 1"));
        }
        if self.search_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(QeError::config("search_name", "must not be empty"));
        }
        let o = &self.options;
        if o.search_hter && o.search_word_level {
            return Err(QeError::config(
                "options.search_hter",
                "cannot be combined with options.search_word_level; disable one of them",
            ));
        }
        validate_opt(&o.learning_rate, "options.learning_rate")?;
        validate_opt(&o.dropout, "options.dropout")?;
        validate_opt(&o.warmup_steps, "options.warmup_steps")?;
        validate_opt(&o.freeze_epochs, "options.freeze_epochs")?;
        validate_opt(&o.sentence_loss_weight, "options.sentence_loss_weight")?;
        validate_opt(&o.hidden_size, "options.hidden_size")?;
        validate_opt(&o.bottleneck_size, "options.bottleneck_size")?;
        if let Some(weights) = &o.class_weights {
            validate_opt(&weights.target_tags, "options.class_weights.target_tags")?;
            validate_opt(&weights.gap_tags, "options.class_weights.gap_tags")?;
            validate_opt(&weights.source_tags, "options.class_weights.source_tags")?;
        }
        Ok(())
    }
}

// ─── Trial parameters ─────────────────────────────────────────────────────────

/// The values one trial was trained with; unset fields were not searched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate:            Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mlp:                  Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hter:                     Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_level:               Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentence_loss_weight:     Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_weight_target_tags: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_weight_gap_tags:    Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_weight_source_tags: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropout:                  Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_steps:             Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeze_epochs:            Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size:              Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottleneck_size:          Option<usize>,
}

impl TrialParams {
    /// Rewrite `config` with these values. `updates_per_epoch` converts
    /// frozen epochs into optimizer steps and sizes the schedule.
    pub fn apply(&self, config: &mut ExperimentConfig, updates_per_epoch: usize) {
        let epochs = config.trainer.epochs;
        config.system.optimizer.training_steps = Some(updates_per_epoch * epochs);

        let model = &mut config.system.model;
        if let Some(lr) = self.learning_rate {
            config.system.optimizer.learning_rate = lr;
        }
        if let Some(use_mlp) = self.use_mlp {
            model.encoder.use_mlp = use_mlp;
        }
        if let Some(hter) = self.hter {
            model.outputs.sentence_level.hter = hter;
            if !hter {
                model.outputs.sentence_level.use_distribution = false;
            }
        }
        if let Some(word_level) = self.word_level {
            model.outputs.word_level.target = word_level;
            model.outputs.word_level.gaps   = word_level;
        }
        if let Some(weight) = self.sentence_loss_weight {
            model.outputs.sentence_loss_weight = weight;
        }
        let weights = &mut model.outputs.word_level.class_weights;
        if let Some(w) = self.class_weight_target_tags {
            weights.target_tags = TagWeights::bad(w);
        }
        if let Some(w) = self.class_weight_gap_tags {
            weights.gap_tags = TagWeights::bad(w);
        }
        if let Some(w) = self.class_weight_source_tags {
            weights.source_tags = TagWeights::bad(w);
        }
        if let Some(dropout) = self.dropout {
            model.encoder.dropout = dropout;
            model.decoder.dropout = dropout;
            model.outputs.dropout = dropout;
        }
        if let Some(warmup) = self.warmup_steps {
            config.system.optimizer.warmup_steps = Some(warmup);
        }
        if let Some(epochs) = self.freeze_epochs {
            let steps = (updates_per_epoch as f64 * epochs) as usize;
            model.encoder.freeze = steps > 0;
            model.encoder.freeze_for_number_of_steps = steps;
        }
        if let Some(hidden) = self.hidden_size {
            model.encoder.hidden_size = hidden;
            model.decoder.hidden_size = hidden;
        }
        if let Some(bottleneck) = self.bottleneck_size {
            model.decoder.bottleneck_size = bottleneck;
        }
    }
}

// ─── Sampler ──────────────────────────────────────────────────────────────────

pub struct TrialSampler {
    rng: StdRng,
}

impl TrialSampler {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// Discard the draws of `trials` earlier trials.
    pub fn skip(&mut self, trials: usize, options: &SearchOptions, base: &ExperimentConfig) {
        for _ in 0..trials {
            self.suggest(options, base);
        }
    }

    /// Draw the parameters of the next trial for a search over `base`.
    pub fn suggest(&mut self, options: &SearchOptions, base: &ExperimentConfig) -> TrialParams {
        let rng = &mut self.rng;
        let mut p = TrialParams::default();
        let outputs = &base.system.model.outputs;

        p.learning_rate = options.learning_rate.as_ref().map(|r| r.sample(rng));
        if options.search_mlp {
            p.use_mlp = Some(rng.gen_bool(0.5));
        }
        if options.search_hter {
            p.hter = Some(rng.gen_bool(0.5));
        }
        if options.search_word_level {
            p.word_level = Some(rng.gen_bool(0.5));
        }

        let target = p.word_level.unwrap_or(outputs.word_level.target);
        let gaps   = p.word_level.unwrap_or(outputs.word_level.gaps);
        let source = outputs.word_level.source;
        let hter   = p.hter.unwrap_or(outputs.sentence_level.hter);

        // The weight only matters as a ratio between two objectives.
        if (target || gaps || source) && (hter || outputs.sentence_level.binary) {
            p.sentence_loss_weight = options.sentence_loss_weight.as_ref().map(|r| r.sample(rng));
        }
        if let Some(weights) = &options.class_weights {
            if target {
                p.class_weight_target_tags = weights.target_tags.as_ref().map(|r| r.sample(rng));
            }
            if gaps {
                p.class_weight_gap_tags = weights.gap_tags.as_ref().map(|r| r.sample(rng));
            }
            if source {
                p.class_weight_source_tags = weights.source_tags.as_ref().map(|r| r.sample(rng));
            }
        }

        p.dropout         = options.dropout.as_ref().map(|r| r.sample(rng));
        p.warmup_steps    = options.warmup_steps.as_ref().map(|r| r.sample(rng));
        p.freeze_epochs   = options.freeze_epochs.as_ref().map(|r| r.sample(rng));
        p.hidden_size     = options.hidden_size.as_ref().map(|r| r.sample(rng).round() as usize);
        p.bottleneck_size = options.bottleneck_size.as_ref().map(|r| r.sample(rng).round() as usize);
        p
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn word_level_base() -> ExperimentConfig {
        let mut cfg = ExperimentConfig::default();
        cfg.system.model.outputs.word_level.target = true;
        cfg.system.model.outputs.word_level.gaps   = true;
        cfg.trainer.epochs = 4;
        cfg
    }

    #[test]
    fn test_ranges_parse_from_yaml() {
        let choices: ParamRange = serde_yaml::from_str("[256, 512]").unwrap();
        assert_eq!(choices, ParamRange::Choices(vec![256.0, 512.0]));
        let grid: ParamRange = serde_yaml::from_str("{lower: 0.0, upper: 0.3, step: 0.1}").unwrap();
        assert_eq!(grid, ParamRange::Interval { lower: 0.0, upper: 0.3, step: Some(0.1) });
    }

    #[test]
    fn test_samples_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let grid = ParamRange::Interval { lower: 0.0, upper: 0.3, step: Some(0.1) };
        for _ in 0..100 {
            let v = grid.sample(&mut rng);
            assert!((0.0..=0.3 + 1e-9).contains(&v));
            assert!(((v * 10.0).round() - v * 10.0).abs() < 1e-6);
        }
        let uniform = ParamRange::interval(1.0, 5.0);
        assert!((0..100).map(|_| uniform.sample(&mut rng)).all(|v| (1.0..5.0).contains(&v)));
    }

    #[test]
    fn test_hter_and_word_level_are_exclusive() {
        let mut cfg = SearchConfig { base_config: "base.yaml".into(), ..SearchConfig::default() };
        cfg.options.search_hter = true;
        cfg.options.search_word_level = true;
        assert!(matches!(cfg.validate(), Err(QeError::Config { .. })));
        cfg.options.search_word_level = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sampler_is_reproducible() {
        let base = word_level_base();
        let options = SearchOptions::default();
        let a = TrialSampler::new(7).suggest(&options, &base);
        let b = TrialSampler::new(7).suggest(&options, &base);
        assert_eq!(a, b);
        assert!(a.class_weight_target_tags.is_some());
        assert!(a.class_weight_source_tags.is_none());
        assert!(a.sentence_loss_weight.is_none());
    }

    #[test]
    fn test_skipping_continues_the_draw_sequence() {
        let base = word_level_base();
        let options = SearchOptions::default();
        let mut straight = TrialSampler::new(11);
        straight.suggest(&options, &base);
        straight.suggest(&options, &base);
        let third = straight.suggest(&options, &base);

        let mut resumed = TrialSampler::new(11);
        resumed.skip(2, &options, &base);
        assert_eq!(resumed.suggest(&options, &base), third);
    }

    #[test]
    fn test_search_name_and_ledger_parse() {
        let cfg: SearchConfig = serde_yaml::from_str(
            "base_config: base.yaml\nsearch_name: qe-sweep\nload_trials: search/0/trials.json\n",
        )
        .unwrap();
        assert_eq!(cfg.search_name.as_deref(), Some("qe-sweep"));
        assert_eq!(cfg.load_trials, Some(PathBuf::from("search/0/trials.json")));
        assert!(cfg.validate().is_ok());

        let blank = SearchConfig { search_name: Some(" ".into()), ..cfg };
        assert!(matches!(blank.validate(), Err(QeError::Config { .. })));
    }

    #[test]
    fn test_apply_rewrites_config() {
        let mut cfg = word_level_base();
        let params = TrialParams {
            learning_rate: Some(1e-5),
            dropout: Some(0.2),
            freeze_epochs: Some(1.5),
            class_weight_gap_tags: Some(4.0),
            hidden_size: Some(128),
            ..TrialParams::default()
        };
        params.apply(&mut cfg, 100);
        assert_eq!(cfg.system.optimizer.training_steps, Some(400));
        assert_eq!(cfg.system.optimizer.learning_rate, 1e-5);
        assert_eq!(cfg.system.model.decoder.dropout, 0.2);
        assert!(cfg.system.model.encoder.freeze);
        assert_eq!(cfg.system.model.encoder.freeze_for_number_of_steps, 150);
        assert_eq!(cfg.system.model.outputs.word_level.class_weights.gap_tags, TagWeights::bad(4.0));
        assert_eq!(cfg.system.model.decoder.hidden_size, 128);
    }
}
