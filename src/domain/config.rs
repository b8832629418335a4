// ============================================================
// Layer 3 — Experiment Configuration
// ============================================================
// Typed view of a fully resolved YAML experiment document:
//
//   run:      experiment bookkeeping (name, seed, tracking)
//   trainer:  epochs, validation cadence, checkpoint policy
//   data:     corpus file locations (usually pulled in via `defaults`)
//   system:   architecture choice + model/optimizer/data processing
//
// Every struct carries #[serde(default)] so partial documents
// deserialize, and `ExperimentConfig::validate` enforces the
// cross-field invariants before anything is built.
//
// Numeric fields accept `60_000` style grouping and `1e-05`
// style exponents even when the YAML parser hands them over as
// strings (see `lenient` below).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::error::{QeError, QeResult};
use crate::domain::metrics;

// ─── Root ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub run:     RunConfig,
    pub trainer: TrainerConfig,
    pub data:    DataConfig,
    pub system:  SystemConfig,
}

impl ExperimentConfig {
    /// Check every cross-field invariant. Errors name the offending path.
    pub fn validate(&self) -> QeResult<()> {
        self.system.validate()?;
        self.trainer.validate()?;
        self.data.validate()?;

        // `main_metric` must only name metrics the enabled heads produce.
        // A system loaded from disk is checked again once its own model
        // section is known.
        if self.system.load.is_none() {
            let available = metrics::available_metrics(&self.system.model.outputs);
            for name in &self.trainer.main_metric {
                if !available.iter().any(|m| m == name) {
                    return Err(QeError::config(
                        "trainer.main_metric",
                        format!(
                            "metric `{name}` is not produced by the enabled outputs \
                             (available: {})",
                            available.join(", ")
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The ordered main metrics, falling back to the outputs' defaults.
    pub fn main_metrics(&self) -> Vec<String> {
        if self.trainer.main_metric.is_empty() {
            metrics::default_main_metrics(&self.system.model.outputs)
        } else {
            self.trainer.main_metric.clone()
        }
    }
}

// ─── run ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub experiment_name: String,

    #[serde(deserialize_with = "lenient::u64")]
    pub seed: u64,

    /// Filesystem path, `file:` URI or server URL of the tracking store.
    pub mlflow_tracking_uri: String,

    /// When absent the tracker assigns `runs/<experiment>/<run id>`.
    pub output_dir: Option<PathBuf>,

    pub run_id: Option<String>,

    pub use_mlflow: bool,

    pub mlflow_always_log_artifacts: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            experiment_name:             "default".to_string(),
            seed:                        42,
            mlflow_tracking_uri:         "mlruns/".to_string(),
            output_dir:                  None,
            run_id:                      None,
            use_mlflow:                  false,
            mlflow_always_log_artifacts: false,
        }
    }
}

// ─── trainer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    #[serde(deserialize_with = "lenient::usize")]
    pub gpus: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub epochs: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub log_interval: usize,

    pub resume: bool,

    /// Ordered; the first entry present in the validation metrics wins.
    #[serde(deserialize_with = "one_or_many")]
    pub main_metric: Vec<String>,

    #[serde(deserialize_with = "lenient::opt_f64")]
    pub gradient_max_norm: Option<f64>,

    #[serde(deserialize_with = "lenient::usize")]
    pub gradient_accumulation_steps: usize,

    pub checkpoint: CheckpointConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            gpus:                        0,
            epochs:                      50,
            log_interval:                100,
            resume:                      false,
            main_metric:                 Vec::new(),
            gradient_max_norm:           None,
            gradient_accumulation_steps: 1,
            checkpoint:                  CheckpointConfig::default(),
        }
    }
}

impl TrainerConfig {
    fn validate(&self) -> QeResult<()> {
        if self.epochs == 0 {
            return Err(QeError::config("trainer.epochs", "must be >= 1"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(QeError::config("trainer.gradient_accumulation_steps", "must be >= 1"));
        }
        if let Some(norm) = self.gradient_max_norm {
            if !norm.is_finite() || norm <= 0.0 {
                return Err(QeError::config("trainer.gradient_max_norm", "must be > 0"));
            }
        }
        if self.checkpoint.save_top_k == 0 || self.checkpoint.save_top_k < -1 {
            return Err(QeError::config(
                "trainer.checkpoint.save_top_k",
                "must be >= 1, or -1 to keep every checkpoint",
            ));
        }
        self.checkpoint.validation_steps.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub validation_steps: ValidationInterval,

    /// Number of best checkpoints kept on disk; -1 keeps all of them.
    #[serde(deserialize_with = "lenient::i64")]
    pub save_top_k: i64,

    /// Validation cycles without improvement before stopping; 0 disables.
    #[serde(deserialize_with = "lenient::usize")]
    pub early_stop_patience: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            validation_steps:    ValidationInterval::EpochFraction(1.0),
            save_top_k:          1,
            early_stop_patience: 0,
        }
    }
}

/// How often validation runs: every N optimizer steps, or a fraction
/// of an epoch (`0.2` validates five times per epoch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationInterval {
    Steps(usize),
    EpochFraction(f64),
}

impl ValidationInterval {
    /// Interval in optimizer steps given the number of updates per epoch.
    pub fn in_steps(&self, updates_per_epoch: usize) -> usize {
        match *self {
            Self::Steps(n) => n.max(1),
            Self::EpochFraction(f) => ((updates_per_epoch as f64 * f).round() as usize).max(1),
        }
    }

    fn validate(&self) -> QeResult<()> {
        match *self {
            Self::Steps(0) => Err(QeError::config(
                "trainer.checkpoint.validation_steps",
                "must be >= 1",
            )),
            Self::EpochFraction(f) if !(f > 0.0 && f <= 1.0) => Err(QeError::config(
                "trainer.checkpoint.validation_steps",
                "a fractional interval must be in (0, 1]",
            )),
            _ => Ok(()),
        }
    }
}

impl Serialize for ValidationInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Self::Steps(n) => serializer.serialize_u64(n as u64),
            Self::EpochFraction(f) => serializer.serialize_f64(f),
        }
    }
}

impl<'de> Deserialize<'de> for ValidationInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let repr = lenient::NumberRepr::deserialize(deserializer)?;
        let integral = repr.is_integral_literal();
        let value = repr.to_f64().map_err(D::Error::custom)?;
        if integral || value > 1.0 {
            if value.fract() != 0.0 || value < 1.0 {
                return Err(D::Error::custom(format!(
                    "validation_steps `{value}` must be a positive integer or a fraction in (0, 1]"
                )));
            }
            Ok(Self::Steps(value as usize))
        } else {
            Ok(Self::EpochFraction(value))
        }
    }
}

// ─── data ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train: Option<DatasetFiles>,
    pub valid: Option<DatasetFiles>,
    pub test:  Option<DatasetFiles>,

    /// Fraction of `train` kept for training when `valid` is absent.
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub split: Option<f64>,
}

impl DataConfig {
    fn validate(&self) -> QeResult<()> {
        if let Some(split) = self.split {
            if !(split > 0.0 && split < 1.0) {
                return Err(QeError::config("data.split", "must be in (0, 1)"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetFiles {
    pub input:  InputFiles,
    pub output: OutputFiles,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFiles {
    pub source:     Option<PathBuf>,
    pub target:     Option<PathBuf>,
    pub alignments: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFiles {
    pub target_tags:     Option<PathBuf>,
    pub source_tags:     Option<PathBuf>,
    pub sentence_scores: Option<PathBuf>,
}

// ─── system ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchitectureKind {
    Predictor,
    PredictorEstimator,
    Bert,
    #[serde(alias = "XLMR", alias = "XlmRoberta")]
    XLMRoberta,
}

impl ArchitectureKind {
    pub fn is_predictor_based(&self) -> bool {
        matches!(self, Self::Predictor | Self::PredictorEstimator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub class_name: Option<ArchitectureKind>,

    /// Checkpoint directory of a previously trained system.
    pub load: Option<PathBuf>,

    pub batch_size: BatchSize,

    #[serde(deserialize_with = "lenient::usize")]
    pub num_data_workers: usize,

    /// Checkpoint directory whose encoder weights seed the new model.
    pub load_encoder: Option<PathBuf>,

    /// `vocabularies.json` (or a directory holding one) to reuse.
    pub load_vocabs: Option<PathBuf>,

    pub model:           ModelConfig,
    pub optimizer:       OptimizerConfig,
    pub data_processing: DataProcessingConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            class_name:       None,
            load:             None,
            batch_size:       BatchSize::default(),
            num_data_workers: 4,
            load_encoder:     None,
            load_vocabs:      None,
            model:            ModelConfig::default(),
            optimizer:        OptimizerConfig::default(),
            data_processing:  DataProcessingConfig::default(),
        }
    }
}

impl SystemConfig {
    fn validate(&self) -> QeResult<()> {
        match (&self.class_name, &self.load) {
            (Some(_), Some(_)) => {
                return Err(QeError::config(
                    "system",
                    "`class_name` and `load` are mutually exclusive; set exactly one",
                ))
            }
            (None, None) => {
                return Err(QeError::config(
                    "system",
                    "either `class_name` or `load` must be set",
                ))
            }
            _ => {}
        }
        if self.batch_size.train() == 0 || self.batch_size.valid() == 0 {
            return Err(QeError::config("system.batch_size", "must be >= 1"));
        }
        self.optimizer.validate()?;
        if self.load.is_none() {
            self.model.validate()?;
        }
        Ok(())
    }
}

/// One size for both splits, or `{train, valid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BatchSize {
    Single(usize),
    PerSplit { train: usize, valid: usize },
}

impl<'de> Deserialize<'de> for BatchSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Single(lenient::NumberRepr),
            PerSplit { train: lenient::NumberRepr, valid: lenient::NumberRepr },
        }

        let size = |repr: &lenient::NumberRepr| lenient::to_usize(repr).map_err(D::Error::custom);
        match Repr::deserialize(deserializer)? {
            Repr::Single(n) => Ok(Self::Single(size(&n)?)),
            Repr::PerSplit { train, valid } => Ok(Self::PerSplit { train: size(&train)?, valid: size(&valid)? }),
        }
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::Single(16)
    }
}

impl BatchSize {
    pub fn train(&self) -> usize {
        match *self {
            Self::Single(n) => n,
            Self::PerSplit { train, .. } => train,
        }
    }

    pub fn valid(&self) -> usize {
        match *self {
            Self::Single(n) => n,
            Self::PerSplit { valid, .. } => valid,
        }
    }
}

// ─── system.model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub outputs: OutputsConfig,
    pub tlm:     TlmConfig,
}

impl ModelConfig {
    fn validate(&self) -> QeResult<()> {
        self.encoder.validate()?;
        self.outputs.validate()?;
        if !self.outputs.any_enabled() && !self.tlm.fine_tune {
            return Err(QeError::config(
                "system.model.outputs",
                "no output is enabled and TLM fine-tuning is off; nothing to train",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    FirstToken,
    Mean,
    #[default]
    Mixed,
}

/// Union of the backbone-specific encoder fields. The predictor reads
/// the RNN/embedding fields, transformer backbones read the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    #[serde(deserialize_with = "lenient::usize")]
    pub hidden_size: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub rnn_layers: usize,

    pub embeddings: EmbeddingsConfig,

    #[serde(deserialize_with = "lenient::usize")]
    pub out_embeddings_dim: usize,

    pub share_embeddings: bool,

    #[serde(deserialize_with = "lenient::f64")]
    pub dropout: f64,

    pub use_mismatch_features: bool,

    pub encode_source: bool,

    /// Local directory of a pretrained transformer (config.json,
    /// tokenizer.json, model weights). None initialises from scratch.
    pub model_name: Option<String>,

    pub interleave_input: bool,

    pub freeze: bool,

    #[serde(deserialize_with = "lenient::usize")]
    pub freeze_for_number_of_steps: usize,

    pub use_mlp: bool,

    pub pooling: Pooling,

    // Transformer dimensions used when `model_name` carries no config.json.
    #[serde(deserialize_with = "lenient::usize")]
    pub num_hidden_layers: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub num_attention_heads: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub intermediate_size: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub max_position_embeddings: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            hidden_size:                400,
            rnn_layers:                 2,
            embeddings:                 EmbeddingsConfig::default(),
            out_embeddings_dim:         200,
            share_embeddings:           false,
            dropout:                    0.5,
            use_mismatch_features:      false,
            encode_source:              false,
            model_name:                 None,
            interleave_input:           false,
            freeze:                     false,
            freeze_for_number_of_steps: 0,
            use_mlp:                    true,
            pooling:                    Pooling::Mixed,
            num_hidden_layers:          2,
            num_attention_heads:        4,
            intermediate_size:          1024,
            max_position_embeddings:    512,
        }
    }
}

impl EncoderConfig {
    fn validate(&self) -> QeResult<()> {
        if self.hidden_size == 0 {
            return Err(QeError::config("system.model.encoder.hidden_size", "must be >= 1"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(QeError::config("system.model.encoder.dropout", "must be in [0, 1)"));
        }
        if self.freeze_for_number_of_steps > 0 && !self.freeze {
            tracing::warn!(
                "system.model.encoder.freeze_for_number_of_steps is set but freeze is false; \
                 the encoder will not be frozen"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub source: TokenEmbeddingConfig,
    pub target: TokenEmbeddingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenEmbeddingConfig {
    #[serde(deserialize_with = "lenient::usize")]
    pub dim: usize,
}

impl Default for TokenEmbeddingConfig {
    fn default() -> Self {
        Self { dim: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    #[serde(deserialize_with = "lenient::usize")]
    pub hidden_size: usize,

    #[serde(deserialize_with = "lenient::usize")]
    pub rnn_layers: usize,

    pub use_mlp: bool,

    #[serde(deserialize_with = "lenient::f64")]
    pub dropout: f64,

    /// Hidden size of the sentence-level bottleneck MLP.
    #[serde(deserialize_with = "lenient::usize")]
    pub bottleneck_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { hidden_size: 125, rnn_layers: 1, use_mlp: true, dropout: 0.0, bottleneck_size: 100 }
    }
}

// ─── system.model.outputs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputsConfig {
    pub word_level:     WordLevelConfig,
    pub sentence_level: SentenceLevelConfig,

    /// Scales the sentence-level losses relative to word-level ones.
    #[serde(deserialize_with = "lenient::f64")]
    pub sentence_loss_weight: f64,

    #[serde(deserialize_with = "lenient::f64")]
    pub dropout: f64,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            word_level:           WordLevelConfig::default(),
            sentence_level:       SentenceLevelConfig::default(),
            sentence_loss_weight: 1.0,
            dropout:              0.0,
        }
    }
}

impl OutputsConfig {
    pub fn any_enabled(&self) -> bool {
        let w = &self.word_level;
        let s = &self.sentence_level;
        w.target || w.gaps || w.source || s.hter || s.binary
    }

    fn validate(&self) -> QeResult<()> {
        if !self.sentence_loss_weight.is_finite() || self.sentence_loss_weight < 0.0 {
            return Err(QeError::config(
                "system.model.outputs.sentence_loss_weight",
                "must be a non-negative number",
            ));
        }
        if self.sentence_level.use_distribution && !self.sentence_level.hter {
            return Err(QeError::config(
                "system.model.outputs.sentence_level.use_distribution",
                "requires `hter: true`; the distribution is layered on the HTER head",
            ));
        }
        let weights = &self.word_level.class_weights;
        weights.target_tags.validate("system.model.outputs.word_level.class_weights.target_tags")?;
        weights.gap_tags.validate("system.model.outputs.word_level.class_weights.gap_tags")?;
        weights.source_tags.validate("system.model.outputs.word_level.class_weights.source_tags")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WordLevelConfig {
    pub target:        bool,
    pub gaps:          bool,
    pub source:        bool,
    pub class_weights: ClassWeightsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassWeightsConfig {
    pub target_tags: TagWeights,
    pub gap_tags:    TagWeights,
    pub source_tags: TagWeights,
}

pub const TAG_OK: &str = "OK";
pub const TAG_BAD: &str = "BAD";

/// Per-class loss weights keyed by tag name (`{BAD: 3.0}`); classes not
/// listed weigh 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagWeights(pub BTreeMap<String, f64>);

impl TagWeights {
    pub fn bad(weight: f64) -> Self {
        Self(BTreeMap::from([(TAG_BAD.to_string(), weight)]))
    }

    /// `[OK, BAD]` weights in label-index order.
    pub fn as_array(&self) -> [f32; 2] {
        let get = |tag: &str| self.0.get(tag).copied().unwrap_or(1.0) as f32;
        [get(TAG_OK), get(TAG_BAD)]
    }

    fn validate(&self, path: &str) -> QeResult<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        for (tag, weight) in &self.0 {
            if tag != TAG_OK && tag != TAG_BAD {
                return Err(QeError::config(path, format!("unknown tag `{tag}` (expected OK or BAD)")));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(QeError::config(path, format!("weight for `{tag}` must be non-negative")));
            }
        }
        if !self.0.contains_key(TAG_BAD) {
            return Err(QeError::config(path, "class weights must cover the minority class BAD"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentenceLevelConfig {
    pub hter:             bool,
    pub use_distribution: bool,
    pub binary:           bool,

    /// Sentences with an HTER above this value are labelled BAD.
    #[serde(deserialize_with = "lenient::f64")]
    pub binary_threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlmConfig {
    pub fine_tune: bool,
}

// ─── system.optimizer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Adamw,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub class_name: OptimizerKind,

    #[serde(deserialize_with = "lenient::f64")]
    pub learning_rate: f64,

    /// Multiplier applied once per epoch after `learning_rate_decay_start`.
    #[serde(deserialize_with = "lenient::f64")]
    pub learning_rate_decay: f64,

    #[serde(deserialize_with = "lenient::usize")]
    pub learning_rate_decay_start: usize,

    /// Integer step count, or a fraction (< 1) of `training_steps`.
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub warmup_steps: Option<f64>,

    #[serde(deserialize_with = "lenient::opt_usize")]
    pub training_steps: Option<usize>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            class_name:                OptimizerKind::Adam,
            learning_rate:             1e-3,
            learning_rate_decay:       1.0,
            learning_rate_decay_start: 2,
            warmup_steps:              None,
            training_steps:            None,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> QeResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(QeError::config("system.optimizer.learning_rate", "must be > 0"));
        }
        if !(self.learning_rate_decay > 0.0 && self.learning_rate_decay <= 1.0) {
            return Err(QeError::config(
                "system.optimizer.learning_rate_decay",
                "must be in (0, 1]",
            ));
        }
        if let Some(warmup) = self.warmup_steps {
            if !warmup.is_finite() || warmup < 0.0 {
                return Err(QeError::config("system.optimizer.warmup_steps", "must be >= 0"));
            }
            if warmup >= 1.0 && warmup.fract() != 0.0 {
                return Err(QeError::config(
                    "system.optimizer.warmup_steps",
                    "must be an integer step count or a fraction below 1",
                ));
            }
        }
        Ok(())
    }

    /// Warmup in optimizer steps; fractions resolve against `training_steps`.
    pub fn resolve_warmup_steps(&self, training_steps: usize) -> usize {
        match self.warmup_steps {
            None => 0,
            Some(w) if w < 1.0 => (w * training_steps as f64).round() as usize,
            Some(w) => w as usize,
        }
    }
}

// ─── system.data_processing ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataProcessingConfig {
    pub vocab: VocabConfig,

    pub share_input_vocabularies: bool,

    #[serde(deserialize_with = "lenient::opt_usize")]
    pub source_max_length: Option<usize>,

    #[serde(deserialize_with = "lenient::opt_usize")]
    pub target_max_length: Option<usize>,

    pub lowercase: bool,
}

impl Default for DataProcessingConfig {
    fn default() -> Self {
        Self {
            vocab:                    VocabConfig::default(),
            share_input_vocabularies: false,
            source_max_length:        None,
            target_max_length:        None,
            lowercase:                false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VocabConfig {
    #[serde(deserialize_with = "lenient::usize")]
    pub min_frequency: usize,

    #[serde(deserialize_with = "lenient::opt_usize")]
    pub max_size: Option<usize>,
}

impl Default for VocabConfig {
    fn default() -> Self {
        Self { min_frequency: 1, max_size: None }
    }
}

// ─── Deserialization helpers ──────────────────────────────────────────────────

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    })
}

/// Number parsing that tolerates `60_000` and `1e-05` whether the YAML
/// parser produced a number or a string.
pub mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub(super) enum NumberRepr {
        Int(i64),
        Float(f64),
        Text(String),
    }

    impl NumberRepr {
        pub(super) fn to_f64(&self) -> Result<f64, String> {
            match self {
                Self::Int(v) => Ok(*v as f64),
                Self::Float(v) => Ok(*v),
                Self::Text(s) => parse_number(s),
            }
        }

        /// True when the literal was written without a decimal point or exponent.
        pub(super) fn is_integral_literal(&self) -> bool {
            match self {
                Self::Int(_) => true,
                Self::Float(_) => false,
                Self::Text(s) => !s.contains(['.', 'e', 'E']),
            }
        }
    }

    pub fn parse_number(raw: &str) -> Result<f64, String> {
        let trimmed = raw.trim();
        if trimmed.starts_with('_') || trimmed.ends_with('_') || trimmed.contains("__") {
            return Err(format!("`{raw}` is not a valid number"));
        }
        let cleaned: String = trimmed.chars().filter(|c| *c != '_').collect();
        match cleaned.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(format!("`{raw}` is not a valid number")),
        }
    }

    fn to_unsigned(repr: &NumberRepr) -> Result<u64, String> {
        let value = repr.to_f64()?;
        if value < 0.0 || value.fract() != 0.0 {
            return Err(format!("expected a non-negative integer, found {value}"));
        }
        Ok(value as u64)
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        NumberRepr::deserialize(d)?.to_f64().map_err(D::Error::custom)
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Option::<NumberRepr>::deserialize(d)?
            .map(|r| r.to_f64().map_err(D::Error::custom))
            .transpose()
    }

    pub(super) fn to_usize(repr: &NumberRepr) -> Result<usize, String> {
        to_unsigned(repr).map(|v| v as usize)
    }

    pub fn usize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        to_usize(&NumberRepr::deserialize(d)?).map_err(D::Error::custom)
    }

    pub fn opt_usize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        Option::<NumberRepr>::deserialize(d)?
            .map(|r| to_unsigned(&r).map(|v| v as usize).map_err(D::Error::custom))
            .transpose()
    }

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        to_unsigned(&NumberRepr::deserialize(d)?).map_err(D::Error::custom)
    }

    pub fn i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = NumberRepr::deserialize(d)?.to_f64().map_err(D::Error::custom)?;
        if value.fract() != 0.0 {
            return Err(D::Error::custom(format!("expected an integer, found {value}")));
        }
        Ok(value as i64)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ExperimentConfig {
        serde_yaml::from_str(yaml).expect("valid yaml")
    }

    const MINIMAL: &str = r#"
system:
  class_name: PredictorEstimator
  model:
    outputs:
      word_level:
        target: true
        gaps: true
        class_weights:
          target_tags:
            BAD: 3.0
      sentence_level:
        hter: true
"#;

    #[test]
    fn test_grouped_and_scientific_numbers() {
        let cfg = parse(
            r#"
system:
  class_name: Bert
  optimizer:
    class_name: adamw
    learning_rate: 1e-05
    training_steps: 12_000
  data_processing:
    vocab:
      max_size: "60_000"
"#,
        );
        assert_eq!(cfg.system.optimizer.learning_rate, 1e-5);
        assert_eq!(cfg.system.optimizer.training_steps, Some(12_000));
        assert_eq!(cfg.system.data_processing.vocab.max_size, Some(60_000));
    }

    #[test]
    fn test_bad_number_is_rejected() {
        let result: Result<ExperimentConfig, _> =
            serde_yaml::from_str("trainer:\n  epochs: twelve\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_size_accepts_quoted_and_grouped_numbers() {
        let cfg = parse("system:\n  batch_size: \"32\"\n");
        assert_eq!(cfg.system.batch_size, BatchSize::Single(32));

        let cfg = parse("system:\n  batch_size:\n    train: 1_024\n    valid: \"64\"\n");
        assert_eq!(cfg.system.batch_size, BatchSize::PerSplit { train: 1024, valid: 64 });

        let result: Result<ExperimentConfig, _> = serde_yaml::from_str("system:\n  batch_size: 2.5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_class_name_and_load_are_exclusive() {
        let mut cfg = parse(MINIMAL);
        assert!(cfg.validate().is_ok());

        cfg.system.load = Some(PathBuf::from("runs/0/checkpoints/best"));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, QeError::Config { ref path, .. } if path == "system"));

        cfg.system.load = None;
        cfg.system.class_name = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_interval_forms() {
        let steps: ValidationInterval = serde_yaml::from_str("100").unwrap();
        let frac: ValidationInterval = serde_yaml::from_str("0.2").unwrap();
        let one: ValidationInterval = serde_yaml::from_str("1").unwrap();
        assert_eq!(steps, ValidationInterval::Steps(100));
        assert_eq!(frac, ValidationInterval::EpochFraction(0.2));
        assert_eq!(one, ValidationInterval::Steps(1));
        assert_eq!(frac.in_steps(50), 10);
        assert!(serde_yaml::from_str::<ValidationInterval>("2.5").is_err());
    }

    #[test]
    fn test_warmup_fraction_resolves_against_training_steps() {
        let mut opt = OptimizerConfig::default();
        opt.warmup_steps = Some(0.15);
        assert_eq!(opt.resolve_warmup_steps(7000), 1050);
        opt.warmup_steps = Some(400.0);
        assert_eq!(opt.resolve_warmup_steps(7000), 400);
    }

    #[test]
    fn test_class_weights_must_cover_bad() {
        let mut cfg = parse(MINIMAL);
        cfg.system.model.outputs.word_level.class_weights.gap_tags =
            TagWeights(BTreeMap::from([(TAG_OK.to_string(), 1.0)]));
        assert!(cfg.validate().is_err());

        cfg.system.model.outputs.word_level.class_weights.gap_tags = TagWeights::bad(-1.0);
        assert!(cfg.validate().is_err());

        cfg.system.model.outputs.word_level.class_weights.gap_tags = TagWeights::bad(5.0);
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.system.model.outputs.word_level.class_weights.gap_tags.as_array(),
            [1.0, 5.0]
        );
    }

    #[test]
    fn test_main_metric_must_be_produced_by_enabled_heads() {
        let mut cfg = parse(MINIMAL);
        cfg.trainer.main_metric = vec!["WMT19_MCC".into(), "PEARSON".into()];
        assert!(cfg.validate().is_ok());

        cfg.trainer.main_metric = vec!["source_tags_MCC".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_main_metric_accepts_single_string() {
        let cfg = parse("trainer:\n  main_metric: PEARSON\n");
        assert_eq!(cfg.trainer.main_metric, vec!["PEARSON".to_string()]);
    }

    #[test]
    fn test_nothing_to_train_is_rejected() {
        let cfg = parse("system:\n  class_name: Predictor\n");
        assert!(cfg.validate().is_err());

        let cfg = parse("system:\n  class_name: Predictor\n  model:\n    tlm:\n      fine_tune: true\n");
        assert!(cfg.validate().is_ok());
    }
}
