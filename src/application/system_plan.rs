// ============================================================
// Layer 2 — System Plan
// ============================================================
// Everything train, evaluate and search agree on before a model
// exists:
//
//   SystemPlan   — architecture + model / data-processing
//                  sections, taken either from the config or from
//                  the run a `system.load` checkpoint belongs to
//   Indexers     — how words become ids (corpus vocabularies or
//                  a pretrained tokenizer) and the sizes they imply
//   build_model  — QeModelBuilder + weight seeding
//
// A trained run directory looks like
//
//   <output_dir>/config.yaml
//   <output_dir>/vocabularies.json
//   <output_dir>/checkpoints/<name>/model.mpk
//
// so a checkpoint finds its run files next to it or two levels up.
//
// Weight precedence: `system.load` (whole model) over
// `system.load_encoder` (encoder record) over the pretrained
// `model.mpk` shipped in `encoder.model_name`.
//
// Reference: Burn Book §5 (Records)

use std::path::{Path, PathBuf};

use burn::prelude::*;

use crate::data::loader::{LengthLimits, ParallelCorpusLoader};
use crate::data::preprocessor::Preprocessor;
use crate::data::vocabulary::{PretrainedIndexer, TokenIndexer, Vocabularies, VOCABULARIES_FILE};
use crate::domain::config::{
    ArchitectureKind, DataProcessingConfig, DatasetFiles, ExperimentConfig, ModelConfig,
};
use crate::domain::error::{QeError, QeResult};
use crate::domain::example::QeExample;
use crate::domain::metrics;
use crate::domain::traits::{ExampleOutcome, ExampleSource};
use crate::infra::config_resolver::{parse_config, read_document};
use crate::infra::tokenizer_store::{PretrainedConfig, TokenizerStore};
use crate::ml::model::{QeModel, QeModelBuilder, SpecialIds};
use crate::ml::system::{load_encoder_record, load_model_record, ENCODER_RECORD};

pub const RUN_CONFIG_FILE: &str = "config.yaml";

// ─── Run files ────────────────────────────────────────────────────────────────

/// `file` next to the checkpoint `dir`, or at the run root two levels up.
pub fn locate_run_file(dir: &Path, file: &str) -> Option<PathBuf> {
    let beside = dir.join(file);
    if beside.exists() {
        return Some(beside);
    }
    dir.parent()
        .and_then(Path::parent)
        .map(|root| root.join(file))
        .filter(|p| p.exists())
}

// ─── SystemPlan ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SystemPlan {
    pub architecture:    ArchitectureKind,
    pub model:           ModelConfig,
    pub data_processing: DataProcessingConfig,
    /// Checkpoint directory whose full model record seeds the weights.
    pub load:            Option<PathBuf>,
    pub load_encoder:    Option<PathBuf>,
    /// Vocabularies to reuse instead of building them from the corpus.
    pub vocabularies:    Option<Vocabularies>,
}

impl SystemPlan {
    pub fn resolve(cfg: &ExperimentConfig) -> QeResult<Self> {
        let system = &cfg.system;

        let Some(load) = &system.load else {
            let architecture = system
                .class_name
                .ok_or_else(|| QeError::config("system.class_name", "is required when `load` is not set"))?;
            let vocabularies = system.load_vocabs.as_deref().map(Vocabularies::load).transpose()?;
            return Ok(Self {
                architecture,
                model:           system.model.clone(),
                data_processing: system.data_processing.clone(),
                load:            None,
                load_encoder:    system.load_encoder.clone(),
                vocabularies,
            });
        };

        let config_path = locate_run_file(load, RUN_CONFIG_FILE).ok_or_else(|| {
            QeError::config(
                "system.load",
                format!("no {RUN_CONFIG_FILE} found for checkpoint '{}'", load.display()),
            )
        })?;
        tracing::info!("Loading trained system description from '{}'", config_path.display());
        let trained = parse_config(read_document(&config_path)?)?;
        let architecture = trained.system.class_name.ok_or_else(|| {
            QeError::config("system.load", format!("'{}' names no class_name", config_path.display()))
        })?;

        // An explicit load_vocabs wins over the ones stored with the run.
        let vocab_path = system
            .load_vocabs
            .clone()
            .or_else(|| locate_run_file(load, VOCABULARIES_FILE));
        let vocabularies = vocab_path.as_deref().map(Vocabularies::load).transpose()?;

        let available = metrics::available_metrics(&trained.system.model.outputs);
        if let Some(name) = cfg.trainer.main_metric.iter().find(|m| !available.contains(m)) {
            return Err(QeError::config(
                "trainer.main_metric",
                format!(
                    "metric `{name}` is not produced by the loaded system (available: {})",
                    available.join(", ")
                ),
            ));
        }

        Ok(Self {
            architecture,
            model:           trained.system.model,
            data_processing: trained.system.data_processing,
            load:            Some(load.clone()),
            load_encoder:    None,
            vocabularies,
        })
    }

    /// The configuration actually trained: a loaded run's system
    /// description replaces `load`, so the logged config rebuilds it.
    pub fn logged_config(&self, cfg: &ExperimentConfig) -> ExperimentConfig {
        let mut logged = cfg.clone();
        if self.load.is_some() {
            logged.system.class_name      = Some(self.architecture);
            logged.system.load            = None;
            logged.system.model           = self.model.clone();
            logged.system.data_processing = self.data_processing.clone();
        }
        logged
    }

    pub fn main_metrics(&self, cfg: &ExperimentConfig) -> Vec<String> {
        if cfg.trainer.main_metric.is_empty() {
            metrics::default_main_metrics(&self.model.outputs)
        } else {
            cfg.trainer.main_metric.clone()
        }
    }

    /// Identity a resumable state must match.
    pub fn fingerprint(&self, main_metrics: &[String]) -> QeResult<String> {
        Ok(serde_json::to_string(&(self.architecture, &self.model, main_metrics))?)
    }

    fn is_transformer(&self) -> bool {
        !self.architecture.is_predictor_based()
    }

    /// Load one split with this plan's preprocessing and length limits.
    pub fn load_split(&self, name: &str, files: &DatasetFiles) -> QeResult<Vec<ExampleOutcome>> {
        let dp = &self.data_processing;
        let limits = LengthLimits { source: dp.source_max_length, target: dp.target_max_length };
        ParallelCorpusLoader::new(name, files.clone(), Preprocessor::new(dp.lowercase))
            .with_limits(limits)
            .load_all()
    }

    // ─── Indexers ─────────────────────────────────────────────────────────────

    /// Pick the word → id mapping. `corpus` builds vocabularies when
    /// neither a tokenizer nor saved vocabularies are available.
    pub fn indexers(&self, corpus: Option<&[ExampleOutcome]>) -> QeResult<Indexers> {
        let mut pretrained = None;
        let mut weights = None;

        if let (true, Some(name)) = (self.is_transformer(), &self.model.encoder.model_name) {
            let store = TokenizerStore::open(name)?;
            pretrained = store.config()?;
            weights = store.weights();
            if let Some(tokenizer) = store.tokenizer()? {
                let indexer = TokenIndexer::Pretrained(PretrainedIndexer::new(tokenizer)?);
                return Ok(Indexers {
                    source: indexer.clone(),
                    target: indexer,
                    vocabularies: None,
                    pretrained,
                    weights,
                    shared: true,
                });
            }
            tracing::warn!("'{name}' ships no tokenizer.json; falling back to corpus vocabularies");
        }

        let vocabularies = match (&self.vocabularies, corpus) {
            (Some(vocabs), _) => vocabs.clone(),
            (None, Some(corpus)) => {
                let shared = self.data_processing.share_input_vocabularies || self.is_transformer();
                if shared && !self.data_processing.share_input_vocabularies {
                    tracing::info!("Transformer encoders read one id space; sharing source and target vocabularies");
                }
                let parsed: Vec<&QeExample> = corpus.iter().filter_map(|o| o.as_ref().ok()).collect();
                Vocabularies::build(&parsed, &self.data_processing, shared)
            }
            (None, None) => {
                return Err(QeError::config(
                    "system.load_vocabs",
                    format!("no {VOCABULARIES_FILE} available to index the data"),
                ))
            }
        };
        if self.is_transformer() && !vocabularies.shared {
            return Err(QeError::config(
                "system.load_vocabs",
                "transformer encoders need a shared source/target vocabulary",
            ));
        }

        Ok(Indexers {
            source:       TokenIndexer::Vocab(vocabularies.source.clone()),
            target:       TokenIndexer::Vocab(vocabularies.target.clone()),
            shared:       vocabularies.shared,
            vocabularies: Some(vocabularies),
            pretrained,
            weights,
        })
    }

    // ─── Model ────────────────────────────────────────────────────────────────

    pub fn build_model<B: Backend>(&self, indexers: &Indexers, device: &B::Device) -> QeResult<QeModel<B>> {
        let (bos, eos) = indexers.target.bounds();
        let builder = QeModelBuilder {
            architecture:      self.architecture,
            model:             &self.model,
            source_vocab_size: indexers.source.vocab_size(),
            target_vocab_size: indexers.target.vocab_size(),
            shared_vocabulary: indexers.shared,
            pretrained:        indexers.pretrained.as_ref(),
            special:           SpecialIds { pad: indexers.target.pad_id(), bos, eos },
        };
        let model = builder.build::<B>(device)?;

        if let Some(load) = &self.load {
            tracing::info!("Loading model weights from '{}'", load.display());
            return load_model_record(model, load, device);
        }
        if let Some(dir) = &self.load_encoder {
            tracing::info!("Loading encoder weights from '{}'", dir.display());
            return load_encoder_record(model, &dir.join(ENCODER_RECORD), device);
        }
        if let Some(stem) = &indexers.weights {
            tracing::info!("Loading pretrained encoder weights from '{}'", stem.display());
            return load_encoder_record(model, stem, device);
        }
        Ok(model)
    }
}

pub struct Indexers {
    pub source:       TokenIndexer,
    pub target:       TokenIndexer,
    /// Present when ids come from corpus vocabularies.
    pub vocabularies: Option<Vocabularies>,
    pub pretrained:   Option<PretrainedConfig>,
    /// Recorder stem of the pretrained encoder weights.
    pub weights:      Option<PathBuf>,
    pub shared:       bool,
}

impl Indexers {
    /// Padding id the batcher fills with.
    pub fn pad_id(&self) -> u32 {
        self.target.pad_id()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::domain::config::{InputFiles, OutputFiles};
    use crate::infra::config_resolver::to_yaml;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn corpus(dir: &Path) -> DatasetFiles {
        DatasetFiles {
            input: InputFiles {
                source: Some(write(dir, "train.src", "a b\nc d e\nf\n")),
                target: Some(write(dir, "train.mt", "x y\nz w v\nu\n")),
                alignments: None,
            },
            output: OutputFiles {
                target_tags: Some(write(dir, "train.tags", "OK OK OK OK OK\nOK BAD OK OK OK BAD OK\nBAD OK BAD\n")),
                ..OutputFiles::default()
            },
        }
    }

    fn predictor_config() -> ExperimentConfig {
        let mut cfg = ExperimentConfig::default();
        cfg.system.class_name = Some(ArchitectureKind::Predictor);
        cfg.system.model.outputs.word_level.target = true;
        cfg
    }

    #[test]
    fn test_run_files_are_found_at_the_run_root() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = tmp.path().join("checkpoints").join("epoch=1-step=10");
        fs::create_dir_all(&ckpt).unwrap();
        write(tmp.path(), RUN_CONFIG_FILE, "run: {}\n");
        assert_eq!(locate_run_file(&ckpt, RUN_CONFIG_FILE), Some(tmp.path().join(RUN_CONFIG_FILE)));
        assert_eq!(locate_run_file(&ckpt, VOCABULARIES_FILE), None);
    }

    #[test]
    fn test_loaded_plan_takes_the_trained_system() {
        let tmp = tempfile::tempdir().unwrap();
        let ckpt = tmp.path().join("checkpoints").join("best");
        fs::create_dir_all(&ckpt).unwrap();
        let mut trained = predictor_config();
        trained.system.model.encoder.hidden_size = 12;
        write(tmp.path(), RUN_CONFIG_FILE, &to_yaml(&trained).unwrap());

        let mut cfg = ExperimentConfig::default();
        cfg.system.load = Some(ckpt.clone());
        let plan = SystemPlan::resolve(&cfg).unwrap();
        assert_eq!(plan.architecture, ArchitectureKind::Predictor);
        assert_eq!(plan.model.encoder.hidden_size, 12);

        let logged = plan.logged_config(&cfg);
        assert_eq!(logged.system.load, None);
        assert_eq!(logged.system.class_name, Some(ArchitectureKind::Predictor));
        assert!(logged.validate().is_ok());
    }

    #[test]
    fn test_loaded_plan_rejects_foreign_main_metric() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), RUN_CONFIG_FILE, &to_yaml(&predictor_config()).unwrap());
        let mut cfg = ExperimentConfig::default();
        cfg.system.load = Some(tmp.path().to_path_buf());
        cfg.trainer.main_metric = vec!["PEARSON".into()];
        assert!(matches!(SystemPlan::resolve(&cfg), Err(QeError::Config { .. })));
    }

    #[test]
    fn test_transformer_without_tokenizer_shares_vocabularies() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = predictor_config();
        cfg.system.class_name = Some(ArchitectureKind::Bert);
        let plan = SystemPlan::resolve(&cfg).unwrap();
        let examples = plan.load_split("train", &corpus(tmp.path())).unwrap();
        let indexers = plan.indexers(Some(&examples)).unwrap();
        assert!(indexers.shared);
        assert_eq!(indexers.source.vocab_size(), indexers.target.vocab_size());
    }

    #[test]
    fn test_indexers_need_a_vocabulary_source() {
        let plan = SystemPlan::resolve(&predictor_config()).unwrap();
        assert!(matches!(plan.indexers(None), Err(QeError::Config { .. })));
    }
}
