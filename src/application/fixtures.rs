// Small on-disk corpora and configurations shared by the use case tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::config::{ArchitectureKind, BatchSize, DatasetFiles, ExperimentConfig, InputFiles, OutputFiles};

const SOURCE: &str = "the cat sat\na dog ran home\nbirds fly\nthe sun is hot\nrain falls\nwe eat bread\n";
const TARGET: &str = "le chat assis\nun chien court maison\noiseaux volent\nle soleil est chaud\npluie tombe\nnous mangeons pain\n";
const TAGS:   &str = "OK OK OK BAD OK OK OK\n\
                      OK OK OK BAD OK OK OK OK OK\n\
                      OK BAD OK OK OK\n\
                      OK OK OK OK OK BAD OK OK OK\n\
                      OK OK OK BAD OK\n\
                      OK OK OK OK OK BAD OK\n";
const SCORES: &str = "0.1\n0.3\n0.5\n0.0\n0.7\n0.2\n";

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).unwrap();
    path
}

/// Six-sentence corpus with gap-interleaved target tags and HTER scores.
pub fn tiny_corpus(dir: &Path) -> DatasetFiles {
    DatasetFiles {
        input: InputFiles {
            source:     Some(write(dir, "corpus.src", SOURCE)),
            target:     Some(write(dir, "corpus.mt", TARGET)),
            alignments: None,
        },
        output: OutputFiles {
            target_tags:     Some(write(dir, "corpus.tags", TAGS)),
            source_tags:     None,
            sentence_scores: Some(write(dir, "corpus.hter", SCORES)),
        },
    }
}

/// A one-epoch predictor run on the tiny corpus, writing under `dir/run`.
pub fn tiny_experiment(dir: &Path) -> ExperimentConfig {
    let corpus = tiny_corpus(dir);
    let mut cfg = ExperimentConfig::default();
    cfg.run.output_dir = Some(dir.join("run"));
    cfg.run.run_id     = Some("test-run".into());
    cfg.trainer.epochs = 1;
    cfg.trainer.log_interval = 1;
    cfg.data.train = Some(corpus.clone());
    cfg.data.valid = Some(corpus);

    let system = &mut cfg.system;
    system.class_name       = Some(ArchitectureKind::Predictor);
    system.batch_size       = BatchSize::Single(2);
    system.num_data_workers = 1;
    system.optimizer.learning_rate = 1e-2;

    let model = &mut system.model;
    model.encoder.hidden_size        = 6;
    model.encoder.rnn_layers         = 1;
    model.encoder.out_embeddings_dim = 4;
    model.encoder.dropout            = 0.0;
    model.encoder.embeddings.source.dim = 4;
    model.encoder.embeddings.target.dim = 4;
    model.decoder.hidden_size     = 5;
    model.decoder.bottleneck_size = 3;
    model.outputs.word_level.target = true;
    model.outputs.word_level.gaps   = true;
    model.outputs.sentence_level.hter = true;
    cfg
}
