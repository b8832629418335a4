// ============================================================
// Layer 6 — Tokenizer Store
// ============================================================
// Reads a local pretrained-transformer directory:
//
//   <model_name>/
//     config.json      ← HuggingFace-style dimensions
//     tokenizer.json   ← optional; subword tokenizer
//     model.mpk        ← optional; backbone weights (f32 NamedMpkFileRecorder)
//
// Without tokenizer.json the corpus vocabulary is used instead;
// without model.mpk the backbone starts from random weights.
//
// Reference: tokenizers crate documentation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::domain::error::{QeError, QeResult};

const MODEL_NAME_FIELD: &str = "system.model.encoder.model_name";

/// The config.json fields the transformer backbone needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedConfig {
    pub hidden_size:             usize,
    pub num_hidden_layers:       usize,
    pub num_attention_heads:     usize,
    pub intermediate_size:       usize,
    pub max_position_embeddings: usize,
    pub vocab_size:              usize,
    #[serde(default)]
    pub type_vocab_size:         usize,
}

pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    /// `model_name` must name an existing local directory.
    pub fn open(model_name: &str) -> QeResult<Self> {
        let dir = PathBuf::from(model_name);
        if !dir.is_dir() {
            return Err(QeError::config(
                MODEL_NAME_FIELD,
                format!("'{model_name}' is not a local model directory"),
            ));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> QeResult<Option<PretrainedConfig>> {
        let path = self.dir.join("config.json");
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| QeError::config(MODEL_NAME_FIELD, format!("bad config.json: {e}")))
    }

    /// Load `tokenizer.json` when the directory ships one.
    pub fn tokenizer(&self) -> QeResult<Option<Tokenizer>> {
        let path = self.dir.join("tokenizer.json");
        if !path.exists() {
            return Ok(None);
        }
        tracing::info!("Loading tokenizer from '{}'", path.display());
        Tokenizer::from_file(&path).map(Some).map_err(|e| {
            QeError::config(MODEL_NAME_FIELD, format!("cannot load '{}': {e}", path.display()))
        })
    }

    /// Recorder path (without extension) of the backbone weights, if present.
    pub fn weights(&self) -> Option<PathBuf> {
        let stem = self.dir.join("model");
        stem.with_extension("mpk").exists().then_some(stem)
    }
}
