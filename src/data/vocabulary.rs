// ============================================================
// Layer 4 — Vocabularies and Token Indexers
// ============================================================
// Maps words to the integer ids the embedding tables consume.
//
// Two indexers sit behind one enum:
//
//   Vocab       → corpus vocabulary built from the training
//                 split, one id per word (predictor backbones,
//                 and transformer backbones without a tokenizer)
//   Pretrained  → a HuggingFace `tokenizer.json` shipped with
//                 the pretrained model; a word may become several
//                 subword pieces
//
// Both wrap every sentence as  <bos> w1 ... wN <eos>  and report
// the index of the first piece of each word, which the encoders
// use to pool piece-level features back to word level.
//
// Vocabulary ids 0..=3 are reserved:
//   0 = <pad>, 1 = <unk>, 2 = <bos>, 3 = <eos>
//
// Reference: Rust Book §8 (HashMaps)
//            tokenizers crate documentation

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::domain::config::{DataProcessingConfig, VocabConfig};
use crate::domain::error::{QeError, QeResult};
use crate::domain::example::QeExample;

pub const PAD: &str = "<pad>";
pub const UNK: &str = "<unk>";
pub const BOS: &str = "<bos>";
pub const EOS: &str = "<eos>";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const BOS_ID: u32 = 2;
pub const EOS_ID: u32 = 3;

pub const VOCABULARIES_FILE: &str = "vocabularies.json";

// ─── Vocabulary ───────────────────────────────────────────────────────────────

/// Bidirectional word ↔ id table. Serialised as its token list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    itos: Vec<String>,
    stoi: HashMap<String, u32>,
}

impl From<Vec<String>> for Vocabulary {
    fn from(tokens: Vec<String>) -> Self {
        let mut itos = vec![PAD.to_string(), UNK.to_string(), BOS.to_string(), EOS.to_string()];
        itos.extend(tokens.into_iter().filter(|t| !is_special(t)));
        let stoi = itos.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();
        Self { itos, stoi }
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.itos
    }
}

fn is_special(token: &str) -> bool {
    matches!(token, PAD | UNK | BOS | EOS)
}

impl Vocabulary {
    /// Keep words seen at least `min_frequency` times, most frequent first
    /// (ties broken lexically), capped at `max_size` non-special entries.
    pub fn build<'a>(words: impl IntoIterator<Item = &'a str>, cfg: &VocabConfig) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for word in words {
            *counts.entry(word).or_insert(0) += 1;
        }

        let mut ranked: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(w, c)| *c >= cfg.min_frequency.max(1) && !is_special(w))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        if let Some(max) = cfg.max_size {
            ranked.truncate(max);
        }

        Self::from(ranked.into_iter().map(|(w, _)| w.to_string()).collect::<Vec<_>>())
    }

    pub fn lookup(&self, word: &str) -> u32 {
        self.stoi.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.itos.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.len() <= 4
    }
}

// ─── Vocabularies ─────────────────────────────────────────────────────────────

/// The source and target vocabularies of a run, persisted as
/// `vocabularies.json` in the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabularies {
    pub source: Vocabulary,
    pub target: Vocabulary,
    /// Source and target share one table (and therefore one id space).
    pub shared: bool,
}

impl Vocabularies {
    pub fn build(examples: &[&QeExample], cfg: &DataProcessingConfig, shared: bool) -> Self {
        let source_words = examples.iter().flat_map(|e| e.source.iter().map(String::as_str));
        let target_words = examples.iter().flat_map(|e| e.target.iter().map(String::as_str));

        if shared {
            let joint = Vocabulary::build(source_words.chain(target_words), &cfg.vocab);
            tracing::info!("Built shared vocabulary: {} entries", joint.len());
            return Self { source: joint.clone(), target: joint, shared };
        }

        let source = Vocabulary::build(source_words, &cfg.vocab);
        let target = Vocabulary::build(target_words, &cfg.vocab);
        tracing::info!(
            "Built vocabularies: source {} entries, target {} entries",
            source.len(),
            target.len()
        );
        Self { source, target, shared }
    }

    pub fn save(&self, dir: &Path) -> QeResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(VOCABULARIES_FILE);
        fs::write(&path, serde_json::to_string(self)?)?;
        Ok(path)
    }

    /// `path` may be the JSON file itself or a directory holding one.
    pub fn load(path: &Path) -> QeResult<Self> {
        let file = if path.is_dir() { path.join(VOCABULARIES_FILE) } else { path.to_path_buf() };
        let text = fs::read_to_string(&file).map_err(|e| {
            QeError::config("system.load_vocabs", format!("cannot read '{}': {e}", file.display()))
        })?;
        let vocabs: Self = serde_json::from_str(&text)?;
        tracing::info!("Loaded vocabularies from '{}'", file.display());
        Ok(vocabs)
    }
}

// ─── TokenIndexer ─────────────────────────────────────────────────────────────

/// Piece ids of one sentence plus the index of each word's first piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedWords {
    pub ids:    Vec<u32>,
    pub starts: Vec<usize>,
}

#[derive(Clone)]
pub struct PretrainedIndexer {
    tokenizer: Tokenizer,
    cls:       u32,
    sep:       u32,
    pad:       u32,
    unk:       u32,
}

impl PretrainedIndexer {
    pub fn new(tokenizer: Tokenizer) -> QeResult<Self> {
        let find = |candidates: &[&str]| candidates.iter().find_map(|t| tokenizer.token_to_id(t));
        let cls = find(&["[CLS]", "<s>"]);
        let sep = find(&["[SEP]", "</s>"]);
        let (Some(cls), Some(sep)) = (cls, sep) else {
            return Err(QeError::config(
                "system.model.encoder.model_name",
                "tokenizer.json defines neither [CLS]/[SEP] nor <s>/</s>",
            ));
        };
        let pad = find(&["[PAD]", "<pad>"]).unwrap_or(0);
        let unk = find(&["[UNK]", "<unk>"]).unwrap_or(pad);
        Ok(Self { tokenizer, cls, sep, pad, unk })
    }

    fn pieces(&self, word: &str) -> Result<Vec<u32>, String> {
        let encoding = self.tokenizer.encode(word, false).map_err(|e| e.to_string())?;
        let ids = encoding.get_ids();
        Ok(if ids.is_empty() { vec![self.unk] } else { ids.to_vec() })
    }
}

/// Turns a word sequence into wrapped piece ids.
#[derive(Clone)]
pub enum TokenIndexer {
    Vocab(Vocabulary),
    Pretrained(PretrainedIndexer),
}

impl TokenIndexer {
    pub fn encode_words(&self, words: &[String]) -> Result<EncodedWords, String> {
        let (bos, eos) = self.bounds();
        let mut ids    = vec![bos];
        let mut starts = Vec::with_capacity(words.len());
        for word in words {
            starts.push(ids.len());
            match self {
                Self::Vocab(vocab) => ids.push(vocab.lookup(word)),
                Self::Pretrained(p) => ids.extend(p.pieces(word)?),
            }
        }
        ids.push(eos);
        Ok(EncodedWords { ids, starts })
    }

    /// (`<bos>`/`[CLS]`, `<eos>`/`[SEP]`) ids.
    pub fn bounds(&self) -> (u32, u32) {
        match self {
            Self::Vocab(_) => (BOS_ID, EOS_ID),
            Self::Pretrained(p) => (p.cls, p.sep),
        }
    }

    pub fn pad_id(&self) -> u32 {
        match self {
            Self::Vocab(_) => PAD_ID,
            Self::Pretrained(p) => p.pad,
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Vocab(v) => v.len(),
            Self::Pretrained(p) => p.tokenizer.get_vocab_size(true),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn example(source: &str, target: &str) -> QeExample {
        QeExample {
            source: source.split(' ').map(String::from).collect(),
            target: target.split(' ').map(String::from).collect(),
            ..QeExample::default()
        }
    }

    #[test]
    fn test_frequency_order_and_specials() {
        let cfg = VocabConfig { min_frequency: 1, max_size: None };
        let vocab = Vocabulary::build(["b", "a", "b", "c", "a", "b"], &cfg);
        assert_eq!(vocab.token(0), Some(PAD));
        assert_eq!(vocab.token(4), Some("b"));
        assert_eq!(vocab.token(5), Some("a"));
        assert_eq!(vocab.lookup("zzz"), UNK_ID);
    }

    #[test]
    fn test_min_frequency_and_max_size() {
        let cfg = VocabConfig { min_frequency: 2, max_size: Some(1) };
        let vocab = Vocabulary::build(["x", "y", "y", "z", "z", "z"], &cfg);
        assert_eq!(vocab.len(), 5);
        assert_eq!(vocab.lookup("z"), 4);
        assert_eq!(vocab.lookup("y"), UNK_ID);
    }

    #[test]
    fn test_shared_vocabularies_use_one_id_space() {
        let a = example("das haus", "the house");
        let vocabs = Vocabularies::build(&[&a], &DataProcessingConfig::default(), true);
        assert_eq!(vocabs.source, vocabs.target);
        assert_ne!(vocabs.source.lookup("das"), UNK_ID);
        assert_ne!(vocabs.target.lookup("the"), UNK_ID);
    }

    #[test]
    fn test_save_and_load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let a = example("das haus", "the house");
        let vocabs = Vocabularies::build(&[&a], &DataProcessingConfig::default(), false);
        vocabs.save(tmp.path()).unwrap();
        assert_eq!(Vocabularies::load(tmp.path()).unwrap(), vocabs);
    }

    #[test]
    fn test_vocab_indexer_wraps_and_marks_starts() {
        let cfg = VocabConfig::default();
        let indexer = TokenIndexer::Vocab(Vocabulary::build(["a", "b"], &cfg));
        let words = vec!["a".to_string(), "q".to_string()];
        let enc = indexer.encode_words(&words).unwrap();
        assert_eq!(enc.ids.first(), Some(&BOS_ID));
        assert_eq!(enc.ids.last(), Some(&EOS_ID));
        assert_eq!(enc.ids[2], UNK_ID);
        assert_eq!(enc.starts, vec![1, 2]);
    }
}
