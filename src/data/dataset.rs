// ============================================================
// Layer 4 — QE Dataset
// ============================================================
// Holds the indexed form of one corpus split and exposes it to
// Burn's DataLoader through the `Dataset` trait.
//
// Each parsed example is turned into a `QeSample`:
//
//   words    "The house is small ."
//   ids      [87, 412, 15, 2031, 9]     one or more pieces per word
//   starts   [0, 1, 2, 3, 4]            index of each word's first piece
//   tags     [0, 0, 0, 1, 0]            OK=0, BAD=1
//
// Lines that failed to parse or index stay in the dataset as
// `Err(BatchDataError)` at their original position, so a batch
// still knows which corpus line it skipped and why.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

use crate::data::vocabulary::{EncodedWords, TokenIndexer};
use crate::domain::config::OutputsConfig;
use crate::domain::error::{BatchDataError, QeError, QeResult};
use crate::domain::example::{QeExample, Tag, TagField};
use crate::domain::traits::ExampleOutcome;

// ─── Samples ──────────────────────────────────────────────────────────────────

/// One example after indexing. Sequences are unpadded; the batcher pads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QeSample {
    pub line: usize,

    pub target: EncodedSequence,
    pub source: EncodedSequence,

    /// (source word, target word) pairs.
    pub alignments: Option<Vec<(usize, usize)>>,

    pub target_tags: Option<Vec<u8>>,
    pub gap_tags:    Option<Vec<u8>>,
    pub source_tags: Option<Vec<u8>>,
    pub hter:        Option<f32>,
}

/// Piece ids of a sentence plus the offset where every word starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSequence {
    pub ids:    Vec<u32>,
    pub starts: Vec<usize>,
}

impl From<EncodedWords> for EncodedSequence {
    fn from(words: EncodedWords) -> Self {
        Self { ids: words.ids, starts: words.starts }
    }
}

impl QeSample {
    pub fn tags(&self, field: TagField) -> Option<&[u8]> {
        match field {
            TagField::TargetTags => self.target_tags.as_deref(),
            TagField::GapTags    => self.gap_tags.as_deref(),
            TagField::SourceTags => self.source_tags.as_deref(),
        }
    }
}

pub type SampleOutcome = Result<QeSample, BatchDataError>;

// ─── Encoding ─────────────────────────────────────────────────────────────────

/// Index one parsed example with the source/target indexers.
pub fn encode_example(
    example: &QeExample,
    source:  &TokenIndexer,
    target:  &TokenIndexer,
) -> SampleOutcome {
    let line   = example.line;
    let target = target
        .encode_words(&example.target)
        .map_err(|e| BatchDataError::new(line, "target", e))?;
    let source = source
        .encode_words(&example.source)
        .map_err(|e| BatchDataError::new(line, "source", e))?;
    let indices = |tags: &Option<Vec<Tag>>| tags.as_ref().map(|t| t.iter().map(|t| t.index()).collect());
    Ok(QeSample {
        line,
        target:      target.into(),
        source:      source.into(),
        alignments:  example.alignments.clone(),
        target_tags: indices(&example.target_tags),
        gap_tags:    indices(&example.gap_tags),
        source_tags: indices(&example.source_tags),
        hter:        example.sentence_score,
    })
}

/// Every enabled head needs its data field on every well-formed example.
///
/// Checked once, before training, so a corpus without gap tags fails
/// with the config field to fix instead of a shape error mid-epoch.
pub fn check_required_fields(examples: &[ExampleOutcome], outputs: &OutputsConfig) -> QeResult<()> {
    let word     = &outputs.word_level;
    let sentence = &outputs.sentence_level;
    let required: [(bool, &str, &str, fn(&QeExample) -> bool); 5] = [
        (word.target, "target_tags", "output.target_tags", |e| e.target_tags.is_some()),
        (word.gaps, "gap_tags", "output.target_tags (with gap tags)", |e| e.gap_tags.is_some()),
        (word.source, "source_tags", "output.source_tags", |e| e.source_tags.is_some()),
        (sentence.hter, "sentence_scores", "output.sentence_scores", |e| e.sentence_score.is_some()),
        (sentence.binary, "binary", "output.sentence_scores", |e| e.sentence_score.is_some()),
    ];
    for (enabled, head, field, present) in required {
        if !enabled {
            continue;
        }
        let mut parsed = examples.iter().filter_map(|o| o.as_ref().ok()).peekable();
        if parsed.peek().is_none() || parsed.any(|e| !present(e)) {
            return Err(QeError::missing_field(head, field));
        }
    }
    Ok(())
}

// ─── QeDataset ────────────────────────────────────────────────────────────────

/// An indexed split, malformed lines included.
pub struct QeDataset {
    samples: Vec<SampleOutcome>,
}

impl QeDataset {
    pub fn new(samples: Vec<SampleOutcome>) -> Self { Self { samples } }

    pub fn from_examples(
        examples: &[ExampleOutcome],
        source:   &TokenIndexer,
        target:   &TokenIndexer,
    ) -> Self {
        let samples = examples
            .iter()
            .map(|outcome| match outcome {
                Ok(example) => encode_example(example, source, target),
                Err(e) => Err(e.clone()),
            })
            .collect();
        Self { samples }
    }

    /// Lines in the split, including malformed ones.
    pub fn sample_count(&self) -> usize { self.samples.len() }

    pub fn malformed_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_err()).count()
    }
}

impl Dataset<SampleOutcome> for QeDataset {
    fn get(&self, index: usize) -> Option<SampleOutcome> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::vocabulary::Vocabulary;
    use crate::domain::config::VocabConfig;

    fn example(line: usize) -> QeExample {
        QeExample {
            line,
            source: vec!["a".into(), "b".into()],
            target: vec!["x".into()],
            target_tags: Some(vec![Tag::Bad]),
            ..QeExample::default()
        }
    }

    #[test]
    fn test_missing_gap_tags_fail_before_training() {
        let mut outputs = OutputsConfig::default();
        outputs.word_level.target = true;
        let examples = vec![Ok(example(1))];
        assert!(check_required_fields(&examples, &outputs).is_ok());

        outputs.word_level.gaps = true;
        let err = check_required_fields(&examples, &outputs).unwrap_err();
        assert!(matches!(err, QeError::MissingField { ref head, .. } if head == "gap_tags"));
    }

    #[test]
    fn test_malformed_examples_stay_in_place() {
        let vocab = TokenIndexer::Vocab(Vocabulary::build(["a", "x"], &VocabConfig::default()));
        let examples = vec![Ok(example(1)), Err(BatchDataError::new(2, "target", "empty"))];
        let dataset = QeDataset::from_examples(&examples, &vocab, &vocab);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.malformed_count(), 1);
        let sample = dataset.get(0).unwrap().unwrap();
        assert_eq!(sample.target.starts, vec![1]);
        assert_eq!(sample.target_tags, Some(vec![1]));
    }
}
