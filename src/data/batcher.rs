// ============================================================
// Layer 4 — QE Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec of encoded
// samples into padded tensors.
//
// Unlike fixed-length inputs, QE sentences vary in length, so
// every sequence is padded here to the longest one in the batch:
//
//   pieces   [N, L]   token ids, pad id past the end
//   starts   [N, W]   index of each word's first piece
//   tags     [N, W]   OK=0, BAD=1, PAD=2 past the end
//   gaps     [N, W+1] one tag per gap around the words
//
// With `interleave` set the batcher also builds the joint
// sequence  <cls> target <sep> source <sep>  for transformer
// backbones that read both sentences at once.
//
// A single malformed sample poisons its batch: the whole
// batch is returned as an Err and skipped by the loop.
//
// Reference: Burn Book §4 (Batcher)
//            Rust Book §8 (Vectors)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::{EncodedSequence, QeSample, SampleOutcome};
use crate::domain::error::BatchDataError;
use crate::domain::example::{TagField, PAD_INDEX};
use crate::domain::traits::BatchOutcome;

// ─── Batch types ──────────────────────────────────────────────────────────────

/// One padded side (target or source) of a batch.
#[derive(Debug, Clone)]
pub struct SequenceBatch<B: Backend> {
    /// Piece ids — shape: [batch, pieces]
    pub ids: Tensor<B, 2, Int>,

    /// True at padded piece positions — shape: [batch, pieces]
    pub pad_mask: Tensor<B, 2, Bool>,

    /// First piece of each word — shape: [batch, words]
    pub starts: Tensor<B, 2, Int>,

    /// True past the last word — shape: [batch, words]
    pub word_pad: Tensor<B, 2, Bool>,
}

/// `<cls> target <sep> source <sep>` as one sequence.
#[derive(Debug, Clone)]
pub struct JointInput<B: Backend> {
    pub ids:      Tensor<B, 2, Int>,
    /// 0 for the target segment, 1 for the source segment
    pub segments: Tensor<B, 2, Int>,
    pub pad_mask: Tensor<B, 2, Bool>,
    /// First piece of each source word inside the joint sequence
    pub source_starts: Tensor<B, 2, Int>,
}

#[derive(Debug, Clone)]
pub struct QeBatch<B: Backend> {
    pub target: SequenceBatch<B>,
    pub source: SequenceBatch<B>,
    pub joint:  Option<JointInput<B>>,

    /// Row-normalised word alignments — shape: [batch, target words, source words].
    /// All zeros when the corpus has no alignments.
    pub alignment: Tensor<B, 3>,

    pub target_tags: Option<Tensor<B, 2, Int>>,
    pub gap_tags:    Option<Tensor<B, 2, Int>>,
    pub source_tags: Option<Tensor<B, 2, Int>>,

    /// Sentence HTER — shape: [batch]
    pub hter: Option<Tensor<B, 1>>,

    /// Corpus line of every row, for error messages.
    pub lines: Vec<usize>,
}

impl<B: Backend> QeBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.lines.len()
    }

    pub fn tags(&self, field: TagField) -> Option<&Tensor<B, 2, Int>> {
        match field {
            TagField::TargetTags => self.target_tags.as_ref(),
            TagField::GapTags    => self.gap_tags.as_ref(),
            TagField::SourceTags => self.source_tags.as_ref(),
        }
    }
}

// ─── QeBatcher ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct QeBatcher<B: Backend> {
    pub device:     B::Device,
    pub pad_id:     u32,
    pub interleave: bool,
}

impl<B: Backend> QeBatcher<B> {
    pub fn new(device: B::Device, pad_id: u32, interleave: bool) -> Self {
        Self { device, pad_id, interleave }
    }

    fn int_tensor(&self, flat: Vec<i32>, rows: usize, cols: usize) -> Tensor<B, 2, Int> {
        Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &self.device).reshape([rows, cols])
    }

    /// 1 where `flags` is set, as a Bool tensor.
    fn bool_tensor(&self, flags: Vec<i32>, rows: usize, cols: usize) -> Tensor<B, 2, Bool> {
        self.int_tensor(flags, rows, cols).equal_elem(1)
    }

    fn sequences(&self, seqs: &[&EncodedSequence]) -> SequenceBatch<B> {
        let n     = seqs.len();
        let len   = seqs.iter().map(|s| s.ids.len()).max().unwrap_or(1);
        let words = seqs.iter().map(|s| s.starts.len()).max().unwrap_or(1).max(1);

        let mut ids      = Vec::with_capacity(n * len);
        let mut pad      = Vec::with_capacity(n * len);
        let mut starts   = Vec::with_capacity(n * words);
        let mut word_pad = Vec::with_capacity(n * words);
        for seq in seqs {
            for i in 0..len {
                let id = seq.ids.get(i).copied();
                ids.push(id.unwrap_or(self.pad_id) as i32);
                pad.push(id.is_none() as i32);
            }
            for w in 0..words {
                let start = seq.starts.get(w).copied();
                starts.push(start.unwrap_or(0) as i32);
                word_pad.push(start.is_none() as i32);
            }
        }

        SequenceBatch {
            ids:      self.int_tensor(ids, n, len),
            pad_mask: self.bool_tensor(pad, n, len),
            starts:   self.int_tensor(starts, n, words),
            word_pad: self.bool_tensor(word_pad, n, words),
        }
    }

    fn joint(&self, items: &[QeSample]) -> JointInput<B> {
        let n = items.len();
        let sequences: Vec<(Vec<u32>, usize, Vec<usize>)> = items
            .iter()
            .map(|s| {
                // target already ends in <sep>; drop the source's own <cls>
                let offset = s.target.ids.len();
                let mut ids = s.target.ids.clone();
                ids.extend(s.source.ids.iter().skip(1));
                let starts = s.source.starts.iter().map(|p| p + offset - 1).collect();
                (ids, offset, starts)
            })
            .collect();

        let len   = sequences.iter().map(|s| s.0.len()).max().unwrap_or(1);
        let words = sequences.iter().map(|s| s.2.len()).max().unwrap_or(1).max(1);

        let mut ids      = Vec::with_capacity(n * len);
        let mut segments = Vec::with_capacity(n * len);
        let mut pad      = Vec::with_capacity(n * len);
        let mut starts   = Vec::with_capacity(n * words);
        for (seq, offset, source_starts) in &sequences {
            for i in 0..len {
                let id = seq.get(i).copied();
                ids.push(id.unwrap_or(self.pad_id) as i32);
                segments.push((i >= *offset && id.is_some()) as i32);
                pad.push(id.is_none() as i32);
            }
            for w in 0..words {
                starts.push(source_starts.get(w).copied().unwrap_or(0) as i32);
            }
        }

        JointInput {
            ids:           self.int_tensor(ids, n, len),
            segments:      self.int_tensor(segments, n, len),
            pad_mask:      self.bool_tensor(pad, n, len),
            source_starts: self.int_tensor(starts, n, words),
        }
    }

    fn alignment(&self, items: &[QeSample], t_words: usize, s_words: usize) -> Tensor<B, 3> {
        let n = items.len();
        let mut matrix = vec![0.0f32; n * t_words * s_words];
        for (b, sample) in items.iter().enumerate() {
            let Some(pairs) = &sample.alignments else { continue };
            let mut per_target = vec![0usize; t_words];
            for &(_, t) in pairs {
                per_target[t] += 1;
            }
            for &(s, t) in pairs {
                matrix[(b * t_words + t) * s_words + s] += 1.0 / per_target[t] as f32;
            }
        }
        Tensor::<B, 1>::from_floats(matrix.as_slice(), &self.device).reshape([n, t_words, s_words])
    }

    /// `width` columns per row, PAD_INDEX past each row's end. None unless
    /// every sample carries the field.
    fn tags(&self, items: &[QeSample], field: TagField, width: usize) -> Option<Tensor<B, 2, Int>> {
        let rows: Option<Vec<&[u8]>> = items.iter().map(|s| s.tags(field)).collect();
        let rows = rows?;
        let mut flat = Vec::with_capacity(items.len() * width);
        for row in rows {
            for i in 0..width {
                flat.push(row.get(i).copied().unwrap_or(PAD_INDEX) as i32);
            }
        }
        Some(self.int_tensor(flat, items.len(), width))
    }
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
impl<B: Backend> Batcher<SampleOutcome, BatchOutcome<QeBatch<B>>> for QeBatcher<B> {
    fn batch(&self, items: Vec<SampleOutcome>) -> BatchOutcome<QeBatch<B>> {
        let items: Vec<QeSample> = items.into_iter().collect::<Result<_, _>>()?;
        if items.is_empty() {
            return Err(BatchDataError::new(0, "batch", "no samples"));
        }

        let targets: Vec<&EncodedSequence> = items.iter().map(|s| &s.target).collect();
        let sources: Vec<&EncodedSequence> = items.iter().map(|s| &s.source).collect();
        let target = self.sequences(&targets);
        let source = self.sequences(&sources);

        let t_words = target.starts.dims()[1];
        let s_words = source.starts.dims()[1];

        let hter: Option<Vec<f32>> = items.iter().map(|s| s.hter).collect();

        Ok(QeBatch {
            joint:       self.interleave.then(|| self.joint(&items)),
            alignment:   self.alignment(&items, t_words, s_words),
            target_tags: self.tags(&items, TagField::TargetTags, t_words),
            gap_tags:    self.tags(&items, TagField::GapTags, t_words + 1),
            source_tags: self.tags(&items, TagField::SourceTags, s_words),
            hter:        hter.map(|v| Tensor::<B, 1>::from_floats(v.as_slice(), &self.device)),
            lines:       items.iter().map(|s| s.line).collect(),
            target,
            source,
        })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    fn sample(line: usize, target_words: usize, source_words: usize) -> QeSample {
        let seq = |n: usize| EncodedSequence {
            ids:    (0..n + 2).map(|i| 10 + i as u32).collect(),
            starts: (1..=n).collect(),
        };
        QeSample {
            line,
            target:      seq(target_words),
            source:      seq(source_words),
            alignments:  Some((0..target_words.min(source_words)).map(|i| (i, i)).collect()),
            target_tags: Some(vec![1; target_words]),
            gap_tags:    Some(vec![0; target_words + 1]),
            source_tags: None,
            hter:        Some(0.25),
        }
    }

    #[test]
    fn test_pads_to_longest_sentence() {
        let batcher = QeBatcher::<TB>::new(Default::default(), 0, false);
        let batch = batcher.batch(vec![Ok(sample(1, 3, 2)), Ok(sample(2, 1, 4))]).unwrap();

        assert_eq!(batch.target.ids.dims(), [2, 5]);
        assert_eq!(batch.target.starts.dims(), [2, 3]);
        assert_eq!(batch.source.starts.dims(), [2, 4]);
        assert_eq!(batch.alignment.dims(), [2, 3, 4]);
        assert_eq!(batch.gap_tags.as_ref().unwrap().dims(), [2, 4]);
        assert!(batch.source_tags.is_none());
        assert!(batch.joint.is_none());

        let tags = batch.target_tags.unwrap().into_data().convert::<i32>().to_vec::<i32>().unwrap();
        assert_eq!(tags, vec![1, 1, 1, 1, PAD_INDEX as i32, PAD_INDEX as i32]);

        let pads = batch.target.word_pad.int().into_data().convert::<i32>().to_vec::<i32>().unwrap();
        assert_eq!(pads, vec![0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_malformed_sample_rejects_batch() {
        let batcher = QeBatcher::<TB>::new(Default::default(), 0, false);
        let bad = Err(BatchDataError::new(7, "target", "unknown tag"));
        let err = batcher.batch(vec![Ok(sample(1, 2, 2)), bad]).unwrap_err();
        assert_eq!(err.line, 7);
    }

    #[test]
    fn test_joint_sequence_offsets_source_words() {
        let batcher = QeBatcher::<TB>::new(Default::default(), 0, true);
        let batch = batcher.batch(vec![Ok(sample(1, 2, 2))]).unwrap();
        let joint = batch.joint.unwrap();
        // 4 target pieces + 3 source pieces (source <cls> dropped)
        assert_eq!(joint.ids.dims(), [1, 7]);
        let starts = joint.source_starts.into_data().convert::<i32>().to_vec::<i32>().unwrap();
        assert_eq!(starts, vec![4, 5]);
        let segments = joint.segments.into_data().convert::<i32>().to_vec::<i32>().unwrap();
        assert_eq!(segments, vec![0, 0, 0, 0, 1, 1, 1]);
    }
}
