use burn::{backend::NdArray, data::dataloader::batcher::Batcher};

use crate::data::batcher::{QeBatch, QeBatcher};
use crate::data::dataset::{EncodedSequence, QeSample};

/// Two sentences (3 and 2 target words, 2 source words) with every
/// label field filled, piece ids below 8.
pub fn tiny_samples() -> Vec<QeSample> {
    let sample = |line: usize, words: usize| QeSample {
        line,
        target: EncodedSequence {
            ids:    (0..words + 2).map(|i| 2 + i as u32).collect(),
            starts: (1..=words).collect(),
        },
        source:      EncodedSequence { ids: vec![2, 5, 6, 3], starts: vec![1, 2] },
        alignments:  Some(vec![(0, 0), (1, 0)]),
        target_tags: Some(vec![0; words]),
        gap_tags:    Some(vec![1; words + 1]),
        source_tags: Some(vec![0, 1]),
        hter:        Some(0.3 * line as f32),
    };
    vec![sample(1, 3), sample(2, 2)]
}

pub fn tiny_batch_with<B: burn::prelude::Backend>(interleave: bool) -> QeBatch<B> {
    let items = tiny_samples().into_iter().map(Ok).collect();
    match QeBatcher::<B>::new(Default::default(), 0, interleave).batch(items) {
        Ok(batch) => batch,
        Err(e) => panic!("fixture batch is malformed: {e}"),
    }
}

pub fn tiny_batch() -> QeBatch<NdArray> {
    tiny_batch_with::<NdArray>(false)
}
