// ============================================================
// Layer 5 — Encoder Contract
// ============================================================
// Every backbone turns a batch into the same four feature
// tensors, so the decoder and the output heads never need to
// know which backbone produced them:
//
//   target     [N, T, Dt]  one row per target word
//   source     [N, S, Ds]  one row per source word
//   sentence   [N, Dz]     one row per sentence pair
//   tlm_logits [N, Lt, V]  target word predictions (predictor only)
//
// `Encoder` is the tagged union the model actually stores; it
// dispatches to the predictor or the transformer backbone.
//
// Reference: Rust Book §10 (Traits)
//            Rust Book §6 (Enums)

use burn::prelude::*;

use crate::data::batcher::QeBatch;
use crate::ml::predictor::PredictorEncoder;
use crate::ml::transformer::TransformerEncoder;

pub struct EncoderOutput<B: Backend> {
    pub target:     Tensor<B, 3>,
    pub source:     Tensor<B, 3>,
    pub sentence:   Tensor<B, 2>,
    pub tlm_logits: Option<Tensor<B, 3>>,
}

pub trait QeEncoder<B: Backend> {
    fn encode(&self, batch: &QeBatch<B>) -> EncoderOutput<B>;

    fn target_dim(&self) -> usize;

    fn source_dim(&self) -> usize;

    fn sentence_dim(&self) -> usize;
}

#[derive(Module, Debug)]
pub enum Encoder<B: Backend> {
    Predictor(PredictorEncoder<B>),
    Transformer(TransformerEncoder<B>),
}

impl<B: Backend> Encoder<B> {
    /// Only the predictor exposes output embeddings for TLM.
    pub fn supports_tlm(&self) -> bool {
        matches!(self, Self::Predictor(_))
    }
}

impl<B: Backend> QeEncoder<B> for Encoder<B> {
    fn encode(&self, batch: &QeBatch<B>) -> EncoderOutput<B> {
        match self {
            Self::Predictor(p) => p.encode(batch),
            Self::Transformer(t) => t.encode(batch),
        }
    }

    fn target_dim(&self) -> usize {
        match self {
            Self::Predictor(p) => p.target_dim(),
            Self::Transformer(t) => t.target_dim(),
        }
    }

    fn source_dim(&self) -> usize {
        match self {
            Self::Predictor(p) => p.source_dim(),
            Self::Transformer(t) => t.source_dim(),
        }
    }

    fn sentence_dim(&self) -> usize {
        match self {
            Self::Predictor(p) => p.sentence_dim(),
            Self::Transformer(t) => t.sentence_dim(),
        }
    }
}
