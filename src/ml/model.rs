// ============================================================
// Layer 5 — QE Model
// ============================================================
// The full graph: encoder → decoder → output heads, plus the
// optional TLM objective on the predictor's word logits.
//
// `QeModelBuilder` assembles it from the `system.model`
// configuration, the architecture name and the vocabulary
// sizes; heads are created only for the flags that are on.
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

use burn::prelude::*;

use crate::data::batcher::QeBatch;
use crate::domain::config::{ArchitectureKind, ModelConfig};
use crate::domain::error::{BatchDataError, QeError, QeResult};
use crate::infra::tokenizer_store::PretrainedConfig;
use crate::ml::decoder::{Decoder, DecoderSettings};
use crate::ml::encoder::{Encoder, QeEncoder};
use crate::ml::outputs::{weighted_total, HeadOutputs, LossTerm, OutputHeads};
use crate::ml::predictor::PredictorConfig;
use crate::ml::tlm::TlmObjective;
use crate::ml::transformer::TransformerConfig;

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Ids of the special pieces in the target id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
}

pub struct QeModelBuilder<'a> {
    pub architecture:      ArchitectureKind,
    pub model:             &'a ModelConfig,
    pub source_vocab_size: usize,
    pub target_vocab_size: usize,
    pub shared_vocabulary: bool,
    pub pretrained:        Option<&'a PretrainedConfig>,
    pub special:           SpecialIds,
}

impl QeModelBuilder<'_> {
    pub fn build<B: Backend>(&self, device: &B::Device) -> QeResult<QeModel<B>> {
        let encoder = self.build_encoder(device)?;

        let dec = &self.model.decoder;
        let decoder = DecoderSettings::new(
            encoder.target_dim(),
            encoder.source_dim(),
            encoder.sentence_dim(),
            dec.hidden_size,
            dec.rnn_layers,
            dec.use_mlp,
            dec.dropout,
            dec.bottleneck_size,
        )
        .init(device);

        let outputs = OutputHeads::new(
            &self.model.outputs,
            decoder.target_dim(),
            decoder.source_dim(),
            decoder.sentence_dim,
            device,
        );

        let tlm = self.model.tlm.fine_tune && encoder.supports_tlm();
        if self.model.tlm.fine_tune && !tlm {
            tracing::warn!("tlm.fine_tune is only available for predictor encoders; ignoring it");
        }

        Ok(QeModel {
            encoder,
            decoder,
            outputs,
            tlm,
            pad_id: self.special.pad as usize,
            bos_id: self.special.bos as usize,
            eos_id: self.special.eos as usize,
        })
    }

    fn build_encoder<B: Backend>(&self, device: &B::Device) -> QeResult<Encoder<B>> {
        let enc = &self.model.encoder;

        if self.architecture.is_predictor_based() {
            if enc.share_embeddings && !self.shared_vocabulary {
                return Err(QeError::config(
                    "system.model.encoder.share_embeddings",
                    "requires system.data_processing.share_input_vocabularies",
                ));
            }
            let source_dim = if enc.share_embeddings { enc.embeddings.target.dim } else { enc.embeddings.source.dim };
            let predictor = PredictorConfig::new(
                self.source_vocab_size,
                self.target_vocab_size,
                source_dim,
                enc.embeddings.target.dim,
                enc.hidden_size,
                enc.rnn_layers,
                enc.out_embeddings_dim,
                enc.dropout,
            )
            .with_encode_source(enc.encode_source)
            .with_use_mismatch_features(enc.use_mismatch_features)
            .with_share_embeddings(enc.share_embeddings);
            return Ok(Encoder::Predictor(predictor.init(device)));
        }

        let (d_model, layers, heads, d_ff, max_len, vocab, type_vocab) = match self.pretrained {
            Some(p) => (
                p.hidden_size,
                p.num_hidden_layers,
                p.num_attention_heads,
                p.intermediate_size,
                p.max_position_embeddings,
                p.vocab_size.max(self.target_vocab_size),
                p.type_vocab_size,
            ),
            None => (
                enc.hidden_size,
                enc.num_hidden_layers,
                enc.num_attention_heads,
                enc.intermediate_size,
                enc.max_position_embeddings,
                self.target_vocab_size,
                0,
            ),
        };
        if heads == 0 || d_model % heads != 0 {
            return Err(QeError::config(
                "system.model.encoder.num_attention_heads",
                format!("hidden size {d_model} is not divisible by {heads} heads"),
            ));
        }
        let segments = match self.architecture {
            ArchitectureKind::Bert => type_vocab.max(2),
            _ => 0,
        };
        let transformer = TransformerConfig::new(vocab, max_len.max(1), d_model, heads, layers, d_ff, enc.dropout, enc.pooling)
            .with_type_vocab_size(segments)
            .with_use_mlp(enc.use_mlp);
        Ok(Encoder::Transformer(transformer.init(device)))
    }
}

// ─── QeModel ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct QeModel<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    pub outputs: OutputHeads<B>,
    pub tlm:     bool,
    pub pad_id:  usize,
    pub bos_id:  usize,
    pub eos_id:  usize,
}

/// Predictions and losses of one batch.
pub struct QeForward<B: Backend> {
    pub heads: HeadOutputs<B>,
    pub terms: Vec<LossTerm<B>>,
    pub loss:  Tensor<B, 1>,
}

impl<B: Backend> QeModel<B> {
    pub fn forward_loss(&self, batch: &QeBatch<B>) -> Result<QeForward<B>, BatchDataError> {
        let mut encoded = self.encoder.encode(batch);
        let tlm_logits  = encoded.tlm_logits.take();
        let word_pad    = batch.target.word_pad.clone();

        let decoded   = self.decoder.forward(encoded, word_pad.clone());
        let heads     = self.outputs.forward(&decoded, word_pad);
        let mut terms = self.outputs.losses(&heads, batch)?;

        if let (true, Some(logits)) = (self.tlm, tlm_logits) {
            let objective = TlmObjective::new(self.pad_id, self.bos_id, self.eos_id);
            terms.push(LossTerm { name: "tlm", weight: 1.0, value: objective.loss(logits, batch.target.ids.clone()) });
        }

        let loss = weighted_total(&terms, &batch.target.ids.device());
        Ok(QeForward { heads, terms, loss })
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::domain::config::{EncoderConfig, OutputsConfig};
    use crate::ml::fixtures::tiny_batch;

    type TB = NdArray;

    fn small_model_config() -> ModelConfig {
        let mut cfg = ModelConfig {
            encoder: EncoderConfig { hidden_size: 8, rnn_layers: 1, out_embeddings_dim: 6, dropout: 0.0, ..EncoderConfig::default() },
            outputs: OutputsConfig::default(),
            ..ModelConfig::default()
        };
        cfg.encoder.embeddings.source.dim = 4;
        cfg.encoder.embeddings.target.dim = 4;
        cfg.encoder.num_attention_heads = 2;
        cfg.encoder.num_hidden_layers = 1;
        cfg.encoder.intermediate_size = 16;
        cfg.encoder.max_position_embeddings = 32;
        cfg.decoder.hidden_size = 5;
        cfg.decoder.bottleneck_size = 3;
        cfg.outputs.word_level.target = true;
        cfg.outputs.word_level.gaps = true;
        cfg.outputs.sentence_level.hter = true;
        cfg
    }

    fn builder<'a>(architecture: ArchitectureKind, model: &'a ModelConfig) -> QeModelBuilder<'a> {
        QeModelBuilder {
            architecture,
            model,
            source_vocab_size: 10,
            target_vocab_size: 10,
            shared_vocabulary: false,
            pretrained: None,
            special: SpecialIds { pad: 0, bos: 2, eos: 3 },
        }
    }

    #[test]
    fn test_predictor_with_tlm_adds_a_term() {
        let mut cfg = small_model_config();
        cfg.tlm.fine_tune = true;
        let model = builder(ArchitectureKind::Predictor, &cfg).build::<TB>(&Default::default()).unwrap();
        let out = model.forward_loss(&tiny_batch()).unwrap();
        let names: Vec<&str> = out.terms.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["target_tags", "gap_tags", "hter", "tlm"]);
        assert!(out.loss.into_scalar().is_finite());
    }

    #[test]
    fn test_transformer_ignores_tlm() {
        let mut cfg = small_model_config();
        cfg.tlm.fine_tune = true;
        let model = builder(ArchitectureKind::Bert, &cfg).build::<TB>(&Default::default()).unwrap();
        assert!(!model.tlm);
        let out = model.forward_loss(&tiny_batch()).unwrap();
        assert_eq!(out.terms.len(), 3);
    }

    #[test]
    fn test_shared_embeddings_need_shared_vocabulary() {
        let mut cfg = small_model_config();
        cfg.encoder.share_embeddings = true;
        let err = builder(ArchitectureKind::Predictor, &cfg).build::<TB>(&Default::default()).unwrap_err();
        assert!(matches!(err, QeError::Config { .. }));
    }

    #[test]
    fn test_heads_must_divide_hidden_size() {
        let mut cfg = small_model_config();
        cfg.encoder.num_attention_heads = 3;
        assert!(builder(ArchitectureKind::XLMRoberta, &cfg).build::<TB>(&Default::default()).is_err());
    }
}
