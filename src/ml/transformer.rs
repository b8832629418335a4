// ============================================================
// Layer 5 — Transformer Encoder (BERT / XLM-RoBERTa)
// ============================================================
// A pretrained-style transformer backbone:
//
//   • Token embeddings
//   • Positional embeddings
//   • Segment embeddings (BERT flavour only)
//   • N encoder blocks: multi-head self-attention + GELU
//     feed-forward, residual connections, layer norm
//
// Word features are the states at each word's first subword
// piece. With `pooling: mixed` the states are a learned
// softmax-weighted sum over the embedding output and every
// block's output (scalar mix), scaled by a learned gamma.
//
// Sentence features come from the first token (<cls>) or the
// mean over the non-padded pieces.
//
// With `interleave_input` the batch's joint sequence
//   <cls> target <sep> source <sep>
// is encoded once; otherwise target and source are encoded
// separately with the same weights.
//
// Reference: Vaswani et al. (2017) Attention Is All You Need
//            Devlin et al. (2019) BERT
//            Conneau et al. (2020) XLM-R
//            Peters et al. (2018) ELMo (scalar mix)

use burn::{
    module::Param,
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{gelu, softmax, tanh},
};

use crate::data::batcher::QeBatch;
use crate::domain::config::Pooling;
use crate::ml::encoder::{EncoderOutput, QeEncoder};
use crate::ml::tensor_ops::{gather_words, masked_mean};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally — do NOT add them again or you get conflicting impls.
#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub vocab_size:  usize,
    pub max_seq_len: usize,
    pub d_model:     usize,
    pub num_heads:   usize,
    pub num_layers:  usize,
    pub d_ff:        usize,
    pub dropout:     f64,
    /// Number of segment types; 0 disables segment embeddings.
    #[config(default = 0)]
    pub type_vocab_size: usize,
    pub pooling:     Pooling,
    #[config(default = true)]
    pub use_mlp:     bool,
}

impl TransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransformerEncoder<B> {
        let token_embedding    = EmbeddingConfig::new(self.vocab_size, self.d_model).init(device);
        let position_embedding = EmbeddingConfig::new(self.max_seq_len, self.d_model).init(device);
        let segment_embedding  = (self.type_vocab_size > 0)
            .then(|| EmbeddingConfig::new(self.type_vocab_size, self.d_model).init(device));
        let layers: Vec<EncoderBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_encoder_block(device))
            .collect();
        let embedding_norm = LayerNormConfig::new(self.d_model).init(device);
        let mlp            = self.use_mlp.then(|| LinearConfig::new(self.d_model, self.d_model).init(device));
        let dropout        = DropoutConfig::new(self.dropout).init();
        let mix_weights    = Param::from_tensor(Tensor::zeros([self.num_layers + 1], device));
        let mix_gamma      = Param::from_tensor(Tensor::ones([1], device));
        TransformerEncoder {
            token_embedding, position_embedding, segment_embedding, embedding_norm, layers,
            mlp, dropout, mix_weights, mix_gamma,
            max_seq_len:  self.max_seq_len,
            d_model:      self.d_model,
            mix_layers:   self.pooling == Pooling::Mixed,
            mean_pooling: self.pooling == Pooling::Mean,
        }
    }

    fn build_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        let self_attn   = MultiHeadAttentionConfig::new(self.d_model, self.num_heads)
            .with_dropout(self.dropout)
            .init(device);
        let ffn_linear1 = LinearConfig::new(self.d_model, self.d_ff).init(device);
        let ffn_linear2 = LinearConfig::new(self.d_ff, self.d_model).init(device);
        let norm1   = LayerNormConfig::new(self.d_model).init(device);
        let norm2   = LayerNormConfig::new(self.d_model).init(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        EncoderBlock { self_attn, ffn_linear1, ffn_linear2, norm1, norm2, dropout }
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn:   MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1:       LayerNorm<B>,
    pub norm2:       LayerNorm<B>,
    pub dropout:     Dropout,
}

impl<B: Backend> EncoderBlock<B> {
    /// x [N, L, D], pad [N, L] (true = padding) → [N, L, D]
    pub fn forward(&self, x: Tensor<B, 3>, pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let attn_output = self.self_attn.forward(MhaInput::self_attn(x.clone()).mask_pad(pad)).context;
        let x = self.norm1.forward(x + self.dropout.forward(attn_output));
        let ffn_out = self.ffn_linear2.forward(gelu(self.ffn_linear1.forward(x.clone())));
        self.norm2.forward(x + self.dropout.forward(ffn_out))
    }
}

#[derive(Module, Debug)]
pub struct TransformerEncoder<B: Backend> {
    pub token_embedding:    Embedding<B>,
    pub position_embedding: Embedding<B>,
    pub segment_embedding:  Option<Embedding<B>>,
    pub embedding_norm:     LayerNorm<B>,
    pub layers:             Vec<EncoderBlock<B>>,
    pub mlp:                Option<Linear<B>>,
    pub dropout:            Dropout,
    /// Scalar-mix logits, one per layer output (embeddings included).
    pub mix_weights:        Param<Tensor<B, 1>>,
    pub mix_gamma:          Param<Tensor<B, 1>>,
    pub max_seq_len:        usize,
    pub d_model:            usize,
    pub mix_layers:         bool,
    pub mean_pooling:       bool,
}

impl<B: Backend> TransformerEncoder<B> {
    /// ids [N, L] → piece states [N, L, D]
    pub fn forward(
        &self,
        ids:      Tensor<B, 2, Int>,
        segments: Option<Tensor<B, 2, Int>>,
        pad:      Tensor<B, 2, Bool>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_len] = ids.dims();
        let device = ids.device();

        let tok_emb = self.token_embedding.forward(ids);

        // Inputs longer than the position table reuse its last row.
        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device)
            .clamp_max(self.max_seq_len as i64 - 1)
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let mut x = tok_emb + self.position_embedding.forward(positions);

        if let Some(segment_embedding) = &self.segment_embedding {
            let segments = segments.unwrap_or_else(|| Tensor::zeros([batch_size, seq_len], &device));
            x = x + segment_embedding.forward(segments);
        }

        let mut x = self.dropout.forward(self.embedding_norm.forward(x));
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        outputs.push(x.clone());
        for layer in &self.layers {
            x = layer.forward(x, pad.clone());
            outputs.push(x.clone());
        }

        if !self.mix_layers {
            return x;
        }
        let k       = outputs.len();
        let weights = softmax(self.mix_weights.val(), 0).reshape([k, 1, 1, 1]);
        let mixed   = (Tensor::stack::<4>(outputs, 0) * weights)
            .sum_dim(0)
            .reshape([batch_size, seq_len, self.d_model]);
        mixed * self.mix_gamma.val().reshape([1, 1, 1])
    }

    fn sentence(&self, states: Tensor<B, 3>, pad: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
        let [n, _, d] = states.dims();
        if self.mean_pooling {
            masked_mean(states, pad)
        } else {
            states.slice([0..n, 0..1, 0..d]).reshape([n, d])
        }
    }

    fn project(&self, words: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.mlp {
            Some(mlp) => tanh(mlp.forward(words)),
            None => words,
        }
    }
}

impl<B: Backend> QeEncoder<B> for TransformerEncoder<B> {
    fn encode(&self, batch: &QeBatch<B>) -> EncoderOutput<B> {
        let (target_words, source_words, sentence) = match &batch.joint {
            Some(joint) => {
                let states = self.forward(
                    joint.ids.clone(),
                    Some(joint.segments.clone()),
                    joint.pad_mask.clone(),
                );
                let target   = gather_words(states.clone(), batch.target.starts.clone());
                let source   = gather_words(states.clone(), joint.source_starts.clone());
                let sentence = self.sentence(states, joint.pad_mask.clone());
                (target, source, sentence)
            }
            None => {
                let target_states = self.forward(batch.target.ids.clone(), None, batch.target.pad_mask.clone());
                let source_states = self.forward(batch.source.ids.clone(), None, batch.source.pad_mask.clone());
                let target   = gather_words(target_states.clone(), batch.target.starts.clone());
                let source   = gather_words(source_states, batch.source.starts.clone());
                let sentence = self.sentence(target_states, batch.target.pad_mask.clone());
                (target, source, sentence)
            }
        };

        EncoderOutput {
            target: self.project(target_words),
            source: self.project(source_words),
            sentence,
            tlm_logits: None,
        }
    }

    fn target_dim(&self) -> usize {
        self.d_model
    }

    fn source_dim(&self) -> usize {
        self.d_model
    }

    fn sentence_dim(&self) -> usize {
        self.d_model
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::ml::fixtures::tiny_batch_with;

    type TB = NdArray;

    fn config(pooling: Pooling) -> TransformerConfig {
        TransformerConfig::new(10, 16, 8, 2, 2, 16, 0.0, pooling).with_type_vocab_size(2)
    }

    #[test]
    fn test_separate_encoding_shapes() {
        let encoder = config(Pooling::Mixed).init::<TB>(&Default::default());
        let out = encoder.encode(&tiny_batch_with::<TB>(false));
        assert_eq!(out.target.dims(), [2, 3, 8]);
        assert_eq!(out.source.dims(), [2, 2, 8]);
        assert_eq!(out.sentence.dims(), [2, 8]);
        assert!(out.tlm_logits.is_none());
    }

    #[test]
    fn test_interleaved_encoding_shapes() {
        let encoder = config(Pooling::Mean).init::<TB>(&Default::default());
        let out = encoder.encode(&tiny_batch_with::<TB>(true));
        assert_eq!(out.target.dims(), [2, 3, 8]);
        assert_eq!(out.source.dims(), [2, 2, 8]);
        assert_eq!(out.sentence.dims(), [2, 8]);
    }

    #[test]
    fn test_mix_weights_cover_every_layer_output() {
        let encoder = config(Pooling::FirstToken).init::<TB>(&Default::default());
        assert_eq!(encoder.mix_weights.val().dims(), [3]);
        assert!(!encoder.mix_layers);
    }
}
