// ============================================================
// Layer 5 — Predictor Encoder (RNN)
// ============================================================
// The predictor half of a Predictor-Estimator model.
//
// For every target word it tries to predict that word from
// its context only, and uses how well it did as features:
//
//   source words ─► embedding ─► BiLSTM (or linear) ─► source states
//                                                        │
//   target words ─► embedding ─┬─► forward LSTM  ─┐      │ attention
//                              └─► backward LSTM ─┤      ▼
//                                                 ├─► context(p) = fwd[p-1] ⊕ bwd[p+1] ⊕ attended source
//                                                 ▼
//                                   pre-output ─► word logits (TLM)
//
// Target features per word:
//   pre-output ⊙ output-embedding(gold word)      (PreQEFV)
//   fwd[p-1] ⊕ bwd[p+1]                           (PostQEFV)
//   [p(gold), max p, 1[argmax≠gold], max p − p(gold)]  (optional)
//   alignment-averaged source states
//
// Reference: Kim et al. (2017) Predictor-Estimator using
//            Multilevel Task Learning with Stack Propagation
//            Burn Book §3 (Building Blocks)

use burn::{
    nn::{
        BiLstm, BiLstmConfig,
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Linear, LinearConfig,
        Lstm, LstmConfig,
    },
    prelude::*,
    tensor::activation::{softmax, tanh},
};

use crate::data::batcher::QeBatch;
use crate::ml::encoder::{EncoderOutput, QeEncoder};
use crate::ml::tensor_ops::{gather_words, masked_mean};

#[derive(Config, Debug)]
pub struct PredictorConfig {
    pub source_vocab_size:    usize,
    pub target_vocab_size:    usize,
    pub source_embedding_dim: usize,
    pub target_embedding_dim: usize,
    pub hidden_size:          usize,
    pub rnn_layers:           usize,
    pub out_embeddings_dim:   usize,
    pub dropout:              f64,
    #[config(default = false)]
    pub encode_source:         bool,
    #[config(default = false)]
    pub use_mismatch_features: bool,
    /// Source words are embedded with the target table (shared vocabulary).
    #[config(default = false)]
    pub share_embeddings:      bool,
}

impl PredictorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PredictorEncoder<B> {
        let h      = self.hidden_size;
        let layers = self.rnn_layers.max(1);

        let source_embedding = (!self.share_embeddings)
            .then(|| EmbeddingConfig::new(self.source_vocab_size, self.source_embedding_dim).init(device));
        let target_embedding = EmbeddingConfig::new(self.target_vocab_size, self.target_embedding_dim).init(device);

        let (source_rnn, source_projection) = if self.encode_source {
            let rnn = (0..layers)
                .map(|i| {
                    let d_in = if i == 0 { self.source_embedding_dim } else { 2 * h };
                    BiLstmConfig::new(d_in, h, true).init(device)
                })
                .collect();
            (rnn, None)
        } else {
            (Vec::new(), Some(LinearConfig::new(self.source_embedding_dim, 2 * h).init(device)))
        };

        let directional = || -> Vec<Lstm<B>> {
            (0..layers)
                .map(|i| {
                    let d_in = if i == 0 { self.target_embedding_dim } else { h };
                    LstmConfig::new(d_in, h, true).init(device)
                })
                .collect()
        };

        PredictorEncoder {
            source_embedding,
            target_embedding,
            source_rnn,
            source_projection,
            forward_rnn:     directional(),
            backward_rnn:    directional(),
            attention_query: LinearConfig::new(2 * h, 2 * h).init(device),
            pre_output:      LinearConfig::new(4 * h, self.out_embeddings_dim).init(device),
            word_logits:     LinearConfig::new(self.out_embeddings_dim, self.target_vocab_size).init(device),
            dropout:         DropoutConfig::new(self.dropout).init(),
            hidden_size:     h,
            out_embeddings_dim:    self.out_embeddings_dim,
            use_mismatch_features: self.use_mismatch_features,
        }
    }
}

#[derive(Module, Debug)]
pub struct PredictorEncoder<B: Backend> {
    /// None when source words share the target embedding table.
    pub source_embedding:  Option<Embedding<B>>,
    pub target_embedding:  Embedding<B>,
    pub source_rnn:        Vec<BiLstm<B>>,
    pub source_projection: Option<Linear<B>>,
    pub forward_rnn:       Vec<Lstm<B>>,
    pub backward_rnn:      Vec<Lstm<B>>,
    pub attention_query:   Linear<B>,
    pub pre_output:        Linear<B>,
    /// Weight rows double as the output embeddings of the target words.
    pub word_logits:       Linear<B>,
    pub dropout:           Dropout,
    pub hidden_size:           usize,
    pub out_embeddings_dim:    usize,
    pub use_mismatch_features: bool,
}

impl<B: Backend> PredictorEncoder<B> {
    fn source_states(&self, embedded: Tensor<B, 3>) -> Tensor<B, 3> {
        if let Some(projection) = &self.source_projection {
            return projection.forward(embedded);
        }
        let mut x = embedded;
        for rnn in &self.source_rnn {
            x = rnn.forward(x, None).0;
        }
        x
    }

    /// fwd[p-1] ⊕ bwd[p+1], zeros beyond either end. → [N, L, 2H]
    fn target_context(&self, embedded: Tensor<B, 3>) -> Tensor<B, 3> {
        let [n, l, _] = embedded.dims();
        let h = self.hidden_size;

        let mut fwd = embedded.clone();
        for rnn in &self.forward_rnn {
            fwd = rnn.forward(fwd, None).0;
        }
        let mut bwd = embedded.flip([1]);
        for rnn in &self.backward_rnn {
            bwd = rnn.forward(bwd, None).0;
        }
        let bwd = bwd.flip([1]);

        let zeros   = Tensor::<B, 3>::zeros([n, 1, h], &fwd.device());
        let fwd_ctx = Tensor::cat(vec![zeros.clone(), fwd.slice([0..n, 0..l - 1, 0..h])], 1);
        let bwd_ctx = Tensor::cat(vec![bwd.slice([0..n, 1..l, 0..h]), zeros], 1);
        Tensor::cat(vec![fwd_ctx, bwd_ctx], 2)
    }

    /// Output-embedding row of each gold piece. → [N, L, E_out]
    fn output_embeddings(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [n, l] = ids.dims();
        self.word_logits
            .weight
            .val()
            .transpose()
            .select(0, ids.reshape([n * l]))
            .reshape([n, l, self.out_embeddings_dim])
    }
}

/// [p(gold), max p, 1[argmax≠gold], max p − p(gold)] → [N, L, 4]
fn mismatch_features<B: Backend>(logits: Tensor<B, 3>, gold: Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let probs  = softmax(logits, 2);
    let gold   = gold.unsqueeze_dim::<3>(2);
    let p_gold = probs.clone().gather(2, gold.clone());
    let (max_p, argmax) = probs.max_dim_with_indices(2);
    let miss   = argmax.equal(gold).bool_not().float();
    Tensor::cat(vec![p_gold.clone(), max_p.clone(), miss, max_p - p_gold], 2)
}

impl<B: Backend> QeEncoder<B> for PredictorEncoder<B> {
    fn encode(&self, batch: &QeBatch<B>) -> EncoderOutput<B> {
        let target_ids = batch.target.ids.clone();
        let lt = target_ids.dims()[1];

        let target_emb = self.dropout.forward(self.target_embedding.forward(target_ids.clone()));
        let source_table = self.source_embedding.as_ref().unwrap_or(&self.target_embedding);
        let source_emb = self.dropout.forward(source_table.forward(batch.source.ids.clone()));

        let source_states = self.source_states(source_emb);          // [N, Ls, 2H]
        let context       = self.target_context(target_emb);         // [N, Lt, 2H]

        // ── Attention of every target position over the source ───────────────
        let scores = self
            .attention_query
            .forward(context.clone())
            .matmul(source_states.clone().swap_dims(1, 2));          // [N, Lt, Ls]
        let source_pad = batch.source.pad_mask.clone().unsqueeze_dim::<3>(1).repeat_dim(1, lt);
        let attention  = softmax(scores.mask_fill(source_pad, -1.0e9), 2);
        let attended   = attention.matmul(source_states.clone());     // [N, Lt, 2H]

        let pre_output = tanh(self.pre_output.forward(Tensor::cat(vec![context.clone(), attended], 2)));
        let logits     = self.word_logits.forward(pre_output.clone()); // [N, Lt, V]

        let mut features = vec![pre_output * self.output_embeddings(target_ids.clone()), context];
        if self.use_mismatch_features {
            features.push(mismatch_features(logits.clone(), target_ids));
        }
        let piece_features = Tensor::cat(features, 2);

        let source_words = gather_words(source_states, batch.source.starts.clone());
        let target_words = gather_words(piece_features, batch.target.starts.clone());
        let aligned      = batch.alignment.clone().matmul(source_words.clone()); // [N, T, 2H]
        let target       = Tensor::cat(vec![target_words, aligned], 2);
        let sentence     = masked_mean(target.clone(), batch.target.word_pad.clone());

        EncoderOutput { target, source: source_words, sentence, tlm_logits: Some(logits) }
    }

    fn target_dim(&self) -> usize {
        let mismatch = if self.use_mismatch_features { 4 } else { 0 };
        self.out_embeddings_dim + 4 * self.hidden_size + mismatch
    }

    fn source_dim(&self) -> usize {
        2 * self.hidden_size
    }

    fn sentence_dim(&self) -> usize {
        self.target_dim()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::ml::fixtures::tiny_batch;

    type TB = NdArray;

    #[test]
    fn test_output_shapes() {
        let cfg = PredictorConfig::new(12, 12, 8, 6, 5, 2, 7, 0.0)
            .with_encode_source(true)
            .with_use_mismatch_features(true);
        let encoder = cfg.init::<TB>(&Default::default());
        let out = encoder.encode(&tiny_batch());

        assert_eq!(out.target.dims(), [2, 3, encoder.target_dim()]);
        assert_eq!(encoder.target_dim(), 7 + 20 + 4);
        assert_eq!(out.source.dims(), [2, 2, 10]);
        assert_eq!(out.sentence.dims(), [2, encoder.sentence_dim()]);
        assert_eq!(out.tlm_logits.unwrap().dims(), [2, 5, 12]);
    }

    #[test]
    fn test_linear_source_projection() {
        let encoder = PredictorConfig::new(12, 12, 8, 6, 5, 1, 7, 0.0).init::<TB>(&Default::default());
        assert!(encoder.source_rnn.is_empty());
        let out = encoder.encode(&tiny_batch());
        assert_eq!(out.source.dims(), [2, 2, 10]);
    }
}
