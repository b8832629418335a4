// ============================================================
// Layer 5 — Decoder
// ============================================================
// Turns encoder features into task-ready features. It never
// looks inside the encoder, only at the feature widths:
//
//   word features ─► [Linear + tanh] ─► BiLSTM × rnn_layers ─► dropout
//
//   sentence = encoder sentence ⊕ mean(decoded target words)
//              ─► [bottleneck Linear + tanh]
//
// Target and source sides have separate weights.
//
// Reference: Burn Book §3 (Building Blocks)

use burn::{
    nn::{BiLstm, BiLstmConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation::tanh,
};

use crate::ml::encoder::EncoderOutput;
use crate::ml::tensor_ops::masked_mean;

pub struct DecoderOutput<B: Backend> {
    pub target:   Tensor<B, 3>,
    pub source:   Tensor<B, 3>,
    pub sentence: Tensor<B, 2>,
}

#[derive(Config, Debug)]
pub struct DecoderSettings {
    pub target_dim:      usize,
    pub source_dim:      usize,
    pub sentence_dim:    usize,
    pub hidden_size:     usize,
    pub rnn_layers:      usize,
    pub use_mlp:         bool,
    pub dropout:         f64,
    pub bottleneck_size: usize,
}

impl DecoderSettings {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let target = self.side(self.target_dim, device);
        let source = self.side(self.source_dim, device);
        let pooled = self.sentence_dim + target.output_dim;
        let bottleneck = self
            .use_mlp
            .then(|| LinearConfig::new(pooled, self.bottleneck_size).init(device));
        Decoder {
            sentence_dim: if self.use_mlp { self.bottleneck_size } else { pooled },
            target,
            source,
            bottleneck,
        }
    }

    fn side<B: Backend>(&self, input_dim: usize, device: &B::Device) -> DecoderSide<B> {
        let mlp = self.use_mlp.then(|| LinearConfig::new(input_dim, self.hidden_size).init(device));
        let mut width = if self.use_mlp { self.hidden_size } else { input_dim };
        let mut rnn = Vec::with_capacity(self.rnn_layers);
        for _ in 0..self.rnn_layers {
            rnn.push(BiLstmConfig::new(width, self.hidden_size, true).init(device));
            width = 2 * self.hidden_size;
        }
        DecoderSide {
            mlp,
            rnn,
            dropout:    DropoutConfig::new(self.dropout).init(),
            output_dim: width,
        }
    }
}

#[derive(Module, Debug)]
pub struct DecoderSide<B: Backend> {
    pub mlp:        Option<Linear<B>>,
    pub rnn:        Vec<BiLstm<B>>,
    pub dropout:    Dropout,
    pub output_dim: usize,
}

impl<B: Backend> DecoderSide<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mut x = match &self.mlp {
            Some(mlp) => tanh(mlp.forward(x)),
            None => x,
        };
        for rnn in &self.rnn {
            x = rnn.forward(x, None).0;
        }
        self.dropout.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub target:       DecoderSide<B>,
    pub source:       DecoderSide<B>,
    pub bottleneck:   Option<Linear<B>>,
    pub sentence_dim: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn forward(&self, features: EncoderOutput<B>, target_pad: Tensor<B, 2, Bool>) -> DecoderOutput<B> {
        let target = self.target.forward(features.target);
        let source = self.source.forward(features.source);

        let pooled   = masked_mean(target.clone(), target_pad);
        let sentence = Tensor::cat(vec![features.sentence, pooled], 1);
        let sentence = match &self.bottleneck {
            Some(bottleneck) => tanh(bottleneck.forward(sentence)),
            None => sentence,
        };

        DecoderOutput { target, source, sentence }
    }

    pub fn target_dim(&self) -> usize {
        self.target.output_dim
    }

    pub fn source_dim(&self) -> usize {
        self.source.output_dim
    }
}
