// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// This layer contains the Burn model graph and everything that
// turns gradients into a trained QE system.
//
// What's in this layer:
//
//   predictor.rs    — RNN predictor encoder (embeddings, BiLSTM
//                     over the source, forward/backward LSTMs
//                     over the target, TLM word logits)
//   transformer.rs  — BERT / XLM-R style encoder blocks
//   encoder.rs      — QeEncoder contract + tagged Encoder enum
//   decoder.rs      — MLP / BiLSTM feature decoder
//   outputs.rs      — tag, HTER and binary heads with losses
//   tlm.rs          — translation language model objective
//   model.rs        — QeModel and its builder
//   optim.rs        — LR schedules, freezing, gradient clipping
//   system.rs       — TrainableSystem / BatchSource on Burn
//   trainer.rs      — the training loop state machine
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

/// Masking, gathering and loss helpers shared by the modules
pub mod tensor_ops;

/// Predictor (RNN) encoder
pub mod predictor;

/// Transformer encoder backbone
pub mod transformer;

/// Encoder contract and variants
pub mod encoder;

/// Encoder-agnostic feature decoder
pub mod decoder;

/// Output heads and loss terms
pub mod outputs;

/// TLM auxiliary objective
pub mod tlm;

/// The full QE model graph
pub mod model;

/// Optimizer schedules and gradient policies
pub mod optim;

/// Burn-backed training system and data loaders
pub mod system;

/// Training loop with validation, checkpointing and early stopping
pub mod trainer;

#[cfg(test)]
pub(crate) mod fixtures;
