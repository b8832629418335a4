// ============================================================
// Layer 5 — Translation Language Model Objective
// ============================================================
// Auxiliary loss used while fine-tuning a predictor: every
// target word is predicted from its left/right context and
// the source sentence, and scored with cross-entropy against
// the word actually there. Sentence boundary and padding
// positions carry no target.
//
// Reference: Kim et al. (2017) Predictor-Estimator

use burn::prelude::*;

use crate::ml::tensor_ops::masked_cross_entropy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlmObjective {
    pub pad_id: usize,
    pub bos_id: usize,
    pub eos_id: usize,
}

impl TlmObjective {
    pub fn new(pad_id: usize, bos_id: usize, eos_id: usize) -> Self {
        Self { pad_id, bos_id, eos_id }
    }

    /// logits [N, L, V], target piece ids [N, L] → scalar
    pub fn loss<B: Backend>(&self, logits: Tensor<B, 3>, ids: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let pad = self.pad_id as i64;
        let targets = ids
            .clone()
            .mask_fill(ids.clone().equal_elem(self.bos_id as i64), pad)
            .mask_fill(ids.equal_elem(self.eos_id as i64), pad);
        masked_cross_entropy(logits, targets, None, pad)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    #[test]
    fn test_boundaries_and_padding_are_ignored() {
        let device = Default::default();
        let tlm = TlmObjective::new(0, 2, 3);
        // vocabulary of 5; only position 1 (id 4) is scored
        let mut logits = vec![0.0f32; 4 * 5];
        logits[5 + 4] = 10.0;
        let logits = Tensor::<TB, 1>::from_floats(logits.as_slice(), &device).reshape([1, 4, 5]);
        let ids = Tensor::<TB, 1, Int>::from_ints([2, 4, 3, 0], &device).reshape([1, 4]);
        let loss: f32 = tlm.loss(logits, ids).into_scalar();
        assert!(loss < 1e-3);
    }
}
