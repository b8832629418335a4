// ============================================================
// Layer 5 — Shared Tensor Operations
// ============================================================
// Small building blocks reused by the encoders, the decoder
// and the output heads. All shapes use
//   N = batch, L = pieces, W = words, D = features, C = classes
//
// Reference: Burn Book §3 (Tensor Operations)

use burn::{
    prelude::*,
    tensor::activation::log_softmax,
};

/// Features of the first piece of every word.
///
/// features [N, L, D], starts [N, W] → [N, W, D]
pub fn gather_words<B: Backend>(features: Tensor<B, 3>, starts: Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let d = features.dims()[2];
    let index = starts.unsqueeze_dim::<3>(2).repeat_dim(2, d);
    features.gather(1, index)
}

/// Zero the rows marked as padding.
///
/// x [N, W, D], pad [N, W] (true = padding) → [N, W, D]
pub fn zero_padding<B: Backend>(x: Tensor<B, 3>, pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
    let keep = pad.bool_not().float().unsqueeze_dim::<3>(2);
    x * keep
}

/// Mean over the non-padded rows.
///
/// x [N, W, D], pad [N, W] → [N, D]
pub fn masked_mean<B: Backend>(x: Tensor<B, 3>, pad: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
    let [n, _, d] = x.dims();
    let keep  = pad.bool_not().float().unsqueeze_dim::<3>(2); // [N, W, 1]
    let sum   = (x * keep.clone()).sum_dim(1);                // [N, 1, D]
    let count = keep.sum_dim(1).clamp_min(1.0);               // [N, 1, 1]
    (sum / count).reshape([n, d])
}

/// Features of the gaps around each word: the word on the left and
/// the word on the right, with zeros beyond either sentence end.
///
/// x [N, W, D], pad [N, W] → [N, W + 1, 2D]
pub fn gap_features<B: Backend>(x: Tensor<B, 3>, pad: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
    let [n, w, d] = x.dims();
    let x      = zero_padding(x, pad);
    let zeros  = Tensor::<B, 3>::zeros([n, 1, d], &x.device());
    let padded = Tensor::cat(vec![zeros.clone(), x, zeros], 1); // [N, W + 2, D]
    let left   = padded.clone().slice([0..n, 0..w + 1, 0..d]);
    let right  = padded.slice([0..n, 1..w + 2, 0..d]);
    Tensor::cat(vec![left, right], 2)
}

/// Weighted token-level cross-entropy: Σ w·nll / Σ w over the positions
/// whose target differs from `ignore_index`.
///
/// logits [N, L, C], targets [N, L], class_weights [C] → scalar [1]
pub fn masked_cross_entropy<B: Backend>(
    logits:        Tensor<B, 3>,
    targets:       Tensor<B, 2, Int>,
    class_weights: Option<Tensor<B, 1>>,
    ignore_index:  i64,
) -> Tensor<B, 1> {
    let [n, l, c] = logits.dims();
    let log_probs = log_softmax(logits, 2).reshape([n * l, c]);
    let targets   = targets.reshape([n * l]);

    let valid  = targets.clone().equal_elem(ignore_index).bool_not();
    let safe   = targets.mask_fill(valid.clone().bool_not(), 0);
    let nll    = log_probs.gather(1, safe.clone().unsqueeze_dim::<2>(1)).reshape([n * l]).neg();
    let weight = match class_weights {
        Some(w) => w.select(0, safe),
        None => Tensor::ones_like(&nll),
    } * valid.float();

    (nll * weight.clone()).sum() / weight.sum().clamp_min(1e-12)
}

/// Class index with the highest score along the last dimension.
///
/// logits [N, L, C] → [N, L]
pub fn argmax_last<B: Backend>(logits: Tensor<B, 3>) -> Tensor<B, 2, Int> {
    let [n, l, _] = logits.dims();
    logits.argmax(2).reshape([n, l])
}

pub fn to_i32_vec<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i32> {
    tensor.into_data().convert::<i32>().to_vec::<i32>().unwrap_or_default()
}

pub fn to_f32_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap_or_default()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    fn device() -> <TB as Backend>::Device {
        Default::default()
    }

    #[test]
    fn test_gather_words_picks_first_pieces() {
        let x = Tensor::<TB, 1>::from_floats([0.0, 1.0, 2.0, 3.0], &device()).reshape([1, 4, 1]);
        let starts = Tensor::<TB, 1, Int>::from_ints([1, 3], &device()).reshape([1, 2]);
        assert_eq!(to_f32_vec(gather_words(x, starts)), vec![1.0, 3.0]);
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let x = Tensor::<TB, 1>::from_floats([2.0, 4.0, 100.0], &device()).reshape([1, 3, 1]);
        let pad = Tensor::<TB, 1, Int>::from_ints([0, 0, 1], &device()).reshape([1, 3]).equal_elem(1);
        assert_eq!(to_f32_vec(masked_mean(x, pad)), vec![3.0]);
    }

    #[test]
    fn test_gap_features_have_one_more_position() {
        let x = Tensor::<TB, 1>::from_floats([1.0, 2.0], &device()).reshape([1, 2, 1]);
        let pad = Tensor::<TB, 1, Int>::from_ints([0, 0], &device()).reshape([1, 2]).equal_elem(1);
        let gaps = gap_features(x, pad);
        assert_eq!(gaps.dims(), [1, 3, 2]);
        assert_eq!(to_f32_vec(gaps), vec![0.0, 1.0, 1.0, 2.0, 2.0, 0.0]);
    }

    #[test]
    fn test_cross_entropy_ignores_pad_and_weights_classes() {
        // uniform logits → nll = ln 2 everywhere
        let logits = Tensor::<TB, 3>::zeros([1, 3, 2], &device());
        let targets = Tensor::<TB, 1, Int>::from_ints([0, 1, 2], &device()).reshape([1, 3]);
        let loss = masked_cross_entropy(logits.clone(), targets.clone(), None, 2);
        assert!((loss.into_scalar() - std::f32::consts::LN_2).abs() < 1e-5);

        let weights = Tensor::<TB, 1>::from_floats([1.0, 3.0], &device());
        let loss = masked_cross_entropy(logits, targets, Some(weights), 2);
        assert!((loss.into_scalar() - std::f32::consts::LN_2).abs() < 1e-5);
    }
}
