/// Momentum-updating similarity operator — the hybrid memory's write path.
///
/// Forward (pure):
///   scores = inputs @ bankᵀ                            — B×N
/// Backward (one-shot, consumes the handle):
///   d_inputs = d_scores @ bank                         — pre-update bank
///   for (x, y) in batch order:
///     bank[y] = m * bank[y] + (1 - m) * x
///     bank[y] /= ||bank[y]||
///
/// The bank is mutated here and nowhere else. Duplicate indices within one
/// batch apply sequentially — the later update sees the earlier result.

use crate::tensor::{matmul_f32, matmul_nt_f32, vec_normalize_f32};

// ── Errors ──────────────────────────────────────────────────────────

/// Failures surfaced before any computation touches the bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// A buffer length disagrees with the declared dimensions.
    ShapeMismatch { what: &'static str, expected: usize, got: usize },
    /// A batch index addresses a slot outside the bank.
    IndexOutOfRange { index: usize, len: usize },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::ShapeMismatch { what, expected, got } =>
                write!(f, "shape mismatch for {what}: expected {expected} elements, got {got}"),
            MemoryError::IndexOutOfRange { index, len } =>
                write!(f, "sample index {index} outside bank of {len} slots"),
        }
    }
}

// ── Operator ────────────────────────────────────────────────────────

/// Pending bank update captured by the forward pass.
///
/// Holds copies of the batch features, their sample indices and the
/// momentum so the backward step can fold them into the bank. Consumed by
/// value in `similarity_backward` — the update applies at most once per
/// forward.
#[derive(Debug)]
pub struct SimilarityUpdate {
    inputs: Vec<f32>,
    indexes: Vec<usize>,
    momentum: f32,
    dim: usize,
}

impl SimilarityUpdate {
    pub fn batch(&self) -> usize {
        self.indexes.len()
    }
}

/// Similarity of each batch feature against every bank slot.
///
/// `inputs`: [B, dim], `bank`: [N, dim]. Returns ([B, N] scores, pending
/// update handle). Validates shapes and index range before any compute —
/// a failed forward never touches the bank.
pub fn similarity_forward(
    inputs: &[f32],
    indexes: &[usize],
    bank: &[f32],
    dim: usize,
    momentum: f32,
) -> Result<(Vec<f32>, SimilarityUpdate), MemoryError> {
    let batch = indexes.len();
    if inputs.len() != batch * dim {
        return Err(MemoryError::ShapeMismatch {
            what: "batch features",
            expected: batch * dim,
            got: inputs.len(),
        });
    }
    if dim == 0 || bank.len() % dim != 0 {
        return Err(MemoryError::ShapeMismatch {
            what: "feature bank",
            expected: dim.max(1),
            got: bank.len(),
        });
    }
    let num_samples = bank.len() / dim;
    for &y in indexes {
        if y >= num_samples {
            return Err(MemoryError::IndexOutOfRange { index: y, len: num_samples });
        }
    }

    let mut scores = vec![0.0f32; batch * num_samples];
    matmul_nt_f32(inputs, bank, &mut scores, batch, dim, num_samples);

    let update = SimilarityUpdate {
        inputs: inputs.to_vec(),
        indexes: indexes.to_vec(),
        momentum,
        dim,
    };
    Ok((scores, update))
}

/// Backward pass: input gradients against the pre-update bank, then the
/// one-shot momentum update.
///
/// `d_scores`: [B, N] upstream gradient on the forward scores. Returns
/// d_inputs [B, dim]. No gradient flows to the bank or the indices — they
/// are memory state, not learnable parameters. The gradient is computed
/// BEFORE the bank mutates; swapping that order would silently change
/// training dynamics.
pub fn similarity_backward(update: SimilarityUpdate, d_scores: &[f32], bank: &mut [f32]) -> Vec<f32> {
    let d = update.dim;
    let b = update.indexes.len();
    let n = bank.len() / d;
    debug_assert_eq!(d_scores.len(), b * n);
    debug_assert_eq!(bank.len(), n * d);

    let mut d_inputs = vec![0.0f32; b * d];
    matmul_f32(d_scores, bank, &mut d_inputs, b, n, d);

    // EMA fold-in, sequential over the batch; duplicate indices see the
    // already-updated slot.
    let m = update.momentum;
    for (row, &y) in update.indexes.iter().enumerate() {
        let x = &update.inputs[row * d..(row + 1) * d];
        let slot = &mut bank[y * d..(y + 1) * d];
        for j in 0..d {
            slot[j] = m * slot[j] + (1.0 - m) * x[j];
        }
        vec_normalize_f32(slot);
    }

    d_inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{dot_f32, vec_norm_f32, SimpleRng};

    fn make_unit_bank(n: usize, d: usize, seed: u64) -> Vec<f32> {
        let mut rng = SimpleRng::new(seed);
        let mut bank = vec![0.0f32; n * d];
        rng.fill_uniform(&mut bank, 1.0);
        for row in bank.chunks_mut(d) {
            vec_normalize_f32(row);
        }
        bank
    }

    #[test]
    fn test_forward_scores_match_manual_dot() {
        let d = 4;
        let bank = make_unit_bank(3, d, 42);
        let mut rng = SimpleRng::new(9);
        let mut inputs = vec![0.0f32; 2 * d];
        rng.fill_uniform(&mut inputs, 1.0);

        let (scores, _upd) = similarity_forward(&inputs, &[0, 2], &bank, d, 0.2).unwrap();
        for bi in 0..2 {
            for s in 0..3 {
                let expected = dot_f32(&inputs[bi * d..(bi + 1) * d], &bank[s * d..(s + 1) * d]);
                assert!((scores[bi * 3 + s] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_forward_does_not_touch_bank() {
        let d = 4;
        let bank = make_unit_bank(5, d, 42);
        let before = bank.clone();
        let inputs = vec![0.5f32; 2 * d];
        let _ = similarity_forward(&inputs, &[1, 3], &bank, d, 0.2).unwrap();
        assert_eq!(bank, before);
    }

    #[test]
    fn test_forward_rejects_bad_shapes() {
        let d = 4;
        let bank = make_unit_bank(5, d, 42);
        let inputs = vec![0.5f32; 2 * d - 1];
        let err = similarity_forward(&inputs, &[1, 3], &bank, d, 0.2).unwrap_err();
        assert!(matches!(err, MemoryError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_forward_rejects_out_of_range_index() {
        let d = 4;
        let bank = make_unit_bank(5, d, 42);
        let inputs = vec![0.5f32; 2 * d];
        let err = similarity_forward(&inputs, &[1, 5], &bank, d, 0.2).unwrap_err();
        assert_eq!(err, MemoryError::IndexOutOfRange { index: 5, len: 5 });
    }

    #[test]
    fn test_backward_gradient_uses_pre_update_bank() {
        let d = 3;
        let n = 4;
        let bank_before = make_unit_bank(n, d, 42);
        let mut bank = bank_before.clone();

        // Inputs far from the current slots so the update moves them.
        let mut rng = SimpleRng::new(11);
        let mut inputs = vec![0.0f32; 2 * d];
        rng.fill_uniform(&mut inputs, 1.0);

        let (_scores, upd) = similarity_forward(&inputs, &[0, 1], &bank, d, 0.5).unwrap();

        let mut d_scores = vec![0.0f32; 2 * n];
        rng.fill_uniform(&mut d_scores, 1.0);

        let d_inputs = similarity_backward(upd, &d_scores, &mut bank);

        // Expected gradient against the bank as it was BEFORE the update.
        for bi in 0..2 {
            for j in 0..d {
                let mut expected = 0.0f32;
                for s in 0..n {
                    expected += d_scores[bi * n + s] * bank_before[s * d + j];
                }
                assert!(
                    (d_inputs[bi * d + j] - expected).abs() < 1e-5,
                    "d_inputs[{bi},{j}] = {} vs pre-update {}",
                    d_inputs[bi * d + j],
                    expected
                );
            }
        }
        // And the bank did move afterwards.
        assert!(bank != bank_before, "backward should have updated the bank");
    }

    #[test]
    fn test_backward_renormalizes_updated_rows() {
        let d = 6;
        let n = 5;
        let mut bank = make_unit_bank(n, d, 42);
        let mut rng = SimpleRng::new(3);
        let mut inputs = vec![0.0f32; 3 * d];
        rng.fill_uniform(&mut inputs, 2.0); // deliberately non-unit inputs

        let (_s, upd) = similarity_forward(&inputs, &[0, 2, 4], &bank, d, 0.2).unwrap();
        let d_scores = vec![0.0f32; 3 * n];
        let _ = similarity_backward(upd, &d_scores, &mut bank);

        for (i, row) in bank.chunks(d).enumerate() {
            let norm = vec_norm_f32(row);
            assert!((norm - 1.0).abs() < 1e-5, "bank row {i} norm {norm}");
        }
    }

    #[test]
    fn test_update_is_convex_combination() {
        let d = 4;
        let mut bank = make_unit_bank(2, d, 42);
        let old_row: Vec<f32> = bank[0..d].to_vec();
        let inputs = vec![0.3f32, -0.1, 0.7, 0.2];
        let m = 0.6f32;

        let (_s, upd) = similarity_forward(&inputs, &[0], &bank, d, m).unwrap();
        let _ = similarity_backward(upd, &vec![0.0; 2], &mut bank);

        let mut expected: Vec<f32> = (0..d).map(|j| m * old_row[j] + (1.0 - m) * inputs[j]).collect();
        vec_normalize_f32(&mut expected);
        for j in 0..d {
            assert!((bank[j] - expected[j]).abs() < 1e-6, "slot[{j}]: {} vs {}", bank[j], expected[j]);
        }
    }

    #[test]
    fn test_momentum_zero_replaces_row() {
        let d = 4;
        let mut bank = make_unit_bank(2, d, 42);
        let inputs = vec![2.0f32, 0.0, 0.0, 0.0];

        let (_s, upd) = similarity_forward(&inputs, &[1], &bank, d, 0.0).unwrap();
        let _ = similarity_backward(upd, &vec![0.0; 2], &mut bank);

        // m=0: slot becomes the normalized input.
        assert!((bank[d] - 1.0).abs() < 1e-6);
        for j in 1..d {
            assert!(bank[d + j].abs() < 1e-6);
        }
    }

    #[test]
    fn test_momentum_one_keeps_row() {
        let d = 4;
        let mut bank = make_unit_bank(2, d, 42);
        let before: Vec<f32> = bank[0..d].to_vec();
        let inputs = vec![2.0f32, -1.0, 0.5, 0.0];

        let (_s, upd) = similarity_forward(&inputs, &[0], &bank, d, 1.0).unwrap();
        let _ = similarity_backward(upd, &vec![0.0; 2], &mut bank);

        // m=1 on a unit row: unchanged up to the renormalization rounding.
        for j in 0..d {
            assert!((bank[j] - before[j]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_duplicate_indices_apply_sequentially() {
        let d = 3;
        let mut bank = make_unit_bank(4, d, 42);
        let old_row: Vec<f32> = bank[2 * d..3 * d].to_vec();
        let x0 = [1.0f32, 0.0, 0.0];
        let x1 = [0.0f32, 1.0, 0.0];
        let inputs: Vec<f32> = x0.iter().chain(x1.iter()).copied().collect();
        let m = 0.5f32;

        let (_s, upd) = similarity_forward(&inputs, &[2, 2], &bank, d, m).unwrap();
        let _ = similarity_backward(upd, &vec![0.0; 2 * 4], &mut bank);

        // Two sequential EMA folds, the second on the first's result.
        let mut step1: Vec<f32> = (0..d).map(|j| m * old_row[j] + (1.0 - m) * x0[j]).collect();
        vec_normalize_f32(&mut step1);
        let mut step2: Vec<f32> = (0..d).map(|j| m * step1[j] + (1.0 - m) * x1[j]).collect();
        vec_normalize_f32(&mut step2);

        for j in 0..d {
            assert!(
                (bank[2 * d + j] - step2[j]).abs() < 1e-6,
                "slot[{j}]: {} vs sequential {}",
                bank[2 * d + j],
                step2[j]
            );
        }
    }

    #[test]
    fn test_cancelling_update_stays_finite() {
        let d = 3;
        let mut bank = vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0];
        // m=0.5 with x = -bank[0] gives a zero pre-normalization vector.
        let inputs = vec![-1.0f32, 0.0, 0.0];
        let (_s, upd) = similarity_forward(&inputs, &[0], &bank, d, 0.5).unwrap();
        let _ = similarity_backward(upd, &vec![0.0; 2], &mut bank);
        assert!(bank.iter().all(|x| x.is_finite()), "cancelled slot must not go NaN/Inf");
    }
}
