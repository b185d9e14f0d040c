/// Hybrid memory — a per-sample feature bank with a cluster-prototype loss.
///
/// Owns N unit-normalized feature vectors (one bank slot per training
/// sample) and a cluster id per slot. One training step:
///
///   scores = similarity(inputs, bank) / temp             — B×N
///   agg    = scatter-mean of scores by bank label        — B×C
///   probs  = masked_softmax(agg)                         — empty clusters zeroed
///   loss   = nll(probs, targets)
///          + focal: (1 - p_target)^4 reweighted nll
///          + [- mean cos(inputs, aug)]                   — optional
///          + [- mean cos(prototype(target), aug)]        — optional, detached prototype
///
/// `forward` never writes the bank; `backward` consumes the cache, returns
/// the input/augmented-view gradients and applies the momentum bank update
/// exactly once. Labels may be rewritten between steps (re-clustering),
/// but not between a forward and its backward.

use serde::{Serialize, Deserialize};

use crate::similarity::{similarity_forward, similarity_backward, MemoryError, SimilarityUpdate};
use crate::tensor::{dot_f32, masked_softmax_f32, vec_norm_f32, vec_normalize_f32};

// ── Configuration ───────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Feature dimensionality D.
    pub num_features: usize,
    /// Bank size N — one slot per training sample.
    pub num_samples: usize,
    /// Softmax temperature dividing the raw similarities.
    pub temp: f32,
    /// EMA momentum in [0, 1); higher retains more history. m=0 replaces a
    /// slot with the (normalized) input, m=1 leaves it unchanged before
    /// renormalization.
    pub momentum: f32,
}

impl MemoryConfig {
    /// Tiny fixture: 10 samples, 16-dim features.
    pub fn test_config() -> Self {
        MemoryConfig {
            num_features: 16,
            num_samples: 10,
            temp: 0.05,
            momentum: 0.2,
        }
    }
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct HybridMemory {
    pub cfg: MemoryConfig,
    /// Feature bank: [num_samples, num_features], rows unit-normalized.
    pub bank: Vec<f32>,
    /// Cluster id per bank slot, rewritten by the clustering stage.
    pub labels: Vec<usize>,
}

/// Everything the backward pass needs, captured by `forward`.
///
/// Consumed by value in `backward`: one forward, at most one backward,
/// at most one bank update.
#[derive(Debug)]
pub struct MemoryCache {
    pub batch: usize,
    pub num_clusters: usize,
    /// Target cluster id per batch sample: labels[indexes[b]].
    pub targets: Vec<usize>,
    /// Bank members per cluster, as f32 (the aggregation divisor).
    pub counts: Vec<f32>,
    /// Masked-softmax cluster probabilities: [batch, num_clusters].
    pub probs: Vec<f32>,
    pub include_contrastive: bool,
    /// Unmodified copy of the batch features: [batch, D].
    pub inputs: Vec<f32>,
    /// Augmented-view features: [batch, D].
    pub aug: Vec<f32>,
    /// Guarded L2 norms of `inputs` rows.
    pub input_norms: Vec<f32>,
    /// Guarded L2 norms of `aug` rows.
    pub aug_norms: Vec<f32>,
    /// cos(inputs_b, aug_b) per sample.
    pub cos_direct: Vec<f32>,
    /// Unit-normalized target-cluster prototypes (detached): [batch, D].
    pub proto_hat: Vec<f32>,
    /// cos(proto_hat_b, aug_b) per sample.
    pub cos_proto: Vec<f32>,
    /// Loss terms, for inspection; `total()` is what forward returned.
    pub nll: f32,
    pub focal: f32,
    pub contrast_direct: f32,
    pub contrast_memory: f32,
    pub update: SimilarityUpdate,
}

impl MemoryCache {
    pub fn total(&self) -> f32 {
        self.nll + self.focal + self.contrast_direct + self.contrast_memory
    }
}

impl HybridMemory {
    /// Fresh memory: zero bank, all samples in cluster 0.
    pub fn new(cfg: MemoryConfig) -> Self {
        let bank = vec![0.0f32; cfg.num_samples * cfg.num_features];
        let labels = vec![0usize; cfg.num_samples];
        HybridMemory { cfg, bank, labels }
    }

    /// Overwrite the bank with freshly extracted features, row-normalized.
    pub fn set_bank(&mut self, features: &[f32]) -> Result<(), MemoryError> {
        let expected = self.cfg.num_samples * self.cfg.num_features;
        if features.len() != expected {
            return Err(MemoryError::ShapeMismatch {
                what: "bank features",
                expected,
                got: features.len(),
            });
        }
        self.bank.copy_from_slice(features);
        for row in self.bank.chunks_mut(self.cfg.num_features) {
            vec_normalize_f32(row);
        }
        Ok(())
    }

    /// Overwrite the cluster assignment. Length must equal the bank size;
    /// the maximum id may change freely between calls.
    pub fn set_labels(&mut self, labels: &[usize]) -> Result<(), MemoryError> {
        if labels.len() != self.cfg.num_samples {
            return Err(MemoryError::ShapeMismatch {
                what: "labels",
                expected: self.cfg.num_samples,
                got: labels.len(),
            });
        }
        self.labels.clear();
        self.labels.extend_from_slice(labels);
        Ok(())
    }

    /// max(label) + 1 — the width of the per-call aggregation tables.
    pub fn num_clusters(&self) -> usize {
        self.labels.iter().copied().max().map_or(0, |m| m + 1)
    }

    /// One loss evaluation.
    ///
    /// `inputs`/`aug_inputs`: [B, D] batch features and their augmented
    /// views; `indexes`: the B global sample indices. Pure with respect to
    /// the bank — all failures surface before any state is touched, and
    /// the momentum update only happens in `backward`.
    pub fn forward(
        &self,
        inputs: &[f32],
        aug_inputs: &[f32],
        indexes: &[usize],
        include_contrastive: bool,
    ) -> Result<(f32, MemoryCache), MemoryError> {
        let d = self.cfg.num_features;
        let n = self.cfg.num_samples;
        let b = indexes.len();

        if aug_inputs.len() != b * d {
            return Err(MemoryError::ShapeMismatch {
                what: "augmented batch features",
                expected: b * d,
                got: aug_inputs.len(),
            });
        }

        // The operator validates `inputs` and the index range.
        let (mut scores, update) =
            similarity_forward(inputs, indexes, &self.bank, d, self.cfg.momentum)?;

        let inv_temp = 1.0 / self.cfg.temp;
        for s in scores.iter_mut() {
            *s *= inv_temp;
        }

        let targets: Vec<usize> = indexes.iter().map(|&i| self.labels[i]).collect();
        let c = self.num_clusters();

        // Per-cluster member counts over the whole bank. Empty clusters
        // keep a safe divisor of 1 and are masked out of the softmax.
        let mut counts = vec![0.0f32; c];
        for &l in &self.labels {
            counts[l] += 1.0;
        }
        let mask: Vec<f32> = counts.iter().map(|&x| if x > 0.0 { 1.0 } else { 0.0 }).collect();

        // Scatter-mean of scores into B×C, keyed by each bank slot's label.
        // Recomputed from the full bank every call: C tracks the current
        // labels and the bank moves every step.
        let mut agg = vec![0.0f32; b * c];
        for bi in 0..b {
            let s_row = &scores[bi * n..(bi + 1) * n];
            let a_row = &mut agg[bi * c..(bi + 1) * c];
            for (i, &l) in self.labels.iter().enumerate() {
                a_row[l] += s_row[i];
            }
            for ci in 0..c {
                let div = if counts[ci] > 0.0 { counts[ci] } else { 1.0 };
                a_row[ci] /= div;
            }
        }

        let mut probs = vec![0.0f32; b * c];
        masked_softmax_f32(&agg, &mask, &mut probs, b, c);

        // Assignment + focal terms read the same distribution.
        let mut nll = 0.0f32;
        let mut focal = 0.0f32;
        for bi in 0..b {
            let p_t = probs[bi * c + targets[bi]];
            let log_pt = (p_t + 1e-6).ln();
            nll -= log_pt;
            focal -= (1.0 - p_t).powi(4) * log_pt;
        }
        nll /= b as f32;
        focal /= b as f32;

        let mut input_norms = vec![0.0f32; b];
        let mut aug_norms = vec![0.0f32; b];
        let mut cos_direct = vec![0.0f32; b];
        let mut proto_hat = vec![0.0f32; b * d];
        let mut cos_proto = vec![0.0f32; b];
        let mut contrast_direct = 0.0f32;
        let mut contrast_memory = 0.0f32;

        if include_contrastive {
            // Cluster prototypes: mean of all bank rows per cluster, fresh
            // from the current bank. A target cluster is never empty — the
            // batch sample itself occupies a bank slot with that label.
            let mut protos = vec![0.0f32; c * d];
            for (i, &l) in self.labels.iter().enumerate() {
                let src = &self.bank[i * d..(i + 1) * d];
                let dst = &mut protos[l * d..(l + 1) * d];
                for j in 0..d {
                    dst[j] += src[j];
                }
            }
            for ci in 0..c {
                let div = if counts[ci] > 0.0 { counts[ci] } else { 1.0 };
                for j in 0..d {
                    protos[ci * d + j] /= div;
                }
            }

            for bi in 0..b {
                let x = &inputs[bi * d..(bi + 1) * d];
                let y = &aug_inputs[bi * d..(bi + 1) * d];
                let xn = vec_norm_f32(x).max(1e-8);
                let yn = vec_norm_f32(y).max(1e-8);
                input_norms[bi] = xn;
                aug_norms[bi] = yn;
                cos_direct[bi] = dot_f32(x, y) / (xn * yn);

                let t = targets[bi];
                let ph = &mut proto_hat[bi * d..(bi + 1) * d];
                ph.copy_from_slice(&protos[t * d..(t + 1) * d]);
                vec_normalize_f32(ph);
                cos_proto[bi] = dot_f32(ph, y) / yn;
            }
            contrast_direct = -cos_direct.iter().sum::<f32>() / b as f32;
            contrast_memory = -cos_proto.iter().sum::<f32>() / b as f32;
        }

        let cache = MemoryCache {
            batch: b,
            num_clusters: c,
            targets,
            counts,
            probs,
            include_contrastive,
            inputs: inputs.to_vec(),
            aug: aug_inputs.to_vec(),
            input_norms,
            aug_norms,
            cos_direct,
            proto_hat,
            cos_proto,
            nll,
            focal,
            contrast_direct,
            contrast_memory,
            update,
        };
        Ok((cache.total(), cache))
    }

    /// Backward pass for one loss evaluation.
    ///
    /// Returns (d_inputs, d_aug), both [B, D], and applies the momentum
    /// bank update — exactly once, after the operator gradient has been
    /// taken against the pre-update bank. Skipping `backward` means the
    /// bank is never updated.
    pub fn backward(&mut self, cache: MemoryCache) -> (Vec<f32>, Vec<f32>) {
        let d = self.cfg.num_features;
        let n = self.cfg.num_samples;
        let b = cache.batch;
        let c = cache.num_clusters;
        let inv_b = 1.0 / b as f32;

        // Loss → cluster table. The masked-softmax VJP collapses to
        //   d_agg[c'] = g_t * p[c'] * (δ_{c'=t} - p_t)
        // with the upstream gradient nonzero only at the target column.
        let mut d_scores = vec![0.0f32; b * n];
        let mut d_agg = vec![0.0f32; c];
        for bi in 0..b {
            let t = cache.targets[bi];
            let p_t = cache.probs[bi * c + t];
            let log_pt = (p_t + 1e-6).ln();
            let om = 1.0 - p_t;
            // d(nll + focal)/d p_target, means over the batch folded in.
            let g_t = inv_b
                * (-1.0 / (p_t + 1e-6) + 4.0 * om.powi(3) * log_pt
                    - om.powi(4) / (p_t + 1e-6));

            for ci in 0..c {
                let delta = if ci == t { 1.0 } else { 0.0 };
                d_agg[ci] = g_t * cache.probs[bi * c + ci] * (delta - p_t);
            }
            // Back through the scatter-mean: every bank slot i feeds its
            // label's bucket, scaled by that cluster's member count.
            let s_row = &mut d_scores[bi * n..(bi + 1) * n];
            for (i, &l) in self.labels.iter().enumerate() {
                let div = if cache.counts[l] > 0.0 { cache.counts[l] } else { 1.0 };
                s_row[i] = d_agg[l] / div;
            }
        }
        // Temperature scaling sits between the operator and the aggregation.
        let inv_temp = 1.0 / self.cfg.temp;
        for v in d_scores.iter_mut() {
            *v *= inv_temp;
        }

        // Operator backward: gradient against the pre-update bank, then
        // the one-shot momentum update.
        let mut d_inputs = similarity_backward(cache.update, &d_scores, &mut self.bank);

        let mut d_aug = vec![0.0f32; b * d];
        if cache.include_contrastive {
            for bi in 0..b {
                let xn = cache.input_norms[bi];
                let yn = cache.aug_norms[bi];
                let cos = cache.cos_direct[bi];
                let cosm = cache.cos_proto[bi];
                let x = &cache.inputs[bi * d..(bi + 1) * d];
                let y = &cache.aug[bi * d..(bi + 1) * d];
                let ph = &cache.proto_hat[bi * d..(bi + 1) * d];
                for j in 0..d {
                    let xh = x[j] / xn;
                    let yh = y[j] / yn;
                    // -cos(x, y): both views are live.
                    d_inputs[bi * d + j] -= inv_b * (yh - cos * xh) / xn;
                    d_aug[bi * d + j] -= inv_b * (xh - cos * yh) / yn;
                    // -cos(prototype, y): the prototype branch is detached,
                    // only the augmented view is optimized.
                    d_aug[bi * d + j] -= inv_b * (ph[j] - cosm * yh) / yn;
                }
            }
        }

        (d_inputs, d_aug)
    }
}

// ── Checkpoint Serialization ─────────────────────────────────────────

/// Save the memory state (config, bank, labels) to a JSON file.
pub fn save_checkpoint(path: &std::path::Path, memory: &HybridMemory) -> std::io::Result<()> {
    let json = serde_json::to_string(memory)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

/// Load a previously saved memory state.
pub fn load_checkpoint(path: &std::path::Path) -> std::io::Result<HybridMemory> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
