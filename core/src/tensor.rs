/// Flat-slice math kernels for the hybrid memory.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions, row-major layout throughout. The feature bank, batches and
/// every transient table live in plain Vec<f32>.

/// Matrix product against a transposed right-hand side:
/// C[M,N] = A[M,K] @ B[N,K]ᵀ. Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_nt_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let b_row = &b[j * k..(j + 1) * k];
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a_row[p] * b_row[p];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N]. Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Dot product of two equal-length vectors.
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize vector in-place to unit length. No-op if norm < 1e-8.
pub fn vec_normalize_f32(a: &mut [f32]) {
    let norm = vec_norm_f32(a);
    if norm > 1e-8 {
        let inv = 1.0 / norm;
        for x in a.iter_mut() {
            *x *= inv;
        }
    }
}

/// Row-wise masked softmax with a per-column mask.
///
/// For each row r of `vec` (rows × cols):
///   e[c]     = exp(vec[r,c]) * mask[c]
///   out[r,c] = e[c] / (sum_c e[c] + 1e-6)
///
/// Columns with mask 0 get exactly zero probability; the epsilon keeps the
/// division finite when a row is fully masked, and keeps any log taken of
/// the output finite downstream. No max-shift before exp: inputs are
/// temperature-scaled per-cluster mean similarities, bounded in magnitude,
/// and the epsilon must keep its absolute scale.
pub fn masked_softmax_f32(vec: &[f32], mask: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(vec.len(), rows * cols);
    debug_assert_eq!(mask.len(), cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let mut sum = 0.0f32;
        for c in 0..cols {
            let e = vec[base + c].exp() * mask[c];
            out[base + c] = e;
            sum += e;
        }
        let inv = 1.0 / (sum + 1e-6);
        for c in 0..cols {
            out[base + c] *= inv;
        }
    }
}

/// Simple xorshift64 PRNG for deterministic fixtures. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
