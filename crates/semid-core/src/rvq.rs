//! Residual Vector Quantization
//!
//! Compresses a fixed-dimension embedding into an L-level discrete code by
//! repeatedly matching the running residual against a per-level codebook.
//!
//! # Architecture
//!
//! ```text
//! Embedding [f32; D] → level 0: nearest of n_e entries → index i0, residual -= e[i0]
//!                       level 1: nearest of n_e entries → index i1, residual -= e[i1]
//!                       ...
//! Code [u32; L]  (one index per level)
//! ```
//!
//! Each level is a uniform [`CodebookLevel`] with an exploration flag: cold
//! levels assign by squared-Euclidean nearest match; a level with a non-zero
//! `sk_epsilon` assigns via batch-balanced Sinkhorn iteration instead (see
//! [`crate::sinkhorn`]). The stack is a plain sequential reduction over
//! levels.

use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::math;
use crate::semantic_id::MAX_LEVELS;
use crate::sinkhorn;

/// Ordered per-level codebook indices for one item
pub type Code = Vec<u32>;

/// Stack configuration, embedded verbatim in every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RvqConfig {
    /// Embedding dimension
    pub dim: usize,
    /// Codebook size per level (`n_e`), one entry per level
    pub codebook_sizes: Vec<usize>,
    /// Sinkhorn temperature per level; 0.0 disables exploration for a level
    pub sk_epsilons: Vec<f32>,
    /// Sinkhorn iterations per balanced assignment
    pub sk_iters: usize,
    /// Commitment weight inside the per-level quantization term
    pub beta: f32,
    /// Weight of the quantization term in the total loss
    pub quant_loss_weight: f32,
    /// Seed codebooks with k-means over level residuals before training
    pub kmeans_init: bool,
    /// Lloyd iterations for k-means seeding
    pub kmeans_iters: usize,
}

impl RvqConfig {
    /// Uniform configuration: `num_levels` levels of `codebook_size` entries,
    /// exploration disabled everywhere.
    pub fn uniform(dim: usize, num_levels: usize, codebook_size: usize) -> Self {
        Self {
            dim,
            codebook_sizes: vec![codebook_size; num_levels],
            sk_epsilons: vec![0.0; num_levels],
            sk_iters: 100,
            beta: 0.25,
            quant_loss_weight: 1.0,
            kmeans_init: false,
            kmeans_iters: 10,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.codebook_sizes.len()
    }

    /// Total parameter count across all codebooks
    pub fn param_len(&self) -> usize {
        self.codebook_sizes.iter().map(|n_e| n_e * self.dim).sum()
    }
}

/// One quantization stage: `n_e` representative vectors of dimension `dim`
#[derive(Debug, Clone)]
pub struct CodebookLevel {
    pub n_e: usize,
    pub dim: usize,
    /// Sinkhorn temperature; 0.0 keeps this level deterministic
    pub sk_epsilon: f32,
    /// Codebook entries, flattened `[n_e][dim]` row-major
    pub vectors: Vec<f32>,
}

impl CodebookLevel {
    /// Get a codebook entry by index
    #[inline]
    pub fn vector(&self, index: u32) -> &[f32] {
        let offset = index as usize * self.dim;
        &self.vectors[offset..offset + self.dim]
    }

    /// Deterministic single-item assignment: nearest entry by squared L2
    #[inline]
    pub fn assign(&self, residual: &[f32]) -> (u32, f32) {
        let (idx, dist) = math::nearest_row(residual, &self.vectors, self.dim);
        (idx as u32, dist)
    }

    /// Assign a batch of residuals (flattened row-major, `n` rows).
    ///
    /// With `explore` set and a non-zero `sk_epsilon`, assignment is the
    /// batch-balanced Sinkhorn plan; otherwise each row independently takes
    /// its nearest entry.
    pub fn assign_batch(&self, residuals: &[f32], n: usize, explore: bool, sk_iters: usize) -> Vec<u32> {
        debug_assert_eq!(residuals.len(), n * self.dim);

        if explore && self.sk_epsilon > 0.0 {
            let mut dists = vec![0.0f32; n * self.n_e];
            for i in 0..n {
                let row = &residuals[i * self.dim..(i + 1) * self.dim];
                for j in 0..self.n_e {
                    dists[i * self.n_e + j] =
                        math::l2_distance_squared(row, self.vector(j as u32));
                }
            }
            sinkhorn::balanced_assign(&dists, n, self.n_e, self.sk_epsilon, sk_iters)
        } else {
            residuals
                .chunks_exact(self.dim)
                .map(|row| self.assign(row).0)
                .collect()
        }
    }
}

/// Training-time forward pass output for one batch
pub struct BatchForward {
    pub codes: Vec<Code>,
    /// MSE between summed reconstruction and input, mean over elements
    pub recon_loss: f32,
    /// Per-level quantization term (codebook + beta × commitment), mean over elements
    pub quant_loss: f32,
    /// recon_loss + quant_loss_weight × quant_loss
    pub total_loss: f32,
    /// Residual entering each level (`[level][n * dim]`), plus the final
    /// residual at index L. Consumed by [`ResidualQuantizer::codebook_grads`].
    pub level_residuals: Vec<Vec<f32>>,
}

/// The residual quantization stack
#[derive(Debug, Clone)]
pub struct ResidualQuantizer {
    pub config: RvqConfig,
    pub levels: Vec<CodebookLevel>,
}

impl ResidualQuantizer {
    /// Create a stack with uniform-random codebooks in ±1/n_e per level
    ///
    /// # Panics
    ///
    /// Panics if the configuration is inconsistent: mismatched per-level
    /// lists, more levels than renderable markers, or an empty codebook.
    pub fn new(config: RvqConfig, seed: u64) -> Self {
        Self::validate(&config);

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let levels = config
            .codebook_sizes
            .iter()
            .zip(&config.sk_epsilons)
            .map(|(&n_e, &eps)| {
                let bound = 1.0 / n_e as f32;
                let vectors = (0..n_e * config.dim)
                    .map(|_| rng.gen_range(-bound..bound))
                    .collect();
                CodebookLevel {
                    n_e,
                    dim: config.dim,
                    sk_epsilon: eps,
                    vectors,
                }
            })
            .collect();

        Self { config, levels }
    }

    /// Rebuild a stack from persisted codebooks (checkpoint load path)
    ///
    /// # Panics
    ///
    /// Panics if a codebook's length disagrees with the configuration.
    pub fn from_codebooks(config: RvqConfig, codebooks: Vec<Vec<f32>>) -> Self {
        Self::validate(&config);
        assert_eq!(
            codebooks.len(),
            config.num_levels(),
            "Codebook count mismatch: expected {}, got {}",
            config.num_levels(),
            codebooks.len()
        );

        let levels = codebooks
            .into_iter()
            .enumerate()
            .map(|(l, vectors)| {
                let n_e = config.codebook_sizes[l];
                assert_eq!(
                    vectors.len(),
                    n_e * config.dim,
                    "Level {} codebook size mismatch: expected {}, got {}",
                    l,
                    n_e * config.dim,
                    vectors.len()
                );
                CodebookLevel {
                    n_e,
                    dim: config.dim,
                    sk_epsilon: config.sk_epsilons[l],
                    vectors,
                }
            })
            .collect();

        Self { config, levels }
    }

    fn validate(config: &RvqConfig) {
        assert!(
            config.num_levels() > 0 && config.num_levels() <= MAX_LEVELS,
            "Level count {} outside 1..={}",
            config.num_levels(),
            MAX_LEVELS
        );
        assert_eq!(
            config.codebook_sizes.len(),
            config.sk_epsilons.len(),
            "codebook_sizes and sk_epsilons must have equal length"
        );
        assert!(
            config.codebook_sizes.iter().all(|&n_e| n_e > 0),
            "Codebook sizes must be non-zero"
        );
        assert!(config.dim > 0, "Embedding dimension must be non-zero");
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Encode a batch of embeddings (flattened row-major, `n` rows).
    ///
    /// With `explore` unset every level assigns deterministically; with it
    /// set, levels whose `sk_epsilon` is non-zero use balanced assignment
    /// across the batch.
    pub fn encode_batch(&self, data: &[f32], explore: bool) -> Vec<Code> {
        let dim = self.config.dim;
        debug_assert_eq!(data.len() % dim, 0);
        let n = data.len() / dim;

        let mut residual = data.to_vec();
        let mut codes = vec![Vec::with_capacity(self.num_levels()); n];

        for level in &self.levels {
            let indices = level.assign_batch(&residual, n, explore, self.config.sk_iters);
            for (i, &idx) in indices.iter().enumerate() {
                let entry = level.vector(idx);
                let row = &mut residual[i * dim..(i + 1) * dim];
                for (r, e) in row.iter_mut().zip(entry) {
                    *r -= e;
                }
                codes[i].push(idx);
            }
        }

        codes
    }

    /// Encode a single embedding deterministically
    pub fn encode(&self, embedding: &[f32]) -> Code {
        self.encode_batch(embedding, false)
            .pop()
            .expect("single-item batch yields one code")
    }

    /// Reconstruct the approximate embedding for a code: the sum of the
    /// chosen entry at every level.
    pub fn reconstruct(&self, code: &Code) -> Vec<f32> {
        debug_assert_eq!(code.len(), self.num_levels());
        let mut out = vec![0.0f32; self.config.dim];
        for (level, &idx) in self.levels.iter().zip(code) {
            for (o, e) in out.iter_mut().zip(level.vector(idx)) {
                *o += e;
            }
        }
        out
    }

    /// Per-level quantization loss for one item via an explicit residual
    /// sweep: at each level, the MSE between the incoming residual and the
    /// chosen entry, before subtracting it.
    pub fn quantization_losses(&self, embedding: &[f32], code: &Code) -> Vec<f32> {
        debug_assert_eq!(code.len(), self.num_levels());
        let mut residual = embedding.to_vec();
        let mut losses = Vec::with_capacity(self.num_levels());

        for (level, &idx) in self.levels.iter().zip(code) {
            let entry = level.vector(idx);
            losses.push(math::mse(&residual, entry));
            for (r, e) in residual.iter_mut().zip(entry) {
                *r -= e;
            }
        }

        losses
    }

    /// Training forward pass over one batch.
    ///
    /// Levels with a non-zero `sk_epsilon` explore; the rest are
    /// deterministic, matching the configured training behavior.
    pub fn forward(&self, data: &[f32]) -> BatchForward {
        let dim = self.config.dim;
        debug_assert_eq!(data.len() % dim, 0);
        let n = data.len() / dim;
        let elems = (n * dim) as f32;

        let mut residual = data.to_vec();
        let mut codes = vec![Vec::with_capacity(self.num_levels()); n];
        let mut level_residuals = Vec::with_capacity(self.num_levels() + 1);
        let mut quant_loss = 0.0f32;

        for level in &self.levels {
            level_residuals.push(residual.clone());
            let indices = level.assign_batch(&residual, n, true, self.config.sk_iters);
            for (i, &idx) in indices.iter().enumerate() {
                let entry = level.vector(idx);
                let row = &mut residual[i * dim..(i + 1) * dim];
                for (r, e) in row.iter_mut().zip(entry) {
                    *r -= e;
                }
                codes[i].push(idx);
            }
            // After subtraction the residual equals (input residual − entry),
            // so this level's quantization term is its mean square.
            let level_sq = math::sum_squares(&residual);
            quant_loss += (1.0 + self.config.beta) * level_sq / elems;
        }

        let recon_loss = math::sum_squares(&residual) / elems;
        level_residuals.push(residual);

        BatchForward {
            codes,
            recon_loss,
            quant_loss,
            total_loss: recon_loss + self.config.quant_loss_weight * quant_loss,
            level_residuals,
        }
    }

    /// Closed-form codebook gradients for one forward pass.
    ///
    /// Only the codebook term of the quantization loss reaches the codebooks
    /// (straight-through reconstruction): for entry `j` at level `l`,
    /// `∂L/∂e_j = (2·w/(n·d)) · Σ_{i: code_i[l]=j} (e_j − res_{l,i})`, and
    /// `e_j − res_{l,i}` is the negated residual leaving level `l`.
    pub fn codebook_grads(&self, fwd: &BatchForward) -> Vec<Vec<f32>> {
        let dim = self.config.dim;
        let n = fwd.codes.len();
        let scale = 2.0 * self.config.quant_loss_weight / (n * dim) as f32;

        let mut grads: Vec<Vec<f32>> = self
            .levels
            .iter()
            .map(|level| vec![0.0f32; level.n_e * dim])
            .collect();

        for (l, grad) in grads.iter_mut().enumerate() {
            let outgoing = &fwd.level_residuals[l + 1];
            for (i, code) in fwd.codes.iter().enumerate() {
                let j = code[l] as usize;
                let res = &outgoing[i * dim..(i + 1) * dim];
                let slot = &mut grad[j * dim..(j + 1) * dim];
                for (g, r) in slot.iter_mut().zip(res) {
                    *g -= scale * r;
                }
            }
        }

        grads
    }

    /// Seed codebooks level-by-level with k-means over the level's residuals
    pub fn kmeans_init(&mut self, data: &[f32], iters: usize, seed: u64) {
        let dim = self.config.dim;
        let n = data.len() / dim;
        let mut residual = data.to_vec();

        for (l, level) in self.levels.iter_mut().enumerate() {
            level.vectors = kmeans(&residual, n, dim, level.n_e, iters, seed.wrapping_add(l as u64));

            // Subtract nearest assignments to form the next level's residuals
            for i in 0..n {
                let row = &mut residual[i * dim..(i + 1) * dim];
                let (idx, _) = math::nearest_row(row, &level.vectors, dim);
                let entry = &level.vectors[idx * dim..(idx + 1) * dim];
                for (r, e) in row.iter_mut().zip(entry) {
                    *r -= e;
                }
            }
        }
    }
}

/// K-means++ initialization: seed centroids with probability proportional to
/// squared distance from the nearest already-chosen centroid.
fn kmeans_pp_init(data: &[f32], n: usize, dim: usize, k: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut centroids = vec![0.0f32; k * dim];

    let first = rng.gen_range(0..n);
    centroids[0..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);

    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for i in 0..n {
            let d = math::l2_distance_squared(&data[i * dim..(i + 1) * dim], last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        if total <= 0.0 {
            // All points already sit on centroids
            let idx = rng.gen_range(0..n);
            centroids[c * dim..(c + 1) * dim].copy_from_slice(&data[idx * dim..(idx + 1) * dim]);
            continue;
        }

        let threshold: f64 = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = 0;
        for i in 0..n {
            cumulative += min_dists[i] as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids[c * dim..(c + 1) * dim]
            .copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    centroids
}

/// Lloyd's k-means over flattened row-major data.
///
/// When there are fewer rows than requested centroids, the remainder is
/// filled with jittered copies of existing rows so the codebook keeps its
/// configured size.
fn kmeans(data: &[f32], n: usize, dim: usize, k: usize, max_iters: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let effective_k = k.min(n);

    let mut centroids = kmeans_pp_init(data, n, dim, effective_k, seed);
    let mut assignments = vec![0usize; n];
    let mut sums = vec![0.0f32; effective_k * dim];
    let mut counts = vec![0usize; effective_k];

    for _iter in 0..max_iters {
        for i in 0..n {
            let (c, _) = math::nearest_row(&data[i * dim..(i + 1) * dim], &centroids, dim);
            assignments[i] = c;
        }

        sums.fill(0.0);
        counts.fill(0);
        for i in 0..n {
            let c = assignments[i];
            counts[c] += 1;
            let offset = c * dim;
            for d in 0..dim {
                sums[offset + d] += data[i * dim + d];
            }
        }

        let mut max_movement = 0.0f32;
        for c in 0..effective_k {
            let offset = c * dim;
            if counts[c] > 0 {
                let count_f = counts[c] as f32;
                for d in 0..dim {
                    sums[offset + d] /= count_f;
                }
            } else {
                // Dead centroid: reseed from a random row
                let idx = rng.gen_range(0..n);
                sums[offset..offset + dim].copy_from_slice(&data[idx * dim..(idx + 1) * dim]);
            }
            let movement =
                math::l2_distance_squared(&centroids[offset..offset + dim], &sums[offset..offset + dim]);
            if movement > max_movement {
                max_movement = movement;
            }
        }

        centroids.copy_from_slice(&sums);

        if max_movement < 1e-8 {
            tracing::debug!("K-means converged after {} iterations", _iter + 1);
            break;
        }
    }

    if effective_k < k {
        for _ in effective_k..k {
            let idx = rng.gen_range(0..n);
            let row = &data[idx * dim..(idx + 1) * dim];
            let jittered: Vec<f32> = row.iter().map(|v| v + rng.gen_range(-1e-3..1e-3)).collect();
            centroids.extend(jittered);
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;

    fn random_batch(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen::<f32>() - 0.5).collect()
    }

    fn test_stack(dim: usize, levels: usize, n_e: usize) -> ResidualQuantizer {
        ResidualQuantizer::new(RvqConfig::uniform(dim, levels, n_e), 42)
    }

    #[test]
    fn test_code_shape_and_bounds() {
        let rvq = test_stack(8, 3, 4);
        let data = random_batch(6, 8, 7);
        let codes = rvq.encode_batch(&data, false);

        assert_eq!(codes.len(), 6);
        for code in &codes {
            assert_eq!(code.len(), 3);
            assert!(code.iter().all(|&idx| idx < 4));
        }
    }

    #[test]
    fn test_encode_deterministic() {
        let rvq = test_stack(16, 3, 8);
        let data = random_batch(4, 16, 11);

        let a = rvq.encode_batch(&data, false);
        let b = rvq.encode_batch(&data, false);
        assert_eq!(a, b);

        let single = rvq.encode(&data[0..16]);
        assert_eq!(single, a[0]);
    }

    #[test]
    fn test_reconstruct_is_sum_of_entries() {
        let rvq = test_stack(4, 2, 3);
        let code = vec![1u32, 2];
        let recon = rvq.reconstruct(&code);

        let expected: Vec<f32> = rvq.levels[0]
            .vector(1)
            .iter()
            .zip(rvq.levels[1].vector(2))
            .map(|(a, b)| a + b)
            .collect();
        assert_eq!(recon, expected);
    }

    #[test]
    fn test_quantization_loss_roundtrip() {
        // Recomputing the sweep from a stored code reproduces the forward
        // pass's per-level terms within float tolerance.
        let rvq = test_stack(8, 3, 4);
        let data = random_batch(1, 8, 3);

        let fwd = rvq.forward(&data);
        let losses = rvq.quantization_losses(&data, &fwd.codes[0]);

        let swept: f32 = losses.iter().map(|l| (1.0 + rvq.config.beta) * l).sum();
        assert!((swept - fwd.quant_loss).abs() < 1e-5);
    }

    #[test]
    fn test_forward_loss_consistency() {
        let rvq = test_stack(8, 2, 4);
        let data = random_batch(5, 8, 9);
        let fwd = rvq.forward(&data);

        assert!(fwd.total_loss.is_finite());
        assert!(
            (fwd.total_loss - (fwd.recon_loss + rvq.config.quant_loss_weight * fwd.quant_loss))
                .abs()
                < 1e-6
        );

        // Reconstruction loss equals the mean square of the final residual,
        // which is also MSE between input and reconstruct().
        let mut manual = 0.0f32;
        for (i, code) in fwd.codes.iter().enumerate() {
            let recon = rvq.reconstruct(code);
            manual += math::l2_distance_squared(&data[i * 8..(i + 1) * 8], &recon);
        }
        manual /= (5 * 8) as f32;
        assert!((manual - fwd.recon_loss).abs() < 1e-5);
    }

    #[test]
    fn test_codebook_grads_shape_and_direction() {
        let rvq = test_stack(4, 2, 3);
        let data = random_batch(6, 4, 21);
        let fwd = rvq.forward(&data);
        let grads = rvq.codebook_grads(&fwd);

        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].len(), 3 * 4);

        // A small step along -grad must not increase the quantization loss.
        let mut nudged = rvq.clone();
        let lr = 0.01;
        for (level, grad) in nudged.levels.iter_mut().zip(&grads) {
            for (p, g) in level.vectors.iter_mut().zip(grad) {
                *p -= lr * g;
            }
        }
        let after = nudged.forward(&data);
        assert!(
            after.quant_loss <= fwd.quant_loss + 1e-4,
            "quant loss rose from {} to {}",
            fwd.quant_loss,
            after.quant_loss
        );
    }

    #[test]
    fn test_exploration_only_on_hot_levels() {
        let mut config = RvqConfig::uniform(8, 3, 4);
        config.sk_epsilons = vec![0.0, 0.0, 0.05];
        let rvq = ResidualQuantizer::new(config, 42);
        let data = random_batch(6, 8, 13);

        let cold = rvq.encode_batch(&data, false);
        let hot = rvq.encode_batch(&data, true);

        // Prefix levels stay deterministic regardless of exploration.
        for (c, h) in cold.iter().zip(&hot) {
            assert_eq!(c[0], h[0]);
            assert_eq!(c[1], h[1]);
        }
    }

    #[test]
    fn test_kmeans_init_improves_reconstruction() {
        let config = RvqConfig::uniform(8, 2, 4);
        let data = random_batch(64, 8, 5);

        let random = ResidualQuantizer::new(config.clone(), 42);
        let mut seeded = ResidualQuantizer::new(config, 42);
        seeded.kmeans_init(&data, 15, 42);

        let before = random.forward(&data).recon_loss;
        let after = seeded.forward(&data).recon_loss;
        assert!(
            after < before,
            "k-means seeding should tighten reconstruction ({} vs {})",
            after,
            before
        );
    }

    #[test]
    fn test_kmeans_pads_small_catalogs() {
        let mut rvq = test_stack(4, 1, 8);
        let data = random_batch(3, 4, 17);
        rvq.kmeans_init(&data, 5, 42);
        assert_eq!(rvq.levels[0].vectors.len(), 8 * 4);
    }

    #[test]
    #[should_panic]
    fn test_too_many_levels_rejected() {
        ResidualQuantizer::new(RvqConfig::uniform(4, 6, 4), 0);
    }

    #[test]
    fn test_from_codebooks_roundtrip() {
        let rvq = test_stack(4, 2, 3);
        let codebooks: Vec<Vec<f32>> = rvq.levels.iter().map(|l| l.vectors.clone()).collect();
        let rebuilt = ResidualQuantizer::from_codebooks(rvq.config.clone(), codebooks);

        let data = random_batch(4, 4, 19);
        assert_eq!(rvq.encode_batch(&data, false), rebuilt.encode_batch(&data, false));
    }
}
