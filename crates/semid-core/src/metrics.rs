//! Validation statistics and metrics emission
//!
//! [`collect`] runs one deterministic encoding pass over a validation store
//! and derives every statistic from that single pass: collision rates at full
//! length and truncated prefixes, per-level quantization loss via an explicit
//! residual sweep, codebook utilization, and code-frequency histograms.
//!
//! Experiment tracking is an injectable capability: the trainer emits through
//! a [`MetricsSink`], and the no-op default turns emission off without
//! touching the training loop.

use std::collections::HashSet;

use crate::math;
use crate::rvq::ResidualQuantizer;
use crate::store::EmbeddingStore;

/// Per-validation-call quality statistics
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub num_items: usize,
    /// Fraction of items whose full code is not globally unique
    pub collision_rate: f32,
    /// Collision rate truncated to the first level
    pub collision_rate_prefix1: f32,
    /// Collision rate truncated to the first two levels
    pub collision_rate_prefix2: f32,
    /// Per-level quantization loss, mean over elements
    pub per_level_quant_loss: Vec<f32>,
    /// Distinct codes used at each level / that level's codebook size
    pub codebook_utilization: Vec<f32>,
    /// Items assigned to each codebook entry, per level
    pub code_histograms: Vec<Vec<u32>>,
}

fn prefix_collision_rate(codes: &[Vec<u32>], prefix_len: usize, num_items: usize) -> f32 {
    let distinct: HashSet<&[u32]> = codes
        .iter()
        .map(|code| &code[..prefix_len.min(code.len())])
        .collect();
    (num_items - distinct.len()) as f32 / num_items as f32
}

/// Compute the full validation report in one pass over the store.
///
/// The encoding is computed once per call; every derived statistic reuses the
/// same codes.
pub fn collect(rvq: &ResidualQuantizer, store: &EmbeddingStore, batch_size: usize) -> ValidationReport {
    let dim = rvq.config.dim;
    let num_levels = rvq.num_levels();
    let num_items = store.count;

    // One deterministic encoding of the whole validation set.
    let mut codes: Vec<Vec<u32>> = Vec::with_capacity(num_items);
    let mut start = 0usize;
    while start < num_items {
        let end = (start + batch_size).min(num_items);
        let batch: Vec<f32> = (start..end).flat_map(|i| store.get(i).iter().copied()).collect();
        codes.extend(rvq.encode_batch(&batch, false));
        start = end;
    }

    // Residual sweep over the shared codes: each level's loss is measured
    // against the residual entering it, decoupled from the training pass.
    let mut level_losses = vec![0.0f64; num_levels];
    let mut histograms: Vec<Vec<u32>> = rvq.levels.iter().map(|l| vec![0u32; l.n_e]).collect();
    for (i, code) in codes.iter().enumerate() {
        let mut residual = store.get(i).to_vec();
        for (l, (level, &idx)) in rvq.levels.iter().zip(code).enumerate() {
            let entry = level.vector(idx);
            level_losses[l] += math::l2_distance_squared(&residual, entry) as f64;
            histograms[l][idx as usize] += 1;
            for (r, e) in residual.iter_mut().zip(entry) {
                *r -= e;
            }
        }
    }

    let elems = (num_items * dim) as f64;
    let per_level_quant_loss: Vec<f32> =
        level_losses.iter().map(|&acc| (acc / elems) as f32).collect();

    let codebook_utilization: Vec<f32> = histograms
        .iter()
        .zip(&rvq.levels)
        .map(|(hist, level)| hist.iter().filter(|&&c| c > 0).count() as f32 / level.n_e as f32)
        .collect();

    ValidationReport {
        num_items,
        collision_rate: prefix_collision_rate(&codes, num_levels, num_items),
        collision_rate_prefix1: prefix_collision_rate(&codes, 1, num_items),
        collision_rate_prefix2: prefix_collision_rate(&codes, 2, num_items),
        per_level_quant_loss,
        codebook_utilization,
        code_histograms: histograms,
    }
}

/// Scalar training metrics for one epoch
#[derive(Debug, Clone, Copy)]
pub struct TrainEpochMetrics {
    pub epoch: usize,
    pub total_loss: f32,
    pub recon_loss: f32,
    pub quant_loss: f32,
    pub lr: f32,
    pub grad_norm: f32,
}

/// Injectable experiment-tracking capability
pub trait MetricsSink {
    fn train_epoch(&mut self, metrics: &TrainEpochMetrics) {
        let _ = metrics;
    }

    fn validation(&mut self, epoch: usize, report: &ValidationReport, best_collision_rate: f32) {
        let _ = (epoch, report, best_collision_rate);
    }
}

/// Default sink: emission disabled, training unaffected
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Sink that forwards scalar metrics to the `tracing` subscriber
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn train_epoch(&mut self, m: &TrainEpochMetrics) {
        tracing::info!(
            epoch = m.epoch,
            total_loss = m.total_loss,
            recon_loss = m.recon_loss,
            quant_loss = m.quant_loss,
            lr = m.lr,
            grad_norm = m.grad_norm,
            "train epoch"
        );
    }

    fn validation(&mut self, epoch: usize, report: &ValidationReport, best_collision_rate: f32) {
        tracing::info!(
            epoch,
            collision_rate = report.collision_rate,
            collision_rate_prefix1 = report.collision_rate_prefix1,
            collision_rate_prefix2 = report.collision_rate_prefix2,
            best_collision_rate,
            utilization = ?report.codebook_utilization,
            per_level_quant_loss = ?report.per_level_quant_loss,
            "validation"
        );
    }
}
