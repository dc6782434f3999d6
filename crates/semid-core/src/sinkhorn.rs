//! Entropy-regularized balanced assignment
//!
//! Sinkhorn-Knopp iteration over a batch-by-codebook cost matrix. Instead of
//! assigning each residual to its nearest codebook entry, the transport plan
//! is steered toward uniform marginals: every item carries mass `1/n`, every
//! codebook entry receives mass `1/k`. Lower `epsilon` sharpens the plan
//! toward nearest-match; higher `epsilon` spreads assignments across the
//! codebook at the cost of occasionally picking distant entries.
//!
//! The iteration is deterministic for a given cost matrix, which keeps
//! collision-resolution passes reproducible.

/// Balanced assignment of `n` items to `k` codebook entries.
///
/// `dists` is the row-major `n × k` squared-distance matrix. Returns one
/// chosen entry per item (row argmax of the final transport plan).
pub fn balanced_assign(dists: &[f32], n: usize, k: usize, epsilon: f32, iters: usize) -> Vec<u32> {
    debug_assert_eq!(dists.len(), n * k);
    debug_assert!(epsilon > 0.0, "Balanced assignment requires epsilon > 0");

    // Gibbs kernel per row, shifted by the row minimum so exp() stays in
    // range. The shift multiplies the row by a constant, which the row
    // scaling absorbs.
    let mut q = vec![0.0f64; n * k];
    for i in 0..n {
        let row = &dists[i * k..(i + 1) * k];
        let min = row.iter().copied().fold(f32::MAX, f32::min);
        for j in 0..k {
            q[i * k + j] = (-((row[j] - min) as f64) / epsilon as f64).exp();
        }
    }

    let row_mass = 1.0 / n as f64;
    let col_mass = 1.0 / k as f64;

    let mut col_sums = vec![0.0f64; k];
    for _ in 0..iters {
        // Scale columns to uniform codebook mass
        col_sums.iter_mut().for_each(|s| *s = 0.0);
        for i in 0..n {
            for j in 0..k {
                col_sums[j] += q[i * k + j];
            }
        }
        for i in 0..n {
            for j in 0..k {
                if col_sums[j] > 0.0 {
                    q[i * k + j] *= col_mass / col_sums[j];
                }
            }
        }

        // Scale rows to uniform item mass
        for i in 0..n {
            let row = &mut q[i * k..(i + 1) * k];
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                let scale = row_mass / sum;
                row.iter_mut().for_each(|v| *v *= scale);
            }
        }
    }

    // Row argmax. Row scaling is uniform within a row, so the argmax reflects
    // the last column balancing step.
    (0..n)
        .map(|i| {
            let row = &q[i * k..(i + 1) * k];
            let mut best = 0usize;
            let mut best_val = f64::MIN;
            for (j, &v) in row.iter().enumerate() {
                if v > best_val {
                    best_val = v;
                    best = j;
                }
            }
            best as u32
        })
        .collect()
}
