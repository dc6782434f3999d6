//! Scalar vector math kernels
//!
//! Distance and norm primitives shared by quantization, k-means seeding, and
//! gradient clipping. All kernels are plain iterator chains that LLVM
//! auto-vectorizes with `-C target-cpu=native`; squared L2 is used throughout
//! because codebook search only needs ordering, never the root.

/// Squared L2 (Euclidean) distance: ||a - b||²
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Mean squared error over all elements: ||a - b||² / len
#[inline(always)]
pub fn mse(a: &[f32], b: &[f32]) -> f32 {
    debug_assert!(!a.is_empty());
    l2_distance_squared(a, b) / a.len() as f32
}

/// Index and squared distance of the nearest row in a flattened row-major
/// matrix `rows` (each row `dim` long) to the query vector.
pub fn nearest_row(query: &[f32], rows: &[f32], dim: usize) -> (usize, f32) {
    debug_assert_eq!(query.len(), dim);
    debug_assert_eq!(rows.len() % dim, 0);

    let mut best_idx = 0usize;
    let mut best_dist = f32::MAX;
    for (idx, row) in rows.chunks_exact(dim).enumerate() {
        let dist = l2_distance_squared(query, row);
        if dist < best_dist {
            best_dist = dist;
            best_idx = idx;
        }
    }
    (best_idx, best_dist)
}

/// Sum of squared elements
#[inline(always)]
pub fn sum_squares(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum()
}

/// Global L2 norm over a flat buffer.
pub fn global_norm(values: &[f32]) -> f32 {
    sum_squares(values).sqrt()
}

/// Scale per-level gradient buffers in place so their combined global norm
/// does not exceed `max_norm`. Returns the norm observed before clipping.
pub fn clip_global_norm(grads: &mut [Vec<f32>], max_norm: f32) -> f32 {
    let norm = grads.iter().map(|g| sum_squares(g)).sum::<f32>().sqrt();
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for level in grads.iter_mut() {
            for g in level.iter_mut() {
                *g *= scale;
            }
        }
    }
    norm
}
