//! Catalog-wide collision resolution
//!
//! After training, every item gets a deterministic code; items that share a
//! full code are regrouped and re-encoded with balanced assignment enabled on
//! the last level only, up to a bounded number of passes. Earlier levels are
//! forced cold so the coarse prefix of every item stays put; only the finest
//! level trades nearest-match accuracy for separation.
//!
//! Termination is bounded by `max_sk_iters` regardless of outcome. A
//! non-zero final collision rate is a reported terminal state, not an error.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use crate::rvq::{Code, ResidualQuantizer};
use crate::semantic_id;
use crate::store::EmbeddingStore;

#[derive(Debug, Clone, Copy)]
pub struct CollisionConfig {
    /// Sinkhorn temperature applied to the last level if it is cold
    pub sk_epsilon_last: f32,
    /// Maximum re-encoding passes
    pub max_sk_iters: usize,
    /// Encoding batch size for the deterministic first pass
    pub batch_size: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            sk_epsilon_last: 0.003,
            max_sk_iters: 20,
            batch_size: 64,
        }
    }
}

/// Terminal statistics of one resolution run
#[derive(Debug, Clone, Copy)]
pub struct CollisionReport {
    pub total_items: usize,
    pub distinct_codes: usize,
    /// (total_items − distinct_codes) / total_items
    pub collision_rate: f32,
    /// Largest number of items sharing any single code
    pub max_duplicates: usize,
    pub iterations_run: usize,
    /// Whether every item ended with a unique code
    pub converged: bool,
}

/// Group item indices by identical code, keeping only groups of two or more.
/// Groups come back sorted by their first item for reproducible pass order.
fn collision_groups(codes: &[Code]) -> Vec<Vec<usize>> {
    let mut by_code: HashMap<&Code, Vec<usize>> = HashMap::new();
    for (item, code) in codes.iter().enumerate() {
        by_code.entry(code).or_default().push(item);
    }

    let mut groups: Vec<Vec<usize>> = by_code
        .into_values()
        .filter(|items| items.len() > 1)
        .collect();
    groups.sort_by_key(|items| items[0]);
    groups
}

fn report_for(codes: &[Code], iterations_run: usize) -> CollisionReport {
    let mut counts: HashMap<&Code, usize> = HashMap::new();
    for code in codes {
        *counts.entry(code).or_default() += 1;
    }

    let total_items = codes.len();
    let distinct_codes = counts.len();
    let max_duplicates = counts.values().copied().max().unwrap_or(0);

    CollisionReport {
        total_items,
        distinct_codes,
        collision_rate: (total_items - distinct_codes) as f32 / total_items as f32,
        max_duplicates,
        iterations_run,
        converged: distinct_codes == total_items,
    }
}

/// Assign one code per catalog item, minimizing duplicates within the
/// iteration budget.
///
/// Forces the exploration profile onto the stack: every level except the
/// last goes cold, and the last level receives `sk_epsilon_last` if it was
/// cold, keeping the prefix assignments deterministic across passes.
pub fn resolve(
    rvq: &mut ResidualQuantizer,
    store: &EmbeddingStore,
    config: &CollisionConfig,
) -> (Vec<Code>, CollisionReport) {
    let num_levels = rvq.num_levels();
    for level in rvq.levels.iter_mut().take(num_levels - 1) {
        level.sk_epsilon = 0.0;
    }
    if let Some(last) = rvq.levels.last_mut() {
        if last.sk_epsilon == 0.0 {
            last.sk_epsilon = config.sk_epsilon_last;
        }
    }

    // Deterministic first pass over the whole catalog.
    let mut codes: Vec<Code> = Vec::with_capacity(store.count);
    let mut start = 0usize;
    while start < store.count {
        let end = (start + config.batch_size).min(store.count);
        let batch: Vec<f32> = (start..end)
            .flat_map(|i| store.get(i).iter().copied())
            .collect();
        codes.extend(rvq.encode_batch(&batch, false));
        start = end;
    }

    let mut iterations_run = 0usize;
    for _ in 0..config.max_sk_iters {
        let groups = collision_groups(&codes);
        if groups.is_empty() {
            break;
        }
        iterations_run += 1;
        tracing::info!(
            pass = iterations_run,
            groups = groups.len(),
            "re-encoding collision groups"
        );

        for items in &groups {
            let batch = store.gather(items);
            let reassigned = rvq.encode_batch(&batch, true);
            for (&item, code) in items.iter().zip(reassigned) {
                codes[item] = code;
            }
        }
    }

    let report = report_for(&codes, iterations_run);
    tracing::info!(
        collision_rate = report.collision_rate,
        max_duplicates = report.max_duplicates,
        converged = report.converged,
        "collision resolution finished"
    );

    (codes, report)
}

/// Persist the generated index: item position → ordered level tags, as JSON.
pub fn write_index<P: AsRef<Path>>(path: P, codes: &[Code]) -> io::Result<()> {
    let mut index = serde_json::Map::with_capacity(codes.len());
    for (item, code) in codes.iter().enumerate() {
        let tags: Vec<serde_json::Value> = semantic_id::render_tags(code)
            .into_iter()
            .map(serde_json::Value::String)
            .collect();
        index.insert(item.to_string(), serde_json::Value::Array(tags));
    }

    let file = std::fs::File::create(path)?;
    serde_json::to_writer(io::BufWriter::new(file), &serde_json::Value::Object(index))?;
    Ok(())
}
