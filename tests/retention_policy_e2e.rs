//! Retention policy end-to-end: real checkpoint files flowing through the
//! bounded pool, verified against the dual-container reconciliation rule.

use std::path::PathBuf;

use semid_core::checkpoint::Checkpoint;
use semid_core::retention::{BestSlots, RetentionPool};
use semid_core::rvq::{ResidualQuantizer, RvqConfig};
use tempfile::TempDir;

fn write_checkpoint(dir: &TempDir, name: &str, epoch: u32, collision_rate: f32) -> PathBuf {
    let rvq = ResidualQuantizer::new(RvqConfig::uniform(4, 2, 4), epoch as u64);
    let ckpt = Checkpoint::from_quantizer(&rvq, epoch, 1.0, collision_rate, None);
    let path = dir.path().join(name);
    ckpt.save(&path).unwrap();
    path
}

#[test]
fn test_blended_retention_at_capacity_three() {
    // Five observations, capacity 3, metrics in submission order.
    let dir = TempDir::new().unwrap();
    let metrics = [0.40f32, 0.35, 0.50, 0.20, 0.30];
    let mut pool = RetentionPool::new(3);

    let paths: Vec<PathBuf> = metrics
        .iter()
        .enumerate()
        .map(|(i, &rate)| write_checkpoint(&dir, &format!("epoch_{i}_model.ckpt"), i as u32, rate))
        .collect();

    let mut deleted = Vec::new();
    for (path, &metric) in paths.iter().zip(&metrics) {
        deleted.extend(pool.observe(metric, path.clone()).unwrap());
        // The bounded containers never exceed capacity.
        assert!(pool.heap_len() <= 3);
        assert!(pool.queue_len() <= 3);
    }

    // The best-set converges on the three lowest metrics.
    assert_eq!(pool.heap_metrics(), vec![0.20, 0.30, 0.35]);

    // 0.40 is the only checkpoint orphaned by both containers. 0.50 is
    // higher-metric but recent, so the recency rule forces its retention.
    assert_eq!(deleted, vec![paths[0].clone()]);
    assert!(!paths[0].exists());
    for path in &paths[1..] {
        assert!(path.exists(), "{path:?} must survive");
    }

    // Every surviving file is still a loadable checkpoint.
    for path in &paths[1..] {
        Checkpoint::load(path).unwrap();
    }
}

#[test]
fn test_monotonically_improving_stream() {
    // Strictly improving metrics: the FIFO and the heap agree at every step,
    // so exactly one file is deleted per observation past capacity.
    let dir = TempDir::new().unwrap();
    let mut pool = RetentionPool::new(2);

    let paths: Vec<PathBuf> = (0..5)
        .map(|i| write_checkpoint(&dir, &format!("run_{i}.ckpt"), i, 0.5 - i as f32 * 0.1))
        .collect();

    for (i, path) in paths.iter().enumerate() {
        pool.observe(0.5 - i as f32 * 0.1, path.clone()).unwrap();
    }

    assert!(!paths[0].exists());
    assert!(!paths[1].exists());
    assert!(!paths[2].exists());
    assert!(paths[3].exists());
    assert!(paths[4].exists());
}

#[test]
fn test_best_slots_reflect_true_minima_over_stream() {
    let dir = TempDir::new().unwrap();
    let mut slots = BestSlots::new(dir.path());

    let losses = [3.0f32, 2.5, 2.7, 2.1, 2.1, 2.4];
    let rates = [0.9f32, 0.7, 0.8, 0.3, 0.3, 0.5];

    let mut loss_writes = 0;
    let mut rate_writes = 0;
    for (&loss, &rate) in losses.iter().zip(&rates) {
        if slots.loss_improved(loss).is_some() {
            loss_writes += 1;
        }
        if slots.collision_improved(rate).is_some() {
            rate_writes += 1;
        }
    }

    // Slots only ever move to strict improvements.
    assert_eq!(slots.best_loss, 2.1);
    assert_eq!(slots.best_collision_rate, 0.3);
    assert_eq!(loss_writes, 3);
    assert_eq!(rate_writes, 3);
}
