//! Bounded checkpoint retention
//!
//! Keeps at most `K` periodic checkpoints on disk as a blend of
//! best-observed and most-recent: a max-heap whose root is the worst of the
//! retained-best set, and a fixed-capacity FIFO of arrival order. The two
//! containers are allowed to disagree for cycles — a checkpoint can be
//! recent-but-not-top-K or top-K-but-not-recent — and a file is deleted only
//! once it is absent from both ([`RetentionPool::reconcile`]).
//!
//! Two fixed slots (`best_loss_model.ckpt`, `best_collision_model.ckpt`) sit
//! outside the bounded pool and always track the true running minima; they
//! are overwritten in place and never evicted.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use crate::checkpoint::{BEST_COLLISION_FILE, BEST_LOSS_FILE};

/// One (quality metric, checkpoint path) observation; lower metric is better.
#[derive(Debug, Clone)]
pub struct RetentionRecord {
    pub metric: f32,
    pub path: PathBuf,
}

impl PartialEq for RetentionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.metric.to_bits() == other.metric.to_bits() && self.path == other.path
    }
}

impl Eq for RetentionRecord {}

impl Ord for RetentionRecord {
    /// Orders by metric so the max-heap root is the worst retained record.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.metric
            .total_cmp(&other.metric)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for RetentionRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded dual-criterion retention pool
pub struct RetentionPool {
    capacity: usize,
    heap: BinaryHeap<RetentionRecord>,
    queue: VecDeque<RetentionRecord>,
}

impl RetentionPool {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Retention capacity must be non-zero");
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
            queue: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Metrics currently in the best-set, ascending
    pub fn heap_metrics(&self) -> Vec<f32> {
        let mut metrics: Vec<f32> = self.heap.iter().map(|r| r.metric).collect();
        metrics.sort_by(f32::total_cmp);
        metrics
    }

    /// Union of paths still referenced by either container
    pub fn retained_paths(&self) -> HashSet<PathBuf> {
        self.heap
            .iter()
            .chain(self.queue.iter())
            .map(|r| r.path.clone())
            .collect()
    }

    fn contains(&self, record: &RetentionRecord) -> bool {
        self.queue.contains(record) || self.heap.iter().any(|r| r == record)
    }

    /// Delete the files of evicted records that no container references
    /// anymore. This is the single place retention removes files.
    fn reconcile(&self, evicted: Vec<RetentionRecord>) -> io::Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();
        for record in evicted {
            if self.contains(&record) || deleted.contains(&record.path) {
                continue;
            }
            std::fs::remove_file(&record.path)?;
            tracing::debug!("Evicted checkpoint {:?}", record.path);
            deleted.push(record.path);
        }
        Ok(deleted)
    }

    /// Submit one observation. Returns the files deleted as a consequence.
    ///
    /// Under capacity, the record simply joins both containers. At capacity,
    /// the oldest record leaves the FIFO; if the new metric strictly beats
    /// the heap's worst, that worst record leaves the heap. Each evicted
    /// record's file is removed only if the other container no longer holds
    /// it.
    pub fn observe(&mut self, metric: f32, path: PathBuf) -> io::Result<Vec<PathBuf>> {
        let record = RetentionRecord { metric, path };

        if self.queue.len() < self.capacity {
            self.queue.push_back(record.clone());
            self.heap.push(record);
            return Ok(Vec::new());
        }

        let mut evicted = Vec::new();

        let oldest = self.queue.pop_front().expect("capacity is non-zero");
        self.queue.push_back(record.clone());

        let worst = self.heap.peek().expect("heap fills with the queue");
        if record.metric < worst.metric {
            evicted.push(self.heap.pop().expect("heap is non-empty"));
            self.heap.push(record);
        }
        evicted.push(oldest);

        self.reconcile(evicted)
    }
}

/// The two fixed best-by-criterion slots
pub struct BestSlots {
    pub best_loss: f32,
    pub best_collision_rate: f32,
    best_loss_path: PathBuf,
    best_collision_path: PathBuf,
}

impl BestSlots {
    pub fn new(ckpt_dir: &Path) -> Self {
        Self {
            best_loss: f32::INFINITY,
            best_collision_rate: f32::INFINITY,
            best_loss_path: ckpt_dir.join(BEST_LOSS_FILE),
            best_collision_path: ckpt_dir.join(BEST_COLLISION_FILE),
        }
    }

    pub fn best_loss_path(&self) -> &Path {
        &self.best_loss_path
    }

    pub fn best_collision_path(&self) -> &Path {
        &self.best_collision_path
    }

    /// Record a training-loss observation; on a new global minimum, returns
    /// the slot path the caller must overwrite.
    pub fn loss_improved(&mut self, loss: f32) -> Option<&Path> {
        if loss < self.best_loss {
            self.best_loss = loss;
            Some(&self.best_loss_path)
        } else {
            None
        }
    }

    /// Record a collision-rate observation; on a new global minimum, returns
    /// the slot path the caller must overwrite.
    pub fn collision_improved(&mut self, rate: f32) -> Option<&Path> {
        if rate < self.best_collision_rate {
            self.best_collision_rate = rate;
            Some(&self.best_collision_path)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"ckpt").unwrap();
        path
    }

    #[test]
    fn test_under_capacity_keeps_everything() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(3);

        for (i, metric) in [0.4, 0.3].iter().enumerate() {
            let path = touch(&dir, &format!("ckpt_{i}"));
            let deleted = pool.observe(*metric, path).unwrap();
            assert!(deleted.is_empty());
        }
        assert_eq!(pool.heap_len(), 2);
        assert_eq!(pool.queue_len(), 2);
    }

    #[test]
    fn test_containers_never_exceed_capacity() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(2);

        for i in 0..10 {
            let path = touch(&dir, &format!("ckpt_{i}"));
            pool.observe(0.5 - i as f32 * 0.01, path).unwrap();
            assert!(pool.heap_len() <= 2);
            assert!(pool.queue_len() <= 2);
        }
    }

    #[test]
    fn test_worse_recent_entry_stays_out_of_heap() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(2);

        let p0 = touch(&dir, "ckpt_0");
        let p1 = touch(&dir, "ckpt_1");
        let p2 = touch(&dir, "ckpt_2");
        pool.observe(0.1, p0.clone()).unwrap();
        pool.observe(0.2, p1.clone()).unwrap();
        // Worse than the heap's worst: heap unchanged, FIFO rotates p0 out,
        // but p0 survives on disk through its heap membership.
        let deleted = pool.observe(0.9, p2.clone()).unwrap();

        assert!(deleted.is_empty());
        assert_eq!(pool.heap_metrics(), vec![0.1, 0.2]);
        assert!(p0.exists() && p1.exists() && p2.exists());
    }

    #[test]
    fn test_eviction_from_both_deletes_once() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(1);

        let p0 = touch(&dir, "ckpt_0");
        let p1 = touch(&dir, "ckpt_1");
        pool.observe(0.5, p0.clone()).unwrap();
        // p0 leaves the queue and the heap in the same observation; its file
        // must be removed exactly once.
        let deleted = pool.observe(0.3, p1.clone()).unwrap();

        assert_eq!(deleted, vec![p0.clone()]);
        assert!(!p0.exists());
        assert!(p1.exists());
    }

    #[test]
    fn test_delete_only_when_absent_from_both() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(3);

        let paths: Vec<PathBuf> = (0..5).map(|i| touch(&dir, &format!("ckpt_{i}"))).collect();
        let metrics = [0.40f32, 0.35, 0.50, 0.20, 0.30];

        let mut all_deleted = Vec::new();
        for (path, &metric) in paths.iter().zip(&metrics) {
            all_deleted.extend(pool.observe(metric, path.clone()).unwrap());
        }

        // Heap converges on the three lowest metrics.
        assert_eq!(pool.heap_metrics(), vec![0.20, 0.30, 0.35]);
        // ckpt_0 (0.40) is the only file orphaned by both containers;
        // ckpt_2 (0.50) survives through recency alone.
        assert_eq!(all_deleted, vec![paths[0].clone()]);
        assert!(!paths[0].exists());
        for path in &paths[1..] {
            assert!(path.exists(), "{path:?} should have been retained");
        }
    }

    #[test]
    fn test_retained_paths_union() {
        let dir = tempdir().unwrap();
        let mut pool = RetentionPool::new(2);

        let p0 = touch(&dir, "ckpt_0");
        let p1 = touch(&dir, "ckpt_1");
        let p2 = touch(&dir, "ckpt_2");
        pool.observe(0.1, p0.clone()).unwrap();
        pool.observe(0.2, p1.clone()).unwrap();
        pool.observe(0.9, p2.clone()).unwrap();

        let retained = pool.retained_paths();
        assert!(retained.contains(&p0));
        assert!(retained.contains(&p1));
        assert!(retained.contains(&p2));
    }

    #[test]
    fn test_best_slots_track_running_minima() {
        let dir = tempdir().unwrap();
        let mut slots = BestSlots::new(dir.path());

        assert!(slots.loss_improved(10.0).is_some());
        assert!(slots.loss_improved(12.0).is_none());
        assert!(slots.loss_improved(8.0).is_some());
        assert_eq!(slots.best_loss, 8.0);

        assert!(slots.collision_improved(0.5).is_some());
        assert!(slots.collision_improved(0.5).is_none());
        assert!(slots.collision_improved(0.2).is_some());
        assert_eq!(slots.best_collision_rate, 0.2);
    }

    #[test]
    fn test_best_slot_paths_are_fixed() {
        let dir = tempdir().unwrap();
        let slots = BestSlots::new(dir.path());
        assert_eq!(
            slots.best_loss_path(),
            dir.path().join("best_loss_model.ckpt")
        );
        assert_eq!(
            slots.best_collision_path(),
            dir.path().join("best_collision_model.ckpt")
        );
    }
}
