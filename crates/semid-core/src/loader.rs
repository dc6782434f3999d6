//! Prefetching batch loader
//!
//! A single worker thread copies rows out of the memory-mapped store into
//! flattened batches ahead of the training loop, over a bounded channel.
//! One worker plus a FIFO channel means the orchestrator observes batches in
//! exactly the submitted order; the only effect of prefetch is overlap
//! between batch assembly and the optimizer step.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};

use crate::store::EmbeddingStore;

/// One training batch: row indices plus their flattened embeddings
pub struct Batch {
    /// Position of this batch within the epoch
    pub index: usize,
    /// Item indices, in batch row order
    pub items: Vec<usize>,
    /// Row-major `items.len() × dim` embedding data
    pub data: Vec<f32>,
}

/// Iterator over one epoch's prefetched batches
pub struct BatchStream {
    rx: Option<Receiver<Batch>>,
    worker: Option<JoinHandle<()>>,
}

/// Stream `order` through the store in `batch_size` chunks with up to
/// `prefetch` batches assembled ahead of the consumer.
pub fn stream_batches(
    store: Arc<EmbeddingStore>,
    order: Vec<usize>,
    batch_size: usize,
    prefetch: usize,
) -> BatchStream {
    assert!(batch_size > 0, "Batch size must be non-zero");
    let (tx, rx) = bounded(prefetch.max(1));

    let worker = std::thread::spawn(move || {
        for (index, chunk) in order.chunks(batch_size).enumerate() {
            let batch = Batch {
                index,
                items: chunk.to_vec(),
                data: store.gather(chunk),
            };
            // A closed receiver means the consumer stopped early; just exit.
            if tx.send(batch).is_err() {
                break;
            }
        }
    });

    BatchStream {
        rx: Some(rx),
        worker: Some(worker),
    }
}

impl Iterator for BatchStream {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Close the channel first so a blocked worker unblocks, then join.
        drop(self.rx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
