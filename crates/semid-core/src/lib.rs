//! Semid Core – Residual quantization training, collision resolution, and
//! checkpoint retention for hierarchical semantic IDs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Training Orchestrator                     │
//! │   epochs · clipped optimizer steps · warmup LR schedules    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Residual Quantization Stack │  Checkpoint Retention        │
//! │  nearest / Sinkhorn assign   │  bounded heap + FIFO pool,   │
//! │  per-level codebooks         │  fixed best-loss/-collision  │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │  Collision Resolver → catalog-wide unique semantic IDs      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  EmbeddingStore (mmap zero-copy .semb) · prefetch loader    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod checkpoint;
pub mod collision;
pub mod format;
pub mod loader;
pub mod math;
pub mod metrics;
pub mod optim;
pub mod retention;
pub mod rvq;
pub mod semantic_id;
pub mod sinkhorn;
pub mod store;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use collision::{CollisionConfig, CollisionReport};
pub use retention::RetentionPool;
pub use rvq::{Code, ResidualQuantizer, RvqConfig};
pub use store::EmbeddingStore;
pub use trainer::{Trainer, TrainerConfig};
