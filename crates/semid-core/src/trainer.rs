//! Training orchestration
//!
//! Drives the epoch loop over the quantization stack: forward pass,
//! closed-form codebook gradients, clipped optimizer step, scheduler step.
//! Every `eval_step` epochs the validation collector runs and checkpoints
//! flow to the retention pool; the two fixed best-by-criterion slots update
//! whenever their running minimum improves.
//!
//! A non-finite loss aborts the run immediately. Everything else (I/O)
//! propagates to the caller unmodified; there are no internal retries.

use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::loader;
use crate::math;
use crate::metrics::{self, MetricsSink, TrainEpochMetrics};
use crate::optim::{LrSchedule, Optimizer, OptimizerKind, ScheduleKind};
use crate::retention::{BestSlots, RetentionPool};
use crate::rvq::ResidualQuantizer;
use crate::store::EmbeddingStore;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Training loss is not finite (epoch {epoch}, batch {batch})")]
    NonFiniteLoss { epoch: usize, batch: usize },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Orchestrator hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub weight_decay: f32,
    pub optimizer: OptimizerKind,
    pub schedule: ScheduleKind,
    /// Warmup length in epochs; converted to steps once the batch count is known
    pub warmup_epochs: usize,
    pub grad_clip_norm: f32,
    /// Validate every `eval_step` epochs
    pub eval_step: usize,
    /// Retention pool capacity `K`
    pub save_limit: usize,
    /// Stop after this many consecutive validations without a collision-rate
    /// improvement; `None` disables early stopping
    pub patience: Option<usize>,
    pub shuffle: bool,
    pub seed: u64,
    /// Batches assembled ahead of the optimizer step
    pub prefetch_batches: usize,
    pub ckpt_dir: PathBuf,
}

impl TrainerConfig {
    pub fn new(ckpt_dir: PathBuf) -> Self {
        Self {
            epochs: 100,
            batch_size: 64,
            lr: 1e-3,
            weight_decay: 1e-4,
            optimizer: OptimizerKind::AdamW,
            schedule: ScheduleKind::Linear,
            warmup_epochs: 5,
            grad_clip_norm: 1.0,
            eval_step: 5,
            save_limit: 5,
            patience: None,
            shuffle: true,
            seed: 2023,
            prefetch_batches: 4,
            ckpt_dir,
        }
    }
}

/// Outcome of one `fit` run
#[derive(Debug, Clone, Copy)]
pub struct FitSummary {
    pub epochs_run: usize,
    pub best_loss: f32,
    pub best_collision_rate: f32,
    pub stopped_early: bool,
}

pub struct Trainer {
    pub config: TrainerConfig,
    pub rvq: ResidualQuantizer,
    optimizer: Optimizer,
    pool: RetentionPool,
    slots: BestSlots,
    global_step: u64,
}

impl Trainer {
    pub fn new(rvq: ResidualQuantizer, config: TrainerConfig) -> Self {
        let optimizer = Optimizer::new(
            config.optimizer,
            rvq.config.param_len(),
            config.weight_decay,
        );
        let pool = RetentionPool::new(config.save_limit);
        let slots = BestSlots::new(&config.ckpt_dir);
        Self {
            config,
            rvq,
            optimizer,
            pool,
            slots,
            global_step: 0,
        }
    }

    /// Consume the trainer, yielding the fitted stack
    pub fn into_quantizer(self) -> ResidualQuantizer {
        self.rvq
    }

    pub fn best_loss(&self) -> f32 {
        self.slots.best_loss
    }

    pub fn best_collision_rate(&self) -> f32 {
        self.slots.best_collision_rate
    }

    fn snapshot(&self, epoch: usize) -> Checkpoint {
        Checkpoint::from_quantizer(
            &self.rvq,
            epoch as u32,
            self.slots.best_loss,
            self.slots.best_collision_rate,
            Some(self.optimizer.state()),
        )
    }

    /// Run the configured number of epochs over the store.
    ///
    /// The same store serves as validation set, matching the offline
    /// catalog-compression setting where the training data is the catalog.
    pub fn fit(
        &mut self,
        store: &Arc<EmbeddingStore>,
        sink: &mut dyn MetricsSink,
    ) -> Result<FitSummary, TrainError> {
        std::fs::create_dir_all(&self.config.ckpt_dir)?;

        let n = store.count;
        let num_batches = n.div_ceil(self.config.batch_size) as u64;
        let schedule = LrSchedule::new(
            self.config.schedule,
            self.config.warmup_epochs as u64 * num_batches,
            self.config.epochs as u64 * num_batches,
        );
        let eval_step = self.config.eval_step.clamp(1, self.config.epochs.max(1));

        if self.rvq.config.kmeans_init {
            let data: Vec<f32> = store.iter().flat_map(|row| row.iter().copied()).collect();
            let iters = self.rvq.config.kmeans_iters;
            let seed = self.config.seed;
            self.rvq.kmeans_init(&data, iters, seed);
            tracing::info!("Seeded codebooks with k-means over {} items", n);
        }

        let mut stale_evals = 0usize;
        let mut stopped_early = false;
        let mut epochs_run = 0usize;

        for epoch in 0..self.config.epochs {
            epochs_run = epoch + 1;

            let mut order: Vec<usize> = (0..n).collect();
            if self.config.shuffle {
                let mut rng =
                    rand::rngs::StdRng::seed_from_u64(self.config.seed ^ epoch as u64);
                order.shuffle(&mut rng);
            }

            let stream = loader::stream_batches(
                store.clone(),
                order,
                self.config.batch_size,
                self.config.prefetch_batches,
            );

            let mut total_loss = 0.0f32;
            let mut total_recon = 0.0f32;
            let mut last_lr = 0.0f32;
            let mut last_grad_norm = 0.0f32;

            for batch in stream {
                let fwd = self.rvq.forward(&batch.data);
                if !fwd.total_loss.is_finite() {
                    return Err(TrainError::NonFiniteLoss {
                        epoch,
                        batch: batch.index,
                    });
                }

                let mut grads = self.rvq.codebook_grads(&fwd);
                last_grad_norm = math::clip_global_norm(&mut grads, self.config.grad_clip_norm);

                let lr = schedule.lr_at(self.config.lr, self.global_step);
                self.optimizer.begin_step();
                let mut offset = 0usize;
                for (level, grad) in self.rvq.levels.iter_mut().zip(&grads) {
                    self.optimizer.update(offset, &mut level.vectors, grad, lr);
                    offset += level.n_e * level.dim;
                }
                self.global_step += 1;
                last_lr = lr;

                total_loss += fwd.total_loss;
                total_recon += fwd.recon_loss;
            }

            sink.train_epoch(&TrainEpochMetrics {
                epoch,
                total_loss,
                recon_loss: total_recon,
                quant_loss: total_loss - total_recon,
                lr: last_lr,
                grad_norm: last_grad_norm,
            });
            tracing::info!(epoch, total_loss, recon_loss = total_recon, "epoch complete");

            // The best-loss slot tracks every epoch, not just validation ones.
            if let Some(path) = self.slots.loss_improved(total_loss).map(PathBuf::from) {
                self.snapshot(epoch).save(&path)?;
                tracing::info!(epoch, total_loss, "new best loss, slot updated");
            }

            if (epoch + 1) % eval_step != 0 {
                continue;
            }

            let report = metrics::collect(&self.rvq, store, self.config.batch_size);
            let collision_rate = report.collision_rate;
            sink.validation(
                epoch,
                &report,
                self.slots.best_collision_rate.min(collision_rate),
            );
            tracing::info!(epoch, collision_rate, "validation complete");

            if let Some(path) = self.slots.collision_improved(collision_rate).map(PathBuf::from) {
                self.snapshot(epoch).save(&path)?;
                stale_evals = 0;
                tracing::info!(epoch, collision_rate, "new best collision rate, slot updated");
            } else {
                stale_evals += 1;
            }

            let epoch_path = self.config.ckpt_dir.join(format!(
                "epoch_{}_collision_{:.4}_model.ckpt",
                epoch, collision_rate
            ));
            self.snapshot(epoch).save(&epoch_path)?;
            self.pool.observe(collision_rate, epoch_path)?;

            if let Some(patience) = self.config.patience {
                if stale_evals >= patience {
                    stopped_early = true;
                    tracing::info!(
                        epoch,
                        stale_evals,
                        "collision rate stale beyond patience, stopping"
                    );
                    break;
                }
            }
        }

        Ok(FitSummary {
            epochs_run,
            best_loss: self.slots.best_loss,
            best_collision_rate: self.slots.best_collision_rate,
            stopped_early,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{BEST_COLLISION_FILE, BEST_LOSS_FILE};
    use crate::format::EmbWriter;
    use crate::metrics::NoopMetrics;
    use crate::rvq::RvqConfig;
    use rand::Rng;
    use tempfile::{tempdir, TempDir};

    fn clustered_store(dir: &TempDir, n: usize, dim: usize, seed: u64) -> Arc<EmbeddingStore> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let path = dir.path().join("train.semb");
        let mut writer = EmbWriter::new(&path, dim).unwrap();
        for i in 0..n {
            let center = (i % 4) as f32;
            let row: Vec<f32> = (0..dim)
                .map(|_| center + rng.gen::<f32>() * 0.1)
                .collect();
            writer.write_embedding(&row).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(EmbeddingStore::open(&path).unwrap())
    }

    fn small_config(dir: &TempDir) -> TrainerConfig {
        let mut config = TrainerConfig::new(dir.path().join("ckpt"));
        config.epochs = 6;
        config.batch_size = 16;
        config.eval_step = 2;
        config.save_limit = 2;
        config.warmup_epochs = 1;
        config.lr = 5e-2;
        config.optimizer = OptimizerKind::Adam;
        config
    }

    #[test]
    fn test_fit_reduces_loss() {
        let dir = tempdir().unwrap();
        let store = clustered_store(&dir, 64, 8, 3);
        let rvq = ResidualQuantizer::new(RvqConfig::uniform(8, 2, 8), 42);

        let first_epoch_loss = {
            let fwd = rvq.forward(&store.gather(&(0..64).collect::<Vec<_>>()));
            fwd.total_loss
        };

        let mut trainer = Trainer::new(rvq, small_config(&dir));
        let summary = trainer.fit(&store, &mut NoopMetrics).unwrap();

        assert_eq!(summary.epochs_run, 6);
        let final_loss = trainer
            .rvq
            .forward(&store.gather(&(0..64).collect::<Vec<_>>()))
            .total_loss;
        assert!(
            final_loss < first_epoch_loss,
            "loss should drop: {} -> {}",
            first_epoch_loss,
            final_loss
        );
    }

    #[test]
    fn test_best_slots_written() {
        let dir = tempdir().unwrap();
        let store = clustered_store(&dir, 32, 4, 5);
        let rvq = ResidualQuantizer::new(RvqConfig::uniform(4, 2, 4), 42);

        let config = small_config(&dir);
        let ckpt_dir = config.ckpt_dir.clone();
        let mut trainer = Trainer::new(rvq, config);
        trainer.fit(&store, &mut NoopMetrics).unwrap();

        assert!(ckpt_dir.join(BEST_LOSS_FILE).exists());
        assert!(ckpt_dir.join(BEST_COLLISION_FILE).exists());

        let best = Checkpoint::load(ckpt_dir.join(BEST_COLLISION_FILE)).unwrap();
        assert!((best.best_collision_rate - trainer.best_collision_rate()).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_loss_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.semb");
        let mut writer = EmbWriter::new(&path, 4).unwrap();
        writer.write_embedding(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        writer.write_embedding(&[f32::NAN, 0.0, 0.0, 0.0]).unwrap();
        writer.finish().unwrap();
        let store = Arc::new(EmbeddingStore::open(&path).unwrap());

        let rvq = ResidualQuantizer::new(RvqConfig::uniform(4, 2, 4), 42);
        let mut config = small_config(&dir);
        config.shuffle = false;
        let mut trainer = Trainer::new(rvq, config);

        let result = trainer.fit(&store, &mut NoopMetrics);
        assert!(matches!(
            result,
            Err(TrainError::NonFiniteLoss { epoch: 0, .. })
        ));
    }

    #[test]
    fn test_patience_stops_stale_run() {
        let dir = tempdir().unwrap();
        let store = clustered_store(&dir, 32, 4, 7);
        let rvq = ResidualQuantizer::new(RvqConfig::uniform(4, 2, 4), 42);

        let mut config = small_config(&dir);
        // Frozen parameters: the collision rate improves once (from the
        // initial infinity) and then never again.
        config.lr = 0.0;
        config.epochs = 10;
        config.eval_step = 1;
        config.patience = Some(2);
        let mut trainer = Trainer::new(rvq, config);

        let summary = trainer.fit(&store, &mut NoopMetrics).unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.epochs_run, 3);
    }

    #[test]
    fn test_retention_bound_holds() {
        let dir = tempdir().unwrap();
        let store = clustered_store(&dir, 32, 4, 11);
        let rvq = ResidualQuantizer::new(RvqConfig::uniform(4, 2, 4), 42);

        let mut config = small_config(&dir);
        config.epochs = 12;
        config.eval_step = 1;
        config.save_limit = 3;
        let ckpt_dir = config.ckpt_dir.clone();
        let mut trainer = Trainer::new(rvq, config);
        trainer.fit(&store, &mut NoopMetrics).unwrap();

        let epoch_files: Vec<_> = std::fs::read_dir(&ckpt_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("epoch_"))
            .collect();
        // Union of heap and queue can exceed K only while they disagree;
        // with 12 observations and K=3 it stays within 2K.
        assert!(
            epoch_files.len() <= 6,
            "too many retained epoch checkpoints: {:?}",
            epoch_files
        );
    }
}
