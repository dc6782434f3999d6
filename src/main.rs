//! Semid CLI
//!
//! Trains a residual quantizer over a catalog embedding file and generates
//! collision-resolved semantic IDs from a saved checkpoint.
//!
//! # Usage
//!
//! ```bash
//! # Convert a JSON array-of-arrays into the .semb binary format
//! semid ingest --input catalog.json --output catalog.semb
//!
//! # Train and checkpoint into an output directory
//! semid train --data catalog.semb --out-dir runs/catalog
//!
//! # Generate the semantic ID index from the best checkpoint
//! semid generate --ckpt runs/catalog/best_collision_model.ckpt \
//!     --data catalog.semb --output catalog.index.json
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use semid_core::collision::{self, CollisionConfig};
use semid_core::format::EmbWriter;
use semid_core::metrics::TracingMetrics;
use semid_core::optim::{OptimizerKind, ScheduleKind};
use semid_core::{Checkpoint, EmbeddingStore, ResidualQuantizer, RvqConfig, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(name = "semid")]
#[command(about = "Hierarchical semantic ID generation for recommendation catalogs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a .semb file from a JSON list of embeddings
    ///
    /// Input format: JSON array of arrays [[0.1, ...], [0.2, ...]]
    Ingest {
        /// Input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Output .semb file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Train a residual quantizer over a .semb catalog
    Train {
        /// Path to the .semb embedding file
        #[arg(short, long)]
        data: PathBuf,

        /// Checkpoint output directory
        #[arg(short, long)]
        out_dir: PathBuf,

        /// Number of training epochs
        #[arg(long, default_value = "100")]
        epochs: usize,

        /// Batch size
        #[arg(long, default_value = "64")]
        batch_size: usize,

        /// Base learning rate
        #[arg(long, default_value = "1e-3")]
        lr: f32,

        /// Weight decay
        #[arg(long, default_value = "1e-4")]
        weight_decay: f32,

        /// Optimizer: adam, adamw, or sgd
        #[arg(long, default_value = "adamw", value_parser = clap::value_parser!(OptimizerKind))]
        optimizer: OptimizerKind,

        /// LR schedule: linear or constant (both with warmup)
        #[arg(long, default_value = "linear", value_parser = clap::value_parser!(ScheduleKind))]
        schedule: ScheduleKind,

        /// Warmup length in epochs
        #[arg(long, default_value = "5")]
        warmup_epochs: usize,

        /// Validate every N epochs
        #[arg(long, default_value = "5")]
        eval_step: usize,

        /// Retention pool capacity
        #[arg(long, default_value = "5")]
        save_limit: usize,

        /// Stop after N stale validations (disabled when omitted)
        #[arg(long)]
        patience: Option<usize>,

        /// Per-level codebook sizes (comma separated)
        #[arg(long, default_value = "256,256,256", value_parser = parse_usize_list)]
        codebook_sizes: Vec<usize>,

        /// Per-level Sinkhorn epsilons (comma separated)
        #[arg(long, default_value = "0.0,0.0,0.003", value_parser = parse_f32_list)]
        sk_epsilons: Vec<f32>,

        /// Sinkhorn iterations per balanced assignment
        #[arg(long, default_value = "100")]
        sk_iters: usize,

        /// Commitment weight
        #[arg(long, default_value = "0.25")]
        beta: f32,

        /// Quantization loss weight
        #[arg(long, default_value = "1.0")]
        quant_loss_weight: f32,

        /// Seed codebooks with k-means before the first epoch
        #[arg(long)]
        kmeans_init: bool,

        /// Lloyd iterations for k-means seeding
        #[arg(long, default_value = "10")]
        kmeans_iters: usize,

        /// Random seed
        #[arg(long, default_value = "2023")]
        seed: u64,

        /// Disable per-epoch shuffling
        #[arg(long)]
        no_shuffle: bool,
    },

    /// Generate the collision-resolved semantic ID index from a checkpoint
    Generate {
        /// Path to a trained checkpoint
        #[arg(short, long)]
        ckpt: PathBuf,

        /// Path to the .semb embedding file
        #[arg(short, long)]
        data: PathBuf,

        /// Output index JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// Sinkhorn epsilon for the last level during resolution
        #[arg(long, default_value = "0.003")]
        sk_epsilon_last: f32,

        /// Maximum collision-resolution passes
        #[arg(long, default_value = "20")]
        max_sk_iters: usize,

        /// Encoding batch size
        #[arg(long, default_value = "64")]
        batch_size: usize,
    },

    /// Display statistics about a .semb file or a checkpoint
    Stats {
        /// Path to a .semb or .ckpt file
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn parse_usize_list(s: &str) -> Result<Vec<usize>, String> {
    s.split(',')
        .map(|part| part.trim().parse::<usize>().map_err(|e| e.to_string()))
        .collect()
}

fn parse_f32_list(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|part| part.trim().parse::<f32>().map_err(|e| e.to_string()))
        .collect()
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { input, output } => {
            let file = File::open(&input).with_context(|| format!("Opening {input:?}"))?;
            let embeddings: Vec<Vec<f32>> = serde_json::from_reader(BufReader::new(file))
                .context("Input must be a JSON array of float arrays")?;

            let Some(first) = embeddings.first() else {
                bail!("Input contains no embeddings");
            };
            let dim = first.len();

            let mut writer = EmbWriter::new(&output, dim)?;
            for embedding in &embeddings {
                writer.write_embedding(embedding)?;
            }
            let count = writer.finish()?;
            tracing::info!(
                "Wrote {} embeddings of dimension {} to {:?}",
                count,
                dim,
                output
            );
        }

        Commands::Train {
            data,
            out_dir,
            epochs,
            batch_size,
            lr,
            weight_decay,
            optimizer,
            schedule,
            warmup_epochs,
            eval_step,
            save_limit,
            patience,
            codebook_sizes,
            sk_epsilons,
            sk_iters,
            beta,
            quant_loss_weight,
            kmeans_init,
            kmeans_iters,
            seed,
            no_shuffle,
        } => {
            let store = Arc::new(EmbeddingStore::open(&data)?);
            tracing::info!(
                "Loaded {} embeddings of dimension {} from {:?}",
                store.count,
                store.dim,
                data
            );

            if codebook_sizes.len() != sk_epsilons.len() {
                bail!(
                    "--codebook-sizes has {} levels but --sk-epsilons has {}",
                    codebook_sizes.len(),
                    sk_epsilons.len()
                );
            }

            let rvq_config = RvqConfig {
                dim: store.dim,
                codebook_sizes,
                sk_epsilons,
                sk_iters,
                beta,
                quant_loss_weight,
                kmeans_init,
                kmeans_iters,
            };
            let rvq = ResidualQuantizer::new(rvq_config, seed);

            let trainer_config = TrainerConfig {
                epochs,
                batch_size,
                lr,
                weight_decay,
                optimizer,
                schedule,
                warmup_epochs,
                grad_clip_norm: 1.0,
                eval_step,
                save_limit,
                patience,
                shuffle: !no_shuffle,
                seed,
                prefetch_batches: 4,
                ckpt_dir: out_dir,
            };

            let mut trainer = Trainer::new(rvq, trainer_config);
            let summary = trainer.fit(&store, &mut TracingMetrics)?;
            tracing::info!(
                "Training finished after {} epochs: best loss {:.4}, best collision rate {:.4}{}",
                summary.epochs_run,
                summary.best_loss,
                summary.best_collision_rate,
                if summary.stopped_early {
                    " (stopped early)"
                } else {
                    ""
                }
            );
        }

        Commands::Generate {
            ckpt,
            data,
            output,
            sk_epsilon_last,
            max_sk_iters,
            batch_size,
        } => {
            let checkpoint = Checkpoint::load(&ckpt)?;
            tracing::info!(
                "Loaded checkpoint from epoch {} (best collision rate {:.4})",
                checkpoint.epoch,
                checkpoint.best_collision_rate
            );

            let store = EmbeddingStore::open(&data)?;
            if store.dim != checkpoint.config.dim {
                bail!(
                    "Embedding dimension {} does not match checkpoint dimension {}",
                    store.dim,
                    checkpoint.config.dim
                );
            }

            let mut rvq = checkpoint.quantizer();
            let config = CollisionConfig {
                sk_epsilon_last,
                max_sk_iters,
                batch_size,
            };
            let (codes, report) = collision::resolve(&mut rvq, &store, &config);

            collision::write_index(&output, &codes)?;
            tracing::info!(
                "Indexed {} items: collision rate {:.4}, max conflicts {}, {} resolution passes{}",
                report.total_items,
                report.collision_rate,
                report.max_duplicates,
                report.iterations_run,
                if report.converged {
                    ""
                } else {
                    " (budget exhausted)"
                }
            );
            tracing::info!("Saved index to {:?}", output);
        }

        Commands::Stats { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Reading {file:?}"))?;
            if bytes.len() >= 8 && &bytes[0..8] == b"SEMBED01" {
                let store = EmbeddingStore::open(&file)?;
                println!("Format:       .semb embedding file");
                println!("Embeddings:   {}", store.count);
                println!("Dimension:    {}", store.dim);
                println!("File size:    {} bytes", store.memory_bytes());
            } else if bytes.len() >= 8 && &bytes[0..8] == b"SEMCKPT1" {
                let checkpoint = Checkpoint::load(&file)?;
                println!("Format:       semid checkpoint");
                println!("Epoch:        {}", checkpoint.epoch);
                println!("Best loss:    {:.6}", checkpoint.best_loss);
                println!("Best collision rate: {:.6}", checkpoint.best_collision_rate);
                println!("Dimension:    {}", checkpoint.config.dim);
                println!("Levels:       {:?}", checkpoint.config.codebook_sizes);
                println!("Sk epsilons:  {:?}", checkpoint.config.sk_epsilons);
                println!(
                    "Optimizer:    {}",
                    if checkpoint.optimizer.is_some() {
                        "present"
                    } else {
                        "absent"
                    }
                );
            } else {
                bail!("Unrecognized file format: {file:?}");
            }
        }
    }

    Ok(())
}
