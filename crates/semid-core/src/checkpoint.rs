//! Checkpoint artifact
//!
//! # File Structure
//!
//! ```text
//! Offset   Size       Description
//! ──────────────────────────────────────────────────
//! 0x00     8          Magic: "SEMCKPT1"
//! 0x08     4          u32 LE  Version (1)
//! 0x0C     4          u32 LE  Configuration JSON length
//! 0x10     var        RvqConfig as JSON
//!          4          u32 LE  Epoch
//!          4          f32 LE  Best loss so far
//!          4          f32 LE  Best collision rate so far
//!          4          u32 LE  Number of levels
//!          per level: u32 LE n_e, then n_e × dim f32 LE entries
//!          1          u8      Optimizer present flag
//!          if present: u8 kind, u64 LE step,
//!                      u32 LE len + f32 LE exp_avg,
//!                      u32 LE len + f32 LE exp_avg_sq
//! ```
//!
//! A checkpoint is independently loadable for inference-only code generation;
//! the optimizer section exists solely to resume training. Writes go to a
//! sibling temp file first and are renamed into place, so an interrupted run
//! never exposes a truncated checkpoint under the final name.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::optim::{OptimizerKind, OptimizerState};
use crate::rvq::{ResidualQuantizer, RvqConfig};

/// Magic bytes identifying a checkpoint file: "SEMCKPT1"
pub const MAGIC: [u8; 8] = *b"SEMCKPT1";

/// Fixed file name for the best-by-training-loss slot
pub const BEST_LOSS_FILE: &str = "best_loss_model.ckpt";

/// Fixed file name for the best-by-collision-rate slot
pub const BEST_COLLISION_FILE: &str = "best_collision_model.ckpt";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Invalid magic bytes: expected SEMCKPT1")]
    InvalidMagic,

    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    #[error("Configuration section: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A full training snapshot
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub config: RvqConfig,
    pub epoch: u32,
    pub best_loss: f32,
    pub best_collision_rate: f32,
    /// One flattened `[n_e][dim]` codebook per level
    pub codebooks: Vec<Vec<f32>>,
    /// Absent on inference-only loads or stripped artifacts
    pub optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    /// Snapshot the current state of a stack
    pub fn from_quantizer(
        rvq: &ResidualQuantizer,
        epoch: u32,
        best_loss: f32,
        best_collision_rate: f32,
        optimizer: Option<OptimizerState>,
    ) -> Self {
        Self {
            config: rvq.config.clone(),
            epoch,
            best_loss,
            best_collision_rate,
            codebooks: rvq.levels.iter().map(|l| l.vectors.clone()).collect(),
            optimizer,
        }
    }

    /// Rebuild the quantization stack this checkpoint describes
    pub fn quantizer(&self) -> ResidualQuantizer {
        ResidualQuantizer::from_codebooks(self.config.clone(), self.codebooks.clone())
    }

    /// Write the checkpoint atomically: serialize to a sibling temp file,
    /// fsync, then rename over the destination.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let tmp = path.with_extension("ckpt.tmp");

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            self.serialize(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), CheckpointError> {
        writer.write_all(&MAGIC)?;
        writer.write_all(&1u32.to_le_bytes())?;

        let config_json = serde_json::to_vec(&self.config)?;
        writer.write_all(&(config_json.len() as u32).to_le_bytes())?;
        writer.write_all(&config_json)?;

        writer.write_all(&self.epoch.to_le_bytes())?;
        writer.write_all(&self.best_loss.to_le_bytes())?;
        writer.write_all(&self.best_collision_rate.to_le_bytes())?;

        writer.write_all(&(self.codebooks.len() as u32).to_le_bytes())?;
        for (level, vectors) in self.codebooks.iter().enumerate() {
            let n_e = self.config.codebook_sizes[level];
            writer.write_all(&(n_e as u32).to_le_bytes())?;
            for &val in vectors {
                writer.write_all(&val.to_le_bytes())?;
            }
        }

        match &self.optimizer {
            None => writer.write_all(&[0u8])?,
            Some(state) => {
                writer.write_all(&[1u8])?;
                writer.write_all(&[optimizer_kind_tag(state.kind)])?;
                writer.write_all(&state.step.to_le_bytes())?;
                write_f32_section(writer, &state.exp_avg)?;
                write_f32_section(writer, &state.exp_avg_sq)?;
            }
        }

        Ok(())
    }

    /// Load a checkpoint from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let mut reader = io::BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(CheckpointError::InvalidMagic);
        }

        let version = read_u32(&mut reader)?;
        if version != 1 {
            return Err(CheckpointError::UnsupportedVersion(version));
        }

        let config_len = read_u32(&mut reader)? as usize;
        let mut config_json = vec![0u8; config_len];
        reader.read_exact(&mut config_json)?;
        let config: RvqConfig = serde_json::from_slice(&config_json)?;

        let epoch = read_u32(&mut reader)?;
        let best_loss = read_f32(&mut reader)?;
        let best_collision_rate = read_f32(&mut reader)?;

        let num_levels = read_u32(&mut reader)? as usize;
        if num_levels != config.num_levels() {
            return Err(CheckpointError::Corrupt(format!(
                "Level count {} disagrees with configuration {}",
                num_levels,
                config.num_levels()
            )));
        }

        let mut codebooks = Vec::with_capacity(num_levels);
        for level in 0..num_levels {
            let n_e = read_u32(&mut reader)? as usize;
            if n_e != config.codebook_sizes[level] {
                return Err(CheckpointError::Corrupt(format!(
                    "Level {} codebook size {} disagrees with configuration {}",
                    level, n_e, config.codebook_sizes[level]
                )));
            }
            codebooks.push(read_f32_vec(&mut reader, n_e * config.dim)?);
        }

        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let optimizer = if flag[0] == 0 {
            None
        } else {
            let mut kind_tag = [0u8; 1];
            reader.read_exact(&mut kind_tag)?;
            let kind = optimizer_kind_from_tag(kind_tag[0])?;
            let mut step_buf = [0u8; 8];
            reader.read_exact(&mut step_buf)?;
            let step = u64::from_le_bytes(step_buf);
            let exp_avg = read_f32_section(&mut reader)?;
            let exp_avg_sq = read_f32_section(&mut reader)?;
            Some(OptimizerState {
                kind,
                step,
                exp_avg,
                exp_avg_sq,
            })
        };

        Ok(Self {
            config,
            epoch,
            best_loss,
            best_collision_rate,
            codebooks,
            optimizer,
        })
    }
}

fn optimizer_kind_tag(kind: OptimizerKind) -> u8 {
    match kind {
        OptimizerKind::Adam => 0,
        OptimizerKind::AdamW => 1,
        OptimizerKind::Sgd => 2,
    }
}

fn optimizer_kind_from_tag(tag: u8) -> Result<OptimizerKind, CheckpointError> {
    match tag {
        0 => Ok(OptimizerKind::Adam),
        1 => Ok(OptimizerKind::AdamW),
        2 => Ok(OptimizerKind::Sgd),
        other => Err(CheckpointError::Corrupt(format!(
            "Unknown optimizer tag: {other}"
        ))),
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, CheckpointError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32, CheckpointError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f32_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<f32>, CheckpointError> {
    let mut bytes = vec![0u8; len * 4];
    reader.read_exact(&mut bytes)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_f32_section<W: Write>(writer: &mut W, values: &[f32]) -> Result<(), CheckpointError> {
    writer.write_all(&(values.len() as u32).to_le_bytes())?;
    for &val in values {
        writer.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

fn read_f32_section<R: Read>(reader: &mut R) -> Result<Vec<f32>, CheckpointError> {
    let len = read_u32(reader)? as usize;
    read_f32_vec(reader, len)
}
