//! .semb Binary Embedding File Format
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "SEMBED01"
//! 0x08     4       u32 LE      N: Number of embeddings
//! 0x0C     4       u32 LE      D: Embedding dimension
//! 0x10     N*D*4   [f32]       Embedding data (Little Endian)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut writer = EmbWriter::new("catalog.semb", 768)?;
//! writer.write_embedding(&vec![0.1f32; 768])?;
//! writer.finish()?;
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying a .semb file: "SEMBED01"
pub const MAGIC: [u8; 8] = *b"SEMBED01";

/// Header size in bytes: 8 (magic) + 4 (count) + 4 (dim) = 16
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected SEMBED01")]
    InvalidMagic,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed .semb file header
#[derive(Debug, Clone, Copy)]
pub struct EmbHeader {
    pub count: u32,
    pub dim: u32,
}

impl EmbHeader {
    /// Parse header from raw bytes (first 16 bytes of file)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "File too small for header",
            )));
        }

        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let dim = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        Ok(Self { count, dim })
    }

    /// Write header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dim.to_le_bytes());
        buf
    }

    /// Calculate byte offset for an embedding by item index
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        HEADER_SIZE + (index * self.dim as usize * std::mem::size_of::<f32>())
    }

    /// Calculate total file size
    pub fn file_size(&self) -> usize {
        HEADER_SIZE + (self.count as usize * self.dim as usize * std::mem::size_of::<f32>())
    }
}

/// Writer for creating .semb files
pub struct EmbWriter {
    writer: BufWriter<File>,
    dim: usize,
    count: u32,
}

impl EmbWriter {
    /// Create a new .semb file writer
    pub fn new<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        // Write placeholder header (count is back-patched in finish())
        let header = EmbHeader {
            count: 0,
            dim: dim as u32,
        };
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            dim,
            count: 0,
        })
    }

    /// Write a single embedding to the file
    pub fn write_embedding(&mut self, embedding: &[f32]) -> Result<(), FormatError> {
        if embedding.len() != self.dim {
            return Err(FormatError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.len(),
            });
        }

        for &val in embedding {
            self.writer.write_all(&val.to_le_bytes())?;
        }

        self.count += 1;
        Ok(())
    }

    /// Finalize the file, updating the header with the actual count
    pub fn finish(mut self) -> Result<u32, FormatError> {
        use std::io::Seek;

        self.writer.flush()?;

        let file = self.writer.get_mut();
        file.seek(io::SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;

        Ok(self.count)
    }
}
