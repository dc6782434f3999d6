//! Memory-mapped embedding storage
//!
//! Read-only, zero-copy access to the catalog embedding matrix stored in a
//! .semb file, using the OS page cache. The store is the single source of
//! truth for item order: item `i` is row `i`.
//!
//! # Safety
//!
//! Byte-to-float conversion goes through `bytemuck::cast_slice` with alignment
//! checks, avoiding unaligned-access crashes on ARM.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::format::{EmbHeader, FormatError, HEADER_SIZE};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Item index out of bounds: {index} >= {count}")]
    IndexOutOfBounds { index: usize, count: usize },

    #[error("Alignment error: byte slice not aligned to f32 (4 bytes)")]
    AlignmentError,
}

/// Memory-mapped embedding store providing zero-copy access to .semb files
pub struct EmbeddingStore {
    mmap: Mmap,
    /// Number of items in the catalog
    pub count: usize,
    /// Dimensionality of each embedding
    pub dim: usize,
}

impl EmbeddingStore {
    /// Open a .semb file for reading
    ///
    /// Memory mapping is inherently unsafe: if the file is truncated while
    /// mapped, reads may SIGBUS. The file must not be modified while the
    /// store is open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header = EmbHeader::from_bytes(&mmap)?;

        let expected_size = header.file_size();
        if mmap.len() < expected_size {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "File truncated: expected {} bytes, got {}",
                    expected_size,
                    mmap.len()
                ),
            )));
        }

        Ok(Self {
            mmap,
            count: header.count as usize,
            dim: header.dim as usize,
        })
    }

    /// Get an embedding by item index with zero-copy access
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds. Use `try_get` for a
    /// non-panicking version.
    #[inline]
    pub fn get(&self, index: usize) -> &[f32] {
        self.try_get(index).expect("Embedding access failed")
    }

    /// Try to get an embedding by item index
    pub fn try_get(&self, index: usize) -> Result<&[f32], StoreError> {
        if index >= self.count {
            return Err(StoreError::IndexOutOfBounds {
                index,
                count: self.count,
            });
        }

        let start = HEADER_SIZE + (index * self.dim * std::mem::size_of::<f32>());
        let end = start + (self.dim * std::mem::size_of::<f32>());
        let bytes = &self.mmap[start..end];

        bytemuck::try_cast_slice(bytes).map_err(|_| StoreError::AlignmentError)
    }

    /// Total memory footprint of the mapped file
    pub fn memory_bytes(&self) -> usize {
        self.mmap.len()
    }

    /// Iterator over all embeddings in item order
    pub fn iter(&self) -> EmbeddingIter<'_> {
        EmbeddingIter {
            store: self,
            index: 0,
        }
    }

    /// Copy the rows named by `items` into one flattened row-major buffer.
    ///
    /// Used to assemble collision-group batches for re-encoding.
    pub fn gather(&self, items: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(items.len() * self.dim);
        for &item in items {
            out.extend_from_slice(self.get(item));
        }
        out
    }
}

/// Iterator over embeddings in the store
pub struct EmbeddingIter<'a> {
    store: &'a EmbeddingStore,
    index: usize,
}

impl<'a> Iterator for EmbeddingIter<'a> {
    type Item = &'a [f32];

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.store.count {
            return None;
        }
        let row = self.store.get(self.index);
        self.index += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.store.count - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for EmbeddingIter<'a> {}
