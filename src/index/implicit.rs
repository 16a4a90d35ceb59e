//! Indices that need no on-disk structure

use super::{ChunkLocation, IndexContext};
use crate::io::UNDEFINED_ADDRESS;
use crate::utils::linear_index;

/// The whole dataset is one chunk
#[derive(Debug, Clone)]
pub struct SingleChunkIndex {
    location: Option<ChunkLocation>,
}

impl SingleChunkIndex {
    pub(crate) fn new(address: u64, filtered: Option<(u64, u32)>, context: &IndexContext) -> Self {
        let location = (address != UNDEFINED_ADDRESS).then(|| {
            let (stored_size, filter_mask) = filtered.unwrap_or((context.chunk_byte_size, 0));
            ChunkLocation {
                address,
                stored_size,
                filter_mask,
            }
        });

        Self { location }
    }

    pub fn lookup(&self, scaled: &[u64]) -> Option<ChunkLocation> {
        if scaled.iter().any(|&s| s != 0) {
            return None;
        }
        self.location
    }
}

/// Chunks laid out back to back in row-major order of the maximum grid
#[derive(Debug, Clone)]
pub struct ImplicitIndex {
    base: u64,
    context: IndexContext,
}

impl ImplicitIndex {
    pub(crate) fn new(base: u64, context: IndexContext) -> Self {
        Self { base, context }
    }

    pub fn lookup(&self, scaled: &[u64]) -> Option<ChunkLocation> {
        if self.base == UNDEFINED_ADDRESS {
            return None;
        }

        let index = linear_index(scaled, &self.context.down_max_chunk_counts);
        let address = self
            .base
            .checked_add(index.checked_mul(self.context.chunk_byte_size)?)?;

        Some(ChunkLocation {
            address,
            stored_size: self.context.chunk_byte_size,
            filter_mask: 0,
        })
    }
}
