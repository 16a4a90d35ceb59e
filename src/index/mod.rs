//! Chunk indices: from scaled chunk coordinate to stored chunk location
//!
//! The variant is picked once when a dataset is opened, from the index
//! descriptor of its layout. Every variant answers the same question:
//! where does this chunk live, or was it never written?

mod btree1;
mod btree2;
mod extensible_array;
mod fixed_array;
mod implicit;

pub use btree1::BTree1Index;
pub use btree2::BTree2Index;
pub use extensible_array::ExtensibleArrayIndex;
pub use fixed_array::FixedArrayIndex;
pub use implicit::{ImplicitIndex, SingleChunkIndex};

use crate::error::{H5Error, Result};
use crate::io::{ByteSource, FieldReader, FormatContext, UNDEFINED_ADDRESS};
use crate::layout::{ChunkIndexDescriptor, DataLayout};
use crate::metadata::DatasetDescriptor;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Extensible array header signature
pub const EXTENSIBLE_ARRAY_HEADER: &[u8; 4] = b"EAHD";
/// Extensible array index block signature
pub const EXTENSIBLE_ARRAY_INDEX_BLOCK: &[u8; 4] = b"EAIB";
/// Extensible array secondary block signature
pub const EXTENSIBLE_ARRAY_SECONDARY_BLOCK: &[u8; 4] = b"EASB";
/// Extensible array data block signature
pub const EXTENSIBLE_ARRAY_DATA_BLOCK: &[u8; 4] = b"EADB";
/// Fixed array header signature
pub const FIXED_ARRAY_HEADER: &[u8; 4] = b"FAHD";
/// Fixed array data block signature
pub const FIXED_ARRAY_DATA_BLOCK: &[u8; 4] = b"FADB";
/// Version 1 B-tree node signature
pub const BTREE1_NODE: &[u8; 4] = b"TREE";
/// Version 2 B-tree header signature
pub const BTREE2_HEADER: &[u8; 4] = b"BTHD";
/// Version 2 B-tree internal node signature
pub const BTREE2_INTERNAL_NODE: &[u8; 4] = b"BTIN";
/// Version 2 B-tree leaf node signature
pub const BTREE2_LEAF_NODE: &[u8; 4] = b"BTLF";

/// Client id of array indices holding unfiltered chunk addresses
pub const CLIENT_UNFILTERED_CHUNKS: u8 = 0;
/// Client id of array indices holding filtered chunk records
pub const CLIENT_FILTERED_CHUNKS: u8 = 1;

/// Physical location of a stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    pub address: u64,
    /// Bytes on disk, after filtering
    pub stored_size: u64,
    /// Filters skipped for this chunk
    pub filter_mask: u32,
}

/// Shape information every index variant needs
#[derive(Debug, Clone)]
pub(crate) struct IndexContext {
    pub format: FormatContext,
    pub rank: usize,
    pub chunk_byte_size: u64,
    pub scaled_max_dims: Vec<u64>,
    pub down_max_chunk_counts: Vec<u64>,
    pub filtered: bool,
}

/// Chunk index of one dataset
#[derive(Debug)]
pub enum ChunkIndex {
    SingleChunk(SingleChunkIndex),
    Implicit(ImplicitIndex),
    BTree1(BTree1Index),
    FixedArray(FixedArrayIndex),
    ExtensibleArray(ExtensibleArrayIndex),
    BTree2(BTree2Index),
}

impl ChunkIndex {
    /// Read the root structure of the index described by `descriptor`
    pub async fn open(source: &dyn ByteSource, descriptor: &DatasetDescriptor) -> Result<Self> {
        Self::open_with_comparator(source, descriptor, RecordComparator::default()).await
    }

    /// Like [`ChunkIndex::open`], searching b-tree v2 records with `comparator`
    pub async fn open_with_comparator(
        source: &dyn ByteSource,
        descriptor: &DatasetDescriptor,
        comparator: RecordComparator,
    ) -> Result<Self> {
        let geometry = descriptor.chunk_geometry()?.ok_or_else(|| {
            H5Error::InvalidFormat(format!(
                "{} layout has no chunk index",
                descriptor.layout.kind()
            ))
        })?;

        let DataLayout::Chunked {
            index: index_descriptor,
            ..
        } = &descriptor.layout
        else {
            return Err(H5Error::InvalidFormat(format!(
                "{} layout has no chunk index",
                descriptor.layout.kind()
            )));
        };

        let context = IndexContext {
            format: descriptor.format,
            rank: geometry.rank(),
            chunk_byte_size: geometry.chunk_byte_size,
            scaled_max_dims: geometry.scaled_max_dims.clone(),
            down_max_chunk_counts: geometry.down_max_chunk_counts.clone(),
            filtered: !descriptor.filters.is_empty(),
        };

        debug!(
            index = index_descriptor.kind(),
            address = index_descriptor.address(),
            rank = context.rank,
            chunk_bytes = context.chunk_byte_size,
            "opening chunk index"
        );

        let index = match index_descriptor {
            ChunkIndexDescriptor::SingleChunk { address, filtered } => {
                ChunkIndex::SingleChunk(SingleChunkIndex::new(*address, *filtered, &context))
            }
            ChunkIndexDescriptor::Implicit { address } => {
                ChunkIndex::Implicit(ImplicitIndex::new(*address, context))
            }
            ChunkIndexDescriptor::BTree1 { address } => {
                ChunkIndex::BTree1(BTree1Index::new(*address, &geometry.chunk_dims, context))
            }
            ChunkIndexDescriptor::FixedArray { address } => {
                ChunkIndex::FixedArray(FixedArrayIndex::open(source, *address, context).await?)
            }
            ChunkIndexDescriptor::ExtensibleArray { address } => {
                let unlimited = geometry.unlimited_dims();
                let unlimited_dim = unlimited.first().copied().unwrap_or(0);
                ChunkIndex::ExtensibleArray(
                    ExtensibleArrayIndex::open(source, *address, unlimited_dim, context).await?,
                )
            }
            ChunkIndexDescriptor::BTree2 { address } => {
                ChunkIndex::BTree2(BTree2Index::open(source, *address, context, comparator).await?)
            }
        };

        Ok(index)
    }

    /// Locate the chunk at `scaled`; `None` means it was never written
    pub async fn lookup(
        &self,
        source: &dyn ByteSource,
        scaled: &[u64],
    ) -> Result<Option<ChunkLocation>> {
        match self {
            ChunkIndex::SingleChunk(index) => Ok(index.lookup(scaled)),
            ChunkIndex::Implicit(index) => Ok(index.lookup(scaled)),
            ChunkIndex::BTree1(index) => index.lookup(source, scaled).await,
            ChunkIndex::FixedArray(index) => index.lookup(source, scaled).await,
            ChunkIndex::ExtensibleArray(index) => index.lookup(source, scaled).await,
            ChunkIndex::BTree2(index) => index.lookup(source, scaled).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChunkIndex::SingleChunk(_) => "single chunk",
            ChunkIndex::Implicit(_) => "implicit",
            ChunkIndex::BTree1(_) => "b-tree v1",
            ChunkIndex::FixedArray(_) => "fixed array",
            ChunkIndex::ExtensibleArray(_) => "extensible array",
            ChunkIndex::BTree2(_) => "b-tree v2",
        }
    }
}

/// Lexicographic comparison of scaled coordinates, dimension 0 first
pub fn compare_scaled(a: &[u64], b: &[u64]) -> Ordering {
    a.iter().cmp(b.iter())
}

/// Three-way ordering of a searched coordinate against a stored b-tree v2
/// record, matching the order the tree was written in
#[derive(Clone)]
pub struct RecordComparator(Arc<dyn Fn(&[u64], &[u64]) -> Ordering + Send + Sync>);

impl RecordComparator {
    pub fn new(compare: impl Fn(&[u64], &[u64]) -> Ordering + Send + Sync + 'static) -> Self {
        Self(Arc::new(compare))
    }

    pub fn compare(&self, key: &[u64], record: &[u64]) -> Ordering {
        (self.0)(key, record)
    }
}

impl Default for RecordComparator {
    fn default() -> Self {
        Self::new(compare_scaled)
    }
}

impl fmt::Debug for RecordComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordComparator")
    }
}

/// Decode one array-index element: an address, plus stored size and
/// filter mask for filtered datasets
pub(crate) fn read_array_element(
    reader: &mut FieldReader<'_>,
    filtered: bool,
    chunk_size_length: usize,
    chunk_byte_size: u64,
) -> Result<Option<ChunkLocation>> {
    let address = reader.read_offset()?;

    let (stored_size, filter_mask) = if filtered {
        (reader.read_uint(chunk_size_length)?, reader.read_u32()?)
    } else {
        (chunk_byte_size, 0)
    };

    if address == UNDEFINED_ADDRESS {
        return Ok(None);
    }

    Ok(Some(ChunkLocation {
        address,
        stored_size,
        filter_mask,
    }))
}

/// Width of the stored-size field inside array elements of `entry_size` bytes
pub(crate) fn element_size_length(context: &IndexContext, entry_size: usize) -> Result<usize> {
    if !context.filtered {
        return Ok(0);
    }

    entry_size
        .checked_sub(context.format.offset_size as usize + 4)
        .filter(|&len| (1..=8).contains(&len))
        .ok_or_else(|| {
            H5Error::InvalidFormat(format!(
                "filtered chunk element of {} bytes is too small",
                entry_size
            ))
        })
}

/// Whether bit `index` is set in an MSB-first bitmap
pub(crate) fn bit_is_set(bitmap: &[u8], index: u64) -> bool {
    let byte = (index / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (0x80 >> (index % 8)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_scaled() {
        assert_eq!(compare_scaled(&[0, 5], &[1, 0]), Ordering::Less);
        assert_eq!(compare_scaled(&[1, 0], &[1, 0]), Ordering::Equal);
        assert_eq!(compare_scaled(&[1, 2], &[1, 1]), Ordering::Greater);
    }

    #[test]
    fn test_record_comparator() {
        assert_eq!(RecordComparator::default().compare(&[0, 5], &[1, 0]), Ordering::Less);

        let reversed = RecordComparator::new(|a, b| compare_scaled(b, a));
        assert_eq!(reversed.compare(&[0, 5], &[1, 0]), Ordering::Greater);
    }

    #[test]
    fn test_bitmap_is_msb_first() {
        let bitmap = [0b1000_0001u8, 0b0100_0000];
        assert!(bit_is_set(&bitmap, 0));
        assert!(!bit_is_set(&bitmap, 1));
        assert!(bit_is_set(&bitmap, 7));
        assert!(bit_is_set(&bitmap, 9));
        assert!(!bit_is_set(&bitmap, 64));
    }
}
