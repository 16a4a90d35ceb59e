//! Storage layouts and chunk grid geometry

use crate::error::{H5Error, Result};
use crate::selection::HyperslabSelection;
use crate::types::UNLIMITED;
use crate::utils::{accumulate_reverse, ceil_div, linear_index, log2_floor};
use serde::{Deserialize, Serialize};

/// Where the index of a chunked dataset lives and how it is organised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkIndexDescriptor {
    /// Dataset consisting of exactly one chunk
    SingleChunk {
        address: u64,
        /// Stored size and filter mask, present when filters are defined
        #[serde(default)]
        filtered: Option<(u64, u32)>,
    },
    /// Chunks stored back to back from `address`, no index structure
    Implicit { address: u64 },
    /// Version 1 B-tree rooted at `address`
    BTree1 { address: u64 },
    /// Fixed array header at `address`
    FixedArray { address: u64 },
    /// Extensible array header at `address`
    ExtensibleArray { address: u64 },
    /// Version 2 B-tree header at `address`
    BTree2 { address: u64 },
}

impl ChunkIndexDescriptor {
    pub fn address(&self) -> u64 {
        match self {
            ChunkIndexDescriptor::SingleChunk { address, .. }
            | ChunkIndexDescriptor::Implicit { address }
            | ChunkIndexDescriptor::BTree1 { address }
            | ChunkIndexDescriptor::FixedArray { address }
            | ChunkIndexDescriptor::ExtensibleArray { address }
            | ChunkIndexDescriptor::BTree2 { address } => *address,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChunkIndexDescriptor::SingleChunk { .. } => "single chunk",
            ChunkIndexDescriptor::Implicit { .. } => "implicit",
            ChunkIndexDescriptor::BTree1 { .. } => "b-tree v1",
            ChunkIndexDescriptor::FixedArray { .. } => "fixed array",
            ChunkIndexDescriptor::ExtensibleArray { .. } => "extensible array",
            ChunkIndexDescriptor::BTree2 { .. } => "b-tree v2",
        }
    }
}

/// Mapping of part of a virtual dataset onto a source dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMapping {
    /// Name of the source dataset in the owning file's catalog
    pub source_dataset: String,
    /// Elements of the virtual dataset covered by this mapping
    pub virtual_selection: HyperslabSelection,
    /// Matching elements of the source dataset, same element count
    pub source_selection: HyperslabSelection,
}

impl VirtualMapping {
    pub fn new(
        source_dataset: impl Into<String>,
        virtual_selection: HyperslabSelection,
        source_selection: HyperslabSelection,
    ) -> Result<Self> {
        let mapping = Self {
            source_dataset: source_dataset.into(),
            virtual_selection,
            source_selection,
        };
        mapping.validate()?;
        Ok(mapping)
    }

    /// Both selections must be well formed and select the same number of elements
    pub fn validate(&self) -> Result<()> {
        self.virtual_selection.validate()?;
        self.source_selection.validate()?;

        let virtual_count = self.virtual_selection.total_element_count();
        let source_count = self.source_selection.total_element_count();
        if virtual_count != source_count {
            return Err(H5Error::SelectionSizeMismatch(format!(
                "mapping to '{}' selects {} virtual elements but {} source elements",
                self.source_dataset, virtual_count, source_count
            )));
        }

        Ok(())
    }
}

/// Storage layout of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataLayout {
    /// Raw data embedded in the layout message
    Compact { data: Vec<u8> },
    /// One region of `size` bytes at `address`
    Contiguous { address: u64, size: u64 },
    /// Fixed-shape chunks located through an index
    Chunked {
        chunk_dims: Vec<u64>,
        index: ChunkIndexDescriptor,
    },
    /// Elements assembled from other datasets
    Virtual { mappings: Vec<VirtualMapping> },
}

impl DataLayout {
    pub fn kind(&self) -> &'static str {
        match self {
            DataLayout::Compact { .. } => "compact",
            DataLayout::Contiguous { .. } => "contiguous",
            DataLayout::Chunked { .. } => "chunked",
            DataLayout::Virtual { .. } => "virtual",
        }
    }
}

/// Derived sizes of a chunk grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub dims: Vec<u64>,
    pub max_dims: Vec<u64>,
    pub chunk_dims: Vec<u64>,
    /// Chunks per dimension for the current extent
    pub scaled_dims: Vec<u64>,
    /// Chunks per dimension for the maximum extent, `UNLIMITED` where unbounded
    pub scaled_max_dims: Vec<u64>,
    pub down_chunk_counts: Vec<u64>,
    pub down_max_chunk_counts: Vec<u64>,
    /// Bytes in one unfiltered chunk
    pub chunk_byte_size: u64,
}

impl ChunkGeometry {
    pub fn new(dims: &[u64], max_dims: &[u64], chunk_dims: &[u64], element_size: usize) -> Result<Self> {
        if dims.len() != chunk_dims.len() || dims.len() != max_dims.len() {
            return Err(H5Error::InvalidDimensions(format!(
                "dims {:?}, max dims {:?} and chunk dims {:?} differ in rank",
                dims, max_dims, chunk_dims
            )));
        }

        if chunk_dims.iter().any(|&c| c == 0) {
            return Err(H5Error::InvalidDimensions(format!(
                "chunk dims must be positive, got {:?}",
                chunk_dims
            )));
        }

        let scaled_dims: Vec<u64> = dims
            .iter()
            .zip(chunk_dims)
            .map(|(&d, &c)| ceil_div(d, c))
            .collect();

        let scaled_max_dims: Vec<u64> = max_dims
            .iter()
            .zip(chunk_dims)
            .map(|(&m, &c)| if m == UNLIMITED { UNLIMITED } else { ceil_div(m, c) })
            .collect();

        let chunk_byte_size = chunk_dims
            .iter()
            .product::<u64>()
            .checked_mul(element_size as u64)
            .ok_or_else(|| H5Error::InvalidDimensions("chunk byte size overflows".to_string()))?;

        Ok(Self {
            dims: dims.to_vec(),
            max_dims: max_dims.to_vec(),
            chunk_dims: chunk_dims.to_vec(),
            down_chunk_counts: accumulate_reverse(&scaled_dims),
            down_max_chunk_counts: accumulate_reverse(&scaled_max_dims),
            scaled_dims,
            scaled_max_dims,
            chunk_byte_size,
        })
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Scaled chunk coordinate containing element `coords`
    pub fn scaled(&self, coords: &[u64]) -> Vec<u64> {
        coords
            .iter()
            .zip(&self.chunk_dims)
            .map(|(&c, &d)| c / d)
            .collect()
    }

    /// Linear chunk index over the maximum extent
    pub fn linear_max_index(&self, scaled: &[u64]) -> u64 {
        linear_index(scaled, &self.down_max_chunk_counts)
    }

    /// Number of chunks covering the current extent
    pub fn total_chunks(&self) -> u64 {
        self.scaled_dims.iter().product()
    }

    /// Dimensions with unlimited maximum extent
    pub fn unlimited_dims(&self) -> Vec<usize> {
        self.max_dims
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == UNLIMITED)
            .map(|(i, _)| i)
            .collect()
    }

    /// Width of the stored-size field of filtered chunk records
    pub fn chunk_size_length(&self) -> usize {
        chunk_size_length(self.chunk_byte_size)
    }
}

/// Bytes needed to encode the size of a filtered chunk, at most 8
pub fn chunk_size_length(chunk_byte_size: u64) -> usize {
    (1 + (log2_floor(chunk_byte_size) as usize + 8) / 8).min(8)
}
