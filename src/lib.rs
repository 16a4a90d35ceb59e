//! h5chunk - chunked dataset storage engine for HDF5 files
//!
//! A pure Rust reader for the chunked N-dimensional array storage of HDF5
//! files. A selection over a dataset is translated into physical reads
//! against one of the chunk index structures, chunks are decoded through
//! the dataset's filter pipeline and cached, and the selected elements are
//! scattered into a destination buffer in host byte order.
//!
//! # Features
//!
//! - Chunk indices: single chunk, implicit, version 1 B-tree, fixed array,
//!   extensible array and version 2 B-tree
//! - Compact, contiguous, chunked and virtual layouts
//! - Hyperslab, point and run selections, with independent memory selections
//! - Filters: deflate, shuffle, Fletcher-32, scale-offset and Zstandard,
//!   plus user filters
//! - Bounded FIFO chunk cache shared by all datasets of a file
//! - Async I/O throughout, with a blocking adapter and cancellation
//!
//! # Byte sources
//!
//! Local files and in-memory images are supported out of the box. For
//! object stores or HTTP range reads, implement the [`ByteSource`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use h5chunk::{DatasetDescriptor, FileConfig, H5File, Selection};
//!
//! # async fn example(descriptor: DatasetDescriptor) -> h5chunk::Result<()> {
//! let file = H5File::open("file:///data/survey.h5", FileConfig::default()).await?;
//! file.register_dataset("amplitude", descriptor)?;
//!
//! let dataset = file.dataset("amplitude").await?;
//! let selection = Selection::hyperslab(vec![6], vec![3], vec![4], vec![1])?;
//! let values = dataset.read_array::<i32>(&selection).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod checksum;
pub mod compound;
pub mod error;
pub mod filters;
pub mod index;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod scale_offset;
pub mod selection;
pub mod types;
pub mod utils;
pub mod walker;

// Re-exports
pub use access::{Dataset, DatasetStats, FileConfig, H5File};
pub use cache::{ChunkCache, ChunkCacheConfig, ChunkCacheFactory, ChunkKey};
pub use compound::CompoundLayout;
pub use error::{H5Error, Result};
pub use filters::{FilterDescription, FilterPipeline, FilterRegistry};
pub use index::{ChunkIndex, ChunkLocation, RecordComparator};
pub use io::{ByteSource, FileByteSource, FormatContext, MemoryByteSource};
pub use layout::{ChunkIndexDescriptor, DataLayout, VirtualMapping};
pub use metadata::{DatasetDescriptor, FillValue};
pub use selection::{HyperslabSelection, PointSelection, RunSelection, Selection};
pub use types::{ByteOrder, Element, ElementType, UNLIMITED};
pub use walker::{walk, RelativeStep};

pub use index::{
    BTREE1_NODE, BTREE2_HEADER, BTREE2_INTERNAL_NODE, BTREE2_LEAF_NODE,
    EXTENSIBLE_ARRAY_DATA_BLOCK, EXTENSIBLE_ARRAY_HEADER, EXTENSIBLE_ARRAY_INDEX_BLOCK,
    EXTENSIBLE_ARRAY_SECONDARY_BLOCK, FIXED_ARRAY_DATA_BLOCK, FIXED_ARRAY_HEADER,
};

/// Version of the h5chunk implementation
pub const H5CHUNK_VERSION: &str = env!("CARGO_PKG_VERSION");
