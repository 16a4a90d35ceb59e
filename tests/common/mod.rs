//! Builders for synthetic in-memory file images
//!
//! Each builder writes real on-disk structures (with lookup3 checksums)
//! so the integration tests exercise the same decoding paths as files
//! produced by the HDF5 library.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use h5chunk::io::{FieldWriter, FormatContext, UNDEFINED_ADDRESS};
use h5chunk::layout::chunk_size_length;
use h5chunk::utils::{accumulate_reverse, ceil_div, linear_index};
use h5chunk::{
    ByteSource, ChunkIndexDescriptor, DataLayout, DatasetDescriptor, ElementType, FilterPipeline,
    FilterRegistry, MemoryByteSource, Result,
};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// Append-only file image
pub struct ImageBuilder {
    bytes: Vec<u8>,
}

impl ImageBuilder {
    /// Image with a small reserved prefix, so no structure lives at address 0
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; 64],
        }
    }

    pub fn position(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn append(&mut self, data: &[u8]) -> u64 {
        let address = self.position();
        self.bytes.extend_from_slice(data);
        address
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn into_source(self) -> MemoryByteSource {
        MemoryByteSource::new(self.bytes)
    }
}

/// In-memory source that records every `(offset, len)` it serves
pub struct CountingSource {
    inner: MemoryByteSource,
    reads: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl CountingSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: MemoryByteSource::new(bytes),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared log of reads, still readable after the source moves into a file
    pub fn reads(&self) -> Arc<Mutex<Vec<(u64, usize)>>> {
        Arc::clone(&self.reads)
    }
}

#[async_trait]
impl ByteSource for CountingSource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        self.reads.lock().push((offset, len));
        self.inner.read_at(offset, len).await
    }

    async fn len(&self) -> Result<u64> {
        self.inner.len().await
    }
}

/// Where a chunk was written and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredChunk {
    pub address: u64,
    pub size: u64,
    pub mask: u32,
}

/// A chunk written to the image, keyed by scaled coordinate
pub type PlacedChunk = (Vec<u64>, StoredChunk);

/// Value of element `coords` in the test datasets: its row-major index
pub fn linear_value(dims: &[u64]) -> impl Fn(&[u64]) -> i32 {
    let down = accumulate_reverse(dims);
    move |coords| linear_index(coords, &down) as i32
}

pub fn scaled_dims(dims: &[u64], chunk_dims: &[u64]) -> Vec<u64> {
    dims.iter().zip(chunk_dims).map(|(&d, &c)| ceil_div(d, c)).collect()
}

/// Every scaled chunk coordinate of the grid, row-major
pub fn chunk_grid(dims: &[u64], chunk_dims: &[u64]) -> Vec<Vec<u64>> {
    let scaled = scaled_dims(dims, chunk_dims);
    let total: u64 = scaled.iter().product();
    (0..total)
        .map(|i| h5chunk::utils::to_coordinates(i, &scaled))
        .collect()
}

/// Elements of one chunk; positions beyond the extent hold zero
pub fn chunk_values(
    dims: &[u64],
    chunk_dims: &[u64],
    scaled: &[u64],
    value: &dyn Fn(&[u64]) -> i32,
) -> Vec<i32> {
    let count: u64 = chunk_dims.iter().product();
    (0..count)
        .map(|i| {
            let local = h5chunk::utils::to_coordinates(i, chunk_dims);
            let coords: Vec<u64> = local
                .iter()
                .zip(scaled.iter().zip(chunk_dims))
                .map(|(&l, (&s, &c))| s * c + l)
                .collect();
            if coords.iter().zip(dims).all(|(&c, &d)| c < d) {
                value(&coords)
            } else {
                0
            }
        })
        .collect()
}

pub fn i32_le_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_be_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

pub fn decode_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Write every chunk of the grid in row-major order, optionally encoded
pub fn write_chunks(
    builder: &mut ImageBuilder,
    dims: &[u64],
    chunk_dims: &[u64],
    value: &dyn Fn(&[u64]) -> i32,
    pipeline: Option<&FilterPipeline>,
) -> Vec<PlacedChunk> {
    let registry = FilterRegistry::default();

    write_encoded_chunks(builder, dims, chunk_dims, value, &|_: &[u64], raw: Vec<u8>| match pipeline {
        Some(pipeline) => pipeline.encode(&registry, raw).expect("encode chunk"),
        None => (raw, 0),
    })
}

/// Write every chunk of the grid, transformed by `encode` into stored
/// bytes and a filter mask
pub fn write_encoded_chunks(
    builder: &mut ImageBuilder,
    dims: &[u64],
    chunk_dims: &[u64],
    value: &dyn Fn(&[u64]) -> i32,
    encode: &dyn Fn(&[u64], Vec<u8>) -> (Vec<u8>, u32),
) -> Vec<PlacedChunk> {
    chunk_grid(dims, chunk_dims)
        .into_iter()
        .map(|scaled| {
            let raw = i32_le_bytes(&chunk_values(dims, chunk_dims, &scaled, value));
            let (bytes, mask) = encode(&scaled, raw);

            let address = builder.append(&bytes);
            let stored = StoredChunk {
                address,
                size: bytes.len() as u64,
                mask,
            };
            (scaled, stored)
        })
        .collect()
}

/// Chunked int32 little-endian dataset descriptor
pub fn chunked_i32(dims: &[u64], chunk_dims: &[u64], index: ChunkIndexDescriptor) -> DatasetDescriptor {
    DatasetDescriptor::new(
        dims.to_vec(),
        ElementType::little_endian(4),
        DataLayout::Chunked {
            chunk_dims: chunk_dims.to_vec(),
            index,
        },
    )
}

/// Array entries in linear order of `scaled_max`, `None` where unwritten
pub fn linear_entries(chunks: &[PlacedChunk], scaled_max: &[u64]) -> Vec<Option<StoredChunk>> {
    let total: u64 = scaled_max.iter().product();
    let down = accumulate_reverse(scaled_max);
    let mut entries = vec![None; total as usize];
    for (scaled, stored) in chunks {
        entries[linear_index(scaled, &down) as usize] = Some(*stored);
    }
    entries
}

fn write_element(writer: &mut FieldWriter, entry: Option<StoredChunk>, size_length: Option<usize>) {
    let stored = entry.unwrap_or(StoredChunk {
        address: UNDEFINED_ADDRESS,
        size: 0,
        mask: 0,
    });

    writer.write_offset(stored.address);
    if let Some(size_length) = size_length {
        writer.write_uint(stored.size, size_length).write_u32(stored.mask);
    }
}

/// Unpaged fixed array; `size_length` is set for filtered datasets
pub fn fixed_array(
    builder: &mut ImageBuilder,
    entries: &[Option<StoredChunk>],
    size_length: Option<usize>,
) -> u64 {
    let header = builder.position();
    let header_size = 28;
    let entry_size = 8 + size_length.map_or(0, |len| len + 4);
    let client = u8::from(size_length.is_some());

    let mut writer = FieldWriter::new(FormatContext::default());
    writer
        .write_bytes(b"FAHD")
        .write_u8(0)
        .write_u8(client)
        .write_u8(entry_size as u8)
        .write_u8(10)
        .write_length(entries.len() as u64)
        .write_offset(header + header_size)
        .write_checksum_from(0);
    assert_eq!(writer.len() as u64, header_size);

    let start = writer.len();
    writer
        .write_bytes(b"FADB")
        .write_u8(0)
        .write_u8(client)
        .write_offset(header);
    for entry in entries {
        write_element(&mut writer, *entry, size_length);
    }
    writer.write_checksum_from(start);

    builder.append(&writer.into_bytes());
    header
}

/// Extensible array whose elements all live in the index block
pub fn extensible_array(
    builder: &mut ImageBuilder,
    entries: &[Option<StoredChunk>],
    size_length: Option<usize>,
) -> u64 {
    assert!(entries.len() < 256, "index block holds at most 255 elements");

    let header = builder.position();
    let header_size = 16 + 6 * 8 + 8;
    let entry_size = 8 + size_length.map_or(0, |len| len + 4);
    let client = u8::from(size_length.is_some());
    let count = entries.len() as u64;

    let mut writer = FieldWriter::new(FormatContext::default());
    writer
        .write_bytes(b"EAHD")
        .write_u8(0)
        .write_u8(client)
        .write_u8(entry_size as u8)
        .write_u8(16)
        .write_u8(entries.len() as u8)
        .write_u8(2)
        .write_u8(2)
        .write_u8(10);
    for length in [0, 0, 0, 0, count, count] {
        writer.write_length(length);
    }
    writer
        .write_offset(header + header_size)
        .write_checksum_from(0);
    assert_eq!(writer.len() as u64, header_size);

    // 16 super blocks: 2 data block and 14 super block pointers, all unused
    let start = writer.len();
    writer
        .write_bytes(b"EAIB")
        .write_u8(0)
        .write_u8(client)
        .write_offset(header);
    for entry in entries {
        write_element(&mut writer, *entry, size_length);
    }
    for _ in 0..16 {
        writer.write_offset(UNDEFINED_ADDRESS);
    }
    writer.write_checksum_from(start);

    builder.append(&writer.into_bytes());
    header
}

/// Version 1 B-tree with leaves of at most `fanout` chunks under one root
pub fn btree1(
    builder: &mut ImageBuilder,
    dims: &[u64],
    chunk_dims: &[u64],
    chunks: &[PlacedChunk],
    fanout: usize,
) -> u64 {
    let scaled = scaled_dims(dims, chunk_dims);
    let mut end_key = vec![0u64; dims.len()];
    end_key[0] = scaled[0];

    let key = |writer: &mut FieldWriter, scaled: &[u64], stored: Option<StoredChunk>| {
        let (size, mask) = stored.map_or((0, 0), |s| (s.size as u32, s.mask));
        writer.write_u32(size).write_u32(mask);
        for (s, c) in scaled.iter().zip(chunk_dims) {
            writer.write_u64(s * c);
        }
        writer.write_u64(0);
    };

    let node = |level: u8, entries: &[(Vec<u64>, Option<StoredChunk>, u64)], last: &[u64]| {
        let mut writer = FieldWriter::new(FormatContext::default());
        writer
            .write_bytes(b"TREE")
            .write_u8(1)
            .write_u8(level)
            .write_u16(entries.len() as u16)
            .write_offset(UNDEFINED_ADDRESS)
            .write_offset(UNDEFINED_ADDRESS);
        for (scaled, stored, child) in entries {
            key(&mut writer, scaled, *stored);
            writer.write_offset(*child);
        }
        key(&mut writer, last, None);
        writer.into_bytes()
    };

    let groups: Vec<&[PlacedChunk]> = chunks.chunks(fanout).collect();
    let mut leaves = Vec::new();
    for (i, group) in groups.iter().enumerate() {
        let last = groups
            .get(i + 1)
            .map(|next| next[0].0.clone())
            .unwrap_or_else(|| end_key.clone());
        let entries: Vec<_> = group
            .iter()
            .map(|(scaled, stored)| (scaled.clone(), Some(*stored), stored.address))
            .collect();
        let address = builder.append(&node(0, &entries, &last));
        leaves.push((group[0].0.clone(), address));
    }

    if leaves.len() == 1 {
        return leaves[0].1;
    }

    let entries: Vec<_> = leaves
        .into_iter()
        .map(|(first, address)| (first, None, address))
        .collect();
    builder.append(&node(1, &entries, &end_key))
}

/// Version 2 B-tree with every record in a single leaf root
pub fn btree2(
    builder: &mut ImageBuilder,
    rank: usize,
    chunk_byte_size: u64,
    chunks: &[PlacedChunk],
    filtered: bool,
) -> u64 {
    btree2_ordered(builder, rank, chunk_byte_size, chunks, filtered, &|a, b| a.cmp(b))
}

/// Single-leaf version 2 B-tree whose records are sorted by `order`
pub fn btree2_ordered(
    builder: &mut ImageBuilder,
    rank: usize,
    chunk_byte_size: u64,
    chunks: &[PlacedChunk],
    filtered: bool,
    order: &dyn Fn(&[u64], &[u64]) -> Ordering,
) -> u64 {
    const NODE_SIZE: usize = 4096;
    let size_length = chunk_size_length(chunk_byte_size);
    let record_size = 8 + 8 * rank + if filtered { size_length + 4 } else { 0 };
    let record_type = if filtered { 11 } else { 10 };

    let mut sorted = chunks.to_vec();
    sorted.sort_by(|a, b| order(a.0.as_slice(), b.0.as_slice()));

    let mut leaf = FieldWriter::new(FormatContext::default());
    leaf.write_bytes(b"BTLF").write_u8(0).write_u8(record_type);
    for (scaled, stored) in &sorted {
        leaf.write_offset(stored.address);
        if filtered {
            leaf.write_uint(stored.size, size_length).write_u32(stored.mask);
        }
        for &s in scaled {
            leaf.write_u64(s);
        }
    }
    leaf.write_checksum_from(0);
    let mut leaf = leaf.into_bytes();
    leaf.resize(NODE_SIZE, 0);
    let root = builder.append(&leaf);

    let mut writer = FieldWriter::new(FormatContext::default());
    writer
        .write_bytes(b"BTHD")
        .write_u8(0)
        .write_u8(record_type)
        .write_u32(NODE_SIZE as u32)
        .write_u16(record_size as u16)
        .write_u16(0)
        .write_u8(100)
        .write_u8(40)
        .write_offset(root)
        .write_u16(sorted.len() as u16)
        .write_length(sorted.len() as u64)
        .write_checksum_from(0);
    builder.append(&writer.into_bytes())
}
