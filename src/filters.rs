//! Filter pipeline applied to stored chunk bytes
//!
//! Filters run left to right when a chunk is written and are inverted right
//! to left when it is read. Bit `i` of a chunk's filter mask marks filter `i`
//! as skipped for that chunk.

use crate::checksum::fletcher32;
use crate::error::{H5Error, Result};
use crate::scale_offset::{ScaleOffsetFilter, ScaleOffsetParameters, FILTER_SCALE_OFFSET};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::trace;

/// Deflate (zlib stream)
pub const FILTER_DEFLATE: u16 = 1;
/// Byte shuffle
pub const FILTER_SHUFFLE: u16 = 2;
/// Fletcher-32 checksum
pub const FILTER_FLETCHER32: u16 = 3;
/// N-bit packing
pub const FILTER_NBIT: u16 = 5;
/// Zstandard, as registered with the HDF Group
pub const FILTER_ZSTD: u16 = 32015;

/// Flag bit marking a filter as optional
pub const FILTER_FLAG_OPTIONAL: u16 = 0x0001;

/// One entry of a dataset's filter pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDescription {
    pub id: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    pub fn new(id: u16, client_data: Vec<u32>) -> Self {
        Self {
            id,
            name: None,
            flags: 0,
            client_data,
        }
    }

    pub fn deflate(level: u32) -> Self {
        Self::new(FILTER_DEFLATE, vec![level.min(9)])
    }

    pub fn shuffle(element_size: usize) -> Self {
        Self::new(FILTER_SHUFFLE, vec![element_size as u32])
    }

    pub fn fletcher32() -> Self {
        Self::new(FILTER_FLETCHER32, Vec::new())
    }

    pub fn zstd(level: i32) -> Self {
        Self::new(FILTER_ZSTD, vec![level as u32])
    }

    pub fn scale_offset(parameters: &ScaleOffsetParameters) -> Self {
        Self::new(FILTER_SCALE_OFFSET, parameters.to_client_data())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark the filter optional: chunks may skip it and readers that lack
    /// it pass bytes through
    pub fn optional(mut self) -> Self {
        self.flags |= FILTER_FLAG_OPTIONAL;
        self
    }

    pub fn is_optional(&self) -> bool {
        self.flags & FILTER_FLAG_OPTIONAL != 0
    }

    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "unnamed filter".to_string())
    }
}

/// A reversible byte transform
pub trait Filter: Send + Sync {
    /// Human readable name
    fn name(&self) -> &str;

    /// Undo the transform (read direction)
    fn decode(&self, flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>>;

    /// Apply the transform (write direction)
    fn encode(&self, _flags: u16, _client_data: &[u32], _input: Vec<u8>) -> Result<Vec<u8>> {
        Err(H5Error::Compression(format!(
            "filter '{}' only supports decoding",
            self.name()
        )))
    }
}

/// Deflate filter over a zlib stream
#[derive(Debug, Default)]
pub struct DeflateFilter;

impl Filter for DeflateFilter {
    fn name(&self) -> &str {
        "deflate"
    }

    fn decode(&self, _flags: u16, _client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(input.as_slice());
        let mut decompressed = Vec::with_capacity(input.len() * 2);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| H5Error::Decompression(e.to_string()))?;
        Ok(decompressed)
    }

    fn encode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        let level = client_data.first().copied().unwrap_or(6).min(9);
        let mut encoder = ZlibEncoder::new(input.as_slice(), FlateCompression::new(level));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| H5Error::Compression(e.to_string()))?;
        Ok(compressed)
    }
}

/// Zstandard filter
#[derive(Debug, Default)]
pub struct ZstdFilter;

impl Filter for ZstdFilter {
    fn name(&self) -> &str {
        "zstd"
    }

    fn decode(&self, _flags: u16, _client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        zstd::decode_all(input.as_slice()).map_err(|e| H5Error::Decompression(e.to_string()))
    }

    fn encode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        let level = client_data.first().map(|&l| l as i32).unwrap_or(3);
        zstd::encode_all(input.as_slice(), level).map_err(|e| H5Error::Compression(e.to_string()))
    }
}

/// Byte shuffle; client data holds the element width
#[derive(Debug, Default)]
pub struct ShuffleFilter;

impl ShuffleFilter {
    fn element_size(client_data: &[u32]) -> Result<usize> {
        match client_data.first() {
            Some(&size) if size > 0 => Ok(size as usize),
            _ => Err(H5Error::InvalidFormat(
                "shuffle filter requires the element size as client data".to_string(),
            )),
        }
    }
}

impl Filter for ShuffleFilter {
    fn name(&self) -> &str {
        "shuffle"
    }

    fn decode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        Ok(unshuffle(Self::element_size(client_data)?, &input))
    }

    fn encode(&self, _flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        Ok(shuffle(Self::element_size(client_data)?, &input))
    }
}

/// Fletcher-32 checksum trailer
#[derive(Debug, Default)]
pub struct Fletcher32Filter;

impl Filter for Fletcher32Filter {
    fn name(&self) -> &str {
        "fletcher32"
    }

    fn decode(&self, _flags: u16, _client_data: &[u32], mut input: Vec<u8>) -> Result<Vec<u8>> {
        if input.len() < 4 {
            return Err(H5Error::InvalidFormat(
                "chunk too short for a fletcher32 checksum".to_string(),
            ));
        }

        let body_len = input.len() - 4;
        let stored = u32::from_le_bytes([
            input[body_len],
            input[body_len + 1],
            input[body_len + 2],
            input[body_len + 3],
        ]);

        if fletcher32(&input[..body_len]) != stored {
            return Err(H5Error::ChecksumMismatch("fletcher32 filter".to_string()));
        }

        input.truncate(body_len);
        Ok(input)
    }

    fn encode(&self, _flags: u16, _client_data: &[u32], mut input: Vec<u8>) -> Result<Vec<u8>> {
        let sum = fletcher32(&input);
        input.extend_from_slice(&sum.to_le_bytes());
        Ok(input)
    }
}

/// N-bit packing is recognised but cannot be decoded
#[derive(Debug, Default)]
pub struct NbitFilter;

impl Filter for NbitFilter {
    fn name(&self) -> &str {
        "nbit"
    }

    fn decode(&self, _flags: u16, _client_data: &[u32], _input: Vec<u8>) -> Result<Vec<u8>> {
        Err(H5Error::UnsupportedFilter {
            id: FILTER_NBIT,
            name: self.name().to_string(),
        })
    }
}

/// Decode-only filter backed by a registered callback
pub type DecodeFn = dyn Fn(u16, &[u32], Vec<u8>) -> Result<Vec<u8>> + Send + Sync;

struct CallbackFilter {
    name: String,
    decode: Box<DecodeFn>,
}

impl Filter for CallbackFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&self, flags: u16, client_data: &[u32], input: Vec<u8>) -> Result<Vec<u8>> {
        (self.decode)(flags, client_data, input)
    }
}

/// Filters known to a file handle, keyed by id
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<u16, Arc<dyn Filter>>,
}

impl FilterRegistry {
    /// Registry without any filters
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Register a decode callback for `id`, replacing any previous entry
    pub fn register<F>(&mut self, id: u16, name: impl Into<String>, decode: F)
    where
        F: Fn(u16, &[u32], Vec<u8>) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.register_filter(
            id,
            Arc::new(CallbackFilter {
                name: name.into(),
                decode: Box::new(decode),
            }),
        );
    }

    /// Register a full encode/decode filter
    pub fn register_filter(&mut self, id: u16, filter: Arc<dyn Filter>) {
        self.filters.insert(id, filter);
    }

    pub fn get(&self, id: u16) -> Option<&Arc<dyn Filter>> {
        self.filters.get(&id)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.filters.contains_key(&id)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_filter(FILTER_DEFLATE, Arc::new(DeflateFilter));
        registry.register_filter(FILTER_SHUFFLE, Arc::new(ShuffleFilter));
        registry.register_filter(FILTER_FLETCHER32, Arc::new(Fletcher32Filter));
        registry.register_filter(FILTER_NBIT, Arc::new(NbitFilter));
        registry.register_filter(FILTER_SCALE_OFFSET, Arc::new(ScaleOffsetFilter));
        registry.register_filter(FILTER_ZSTD, Arc::new(ZstdFilter));
        registry
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.filters.keys().collect();
        ids.sort();
        f.debug_struct("FilterRegistry").field("ids", &ids).finish()
    }
}

/// Ordered filter chain of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescription>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<FilterDescription>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Invert the pipeline, last filter first
    pub fn decode(&self, registry: &FilterRegistry, filter_mask: u32, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut buffer = data;

        for (index, description) in self.filters.iter().enumerate().rev() {
            if skipped(filter_mask, index) {
                continue;
            }

            match registry.get(description.id) {
                Some(filter) => {
                    buffer = filter.decode(description.flags, &description.client_data, buffer)?;
                }
                None if description.is_optional() => {
                    trace!(filter = description.id, "optional filter not registered, passing through");
                }
                None => {
                    return Err(H5Error::UnknownFilter {
                        id: description.id,
                        name: description.display_name(),
                    });
                }
            }
        }

        Ok(buffer)
    }

    /// Run the pipeline forward, returning the encoded bytes and the mask
    /// of filters that were not applied
    pub fn encode(&self, registry: &FilterRegistry, data: Vec<u8>) -> Result<(Vec<u8>, u32)> {
        let mut buffer = data;
        let mut filter_mask = 0u32;

        for (index, description) in self.filters.iter().enumerate() {
            match registry.get(description.id) {
                Some(filter) => {
                    buffer = filter.encode(description.flags, &description.client_data, buffer)?;
                }
                None if description.is_optional() => {
                    filter_mask |= 1 << index;
                }
                None => {
                    return Err(H5Error::UnknownFilter {
                        id: description.id,
                        name: description.display_name(),
                    });
                }
            }
        }

        Ok((buffer, filter_mask))
    }
}

fn skipped(filter_mask: u32, index: usize) -> bool {
    index < 32 && (filter_mask >> index) & 1 == 1
}

/// De-interleave bytes so byte `j` of every element is stored together.
/// Bytes past the last whole element are copied unchanged.
pub fn shuffle(element_size: usize, input: &[u8]) -> Vec<u8> {
    let mut output = input.to_vec();
    if element_size <= 1 {
        return output;
    }

    let elements = input.len() / element_size;
    for j in 0..element_size {
        for i in 0..elements {
            output[j * elements + i] = input[i * element_size + j];
        }
    }

    output
}

/// Exact inverse of [`shuffle`]
pub fn unshuffle(element_size: usize, input: &[u8]) -> Vec<u8> {
    let mut output = input.to_vec();
    if element_size <= 1 {
        return output;
    }

    let elements = input.len() / element_size;
    for i in 0..elements {
        for j in 0..element_size {
            output[i * element_size + j] = input[j * elements + i];
        }
    }

    output
}
