//! Byte sources and little-endian field codecs for on-disk structures

use crate::checksum::lookup3;
use crate::error::{H5Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Address value meaning "not allocated", after widening to 64 bits
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

/// Random-access read primitive over a file or memory image
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Total length of the source in bytes
    async fn len(&self) -> Result<u64>;

    /// Whether the source has zero length
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Byte source over a local file
pub struct FileByteSource {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl FileByteSource {
    /// Open a file for random-access reads
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path).await.map_err(H5Error::Io)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteSource for FileByteSource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buffer = vec![0u8; len];
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(H5Error::Io)?;
        file.read_exact(&mut buffer).await.map_err(H5Error::Io)?;

        Ok(Bytes::from(buffer))
    }

    async fn len(&self) -> Result<u64> {
        let metadata = fs::metadata(&self.path).await.map_err(H5Error::Io)?;
        Ok(metadata.len())
    }
}

/// Byte source over an in-memory image
#[derive(Debug, Clone)]
pub struct MemoryByteSource {
    data: Bytes,
}

impl MemoryByteSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for MemoryByteSource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| H5Error::OutOfBounds(format!("offset {} exceeds memory", offset)))?;
        let end = start.checked_add(len).filter(|&end| end <= self.data.len());

        match end {
            Some(end) => Ok(self.data.slice(start..end)),
            None => Err(H5Error::OutOfBounds(format!(
                "read of {} bytes at {} past end of {}-byte image",
                len,
                offset,
                self.data.len()
            ))),
        }
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Byte source wrapper that refuses to read once a token is cancelled
pub struct CancellableSource<'a> {
    inner: &'a dyn ByteSource,
    token: &'a CancellationToken,
}

impl<'a> CancellableSource<'a> {
    pub fn new(inner: &'a dyn ByteSource, token: &'a CancellationToken) -> Self {
        Self { inner, token }
    }
}

#[async_trait]
impl ByteSource for CancellableSource<'_> {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        if self.token.is_cancelled() {
            return Err(H5Error::Cancelled);
        }
        self.inner.read_at(offset, len).await
    }

    async fn len(&self) -> Result<u64> {
        self.inner.len().await
    }
}

/// Open a byte source from a `file://` URL or plain path
pub async fn open_byte_source(url: &str) -> Result<Box<dyn ByteSource>> {
    if let Some(scheme_end) = url.find("://") {
        let scheme = &url[..scheme_end];
        if scheme != "file" {
            return Err(H5Error::Configuration(format!(
                "Unsupported byte source scheme: {}. Implement the ByteSource trait for remote storage.",
                scheme
            )));
        }
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    Ok(Box::new(FileByteSource::open(path).await?))
}

/// Field widths fixed by the governing superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatContext {
    /// Size of file addresses in bytes
    pub offset_size: u8,
    /// Size of lengths in bytes
    pub length_size: u8,
}

impl FormatContext {
    pub fn new(offset_size: u8, length_size: u8) -> Result<Self> {
        for size in [offset_size, length_size] {
            if !matches!(size, 2 | 4 | 8) {
                return Err(H5Error::Configuration(format!(
                    "Field width must be 2, 4 or 8 bytes, got {}",
                    size
                )));
            }
        }

        Ok(Self {
            offset_size,
            length_size,
        })
    }

    pub fn is_undefined(&self, address: u64) -> bool {
        address == UNDEFINED_ADDRESS
    }
}

impl Default for FormatContext {
    fn default() -> Self {
        Self {
            offset_size: 8,
            length_size: 8,
        }
    }
}

/// Cursor decoding little-endian fields out of a fetched block
pub struct FieldReader<'a> {
    data: &'a [u8],
    position: usize,
    context: FormatContext,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8], context: FormatContext) -> Self {
        Self {
            data,
            position: 0,
            context,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.read_bytes(count).map(|_| ())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                H5Error::InvalidFormat(format!(
                    "structure truncated: wanted {} bytes at {}, have {}",
                    count,
                    self.position,
                    self.data.len()
                ))
            })?;

        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_uint(2)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_uint(4)? as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    /// Read an unsigned little-endian integer of `size` bytes (at most 8)
    pub fn read_uint(&mut self, size: usize) -> Result<u64> {
        if size > 8 {
            return Err(H5Error::InvalidFormat(format!(
                "integer field of {} bytes",
                size
            )));
        }

        let bytes = self.read_bytes(size)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &byte| (acc << 8) | byte as u64))
    }

    /// Read a file address; all-ones maps to [`UNDEFINED_ADDRESS`]
    pub fn read_offset(&mut self) -> Result<u64> {
        let size = self.context.offset_size as usize;
        let bytes = self.read_bytes(size)?;

        if bytes.iter().all(|&b| b == 0xff) {
            return Ok(UNDEFINED_ADDRESS);
        }

        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &byte| (acc << 8) | byte as u64))
    }

    pub fn read_length(&mut self) -> Result<u64> {
        self.read_uint(self.context.length_size as usize)
    }

    /// Consume a 4-byte signature, failing if it does not match
    pub fn expect_signature(&mut self, expected: &[u8; 4]) -> Result<()> {
        let found = self.read_bytes(4)?;

        if found != expected {
            return Err(H5Error::InvalidSignature {
                expected: String::from_utf8_lossy(expected).into_owned(),
                found: String::from_utf8_lossy(found).into_owned(),
            });
        }

        Ok(())
    }
}

/// Encoder mirroring [`FieldReader`], used by the chunk writer
#[derive(Debug, Default)]
pub struct FieldWriter {
    buffer: Vec<u8>,
    context: FormatContext,
}

impl FieldWriter {
    pub fn new(context: FormatContext) -> Self {
        Self {
            buffer: Vec::new(),
            context,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.write_uint(value as u64, 2)
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_uint(value as u64, 4)
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_uint(value, 8)
    }

    /// Write the low `size` bytes of `value` little-endian
    pub fn write_uint(&mut self, value: u64, size: usize) -> &mut Self {
        self.buffer
            .extend_from_slice(&value.to_le_bytes()[..size.min(8)]);
        self
    }

    pub fn write_offset(&mut self, address: u64) -> &mut Self {
        self.write_uint(address, self.context.offset_size as usize)
    }

    pub fn write_length(&mut self, length: u64) -> &mut Self {
        self.write_uint(length, self.context.length_size as usize)
    }

    /// Append the lookup3 checksum of everything written since `start`
    pub fn write_checksum_from(&mut self, start: usize) -> &mut Self {
        let sum = lookup3(&self.buffer[start..], 0);
        self.write_u32(sum)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
