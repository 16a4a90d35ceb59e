//! Fixed array chunk index
//!
//! One entry per chunk of the maximum grid. Large arrays split their data
//! block into pages of `1 << page_bits` entries, and a bitmap in the data
//! block prefix records which pages were ever written.

use super::{
    bit_is_set, element_size_length, read_array_element, ChunkLocation, IndexContext,
    CLIENT_FILTERED_CHUNKS, CLIENT_UNFILTERED_CHUNKS, FIXED_ARRAY_DATA_BLOCK, FIXED_ARRAY_HEADER,
};
use crate::checksum::verify_metadata_checksum;
use crate::error::{H5Error, Result};
use crate::io::{ByteSource, FieldReader, UNDEFINED_ADDRESS};
use crate::utils::{ceil_div, linear_index, to_usize};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct FixedArrayHeader {
    client_id: u8,
    entry_size: usize,
    page_bits: u8,
    entries: u64,
    data_block: u64,
}

impl FixedArrayHeader {
    fn entries_per_page(&self) -> u64 {
        1u64 << self.page_bits
    }

    fn is_paged(&self) -> bool {
        self.entries > self.entries_per_page()
    }

    fn page_count(&self) -> u64 {
        ceil_div(self.entries, self.entries_per_page())
    }
}

/// Chunk index backed by a fixed array
#[derive(Debug, Clone)]
pub struct FixedArrayIndex {
    header: FixedArrayHeader,
    size_length: usize,
    context: IndexContext,
}

impl FixedArrayIndex {
    pub(crate) async fn open(
        source: &dyn ByteSource,
        address: u64,
        context: IndexContext,
    ) -> Result<Self> {
        let format = context.format;
        let size = 12 + format.length_size as usize + format.offset_size as usize;
        let block = source.read_at(address, size).await?;
        verify_metadata_checksum(&block, "fixed array header")?;

        let mut reader = FieldReader::new(&block, format);
        reader.expect_signature(FIXED_ARRAY_HEADER)?;

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(H5Error::UnsupportedVersion {
                structure: "fixed array header",
                version,
            });
        }

        let header = FixedArrayHeader {
            client_id: reader.read_u8()?,
            entry_size: reader.read_u8()? as usize,
            page_bits: reader.read_u8()?,
            entries: reader.read_length()?,
            data_block: reader.read_offset()?,
        };

        let expected_client = if context.filtered {
            CLIENT_FILTERED_CHUNKS
        } else {
            CLIENT_UNFILTERED_CHUNKS
        };
        if header.client_id != expected_client {
            return Err(H5Error::InvalidFormat(format!(
                "fixed array client {} does not match dataset filters",
                header.client_id
            )));
        }

        let size_length = element_size_length(&context, header.entry_size)?;

        debug!(
            entries = header.entries,
            entry_size = header.entry_size,
            paged = header.is_paged(),
            "opened fixed array"
        );

        let index = Self {
            header,
            size_length,
            context,
        };

        // an unpaged data block is checked once, lookups then read single entries
        if !index.header.is_paged() && index.header.data_block != UNDEFINED_ADDRESS {
            let size = index.prefix_size()
                + to_usize(index.header.entries, "fixed array")? * index.header.entry_size
                + 4;
            let block = source.read_at(index.header.data_block, size).await?;
            index.check_data_block(&block)?;
        }

        Ok(index)
    }

    /// Signature, version, client id and header address
    fn prefix_size(&self) -> usize {
        6 + self.context.format.offset_size as usize
    }

    fn decode(&self, element: &[u8]) -> Result<Option<ChunkLocation>> {
        let mut reader = FieldReader::new(element, self.context.format);
        read_array_element(
            &mut reader,
            self.context.filtered,
            self.size_length,
            self.context.chunk_byte_size,
        )
    }

    pub async fn lookup(
        &self,
        source: &dyn ByteSource,
        scaled: &[u64],
    ) -> Result<Option<ChunkLocation>> {
        let header = &self.header;
        let index = linear_index(scaled, &self.context.down_max_chunk_counts);

        if index >= header.entries || header.data_block == UNDEFINED_ADDRESS {
            return Ok(None);
        }

        let prefix = self.prefix_size();

        if !header.is_paged() {
            let entry_offset = to_usize(index, "fixed array index")? * header.entry_size;
            let address = header.data_block + (prefix + entry_offset) as u64;
            let element = source.read_at(address, header.entry_size).await?;
            return self.decode(&element);
        }

        let bitmap_size = to_usize(ceil_div(header.page_count(), 8), "page bitmap")?;
        let block = source
            .read_at(header.data_block, prefix + bitmap_size + 4)
            .await?;
        self.check_data_block(&block)?;

        let per_page = header.entries_per_page();
        let page = index / per_page;
        if !bit_is_set(&block[prefix..prefix + bitmap_size], page) {
            trace!(page, "fixed array page never written");
            return Ok(None);
        }

        let last_page = header.page_count() - 1;
        let page_entries = if page == last_page && header.entries % per_page != 0 {
            header.entries % per_page
        } else {
            per_page
        };

        let full_page_size = per_page * header.entry_size as u64 + 4;
        let page_address = header.data_block + (prefix + bitmap_size + 4) as u64 + page * full_page_size;
        let page_size = to_usize(page_entries, "fixed array page")? * header.entry_size + 4;

        let bytes = source.read_at(page_address, page_size).await?;
        verify_metadata_checksum(&bytes, "fixed array page")?;

        let start = to_usize(index % per_page, "fixed array index")? * header.entry_size;
        self.decode(&bytes[start..start + header.entry_size])
    }

    fn check_data_block(&self, block: &[u8]) -> Result<()> {
        verify_metadata_checksum(block, "fixed array data block")?;

        let mut reader = FieldReader::new(block, self.context.format);
        reader.expect_signature(FIXED_ARRAY_DATA_BLOCK)?;
        let version = reader.read_u8()?;
        if version != 0 {
            return Err(H5Error::UnsupportedVersion {
                structure: "fixed array data block",
                version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FieldWriter, FormatContext, MemoryByteSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    const HEADER: u64 = 0;
    const DATA_BLOCK: u64 = 100;

    struct RecordingSource {
        inner: MemoryByteSource,
        reads: Mutex<Vec<(u64, usize)>>,
    }

    #[async_trait]
    impl ByteSource for RecordingSource {
        async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
            self.reads.lock().push((offset, len));
            self.inner.read_at(offset, len).await
        }

        async fn len(&self) -> Result<u64> {
            self.inner.len().await
        }
    }

    fn context(filtered: bool, entries: u64) -> IndexContext {
        IndexContext {
            format: FormatContext::default(),
            rank: 1,
            chunk_byte_size: 20,
            scaled_max_dims: vec![entries],
            down_max_chunk_counts: vec![1],
            filtered,
        }
    }

    fn write_header(writer: &mut FieldWriter, client: u8, entry_size: u8, page_bits: u8, entries: u64) {
        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_HEADER)
            .write_u8(0)
            .write_u8(client)
            .write_u8(entry_size)
            .write_u8(page_bits)
            .write_length(entries)
            .write_offset(DATA_BLOCK)
            .write_checksum_from(start);
    }

    fn pad_to(writer: &mut FieldWriter, position: u64) {
        let padding = position as usize - writer.len();
        writer.write_bytes(&vec![0u8; padding]);
    }

    #[tokio::test]
    async fn test_unpaged_unfiltered() {
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 0, 8, 10, 4);
        pad_to(&mut writer, DATA_BLOCK);

        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_DATA_BLOCK)
            .write_u8(0)
            .write_u8(0)
            .write_offset(HEADER);
        for address in [1000, 1020, UNDEFINED_ADDRESS, 1040] {
            writer.write_offset(address);
        }
        writer.write_checksum_from(start);

        let source = MemoryByteSource::new(writer.into_bytes());
        let index = FixedArrayIndex::open(&source, HEADER, context(false, 4))
            .await
            .unwrap();

        let location = index.lookup(&source, &[1]).await.unwrap().unwrap();
        assert_eq!(location.address, 1020);
        assert_eq!(location.stored_size, 20);
        assert!(index.lookup(&source, &[2]).await.unwrap().is_none());
        assert_eq!(index.lookup(&source, &[3]).await.unwrap().unwrap().address, 1040);
        assert!(index.lookup(&source, &[4]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filtered_elements() {
        // 8-byte address, 2-byte size, 4-byte mask
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 1, 14, 10, 2);
        pad_to(&mut writer, DATA_BLOCK);

        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_DATA_BLOCK)
            .write_u8(0)
            .write_u8(1)
            .write_offset(HEADER)
            .write_offset(2000)
            .write_uint(13, 2)
            .write_u32(0)
            .write_offset(2013)
            .write_uint(9, 2)
            .write_u32(0b1)
            .write_checksum_from(start);

        let source = MemoryByteSource::new(writer.into_bytes());
        let index = FixedArrayIndex::open(&source, HEADER, context(true, 2))
            .await
            .unwrap();

        let location = index.lookup(&source, &[1]).await.unwrap().unwrap();
        assert_eq!(
            location,
            ChunkLocation {
                address: 2013,
                stored_size: 9,
                filter_mask: 1
            }
        );
    }

    #[tokio::test]
    async fn test_paged_with_unwritten_page() {
        // 10 entries, 4 per page: pages of 4, 4 and 2; page 1 never written
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 0, 8, 2, 10);
        pad_to(&mut writer, DATA_BLOCK);

        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_DATA_BLOCK)
            .write_u8(0)
            .write_u8(0)
            .write_offset(HEADER)
            .write_u8(0b1010_0000)
            .write_checksum_from(start);

        for (page, count) in [(0u64, 4u64), (1, 4), (2, 2)] {
            let page_start = writer.len();
            for i in 0..count {
                writer.write_offset(5000 + (page * 4 + i) * 20);
            }
            writer.write_checksum_from(page_start);
        }

        let source = MemoryByteSource::new(writer.into_bytes());
        let index = FixedArrayIndex::open(&source, HEADER, context(false, 10))
            .await
            .unwrap();

        assert_eq!(index.lookup(&source, &[3]).await.unwrap().unwrap().address, 5060);
        assert!(index.lookup(&source, &[5]).await.unwrap().is_none());
        assert_eq!(index.lookup(&source, &[9]).await.unwrap().unwrap().address, 5180);
    }

    #[tokio::test]
    async fn test_unpaged_lookup_reads_one_entry() {
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 0, 8, 10, 3);
        pad_to(&mut writer, DATA_BLOCK);

        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_DATA_BLOCK)
            .write_u8(0)
            .write_u8(0)
            .write_offset(HEADER);
        for address in [1000, 1020, 1040] {
            writer.write_offset(address);
        }
        writer.write_checksum_from(start);

        let source = RecordingSource {
            inner: MemoryByteSource::new(writer.into_bytes()),
            reads: Mutex::new(Vec::new()),
        };
        let index = FixedArrayIndex::open(&source, HEADER, context(false, 3))
            .await
            .unwrap();
        source.reads.lock().clear();

        assert_eq!(index.lookup(&source, &[2]).await.unwrap().unwrap().address, 1040);
        // data block prefix is 14 bytes, entry 2 follows two 8-byte entries
        assert_eq!(*source.reads.lock(), vec![(DATA_BLOCK + 14 + 16, 8)]);
    }

    #[tokio::test]
    async fn test_corrupt_unpaged_data_block() {
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 0, 8, 10, 1);
        pad_to(&mut writer, DATA_BLOCK);

        let start = writer.len();
        writer
            .write_bytes(FIXED_ARRAY_DATA_BLOCK)
            .write_u8(0)
            .write_u8(0)
            .write_offset(HEADER)
            .write_offset(1000)
            .write_checksum_from(start);
        let mut bytes = writer.into_bytes();
        bytes[DATA_BLOCK as usize + 15] ^= 0xff;

        let source = MemoryByteSource::new(bytes);
        assert!(matches!(
            FixedArrayIndex::open(&source, HEADER, context(false, 1)).await,
            Err(H5Error::ChecksumMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_header_checksum() {
        let mut writer = FieldWriter::new(FormatContext::default());
        write_header(&mut writer, 0, 8, 10, 4);
        let mut bytes = writer.into_bytes();
        bytes[7] ^= 0xff;

        let source = MemoryByteSource::new(bytes);
        assert!(matches!(
            FixedArrayIndex::open(&source, HEADER, context(false, 4)).await,
            Err(H5Error::ChecksumMismatch(_))
        ));
    }
}
