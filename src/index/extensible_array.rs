//! Extensible array chunk index, used when exactly one dimension is unlimited
//!
//! Elements are addressed by the linear chunk index computed with the
//! unlimited dimension moved to the front, so growing that dimension only
//! ever appends. The first elements live in the index block itself; the
//! rest are spread over data blocks that double in size every other super
//! block. Data blocks larger than a page are split into checksummed pages.

use super::{
    bit_is_set, element_size_length, read_array_element, ChunkLocation, IndexContext,
    CLIENT_FILTERED_CHUNKS, CLIENT_UNFILTERED_CHUNKS, EXTENSIBLE_ARRAY_DATA_BLOCK,
    EXTENSIBLE_ARRAY_HEADER, EXTENSIBLE_ARRAY_INDEX_BLOCK, EXTENSIBLE_ARRAY_SECONDARY_BLOCK,
};
use crate::checksum::verify_metadata_checksum;
use crate::error::{H5Error, Result};
use crate::io::{ByteSource, FieldReader, UNDEFINED_ADDRESS};
use crate::utils::{accumulate_reverse, linear_index, log2_floor, swizzle, to_usize};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SuperBlockInfo {
    /// Data blocks in this super block
    data_blocks: u64,
    /// Elements per data block
    block_elements: u64,
    /// First element index covered, relative to the end of the index block
    start_index: u64,
    /// Ordinal of the first data block
    start_block: u64,
}

#[derive(Debug, Clone)]
struct ExtensibleArrayHeader {
    element_size: usize,
    max_elements_bits: u8,
    index_block_elements: u64,
    data_block_min_elements: u64,
    super_block_min_data_pointers: u64,
    page_bits: u8,
    max_index_set: u64,
    index_block: u64,
}

impl ExtensibleArrayHeader {
    fn block_offset_size(&self) -> usize {
        (self.max_elements_bits as usize + 7) / 8
    }

    fn page_elements(&self) -> u64 {
        1u64 << self.page_bits
    }

    /// Super blocks whose data blocks are referenced by the index block
    fn index_block_super_blocks(&self) -> usize {
        2 * log2_floor(self.super_block_min_data_pointers) as usize
    }

    fn index_block_data_blocks(&self) -> usize {
        2 * (self.super_block_min_data_pointers as usize - 1)
    }
}

#[derive(Debug, Clone)]
struct IndexBlock {
    elements: Vec<u8>,
    data_blocks: Vec<u64>,
    super_blocks: Vec<u64>,
}

/// Chunk index backed by an extensible array
#[derive(Debug)]
pub struct ExtensibleArrayIndex {
    header: ExtensibleArrayHeader,
    super_blocks: Vec<SuperBlockInfo>,
    swizzled_down: Vec<u64>,
    unlimited_dim: usize,
    size_length: usize,
    index_block: OnceCell<IndexBlock>,
    context: IndexContext,
}

impl ExtensibleArrayIndex {
    pub(crate) async fn open(
        source: &dyn ByteSource,
        address: u64,
        unlimited_dim: usize,
        context: IndexContext,
    ) -> Result<Self> {
        let format = context.format;
        let size = 16 + 6 * format.length_size as usize + format.offset_size as usize;
        let block = source.read_at(address, size).await?;
        verify_metadata_checksum(&block, "extensible array header")?;

        let mut reader = FieldReader::new(&block, format);
        reader.expect_signature(EXTENSIBLE_ARRAY_HEADER)?;

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(H5Error::UnsupportedVersion {
                structure: "extensible array header",
                version,
            });
        }

        let client_id = reader.read_u8()?;
        let expected_client = if context.filtered {
            CLIENT_FILTERED_CHUNKS
        } else {
            CLIENT_UNFILTERED_CHUNKS
        };
        if client_id != expected_client {
            return Err(H5Error::InvalidFormat(format!(
                "extensible array client {} does not match dataset filters",
                client_id
            )));
        }

        let element_size = reader.read_u8()? as usize;
        let max_elements_bits = reader.read_u8()?;
        let index_block_elements = reader.read_u8()? as u64;
        let data_block_min_elements = reader.read_u8()? as u64;
        let super_block_min_data_pointers = reader.read_u8()? as u64;
        let page_bits = reader.read_u8()?;

        // super block count, super block size, data block count, data block size
        for _ in 0..4 {
            reader.read_length()?;
        }
        let max_index_set = reader.read_length()?;
        let _realized_elements = reader.read_length()?;
        let index_block = reader.read_offset()?;

        for (name, value) in [
            ("data block minimum elements", data_block_min_elements),
            ("super block minimum data pointers", super_block_min_data_pointers),
        ] {
            if !value.is_power_of_two() {
                return Err(H5Error::InvalidFormat(format!(
                    "extensible array {} must be a power of two, got {}",
                    name, value
                )));
            }
        }

        let header = ExtensibleArrayHeader {
            element_size,
            max_elements_bits,
            index_block_elements,
            data_block_min_elements,
            super_block_min_data_pointers,
            page_bits,
            max_index_set,
            index_block,
        };

        let super_blocks = super_block_table(&header)?;
        let size_length = element_size_length(&context, element_size)?;

        let mut swizzled_max = context.scaled_max_dims.clone();
        swizzle(&mut swizzled_max, unlimited_dim);
        let swizzled_down = accumulate_reverse(&swizzled_max);

        debug!(
            super_blocks = super_blocks.len(),
            max_index_set,
            unlimited_dim,
            "opened extensible array"
        );

        Ok(Self {
            header,
            super_blocks,
            swizzled_down,
            unlimited_dim,
            size_length,
            index_block: OnceCell::new(),
            context,
        })
    }

    async fn index_block(&self, source: &dyn ByteSource) -> Result<&IndexBlock> {
        self.index_block
            .get_or_try_init(|| self.read_index_block(source))
            .await
    }

    async fn read_index_block(&self, source: &dyn ByteSource) -> Result<IndexBlock> {
        let header = &self.header;
        let format = self.context.format;
        let offset_size = format.offset_size as usize;

        let data_block_count = header.index_block_data_blocks();
        let super_block_count = self
            .super_blocks
            .len()
            .saturating_sub(header.index_block_super_blocks());
        let elements_size = header.index_block_elements as usize * header.element_size;

        let size = 10
            + offset_size
            + elements_size
            + (data_block_count + super_block_count) * offset_size;
        let block = source.read_at(header.index_block, size).await?;
        verify_metadata_checksum(&block, "extensible array index block")?;

        let mut reader = FieldReader::new(&block, format);
        reader.expect_signature(EXTENSIBLE_ARRAY_INDEX_BLOCK)?;
        check_version(&mut reader, "extensible array index block")?;
        reader.skip(1 + offset_size)?;

        let elements = reader.read_bytes(elements_size)?.to_vec();
        let data_blocks = (0..data_block_count)
            .map(|_| reader.read_offset())
            .collect::<Result<Vec<_>>>()?;
        let super_blocks = (0..super_block_count)
            .map(|_| reader.read_offset())
            .collect::<Result<Vec<_>>>()?;

        Ok(IndexBlock {
            elements,
            data_blocks,
            super_blocks,
        })
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

    /// Size of the data block prefix, checksum included
    fn data_block_prefix(&self) -> usize {
        10 + self.context.format.offset_size as usize + self.header.block_offset_size()
    }

    fn page_size(&self) -> u64 {
        self.header.page_elements() * self.header.element_size as u64 + 4
    }

    pub async fn lookup(
        &self,
        source: &dyn ByteSource,
        scaled: &[u64],
    ) -> Result<Option<ChunkLocation>> {
        let mut coords = scaled.to_vec();
        swizzle(&mut coords, self.unlimited_dim);
        let index = linear_index(&coords, &self.swizzled_down);

        let header = &self.header;
        if index >= header.max_index_set || header.index_block == UNDEFINED_ADDRESS {
            return Ok(None);
        }

        let index_block = self.index_block(source).await?;

        if index < header.index_block_elements {
            let start = index as usize * header.element_size;
            return self.decode(&index_block.elements[start..start + header.element_size]);
        }

        let relative = index - header.index_block_elements;
        let super_block = log2_floor(relative / header.data_block_min_elements + 1) as usize;
        let info = self.super_blocks.get(super_block).copied().ok_or_else(|| {
            H5Error::OutOfBounds(format!("element {} beyond the last super block", index))
        })?;
        let element = relative - info.start_index;

        trace!(index, super_block, element, "extensible array lookup");

        if super_block < header.index_block_super_blocks() {
            let block = info.start_block + element / info.block_elements;
            let address = index_block
                .data_blocks
                .get(block as usize)
                .copied()
                .unwrap_or(UNDEFINED_ADDRESS);
            if address == UNDEFINED_ADDRESS {
                return Ok(None);
            }

            let element = element % info.block_elements;
            if info.block_elements > header.page_elements() {
                let page = element / header.page_elements();
                let page_address =
                    address + self.data_block_prefix() as u64 + page * self.page_size();
                return self
                    .read_page_element(source, page_address, element % header.page_elements())
                    .await;
            }

            return self
                .read_data_block_element(source, address, info.block_elements, element)
                .await;
        }

        let super_block_address = index_block
            .super_blocks
            .get(super_block - header.index_block_super_blocks())
            .copied()
            .unwrap_or(UNDEFINED_ADDRESS);
        if super_block_address == UNDEFINED_ADDRESS {
            return Ok(None);
        }

        self.lookup_in_super_block(source, super_block_address, info, element)
            .await
    }

    async fn lookup_in_super_block(
        &self,
        source: &dyn ByteSource,
        address: u64,
        info: SuperBlockInfo,
        element: u64,
    ) -> Result<Option<ChunkLocation>> {
        let header = &self.header;
        let format = self.context.format;
        let offset_size = format.offset_size as usize;

        let paged = info.block_elements > header.page_elements();
        let pages = if paged {
            info.block_elements / header.page_elements()
        } else {
            0
        };
        let bitmap_size = to_usize((info.data_blocks * pages + 7) / 8, "page bitmap")?;

        let size = 10
            + offset_size
            + header.block_offset_size()
            + bitmap_size
            + to_usize(info.data_blocks, "super block")? * offset_size;
        let block = source.read_at(address, size).await?;
        verify_metadata_checksum(&block, "extensible array super block")?;

        let mut reader = FieldReader::new(&block, format);
        reader.expect_signature(EXTENSIBLE_ARRAY_SECONDARY_BLOCK)?;
        check_version(&mut reader, "extensible array super block")?;
        reader.skip(1 + offset_size + header.block_offset_size())?;
        let bitmap = reader.read_bytes(bitmap_size)?;
        let data_blocks = (0..info.data_blocks)
            .map(|_| reader.read_offset())
            .collect::<Result<Vec<_>>>()?;

        let block_index = element / info.block_elements;
        let element = element % info.block_elements;
        let data_block = data_blocks
            .get(block_index as usize)
            .copied()
            .unwrap_or(UNDEFINED_ADDRESS);
        if data_block == UNDEFINED_ADDRESS {
            return Ok(None);
        }

        if !paged {
            return self
                .read_data_block_element(source, data_block, info.block_elements, element)
                .await;
        }

        let page = element / header.page_elements();
        if !bit_is_set(bitmap, block_index * pages + page) {
            trace!(block_index, page, "extensible array page never written");
            return Ok(None);
        }

        let page_address = data_block + self.data_block_prefix() as u64 + page * self.page_size();
        self.read_page_element(source, page_address, element % header.page_elements())
            .await
    }

    async fn read_data_block_element(
        &self,
        source: &dyn ByteSource,
        address: u64,
        block_elements: u64,
        element: u64,
    ) -> Result<Option<ChunkLocation>> {
        let element_size = self.header.element_size;
        let elements_start = self.data_block_prefix() - 4;
        let size = elements_start + to_usize(block_elements, "data block")? * element_size + 4;

        let block = source.read_at(address, size).await?;
        verify_metadata_checksum(&block, "extensible array data block")?;

        let mut reader = FieldReader::new(&block, self.context.format);
        reader.expect_signature(EXTENSIBLE_ARRAY_DATA_BLOCK)?;
        check_version(&mut reader, "extensible array data block")?;

        let start = elements_start + element as usize * element_size;
        self.decode(&block[start..start + element_size])
    }

    async fn read_page_element(
        &self,
        source: &dyn ByteSource,
        address: u64,
        element: u64,
    ) -> Result<Option<ChunkLocation>> {
        let page = source
            .read_at(address, to_usize(self.page_size(), "data block page")?)
            .await?;
        verify_metadata_checksum(&page, "extensible array data block page")?;

        let element_size = self.header.element_size;
        let start = element as usize * element_size;
        self.decode(&page[start..start + element_size])
    }
}

fn check_version(reader: &mut FieldReader<'_>, structure: &'static str) -> Result<()> {
    let version = reader.read_u8()?;
    if version != 0 {
        return Err(H5Error::UnsupportedVersion { structure, version });
    }
    Ok(())
}

/// Per super block data block counts, sizes and starting offsets
fn super_block_table(header: &ExtensibleArrayHeader) -> Result<Vec<SuperBlockInfo>> {
    let count = (1 + header.max_elements_bits as u32)
        .checked_sub(log2_floor(header.data_block_min_elements))
        .filter(|&count| count > 0 && count <= 64)
        .ok_or_else(|| {
            H5Error::InvalidFormat(format!(
                "extensible array with {} element bits cannot hold data blocks of {}",
                header.max_elements_bits, header.data_block_min_elements
            ))
        })?;

    let mut table = Vec::with_capacity(count as usize);
    let mut start_index = 0u64;
    let mut start_block = 0u64;

    for u in 0..count {
        let data_blocks = 1u64 << (u / 2);
        let block_elements = (1u64 << ((u + 1) / 2)).saturating_mul(header.data_block_min_elements);

        table.push(SuperBlockInfo {
            data_blocks,
            block_elements,
            start_index,
            start_block,
        });

        start_index = start_index.saturating_add(data_blocks.saturating_mul(block_elements));
        start_block = start_block.saturating_add(data_blocks);
    }

    Ok(table)
}
