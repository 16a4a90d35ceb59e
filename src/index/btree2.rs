//! Version 2 B-tree chunk index
//!
//! Records are ordered by scaled chunk coordinate. Internal nodes store
//! records between their child pointers, so a lookup may end on an
//! internal node. Every node is `node_size` bytes with a checksum after
//! its used portion.

use super::{
    ChunkLocation, IndexContext, RecordComparator, BTREE2_HEADER, BTREE2_INTERNAL_NODE,
    BTREE2_LEAF_NODE,
};
use crate::checksum::verify_metadata_checksum;
use crate::error::{H5Error, Result};
use crate::io::{ByteSource, FieldReader, UNDEFINED_ADDRESS};
use crate::layout::chunk_size_length;
use crate::utils::log2_floor;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Record type of unfiltered chunks
pub const RECORD_UNFILTERED_CHUNK: u8 = 10;
/// Record type of filtered chunks
pub const RECORD_FILTERED_CHUNK: u8 = 11;

/// Signature, version, type and checksum
const NODE_OVERHEAD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeInfo {
    max_records: u64,
    cumulative_max_records: u64,
    /// Width of the total-records field in pointers to nodes of this depth
    cumulative_size: usize,
}

#[derive(Debug, Clone)]
struct Record {
    address: u64,
    stored_size: u64,
    filter_mask: u32,
    scaled: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
struct NodePointer {
    address: u64,
    records: u64,
}

/// Bytes needed to encode values up to `limit`
fn limit_encoded_size(limit: u64) -> usize {
    log2_floor(limit) as usize / 8 + 1
}

/// Chunk index backed by a version 2 B-tree
#[derive(Debug, Clone)]
pub struct BTree2Index {
    record_type: u8,
    node_size: usize,
    record_size: usize,
    depth: u16,
    root: NodePointer,
    node_info: Vec<NodeInfo>,
    max_records_size: usize,
    size_length: usize,
    context: IndexContext,
    comparator: RecordComparator,
}

impl BTree2Index {
    pub(crate) async fn open(
        source: &dyn ByteSource,
        address: u64,
        context: IndexContext,
        comparator: RecordComparator,
    ) -> Result<Self> {
        let format = context.format;
        let size = 22 + format.offset_size as usize + format.length_size as usize;
        let block = source.read_at(address, size).await?;
        verify_metadata_checksum(&block, "b-tree v2 header")?;

        let mut reader = FieldReader::new(&block, format);
        reader.expect_signature(BTREE2_HEADER)?;

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(H5Error::UnsupportedVersion {
                structure: "b-tree v2 header",
                version,
            });
        }

        let record_type = reader.read_u8()?;
        let node_size = reader.read_u32()? as usize;
        let record_size = reader.read_u16()? as usize;
        let depth = reader.read_u16()?;
        let _split_percent = reader.read_u8()?;
        let _merge_percent = reader.read_u8()?;
        let root_address = reader.read_offset()?;
        let root_records = reader.read_u16()? as u64;
        let total_records = reader.read_length()?;

        let size_length = chunk_size_length(context.chunk_byte_size);
        let expected_record_size = match (record_type, context.filtered) {
            (RECORD_UNFILTERED_CHUNK, false) => format.offset_size as usize + 8 * context.rank,
            (RECORD_FILTERED_CHUNK, true) => {
                format.offset_size as usize + size_length + 4 + 8 * context.rank
            }
            _ => {
                return Err(H5Error::InvalidFormat(format!(
                    "b-tree v2 record type {} does not match dataset filters",
                    record_type
                )))
            }
        };
        if record_size != expected_record_size {
            return Err(H5Error::InvalidFormat(format!(
                "b-tree v2 records are {} bytes, expected {}",
                record_size, expected_record_size
            )));
        }
        if node_size <= NODE_OVERHEAD + record_size {
            return Err(H5Error::InvalidFormat(format!(
                "b-tree v2 node size {} cannot hold a record",
                node_size
            )));
        }

        let (node_info, max_records_size) =
            node_info_table(node_size, record_size, depth, format.offset_size as usize)?;

        debug!(
            depth,
            node_size,
            total_records,
            record_type,
            "opened b-tree v2"
        );

        Ok(Self {
            record_type,
            node_size,
            record_size,
            depth,
            root: NodePointer {
                address: root_address,
                records: root_records,
            },
            node_info,
            max_records_size,
            size_length,
            context,
            comparator,
        })
    }

    fn read_record(&self, reader: &mut FieldReader<'_>) -> Result<Record> {
        let address = reader.read_offset()?;

        let (stored_size, filter_mask) = if self.record_type == RECORD_FILTERED_CHUNK {
            (reader.read_uint(self.size_length)?, reader.read_u32()?)
        } else {
            (self.context.chunk_byte_size, 0)
        };

        let scaled = (0..self.context.rank)
            .map(|_| reader.read_u64())
            .collect::<Result<Vec<_>>>()?;

        Ok(Record {
            address,
            stored_size,
            filter_mask,
            scaled,
        })
    }

    /// Read the records of a node, and its child pointers when `depth > 0`
    async fn read_node(
        &self,
        source: &dyn ByteSource,
        pointer: NodePointer,
        depth: u16,
    ) -> Result<(Vec<Record>, Vec<NodePointer>)> {
        let (signature, structure) = if depth > 0 {
            (BTREE2_INTERNAL_NODE, "b-tree v2 internal node")
        } else {
            (BTREE2_LEAF_NODE, "b-tree v2 leaf node")
        };

        let level = depth as usize;
        if pointer.records > self.node_info[level].max_records {
            return Err(H5Error::InvalidFormat(format!(
                "{} at {} claims {} records, at most {} fit",
                structure, pointer.address, pointer.records, self.node_info[level].max_records
            )));
        }

        let block = source.read_at(pointer.address, self.node_size).await?;
        let mut reader = FieldReader::new(&block, self.context.format);
        reader.expect_signature(signature)?;

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(H5Error::UnsupportedVersion { structure, version });
        }
        let record_type = reader.read_u8()?;
        if record_type != self.record_type {
            return Err(H5Error::InvalidFormat(format!(
                "{} at {} holds record type {}, expected {}",
                structure, pointer.address, record_type, self.record_type
            )));
        }

        let records = (0..pointer.records)
            .map(|_| self.read_record(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        let mut children = Vec::new();
        if depth > 0 {
            let total_size = if depth > 1 {
                self.node_info[level - 1].cumulative_size
            } else {
                0
            };

            for _ in 0..=pointer.records {
                let address = reader.read_offset()?;
                let records = reader.read_uint(self.max_records_size)?;
                if total_size > 0 {
                    reader.read_uint(total_size)?;
                }
                children.push(NodePointer { address, records });
            }
        }

        let used = reader.position();
        if used + 4 > block.len() {
            return Err(H5Error::InvalidFormat(format!(
                "{} at {} overflows its node size",
                structure, pointer.address
            )));
        }
        verify_metadata_checksum(&block[..used + 4], structure)?;

        Ok((records, children))
    }

    pub async fn lookup(
        &self,
        source: &dyn ByteSource,
        scaled: &[u64],
    ) -> Result<Option<ChunkLocation>> {
        if self.root.address == UNDEFINED_ADDRESS || self.root.records == 0 {
            return Ok(None);
        }

        let mut pointer = self.root;
        let mut depth = self.depth;

        loop {
            let (records, children) = self.read_node(source, pointer, depth).await?;
            let (idx, cmp) = locate(&records, scaled, &self.comparator);

            if cmp == Ordering::Equal {
                return Ok(self.location(&records[idx]));
            }

            if depth == 0 {
                return Ok(None);
            }

            let child = if cmp == Ordering::Greater { idx + 1 } else { idx };
            trace!(depth, child, address = pointer.address, "descending b-tree v2");
            pointer = children[child];
            depth -= 1;
        }
    }

    fn location(&self, record: &Record) -> Option<ChunkLocation> {
        (record.address != UNDEFINED_ADDRESS).then_some(ChunkLocation {
            address: record.address,
            stored_size: record.stored_size,
            filter_mask: record.filter_mask,
        })
    }
}

/// Binary search over the records of one node
fn locate(records: &[Record], scaled: &[u64], comparator: &RecordComparator) -> (usize, Ordering) {
    let mut lo = 0;
    let mut hi = records.len();
    let mut idx = 0;
    let mut cmp = Ordering::Less;

    while lo < hi && cmp != Ordering::Equal {
        idx = (lo + hi) / 2;
        cmp = comparator.compare(scaled, &records[idx].scaled);

        if cmp == Ordering::Less {
            hi = idx;
        } else {
            lo = idx + 1;
        }
    }

    (idx, cmp)
}

/// Record capacities per depth, and the width of child record counts
fn node_info_table(
    node_size: usize,
    record_size: usize,
    depth: u16,
    offset_size: usize,
) -> Result<(Vec<NodeInfo>, usize)> {
    let leaf_records = ((node_size - NODE_OVERHEAD) / record_size) as u64;
    let max_records_size = limit_encoded_size(leaf_records);

    let mut table = vec![NodeInfo {
        max_records: leaf_records,
        cumulative_max_records: leaf_records,
        cumulative_size: 0,
    }];

    for level in 1..=depth as usize {
        let previous = table[level - 1];
        let pointer_size = offset_size + max_records_size + previous.cumulative_size;

        let max_records = node_size
            .checked_sub(NODE_OVERHEAD + pointer_size)
            .map(|space| (space / (record_size + pointer_size)) as u64)
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                H5Error::InvalidFormat(format!(
                    "b-tree v2 internal nodes of {} bytes cannot hold a record at depth {}",
                    node_size, level
                ))
            })?;

        let cumulative_max_records = (max_records + 1)
            .saturating_mul(previous.cumulative_max_records)
            .saturating_add(max_records);

        table.push(NodeInfo {
            max_records,
            cumulative_max_records,
            cumulative_size: limit_encoded_size(cumulative_max_records),
        });
    }

    Ok((table, max_records_size))
}
