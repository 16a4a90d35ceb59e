//! Version 1 B-tree of raw data chunks
//!
//! Each node holds `entries` children separated by `entries + 1` keys. A
//! key records the stored size and filter mask of the chunk to its right
//! plus the element offset of that chunk, with one trailing offset for
//! the element byte dimension. Nodes carry no checksum.

use super::{compare_scaled, ChunkLocation, IndexContext, BTREE1_NODE};
use crate::error::{H5Error, Result};
use crate::io::{ByteSource, FieldReader, UNDEFINED_ADDRESS};
use crate::utils::to_usize;
use std::cmp::Ordering;
use tracing::trace;

/// Node type of trees indexing raw data chunks
const RAW_DATA_NODE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeKey {
    stored_size: u32,
    filter_mask: u32,
    scaled: Vec<u64>,
}

#[derive(Debug)]
struct Node {
    level: u8,
    keys: Vec<NodeKey>,
    children: Vec<u64>,
}

/// Chunk index backed by a version 1 B-tree
#[derive(Debug, Clone)]
pub struct BTree1Index {
    root: u64,
    chunk_dims: Vec<u64>,
    context: IndexContext,
}

impl BTree1Index {
    pub(crate) fn new(root: u64, chunk_dims: &[u64], context: IndexContext) -> Self {
        Self {
            root,
            chunk_dims: chunk_dims.to_vec(),
            context,
        }
    }

    fn header_size(&self) -> usize {
        8 + 2 * self.context.format.offset_size as usize
    }

    fn key_size(&self) -> usize {
        8 + 8 * (self.context.rank + 1)
    }

    async fn read_node(&self, source: &dyn ByteSource, address: u64) -> Result<Node> {
        let format = self.context.format;
        let header = source.read_at(address, self.header_size()).await?;
        let mut reader = FieldReader::new(&header, format);

        reader.expect_signature(BTREE1_NODE)?;
        let node_type = reader.read_u8()?;
        if node_type != RAW_DATA_NODE {
            return Err(H5Error::InvalidFormat(format!(
                "b-tree node at {} has type {}, expected raw data chunks",
                address, node_type
            )));
        }
        let level = reader.read_u8()?;
        let entries = reader.read_u16()? as usize;
        // left and right siblings follow, unused

        let body_size = (entries + 1) * self.key_size() + entries * format.offset_size as usize;
        let body_address = address + self.header_size() as u64;
        let body = source.read_at(body_address, to_usize(body_size as u64, "b-tree node")?).await?;
        let mut reader = FieldReader::new(&body, format);

        let mut keys = Vec::with_capacity(entries + 1);
        let mut children = Vec::with_capacity(entries);
        for i in 0..=entries {
            keys.push(self.read_key(&mut reader)?);
            if i < entries {
                children.push(reader.read_offset()?);
            }
        }

        Ok(Node {
            level,
            keys,
            children,
        })
    }

    fn read_key(&self, reader: &mut FieldReader<'_>) -> Result<NodeKey> {
        let stored_size = reader.read_u32()?;
        let filter_mask = reader.read_u32()?;

        let mut scaled = Vec::with_capacity(self.context.rank);
        for dim in 0..=self.context.rank {
            let offset = reader.read_u64()?;
            if dim < self.context.rank {
                scaled.push(offset / self.chunk_dims[dim]);
            }
        }

        Ok(NodeKey {
            stored_size,
            filter_mask,
            scaled,
        })
    }

    pub async fn lookup(
        &self,
        source: &dyn ByteSource,
        scaled: &[u64],
    ) -> Result<Option<ChunkLocation>> {
        if self.root == UNDEFINED_ADDRESS {
            return Ok(None);
        }

        let mut address = self.root;
        let mut expected_level: Option<u8> = None;

        loop {
            let node = self.read_node(source, address).await?;

            if let Some(level) = expected_level {
                if node.level != level {
                    return Err(H5Error::InvalidFormat(format!(
                        "b-tree node at {} has level {}, expected {}",
                        address, node.level, level
                    )));
                }
            }

            let Some(idx) = Self::search(&node, scaled) else {
                return Ok(None);
            };

            if node.level > 0 {
                trace!(address, level = node.level, child = idx, "descending b-tree");
                address = node.children[idx];
                expected_level = Some(node.level - 1);
                continue;
            }

            let key = &node.keys[idx];
            if key.scaled != scaled {
                return Ok(None);
            }

            return Ok(Some(ChunkLocation {
                address: node.children[idx],
                stored_size: key.stored_size as u64,
                filter_mask: key.filter_mask,
            }));
        }
    }

    /// Child whose key range `[key[i], key[i + 1])` contains `scaled`
    fn search(node: &Node, scaled: &[u64]) -> Option<usize> {
        let mut lt = 0;
        let mut rt = node.children.len();
        let mut idx = 0;
        let mut cmp = Ordering::Less;

        while lt < rt && cmp != Ordering::Equal {
            idx = (lt + rt) / 2;

            cmp = if compare_scaled(scaled, &node.keys[idx + 1].scaled) != Ordering::Less {
                Ordering::Greater
            } else if compare_scaled(scaled, &node.keys[idx].scaled) == Ordering::Less {
                Ordering::Less
            } else {
                Ordering::Equal
            };

            if cmp == Ordering::Less {
                rt = idx;
            } else {
                lt = idx + 1;
            }
        }

        (cmp == Ordering::Equal).then_some(idx)
    }
}
