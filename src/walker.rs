//! Projection of selections onto chunk-relative runs

use crate::error::{H5Error, Result};
use crate::selection::{Selection, SelectionRun};
use crate::utils::accumulate_reverse;

/// A maximal run of selected elements inside a single chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeStep {
    /// Scaled chunk coordinate
    pub chunk: Vec<u64>,
    /// Row-major element offset inside the chunk
    pub offset: u64,
    /// Number of consecutive elements
    pub length: u64,
}

/// Walk `selection` over a dataspace of `dims` split into `chunk_dims` chunks.
///
/// The walk performs no I/O and can be restarted by calling it again.
/// Passing `chunk_dims == dims` yields offsets into one unchunked buffer.
pub fn walk<'a>(
    rank: usize,
    dims: &'a [u64],
    chunk_dims: &'a [u64],
    selection: &'a Selection,
) -> Result<ChunkWalker<'a>> {
    if dims.len() != rank || chunk_dims.len() != rank {
        return Err(H5Error::InvalidDimensions(format!(
            "rank {} does not match dims {:?} and chunk dims {:?}",
            rank, dims, chunk_dims
        )));
    }

    if rank == 0 {
        return Err(H5Error::InvalidDimensions(
            "cannot walk a rank-0 dataspace".to_string(),
        ));
    }

    if chunk_dims.iter().any(|&c| c == 0) {
        return Err(H5Error::InvalidDimensions(format!(
            "chunk dims must be positive, got {:?}",
            chunk_dims
        )));
    }

    Ok(ChunkWalker {
        runs: selection.runs(dims)?,
        chunk_dims,
        down: accumulate_reverse(chunk_dims),
        current: None,
    })
}

/// Iterator returned by [`walk`]
pub struct ChunkWalker<'a> {
    runs: Box<dyn Iterator<Item = Result<SelectionRun>> + Send + 'a>,
    chunk_dims: &'a [u64],
    down: Vec<u64>,
    current: Option<SelectionRun>,
}

impl Iterator for ChunkWalker<'_> {
    type Item = Result<RelativeStep>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current.as_ref().map_or(true, |run| run.length == 0) {
            match self.runs.next()? {
                Ok(run) => self.current = Some(run),
                Err(e) => return Some(Err(e)),
            }
        }
        let run = self.current.as_mut()?;

        let last = self.chunk_dims.len() - 1;
        let mut chunk = Vec::with_capacity(self.chunk_dims.len());
        let mut offset = 0u64;

        for (dim, (&coord, &size)) in run.coords.iter().zip(self.chunk_dims).enumerate() {
            chunk.push(coord / size);
            offset += (coord % size) * self.down[dim];
        }

        let room = self.chunk_dims[last] - run.coords[last] % self.chunk_dims[last];
        let length = room.min(run.length);

        run.coords[last] += length;
        run.length -= length;

        Some(Ok(RelativeStep {
            chunk,
            offset,
            length,
        }))
    }
}
