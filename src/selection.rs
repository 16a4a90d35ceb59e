//! Dataset selections and their contiguous-run iterators
//!
//! Every selection can describe itself as an ordered stream of
//! [`SelectionRun`]s: maximal runs of consecutive elements along the last
//! (fastest varying) dimension. Runs are produced in row-major order and
//! never cross the dataset bounds.

use crate::error::{H5Error, Result};
use serde::{Deserialize, Serialize};

/// A run of `length` consecutive elements starting at `coords`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRun {
    pub coords: Vec<u64>,
    pub length: u64,
}

impl SelectionRun {
    pub fn new(coords: Vec<u64>, length: u64) -> Self {
        Self { coords, length }
    }
}

/// Regular (start, stride, count, block) selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperslabSelection {
    pub starts: Vec<u64>,
    pub strides: Vec<u64>,
    pub counts: Vec<u64>,
    pub blocks: Vec<u64>,
}

impl HyperslabSelection {
    /// Create a hyperslab, validating its parameters
    pub fn new(
        starts: Vec<u64>,
        strides: Vec<u64>,
        counts: Vec<u64>,
        blocks: Vec<u64>,
    ) -> Result<Self> {
        let slab = Self {
            starts,
            strides,
            counts,
            blocks,
        };
        slab.validate()?;
        Ok(slab)
    }

    /// Check rank agreement, strides, and that every extent fits in `u64`
    pub fn validate(&self) -> Result<()> {
        let rank = self.starts.len();

        if self.strides.len() != rank || self.counts.len() != rank || self.blocks.len() != rank {
            return Err(H5Error::InvalidSelection(
                "starts, strides, counts and blocks must have the same rank".to_string(),
            ));
        }

        for dim in 0..rank {
            if self.strides[dim] == 0 {
                return Err(H5Error::InvalidSelection(format!(
                    "stride of dimension {} must be greater than zero",
                    dim
                )));
            }

            if self.counts[dim] > 1 && self.strides[dim] < self.blocks[dim] {
                return Err(H5Error::InvalidSelection(format!(
                    "stride {} of dimension {} is smaller than block {}",
                    self.strides[dim], dim, self.blocks[dim]
                )));
            }

            self.stop(dim)?;
        }

        self.checked_shape()?
            .iter()
            .try_fold(1u64, |total, &extent| total.checked_mul(extent))
            .ok_or_else(|| {
                H5Error::InvalidSelection("selected element count overflows u64".to_string())
            })?;

        Ok(())
    }

    /// Hyperslab with a block size of one in every dimension
    pub fn strided(starts: Vec<u64>, strides: Vec<u64>, counts: Vec<u64>) -> Result<Self> {
        let blocks = vec![1; starts.len()];
        Self::new(starts, strides, counts, blocks)
    }

    /// Contiguous box of `shape` elements starting at `starts`
    pub fn region(starts: Vec<u64>, shape: Vec<u64>) -> Result<Self> {
        let strides = shape.iter().map(|&s| s.max(1)).collect();
        let counts = vec![1; starts.len()];
        Self::new(starts, strides, counts, shape)
    }

    /// Hyperslab covering all of `dims`
    pub fn all(dims: &[u64]) -> Self {
        Self {
            starts: vec![0; dims.len()],
            strides: dims.iter().map(|&d| d.max(1)).collect(),
            counts: vec![1; dims.len()],
            blocks: dims.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.starts.len()
    }

    /// Selected extent per dimension (`count * block`)
    pub fn shape(&self) -> Vec<u64> {
        self.counts
            .iter()
            .zip(&self.blocks)
            .map(|(&count, &block)| count.saturating_mul(block))
            .collect()
    }

    fn checked_shape(&self) -> Result<Vec<u64>> {
        self.counts
            .iter()
            .zip(&self.blocks)
            .enumerate()
            .map(|(dim, (&count, &block))| {
                count.checked_mul(block).ok_or_else(|| {
                    H5Error::InvalidSelection(format!(
                        "dimension {} selects {} blocks of {}, overflowing u64",
                        dim, count, block
                    ))
                })
            })
            .collect()
    }

    /// One past the last selected index of `dim`, zero for an empty dimension
    fn stop(&self, dim: usize) -> Result<u64> {
        if self.counts[dim] == 0 || self.blocks[dim] == 0 {
            return Ok(0);
        }

        (self.counts[dim] - 1)
            .checked_mul(self.strides[dim])
            .and_then(|span| span.checked_add(self.starts[dim]))
            .and_then(|last| last.checked_add(self.blocks[dim]))
            .ok_or_else(|| {
                H5Error::InvalidSelection(format!(
                    "dimension {} extends past the largest addressable index",
                    dim
                ))
            })
    }

    /// Selected element count; saturates for selections that skipped `validate`
    pub fn total_element_count(&self) -> u64 {
        self.shape()
            .iter()
            .fold(1u64, |total, &extent| total.saturating_mul(extent))
    }

    /// Whether `coords` lies inside one of the selected blocks
    pub fn contains(&self, coords: &[u64]) -> bool {
        self.position_of(coords).is_some()
    }

    /// Per-dimension position of `coords` within the selection shape
    fn position_of(&self, coords: &[u64]) -> Option<Vec<u64>> {
        if coords.len() != self.rank() {
            return None;
        }

        let mut position = Vec::with_capacity(coords.len());

        for dim in 0..coords.len() {
            let offset = coords[dim].checked_sub(self.starts[dim])?;
            let block_index = offset / self.strides[dim];
            let within = offset % self.strides[dim];

            if block_index >= self.counts[dim] || within >= self.blocks[dim] {
                return None;
            }

            position.push(block_index * self.blocks[dim] + within);
        }

        Some(position)
    }

    /// Row-major ordinal of `coords` among the selected elements
    pub fn ordinal_of(&self, coords: &[u64]) -> Option<u64> {
        let position = self.position_of(coords)?;
        let shape = self.shape();
        let down = crate::utils::accumulate_reverse(&shape);

        Some(crate::utils::linear_index(&position, &down))
    }

    /// Coordinates of the selected element with the given ordinal
    pub fn coordinates_at(&self, ordinal: u64) -> Result<Vec<u64>> {
        let total = self.total_element_count();
        if ordinal >= total {
            return Err(H5Error::InvalidSelection(format!(
                "ordinal {} is outside a selection of {} elements",
                ordinal, total
            )));
        }

        let position = crate::utils::to_coordinates(ordinal, &self.shape());

        Ok(position
            .iter()
            .enumerate()
            .map(|(dim, &q)| {
                self.starts[dim] + (q / self.blocks[dim]) * self.strides[dim] + q % self.blocks[dim]
            })
            .collect())
    }

    /// Number of selected elements that follow `coords` contiguously along
    /// the last dimension, including `coords` itself
    pub fn contiguous_from(&self, coords: &[u64]) -> u64 {
        let Some(position) = self.position_of(coords) else {
            return 0;
        };

        let last = self.rank() - 1;
        let within = position[last] % self.blocks[last];

        if self.strides[last] == self.blocks[last] {
            self.counts[last] * self.blocks[last] - position[last]
        } else {
            self.blocks[last] - within
        }
    }

    /// Validate against dataset dims and start iterating runs
    pub fn runs(&self, dims: &[u64]) -> Result<HyperslabRuns> {
        if dims.len() != self.rank() {
            return Err(H5Error::InvalidSelection(format!(
                "selection rank {} does not match dataspace rank {}",
                self.rank(),
                dims.len()
            )));
        }

        self.validate()?;

        for dim in 0..self.rank() {
            let stop = self.stop(dim)?;

            if stop > dims[dim] {
                return Err(H5Error::InvalidSelection(format!(
                    "dimension {} selects up to {} but the extent is {}",
                    dim, stop, dims[dim]
                )));
            }
        }

        Ok(HyperslabRuns::new(self.clone()))
    }
}

/// Iterator over the runs of a hyperslab
pub struct HyperslabRuns {
    slab: HyperslabSelection,
    /// position of the outer dims within `shape`, plus the run index of the last dim
    position: Vec<u64>,
    limits: Vec<u64>,
    merged: bool,
    done: bool,
}

impl HyperslabRuns {
    fn new(slab: HyperslabSelection) -> Self {
        let rank = slab.rank();
        let last = rank.saturating_sub(1);
        let merged = rank > 0 && slab.strides[last] == slab.blocks[last];

        let mut limits = slab.shape();
        if rank > 0 {
            limits[last] = if merged { 1 } else { slab.counts[last] };
        }

        let done = rank == 0 || slab.total_element_count() == 0;

        Self {
            position: vec![0; rank],
            slab,
            limits,
            merged,
            done,
        }
    }
}

impl Iterator for HyperslabRuns {
    type Item = Result<SelectionRun>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let slab = &self.slab;
        let last = slab.rank() - 1;

        let mut coords: Vec<u64> = (0..last)
            .map(|dim| {
                let q = self.position[dim];
                slab.starts[dim] + (q / slab.blocks[dim]) * slab.strides[dim] + q % slab.blocks[dim]
            })
            .collect();

        let (first, length) = if self.merged {
            (slab.starts[last], slab.counts[last] * slab.blocks[last])
        } else {
            (
                slab.starts[last] + self.position[last] * slab.strides[last],
                slab.blocks[last],
            )
        };
        coords.push(first);

        // odometer advance, fastest dimension last
        let mut dim = last;
        loop {
            self.position[dim] += 1;
            if self.position[dim] < self.limits[dim] {
                break;
            }
            self.position[dim] = 0;
            if dim == 0 {
                self.done = true;
                break;
            }
            dim -= 1;
        }

        Some(Ok(SelectionRun::new(coords, length)))
    }
}

/// Discrete list of element coordinates, visited in the given order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointSelection {
    pub points: Vec<Vec<u64>>,
}

impl PointSelection {
    pub fn new(points: Vec<Vec<u64>>) -> Result<Self> {
        if let Some(first) = points.first() {
            if points.iter().any(|p| p.len() != first.len()) {
                return Err(H5Error::InvalidSelection(
                    "all points must have the same rank".to_string(),
                ));
            }
        }

        Ok(Self { points })
    }

    pub fn total_element_count(&self) -> u64 {
        self.points.len() as u64
    }
}

/// Explicit list of runs, used to forward part of a read to another dataset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSelection {
    pub runs: Vec<SelectionRun>,
}

impl RunSelection {
    pub fn new(runs: Vec<SelectionRun>) -> Self {
        Self { runs }
    }

    /// Append a run, extending the previous one when they touch
    pub fn push(&mut self, coords: Vec<u64>, length: u64) {
        if length == 0 {
            return;
        }

        if let Some(previous) = self.runs.last_mut() {
            let rank = coords.len();
            let touches = rank > 0
                && previous.coords.len() == rank
                && previous.coords[..rank - 1] == coords[..rank - 1]
                && previous.coords[rank - 1] + previous.length == coords[rank - 1];

            if touches {
                previous.length += length;
                return;
            }
        }

        self.runs.push(SelectionRun::new(coords, length));
    }

    pub fn total_element_count(&self) -> u64 {
        self.runs.iter().map(|run| run.length).sum()
    }
}

/// Selection over a dataspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Every element of the dataspace
    All,
    Hyperslab(HyperslabSelection),
    Points(PointSelection),
    Runs(RunSelection),
}

impl Selection {
    pub fn hyperslab(
        starts: Vec<u64>,
        strides: Vec<u64>,
        counts: Vec<u64>,
        blocks: Vec<u64>,
    ) -> Result<Self> {
        HyperslabSelection::new(starts, strides, counts, blocks).map(Selection::Hyperslab)
    }

    pub fn points(points: Vec<Vec<u64>>) -> Result<Self> {
        PointSelection::new(points).map(Selection::Points)
    }

    /// Number of selected elements; `dims` is only consulted for `All`
    pub fn total_element_count(&self, dims: &[u64]) -> u64 {
        match self {
            Selection::All => dims.iter().product(),
            Selection::Hyperslab(slab) => slab.total_element_count(),
            Selection::Points(points) => points.total_element_count(),
            Selection::Runs(runs) => runs.total_element_count(),
        }
    }

    /// Ordered runs of the selection within a dataspace of `dims`
    pub fn runs<'a>(
        &'a self,
        dims: &'a [u64],
    ) -> Result<Box<dyn Iterator<Item = Result<SelectionRun>> + Send + 'a>> {
        match self {
            Selection::All => Ok(Box::new(HyperslabSelection::all(dims).runs(dims)?)),
            Selection::Hyperslab(slab) => Ok(Box::new(slab.runs(dims)?)),
            Selection::Points(points) => Ok(Box::new(points.points.iter().map(move |point| {
                check_run(point, 1, dims)?;
                Ok(SelectionRun::new(point.clone(), 1))
            }))),
            Selection::Runs(runs) => Ok(Box::new(runs.runs.iter().map(move |run| {
                check_run(&run.coords, run.length, dims)?;
                Ok(run.clone())
            }))),
        }
    }
}

fn check_run(coords: &[u64], length: u64, dims: &[u64]) -> Result<()> {
    if coords.len() != dims.len() {
        return Err(H5Error::InvalidSelection(format!(
            "coordinate {:?} does not match dataspace rank {}",
            coords,
            dims.len()
        )));
    }

    let last = dims.len().saturating_sub(1);
    let in_bounds = coords.iter().zip(dims).enumerate().all(|(dim, (&c, &d))| {
        if dim == last {
            c.checked_add(length).is_some_and(|end| end <= d)
        } else {
            c < d
        }
    });

    if !in_bounds {
        return Err(H5Error::OutOfBounds(format!(
            "run of {} at {:?} exceeds dataspace {:?}",
            length, coords, dims
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(selection: &Selection, dims: &[u64]) -> Vec<SelectionRun> {
        selection
            .runs(dims)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_hyperslab_validation() {
        assert!(HyperslabSelection::new(vec![0], vec![0], vec![1], vec![1]).is_err());
        assert!(HyperslabSelection::new(vec![0], vec![2], vec![3], vec![3]).is_err());
        assert!(HyperslabSelection::new(vec![0, 0], vec![1], vec![1], vec![1]).is_err());
        // a single block may be wider than its stride
        assert!(HyperslabSelection::new(vec![0], vec![1], vec![1], vec![5]).is_ok());
    }

    #[test]
    fn test_total_count_without_iteration() {
        let slab = HyperslabSelection::new(vec![2, 3, 2], vec![6, 5, 6], vec![2, 2, 2], vec![3, 2, 5])
            .unwrap();
        assert_eq!(slab.total_element_count(), 6 * 4 * 10);
        assert_eq!(Selection::All.total_element_count(&[4, 5]), 20);
    }

    #[test]
    fn test_strided_runs() {
        let selection = Selection::Hyperslab(HyperslabSelection::strided(vec![6], vec![3], vec![4]).unwrap());
        let runs = collect(&selection, &[16]);
        let starts: Vec<u64> = runs.iter().map(|r| r.coords[0]).collect();
        assert_eq!(starts, vec![6, 9, 12, 15]);
        assert!(runs.iter().all(|r| r.length == 1));
    }

    #[test]
    fn test_gapless_last_dim_merges() {
        let selection = Selection::hyperslab(vec![1, 0], vec![2, 2], vec![2, 3], vec![1, 2]).unwrap();
        let runs = collect(&selection, &[4, 6]);
        assert_eq!(
            runs,
            vec![
                SelectionRun::new(vec![1, 0], 6),
                SelectionRun::new(vec![3, 0], 6),
            ]
        );
    }

    #[test]
    fn test_all_selection_runs() {
        let runs = collect(&Selection::All, &[2, 3]);
        assert_eq!(
            runs,
            vec![SelectionRun::new(vec![0, 0], 3), SelectionRun::new(vec![1, 0], 3)]
        );
    }

    #[test]
    fn test_out_of_bounds_hyperslab() {
        let selection = Selection::hyperslab(vec![10], vec![3], vec![4], vec![1]).unwrap();
        assert!(matches!(
            selection.runs(&[16]),
            Err(H5Error::InvalidSelection(_))
        ));
    }

    #[test]
    fn test_overflowing_extent_is_rejected() {
        let result = HyperslabSelection::new(vec![u64::MAX - 1], vec![1], vec![4], vec![1]);
        assert!(matches!(result, Err(H5Error::InvalidSelection(_))));

        let result = HyperslabSelection::new(vec![0, 0], vec![1, 1], vec![1, 1], vec![u64::MAX, 4]);
        assert!(matches!(result, Err(H5Error::InvalidSelection(_))));

        // literals bypass `new`, the walk still refuses them
        let slab = HyperslabSelection {
            starts: vec![u64::MAX - 1],
            strides: vec![1],
            counts: vec![4],
            blocks: vec![1],
        };
        assert!(matches!(slab.runs(&[16]), Err(H5Error::InvalidSelection(_))));
    }

    #[test]
    fn test_point_bounds() {
        let selection = Selection::points(vec![vec![0, 0], vec![3, 9]]).unwrap();
        let result: Result<Vec<_>> = selection.runs(&[4, 4]).unwrap().collect();
        assert!(matches!(result, Err(H5Error::OutOfBounds(_))));
    }

    #[test]
    fn test_ordinal_mapping() {
        let slab = HyperslabSelection::new(vec![1, 2], vec![4, 3], vec![2, 2], vec![2, 2]).unwrap();
        // shape is 4 x 4
        assert_eq!(slab.ordinal_of(&[1, 2]), Some(0));
        assert_eq!(slab.ordinal_of(&[1, 5]), Some(2));
        assert_eq!(slab.ordinal_of(&[5, 6]), Some(4 * 2 + 3));
        assert_eq!(slab.ordinal_of(&[3, 2]), None);
        assert_eq!(slab.coordinates_at(11).unwrap(), vec![5, 6]);
        assert!(matches!(slab.coordinates_at(16), Err(H5Error::InvalidSelection(_))));
        assert_eq!(slab.contiguous_from(&[1, 2]), 2);
        assert_eq!(slab.contiguous_from(&[1, 3]), 1);
        assert_eq!(slab.contiguous_from(&[1, 4]), 0);
    }

    #[test]
    fn test_run_selection_push_merges() {
        let mut runs = RunSelection::default();
        runs.push(vec![0, 1], 2);
        runs.push(vec![0, 3], 1);
        runs.push(vec![1, 0], 1);
        runs.push(vec![1, 5], 0);
        assert_eq!(
            runs.runs,
            vec![SelectionRun::new(vec![0, 1], 3), SelectionRun::new(vec![1, 0], 1)]
        );
        assert_eq!(runs.total_element_count(), 4);
    }
}
