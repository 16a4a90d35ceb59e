//! Dataset descriptors

use crate::error::{H5Error, Result};
use crate::filters::FilterPipeline;
use crate::io::FormatContext;
use crate::layout::{ChunkGeometry, ChunkIndexDescriptor, DataLayout};
use crate::types::{ElementType, UNLIMITED};
use serde::{Deserialize, Serialize};

/// Fill value of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FillValue {
    /// Bytes of one element; `None` reads as zeros
    pub value: Option<Vec<u8>>,
}

impl FillValue {
    pub fn new(value: Vec<u8>) -> Self {
        Self { value: Some(value) }
    }

    pub fn zeros() -> Self {
        Self { value: None }
    }

    /// Byte pattern to repeat over unwritten regions
    pub fn pattern(&self) -> &[u8] {
        self.value.as_deref().unwrap_or(&[])
    }
}

/// Everything needed to read a dataset.
///
/// Produced by whatever walks the object headers of a file; immutable
/// after the dataset is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Current extent
    pub dims: Vec<u64>,
    /// Maximum extent; `UNLIMITED` marks growable dims
    pub max_dims: Vec<u64>,
    pub element_type: ElementType,
    pub layout: DataLayout,
    #[serde(default)]
    pub filters: FilterPipeline,
    #[serde(default)]
    pub fill_value: FillValue,
    /// Field widths of the file the dataset lives in
    #[serde(default)]
    pub format: FormatContext,
}

impl DatasetDescriptor {
    /// Create a descriptor whose maximum extent equals its extent
    pub fn new(dims: Vec<u64>, element_type: ElementType, layout: DataLayout) -> Self {
        Self {
            max_dims: dims.clone(),
            dims,
            element_type,
            layout,
            filters: FilterPipeline::default(),
            fill_value: FillValue::default(),
            format: FormatContext::default(),
        }
    }

    pub fn with_max_dims(mut self, max_dims: Vec<u64>) -> Self {
        self.max_dims = max_dims;
        self
    }

    pub fn with_filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_fill_value(mut self, fill_value: FillValue) -> Self {
        self.fill_value = fill_value;
        self
    }

    pub fn with_format(mut self, format: FormatContext) -> Self {
        self.format = format;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Extent used for selections; scalars behave as one element
    pub fn effective_dims(&self) -> Vec<u64> {
        if self.dims.is_empty() {
            vec![1]
        } else {
            self.dims.clone()
        }
    }

    pub fn element_count(&self) -> u64 {
        self.dims.iter().product()
    }

    pub fn element_size(&self) -> usize {
        self.element_type.size_in_bytes()
    }

    /// Chunk geometry, for chunked layouts
    pub fn chunk_geometry(&self) -> Result<Option<ChunkGeometry>> {
        match &self.layout {
            DataLayout::Chunked { chunk_dims, .. } => Ok(Some(ChunkGeometry::new(
                &self.dims,
                &self.max_dims,
                chunk_dims,
                self.element_size(),
            )?)),
            _ => Ok(None),
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_dims.len() != self.dims.len() {
            return Err(H5Error::InvalidDimensions(format!(
                "max dims {:?} do not match dims {:?}",
                self.max_dims, self.dims
            )));
        }

        for (dim, (&d, &m)) in self.dims.iter().zip(&self.max_dims).enumerate() {
            if m != UNLIMITED && d > m {
                return Err(H5Error::InvalidDimensions(format!(
                    "dimension {} has extent {} beyond its maximum {}",
                    dim, d, m
                )));
            }
        }

        if self.element_size() == 0 {
            return Err(H5Error::InvalidFormat("element size must be positive".to_string()));
        }

        if let Some(pattern) = &self.fill_value.value {
            if !pattern.is_empty() && pattern.len() != self.element_size() {
                return Err(H5Error::InvalidFormat(format!(
                    "fill value has {} bytes but elements have {}",
                    pattern.len(),
                    self.element_size()
                )));
            }
        }

        match &self.layout {
            DataLayout::Chunked { chunk_dims, index } => {
                if chunk_dims.len() != self.rank() || self.rank() == 0 {
                    return Err(H5Error::InvalidDimensions(format!(
                        "chunk dims {:?} do not match dataset rank {}",
                        chunk_dims,
                        self.rank()
                    )));
                }

                if matches!(index, ChunkIndexDescriptor::Implicit { .. }) && !self.filters.is_empty() {
                    return Err(H5Error::InvalidFormat(
                        "implicit chunk index cannot be combined with filters".to_string(),
                    ));
                }

                let unlimited = self.max_dims.iter().filter(|&&m| m == UNLIMITED).count();
                match index {
                    ChunkIndexDescriptor::ExtensibleArray { .. } if unlimited != 1 => {
                        return Err(H5Error::InvalidFormat(format!(
                            "extensible array index needs exactly one unlimited dimension, found {}",
                            unlimited
                        )));
                    }
                    ChunkIndexDescriptor::FixedArray { .. } | ChunkIndexDescriptor::Implicit { .. }
                        if unlimited > 0 =>
                    {
                        return Err(H5Error::InvalidFormat(format!(
                            "{} index needs fixed maximum dimensions",
                            index.kind()
                        )));
                    }
                    _ => {}
                }
            }
            DataLayout::Contiguous { size, .. } => {
                let expected = self.element_count() * self.element_size() as u64;
                if *size < expected {
                    return Err(H5Error::InvalidFormat(format!(
                        "contiguous storage holds {} bytes, dataset needs {}",
                        size, expected
                    )));
                }
            }
            DataLayout::Compact { data } => {
                let expected = self.element_count().max(1) * self.element_size() as u64;
                if (data.len() as u64) < expected {
                    return Err(H5Error::InvalidFormat(format!(
                        "compact storage holds {} bytes, dataset needs {}",
                        data.len(),
                        expected
                    )));
                }
            }
            DataLayout::Virtual { mappings } => {
                for mapping in mappings {
                    if mapping.virtual_selection.rank() != self.rank() {
                        return Err(H5Error::InvalidDimensions(format!(
                            "virtual mapping to '{}' has rank {}, dataset has {}",
                            mapping.source_dataset,
                            mapping.virtual_selection.rank(),
                            self.rank()
                        )));
                    }
                    mapping.validate()?;
                }
            }
        }

        Ok(())
    }

    /// Load a descriptor from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: Self = serde_json::from_str(json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Serialize the descriptor to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
