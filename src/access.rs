//! File handles and datasets - main API for reading chunked data

use crate::cache::{CacheStats, ChunkCache, ChunkCacheConfig, ChunkCacheFactory, ChunkKey};
use crate::compound::CompoundLayout;
use crate::error::{H5Error, Result};
use crate::filters::FilterRegistry;
use crate::index::{ChunkIndex, RecordComparator};
use crate::io::{open_byte_source, ByteSource, CancellableSource, UNDEFINED_ADDRESS};
use crate::layout::{DataLayout, VirtualMapping};
use crate::metadata::DatasetDescriptor;
use crate::selection::{RunSelection, Selection};
use crate::types::{Element, ElementType};
use crate::utils::{fill_repeating, format_bytes, swap_units, to_usize};
use crate::walker::{walk, RelativeStep};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use ndarray::{ArrayD, IxDyn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Maximum nesting of virtual datasets
pub const MAX_VIRTUAL_DEPTH: usize = 100;

/// Settings applied when a file handle is opened
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub cache: ChunkCacheConfig,

    /// Replaces the cache built from `cache` when set
    #[serde(skip)]
    cache_factory: Option<ChunkCacheFactory>,

    #[serde(skip)]
    filters: Option<Arc<FilterRegistry>>,

    /// Order of b-tree v2 chunk records, scaled coordinates ascending by default
    #[serde(skip)]
    comparator: Option<RecordComparator>,
}

impl FileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: ChunkCacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cache_factory(mut self, factory: ChunkCacheFactory) -> Self {
        self.cache_factory = Some(factory);
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Some(Arc::new(filters));
        self
    }

    pub fn with_record_comparator(mut self, comparator: RecordComparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn build_cache(&self) -> ChunkCache {
        match &self.cache_factory {
            Some(factory) => factory(),
            None => self.cache.factory()(),
        }
    }
}

impl fmt::Debug for FileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileConfig")
            .field("cache", &self.cache)
            .field("custom_cache_factory", &self.cache_factory.is_some())
            .field("filters", &self.filters)
            .field("custom_comparator", &self.comparator.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct CatalogEntry {
    id: u64,
    descriptor: Arc<DatasetDescriptor>,
}

struct FileInner {
    location: String,
    source: Box<dyn ByteSource>,
    cache: Mutex<ChunkCache>,
    filters: Arc<FilterRegistry>,
    comparator: RecordComparator,
    catalog: RwLock<HashMap<String, CatalogEntry>>,
    next_id: AtomicU64,
}

/// Handle to an open file: byte source, dataset catalog and chunk cache
#[derive(Clone)]
pub struct H5File {
    inner: Arc<FileInner>,
}

impl H5File {
    /// Open a file from a `file://` URL or local path
    pub async fn open(url: impl Into<String>, config: FileConfig) -> Result<Self> {
        let url = url.into();
        let source = open_byte_source(&url).await?;
        Ok(Self::with_source(url, source, config))
    }

    /// Wrap an existing byte source, such as an in-memory image
    pub fn from_source(source: impl ByteSource + 'static, config: FileConfig) -> Self {
        Self::with_source("memory".to_string(), Box::new(source), config)
    }

    fn with_source(location: String, source: Box<dyn ByteSource>, config: FileConfig) -> Self {
        let cache = config.build_cache();
        debug!(
            location = %location,
            slots = cache.slot_count(),
            budget = %format_bytes(cache.byte_budget()),
            "opened file"
        );

        Self {
            inner: Arc::new(FileInner {
                location,
                source,
                cache: Mutex::new(cache),
                filters: config.filters.unwrap_or_default(),
                comparator: config.comparator.unwrap_or_default(),
                catalog: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    /// Make a dataset available under `name`, replacing any previous one
    pub fn register_dataset(&self, name: impl Into<String>, descriptor: DatasetDescriptor) -> Result<()> {
        descriptor.validate()?;

        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(dataset = %name, id, layout = descriptor.layout.kind(), "registered dataset");

        self.inner.catalog.write().insert(
            name,
            CatalogEntry {
                id,
                descriptor: Arc::new(descriptor),
            },
        );
        Ok(())
    }

    /// Names of all registered datasets, sorted
    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.catalog.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a registered dataset, reading the root of its chunk index
    pub async fn dataset(&self, name: &str) -> Result<Dataset> {
        open_dataset(&self.inner, name).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }

    /// Bytes and slots currently held by the chunk cache
    pub fn cache_usage(&self) -> (u64, usize) {
        let cache = self.inner.cache.lock();
        (cache.consumed_bytes(), cache.consumed_slots())
    }

    /// Drop every cached chunk
    pub fn close(&self) {
        self.inner.cache.lock().clear();
        debug!(location = %self.inner.location, "closed file");
    }
}

impl fmt::Debug for H5File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H5File")
            .field("location", &self.inner.location)
            .field("datasets", &self.dataset_names())
            .finish()
    }
}

async fn open_dataset(file: &Arc<FileInner>, name: &str) -> Result<Dataset> {
    let entry = file
        .catalog
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| H5Error::NotFound(format!("dataset '{}'", name)))?;

    let descriptor = entry.descriptor;
    let index = match descriptor.layout {
        DataLayout::Chunked { .. } => {
            let index = ChunkIndex::open_with_comparator(
                file.source.as_ref(),
                &descriptor,
                file.comparator.clone(),
            )
            .await?;
            Some(Arc::new(index))
        }
        _ => None,
    };

    let compact = match &descriptor.layout {
        DataLayout::Compact { data } => Some(Bytes::copy_from_slice(data)),
        _ => None,
    };

    debug!(
        dataset = %name,
        dims = ?descriptor.dims,
        element = %descriptor.element_type,
        index = index.as_ref().map(|i| i.kind()),
        "opened dataset"
    );

    Ok(Dataset {
        file: Arc::clone(file),
        name: name.to_string(),
        id: entry.id,
        descriptor,
        index,
        compact,
        cancel: CancellationToken::new(),
    })
}

/// Bytes backing one walker step, consumed front to back
struct Segment {
    bytes: Bytes,
    position: usize,
    remaining: u64,
}

/// Fail when the file side still holds elements after the memory walk ended
fn ensure_drained<I>(segment: Option<&Segment>, file_steps: &mut I) -> Result<()>
where
    I: Iterator<Item = Result<RelativeStep>>,
{
    let leftover = segment.is_some_and(|s| s.remaining > 0);
    if leftover || file_steps.next().is_some() {
        return Err(H5Error::SelectionSizeMismatch(
            "memory selection ended before file selection".to_string(),
        ));
    }

    Ok(())
}

/// An opened dataset
#[derive(Clone)]
pub struct Dataset {
    file: Arc<FileInner>,
    name: String,
    id: u64,
    descriptor: Arc<DatasetDescriptor>,
    index: Option<Arc<ChunkIndex>>,
    compact: Option<Bytes>,
    cancel: CancellationToken,
}

impl Dataset {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    pub fn element_type(&self) -> ElementType {
        self.descriptor.element_type
    }

    /// Kind of chunk index, for chunked datasets
    pub fn index_kind(&self) -> Option<&'static str> {
        self.index.as_ref().map(|index| index.kind())
    }

    /// Abort reads once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Read `file_selection` into `destination`, laid out as `memory_selection`
    /// over a buffer of shape `memory_dims`.
    ///
    /// Defaults: the whole dataset, a memory selection covering the whole
    /// buffer, and a one-dimensional buffer holding exactly the selected
    /// elements. `destination` must hold `product(memory_dims)` elements and
    /// is validated before any I/O.
    pub async fn read(
        &self,
        file_selection: Option<&Selection>,
        memory_selection: Option<&Selection>,
        memory_dims: Option<&[u64]>,
        destination: &mut [u8],
    ) -> Result<()> {
        self.read_at_depth(file_selection, memory_selection, memory_dims, destination, 0)
            .await
    }

    /// Read a selection into a packed buffer
    pub async fn read_into(&self, selection: &Selection, destination: &mut [u8]) -> Result<()> {
        self.read(Some(selection), None, None, destination).await
    }

    /// Read a selection into a newly allocated packed buffer
    pub async fn read_bytes(&self, selection: &Selection) -> Result<Vec<u8>> {
        let count = selection.total_element_count(&self.descriptor.effective_dims());
        let size = to_usize(count, "selection")?
            .checked_mul(self.descriptor.element_size())
            .ok_or_else(|| H5Error::OutOfBounds("selection byte size overflows".to_string()))?;

        let mut buffer = vec![0u8; size];
        self.read_into(selection, &mut buffer).await?;
        Ok(buffer)
    }

    /// Read a selection as an array of `T`, shaped like the selection.
    ///
    /// Array element types gain a trailing axis of length `factor`.
    pub async fn read_array<T: Element>(&self, selection: &Selection) -> Result<ArrayD<T>> {
        let element_type = self.descriptor.element_type;
        if T::SIZE != element_type.unit_size {
            return Err(H5Error::InvalidFormat(format!(
                "cannot read {} elements as {}-byte values",
                element_type,
                T::SIZE
            )));
        }

        let bytes = self.read_bytes(selection).await?;
        let values: Vec<T> = bytes.chunks_exact(T::SIZE).map(T::from_ne_slice).collect();

        let mut shape: Vec<usize> = match selection {
            Selection::All => self.descriptor.effective_dims(),
            Selection::Hyperslab(slab) => slab.shape(),
            Selection::Points(_) | Selection::Runs(_) => {
                vec![selection.total_element_count(&self.descriptor.effective_dims())]
            }
        }
        .into_iter()
        .map(|d| to_usize(d, "array dimension"))
        .collect::<Result<_>>()?;

        if element_type.factor > 1 {
            shape.push(element_type.factor);
        }

        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| H5Error::InvalidDimensions(e.to_string()))
    }

    /// Read compound records through a decode table
    pub async fn read_compound<T: Default>(
        &self,
        selection: &Selection,
        layout: &CompoundLayout<T>,
    ) -> Result<Vec<T>> {
        if layout.record_size() != self.descriptor.element_size() {
            return Err(H5Error::InvalidFormat(format!(
                "compound layout describes {}-byte records, dataset stores {}",
                layout.record_size(),
                self.descriptor.element_size()
            )));
        }

        let bytes = self.read_bytes(selection).await?;
        layout.decode_all(&bytes)
    }

    /// Blocking form of [`Dataset::read`].
    ///
    /// Drives the read on the calling thread, so the byte source must not
    /// need a tokio reactor (memory images are fine). Must not be called
    /// from inside an async runtime.
    pub fn read_blocking(
        &self,
        file_selection: Option<&Selection>,
        memory_selection: Option<&Selection>,
        memory_dims: Option<&[u64]>,
        destination: &mut [u8],
    ) -> Result<()> {
        futures::executor::block_on(self.read(
            file_selection,
            memory_selection,
            memory_dims,
            destination,
        ))
    }

    fn read_at_depth<'a>(
        &'a self,
        file_selection: Option<&'a Selection>,
        memory_selection: Option<&'a Selection>,
        memory_dims: Option<&'a [u64]>,
        destination: &'a mut [u8],
        depth: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth > MAX_VIRTUAL_DEPTH {
                return Err(H5Error::RecursionLimit(MAX_VIRTUAL_DEPTH));
            }

            let all = Selection::All;
            let file_dims = self.descriptor.effective_dims();
            let file_selection = file_selection.unwrap_or(&all);
            let memory_selection = memory_selection.unwrap_or(&all);

            let file_count = file_selection.total_element_count(&file_dims);
            let memory_dims: Vec<u64> = memory_dims
                .map(<[u64]>::to_vec)
                .unwrap_or_else(|| vec![file_count]);
            let memory_count = memory_selection.total_element_count(&memory_dims);

            if file_count != memory_count {
                return Err(H5Error::SelectionSizeMismatch(format!(
                    "file selection has {} elements, memory selection has {}",
                    file_count, memory_count
                )));
            }

            let element_size = self.descriptor.element_size();
            let required = to_usize(memory_dims.iter().product(), "memory buffer")?
                .checked_mul(element_size)
                .ok_or_else(|| H5Error::OutOfBounds("memory buffer size overflows".to_string()))?;
            if destination.len() < required {
                return Err(H5Error::BufferTooSmall {
                    required,
                    actual: destination.len(),
                });
            }

            if file_count == 0 {
                return Ok(());
            }

            trace!(
                dataset = %self.name,
                elements = file_count,
                layout = self.descriptor.layout.kind(),
                depth,
                "reading selection"
            );

            if let DataLayout::Virtual { mappings } = &self.descriptor.layout {
                let mut staged = vec![0u8; to_usize(file_count, "selection")? * element_size];
                self.gather_virtual(mappings, file_selection, &file_dims, &mut staged, depth)
                    .await?;
                return scatter(&staged, memory_selection, &memory_dims, destination, element_size);
            }

            let chunk_dims = match &self.descriptor.layout {
                DataLayout::Chunked { chunk_dims, .. } => chunk_dims.clone(),
                _ => file_dims.clone(),
            };

            let source = CancellableSource::new(self.file.source.as_ref(), &self.cancel);
            let mut file_steps = walk(file_dims.len(), &file_dims, &chunk_dims, file_selection)?;
            let memory_steps = walk(memory_dims.len(), &memory_dims, &memory_dims, memory_selection)?;

            let swap = self.descriptor.element_type.needs_swap();
            let unit_size = self.descriptor.element_type.unit_size;
            let mut segment: Option<Segment> = None;
            let mut last_chunk: Option<(Vec<u64>, Bytes)> = None;

            for memory_step in memory_steps {
                let memory_step = memory_step?;
                let mut target = to_usize(memory_step.offset, "memory offset")? * element_size;
                let mut wanted = memory_step.length;

                while wanted > 0 {
                    if segment.as_ref().map_or(true, |s| s.remaining == 0) {
                        let step = file_steps.next().ok_or_else(|| {
                            H5Error::SelectionSizeMismatch(
                                "file selection ended before memory selection".to_string(),
                            )
                        })??;
                        segment = Some(self.segment(&source, step, &mut last_chunk).await?);
                    }

                    let Some(current) = segment.as_mut() else {
                        return Err(H5Error::SelectionSizeMismatch(
                            "file selection ended before memory selection".to_string(),
                        ));
                    };

                    let count = wanted.min(current.remaining);
                    let len = to_usize(count, "run")? * element_size;
                    let output = &mut destination[target..target + len];
                    output.copy_from_slice(&current.bytes[current.position..current.position + len]);
                    if swap {
                        swap_units(output, unit_size);
                    }

                    current.position += len;
                    current.remaining -= count;
                    target += len;
                    wanted -= count;
                }
            }

            ensure_drained(segment.as_ref(), &mut file_steps)
        }
        .boxed()
    }

    /// Resolve the bytes behind one file-side step
    async fn segment(
        &self,
        source: &dyn ByteSource,
        step: RelativeStep,
        last_chunk: &mut Option<(Vec<u64>, Bytes)>,
    ) -> Result<Segment> {
        let element_size = self.descriptor.element_size();
        let position = to_usize(step.offset, "element offset")? * element_size;
        let len = to_usize(step.length, "run")? * element_size;

        match &self.descriptor.layout {
            DataLayout::Chunked { .. } => {
                let reused = match last_chunk.as_ref() {
                    Some((chunk, bytes)) if *chunk == step.chunk => Some(bytes.clone()),
                    _ => None,
                };

                let bytes = match reused {
                    Some(bytes) => bytes,
                    None => {
                        let bytes = self.load_chunk(source, &step.chunk).await?;
                        *last_chunk = Some((step.chunk.clone(), bytes.clone()));
                        bytes
                    }
                };

                if position + len > bytes.len() {
                    return Err(H5Error::InvalidFormat(format!(
                        "chunk of {} bytes is too short for elements {}..{}",
                        bytes.len(),
                        step.offset,
                        step.offset + step.length
                    )));
                }

                Ok(Segment {
                    bytes,
                    position,
                    remaining: step.length,
                })
            }
            DataLayout::Contiguous { address, .. } => {
                let bytes = if *address == UNDEFINED_ADDRESS {
                    self.fill_bytes(len)
                } else {
                    source.read_at(address + position as u64, len).await?
                };

                Ok(Segment {
                    bytes,
                    position: 0,
                    remaining: step.length,
                })
            }
            DataLayout::Compact { .. } => {
                let data = self.compact.clone().unwrap_or_default();
                if position + len > data.len() {
                    return Err(H5Error::InvalidFormat(format!(
                        "compact data of {} bytes is too short for elements {}..{}",
                        data.len(),
                        step.offset,
                        step.offset + step.length
                    )));
                }

                Ok(Segment {
                    bytes: data.slice(position..position + len),
                    position: 0,
                    remaining: step.length,
                })
            }
            DataLayout::Virtual { .. } => Err(H5Error::InvalidFormat(
                "virtual datasets have no stored segments".to_string(),
            )),
        }
    }

    /// Decoded bytes of one chunk, through the file's chunk cache
    async fn load_chunk(&self, source: &dyn ByteSource, chunk: &[u64]) -> Result<Bytes> {
        let key = ChunkKey::new(self.id, chunk.to_vec());

        let cached = self.file.cache.lock().get(&key);
        if let Some(bytes) = cached {
            return Ok(bytes);
        }

        let index = self.index.as_ref().ok_or_else(|| {
            H5Error::InvalidFormat(format!("dataset '{}' has no chunk index", self.name))
        })?;
        let geometry = self
            .descriptor
            .chunk_geometry()?
            .ok_or_else(|| H5Error::InvalidFormat("chunked dataset without geometry".to_string()))?;
        let chunk_size = to_usize(geometry.chunk_byte_size, "chunk")?;

        let Some(location) = index.lookup(source, chunk).await? else {
            trace!(chunk = ?chunk, dataset = %self.name, "chunk not allocated, using fill value");
            return Ok(self.fill_bytes(chunk_size));
        };

        let stored = source
            .read_at(location.address, to_usize(location.stored_size, "stored chunk")?)
            .await?;

        let decoded = if self.descriptor.filters.is_empty() {
            stored
        } else {
            Bytes::from(self.descriptor.filters.decode(
                &self.file.filters,
                location.filter_mask,
                stored.to_vec(),
            )?)
        };

        if decoded.len() < chunk_size {
            return Err(H5Error::Decompression(format!(
                "chunk {:?} decoded to {} bytes, expected {}",
                chunk,
                decoded.len(),
                chunk_size
            )));
        }

        trace!(
            chunk = ?chunk,
            address = location.address,
            stored = location.stored_size,
            bytes = decoded.len(),
            "loaded chunk"
        );

        self.file.cache.lock().insert(key, decoded.clone());
        Ok(decoded)
    }

    fn fill_bytes(&self, len: usize) -> Bytes {
        let mut bytes = vec![0u8; len];
        fill_repeating(&mut bytes, self.descriptor.fill_value.pattern());
        Bytes::from(bytes)
    }

    /// Collect the selected elements of a virtual dataset, in selection order
    async fn gather_virtual(
        &self,
        mappings: &[VirtualMapping],
        selection: &Selection,
        dims: &[u64],
        staged: &mut [u8],
        depth: usize,
    ) -> Result<()> {
        let element_size = self.descriptor.element_size();
        let fill = self.fill_bytes(element_size);
        let mut sources: HashMap<String, Dataset> = HashMap::new();
        let mut position = 0usize;

        for run in selection.runs(dims)? {
            let run = run?;
            let last = run.coords.len() - 1;
            let mut coords = run.coords;
            let mut remaining = run.length;

            while remaining > 0 {
                let mapping = mappings
                    .iter()
                    .find(|m| m.virtual_selection.contains(&coords));

                let Some(mapping) = mapping else {
                    staged[position..position + element_size].copy_from_slice(&fill);
                    position += element_size;
                    coords[last] += 1;
                    remaining -= 1;
                    continue;
                };

                let span = remaining.min(mapping.virtual_selection.contiguous_from(&coords));
                let ordinal = mapping.virtual_selection.ordinal_of(&coords).ok_or_else(|| {
                    H5Error::InvalidSelection(format!("{:?} is not in its mapping", coords))
                })?;

                let mut forwarded = RunSelection::default();
                for k in 0..span {
                    forwarded.push(mapping.source_selection.coordinates_at(ordinal + k)?, 1);
                }

                if !sources.contains_key(&mapping.source_dataset) {
                    let dataset = open_dataset(&self.file, &mapping.source_dataset)
                        .await?
                        .with_cancellation(self.cancel.clone());
                    if dataset.descriptor.element_size() != element_size {
                        return Err(H5Error::InvalidFormat(format!(
                            "virtual source '{}' has {}-byte elements, expected {}",
                            mapping.source_dataset,
                            dataset.descriptor.element_size(),
                            element_size
                        )));
                    }
                    sources.insert(mapping.source_dataset.clone(), dataset);
                }
                let source = sources.get(&mapping.source_dataset).ok_or_else(|| {
                    H5Error::NotFound(format!("dataset '{}'", mapping.source_dataset))
                })?;

                let len = to_usize(span, "virtual run")? * element_size;
                let forwarded = Selection::Runs(forwarded);
                let memory_dims = [span];
                source
                    .read_at_depth(
                        Some(&forwarded),
                        None,
                        Some(&memory_dims[..]),
                        &mut staged[position..position + len],
                        depth + 1,
                    )
                    .await?;

                position += len;
                coords[last] += span;
                remaining -= span;
            }
        }

        Ok(())
    }

    /// Storage summary of the dataset
    pub fn stats(&self) -> DatasetStats {
        let descriptor = &self.descriptor;
        let geometry = descriptor.chunk_geometry().ok().flatten();

        DatasetStats {
            rank: descriptor.rank(),
            element_count: descriptor.element_count(),
            element_type: descriptor.element_type,
            layout: descriptor.layout.kind(),
            index: self.index_kind(),
            chunk_count: geometry.as_ref().map(|g| g.total_chunks()),
            uncompressed_size: descriptor.element_count() * descriptor.element_size() as u64,
        }
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Copy staged elements, in selection order, into a memory selection
fn scatter(
    staged: &[u8],
    selection: &Selection,
    dims: &[u64],
    destination: &mut [u8],
    element_size: usize,
) -> Result<()> {
    let mut position = 0usize;

    for step in walk(dims.len(), dims, dims, selection)? {
        let step = step?;
        let target = to_usize(step.offset, "memory offset")? * element_size;
        let len = to_usize(step.length, "run")? * element_size;

        if position + len > staged.len() {
            return Err(H5Error::SelectionSizeMismatch(
                "memory selection outlasts the file selection".to_string(),
            ));
        }

        destination[target..target + len].copy_from_slice(&staged[position..position + len]);
        position += len;
    }

    Ok(())
}

/// Dataset statistics
#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub rank: usize,
    pub element_count: u64,
    pub element_type: ElementType,
    pub layout: &'static str,
    pub index: Option<&'static str>,
    pub chunk_count: Option<u64>,
    pub uncompressed_size: u64,
}

impl DatasetStats {
    pub fn summary(&self) -> String {
        let chunks = match (self.index, self.chunk_count) {
            (Some(index), Some(count)) => format!(", {} chunks ({})", count, index),
            _ => String::new(),
        };

        format!(
            "{}D {} dataset: {} elements of {}, {} uncompressed{}",
            self.rank,
            self.layout,
            self.element_count,
            self.element_type,
            format_bytes(self.uncompressed_size),
            chunks
        )
    }
}
