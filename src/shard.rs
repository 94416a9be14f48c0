//! Sharded on-disk activation storage
//!
//! Activations are written as fixed-size records of shape
//! `(n_layers, n_tokens, d_model)` into shard files holding `capacity`
//! records each. A record's location is pure arithmetic on its global index:
//!
//! ```text
//! shard_id = index / capacity
//! offset   = (index % capacity) * record_bytes
//! ```
//!
//! A `metadata.json` next to the shard files records the shapes, dtype,
//! capacity and how many records have been written, so readers can check
//! compatibility before touching any shard.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{SaeConfig, StorageDType, TokenSelection};

/// Metadata file name inside a shard directory
pub const METADATA_FILE: &str = "metadata.json";

/// Layout of a shard set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub d_model: usize,
    pub n_layers: usize,
    /// Tokens (patches) stored per input
    pub n_tokens: usize,
    /// Records per shard file
    pub capacity: usize,
    pub dtype: StorageDType,
    /// Number of records written so far (valid indices are `0..n_records`)
    #[serde(default)]
    pub n_records: usize,
}

impl ShardMetadata {
    pub fn new(
        d_model: usize,
        n_layers: usize,
        n_tokens: usize,
        capacity: usize,
        dtype: StorageDType,
    ) -> Self {
        Self {
            d_model,
            n_layers,
            n_tokens,
            capacity,
            dtype,
            n_records: 0,
        }
    }

    /// Layout for caching `n_layers` hooks of `n_tokens` tokens with the
    /// configured shard capacity and storage dtype
    pub fn from_config(config: &SaeConfig, n_layers: usize, n_tokens: usize) -> Self {
        Self::new(
            config.d_in,
            n_layers,
            n_tokens,
            config.shard_capacity,
            config.shard_dtype,
        )
    }

    /// Shape of one record
    pub fn record_shape(&self) -> [usize; 3] {
        [self.n_layers, self.n_tokens, self.d_model]
    }

    /// Elements per record
    pub fn record_elems(&self) -> usize {
        self.n_layers * self.n_tokens * self.d_model
    }

    /// Bytes per record
    pub fn record_bytes(&self) -> usize {
        self.record_elems() * self.dtype.size_in_bytes()
    }

    /// Shard owning a global index
    pub fn shard_id(&self, index: usize) -> usize {
        index / self.capacity
    }

    /// Byte offset of a global index inside its shard
    pub fn offset_in_shard(&self, index: usize) -> u64 {
        ((index % self.capacity) * self.record_bytes()) as u64
    }

    /// Number of shard files needed for the written records
    pub fn n_shards(&self) -> usize {
        self.n_records.div_ceil(self.capacity)
    }

    /// Everything except the written count matches
    pub fn is_compatible(&self, other: &ShardMetadata) -> bool {
        self.d_model == other.d_model
            && self.n_layers == other.n_layers
            && self.n_tokens == other.n_tokens
            && self.capacity == other.capacity
            && self.dtype == other.dtype
    }

    /// Load metadata from a shard directory
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read shard metadata {}", path.display()))?;
        let metadata: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse shard metadata {}", path.display()))?;
        anyhow::ensure!(metadata.capacity > 0, "Shard capacity must be positive");
        Ok(metadata)
    }

    /// Persist metadata into a shard directory
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(METADATA_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write shard metadata {}", path.display()))?;
        Ok(())
    }
}

/// File holding shard `shard_id`
pub fn shard_path(root: &Path, shard_id: usize) -> PathBuf {
    root.join(format!("acts{shard_id:06}.bin"))
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Single writer for a shard directory.
///
/// Records must be written without gaps: a write may start anywhere in
/// `0..=len()`, so rewriting an existing range is allowed (and idempotent
/// for identical data) but skipping ahead is not.
pub struct ShardWriter {
    root: PathBuf,
    metadata: ShardMetadata,
    files: HashMap<usize, File>,
}

impl ShardWriter {
    /// Open a shard directory for writing, creating it if needed.
    ///
    /// If the directory already holds shards, their layout must match
    /// `metadata`; writing then continues after the existing records.
    pub fn create(root: impl AsRef<Path>, metadata: ShardMetadata) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        anyhow::ensure!(metadata.capacity > 0, "Shard capacity must be positive");
        anyhow::ensure!(metadata.record_elems() > 0, "Shard records must not be empty");
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create shard directory {}", root.display()))?;

        let mut metadata = metadata;
        if root.join(METADATA_FILE).exists() {
            let existing = ShardMetadata::load(&root)?;
            anyhow::ensure!(
                existing.capacity == metadata.capacity,
                "Shard capacity changed from {} to {} after writing",
                existing.capacity,
                metadata.capacity
            );
            anyhow::ensure!(
                existing.is_compatible(&metadata),
                "Shard layout in {} does not match: existing {existing:?}, requested {metadata:?}",
                root.display()
            );
            info!(
                "Resuming shard writer at {} with {} records",
                root.display(),
                existing.n_records
            );
            metadata.n_records = existing.n_records;
        } else {
            metadata.n_records = 0;
        }
        metadata.save(&root)?;

        Ok(Self {
            root,
            metadata,
            files: HashMap::new(),
        })
    }

    /// Records written so far
    pub fn len(&self) -> usize {
        self.metadata.n_records
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.n_records == 0
    }

    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `batch` to global indices `start..start + batch.dim(0)`.
    ///
    /// Trailing dimensions of `batch` must hold exactly one record per row
    /// (e.g. `(n, n_layers, n_tokens, d_model)`, or `(n, d_model)` when
    /// layers and tokens are both 1).
    pub fn write(&mut self, start: usize, batch: &Tensor) -> Result<Range<usize>> {
        let dims = batch.dims();
        anyhow::ensure!(!dims.is_empty(), "Cannot write a scalar as shard records");
        let n = dims[0];
        let per_record: usize = dims[1..].iter().product();
        anyhow::ensure!(
            per_record == self.metadata.record_elems(),
            "Record shape {:?} does not match shard layout {:?}",
            &dims[1..],
            self.metadata.record_shape()
        );
        anyhow::ensure!(
            start <= self.metadata.n_records,
            "Write at index {start} would leave a gap after {} records",
            self.metadata.n_records
        );
        let end = start + n;
        if n == 0 {
            return Ok(start..end);
        }

        let bytes = tensor_to_bytes(batch, self.metadata.dtype)?;
        let record_bytes = self.metadata.record_bytes();

        let mut index = start;
        while index < end {
            let shard_id = self.metadata.shard_id(index);
            let run_end = end.min((shard_id + 1) * self.metadata.capacity);
            let offset = self.metadata.offset_in_shard(index);
            let chunk = &bytes[(index - start) * record_bytes..(run_end - start) * record_bytes];

            let file = self.shard_file(shard_id)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(chunk)
                .with_context(|| format!("Failed to write records {index}..{run_end}"))?;
            index = run_end;
        }

        self.metadata.n_records = self.metadata.n_records.max(end);
        debug!("Wrote records {start}..{end}");
        Ok(start..end)
    }

    /// Append `batch` after the last written record
    pub fn append(&mut self, batch: &Tensor) -> Result<Range<usize>> {
        self.write(self.metadata.n_records, batch)
    }

    /// Flush open shard files and persist metadata
    pub fn flush(&mut self) -> Result<()> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        self.metadata.save(&self.root)
    }

    /// Flush and close the writer, returning the final metadata
    pub fn finish(mut self) -> Result<ShardMetadata> {
        self.flush()?;
        self.files.clear();
        Ok(self.metadata.clone())
    }

    fn shard_file(&mut self, shard_id: usize) -> Result<&mut File> {
        if !self.files.contains_key(&shard_id) {
            let path = shard_path(&self.root, shard_id);
            let existed = path.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .with_context(|| format!("Failed to open shard {}", path.display()))?;
            if !existed {
                info!("Created shard {}", path.display());
            }
            self.files.insert(shard_id, file);
        }
        self.files
            .get_mut(&shard_id)
            .ok_or_else(|| anyhow::anyhow!("Shard {shard_id} not open"))
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.files.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!("Failed to flush shard writer at {}: {e:#}", self.root.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Which captured layers a dataset read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSelection {
    All,
    Last,
    Layer(usize),
}

/// What part of each stored record a [`ShardedDataset`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLoadConfig {
    pub layer: LayerSelection,
    pub tokens: TokenSelection,
}

impl Default for DataLoadConfig {
    fn default() -> Self {
        Self {
            layer: LayerSelection::All,
            tokens: TokenSelection::AllTokens,
        }
    }
}

/// Random-access reader over a shard directory.
///
/// Each instance owns its own file handles, opened read-only and lazily, so
/// any number of readers can share a directory.
pub struct ShardedDataset {
    root: PathBuf,
    metadata: ShardMetadata,
    selection: DataLoadConfig,
    device: Device,
    files: HashMap<usize, File>,
}

impl ShardedDataset {
    /// Open a shard directory, validating the selection against its metadata
    pub fn open(root: impl AsRef<Path>, selection: DataLoadConfig, device: &Device) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let metadata = ShardMetadata::load(&root)?;
        if let LayerSelection::Layer(layer) = selection.layer {
            anyhow::ensure!(
                layer < metadata.n_layers,
                "Layer {layer} out of range (shards hold {} layers)",
                metadata.n_layers
            );
        }
        info!(
            "Opened shard dataset {}: {} records, {} shards, record shape {:?}",
            root.display(),
            metadata.n_records,
            metadata.n_shards(),
            metadata.record_shape()
        );
        Ok(Self {
            root,
            metadata,
            selection,
            device: device.clone(),
            files: HashMap::new(),
        })
    }

    /// Number of readable records
    pub fn len(&self) -> usize {
        self.metadata.n_records
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.n_records == 0
    }

    pub fn metadata(&self) -> &ShardMetadata {
        &self.metadata
    }

    pub fn selection(&self) -> DataLoadConfig {
        self.selection
    }

    /// Shape of one record after layer/token selection
    pub fn record_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(3);
        if self.selection.layer == LayerSelection::All {
            shape.push(self.metadata.n_layers);
        }
        if self.selection.tokens == TokenSelection::AllTokens {
            shape.push(self.metadata.n_tokens);
        }
        shape.push(self.metadata.d_model);
        shape
    }

    /// Read one record, shaped [`record_shape`](Self::record_shape)
    pub fn get(&mut self, index: usize) -> Result<Tensor> {
        Ok(self.get_many(&[index])?.squeeze(0)?)
    }

    /// Read records in the requested order, shaped `(n, record_shape...)`.
    ///
    /// Indices may repeat and need not be sorted; only shards containing a
    /// requested index are opened.
    pub fn get_many(&mut self, indices: &[usize]) -> Result<Tensor> {
        let raw = self.read_raw(indices)?;
        let selected = self.apply_selection(raw)?;
        Ok(selected.to_device(&self.device)?)
    }

    /// Read full `(n, n_layers, n_tokens, d_model)` records in storage dtype
    pub fn read_raw(&mut self, indices: &[usize]) -> Result<Tensor> {
        let len = self.len();
        for &index in indices {
            anyhow::ensure!(
                index < len,
                "Index {index} out of range (dataset has {len} records)"
            );
        }

        let record_bytes = self.metadata.record_bytes();
        let mut buffer = vec![0u8; indices.len() * record_bytes];

        // Group by shard so each file is visited once, in offset order
        let mut by_shard: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (position, &index) in indices.iter().enumerate() {
            by_shard
                .entry(self.metadata.shard_id(index))
                .or_default()
                .push((index, position));
        }

        for (shard_id, mut entries) in by_shard {
            entries.sort_unstable();
            let offsets: Vec<(u64, usize)> = entries
                .iter()
                .map(|&(index, position)| (self.metadata.offset_in_shard(index), position))
                .collect();
            let file = self.shard_file(shard_id)?;
            for (offset, position) in offsets {
                file.seek(SeekFrom::Start(offset))?;
                let dst = &mut buffer[position * record_bytes..(position + 1) * record_bytes];
                file.read_exact(dst)
                    .with_context(|| format!("Short read in shard {shard_id} at offset {offset}"))?;
            }
        }

        let [n_layers, n_tokens, d_model] = self.metadata.record_shape();
        let tensor = Tensor::from_raw_buffer(
            &buffer,
            self.metadata.dtype.dtype(),
            &[indices.len(), n_layers, n_tokens, d_model],
            &Device::Cpu,
        )?;
        Ok(tensor)
    }

    fn apply_selection(&self, raw: Tensor) -> Result<Tensor> {
        let n_layers = self.metadata.n_layers;
        let by_layer = match self.selection.layer {
            LayerSelection::All => raw,
            LayerSelection::Last => raw.i((.., n_layers - 1))?,
            LayerSelection::Layer(layer) => raw.i((.., layer))?,
        };
        let selected = match (self.selection.layer, self.selection.tokens) {
            (_, TokenSelection::AllTokens) => by_layer,
            (LayerSelection::All, TokenSelection::ClassToken) => by_layer.i((.., .., 0))?,
            (_, TokenSelection::ClassToken) => by_layer.i((.., 0))?,
        };
        Ok(selected.contiguous()?)
    }

    fn shard_file(&mut self, shard_id: usize) -> Result<&mut File> {
        if !self.files.contains_key(&shard_id) {
            let path = shard_path(&self.root, shard_id);
            let file = File::open(&path)
                .with_context(|| format!("Failed to open shard {}", path.display()))?;
            self.files.insert(shard_id, file);
        }
        self.files
            .get_mut(&shard_id)
            .ok_or_else(|| anyhow::anyhow!("Shard {shard_id} not open"))
    }
}

/// Encode a tensor's elements as raw bytes in the storage dtype
fn tensor_to_bytes(tensor: &Tensor, dtype: StorageDType) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?.to_dtype(dtype.dtype())?;
    let bytes: Vec<u8> = match dtype {
        StorageDType::F32 => bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
        StorageDType::F16 => bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
        StorageDType::BF16 => bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
    };
    Ok(bytes)
}
