//! Activation store: a shuffled in-memory buffer of training vectors
//!
//! Vectors come from an [`ActivationProvider`], either by running the frozen
//! model over a stream of inputs ([`ModelActivations`]) or by reading a
//! cached shard directory ([`CachedActivations`]). The [`ActivationBuffer`]
//! shuffles each block it receives and hands out fixed-size batches,
//! refilling synchronously whenever it runs dry.
//!
//! [`cache_activations`] drives the same model path into a [`ShardWriter`]
//! so later runs can skip the forward pass entirely.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{SaeConfig, TokenSelection};
use crate::hooks::HookPoint;
use crate::shard::{LayerSelection, ShardWriter, ShardedDataset};
use crate::source::{ActivationSource, InputStream, Record};

/// Result of pulling one block of activations from a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillStatus {
    /// The underlying source still has data for the next refill
    MoreData,
    /// The source ran out during this refill and has been rewound
    SourceExhausted,
}

/// Producer of activation vectors for the buffer
pub trait ActivationProvider {
    /// Dimension of each produced vector
    fn d_in(&self) -> usize;

    /// Produce the next block of vectors, shape `(n, d_in)` with `n > 0`
    fn produce(&mut self) -> Result<(Tensor, RefillStatus)>;
}

/// Pull-based source of training batches
pub trait BatchSource {
    /// Next batch of vectors `(batch, d_in)`; refills transparently
    fn next_batch(&mut self) -> Result<Tensor>;

    /// Every vector currently buffered, filling the buffer first if empty.
    ///
    /// Does not consume anything.
    fn buffered(&mut self) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// Model-backed provider
// ---------------------------------------------------------------------------

/// Runs the frozen model over streamed inputs.
pub struct ModelActivations<S: ActivationSource, I: InputStream> {
    source: S,
    inputs: I,
    hook: HookPoint,
    data_key: String,
    store_size: usize,
    max_forward: usize,
    selection: TokenSelection,
    /// Record read during key validation, served first
    pending: Option<Record>,
}

impl<S: ActivationSource, I: InputStream> ModelActivations<S, I> {
    /// Wrap a model and an input stream.
    ///
    /// Fails immediately if the first record lacks `config.data_key`.
    pub fn new(source: S, mut inputs: I, config: &SaeConfig) -> Result<Self> {
        anyhow::ensure!(
            source.d_model() == config.d_in,
            "Model hidden size {} does not match d_in {}",
            source.d_model(),
            config.d_in
        );
        let first = inputs
            .next_record()?
            .ok_or_else(|| anyhow::anyhow!("Input stream is empty"))?;
        anyhow::ensure!(
            first.contains(&config.data_key),
            "The data key '{}' is not valid for this dataset (fields: {:?})",
            config.data_key,
            first.keys()
        );

        Ok(Self {
            source,
            inputs,
            hook: config.hook(),
            data_key: config.data_key.clone(),
            store_size: config.store_size,
            max_forward: config.max_batch_size_for_forward,
            selection: config.token_selection,
            pending: Some(first),
        })
    }

    /// Pull up to `store_size` inputs without repeating any within the call.
    ///
    /// If the stream ends part-way, the inputs gathered so far are returned
    /// and the stream is rewound for the next call. An empty pull rewinds
    /// and reads from the fresh stream instead.
    fn pull_inputs(&mut self) -> Result<(Vec<Tensor>, RefillStatus)> {
        let mut inputs = Vec::with_capacity(self.store_size);
        let mut status = RefillStatus::MoreData;

        while inputs.len() < self.store_size {
            let record = match self.pending.take() {
                Some(record) => Some(record),
                None => self.inputs.next_record()?,
            };
            let Some(record) = record else {
                self.inputs.restart()?;
                status = RefillStatus::SourceExhausted;
                if !inputs.is_empty() {
                    break;
                }
                debug!("Input stream exhausted, restarting");
                match self.inputs.next_record()? {
                    Some(record) => {
                        inputs.push(self.input_tensor(&record)?);
                        continue;
                    }
                    None => anyhow::bail!("Input stream yielded no records after restart"),
                }
            };
            inputs.push(self.input_tensor(&record)?);
        }

        Ok((inputs, status))
    }

    fn input_tensor(&self, record: &Record) -> Result<Tensor> {
        record
            .get(&self.data_key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Record is missing data key '{}'", self.data_key))
    }
}

impl<S: ActivationSource, I: InputStream> ActivationProvider for ModelActivations<S, I> {
    fn d_in(&self) -> usize {
        self.source.d_model()
    }

    fn produce(&mut self) -> Result<(Tensor, RefillStatus)> {
        let (inputs, status) = self.pull_inputs()?;
        let batch = Tensor::stack(&inputs, 0)?;
        let hook = self.hook.clone();
        let selection = self.selection;
        let source = &self.source;

        let acts = forward_in_minibatches(&batch, self.max_forward, |mini| {
            let cache = source.run_with_cache(mini, std::slice::from_ref(&hook))?;
            cache.training_vectors(&hook, selection)
        })?;
        debug!(
            "Produced {} activation vectors from {} inputs",
            acts.dim(0)?,
            inputs.len()
        );
        Ok((acts, status))
    }
}

/// Split `batch` along dim 0 into chunks of at most `max_batch`, run `f` on
/// each and concatenate the results.
pub fn forward_in_minibatches<F>(batch: &Tensor, max_batch: usize, mut f: F) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    anyhow::ensure!(max_batch > 0, "Forward batch limit must be positive");
    let n = batch.dim(0)?;
    let mut parts = Vec::with_capacity(n.div_ceil(max_batch));
    let mut start = 0;
    while start < n {
        let len = max_batch.min(n - start);
        parts.push(f(&batch.narrow(0, start, len)?)?);
        start += len;
    }
    Ok(Tensor::cat(&parts, 0)?)
}

// ---------------------------------------------------------------------------
// Shard-backed provider
// ---------------------------------------------------------------------------

/// Reads previously cached activations in index order, wrapping at the end.
pub struct CachedActivations {
    dataset: ShardedDataset,
    records_per_refill: usize,
    cursor: usize,
}

impl CachedActivations {
    /// `records_per_refill` records (inputs) are read per refill
    pub fn new(dataset: ShardedDataset, records_per_refill: usize) -> Result<Self> {
        let selection = dataset.selection();
        anyhow::ensure!(
            selection.layer != LayerSelection::All || dataset.metadata().n_layers == 1,
            "Training from shards needs a single layer selected ({} layers stored)",
            dataset.metadata().n_layers
        );
        anyhow::ensure!(!dataset.is_empty(), "Shard dataset is empty");
        anyhow::ensure!(records_per_refill > 0, "records_per_refill must be positive");
        Ok(Self {
            dataset,
            records_per_refill,
            cursor: 0,
        })
    }

    pub fn dataset(&self) -> &ShardedDataset {
        &self.dataset
    }
}

impl ActivationProvider for CachedActivations {
    fn d_in(&self) -> usize {
        self.dataset.metadata().d_model
    }

    fn produce(&mut self) -> Result<(Tensor, RefillStatus)> {
        let len = self.dataset.len();
        let end = (self.cursor + self.records_per_refill).min(len);
        let indices: Vec<usize> = (self.cursor..end).collect();
        let records = self.dataset.get_many(&indices)?;

        let status = if end == len {
            self.cursor = 0;
            RefillStatus::SourceExhausted
        } else {
            self.cursor = end;
            RefillStatus::MoreData
        };

        let d_in = self.d_in();
        let vectors = records.to_dtype(DType::F32)?.reshape(((), d_in))?;
        Ok((vectors, status))
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// Shuffled buffer handing out fixed-size batches.
///
/// Each refill pulls one block from the provider, merges it with the
/// vectors not yet served from the previous block, permutes the result and
/// serves it batch by batch. Every batch has exactly `batch_size` rows, and
/// every produced vector is served exactly once.
pub struct ActivationBuffer<P: ActivationProvider> {
    provider: P,
    batch_size: usize,
    device: Device,
    rng: StdRng,
    buffer: Option<Tensor>,
    position: usize,
    n_refills: u64,
    n_epochs: u64,
}

impl<P: ActivationProvider> ActivationBuffer<P> {
    pub fn new(provider: P, batch_size: usize, seed: u64, device: &Device) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        Ok(Self {
            provider,
            batch_size,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
            buffer: None,
            position: 0,
            n_refills: 0,
            n_epochs: 0,
        })
    }

    /// Build a buffer from a run config
    pub fn from_config(provider: P, config: &SaeConfig) -> Result<Self> {
        anyhow::ensure!(
            provider.d_in() == config.d_in,
            "Provider dimension {} does not match d_in {}",
            provider.d_in(),
            config.d_in
        );
        Self::new(provider, config.train_batch_size, config.seed, &config.device()?)
    }

    /// Pull a block from the provider and reshuffle it together with any
    /// vectors not yet served
    pub fn refill(&mut self) -> Result<RefillStatus> {
        let (acts, status) = self.provider.produce().context("Failed to refill buffer")?;
        let produced = acts.dim(0)?;
        anyhow::ensure!(produced > 0, "Activation provider produced an empty block");

        let acts = acts.to_device(&self.device)?;
        let pool = match self.unserved()? {
            Some(tail) => Tensor::cat(&[&tail, &acts], 0)?,
            None => acts,
        };
        let n = pool.dim(0)?;

        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(&mut self.rng);
        let order = Tensor::from_vec(order, n, &self.device)?;
        let shuffled = pool.index_select(&order, 0)?;

        self.buffer = Some(shuffled);
        self.position = 0;
        self.n_refills += 1;
        if status == RefillStatus::SourceExhausted {
            self.n_epochs += 1;
            info!("Activation source exhausted after refill {}; restarted", self.n_refills);
        }
        debug!("Refilled buffer with {produced} new vectors ({n} buffered)");
        Ok(status)
    }

    /// Vectors of the current block not yet handed out
    fn unserved(&self) -> Result<Option<Tensor>> {
        let remaining = self.remaining();
        match &self.buffer {
            Some(buffer) if remaining > 0 => Ok(Some(buffer.narrow(0, self.position, remaining)?)),
            _ => Ok(None),
        }
    }

    /// Vectors left before the next refill
    pub fn remaining(&self) -> usize {
        self.buffer
            .as_ref()
            .and_then(|b| b.dim(0).ok())
            .map_or(0, |n| n.saturating_sub(self.position))
    }

    pub fn n_refills(&self) -> u64 {
        self.n_refills
    }

    /// Times the provider ran out of source data
    pub fn n_epochs(&self) -> u64 {
        self.n_epochs
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<P: ActivationProvider> BatchSource for ActivationBuffer<P> {
    fn next_batch(&mut self) -> Result<Tensor> {
        while self.remaining() < self.batch_size {
            self.refill()?;
        }
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Buffer empty after refill"))?;
        let batch = buffer.narrow(0, self.position, self.batch_size)?;
        self.position += self.batch_size;
        Ok(batch)
    }

    fn buffered(&mut self) -> Result<Tensor> {
        if self.remaining() == 0 {
            self.refill()?;
        }
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Buffer empty after refill"))?;
        Ok(buffer.narrow(0, self.position, buffer.dim(0)? - self.position)?)
    }
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

/// Run the model over up to `n_inputs` inputs and write every captured hook
/// to shards, one record `(hooks.len(), n_tokens, d_model)` per input.
///
/// Each input is cached exactly once: the stream is not restarted. Returns
/// the number of records written.
pub fn cache_activations<S, I>(
    source: &S,
    inputs: &mut I,
    data_key: &str,
    hooks: &[HookPoint],
    writer: &mut ShardWriter,
    n_inputs: usize,
    max_forward: usize,
) -> Result<usize>
where
    S: ActivationSource,
    I: InputStream,
{
    anyhow::ensure!(!hooks.is_empty(), "No hook points to cache");
    anyhow::ensure!(
        writer.metadata().n_layers == hooks.len(),
        "Shards hold {} layers but {} hooks were requested",
        writer.metadata().n_layers,
        hooks.len()
    );
    anyhow::ensure!(max_forward > 0, "Forward batch limit must be positive");

    let mut written = 0;
    let mut exhausted = false;
    while written < n_inputs && !exhausted {
        let want = max_forward.min(n_inputs - written);
        let mut batch = Vec::with_capacity(want);
        while batch.len() < want {
            match inputs.next_record()? {
                Some(record) => {
                    let input = record.get(data_key).cloned().ok_or_else(|| {
                        anyhow::anyhow!(
                            "The data key '{data_key}' is not valid for this dataset (fields: {:?})",
                            record.keys()
                        )
                    })?;
                    batch.push(input);
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        if batch.is_empty() {
            break;
        }

        let batch = Tensor::stack(&batch, 0)?;
        let cache = source.run_with_cache(&batch, hooks)?;
        let layers = hooks
            .iter()
            .map(|hook| cache.require(hook).cloned())
            .collect::<Result<Vec<_>>>()?;
        // (batch, layers, tokens, d_model)
        let records = Tensor::stack(&layers, 1)?;
        let range = writer.append(&records)?;
        written += range.len();
    }

    writer.flush()?;
    if written < n_inputs {
        warn!("Input stream ended after {written} of {n_inputs} requested inputs");
    }
    info!("Cached {written} records to {}", writer.root().display());
    Ok(written)
}
