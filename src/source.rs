//! Inputs and the frozen model they are fed through
//!
//! - [`InputStream`]: a restartable stream of [`Record`]s (images, token ids)
//! - [`ActivationSource`]: the frozen model, seen only through
//!   `run_with_cache`

use std::collections::HashMap;

use anyhow::Result;
use candle_core::Tensor;

use crate::cache::ActivationCache;
use crate::hooks::HookPoint;

/// One item from a streaming dataset: named tensor fields
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: HashMap<String, Tensor>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion
    pub fn with_field(mut self, key: impl Into<String>, value: Tensor) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) {
        self.fields.insert(key.into(), value);
    }

    /// Get a field by name
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.fields.get(key)
    }

    /// Check whether a field exists
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// Restartable stream of input records.
///
/// `next_record` returns `Ok(None)` once the stream is exhausted;
/// `restart` rewinds it to the beginning for another pass.
pub trait InputStream {
    fn next_record(&mut self) -> Result<Option<Record>>;
    fn restart(&mut self) -> Result<()>;
}

/// In-memory input stream over a fixed list of records
#[derive(Debug, Clone)]
pub struct VecInputStream {
    records: Vec<Record>,
    position: usize,
}

impl VecInputStream {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            position: 0,
        }
    }

    /// Build a stream with one field per record from a list of tensors
    pub fn from_tensors(key: &str, tensors: Vec<Tensor>) -> Self {
        let records = tensors
            .into_iter()
            .map(|t| Record::new().with_field(key, t))
            .collect();
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl InputStream for VecInputStream {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let record = self.records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    fn restart(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

/// A frozen model that exposes intermediate activations.
///
/// This is the only view the training pipeline has of the transformer:
/// given a batch of inputs and a list of hook points, return the
/// activations captured at each hook, shaped `(batch, n_tokens, d_model)`.
pub trait ActivationSource {
    /// Hidden size at the hook points
    fn d_model(&self) -> usize;

    /// Run a forward pass and capture the requested hooks
    fn run_with_cache(&self, inputs: &Tensor, hooks: &[HookPoint]) -> Result<ActivationCache>;
}

impl<T: ActivationSource + ?Sized> ActivationSource for &T {
    fn d_model(&self) -> usize {
        (**self).d_model()
    }

    fn run_with_cache(&self, inputs: &Tensor, hooks: &[HookPoint]) -> Result<ActivationCache> {
        (**self).run_with_cache(inputs, hooks)
    }
}
