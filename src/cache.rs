//! Activation cache returned by a hooked forward pass

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use crate::config::TokenSelection;
use crate::hooks::HookPoint;

/// Stores the activations captured at each requested hook point
#[derive(Debug, Default)]
pub struct ActivationCache {
    /// Each tensor has shape `(batch, n_tokens, d_model)`
    activations: HashMap<HookPoint, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache with room for `n_hooks` entries
    pub fn with_capacity(n_hooks: usize) -> Self {
        Self {
            activations: HashMap::with_capacity(n_hooks),
        }
    }

    /// Store the activation captured at `hook`, replacing any previous one
    pub fn insert(&mut self, hook: HookPoint, tensor: Tensor) {
        self.activations.insert(hook, tensor);
    }

    /// Get the activation captured at `hook`
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.activations.get(hook)
    }

    /// Get the activation at `hook`, failing if it was not captured
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.activations
            .get(hook)
            .ok_or_else(|| anyhow::anyhow!("Hook {hook} not in activation cache"))
    }

    /// Number of captured hook points
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Flatten the activation at `hook` into training vectors.
    ///
    /// Returns `(batch, d_model)` for [`TokenSelection::ClassToken`] and
    /// `(batch * n_tokens, d_model)` for [`TokenSelection::AllTokens`].
    pub fn training_vectors(&self, hook: &HookPoint, selection: TokenSelection) -> Result<Tensor> {
        select_tokens(self.require(hook)?, selection)
    }
}

/// Reduce a `(batch, n_tokens, d_model)` activation to training vectors
pub fn select_tokens(acts: &Tensor, selection: TokenSelection) -> Result<Tensor> {
    let (batch, n_tokens, d_model) = acts.dims3()?;
    let vectors = match selection {
        TokenSelection::ClassToken => acts.i((.., 0, ..))?.contiguous()?,
        TokenSelection::AllTokens => acts.reshape((batch * n_tokens, d_model))?,
    };
    Ok(vectors)
}
