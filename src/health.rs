//! Per-feature firing statistics
//!
//! Two parallel arrays indexed by feature id:
//! - `activation_frequency`: tokens on which each feature fired since the
//!   last window reset
//! - `steps_since_fired`: steps since each feature last fired, never reset
//!   by the window

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Firing statistics for every SAE feature
#[derive(Debug, Clone)]
pub struct FeatureHealthTracker {
    activation_frequency: Vec<f64>,
    steps_since_fired: Vec<u64>,
    tokens_since_reset: u64,
    steps_since_reset: u64,
}

impl FeatureHealthTracker {
    pub fn new(d_sae: usize) -> Self {
        Self {
            activation_frequency: vec![0.0; d_sae],
            steps_since_fired: vec![0; d_sae],
            tokens_since_reset: 0,
            steps_since_reset: 0,
        }
    }

    pub fn d_sae(&self) -> usize {
        self.activation_frequency.len()
    }

    /// Record one step.
    ///
    /// `fired_counts[f]` is the number of tokens in the batch on which
    /// feature `f` fired. Features with a positive count have their
    /// `steps_since_fired` reset; every other counter advances by one.
    pub fn record(&mut self, fired_counts: &[f32], n_tokens: usize) -> Result<()> {
        anyhow::ensure!(
            fired_counts.len() == self.d_sae(),
            "Fired counts have {} entries, expected {}",
            fired_counts.len(),
            self.d_sae()
        );
        for ((freq, since), &count) in self
            .activation_frequency
            .iter_mut()
            .zip(self.steps_since_fired.iter_mut())
            .zip(fired_counts)
        {
            *freq += f64::from(count);
            if count > 0.0 {
                *since = 0;
            } else {
                *since += 1;
            }
        }
        self.tokens_since_reset += n_tokens as u64;
        self.steps_since_reset += 1;
        Ok(())
    }

    /// Features whose `steps_since_fired` exceeds `threshold_steps`
    pub fn dead_mask(&self, threshold_steps: u64) -> Vec<bool> {
        self.steps_since_fired
            .iter()
            .map(|&s| s > threshold_steps)
            .collect()
    }

    /// Indices of [`dead_mask`](Self::dead_mask) features
    pub fn dead_indices(&self, threshold_steps: u64) -> Vec<u32> {
        self.steps_since_fired
            .iter()
            .enumerate()
            .filter(|(_, &s)| s > threshold_steps)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Firing frequency of each feature over the current window
    pub fn sparsity_snapshot(&self) -> Vec<f64> {
        let denom = self.tokens_since_reset as f64 + 1e-10;
        self.activation_frequency.iter().map(|&f| f / denom).collect()
    }

    /// `log10(sparsity + 1e-10)` per feature
    pub fn log_sparsity(&self) -> Vec<f64> {
        self.sparsity_snapshot()
            .into_iter()
            .map(|s| (s + 1e-10).log10())
            .collect()
    }

    /// Start a new sampling window. `steps_since_fired` is kept.
    pub fn reset_window(&mut self) {
        self.activation_frequency.iter_mut().for_each(|f| *f = 0.0);
        self.tokens_since_reset = 0;
        self.steps_since_reset = 0;
    }

    pub fn activation_frequency(&self) -> &[f64] {
        &self.activation_frequency
    }

    pub fn steps_since_fired(&self) -> &[u64] {
        &self.steps_since_fired
    }

    pub fn tokens_since_reset(&self) -> u64 {
        self.tokens_since_reset
    }

    pub fn steps_since_reset(&self) -> u64 {
        self.steps_since_reset
    }

    /// Total firings in the current window
    pub fn total_fired(&self) -> f64 {
        self.activation_frequency.iter().sum()
    }

    pub fn mean_steps_since_fired(&self) -> f64 {
        if self.steps_since_fired.is_empty() {
            return 0.0;
        }
        self.steps_since_fired.iter().sum::<u64>() as f64 / self.steps_since_fired.len() as f64
    }
}

/// Per-feature count of batch rows with a positive activation.
///
/// `feature_acts` is `(batch, d_sae)`.
pub fn fired_counts(feature_acts: &Tensor) -> Result<Vec<f32>> {
    let counts = feature_acts
        .gt(0f64)?
        .to_dtype(DType::F32)?
        .sum(0)?
        .to_vec1::<f32>()?;
    Ok(counts)
}
