//! Dead-feature detection and resampling
//!
//! At the end of every dead-feature window the policy picks the dead
//! features from the tracker's window statistics and, under the Anthropic
//! method, reinitialises them from inputs the SAE currently reconstructs
//! badly. The trainer reacts to [`ResampleOutcome::Resampled`] by starting
//! an LR dip.

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{DeadFeatureEstimation, FeatureSamplingMethod, SaeConfig};
use crate::health::FeatureHealthTracker;
use crate::optim::Adam;
use crate::sae::{ResampleRows, SparseAutoencoder, B_ENC, W_DEC, W_ENC};
use crate::store::BatchSource;

/// What a resampling check did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResampleOutcome {
    /// Not a resampling step, or resampling disabled
    NotScheduled,
    /// Scheduled, but the configured method does nothing
    Skipped,
    /// Scheduled, but every feature is alive
    NoDeadFeatures,
    /// Weights of `n_resampled` of the `n_dead` dead features were replaced
    Resampled { n_dead: usize, n_resampled: usize },
}

pub struct ResamplingPolicy {
    method: FeatureSamplingMethod,
    estimation: DeadFeatureEstimation,
    dead_feature_window: u64,
    dead_feature_threshold: f64,
    reinit_scale: f64,
    resample_batches: usize,
    rng: StdRng,
}

impl ResamplingPolicy {
    pub fn from_config(cfg: &SaeConfig) -> Self {
        Self {
            method: cfg.feature_sampling_method,
            estimation: cfg.dead_feature_estimation,
            dead_feature_window: cfg.dead_feature_window,
            dead_feature_threshold: cfg.dead_feature_threshold,
            reinit_scale: cfg.feature_reinit_scale,
            resample_batches: cfg.resample_batches,
            rng: StdRng::seed_from_u64(cfg.seed.wrapping_add(1)),
        }
    }

    pub fn method(&self) -> FeatureSamplingMethod {
        self.method
    }

    /// Whether `step` closes a dead-feature window under an enabled method
    pub fn is_due(&self, step: u64) -> bool {
        self.method != FeatureSamplingMethod::Disabled
            && (step + 1) % self.dead_feature_window == 0
    }

    /// Dead features according to the configured estimation method
    pub fn dead_features(&self, tracker: &FeatureHealthTracker) -> Vec<u32> {
        match self.estimation {
            DeadFeatureEstimation::NoFire => tracker
                .activation_frequency()
                .iter()
                .enumerate()
                .filter(|(_, &f)| f == 0.0)
                .map(|(i, _)| i as u32)
                .collect(),
            DeadFeatureEstimation::Frequency => tracker
                .sparsity_snapshot()
                .iter()
                .enumerate()
                .filter(|(_, &s)| s < self.dead_feature_threshold)
                .map(|(i, _)| i as u32)
                .collect(),
        }
    }

    /// Run the resampling check for `step`
    pub fn maybe_resample<B: BatchSource>(
        &mut self,
        step: u64,
        sae: &SparseAutoencoder,
        optimizer: &mut Adam,
        tracker: &FeatureHealthTracker,
        store: &mut B,
    ) -> Result<ResampleOutcome> {
        if !self.is_due(step) {
            return Ok(ResampleOutcome::NotScheduled);
        }
        match self.method {
            FeatureSamplingMethod::Disabled => Ok(ResampleOutcome::NotScheduled),
            FeatureSamplingMethod::L2 => {
                warn!("L2 resampling is not implemented; use anthropic resampling");
                Ok(ResampleOutcome::Skipped)
            }
            FeatureSamplingMethod::Anthropic => {
                let dead = self.dead_features(tracker);
                if dead.is_empty() {
                    info!("No dead features at step {step}, skipping resampling");
                    return Ok(ResampleOutcome::NoDeadFeatures);
                }
                let n_resampled = self.resample_anthropic(&dead, sae, optimizer, store)?;
                if n_resampled == 0 {
                    return Ok(ResampleOutcome::Skipped);
                }
                info!("Resampled {n_resampled} of {} dead features at step {step}", dead.len());
                Ok(ResampleOutcome::Resampled {
                    n_dead: dead.len(),
                    n_resampled,
                })
            }
        }
    }

    /// Reinitialise `dead` from inputs sampled with probability proportional
    /// to their squared reconstruction loss. Returns how many were replaced.
    pub fn resample_anthropic<B: BatchSource>(
        &mut self,
        dead: &[u32],
        sae: &SparseAutoencoder,
        optimizer: &mut Adam,
        store: &mut B,
    ) -> Result<usize> {
        let (inputs, losses) = self.collect_losses(sae, store)?;
        let n_inputs = losses.len();
        if dead.len() > n_inputs {
            warn!(
                "{} dead features but only {n_inputs} inputs to resample from; \
                 consider more resample batches",
                dead.len()
            );
        }

        let weights: Vec<f64> = losses.iter().map(|&l| f64::from(l).powi(2)).collect();
        let n_positive = weights.iter().filter(|&&w| w > 0.0).count();
        if n_positive == 0 {
            warn!("All reconstruction losses are zero; skipping resampling");
            return Ok(0);
        }

        // reference norm excludes every dead feature, resampled or not
        let alive_norm = mean_alive_encoder_norm(sae, dead)?;
        let amount = dead.len().min(n_positive);
        let sampled = rand::seq::index::sample_weighted(&mut self.rng, n_inputs, |i| weights[i], amount)
            .map_err(|e| anyhow::anyhow!("Weighted sampling failed: {e}"))?;
        let sampled: Vec<u32> = sampled.into_iter().map(|i| i as u32).collect();
        let dead = &dead[..amount];
        debug!("Sampled {amount} resampling inputs out of {n_inputs}");

        let device = sae.device();
        let sampled = Tensor::from_vec(sampled, amount, device)?;
        let directions = inputs
            .index_select(&sampled, 0)?
            .broadcast_sub(sae.b_dec())?;
        let norms = (directions.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-8)?;
        let directions = directions.broadcast_div(&norms)?;

        let encoder_cols = (&directions * (alive_norm * self.reinit_scale))?;

        let rows = ResampleRows {
            indices: dead.to_vec(),
            decoder_rows: directions,
            encoder_cols,
            encoder_bias: Tensor::zeros(amount, DType::F32, device)?,
        };
        sae.apply_resample(&rows)?;

        optimizer.zero_moments(W_ENC, 1, dead)?;
        optimizer.zero_moments(B_ENC, 0, dead)?;
        optimizer.zero_moments(W_DEC, 0, dead)?;
        Ok(amount)
    }

    /// Score `resample_batches` store batches by per-input squared error
    fn collect_losses<B: BatchSource>(
        &self,
        sae: &SparseAutoencoder,
        store: &mut B,
    ) -> Result<(Tensor, Vec<f32>)> {
        let mut inputs = Vec::with_capacity(self.resample_batches);
        let mut losses = Vec::new();
        for _ in 0..self.resample_batches.max(1) {
            let batch = store.next_batch()?.to_dtype(DType::F32)?.detach();
            let recon = sae.decode(&sae.encode(&batch)?)?.detach();
            let loss: Vec<f32> = (&recon - &batch)?.sqr()?.sum(1)?.to_vec1()?;
            losses.extend(loss);
            inputs.push(batch);
        }
        Ok((Tensor::cat(&inputs, 0)?, losses))
    }
}

/// Mean L2 norm of the encoder columns not in `dead`, or 1.0 if none remain
fn mean_alive_encoder_norm(sae: &SparseAutoencoder, dead: &[u32]) -> Result<f64> {
    let mut alive = vec![true; sae.d_sae()];
    for &i in dead {
        if let Some(slot) = alive.get_mut(i as usize) {
            *slot = false;
        }
    }
    let norms: Vec<f32> = sae.w_enc().sqr()?.sum(0)?.sqrt()?.to_vec1()?;
    let (sum, count) = norms
        .iter()
        .zip(&alive)
        .filter(|(_, &a)| a)
        .fold((0.0f64, 0usize), |(s, c), (&n, _)| (s + f64::from(n), c + 1));
    Ok(if count == 0 { 1.0 } else { sum / count as f64 })
}
