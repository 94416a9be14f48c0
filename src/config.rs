//! Run configuration for SAE training and activation caching
//!
//! Every string-selected behaviour of a run is a closed enum here, resolved
//! once when the config is loaded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::hooks::HookPoint;

/// How dead features are resampled at the end of each dead-feature window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSamplingMethod {
    /// Never resample
    Disabled,
    /// Reinitialise dead rows from poorly reconstructed inputs
    Anthropic,
    /// Accepted for compatibility; resampling under it does nothing
    L2,
}

/// Criterion used to call a feature dead at resample time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadFeatureEstimation {
    /// Feature did not fire once in the current sampling window
    NoFire,
    /// Feature firing frequency is below `dead_feature_threshold`
    Frequency,
}

/// Base learning-rate schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    Constant,
    ConstantWithWarmup,
    LinearWarmupDecay,
    CosineAnnealing,
    CosineAnnealingWarmup,
}

/// Initialisation of the decoder bias from the first buffer of activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BDecInit {
    Zeros,
    Mean,
    GeometricMedian,
}

/// Which token vectors of each input are kept as training records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSelection {
    /// Only token 0 (the class / summary token)
    ClassToken,
    /// Every token position
    AllTokens,
}

/// Element type of on-disk activation shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDType {
    F32,
    F16,
    BF16,
}

impl StorageDType {
    /// Matching candle dtype
    pub fn dtype(self) -> DType {
        match self {
            StorageDType::F32 => DType::F32,
            StorageDType::F16 => DType::F16,
            StorageDType::BF16 => DType::BF16,
        }
    }

    /// Bytes per stored element
    pub fn size_in_bytes(self) -> usize {
        match self {
            StorageDType::F32 => 4,
            StorageDType::F16 | StorageDType::BF16 => 2,
        }
    }
}

/// Configuration of one SAE training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaeConfig {
    // --- Data generation ---
    /// Hook location in the frozen model (TransformerLens naming)
    pub hook_point: String,
    /// Model hidden size
    pub d_in: usize,
    /// Field of each streamed record holding the model input
    pub data_key: String,
    /// Token vectors kept per input
    pub token_selection: TokenSelection,
    /// Inputs pulled from the stream per buffer refill
    pub store_size: usize,
    /// Largest batch handed to the frozen model in one forward pass
    pub max_batch_size_for_forward: usize,

    // --- SAE ---
    /// `d_sae = d_in * expansion_factor`
    pub expansion_factor: usize,
    pub b_dec_init: BDecInit,

    // --- Training ---
    pub train_batch_size: usize,
    pub total_training_tokens: u64,
    pub lr: f64,
    pub l1_coefficient: f64,
    pub lr_scheduler: LrSchedulerKind,
    pub lr_warm_up_steps: u64,

    // --- Dead features ---
    pub use_ghost_grads: bool,
    pub feature_sampling_method: FeatureSamplingMethod,
    /// Steps between sparsity snapshots (and statistic resets)
    pub feature_sampling_window: u64,
    /// Steps without firing after which a feature counts as dead
    pub dead_feature_window: u64,
    pub dead_feature_threshold: f64,
    pub dead_feature_estimation: DeadFeatureEstimation,
    /// Scale of resampled encoder columns relative to the mean alive norm
    pub feature_reinit_scale: f64,
    /// Store batches scored when choosing resampling inputs
    pub resample_batches: usize,

    // --- Shards ---
    /// Records per shard file
    pub shard_capacity: usize,
    pub shard_dtype: StorageDType,

    // --- Checkpoints and logging ---
    pub n_checkpoints: usize,
    pub checkpoint_path: PathBuf,
    /// Steps between metric emissions
    pub log_frequency: u64,

    // --- Misc ---
    pub seed: u64,
    /// `cpu`, `cuda` or `cuda:N`
    pub device: String,
}

impl Default for SaeConfig {
    fn default() -> Self {
        Self {
            hook_point: "blocks.8.hook_resid_post".to_string(),
            d_in: 768,
            data_key: "image".to_string(),
            token_selection: TokenSelection::ClassToken,
            store_size: 1024,
            max_batch_size_for_forward: 16,
            expansion_factor: 32,
            b_dec_init: BDecInit::GeometricMedian,
            train_batch_size: 1024,
            total_training_tokens: 2_000_000,
            lr: 4e-4,
            l1_coefficient: 8e-5,
            lr_scheduler: LrSchedulerKind::ConstantWithWarmup,
            lr_warm_up_steps: 500,
            use_ghost_grads: true,
            feature_sampling_method: FeatureSamplingMethod::Anthropic,
            feature_sampling_window: 1000,
            dead_feature_window: 2000,
            dead_feature_threshold: 1e-8,
            dead_feature_estimation: DeadFeatureEstimation::NoFire,
            feature_reinit_scale: 0.2,
            resample_batches: 32,
            shard_capacity: 4096,
            shard_dtype: StorageDType::F32,
            n_checkpoints: 0,
            checkpoint_path: PathBuf::from("checkpoints"),
            log_frequency: 50,
            seed: 42,
            device: "cpu".to_string(),
        }
    }
}

impl SaeConfig {
    /// Load a config from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    /// Reject configurations the trainer cannot run
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.d_in > 0, "d_in must be positive");
        anyhow::ensure!(self.expansion_factor > 0, "expansion_factor must be positive");
        anyhow::ensure!(self.train_batch_size > 0, "train_batch_size must be positive");
        anyhow::ensure!(self.store_size > 0, "store_size must be positive");
        anyhow::ensure!(
            self.max_batch_size_for_forward > 0,
            "max_batch_size_for_forward must be positive"
        );
        anyhow::ensure!(
            self.feature_sampling_window > 0,
            "feature_sampling_window must be positive"
        );
        anyhow::ensure!(self.dead_feature_window > 0, "dead_feature_window must be positive");
        anyhow::ensure!(self.shard_capacity > 0, "shard_capacity must be positive");
        anyhow::ensure!(self.log_frequency > 0, "log_frequency must be positive");
        anyhow::ensure!(self.lr > 0.0, "lr must be positive, got {}", self.lr);
        anyhow::ensure!(
            self.dead_feature_threshold >= 0.0,
            "dead_feature_threshold must be non-negative"
        );
        self.device()?;
        Ok(())
    }

    /// Number of SAE features
    pub fn d_sae(&self) -> usize {
        self.d_in * self.expansion_factor
    }

    /// Parsed hook location
    pub fn hook(&self) -> HookPoint {
        HookPoint::from(self.hook_point.as_str())
    }

    /// Optimizer steps needed to consume the token budget
    pub fn total_training_steps(&self) -> u64 {
        self.total_training_tokens / self.train_batch_size as u64
    }

    /// Token counts at which intermediate checkpoints are written.
    ///
    /// Evenly spaced multiples of `total / n_checkpoints`, excluding zero
    /// and the budget itself.
    pub fn checkpoint_thresholds(&self) -> Vec<u64> {
        if self.n_checkpoints == 0 {
            return Vec::new();
        }
        let stride = (self.total_training_tokens / self.n_checkpoints as u64).max(1);
        (1..)
            .map(|k| k * stride)
            .take_while(|&t| t < self.total_training_tokens)
            .collect()
    }

    /// Resolve the configured device
    pub fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::new_cuda(0)?),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| anyhow::anyhow!("Unknown device '{other}'"))?;
                Ok(Device::new_cuda(ordinal)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SaeConfig::default();
        assert_eq!(config.d_sae(), 768 * 32);
        assert_eq!(config.feature_sampling_method, FeatureSamplingMethod::Anthropic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_checkpoint_thresholds() {
        let config = SaeConfig {
            total_training_tokens: 1000,
            n_checkpoints: 4,
            ..Default::default()
        };
        assert_eq!(config.checkpoint_thresholds(), vec![250, 500, 750]);

        let none = SaeConfig {
            n_checkpoints: 0,
            ..Default::default()
        };
        assert!(none.checkpoint_thresholds().is_empty());
    }

    #[test]
    fn test_enum_serde_names() {
        let json = r#"{
            "feature_sampling_method": "l2",
            "dead_feature_estimation": "frequency",
            "lr_scheduler": "cosine_annealing_warmup",
            "token_selection": "all_tokens"
        }"#;
        let config: SaeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.feature_sampling_method, FeatureSamplingMethod::L2);
        assert_eq!(config.dead_feature_estimation, DeadFeatureEstimation::Frequency);
        assert_eq!(config.lr_scheduler, LrSchedulerKind::CosineAnnealingWarmup);
        assert_eq!(config.token_selection, TokenSelection::AllTokens);
        assert_eq!(config.d_in, 768);
    }

    #[test]
    fn test_device_parsing() {
        let config = SaeConfig {
            device: "tpu".to_string(),
            ..Default::default()
        };
        assert!(config.device().is_err());
        assert!(SaeConfig::default().device().unwrap().is_cpu());
    }
}
