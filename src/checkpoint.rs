//! Checkpoint files
//!
//! A checkpoint labelled `label` (a token count, or `final`) is three
//! sibling files in the checkpoint directory:
//!
//! - `{label}_{name}.safetensors`: `W_enc`, `b_enc`, `W_dec`, `b_dec`
//! - `{label}_{name}_cfg.json`: run config and run state
//! - `{label}_{name}_log_feature_sparsity.safetensors`: `log_feature_sparsity`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SaeConfig;
use crate::sae::SparseAutoencoder;
use crate::trainer::RunState;

pub const LOG_SPARSITY_KEY: &str = "log_feature_sparsity";

/// Contents of the `_cfg.json` sibling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: SaeConfig,
    pub run_state: RunState,
}

/// Paths of one checkpoint's files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub weights: PathBuf,
    pub config: PathBuf,
    pub log_sparsity: PathBuf,
}

impl CheckpointPaths {
    pub fn new(dir: &Path, label: &str, name: &str) -> Self {
        let stem = format!("{label}_{name}");
        Self {
            weights: dir.join(format!("{stem}.safetensors")),
            config: dir.join(format!("{stem}_cfg.json")),
            log_sparsity: dir.join(format!("{stem}_log_feature_sparsity.safetensors")),
        }
    }

    /// Sibling paths of an existing weights file
    pub fn from_weights(weights: &Path) -> Result<Self> {
        let file = weights
            .file_name()
            .and_then(|f| f.to_str())
            .with_context(|| format!("Invalid checkpoint path {}", weights.display()))?;
        let stem = file
            .strip_suffix(".safetensors")
            .with_context(|| format!("Checkpoint {} is not a .safetensors file", weights.display()))?;
        let dir = weights.parent().unwrap_or_else(|| Path::new(""));
        Ok(Self {
            weights: weights.to_path_buf(),
            config: dir.join(format!("{stem}_cfg.json")),
            log_sparsity: dir.join(format!("{stem}_log_feature_sparsity.safetensors")),
        })
    }
}

/// Write weights, config and log sparsity for one checkpoint
pub fn save_checkpoint(
    dir: &Path,
    label: &str,
    sae: &SparseAutoencoder,
    config: &SaeConfig,
    run_state: &RunState,
    log_sparsity: &[f64],
) -> Result<CheckpointPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint directory {}", dir.display()))?;
    let paths = CheckpointPaths::new(dir, label, &sae.name());

    candle_core::safetensors::save(&sae.tensors(), &paths.weights)
        .with_context(|| format!("Failed to write {}", paths.weights.display()))?;

    let meta = CheckpointMeta {
        config: config.clone(),
        run_state: run_state.clone(),
    };
    std::fs::write(&paths.config, serde_json::to_string_pretty(&meta)?)
        .with_context(|| format!("Failed to write {}", paths.config.display()))?;

    let values: Vec<f32> = log_sparsity.iter().map(|&v| v as f32).collect();
    let mut sparsity = HashMap::new();
    sparsity.insert(
        LOG_SPARSITY_KEY.to_string(),
        Tensor::from_vec(values, log_sparsity.len(), &Device::Cpu)?,
    );
    candle_core::safetensors::save(&sparsity, &paths.log_sparsity)
        .with_context(|| format!("Failed to write {}", paths.log_sparsity.display()))?;

    info!("Saved checkpoint {}", paths.weights.display());
    Ok(paths)
}

/// Restore an SAE and its run metadata from a weights file
pub fn load_checkpoint(weights: &Path, device: &Device) -> Result<(SparseAutoencoder, CheckpointMeta)> {
    let paths = CheckpointPaths::from_weights(weights)?;
    let content = std::fs::read_to_string(&paths.config)
        .with_context(|| format!("Failed to read {}", paths.config.display()))?;
    let meta: CheckpointMeta = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", paths.config.display()))?;

    let tensors = read_safetensors(&paths.weights, device)?;
    let sae = SparseAutoencoder::from_tensors(&meta.config, &tensors, device)?;
    Ok((sae, meta))
}

/// Read the log-sparsity vector written next to a checkpoint
pub fn load_log_sparsity(path: &Path) -> Result<Vec<f32>> {
    let tensors = read_safetensors(path, &Device::Cpu)?;
    let t = tensors
        .get(LOG_SPARSITY_KEY)
        .with_context(|| format!("{} has no {LOG_SPARSITY_KEY}", path.display()))?;
    Ok(t.to_dtype(DType::F32)?.to_vec1()?)
}

fn read_safetensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;
    st.tensors()
        .into_iter()
        .map(|(name, view)| Ok((name, tensor_from_view(&view, device)?)))
        .collect()
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported checkpoint tensor dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let paths = CheckpointPaths::new(Path::new("ckpt"), "4096", "sae_x_64");
        assert_eq!(paths.weights, Path::new("ckpt/4096_sae_x_64.safetensors"));
        assert_eq!(paths.config, Path::new("ckpt/4096_sae_x_64_cfg.json"));
        assert_eq!(
            paths.log_sparsity,
            Path::new("ckpt/4096_sae_x_64_log_feature_sparsity.safetensors")
        );
        assert_eq!(CheckpointPaths::from_weights(&paths.weights).unwrap(), paths);
        assert!(CheckpointPaths::from_weights(Path::new("ckpt/model.pt")).is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = SaeConfig {
            d_in: 4,
            expansion_factor: 2,
            ..Default::default()
        };
        let sae = SparseAutoencoder::new(&config, &Device::Cpu).unwrap();
        let state = RunState {
            steps: 12,
            tokens: 384,
            ..Default::default()
        };
        let log_sparsity = vec![-10.0; 8];

        let paths = save_checkpoint(dir.path(), "final", &sae, &config, &state, &log_sparsity).unwrap();
        let (loaded, meta) = load_checkpoint(&paths.weights, &Device::Cpu).unwrap();
        assert_eq!(meta.run_state.steps, 12);
        assert_eq!(meta.config.d_in, 4);

        let original: Vec<Vec<f32>> = sae.w_dec().to_vec2().unwrap();
        let restored: Vec<Vec<f32>> = loaded.w_dec().to_vec2().unwrap();
        assert_eq!(original, restored);
        assert_eq!(load_log_sparsity(&paths.log_sparsity).unwrap(), vec![-10.0f32; 8]);
    }
}
