//! Feature-firing counts over a whole shard dataset

use anyhow::Result;
use tracing::info;

use crate::health::fired_counts;
use crate::sae::SparseAutoencoder;
use crate::shard::ShardedDataset;

/// Features firing on more than this fraction of vectors count as dense
pub const DENSE_FRACTION: f64 = 1.0 / 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureCounts {
    /// Vectors on which each feature fired
    pub counts: Vec<u64>,
    pub n_vectors: u64,
    /// Features that never fired
    pub dead: Vec<u32>,
    /// Features firing on more than [`DENSE_FRACTION`] of vectors
    pub dense: Vec<u32>,
}

/// Run every record of `dataset` through the SAE encoder and count firings
pub fn evaluate_feature_counts(
    sae: &SparseAutoencoder,
    dataset: &mut ShardedDataset,
    batch_size: usize,
) -> Result<FeatureCounts> {
    anyhow::ensure!(batch_size > 0, "batch_size must be positive");
    let d_in = sae.d_in();
    let mut counts = vec![0u64; sae.d_sae()];
    let mut n_vectors = 0u64;

    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(batch_size) {
        let records = dataset.get_many(chunk)?;
        anyhow::ensure!(
            records.elem_count() % d_in == 0,
            "Dataset records do not split into vectors of width {d_in}"
        );
        let vectors = records
            .to_dtype(candle_core::DType::F32)?
            .reshape(((), d_in))?
            .to_device(sae.device())?;
        let fired = fired_counts(&sae.encode(&vectors)?)?;
        for (total, f) in counts.iter_mut().zip(fired) {
            *total += f as u64;
        }
        n_vectors += vectors.dim(0)? as u64;
    }

    let dense_cutoff = n_vectors as f64 * DENSE_FRACTION;
    let dead = counts
        .iter()
        .enumerate()
        .filter(|(_, &c)| c == 0)
        .map(|(i, _)| i as u32)
        .collect::<Vec<_>>();
    let dense = counts
        .iter()
        .enumerate()
        .filter(|(_, &c)| c as f64 > dense_cutoff)
        .map(|(i, _)| i as u32)
        .collect::<Vec<_>>();

    info!(
        "Evaluated {n_vectors} vectors: {} dead and {} dense features of {}",
        dead.len(),
        dense.len(),
        counts.len()
    );
    Ok(FeatureCounts {
        counts,
        n_vectors,
        dead,
        dense,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaeConfig, StorageDType, TokenSelection};
    use crate::shard::{DataLoadConfig, LayerSelection, ShardMetadata, ShardWriter};
    use candle_core::{Device, Tensor};

    #[test]
    fn test_counts_sum_over_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ShardWriter::create(dir.path(), ShardMetadata::new(4, 1, 2, 8, StorageDType::F32)).unwrap();
        let data: Vec<f32> = (0..20 * 2 * 4).map(|i| ((i * 11 % 7) as f32) - 3.0).collect();
        writer
            .append(&Tensor::from_vec(data, (20, 2, 4), &Device::Cpu).unwrap())
            .unwrap();
        writer.finish().unwrap();

        let mut dataset = ShardedDataset::open(
            dir.path(),
            DataLoadConfig {
                layer: LayerSelection::Last,
                tokens: TokenSelection::AllTokens,
            },
            &Device::Cpu,
        )
        .unwrap();
        let cfg = SaeConfig {
            d_in: 4,
            expansion_factor: 4,
            ..Default::default()
        };
        let sae = SparseAutoencoder::new(&cfg, &Device::Cpu).unwrap();

        let counts = evaluate_feature_counts(&sae, &mut dataset, 6).unwrap();
        assert_eq!(counts.n_vectors, 40);
        assert_eq!(counts.counts.len(), 16);
        assert!(counts.counts.iter().all(|&c| c <= 40));
        for &i in &counts.dead {
            assert_eq!(counts.counts[i as usize], 0);
        }
        // with 40 vectors the dense cutoff is 0.4: every live feature is dense
        assert_eq!(counts.dead.len() + counts.dense.len(), 16);
    }
}
