//! Integration tests for SAE-rs
//!
//! Everything runs on CPU against synthetic activations; no model download
//! is needed.

use std::cell::Cell;
use std::io::Write;

use anyhow::Result;
use candle_core::{Device, Tensor};
use sae_rs::shard::shard_path;
use sae_rs::{
    cache_activations, load_checkpoint, ActivationBuffer, ActivationCache, ActivationSource,
    CachedActivations, DataLoadConfig, DeadFeatureEstimation, FeatureSamplingMethod, HookPoint,
    LayerSelection, ModelActivations, RecordingSink, SaeConfig, SaeTrainer, ShardMetadata,
    ShardWriter, ShardedDataset, StorageDType, TokenSelection, TrainingPhase, VecInputStream,
};
use tempfile::{tempdir, NamedTempFile};

/// Stand-in for a frozen transformer: every hook sees the input scaled by
/// `layer + 1`.
struct ScalingModel {
    d_model: usize,
    calls: Cell<usize>,
}

impl ScalingModel {
    fn new(d_model: usize) -> Self {
        Self {
            d_model,
            calls: Cell::new(0),
        }
    }
}

impl ActivationSource for ScalingModel {
    fn d_model(&self) -> usize {
        self.d_model
    }

    fn run_with_cache(&self, inputs: &Tensor, hooks: &[HookPoint]) -> Result<ActivationCache> {
        self.calls.set(self.calls.get() + 1);
        let mut cache = ActivationCache::with_capacity(hooks.len());
        for hook in hooks {
            let scale = (hook.layer().unwrap_or(0) + 1) as f64;
            cache.insert(hook.clone(), (inputs * scale)?);
        }
        Ok(cache)
    }
}

fn synthetic_records(n: usize, d: usize) -> Tensor {
    let data: Vec<f32> = (0..n * d)
        .map(|i| (i.wrapping_mul(2_654_435_761) % 1000) as f32 / 250.0 - 2.0)
        .collect();
    Tensor::from_vec(data, (n, d), &Device::Cpu).unwrap()
}

fn image_stream(n: usize, n_tokens: usize, d: usize) -> VecInputStream {
    let images = synthetic_records(n * n_tokens, d)
        .reshape((n, n_tokens, d))
        .unwrap();
    let tensors = (0..n).map(|i| images.get(i).unwrap()).collect();
    VecInputStream::from_tensors("image", tensors)
}

/// 64 records of width 8 in shards of 16: round trip, range check and a
/// write past the end that opens a fifth shard
#[test]
fn test_shard_end_to_end() {
    let dir = tempdir().unwrap();
    let records = synthetic_records(64, 8);

    let meta = ShardMetadata::new(8, 1, 1, 16, StorageDType::F32);
    let mut writer = ShardWriter::create(dir.path(), meta).unwrap();
    let range = writer.write(0, &records).unwrap();
    assert_eq!(range, 0..64);
    writer.flush().unwrap();
    for shard in 0..4 {
        assert!(shard_path(dir.path(), shard).exists());
    }
    assert!(!shard_path(dir.path(), 4).exists());

    let selection = DataLoadConfig {
        layer: LayerSelection::Last,
        tokens: TokenSelection::ClassToken,
    };
    let mut dataset = ShardedDataset::open(dir.path(), selection, &Device::Cpu).unwrap();
    assert_eq!(dataset.len(), 64);

    let got: Vec<f32> = dataset.get(5).unwrap().to_vec1().unwrap();
    let want: Vec<f32> = records.get(5).unwrap().to_vec1().unwrap();
    assert_eq!(got, want);
    assert!(dataset.get(70).is_err());

    // unsorted, cross-shard, repeated
    let many: Vec<Vec<f32>> = dataset.get_many(&[63, 5, 17, 5]).unwrap().to_vec2().unwrap();
    assert_eq!(many[0], records.get(63).unwrap().to_vec1::<f32>().unwrap());
    assert_eq!(many[2], records.get(17).unwrap().to_vec1::<f32>().unwrap());
    assert_eq!(many[1], many[3]);

    // index 64 belongs to a new shard
    let extra = synthetic_records(1, 8);
    writer.write(64, &extra).unwrap();
    let meta = writer.finish().unwrap();
    assert_eq!(meta.n_records, 65);
    assert!(shard_path(dir.path(), 4).exists());

    let mut reopened = ShardedDataset::open(dir.path(), selection, &Device::Cpu).unwrap();
    let got: Vec<f32> = reopened.get(64).unwrap().to_vec1().unwrap();
    assert_eq!(got, extra.get(0).unwrap().to_vec1::<f32>().unwrap());
}

/// A missing data key fails before the model runs
#[test]
fn test_missing_data_key_fails_fast() {
    let model = ScalingModel::new(8);
    let config = SaeConfig {
        d_in: 8,
        data_key: "pixel_values".into(),
        ..Default::default()
    };
    let result = ModelActivations::new(&model, image_stream(4, 2, 8), &config);
    let err = result.err().unwrap().to_string();
    assert!(err.contains("pixel_values"), "unexpected error: {err}");
    assert_eq!(model.calls.get(), 0);
}

/// Cache activations for two hooks, then train on one of them from shards
#[test]
fn test_cache_then_train_with_resampling() {
    let shards = tempdir().unwrap();
    let checkpoints = tempdir().unwrap();
    let (d, n_tokens, n_inputs) = (8, 4, 32);

    let config = SaeConfig {
        hook_point: "blocks.1.hook_resid_post".into(),
        d_in: d,
        expansion_factor: 2,
        token_selection: TokenSelection::AllTokens,
        store_size: 16,
        train_batch_size: 16,
        total_training_tokens: 16 * 40,
        lr: 1e-3,
        feature_sampling_method: FeatureSamplingMethod::Anthropic,
        dead_feature_estimation: DeadFeatureEstimation::Frequency,
        // every feature counts as dead, so each window end resamples
        dead_feature_threshold: 1.1,
        dead_feature_window: 15,
        feature_sampling_window: 10,
        resample_batches: 2,
        n_checkpoints: 2,
        log_frequency: 10,
        shard_capacity: 10,
        max_batch_size_for_forward: 5,
        checkpoint_path: checkpoints.path().to_path_buf(),
        ..Default::default()
    };

    let model = ScalingModel::new(d);
    let hooks = [HookPoint::ResidPost(0), HookPoint::ResidPost(1)];
    let meta = ShardMetadata::from_config(&config, hooks.len(), n_tokens);
    let mut writer = ShardWriter::create(shards.path(), meta).unwrap();
    let mut inputs = image_stream(n_inputs, n_tokens, d);
    let written = cache_activations(
        &model,
        &mut inputs,
        &config.data_key,
        &hooks,
        &mut writer,
        n_inputs,
        config.max_batch_size_for_forward,
    )
    .unwrap();
    assert_eq!(written, n_inputs);
    assert_eq!(model.calls.get(), 7);
    let meta = writer.finish().unwrap();
    // 32 records in shards of 10
    assert_eq!(meta.n_shards(), 4);
    assert!(shard_path(shards.path(), 3).exists());

    let selection = DataLoadConfig {
        layer: LayerSelection::Layer(1),
        tokens: config.token_selection,
    };
    let dataset = ShardedDataset::open(shards.path(), selection, &Device::Cpu).unwrap();
    let provider = CachedActivations::new(dataset, config.store_size).unwrap();
    let mut store = ActivationBuffer::from_config(provider, &config).unwrap();

    let mut trainer = SaeTrainer::new(config, RecordingSink::default()).unwrap();
    let summary = trainer.train(&mut store).unwrap();

    assert_eq!(summary.state.steps, 40);
    assert_eq!(summary.state.tokens, 640);
    assert_eq!(summary.state.n_resample_events, 2);
    assert!(summary.state.lr_dip.is_some());
    assert_eq!(trainer.phase(), TrainingPhase::Done);
    assert_eq!(summary.checkpoints.len(), 1);
    assert!(summary.checkpoints[0]
        .weights
        .to_string_lossy()
        .contains("336_sae_blocks.1.hook_resid_post_16"));
    assert!(store.n_epochs() > 0);

    let (loaded, meta) = load_checkpoint(&summary.final_checkpoint.weights, &Device::Cpu).unwrap();
    assert_eq!(meta.run_state.steps, summary.state.steps);
    assert_eq!(meta.run_state.n_resample_events, 2);
    let trained: Vec<Vec<f32>> = trainer.sae().w_dec().to_vec2().unwrap();
    let restored: Vec<Vec<f32>> = loaded.w_dec().to_vec2().unwrap();
    assert_eq!(trained, restored);

    let resampled = trainer.sink().scalars("metrics/n_resampled_neurons");
    assert_eq!(resampled.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![14, 29]);
}

/// Config JSON with partial fields and string enums
#[test]
fn test_config_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "hook_point": "blocks.3.hook_mlp_out",
        "d_in": 16,
        "expansion_factor": 4,
        "feature_sampling_method": "anthropic",
        "dead_feature_estimation": "no_fire",
        "b_dec_init": "mean"
    }}"#
    )
    .unwrap();

    let config = SaeConfig::load(file.path()).unwrap();
    assert_eq!(config.d_sae(), 64);
    assert_eq!(config.hook(), HookPoint::MlpOut(3));
    assert_eq!(config.train_batch_size, SaeConfig::default().train_batch_size);

    let mut bad = NamedTempFile::new().unwrap();
    writeln!(bad, r#"{{ "feature_sampling_method": "run_length" }}"#).unwrap();
    assert!(SaeConfig::load(bad.path()).is_err());
}
