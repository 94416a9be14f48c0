// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, w, t standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`w_dec`
#![allow(clippy::module_name_repetitions)] // SaeConfig in config.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f32→u64 when value is known positive

//! SAE-rs: sparse autoencoders on transformer activations
//!
//! Trains sparse autoencoders on intermediate activations of a frozen
//! vision or language transformer, with dead-feature tracking, resampling
//! and ghost gradients.
//!
//! ## Architecture
//!
//! - `hooks`: Named hook locations in a forward pass
//! - `cache`: ActivationCache for storing hooked activations
//! - `source`: Input streams and the frozen-model interface
//! - `store`: Shuffled activation buffer with transparent refill
//! - `shard`: On-disk activation shards with random access by index
//! - `sae`: The sparse autoencoder, its losses and weight surgery
//! - `health`: Per-feature firing statistics
//! - `resampling`: Dead-feature detection and resampling
//! - `optim`: Adam, learning-rate schedules and the post-resample LR dip
//! - `trainer`: Training loop state machine
//! - `checkpoint`: Checkpoint files
//! - `metrics`: Metric computation and sinks
//! - `evaluate`: Feature-firing counts over a dataset
//! - `config`: Run configuration

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod evaluate;
pub mod health;
pub mod hooks;
pub mod metrics;
pub mod optim;
pub mod resampling;
pub mod sae;
pub mod shard;
pub mod source;
pub mod store;
pub mod trainer;

pub use cache::ActivationCache;
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMeta, CheckpointPaths};
pub use config::{
    BDecInit, DeadFeatureEstimation, FeatureSamplingMethod, LrSchedulerKind, SaeConfig,
    StorageDType, TokenSelection,
};
pub use evaluate::{evaluate_feature_counts, FeatureCounts};
pub use health::FeatureHealthTracker;
pub use hooks::HookPoint;
pub use metrics::{MetricValue, Metrics, MetricsSink, RecordingSink, TracingSink};
pub use optim::{Adam, LrDip, LrScheduler, LR_DIP_STEPS};
pub use resampling::{ResampleOutcome, ResamplingPolicy};
pub use sae::{ResampleRows, SaeOutput, SparseAutoencoder};
pub use shard::{DataLoadConfig, LayerSelection, ShardMetadata, ShardWriter, ShardedDataset};
pub use source::{ActivationSource, InputStream, Record, VecInputStream};
pub use store::{
    cache_activations, ActivationBuffer, ActivationProvider, BatchSource, CachedActivations,
    ModelActivations, RefillStatus,
};
pub use trainer::{RunState, SaeTrainer, StepOutput, TrainingPhase, TrainingSummary};
