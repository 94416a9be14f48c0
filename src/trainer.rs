//! SAE training loop
//!
//! One [`SaeTrainer::train_step`] does, in order:
//!
//! 1. renormalise decoder rows
//! 2. resampling check; a resample starts an LR dip
//! 3. close the sampling window if due (log sparsity, reset counters)
//! 4. set the learning rate: advance the dip if one is active, otherwise
//!    step the base schedule
//! 5. pull a batch and run the SAE with ghost gradients for dead features
//! 6. update feature statistics and emit metrics
//! 7. backward, project decoder gradients, Adam step
//! 8. checkpoint if the token count passed the next threshold
//!
//! [`SaeTrainer::train`] repeats this until the token budget is consumed
//! and then always writes a `final` checkpoint.

use std::collections::VecDeque;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{save_checkpoint, CheckpointPaths};
use crate::config::SaeConfig;
use crate::health::{fired_counts, FeatureHealthTracker};
use crate::metrics::{explained_variance, fraction_below, l0, MetricValue, Metrics, MetricsSink};
use crate::optim::{Adam, LrDip, LrScheduler};
use crate::resampling::{ResampleOutcome, ResamplingPolicy};
use crate::sae::SparseAutoencoder;
use crate::store::BatchSource;

/// Mutable state of a run, written into every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub steps: u64,
    pub tokens: u64,
    pub current_lr: f64,
    /// Active post-resample LR dip
    pub lr_dip: Option<LrDip>,
    /// Features reinitialised over the whole run
    pub n_resampled_neurons: usize,
    pub n_resample_events: usize,
}

/// Where the run is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Warmup,
    Steady,
    /// Learning rate climbing back after a resample
    ResampleLrDip { remaining: u64 },
    Done,
}

/// Losses and side effects of one step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub mse_loss: f64,
    pub l1_loss: f64,
    pub ghost_grad_loss: f64,
    pub n_tokens: usize,
    pub resample: ResampleOutcome,
    pub checkpoint: Option<CheckpointPaths>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub state: RunState,
    /// Intermediate checkpoints in the order written
    pub checkpoints: Vec<CheckpointPaths>,
    pub final_checkpoint: CheckpointPaths,
}

pub struct SaeTrainer<M: MetricsSink> {
    config: SaeConfig,
    sae: SparseAutoencoder,
    optimizer: Adam,
    scheduler: LrScheduler,
    tracker: FeatureHealthTracker,
    policy: ResamplingPolicy,
    sink: M,
    state: RunState,
    checkpoint_thresholds: VecDeque<u64>,
    checkpoints: Vec<CheckpointPaths>,
    /// Log sparsity at the last window close
    last_log_sparsity: Option<Vec<f64>>,
}

impl<M: MetricsSink> SaeTrainer<M> {
    /// Fresh SAE and optimizer for `config`
    pub fn new(config: SaeConfig, sink: M) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let sae = SparseAutoencoder::new(&config, &device)?;
        Self::with_sae(config, sae, sink)
    }

    /// Train an existing SAE
    pub fn with_sae(config: SaeConfig, sae: SparseAutoencoder, sink: M) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            sae.d_in() == config.d_in && sae.d_sae() == config.d_sae(),
            "SAE shape ({}, {}) does not match config ({}, {})",
            sae.d_in(),
            sae.d_sae(),
            config.d_in,
            config.d_sae()
        );
        let scheduler = LrScheduler::new(
            config.lr_scheduler,
            config.lr,
            config.lr_warm_up_steps,
            config.total_training_steps(),
            config.lr / 10.0,
        );
        let optimizer = Adam::new(scheduler.lr());
        let state = RunState {
            current_lr: scheduler.lr(),
            ..Default::default()
        };

        info!(
            "SAE {}: d_in={} d_sae={} steps={} tokens={}",
            sae.name(),
            sae.d_in(),
            sae.d_sae(),
            config.total_training_steps(),
            config.total_training_tokens
        );

        Ok(Self {
            tracker: FeatureHealthTracker::new(config.d_sae()),
            policy: ResamplingPolicy::from_config(&config),
            checkpoint_thresholds: config.checkpoint_thresholds().into(),
            config,
            sae,
            optimizer,
            scheduler,
            sink,
            state,
            checkpoints: Vec::new(),
            last_log_sparsity: None,
        })
    }

    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    pub fn sae(&self) -> &SparseAutoencoder {
        &self.sae
    }

    pub fn into_sae(self) -> SparseAutoencoder {
        self.sae
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn tracker(&self) -> &FeatureHealthTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &M {
        &self.sink
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn phase(&self) -> TrainingPhase {
        if self.state.tokens >= self.config.total_training_tokens {
            TrainingPhase::Done
        } else if let Some(dip) = &self.state.lr_dip {
            TrainingPhase::ResampleLrDip {
                remaining: dip.remaining(),
            }
        } else if self.scheduler.in_warmup() {
            TrainingPhase::Warmup
        } else {
            TrainingPhase::Steady
        }
    }

    /// Run until the token budget is consumed, then write the final checkpoint
    pub fn train<B: BatchSource>(&mut self, store: &mut B) -> Result<TrainingSummary> {
        let init = store.buffered()?;
        self.sae.initialize_b_dec(self.config.b_dec_init, &init)?;

        while self.state.tokens < self.config.total_training_tokens {
            let out = self.train_step(store)?;
            debug!(
                "step {} | mse {:.4} | l1 {:.4} | ghost {:.4}",
                self.state.steps, out.mse_loss, out.l1_loss, out.ghost_grad_loss
            );
        }

        let final_checkpoint = save_checkpoint(
            &self.config.checkpoint_path,
            "final",
            &self.sae,
            &self.config,
            &self.state,
            &self.checkpoint_sparsity(),
        )?;
        info!(
            "Training done: {} steps, {} tokens, {} features resampled in {} events",
            self.state.steps,
            self.state.tokens,
            self.state.n_resampled_neurons,
            self.state.n_resample_events
        );

        Ok(TrainingSummary {
            state: self.state.clone(),
            checkpoints: self.checkpoints.clone(),
            final_checkpoint,
        })
    }

    /// One optimizer step with all housekeeping
    pub fn train_step<B: BatchSource>(&mut self, store: &mut B) -> Result<StepOutput> {
        let step = self.state.steps;
        self.sae.set_decoder_norm_to_unit_norm()?;

        let resample =
            self.policy
                .maybe_resample(step, &self.sae, &mut self.optimizer, &self.tracker, store)?;
        if let ResampleOutcome::Resampled { n_resampled, .. } = resample {
            self.state.n_resampled_neurons += n_resampled;
            self.state.n_resample_events += 1;
            self.start_lr_dip();
            let mut metrics = Metrics::new();
            metrics.insert(
                "metrics/n_resampled_neurons".into(),
                MetricValue::Scalar(n_resampled as f64),
            );
            self.sink.log(step, &metrics);
        }

        if (step + 1) % self.config.feature_sampling_window == 0 {
            self.close_sampling_window(step);
        }

        let lr = self.update_learning_rate();
        self.optimizer.set_learning_rate(lr);
        self.state.current_lr = lr;

        let ghost = self.tracker.dead_indices(self.config.dead_feature_window);
        let batch = store.next_batch()?;
        let n_tokens = batch.dim(0)?;
        let out = self.sae.forward(&batch, Some(&ghost))?;

        let counts = fired_counts(&out.feature_acts)?;
        self.tracker.record(&counts, n_tokens)?;
        self.state.tokens += n_tokens as u64;

        let output = StepOutput {
            loss: f64::from(out.loss.to_scalar::<f32>()?),
            mse_loss: f64::from(out.mse_loss.to_scalar::<f32>()?),
            l1_loss: f64::from(out.l1_loss.to_scalar::<f32>()?),
            ghost_grad_loss: f64::from(out.ghost_grad_loss.to_scalar::<f32>()?),
            n_tokens,
            resample,
            checkpoint: None,
        };

        if (step + 1) % self.config.log_frequency == 0 {
            let metrics = self.step_metrics(&output, &batch, &out.sae_out, &out.feature_acts, ghost.len())?;
            self.sink.log(step, &metrics);
        }

        let mut grads = out.loss.backward()?;
        self.sae.remove_gradient_parallel_to_decoder_directions(&mut grads)?;
        self.optimizer.step(&self.sae.parameters(), &grads)?;

        let checkpoint = self.maybe_checkpoint()?;
        self.state.steps += 1;
        Ok(StepOutput { checkpoint, ..output })
    }

    /// Drop the learning rate and climb back to the schedule's current rate.
    ///
    /// A dip that is already running is replaced; its target is the same
    /// because the schedule is frozen while it runs.
    fn start_lr_dip(&mut self) {
        let dip = LrDip::new(self.scheduler.lr());
        info!(
            "Learning rate dropped to {:.3e}, returning to {:.3e} over the next steps",
            dip.start_lr(),
            dip.target()
        );
        self.optimizer.set_learning_rate(dip.start_lr());
        self.state.lr_dip = Some(dip);
    }

    /// Learning rate for this step. The base schedule only advances when no
    /// dip is active.
    fn update_learning_rate(&mut self) -> f64 {
        match self.state.lr_dip.as_mut() {
            Some(dip) => {
                let lr = dip.advance();
                if dip.is_finished() {
                    info!("Learning rate restored to {lr:.3e}");
                    self.state.lr_dip = None;
                }
                lr
            }
            None => {
                self.scheduler.step();
                self.scheduler.lr()
            }
        }
    }

    fn close_sampling_window(&mut self, step: u64) {
        let log_sparsity = self.tracker.log_sparsity();
        let mean = log_sparsity.iter().sum::<f64>() / log_sparsity.len().max(1) as f64;

        let mut metrics = Metrics::new();
        metrics.insert(
            "metrics/mean_log10_feature_sparsity".into(),
            MetricValue::Scalar(mean),
        );
        metrics.insert(
            "plots/feature_density_line_chart".into(),
            MetricValue::Histogram(log_sparsity.clone()),
        );
        self.sink.log(step, &metrics);

        self.last_log_sparsity = Some(log_sparsity);
        self.tracker.reset_window();
    }

    fn step_metrics(
        &self,
        output: &StepOutput,
        sae_in: &Tensor,
        sae_out: &Tensor,
        feature_acts: &Tensor,
        n_ghost: usize,
    ) -> Result<Metrics> {
        let (ev_mean, ev_std) = explained_variance(&sae_out.detach(), &sae_in.detach())?;
        let sparsity = self.tracker.sparsity_snapshot();
        let l1_coefficient = self.config.l1_coefficient;

        let scalars = [
            ("losses/mse_loss", output.mse_loss),
            ("losses/l1_loss", output.l1_loss / l1_coefficient),
            ("losses/ghost_grad_loss", output.ghost_grad_loss),
            ("losses/overall_loss", output.loss),
            ("metrics/explained_variance", ev_mean),
            ("metrics/explained_variance_std", ev_std),
            ("metrics/l0", l0(&feature_acts.detach())?),
            ("sparsity/mean_passes_since_fired", self.tracker.mean_steps_since_fired()),
            ("sparsity/n_passes_since_fired_over_threshold", n_ghost as f64),
            ("sparsity/below_1e-5", fraction_below(&sparsity, 1e-5)),
            ("sparsity/below_1e-6", fraction_below(&sparsity, 1e-6)),
            (
                "sparsity/dead_features",
                fraction_below(&sparsity, self.config.dead_feature_threshold),
            ),
            ("details/n_training_tokens", self.state.tokens as f64),
            ("details/current_learning_rate", self.state.current_lr),
        ];
        Ok(scalars
            .into_iter()
            .map(|(k, v)| (k.to_string(), MetricValue::Scalar(v)))
            .collect())
    }

    fn maybe_checkpoint(&mut self) -> Result<Option<CheckpointPaths>> {
        let Some(&threshold) = self.checkpoint_thresholds.front() else {
            return Ok(None);
        };
        if self.state.tokens <= threshold {
            return Ok(None);
        }
        let paths = save_checkpoint(
            &self.config.checkpoint_path,
            &self.state.tokens.to_string(),
            &self.sae,
            &self.config,
            &self.state,
            &self.checkpoint_sparsity(),
        )?;
        self.checkpoint_thresholds.pop_front();
        self.checkpoints.push(paths.clone());
        Ok(Some(paths))
    }

    fn checkpoint_sparsity(&self) -> Vec<f64> {
        self.last_log_sparsity
            .clone()
            .unwrap_or_else(|| self.tracker.log_sparsity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeadFeatureEstimation, FeatureSamplingMethod, LrSchedulerKind};
    use crate::metrics::RecordingSink;
    use crate::optim::LR_DIP_STEPS;
    use candle_core::Device;

    /// Cycles through a fixed set of batches
    struct CyclingBatches {
        batches: Vec<Tensor>,
        next: usize,
    }

    impl CyclingBatches {
        fn new(n_batches: usize, batch: usize, d: usize) -> Self {
            let batches = (0..n_batches)
                .map(|b| {
                    let data: Vec<f32> = (0..batch * d)
                        .map(|i| (((i + b * 13) * 31 % 17) as f32 - 8.0) * 0.25)
                        .collect();
                    Tensor::from_vec(data, (batch, d), &Device::Cpu).unwrap()
                })
                .collect();
            Self { batches, next: 0 }
        }
    }

    impl BatchSource for CyclingBatches {
        fn next_batch(&mut self) -> Result<Tensor> {
            let batch = self.batches[self.next % self.batches.len()].clone();
            self.next += 1;
            Ok(batch)
        }

        fn buffered(&mut self) -> Result<Tensor> {
            Ok(Tensor::cat(&self.batches, 0)?)
        }
    }

    fn config(dir: &std::path::Path) -> SaeConfig {
        SaeConfig {
            hook_point: "blocks.0.hook_resid_post".into(),
            d_in: 4,
            expansion_factor: 2,
            train_batch_size: 8,
            total_training_tokens: 8 * 25,
            lr: 1e-3,
            lr_scheduler: LrSchedulerKind::Constant,
            feature_sampling_window: 5,
            dead_feature_window: 10,
            feature_sampling_method: FeatureSamplingMethod::Disabled,
            resample_batches: 2,
            log_frequency: 5,
            n_checkpoints: 0,
            checkpoint_path: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_train_runs_to_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = SaeTrainer::new(config(dir.path()), RecordingSink::default()).unwrap();
        let mut store = CyclingBatches::new(3, 8, 4);
        let summary = trainer.train(&mut store).unwrap();

        assert_eq!(summary.state.steps, 25);
        assert_eq!(summary.state.tokens, 200);
        assert_eq!(trainer.phase(), TrainingPhase::Done);
        assert!(summary.final_checkpoint.weights.exists());
        assert!(summary.checkpoints.is_empty());

        // losses logged every 5 steps, window histograms every 5 steps
        let mse = trainer.sink().scalars("losses/mse_loss");
        assert_eq!(mse.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![4, 9, 14, 19, 24]);
        assert!(mse.iter().all(|(_, v)| v.is_finite()));
        assert_eq!(trainer.sink().scalars("metrics/mean_log10_feature_sparsity").len(), 5);
    }

    #[test]
    fn test_with_sae_rejects_zero_windows() {
        let dir = tempfile::tempdir().unwrap();
        for cfg in [
            SaeConfig {
                feature_sampling_window: 0,
                ..config(dir.path())
            },
            SaeConfig {
                dead_feature_window: 0,
                ..config(dir.path())
            },
            SaeConfig {
                log_frequency: 0,
                ..config(dir.path())
            },
        ] {
            let sae = SparseAutoencoder::new(&cfg, &Device::Cpu).unwrap();
            assert!(SaeTrainer::with_sae(cfg, sae, RecordingSink::default()).is_err());
        }
    }

    #[test]
    fn test_done_after_resample_on_last_step() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SaeConfig {
            feature_sampling_method: FeatureSamplingMethod::Anthropic,
            dead_feature_estimation: DeadFeatureEstimation::Frequency,
            dead_feature_threshold: 1.1,
            dead_feature_window: 25,
            ..config(dir.path())
        };
        let mut trainer = SaeTrainer::new(cfg, RecordingSink::default()).unwrap();
        let summary = trainer.train(&mut CyclingBatches::new(3, 8, 4)).unwrap();

        assert_eq!(summary.state.n_resample_events, 1);
        assert!(summary.state.lr_dip.is_some());
        assert_eq!(trainer.phase(), TrainingPhase::Done);
    }

    #[test]
    fn test_decoder_renormalised_before_forward() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut trainer = SaeTrainer::new(cfg.clone(), RecordingSink::default()).unwrap();

        // push every decoder row off the unit sphere
        let (_, w_dec) = trainer.sae().parameters()[2];
        w_dec.set(&(w_dec.as_tensor() * 3.0).unwrap()).unwrap();
        let snapshot = trainer.sae().tensors();

        let mut store = CyclingBatches::new(3, 8, 4);
        let first = store.batches[0].clone();
        let mse = |sae: &SparseAutoencoder| -> f64 {
            let out = sae.forward(&first, None).unwrap();
            f64::from(out.mse_loss.to_scalar::<f32>().unwrap())
        };
        let stale = SparseAutoencoder::from_tensors(&cfg, &snapshot, &Device::Cpu).unwrap();
        let unit = SparseAutoencoder::from_tensors(&cfg, &snapshot, &Device::Cpu).unwrap();
        unit.set_decoder_norm_to_unit_norm().unwrap();
        let (stale_mse, unit_mse) = (mse(&stale), mse(&unit));
        assert!((stale_mse - unit_mse).abs() > 1e-3);

        let out = trainer.train_step(&mut store).unwrap();
        assert!(
            (out.mse_loss - unit_mse).abs() <= 1e-5 * unit_mse.max(1.0),
            "forward saw mse {} but unit-norm decoder gives {unit_mse}",
            out.mse_loss
        );
    }

    #[test]
    fn test_checkpoints_at_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SaeConfig {
            n_checkpoints: 4,
            ..config(dir.path())
        };
        // thresholds 50, 100, 150
        let mut trainer = SaeTrainer::new(cfg, RecordingSink::default()).unwrap();
        let mut store = CyclingBatches::new(3, 8, 4);
        let summary = trainer.train(&mut store).unwrap();

        let labels: Vec<String> = summary
            .checkpoints
            .iter()
            .map(|p| p.weights.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            labels,
            vec![
                "56_sae_blocks.0.hook_resid_post_8.safetensors",
                "104_sae_blocks.0.hook_resid_post_8.safetensors",
                "152_sae_blocks.0.hook_resid_post_8.safetensors",
            ]
        );
        for paths in &summary.checkpoints {
            assert!(paths.config.exists());
            assert!(paths.log_sparsity.exists());
        }
    }

    #[test]
    fn test_resample_starts_lr_dip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SaeConfig {
            feature_sampling_method: FeatureSamplingMethod::Anthropic,
            dead_feature_estimation: DeadFeatureEstimation::Frequency,
            // every feature counts as dead
            dead_feature_threshold: 1.1,
            feature_sampling_window: 100,
            ..config(dir.path())
        };
        let mut trainer = SaeTrainer::new(cfg, RecordingSink::default()).unwrap();
        let mut store = CyclingBatches::new(3, 8, 4);

        for _ in 0..9 {
            let out = trainer.train_step(&mut store).unwrap();
            assert_eq!(out.resample, ResampleOutcome::NotScheduled);
        }
        assert_eq!(trainer.phase(), TrainingPhase::Steady);
        let schedule_step = trainer.scheduler().current_step();

        let out = trainer.train_step(&mut store).unwrap();
        assert!(matches!(out.resample, ResampleOutcome::Resampled { n_dead: 8, .. }));
        assert_eq!(trainer.state().n_resample_events, 1);
        assert_eq!(
            trainer.phase(),
            TrainingPhase::ResampleLrDip {
                remaining: LR_DIP_STEPS - 1
            }
        );
        let lr = trainer.state().current_lr;
        assert!(lr < 1e-3 / 1000.0);

        trainer.train_step(&mut store).unwrap();
        assert!(trainer.state().current_lr > lr);
        assert_eq!(trainer.scheduler().current_step(), schedule_step);
    }

    #[test]
    fn test_lr_dip_restores_and_resumes_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SaeConfig {
            lr_scheduler: LrSchedulerKind::ConstantWithWarmup,
            lr_warm_up_steps: 1000,
            ..config(dir.path())
        };
        let mut trainer = SaeTrainer::new(cfg, RecordingSink::default()).unwrap();
        for _ in 0..10 {
            trainer.update_learning_rate();
        }
        let target = trainer.scheduler().lr();
        let frozen_at = trainer.scheduler().current_step();

        trainer.start_lr_dip();
        let mut previous = 0.0;
        for _ in 0..LR_DIP_STEPS {
            let lr = trainer.update_learning_rate();
            assert!(lr > previous);
            previous = lr;
        }
        assert_eq!(previous, target);
        assert!(trainer.state().lr_dip.is_none());
        assert_eq!(trainer.scheduler().current_step(), frozen_at);

        trainer.update_learning_rate();
        assert_eq!(trainer.scheduler().current_step(), frozen_at + 1);
        assert_eq!(trainer.phase(), TrainingPhase::Warmup);
    }
}
