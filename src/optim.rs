//! Adam optimizer, learning-rate schedules and the post-resample LR dip

use std::collections::HashMap;
use std::f64::consts::PI;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::LrSchedulerKind;

/// Steps over which the learning rate climbs back after a resample
pub const LR_DIP_STEPS: u64 = 10_000;
/// Factor the learning rate is divided by when a dip starts
pub const LR_DIP_FACTOR: f64 = 10_000.0;

struct Moments {
    m: Tensor,
    v: Tensor,
}

/// Adam with per-parameter moment state keyed by name.
///
/// Moments are exposed by name so resampling can zero the rows it rewrote.
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    state: HashMap<String, Moments>,
    /// Step counter for bias correction
    t: u64,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_params(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_params(lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            state: HashMap::new(),
            t: 0,
        }
    }

    /// Apply one update to every parameter that has a gradient
    pub fn step(&mut self, params: &[(&str, &Var)], grads: &GradStore) -> Result<()> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for &(name, var) in params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            if !self.state.contains_key(name) {
                self.state.insert(
                    name.to_string(),
                    Moments {
                        m: grad.zeros_like()?,
                        v: grad.zeros_like()?,
                    },
                );
            }
            let moments = self
                .state
                .get_mut(name)
                .ok_or_else(|| anyhow::anyhow!("No optimizer state for {name}"))?;

            // m = b1 * m + (1 - b1) * g
            let m = ((&moments.m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            // v = b2 * v + (1 - b2) * g^2
            let v = ((&moments.v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let update = ((m_hat / (v_hat.sqrt()? + self.eps)?)? * self.learning_rate)?;
            var.set(&(var.as_tensor() - update)?)?;

            moments.m = m;
            moments.v = v;
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    /// Number of updates applied so far
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// First and second moments of a parameter, if it has been stepped
    pub fn moments(&self, name: &str) -> Option<(&Tensor, &Tensor)> {
        self.state.get(name).map(|s| (&s.m, &s.v))
    }

    /// Zero both moments of `name` at `indices` along `dim`.
    ///
    /// A parameter that has never been stepped has nothing to zero.
    pub fn zero_moments(&mut self, name: &str, dim: usize, indices: &[u32]) -> Result<()> {
        let Some(moments) = self.state.get_mut(name) else {
            return Ok(());
        };
        let size = moments.m.dim(dim)?;
        let mut keep = vec![1f32; size];
        for &i in indices {
            let slot = keep
                .get_mut(i as usize)
                .ok_or_else(|| anyhow::anyhow!("Index {i} out of range for {name} dim {dim}"))?;
            *slot = 0.0;
        }
        let mut shape = vec![1usize; moments.m.rank()];
        shape[dim] = size;
        let mask = Tensor::from_vec(keep, shape, moments.m.device())?.to_dtype(moments.m.dtype())?;

        moments.m = moments.m.broadcast_mul(&mask)?;
        moments.v = moments.v.broadcast_mul(&mask)?;
        Ok(())
    }
}

/// Base learning-rate schedule over a fixed number of steps
#[derive(Debug, Clone)]
pub struct LrScheduler {
    kind: LrSchedulerKind,
    base_lr: f64,
    lr_end: f64,
    warm_up_steps: u64,
    training_steps: u64,
    current_step: u64,
}

impl LrScheduler {
    /// `lr_end` is where the decaying schedules finish
    pub fn new(
        kind: LrSchedulerKind,
        base_lr: f64,
        warm_up_steps: u64,
        training_steps: u64,
        lr_end: f64,
    ) -> Self {
        Self {
            kind,
            base_lr,
            lr_end,
            warm_up_steps,
            training_steps,
            current_step: 0,
        }
    }

    /// Advance one step
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Whether the schedule is still in linear warmup
    pub fn in_warmup(&self) -> bool {
        match self.kind {
            LrSchedulerKind::ConstantWithWarmup
            | LrSchedulerKind::LinearWarmupDecay
            | LrSchedulerKind::CosineAnnealingWarmup => self.current_step + 1 < self.warm_up_steps,
            LrSchedulerKind::Constant | LrSchedulerKind::CosineAnnealing => false,
        }
    }

    /// Learning rate at the current step
    pub fn lr(&self) -> f64 {
        let step = self.current_step;
        match self.kind {
            LrSchedulerKind::Constant => self.base_lr,
            LrSchedulerKind::ConstantWithWarmup => self.base_lr * self.warmup_factor(step),
            LrSchedulerKind::LinearWarmupDecay => {
                if step < self.warm_up_steps {
                    return self.base_lr * self.warmup_factor(step);
                }
                let span = self.training_steps.saturating_sub(self.warm_up_steps).max(1);
                let progress = ((step - self.warm_up_steps) as f64 / span as f64).min(1.0);
                self.base_lr + (self.lr_end - self.base_lr) * progress
            }
            LrSchedulerKind::CosineAnnealing => self.cosine(step, self.training_steps),
            LrSchedulerKind::CosineAnnealingWarmup => {
                if step < self.warm_up_steps {
                    return self.base_lr * self.warmup_factor(step);
                }
                let span = self.training_steps.saturating_sub(self.warm_up_steps);
                self.cosine(step - self.warm_up_steps, span)
            }
        }
    }

    fn warmup_factor(&self, step: u64) -> f64 {
        if self.warm_up_steps == 0 {
            return 1.0;
        }
        ((step + 1) as f64 / self.warm_up_steps as f64).min(1.0)
    }

    fn cosine(&self, step: u64, span: u64) -> f64 {
        let span = span.max(1);
        let progress = (step.min(span)) as f64 / span as f64;
        self.lr_end + (self.base_lr - self.lr_end) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

/// Temporary learning-rate reduction after a resample.
///
/// Starts at `target / LR_DIP_FACTOR` and climbs by a fixed increment each
/// step; the last of the `LR_DIP_STEPS` steps lands exactly on `target`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrDip {
    target: f64,
    reduced: f64,
    increment: f64,
    steps_taken: u64,
}

impl LrDip {
    pub fn new(target: f64) -> Self {
        let reduced = target / LR_DIP_FACTOR;
        Self {
            target,
            reduced,
            increment: (target - reduced) / LR_DIP_STEPS as f64,
            steps_taken: 0,
        }
    }

    /// Rate to use immediately after the resample
    pub fn start_lr(&self) -> f64 {
        self.reduced
    }

    /// Rate the dip climbs back to
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Current rate
    pub fn lr(&self) -> f64 {
        if self.is_finished() {
            self.target
        } else {
            self.reduced + self.steps_taken as f64 * self.increment
        }
    }

    /// Advance one step and return the new rate
    pub fn advance(&mut self) -> f64 {
        if !self.is_finished() {
            self.steps_taken += 1;
        }
        self.lr()
    }

    /// Steps left until the target is restored
    pub fn remaining(&self) -> u64 {
        LR_DIP_STEPS - self.steps_taken
    }

    pub fn is_finished(&self) -> bool {
        self.steps_taken >= LR_DIP_STEPS
    }
}
