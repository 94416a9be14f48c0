//! Sparse autoencoder with a unit-norm decoder and ghost-gradient loss
//!
//! ## Parameters
//!
//! | Name    | Shape           |
//! |---------|-----------------|
//! | `W_enc` | `[d_in, d_sae]` |
//! | `b_enc` | `[d_sae]`       |
//! | `W_dec` | `[d_sae, d_in]` |
//! | `b_dec` | `[d_in]`        |
//!
//! Every decoder row is kept at unit norm. The training loop renormalises
//! before each step and [`SparseAutoencoder::remove_gradient_parallel_to_decoder_directions`]
//! strips the radial part of the decoder gradient after each backward pass.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::init::DEFAULT_KAIMING_UNIFORM;
use tracing::debug;

use crate::config::{BDecInit, SaeConfig};

pub const W_ENC: &str = "W_enc";
pub const B_ENC: &str = "b_enc";
pub const W_DEC: &str = "W_dec";
pub const B_DEC: &str = "b_dec";

/// Weiszfeld iteration limits for the geometric-median initialisation
const GEOMETRIC_MEDIAN_MAX_ITER: usize = 100;
const GEOMETRIC_MEDIAN_TOL: f64 = 1e-5;

/// Result of one forward pass
pub struct SaeOutput {
    /// Reconstruction `(batch, d_in)`
    pub sae_out: Tensor,
    /// Post-ReLU feature activations `(batch, d_sae)`
    pub feature_acts: Tensor,
    /// Scalar total loss
    pub loss: Tensor,
    pub mse_loss: Tensor,
    pub l1_loss: Tensor,
    /// Zero when ghost gradients are off or no feature is dead
    pub ghost_grad_loss: Tensor,
}

/// Weights of a set of features, one row per feature.
///
/// `encoder_cols` holds the `W_enc` columns transposed, so every field is
/// indexed by position in `indices`.
#[derive(Debug, Clone)]
pub struct ResampleRows {
    pub indices: Vec<u32>,
    /// `[n, d_in]`
    pub decoder_rows: Tensor,
    /// `[n, d_in]`
    pub encoder_cols: Tensor,
    /// `[n]`
    pub encoder_bias: Tensor,
}

pub struct SparseAutoencoder {
    w_enc: Var,
    b_enc: Var,
    w_dec: Var,
    b_dec: Var,
    d_in: usize,
    d_sae: usize,
    l1_coefficient: f64,
    use_ghost_grads: bool,
    hook_point: String,
    device: Device,
}

impl SparseAutoencoder {
    /// Kaiming-uniform weights with unit-norm decoder rows and zero biases
    pub fn new(cfg: &SaeConfig, device: &Device) -> Result<Self> {
        let (d_in, d_sae) = (cfg.d_in, cfg.d_sae());
        let w_enc = DEFAULT_KAIMING_UNIFORM.var((d_in, d_sae), DType::F32, device)?;
        let w_dec = DEFAULT_KAIMING_UNIFORM.var((d_sae, d_in), DType::F32, device)?;
        let b_enc = Var::zeros(d_sae, DType::F32, device)?;
        let b_dec = Var::zeros(d_in, DType::F32, device)?;

        let sae = Self {
            w_enc,
            b_enc,
            w_dec,
            b_dec,
            d_in,
            d_sae,
            l1_coefficient: cfg.l1_coefficient,
            use_ghost_grads: cfg.use_ghost_grads,
            hook_point: cfg.hook_point.clone(),
            device: device.clone(),
        };
        sae.set_decoder_norm_to_unit_norm()?;
        Ok(sae)
    }

    /// Rebuild from named parameter tensors (as produced by [`tensors`](Self::tensors))
    pub fn from_tensors(
        cfg: &SaeConfig,
        tensors: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let (d_in, d_sae) = (cfg.d_in, cfg.d_sae());
        let load = |name: &str, shape: &[usize]| -> Result<Var> {
            let t = tensors
                .get(name)
                .with_context(|| format!("Missing SAE parameter {name}"))?;
            anyhow::ensure!(
                t.dims() == shape,
                "Parameter {name} has shape {:?}, expected {shape:?}",
                t.dims()
            );
            Ok(Var::from_tensor(&t.to_dtype(DType::F32)?.to_device(device)?)?)
        };

        Ok(Self {
            w_enc: load(W_ENC, &[d_in, d_sae])?,
            b_enc: load(B_ENC, &[d_sae])?,
            w_dec: load(W_DEC, &[d_sae, d_in])?,
            b_dec: load(B_DEC, &[d_in])?,
            d_in,
            d_sae,
            l1_coefficient: cfg.l1_coefficient,
            use_ghost_grads: cfg.use_ghost_grads,
            hook_point: cfg.hook_point.clone(),
            device: device.clone(),
        })
    }

    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_sae(&self) -> usize {
        self.d_sae
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run name used for checkpoint files
    pub fn name(&self) -> String {
        format!("sae_{}_{}", self.hook_point, self.d_sae)
    }

    pub fn w_enc(&self) -> &Tensor {
        self.w_enc.as_tensor()
    }

    pub fn b_enc(&self) -> &Tensor {
        self.b_enc.as_tensor()
    }

    pub fn w_dec(&self) -> &Tensor {
        self.w_dec.as_tensor()
    }

    pub fn b_dec(&self) -> &Tensor {
        self.b_dec.as_tensor()
    }

    /// Trainable parameters with their names
    pub fn parameters(&self) -> [(&'static str, &Var); 4] {
        [
            (W_ENC, &self.w_enc),
            (B_ENC, &self.b_enc),
            (W_DEC, &self.w_dec),
            (B_DEC, &self.b_dec),
        ]
    }

    /// Detached copies of every parameter, keyed by name
    pub fn tensors(&self) -> HashMap<String, Tensor> {
        self.parameters()
            .into_iter()
            .map(|(name, var)| (name.to_string(), var.as_tensor().detach()))
            .collect()
    }

    fn pre_activations(&self, x: &Tensor) -> Result<Tensor> {
        let centered = x.broadcast_sub(self.b_dec.as_tensor())?;
        Ok(centered
            .matmul(self.w_enc.as_tensor())?
            .broadcast_add(self.b_enc.as_tensor())?)
    }

    /// Feature activations for `x` `(batch, d_in)`, without building a graph
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.pre_activations(&x.detach())?.relu()?.detach())
    }

    /// Reconstruct from feature activations
    pub fn decode(&self, feature_acts: &Tensor) -> Result<Tensor> {
        Ok(feature_acts
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?)
    }

    /// Forward pass with losses.
    ///
    /// `dead` lists the features that receive the ghost-gradient term; it is
    /// ignored when ghost gradients are disabled.
    pub fn forward(&self, x: &Tensor, dead: Option<&[u32]>) -> Result<SaeOutput> {
        let x = x.to_dtype(DType::F32)?;
        let hidden_pre = self.pre_activations(&x)?;
        let feature_acts = hidden_pre.relu()?;
        let sae_out = self.decode(&feature_acts)?;

        // per-element squared error over the norm of the batch-centred input
        let x_centred = x.broadcast_sub(&x.mean_keepdim(0)?)?;
        let x_norm = (x_centred.sqr()?.sum_keepdim(1)?.sqrt()? + 1e-8)?;
        let mse = (&sae_out - &x)?.sqr()?.broadcast_div(&x_norm)?;

        let ghost_grad_loss = match dead {
            Some(dead) if self.use_ghost_grads && !dead.is_empty() => {
                self.ghost_grad_loss(&x, &sae_out, &hidden_pre, &mse, dead)?
            }
            _ => Tensor::zeros((), DType::F32, &self.device)?,
        };

        let mse_loss = mse.mean_all()?;
        let sparsity = feature_acts.abs()?.sum(1)?.mean_all()?;
        let l1_loss = (sparsity * self.l1_coefficient)?;
        let loss = ((&mse_loss + &l1_loss)? + &ghost_grad_loss)?;

        Ok(SaeOutput {
            sae_out,
            feature_acts,
            loss,
            mse_loss,
            l1_loss,
            ghost_grad_loss,
        })
    }

    fn ghost_grad_loss(
        &self,
        x: &Tensor,
        sae_out: &Tensor,
        hidden_pre: &Tensor,
        mse: &Tensor,
        dead: &[u32],
    ) -> Result<Tensor> {
        let dead = Tensor::from_slice(dead, dead.len(), &self.device)?;
        let residual = (x - sae_out)?;
        let residual_norm = residual.sqr()?.sum_keepdim(1)?.sqrt()?;

        let dead_acts = hidden_pre.index_select(&dead, 1)?.exp()?;
        let dead_dec = self.w_dec.as_tensor().index_select(&dead, 0)?;
        let ghost_out = dead_acts.matmul(&dead_dec)?;
        let ghost_norm = ghost_out.sqr()?.sum_keepdim(1)?.sqrt()?;

        // rescale the ghost reconstruction to half the residual norm
        let scale = residual_norm.broadcast_div(&((ghost_norm * 2.0)? + 1e-6)?)?.detach();
        let ghost_out = ghost_out.broadcast_mul(&scale)?;

        let residual = residual.detach();
        let ghost_mse = (ghost_out - &residual)?
            .sqr()?
            .broadcast_div(&(residual_norm.detach() + 1e-8)?)?;
        let rescale = (mse / (&ghost_mse + 1e-6)?)?.detach();
        Ok((rescale * ghost_mse)?.mean_all()?)
    }

    /// Scale every decoder row to unit L2 norm
    pub fn set_decoder_norm_to_unit_norm(&self) -> Result<()> {
        let w = self.w_dec.as_tensor();
        let norms = w.sqr()?.sum_keepdim(1)?.sqrt()?;
        self.w_dec.set(&w.broadcast_div(&norms)?)?;
        Ok(())
    }

    /// Remove the component of each decoder-row gradient parallel to the row
    pub fn remove_gradient_parallel_to_decoder_directions(&self, grads: &mut GradStore) -> Result<()> {
        let w = self.w_dec.as_tensor();
        let Some(grad) = grads.get(w) else {
            return Ok(());
        };
        let parallel = (grad * w)?.sum_keepdim(1)?;
        let projected = (grad - w.broadcast_mul(&parallel)?)?;
        grads.insert(w, projected);
        Ok(())
    }

    /// Set `b_dec` from a buffer of activations `(n, d_in)`
    pub fn initialize_b_dec(&self, method: BDecInit, acts: &Tensor) -> Result<()> {
        let acts = acts.to_dtype(DType::F32)?.to_device(&self.device)?;
        let b_dec = match method {
            BDecInit::Zeros => return Ok(()),
            BDecInit::Mean => acts.mean(0)?,
            BDecInit::GeometricMedian => geometric_median(&acts)?,
        };
        let previous = self.b_dec.as_tensor().detach();
        let distance: f32 = (&b_dec - &previous)?.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        debug!("Initialised b_dec ({method:?}), moved {distance:.4} from previous value");
        self.b_dec.set(&b_dec)?;
        Ok(())
    }

    /// Current weights of `indices`
    pub fn feature_rows(&self, indices: &[u32]) -> Result<ResampleRows> {
        if indices.is_empty() {
            return Ok(ResampleRows {
                indices: Vec::new(),
                decoder_rows: Tensor::zeros((0, self.d_in), DType::F32, &self.device)?,
                encoder_cols: Tensor::zeros((0, self.d_in), DType::F32, &self.device)?,
                encoder_bias: Tensor::zeros(0, DType::F32, &self.device)?,
            });
        }
        let idx = Tensor::from_slice(indices, indices.len(), &self.device)?;
        Ok(ResampleRows {
            indices: indices.to_vec(),
            decoder_rows: self.w_dec.as_tensor().index_select(&idx, 0)?.detach(),
            encoder_cols: self.w_enc.as_tensor().index_select(&idx, 1)?.t()?.contiguous()?.detach(),
            encoder_bias: self.b_enc.as_tensor().index_select(&idx, 0)?.detach(),
        })
    }

    /// Overwrite the weights of `rows.indices` and return what they were.
    ///
    /// Validation happens before any parameter is touched, so a failed call
    /// leaves the model unchanged.
    pub fn apply_resample(&self, rows: &ResampleRows) -> Result<ResampleRows> {
        let n = rows.indices.len();
        let mut seen = vec![false; self.d_sae];
        for &i in &rows.indices {
            let slot = seen
                .get_mut(i as usize)
                .with_context(|| format!("Feature {i} out of range (d_sae = {})", self.d_sae))?;
            anyhow::ensure!(!*slot, "Feature {i} listed twice in resample");
            *slot = true;
        }
        anyhow::ensure!(
            rows.decoder_rows.dims() == [n, self.d_in]
                && rows.encoder_cols.dims() == [n, self.d_in]
                && rows.encoder_bias.dims() == [n],
            "Resample weights do not match {n} features of width {}",
            self.d_in
        );

        let previous = self.feature_rows(&rows.indices)?;
        if n == 0 {
            return Ok(previous);
        }
        let idx = Tensor::from_slice(&rows.indices, n, &self.device)?;
        let keep: Vec<f32> = seen.iter().map(|&s| if s { 0.0 } else { 1.0 }).collect();
        let keep = Tensor::from_vec(keep, self.d_sae, &self.device)?;

        let w_dec = replace_rows(self.w_dec.as_tensor(), &keep.unsqueeze(1)?, &idx, &rows.decoder_rows, 0)?;
        let w_enc = replace_rows(
            self.w_enc.as_tensor(),
            &keep.unsqueeze(0)?,
            &idx,
            &rows.encoder_cols.t()?.contiguous()?,
            1,
        )?;
        let b_enc = replace_rows(self.b_enc.as_tensor(), &keep, &idx, &rows.encoder_bias, 0)?;

        self.w_dec.set(&w_dec)?;
        self.w_enc.set(&w_enc)?;
        self.b_enc.set(&b_enc)?;
        Ok(previous)
    }
}

/// `t` with the slices at `idx` along `dim` replaced by `values`.
///
/// `keep` is 0 at replaced positions and 1 elsewhere, shaped to broadcast
/// against `t`.
fn replace_rows(t: &Tensor, keep: &Tensor, idx: &Tensor, values: &Tensor, dim: usize) -> Result<Tensor> {
    let kept = t.broadcast_mul(keep)?;
    let scattered = t.zeros_like()?.index_add(idx, &values.to_dtype(t.dtype())?.contiguous()?, dim)?;
    Ok((kept + scattered)?.detach())
}

/// Weiszfeld estimate of the geometric median of the rows of `points`
pub fn geometric_median(points: &Tensor) -> Result<Tensor> {
    let mut guess = points.mean(0)?;
    for _ in 0..GEOMETRIC_MEDIAN_MAX_ITER {
        let previous = guess.clone();
        let distances = points.broadcast_sub(&guess)?.sqr()?.sum(1)?.sqrt()?;
        let weights = (distances + 1e-8)?.recip()?;
        let weights = weights.broadcast_div(&weights.sum_all()?)?;
        guess = points.broadcast_mul(&weights.unsqueeze(1)?)?.sum(0)?;

        let shift: f32 = (&guess - &previous)?.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        if f64::from(shift) < GEOMETRIC_MEDIAN_TOL {
            break;
        }
    }
    Ok(guess)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(d_in: usize, expansion: usize) -> SaeConfig {
        SaeConfig {
            d_in,
            expansion_factor: expansion,
            l1_coefficient: 1e-3,
            hook_point: "blocks.0.hook_resid_post".into(),
            ..Default::default()
        }
    }

    fn row_norms(t: &Tensor) -> Vec<f32> {
        t.sqr().unwrap().sum(1).unwrap().sqrt().unwrap().to_vec1().unwrap()
    }

    fn batch(n: usize, d: usize) -> Tensor {
        let data: Vec<f32> = (0..n * d).map(|i| ((i * 37 % 11) as f32 - 5.0) * 0.3).collect();
        Tensor::from_vec(data, (n, d), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_new_has_unit_decoder() {
        let sae = SparseAutoencoder::new(&cfg(8, 4), &Device::Cpu).unwrap();
        assert_eq!(sae.d_sae(), 32);
        assert_eq!(sae.w_enc().dims(), &[8, 32]);
        assert_eq!(sae.w_dec().dims(), &[32, 8]);
        for norm in row_norms(sae.w_dec()) {
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(sae.name(), "sae_blocks.0.hook_resid_post_32");
    }

    #[test]
    fn test_forward_losses() {
        let sae = SparseAutoencoder::new(&cfg(8, 4), &Device::Cpu).unwrap();
        let x = batch(16, 8);
        let out = sae.forward(&x, None).unwrap();
        assert_eq!(out.sae_out.dims(), &[16, 8]);
        assert_eq!(out.feature_acts.dims(), &[16, 32]);

        let loss: f32 = out.loss.to_scalar().unwrap();
        let mse: f32 = out.mse_loss.to_scalar().unwrap();
        let l1: f32 = out.l1_loss.to_scalar().unwrap();
        let ghost: f32 = out.ghost_grad_loss.to_scalar().unwrap();
        assert_eq!(ghost, 0.0);
        assert!((loss - (mse + l1)).abs() < 1e-5);
        assert!(out.feature_acts.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap() >= 0.0);
    }

    #[test]
    fn test_ghost_loss_only_with_dead_features() {
        let sae = SparseAutoencoder::new(&cfg(8, 2), &Device::Cpu).unwrap();
        let x = batch(16, 8);
        let empty = sae.forward(&x, Some(&[])).unwrap();
        assert_eq!(empty.ghost_grad_loss.to_scalar::<f32>().unwrap(), 0.0);

        let with_dead = sae.forward(&x, Some(&[0, 3, 7])).unwrap();
        let ghost: f32 = with_dead.ghost_grad_loss.to_scalar().unwrap();
        assert!(ghost.is_finite() && ghost > 0.0);

        // ghost loss reaches the dead encoder columns
        let grads = with_dead.ghost_grad_loss.backward().unwrap();
        assert!(grads.get(sae.w_enc()).is_some());
    }

    #[test]
    fn test_gradient_projection_is_orthogonal() {
        let sae = SparseAutoencoder::new(&cfg(8, 2), &Device::Cpu).unwrap();
        let out = sae.forward(&batch(16, 8), None).unwrap();
        let mut grads = out.loss.backward().unwrap();
        sae.remove_gradient_parallel_to_decoder_directions(&mut grads).unwrap();

        let grad = grads.get(sae.w_dec()).unwrap();
        let dots: Vec<f32> = (grad * sae.w_dec()).unwrap().sum(1).unwrap().to_vec1().unwrap();
        for dot in dots {
            assert!(dot.abs() < 1e-5, "parallel component {dot}");
        }
    }

    #[test]
    fn test_apply_resample_round_trip() {
        let sae = SparseAutoencoder::new(&cfg(4, 2), &Device::Cpu).unwrap();
        let before = sae.tensors();
        let device = Device::Cpu;
        let rows = ResampleRows {
            indices: vec![1, 6],
            decoder_rows: Tensor::ones((2, 4), DType::F32, &device).unwrap(),
            encoder_cols: Tensor::full(2f32, (2, 4), &device).unwrap(),
            encoder_bias: Tensor::full(3f32, 2, &device).unwrap(),
        };

        let previous = sae.apply_resample(&rows).unwrap();
        let w_dec: Vec<Vec<f32>> = sae.w_dec().to_vec2().unwrap();
        assert_eq!(w_dec[1], vec![1.0; 4]);
        assert_eq!(w_dec[6], vec![1.0; 4]);
        let w_enc: Vec<Vec<f32>> = sae.w_enc().to_vec2().unwrap();
        assert!(w_enc.iter().all(|r| r[1] == 2.0 && r[6] == 2.0));
        let b_enc: Vec<f32> = sae.b_enc().to_vec1().unwrap();
        assert_eq!((b_enc[1], b_enc[6], b_enc[0]), (3.0, 3.0, 0.0));

        // untouched rows are bit-identical
        let old_dec: Vec<Vec<f32>> = before[W_DEC].to_vec2().unwrap();
        assert_eq!(w_dec[0], old_dec[0]);

        // applying the returned rows restores the original parameters
        sae.apply_resample(&previous).unwrap();
        for (name, tensor) in sae.tensors() {
            let diff: f32 = (&tensor - &before[&name])
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(diff, 0.0, "{name} not restored");
        }
    }

    #[test]
    fn test_apply_resample_rejects_bad_input() {
        let sae = SparseAutoencoder::new(&cfg(4, 2), &Device::Cpu).unwrap();
        let device = Device::Cpu;
        let rows = |indices: Vec<u32>| ResampleRows {
            decoder_rows: Tensor::ones((indices.len(), 4), DType::F32, &device).unwrap(),
            encoder_cols: Tensor::ones((indices.len(), 4), DType::F32, &device).unwrap(),
            encoder_bias: Tensor::ones(indices.len(), DType::F32, &device).unwrap(),
            indices,
        };
        assert!(sae.apply_resample(&rows(vec![2, 2])).is_err());
        assert!(sae.apply_resample(&rows(vec![8])).is_err());
    }

    #[test]
    fn test_b_dec_init() {
        let sae = SparseAutoencoder::new(&cfg(2, 1), &Device::Cpu).unwrap();
        let points = Tensor::new(
            &[[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0], [100.0, 100.0]],
            &Device::Cpu,
        )
        .unwrap();

        sae.initialize_b_dec(BDecInit::Mean, &points).unwrap();
        let mean: Vec<f32> = sae.b_dec().to_vec1().unwrap();
        assert!((mean[0] - 25.25).abs() < 1e-4);

        sae.initialize_b_dec(BDecInit::GeometricMedian, &points).unwrap();
        let median: Vec<f32> = sae.b_dec().to_vec1().unwrap();
        // the outlier barely moves the median
        assert!(median[0] < 2.0 && median[1] < 2.0);
    }
}
