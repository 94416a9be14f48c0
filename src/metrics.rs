//! Training metrics and the sinks that receive them
//!
//! The trainer builds a key → value map every `log_frequency` steps and
//! hands it to a [`MetricsSink`] together with the step number. Sinks are
//! observers only: nothing they do feeds back into training.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::info;

/// One logged value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetricValue {
    Scalar(f64),
    /// Raw samples, binned by the sink
    Histogram(Vec<f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Histogram(_) => None,
        }
    }
}

/// Metrics emitted at one step, ordered by key
pub type Metrics = BTreeMap<String, MetricValue>;

/// Receiver for training metrics
pub trait MetricsSink {
    fn log(&mut self, step: u64, metrics: &Metrics);
}

/// Emits each metric map as one `info!` event
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, step: u64, metrics: &Metrics) {
        let rendered: Vec<String> = metrics
            .iter()
            .map(|(key, value)| match value {
                MetricValue::Scalar(v) => format!("{key}={v:.6}"),
                MetricValue::Histogram(samples) => format!("{key}={}", summarize(samples)),
            })
            .collect();
        info!(step, "{}", rendered.join(" "));
    }
}

/// Keeps every logged map in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub records: Vec<(u64, Metrics)>,
}

impl RecordingSink {
    /// Every logged value of a scalar metric with its step
    pub fn scalars(&self, key: &str) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter_map(|(step, m)| m.get(key).and_then(MetricValue::as_scalar).map(|v| (*step, v)))
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn log(&mut self, step: u64, metrics: &Metrics) {
        self.records.push((step, metrics.clone()));
    }
}

fn summarize(samples: &[f64]) -> String {
    if samples.is_empty() {
        return "[]".to_string();
    }
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    format!("[n={} min={min:.3} mean={mean:.3} max={max:.3}]", samples.len())
}

/// Mean and unbiased std of per-input explained variance,
/// `1 - |sae_out - sae_in|^2 / |sae_in|^2`
pub fn explained_variance(sae_out: &Tensor, sae_in: &Tensor) -> Result<(f64, f64)> {
    let residual: Vec<f32> = (sae_out - sae_in)?.sqr()?.sum(1)?.to_vec1()?;
    let total: Vec<f32> = sae_in.sqr()?.sum(1)?.to_vec1()?;
    let ev: Vec<f64> = residual
        .iter()
        .zip(&total)
        .map(|(&r, &t)| 1.0 - f64::from(r) / (f64::from(t) + 1e-10))
        .collect();

    let n = ev.len() as f64;
    if ev.is_empty() {
        return Ok((0.0, 0.0));
    }
    let mean = ev.iter().sum::<f64>() / n;
    let std = if ev.len() > 1 {
        (ev.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Ok((mean, std))
}

/// Mean number of active features per input
pub fn l0(feature_acts: &Tensor) -> Result<f64> {
    let l0: f32 = feature_acts
        .gt(0f64)?
        .to_dtype(DType::F32)?
        .sum(1)?
        .mean_all()?
        .to_scalar()?;
    Ok(f64::from(l0))
}

/// Fraction of `values` strictly below `threshold`
pub fn fraction_below(values: &[f64], threshold: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().filter(|&&v| v < threshold).count() as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_explained_variance() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0]], &device).unwrap();
        let (mean, std) = explained_variance(&x, &x).unwrap();
        assert!((mean - 1.0).abs() < 1e-9);
        assert!(std.abs() < 1e-9);

        let zeros = x.zeros_like().unwrap();
        let (mean, _) = explained_variance(&zeros, &x).unwrap();
        assert!(mean.abs() < 1e-6);

        // zero input never divides by zero
        let (mean, _) = explained_variance(&zeros, &zeros).unwrap();
        assert!(mean.is_finite());
    }

    #[test]
    fn test_l0_and_fractions() {
        let acts = Tensor::new(&[[0.0f32, 1.0, 2.0], [0.0, 0.0, 3.0]], &Device::Cpu).unwrap();
        assert!((l0(&acts).unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(fraction_below(&[1e-7, 1e-3, 0.0, 0.5], 1e-5), 0.5);
        assert_eq!(fraction_below(&[], 1.0), 0.0);
    }

    #[test]
    fn test_recording_sink() {
        let mut sink = RecordingSink::default();
        let mut metrics = Metrics::new();
        metrics.insert("losses/mse_loss".into(), MetricValue::Scalar(0.5));
        metrics.insert("plots/log_sparsity".into(), MetricValue::Histogram(vec![-10.0, -2.0]));
        sink.log(3, &metrics);
        TracingSink.log(3, &metrics);

        assert_eq!(sink.scalars("losses/mse_loss"), vec![(3, 0.5)]);
        assert!(sink.scalars("plots/log_sparsity").is_empty());
    }
}
