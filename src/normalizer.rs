//! Streaming return normalization.
//!
//! The critic predicts values in a normalized space; returns are computed in
//! the raw reward space. A [`ValueNormalizer`] converts between the two and is
//! updated with each batch of raw returns right before the value loss uses it.

use ndarray::{Array, ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};

/// Streaming mean/variance estimator over scalar returns.
pub trait ValueNormalizer {
    /// Fold a batch of raw returns into the running statistics
    fn update<S, D>(&mut self, batch: &ArrayBase<S, D>)
    where
        S: Data<Elem = f32>,
        D: Dimension;

    /// Map raw values into the normalized space
    fn normalize<S, D>(&self, x: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension;

    /// Map normalized values back into the raw space
    fn denormalize<S, D>(&self, x: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension;
}

/// Exponentially-weighted, debiased running mean and variance of a scalar.
///
/// Before the first update the debiasing term is zero, so the estimate is a
/// mean of 0 and the variance floor (`min_var`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueNorm {
    running_mean: f64,
    running_mean_sq: f64,
    debiasing_term: f64,
    /// Weight given to the previous statistics on every update
    pub beta: f64,
    pub epsilon: f64,
    /// Lower bound for the variance estimate
    pub min_var: f64,
}

impl ValueNorm {
    pub fn new() -> Self {
        Self::with_beta(0.99999)
    }

    pub fn with_beta(beta: f64) -> Self {
        ValueNorm {
            running_mean: 0.0,
            running_mean_sq: 0.0,
            debiasing_term: 0.0,
            beta,
            epsilon: 1e-5,
            min_var: 1e-2,
        }
    }

    /// Debiased running mean and variance
    pub fn running_mean_var(&self) -> (f64, f64) {
        let debias = self.debiasing_term.max(self.epsilon);
        let mean = self.running_mean / debias;
        let mean_sq = self.running_mean_sq / debias;
        let var = (mean_sq - mean * mean).max(self.min_var);
        (mean, var)
    }
}

impl Default for ValueNorm {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueNormalizer for ValueNorm {
    fn update<S, D>(&mut self, batch: &ArrayBase<S, D>)
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let n = batch.len();
        if n == 0 {
            return;
        }
        let batch_mean = batch.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
        let batch_sq_mean = batch.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / n as f64;

        let weight = self.beta;
        self.running_mean = self.running_mean * weight + batch_mean * (1.0 - weight);
        self.running_mean_sq = self.running_mean_sq * weight + batch_sq_mean * (1.0 - weight);
        self.debiasing_term = self.debiasing_term * weight + (1.0 - weight);
    }

    fn normalize<S, D>(&self, x: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let (mean, var) = self.running_mean_var();
        let std = var.sqrt();
        x.mapv(|v| ((v as f64 - mean) / std) as f32)
    }

    fn denormalize<S, D>(&self, x: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let (mean, var) = self.running_mean_var();
        let std = var.sqrt();
        x.mapv(|v| (v as f64 * std + mean) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fresh_normalizer_uses_variance_floor() {
        let norm = ValueNorm::new();
        let (mean, var) = norm.running_mean_var();
        assert_eq!(mean, 0.0);
        assert!((var - 1e-2).abs() < 1e-12);

        let out = norm.denormalize(&array![1.0f32, -2.0]);
        assert!((out[0] - 0.1).abs() < 1e-6);
        assert!((out[1] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_single_update_is_debiased() {
        let mut norm = ValueNorm::with_beta(0.9);
        norm.update(&array![2.0f32, 4.0, 6.0]);
        let (mean, var) = norm.running_mean_var();
        assert!((mean - 4.0).abs() < 1e-9);
        // E[x^2] - E[x]^2 = 56/3 - 16
        assert!((var - 8.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_then_denormalize() {
        let mut norm = ValueNorm::with_beta(0.5);
        norm.update(&array![[1.0f32], [3.0], [10.0]]);
        let x = array![[0.5f32], [7.0], [-3.0]];
        let back = norm.denormalize(&norm.normalize(&x));
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_empty_update_is_ignored() {
        let mut norm = ValueNorm::new();
        norm.update(&ndarray::Array1::<f32>::zeros(0));
        assert_eq!(norm.running_mean_var().0, 0.0);
    }
}
