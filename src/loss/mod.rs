//! Clipped PPO losses with their gradients.
//!
//! The policy modules are opaque, so every loss here also returns its gradient
//! with respect to the policy outputs it was computed from. Rows excluded by a
//! mask contribute nothing to the loss and receive a zero gradient.

pub mod functions;

pub use functions::HuberLoss;

use ndarray::{Array1, Array2};

use crate::error::{AccError, Result};
use crate::normalizer::ValueNormalizer;

/// Clipped-surrogate loss of one action head
#[derive(Debug, Clone)]
pub struct PolicyLoss {
    /// `-mean_rows(sum_dims(min(rA, clip(r)A)))`
    pub surrogate: f32,
    /// Mean entropy over the included rows
    pub entropy: f32,
    /// `surrogate - entropy_coef * entropy`
    pub total: f32,
    /// Fraction of ratios outside `[1 - clip, 1 + clip]`
    pub clip_fraction: f32,
    /// Gradient of `total` with respect to the new log probabilities
    pub grad_log_probs: Array2<f32>,
    /// Gradient of `total` with respect to the per-row entropy
    pub grad_entropy: Array1<f32>,
    /// Number of rows the loss was averaged over
    pub rows: usize,
}

/// Clipped Huber value loss of one critic head
#[derive(Debug, Clone)]
pub struct ValueLoss {
    pub loss: f32,
    /// Gradient of `loss` with respect to the new value predictions
    pub grad_values: Array1<f32>,
    pub rows: usize,
}

/// Hyperparameters shared by both heads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpoLossConfig {
    pub clip_param: f32,
    pub entropy_coef: f32,
    pub huber: HuberLoss,
}

fn check_rows(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(AccError::shape_mismatch(what, &[expected], &[actual]));
    }
    Ok(())
}

fn included(mask: Option<&Array1<bool>>, row: usize) -> bool {
    mask.map_or(true, |m| m[row])
}

/// Clipped-surrogate loss over every row
pub fn policy_loss(
    new_log_probs: &Array2<f32>,
    old_log_probs: &Array2<f32>,
    advantages: &Array1<f32>,
    entropy: &Array1<f32>,
    config: &PpoLossConfig,
) -> Result<PolicyLoss> {
    clipped_surrogate(new_log_probs, old_log_probs, advantages, entropy, None, config)
}

/// Clipped-surrogate loss over the rows whose mask is set.
///
/// With no row set the loss is zero and so is every gradient.
pub fn masked_policy_loss(
    new_log_probs: &Array2<f32>,
    old_log_probs: &Array2<f32>,
    advantages: &Array1<f32>,
    entropy: &Array1<f32>,
    mask: &Array1<bool>,
    config: &PpoLossConfig,
) -> Result<PolicyLoss> {
    clipped_surrogate(new_log_probs, old_log_probs, advantages, entropy, Some(mask), config)
}

fn clipped_surrogate(
    new_log_probs: &Array2<f32>,
    old_log_probs: &Array2<f32>,
    advantages: &Array1<f32>,
    entropy: &Array1<f32>,
    mask: Option<&Array1<bool>>,
    config: &PpoLossConfig,
) -> Result<PolicyLoss> {
    if new_log_probs.dim() != old_log_probs.dim() {
        return Err(AccError::shape_mismatch(
            "log_probs",
            old_log_probs.shape(),
            new_log_probs.shape(),
        ));
    }
    let (n_rows, n_dims) = new_log_probs.dim();
    check_rows("advantages", n_rows, advantages.len())?;
    check_rows("entropy", n_rows, entropy.len())?;
    if let Some(m) = mask {
        check_rows("comm_mask", n_rows, m.len())?;
    }

    let mut grad_log_probs = Array2::zeros((n_rows, n_dims));
    let mut grad_entropy = Array1::zeros(n_rows);
    let rows = (0..n_rows).filter(|&i| included(mask, i)).count();
    if rows == 0 {
        return Ok(PolicyLoss {
            surrogate: 0.0,
            entropy: 0.0,
            total: 0.0,
            clip_fraction: 0.0,
            grad_log_probs,
            grad_entropy,
            rows,
        });
    }

    let n = rows as f32;
    let lo = 1.0 - config.clip_param;
    let hi = 1.0 + config.clip_param;
    let mut surrogate_sum = 0.0f32;
    let mut entropy_sum = 0.0f32;
    let mut clipped = 0usize;

    for i in (0..n_rows).filter(|&i| included(mask, i)) {
        let adv = advantages[i];
        for d in 0..n_dims {
            let ratio = (new_log_probs[[i, d]] - old_log_probs[[i, d]]).exp();
            let surr1 = ratio * adv;
            let surr2 = ratio.clamp(lo, hi) * adv;
            if ratio < lo || ratio > hi {
                clipped += 1;
            }
            // The clipped branch is constant in the log probability
            if surr1 <= surr2 {
                surrogate_sum += surr1;
                grad_log_probs[[i, d]] = -surr1 / n;
            } else {
                surrogate_sum += surr2;
            }
        }
        entropy_sum += entropy[i];
        grad_entropy[i] = -config.entropy_coef / n;
    }

    let surrogate = -surrogate_sum / n;
    let mean_entropy = entropy_sum / n;
    Ok(PolicyLoss {
        surrogate,
        entropy: mean_entropy,
        total: surrogate - config.entropy_coef * mean_entropy,
        clip_fraction: clipped as f32 / (rows * n_dims.max(1)) as f32,
        grad_log_probs,
        grad_entropy,
        rows,
    })
}

/// Clipped Huber value loss over every row
pub fn value_loss<N: ValueNormalizer>(
    values: &Array1<f32>,
    old_value_preds: &Array1<f32>,
    returns: &Array1<f32>,
    normalizer: &mut N,
    config: &PpoLossConfig,
) -> Result<ValueLoss> {
    clipped_value(values, old_value_preds, returns, None, normalizer, config)
}

/// Clipped Huber value loss over the rows whose mask is set.
///
/// The normalizer only sees the returns of included rows, and is left
/// untouched when no row is included.
pub fn masked_value_loss<N: ValueNormalizer>(
    values: &Array1<f32>,
    old_value_preds: &Array1<f32>,
    returns: &Array1<f32>,
    mask: &Array1<bool>,
    normalizer: &mut N,
    config: &PpoLossConfig,
) -> Result<ValueLoss> {
    clipped_value(values, old_value_preds, returns, Some(mask), normalizer, config)
}

fn clipped_value<N: ValueNormalizer>(
    values: &Array1<f32>,
    old_value_preds: &Array1<f32>,
    returns: &Array1<f32>,
    mask: Option<&Array1<bool>>,
    normalizer: &mut N,
    config: &PpoLossConfig,
) -> Result<ValueLoss> {
    let n_rows = values.len();
    check_rows("old_value_preds", n_rows, old_value_preds.len())?;
    check_rows("returns", n_rows, returns.len())?;
    if let Some(m) = mask {
        check_rows("comm_mask", n_rows, m.len())?;
    }

    let mut grad_values = Array1::zeros(n_rows);
    let rows: Vec<usize> = (0..n_rows).filter(|&i| included(mask, i)).collect();
    if rows.is_empty() {
        return Ok(ValueLoss {
            loss: 0.0,
            grad_values,
            rows: 0,
        });
    }

    let raw_returns: Array1<f32> = rows.iter().map(|&i| returns[i]).collect();
    normalizer.update(&raw_returns);
    let targets = normalizer.normalize(&raw_returns);

    let n = rows.len() as f32;
    let huber = config.huber;
    let clip = config.clip_param;
    let mut loss_sum = 0.0f32;

    for (k, &i) in rows.iter().enumerate() {
        let value = values[i];
        let old = old_value_preds[i];
        let delta = value - old;
        let clipped_value = old + delta.clamp(-clip, clip);

        let error_original = targets[k] - value;
        let error_clipped = targets[k] - clipped_value;
        let loss_original = huber.value(error_original);
        let loss_clipped = huber.value(error_clipped);

        if loss_original >= loss_clipped {
            loss_sum += loss_original;
            grad_values[i] = -huber.derivative(error_original) / n;
        } else {
            loss_sum += loss_clipped;
            if delta.abs() <= clip {
                grad_values[i] = -huber.derivative(error_clipped) / n;
            }
        }
    }

    Ok(ValueLoss {
        loss: loss_sum / n,
        grad_values,
        rows: rows.len(),
    })
}
