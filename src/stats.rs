use ndarray::{Array, ArrayBase, Data, Dimension};
use tracing::warn;

/// Added to the standard deviation when standardizing advantages
pub const ADVANTAGE_EPS: f32 = 1e-5;

/// Statistics for a collection of values, ignoring NaN entries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub mean: f32,
    pub std: f32,
    /// Number of non-NaN values the statistics were computed from
    pub count: usize,
}

impl Statistics {
    /// Population mean and standard deviation over the non-NaN values
    pub fn nan_aware<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a f32>,
    {
        let mut count = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        for &v in values {
            if v.is_nan() {
                continue;
            }
            count += 1;
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
        }

        if count == 0 {
            return Statistics {
                mean: 0.0,
                std: 0.0,
                count: 0,
            };
        }

        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Statistics {
            mean: mean as f32,
            std: variance.sqrt() as f32,
            count,
        }
    }

    /// Fewer than two samples or no spread at all
    pub fn is_degenerate(&self) -> bool {
        self.count < 2 || self.std == 0.0
    }
}

/// Subtract the nan-aware mean and divide by `std + ADVANTAGE_EPS`.
///
/// NaN entries stay NaN so that a broken return computation is visible downstream.
pub fn standardize<S, D>(values: &ArrayBase<S, D>, label: &str) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let stats = Statistics::nan_aware(values.iter());
    if stats.is_degenerate() {
        warn!(
            label,
            count = stats.count,
            std = stats.std,
            "degenerate batch statistics, relying on epsilon guard"
        );
    }
    let denom = stats.std + ADVANTAGE_EPS;
    values.mapv(|v| (v - stats.mean) / denom)
}

/// Count NaN and infinite entries
pub fn count_non_finite<'a, I>(values: I) -> (usize, usize)
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut nan_count = 0;
    let mut inf_count = 0;
    for &value in values {
        if value.is_nan() {
            nan_count += 1;
        } else if value.is_infinite() {
            inf_count += 1;
        }
    }
    (nan_count, inf_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_statistics_skip_nan() {
        let stats = Statistics::nan_aware([1.0f32, f32::NAN, 3.0].iter());
        assert_eq!(stats.count, 2);
        assert!((stats.mean - 2.0).abs() < 1e-6);
        assert!((stats.std - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_statistics_empty() {
        let stats = Statistics::nan_aware(std::iter::empty::<&f32>());
        assert_eq!(stats.count, 0);
        assert!(stats.is_degenerate());
    }

    #[test]
    fn test_standardize_mean_zero_std_one() {
        let values = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let out = standardize(&values, "test");
        let stats = Statistics::nan_aware(out.iter());
        assert!(stats.mean.abs() < 1e-5);
        assert!((stats.std - 1.0).abs() < 1e-4);
        assert_eq!(out.shape(), &[3, 2]);
    }

    #[test]
    fn test_standardize_constant_batch_is_finite() {
        let values = array![2.0f32, 2.0, 2.0];
        let out = standardize(&values, "constant");
        for &v in out.iter() {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_standardize_keeps_nan_in_place() {
        let values = array![1.0f32, f32::NAN, 3.0];
        let out = standardize(&values, "nan");
        assert!(out[[1]].is_nan());
        assert!(out[[0]] < 0.0 && out[[2]] > 0.0);
    }

    #[test]
    fn test_count_non_finite() {
        let values = [1.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY];
        assert_eq!(count_non_finite(values.iter()), (1, 2));
    }
}
