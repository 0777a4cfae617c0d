use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Rescales all gradients together so their joint L2 norm is at most `max_norm`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientClipper {
    pub max_norm: f32,
}

impl GradientClipper {
    /// L2 norm over every weight and bias gradient
    pub fn global_norm(weight_grads: &[&Array2<f32>], bias_grads: &[&Array1<f32>]) -> f32 {
        let weight_norm_sq: f32 = weight_grads
            .iter()
            .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
            .sum();
        let bias_norm_sq: f32 = bias_grads
            .iter()
            .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
            .sum();
        (weight_norm_sq + bias_norm_sq).sqrt()
    }

    /// Clip the gradients in place and return their global norm before clipping
    pub fn clip(&self, weight_grads: &mut [&mut Array2<f32>], bias_grads: &mut [&mut Array1<f32>]) -> f32 {
        let norm = {
            let weights: Vec<&Array2<f32>> = weight_grads.iter().map(|g| &**g).collect();
            let biases: Vec<&Array1<f32>> = bias_grads.iter().map(|g| &**g).collect();
            Self::global_norm(&weights, &biases)
        };

        if norm > self.max_norm {
            let scale = self.max_norm / norm;
            for grad in weight_grads.iter_mut() {
                grad.mapv_inplace(|g| g * scale);
            }
            for grad in bias_grads.iter_mut() {
                grad.mapv_inplace(|g| g * scale);
            }
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_global_norm_rescales_jointly() {
        let mut w = array![[3.0f32, 0.0]];
        let mut b = array![4.0f32];
        let clipper = GradientClipper { max_norm: 1.0 };
        let norm = clipper.clip(&mut [&mut w], &mut [&mut b]);

        assert!((norm - 5.0).abs() < 1e-6);
        assert!((w[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((b[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_global_norm_below_limit_is_untouched() {
        let mut w = array![[0.3f32, 0.4]];
        let clipper = GradientClipper { max_norm: 10.0 };
        clipper.clip(&mut [&mut w], &mut []);
        assert_eq!(w, array![[0.3f32, 0.4]]);
    }

    #[test]
    fn test_zero_gradients_stay_zero() {
        let mut b = array![0.0f32, 0.0];
        let norm = GradientClipper { max_norm: 1.0 }.clip(&mut [], &mut [&mut b]);
        assert_eq!(norm, 0.0);
        assert_eq!(b, array![0.0f32, 0.0]);
    }
}
