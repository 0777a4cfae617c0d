use serde::{Deserialize, Serialize};

/// Huber loss (smooth L1) on a scalar error
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HuberLoss {
    pub delta: f32,
}

impl HuberLoss {
    pub fn new(delta: f32) -> Self {
        HuberLoss { delta }
    }

    /// Quadratic inside `[-delta, delta]`, linear outside
    pub fn value(&self, error: f32) -> f32 {
        let abs_e = error.abs();
        if abs_e <= self.delta {
            0.5 * error * error
        } else {
            self.delta * (abs_e - 0.5 * self.delta)
        }
    }

    /// Derivative with respect to the error
    pub fn derivative(&self, error: f32) -> f32 {
        if error.abs() <= self.delta {
            error
        } else {
            self.delta * error.signum()
        }
    }
}
