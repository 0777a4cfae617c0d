//! Interfaces to the policy modules and language learners the trainer drives.
//!
//! The trainer never differentiates through a network itself. It hands each
//! module the gradient of the combined loss with respect to the module's own
//! outputs through [`CommPolicy::backward`], and the module propagates it to
//! its parameters.

pub mod linear;

pub use linear::LinearCommPolicy;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::buffer::{AgentBatch, LanguageBatch};
use crate::error::Result;

/// Outputs of re-evaluating stored actions, one entry per batch row
#[derive(Debug, Clone)]
pub struct ActionEvaluation {
    pub env_values: Array1<f32>,
    pub comm_values: Array1<f32>,
    /// `(rows, env_act_dim)`
    pub env_log_probs: Array2<f32>,
    pub env_entropy: Array1<f32>,
    /// `(rows, comm_act_dim)`
    pub comm_log_probs: Array2<f32>,
    pub comm_entropy: Array1<f32>,
}

/// Gradient of the combined loss with respect to each [`ActionEvaluation`] field
#[derive(Debug, Clone)]
pub struct EvaluationGradients {
    pub env_values: Array1<f32>,
    pub comm_values: Array1<f32>,
    pub env_log_probs: Array2<f32>,
    pub env_entropy: Array1<f32>,
    pub comm_log_probs: Array2<f32>,
    pub comm_entropy: Array1<f32>,
}

impl EvaluationGradients {
    /// All-zero gradients shaped like `eval`
    pub fn zeros_like(eval: &ActionEvaluation) -> Self {
        EvaluationGradients {
            env_values: Array1::zeros(eval.env_values.raw_dim()),
            comm_values: Array1::zeros(eval.comm_values.raw_dim()),
            env_log_probs: Array2::zeros(eval.env_log_probs.raw_dim()),
            env_entropy: Array1::zeros(eval.env_entropy.raw_dim()),
            comm_log_probs: Array2::zeros(eval.comm_log_probs.raw_dim()),
            comm_entropy: Array1::zeros(eval.comm_entropy.raw_dim()),
        }
    }
}

/// A recurrent actor with an environment-action head, a communication head and
/// one critic per head.
pub trait CommPolicy {
    /// Re-evaluate the stored actions of `batch`.
    ///
    /// Rows are time-major; the recurrent state of each sequence is given for
    /// its first step only. The comm-head outputs may be left at zero when
    /// `train_comm_head` is false.
    fn evaluate_actions(&mut self, batch: &AgentBatch, train_comm_head: bool) -> Result<ActionEvaluation>;

    /// Communication vectors for `n_steps` consecutive steps of each sequence
    fn get_comm_actions(
        &mut self,
        policy_input: ArrayView2<f32>,
        rnn_states: ArrayView3<f32>,
        masks: ArrayView1<f32>,
        n_steps: usize,
    ) -> Result<Array2<f32>>;

    /// Switch the learning rate in or out of its warmup value
    fn warmup_lr(&mut self, warmup: bool);

    fn zero_grad(&mut self);

    /// Accumulate parameter gradients from the gradients of the last evaluation's outputs
    fn backward(&mut self, grads: &EvaluationGradients) -> Result<()>;

    /// Apply the accumulated gradients, clipped to `max_grad_norm`
    fn step(&mut self, max_grad_norm: f32);
}

/// Losses reported by one language update
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageLosses {
    /// Captioning (decoder) loss
    pub capt_loss: f32,
    /// Contrastive loss between communication and sentence embeddings
    pub clip_loss: f32,
    /// Mean similarity of matching pairs
    pub mean_sim: f32,
}

/// Trains the language modules grounding a policy's communication head
pub trait LanguageLearner<P: CommPolicy> {
    fn train_language(&mut self, policy: &mut P, batch: &LanguageBatch) -> Result<LanguageLosses>;
}
