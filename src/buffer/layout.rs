//! Parameter-sharing strategies.
//!
//! A minibatch comes out of the buffer with its `(time, env, agent, ...)` axes
//! intact. A [`BatchLayout`] decides which policy module trains on which rows:
//! [`SharedLayout`] pools every agent into one batch for module 0, while
//! [`PerAgentLayout`] cuts one batch per agent. Rows are always ordered
//! time-major, so row `t * n_sequences + s` is step `t` of sequence `s`.

use std::fmt;

use ndarray::{Array, Array1, Array2, Array3, ArrayView, Axis, Dimension, RemoveAxis};

use super::language::{LanguageBatch, LanguageSample};
use super::minibatch::MiniBatch;
use crate::error::Result;

/// Training rows for one policy module
#[derive(Debug, Clone)]
pub struct AgentBatch {
    /// Index of the policy module these rows train
    pub module: usize,
    /// Number of consecutive time steps per sequence
    pub n_steps: usize,
    /// Number of independent recurrent sequences
    pub n_sequences: usize,
    pub policy_input: Array2<f32>,
    pub critic_input: Array2<f32>,
    /// `(n_sequences, recurrent_n, hidden)` state at the first step of each sequence
    pub rnn_states: Array3<f32>,
    pub critic_rnn_states: Array3<f32>,
    pub env_actions: Array2<f32>,
    pub comm_actions: Array2<f32>,
    pub old_env_log_probs: Array2<f32>,
    pub old_comm_log_probs: Array2<f32>,
    pub act_value_preds: Array1<f32>,
    pub comm_value_preds: Array1<f32>,
    pub act_returns: Array1<f32>,
    pub comm_returns: Array1<f32>,
    pub masks: Array1<f32>,
    pub act_advantages: Array1<f32>,
    pub comm_advantages: Array1<f32>,
    /// Rows eligible for communication-head gradients
    pub comm_mask: Array1<bool>,
}

impl AgentBatch {
    pub fn len(&self) -> usize {
        self.n_steps * self.n_sequences
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows whose communication head may be trained
    pub fn comm_rows(&self) -> usize {
        self.comm_mask.iter().filter(|&&m| m).count()
    }
}

/// Strategy turning buffer-shaped batches into per-module training batches.
pub trait BatchLayout: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of policy modules this layout trains
    fn module_count(&self, n_agents: usize) -> usize;

    /// Split a PPO minibatch into one batch per trained module
    fn split(&self, batch: &MiniBatch) -> Result<Vec<AgentBatch>>;

    /// Split a language sample into one batch per trained module
    fn split_language(&self, sample: &LanguageSample) -> Result<Vec<LanguageBatch>>;
}

/// One module trained on the rows of every agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedLayout;

/// One module per agent, each trained on its own agent's rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerAgentLayout;

/// Picks the layout matching the parameter-sharing flag
pub fn layout_for(share_params: bool) -> Box<dyn BatchLayout> {
    if share_params {
        Box::new(SharedLayout)
    } else {
        Box::new(PerAgentLayout)
    }
}

/// Collapse every axis but the last into rows, in logical (row-major) order
fn flatten_features<D: Dimension>(view: ArrayView<f32, D>) -> Result<Array2<f32>> {
    let shape = view.shape();
    let cols = shape[shape.len() - 1];
    let rows = if cols == 0 { 0 } else { view.len() / cols };
    let data: Vec<f32> = view.iter().copied().collect();
    Ok(Array2::from_shape_vec((rows, cols), data)?)
}

fn flatten_scalars<A: Copy, D: Dimension>(view: ArrayView<A, D>) -> Array1<A> {
    view.iter().copied().collect()
}

/// `(sequences..., recurrent_n, hidden)` → `(n_sequences, recurrent_n, hidden)`
fn flatten_states<D: Dimension>(view: ArrayView<f32, D>) -> Result<Array3<f32>> {
    let shape = view.shape();
    let hidden = shape[shape.len() - 1];
    let layers = shape[shape.len() - 2];
    let per_sequence = layers * hidden;
    let sequences = if per_sequence == 0 { 0 } else { view.len() / per_sequence };
    let data: Vec<f32> = view.iter().copied().collect();
    Ok(Array3::from_shape_vec((sequences, layers, hidden), data)?)
}

/// Repeat a per-environment flag over `(time, env, agent)` rows
fn broadcast_env_mask(mask: &Array1<bool>, n_steps: usize, n_agents: usize) -> Array1<bool> {
    let mut rows = Vec::with_capacity(n_steps * mask.len() * n_agents);
    for _ in 0..n_steps {
        for &m in mask.iter() {
            rows.extend(std::iter::repeat(m).take(n_agents));
        }
    }
    Array1::from_vec(rows)
}

/// Select agent `a` along the agent axis (axis 2 for time-indexed arrays)
fn agent_slice<A, D: RemoveAxis>(array: &Array<A, D>, axis: usize, agent: usize) -> ArrayView<'_, A, D::Smaller> {
    array.index_axis(Axis(axis), agent)
}

impl BatchLayout for SharedLayout {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn module_count(&self, _n_agents: usize) -> usize {
        1
    }

    fn split(&self, batch: &MiniBatch) -> Result<Vec<AgentBatch>> {
        let (n_steps, n_envs, n_agents) = batch.masks.dim();
        Ok(vec![AgentBatch {
            module: 0,
            n_steps,
            n_sequences: n_envs * n_agents,
            policy_input: flatten_features(batch.policy_input.view())?,
            critic_input: flatten_features(batch.critic_input.view())?,
            rnn_states: flatten_states(batch.rnn_states.view())?,
            critic_rnn_states: flatten_states(batch.critic_rnn_states.view())?,
            env_actions: flatten_features(batch.env_actions.view())?,
            comm_actions: flatten_features(batch.comm_actions.view())?,
            old_env_log_probs: flatten_features(batch.env_log_probs.view())?,
            old_comm_log_probs: flatten_features(batch.comm_log_probs.view())?,
            act_value_preds: flatten_scalars(batch.act_value_preds.view()),
            comm_value_preds: flatten_scalars(batch.comm_value_preds.view()),
            act_returns: flatten_scalars(batch.act_returns.view()),
            comm_returns: flatten_scalars(batch.comm_returns.view()),
            masks: flatten_scalars(batch.masks.view()),
            act_advantages: flatten_scalars(batch.act_advantages.view()),
            comm_advantages: flatten_scalars(batch.comm_advantages.view()),
            comm_mask: broadcast_env_mask(&batch.train_comm_mask, n_steps, n_agents),
        }])
    }

    fn split_language(&self, sample: &LanguageSample) -> Result<Vec<LanguageBatch>> {
        let (n_steps, n_envs, n_agents) = sample.masks.dim();
        let sentences = sample
            .sentences
            .iter()
            .flat_map(|step| step.iter().flat_map(|env| env.iter().cloned()))
            .collect();
        Ok(vec![LanguageBatch {
            module: 0,
            n_steps,
            n_sequences: n_envs * n_agents,
            policy_input: flatten_features(sample.policy_input.view())?,
            masks: flatten_scalars(sample.masks.view()),
            rnn_states: flatten_states(sample.rnn_states.view())?,
            sentences,
        }])
    }
}

impl BatchLayout for PerAgentLayout {
    fn name(&self) -> &'static str {
        "per_agent"
    }

    fn module_count(&self, n_agents: usize) -> usize {
        n_agents
    }

    fn split(&self, batch: &MiniBatch) -> Result<Vec<AgentBatch>> {
        let (n_steps, n_envs, n_agents) = batch.masks.dim();
        let comm_mask = broadcast_env_mask(&batch.train_comm_mask, n_steps, 1);

        (0..n_agents)
            .map(|a| {
                Ok(AgentBatch {
                    module: a,
                    n_steps,
                    n_sequences: n_envs,
                    policy_input: flatten_features(agent_slice(&batch.policy_input, 2, a))?,
                    critic_input: flatten_features(agent_slice(&batch.critic_input, 2, a))?,
                    rnn_states: flatten_states(agent_slice(&batch.rnn_states, 1, a))?,
                    critic_rnn_states: flatten_states(agent_slice(&batch.critic_rnn_states, 1, a))?,
                    env_actions: flatten_features(agent_slice(&batch.env_actions, 2, a))?,
                    comm_actions: flatten_features(agent_slice(&batch.comm_actions, 2, a))?,
                    old_env_log_probs: flatten_features(agent_slice(&batch.env_log_probs, 2, a))?,
                    old_comm_log_probs: flatten_features(agent_slice(&batch.comm_log_probs, 2, a))?,
                    act_value_preds: flatten_scalars(agent_slice(&batch.act_value_preds, 2, a)),
                    comm_value_preds: flatten_scalars(agent_slice(&batch.comm_value_preds, 2, a)),
                    act_returns: flatten_scalars(agent_slice(&batch.act_returns, 2, a)),
                    comm_returns: flatten_scalars(agent_slice(&batch.comm_returns, 2, a)),
                    masks: flatten_scalars(agent_slice(&batch.masks, 2, a)),
                    act_advantages: flatten_scalars(agent_slice(&batch.act_advantages, 2, a)),
                    comm_advantages: flatten_scalars(agent_slice(&batch.comm_advantages, 2, a)),
                    comm_mask: comm_mask.clone(),
                })
            })
            .collect()
    }

    fn split_language(&self, sample: &LanguageSample) -> Result<Vec<LanguageBatch>> {
        let (n_steps, n_envs, n_agents) = sample.masks.dim();

        (0..n_agents)
            .map(|a| {
                let sentences = sample
                    .sentences
                    .iter()
                    .flat_map(|step| step.iter().map(move |env| env[a].clone()))
                    .collect();
                Ok(LanguageBatch {
                    module: a,
                    n_steps,
                    n_sequences: n_envs,
                    policy_input: flatten_features(agent_slice(&sample.policy_input, 2, a))?,
                    masks: flatten_scalars(agent_slice(&sample.masks, 2, a)),
                    rnn_states: flatten_states(agent_slice(&sample.rnn_states, 1, a))?,
                    sentences,
                })
            })
            .collect()
    }
}
