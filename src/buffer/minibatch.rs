use ndarray::{s, Array1, Array3, Array4, Axis};
use tracing::warn;

use super::ExperienceBuffer;

/// A group of whole environments sliced out of the buffer.
///
/// Time-indexed arrays cover steps `[0, L)` and keep the `(time, env, agent, ...)`
/// axis order; recurrent states are taken at `t = 0` only and are shaped
/// `(env, agent, recurrent_n, hidden)`.
#[derive(Debug, Clone)]
pub struct MiniBatch {
    /// Buffer environment indices, in the order of the env axis
    pub env_ids: Vec<usize>,
    pub policy_input: Array4<f32>,
    pub critic_input: Array4<f32>,
    pub rnn_states: Array4<f32>,
    pub critic_rnn_states: Array4<f32>,
    pub env_actions: Array4<f32>,
    pub comm_actions: Array4<f32>,
    pub env_log_probs: Array4<f32>,
    pub comm_log_probs: Array4<f32>,
    pub act_value_preds: Array3<f32>,
    pub comm_value_preds: Array3<f32>,
    pub act_returns: Array3<f32>,
    pub comm_returns: Array3<f32>,
    pub masks: Array3<f32>,
    pub act_advantages: Array3<f32>,
    pub comm_advantages: Array3<f32>,
    /// Per-environment eligibility for communication-head training
    pub train_comm_mask: Array1<bool>,
}

/// Splits shuffled environment indices into `n_mini_batch` contiguous groups.
///
/// Groups differ in size by at most one so every environment lands in exactly
/// one group. With fewer environments than requested groups, each environment
/// becomes its own group.
pub fn partition_envs(env_ids: &[usize], n_mini_batch: usize) -> Vec<Vec<usize>> {
    let n_envs = env_ids.len();
    if n_envs == 0 {
        return Vec::new();
    }
    let groups = if n_envs < n_mini_batch {
        warn!(
            n_envs,
            n_mini_batch, "fewer environments than minibatches, using one environment per minibatch"
        );
        n_envs
    } else {
        n_mini_batch.max(1)
    };

    let base = n_envs / groups;
    let extra = n_envs % groups;
    let mut out = Vec::with_capacity(groups);
    let mut start = 0;
    for g in 0..groups {
        let size = base + usize::from(g < extra);
        out.push(env_ids[start..start + size].to_vec());
        start += size;
    }
    out
}

/// Lazy, single-pass sequence of recurrent minibatches.
///
/// Created by [`ExperienceBuffer::recurrent_minibatch_generator`]. Each call to
/// `next` slices one environment group out of the buffer.
pub struct RecurrentMiniBatches<'a> {
    buffer: &'a ExperienceBuffer,
    act_advantages: &'a Array3<f32>,
    comm_advantages: &'a Array3<f32>,
    train_comm_mask: &'a Array1<bool>,
    groups: std::vec::IntoIter<Vec<usize>>,
}

impl<'a> RecurrentMiniBatches<'a> {
    pub(crate) fn new(
        buffer: &'a ExperienceBuffer,
        act_advantages: &'a Array3<f32>,
        comm_advantages: &'a Array3<f32>,
        train_comm_mask: &'a Array1<bool>,
        groups: Vec<Vec<usize>>,
    ) -> Self {
        RecurrentMiniBatches {
            buffer,
            act_advantages,
            comm_advantages,
            train_comm_mask,
            groups: groups.into_iter(),
        }
    }

    fn slice_group(&self, ids: Vec<usize>) -> MiniBatch {
        let buf = self.buffer;
        let horizon = buf.episode_length;
        let steps4 = |a: &Array4<f32>| a.slice(s![..horizon, .., .., ..]).select(Axis(1), &ids);
        let steps3 = |a: &Array3<f32>| a.slice(s![..horizon, .., ..]).select(Axis(1), &ids);
        let first_state = |a: &ndarray::Array5<f32>| a.index_axis(Axis(0), 0).select(Axis(0), &ids);

        MiniBatch {
            policy_input: steps4(&buf.policy_input),
            critic_input: steps4(&buf.critic_input),
            rnn_states: first_state(&buf.rnn_states),
            critic_rnn_states: first_state(&buf.critic_rnn_states),
            env_actions: steps4(&buf.env_actions),
            comm_actions: steps4(&buf.comm_actions),
            env_log_probs: steps4(&buf.env_action_log_probs),
            comm_log_probs: steps4(&buf.comm_action_log_probs),
            act_value_preds: steps3(&buf.act_value_preds),
            comm_value_preds: steps3(&buf.comm_value_preds),
            act_returns: steps3(&buf.act_returns),
            comm_returns: steps3(&buf.comm_returns),
            masks: steps3(&buf.masks),
            act_advantages: self.act_advantages.select(Axis(1), &ids),
            comm_advantages: self.comm_advantages.select(Axis(1), &ids),
            train_comm_mask: self.train_comm_mask.select(Axis(0), &ids),
            env_ids: ids,
        }
    }
}

impl Iterator for RecurrentMiniBatches<'_> {
    type Item = MiniBatch;

    fn next(&mut self) -> Option<MiniBatch> {
        let ids = self.groups.next()?;
        Some(self.slice_group(ids))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.groups.size_hint()
    }
}

impl ExactSizeIterator for RecurrentMiniBatches<'_> {}
