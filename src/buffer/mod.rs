//! On-policy experience buffer for recurrent multi-agent rollouts.
//!
//! One [`ExperienceBuffer`] holds a single episode of `L` action steps for
//! every environment and agent. Time-indexed arrays carry `L+1` slots, the
//! last one holding the bootstrap state the next episode starts from.
//!
//! ```text
//! insert_obs ─► insert_act ─► ... ─► compute_returns ─► train ─► start_new_episode
//!   Filling ─────────────────────────► ReturnsComputed ─► Consumed ─► Filling
//! ```
//!
//! Every action step needs an observation for the same slot first, and
//! returns need the bootstrap observation at slot `L`.

pub mod language;
pub mod layout;
pub mod minibatch;
pub mod returns;

use ndarray::{
    s, Array1, Array3, Array4, Array5, ArrayView2, ArrayView3, ArrayView4, Axis, Dimension,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use language::{ContrastiveSample, LanguageBatch, LanguageSample, ParsedObs, Sentence};
pub use layout::{layout_for, AgentBatch, BatchLayout, PerAgentLayout, SharedLayout};
pub use minibatch::{partition_envs, MiniBatch, RecurrentMiniBatches};

use crate::config::{AccConfig, CommRewardShift};
use crate::error::{AccError, Result};
use crate::normalizer::ValueNormalizer;

/// Lifecycle of the data held by the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferPhase {
    /// Steps are being inserted
    Filling,
    /// Returns are ready, the buffer can be trained on once
    ReturnsComputed,
    /// A training pass has used the returns
    Consumed,
}

/// Sizes of the per-agent feature axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDims {
    pub n_agents: usize,
    pub policy_input_dim: usize,
    pub critic_input_dim: usize,
    pub env_act_dim: usize,
    pub comm_act_dim: usize,
    pub obs_dim: usize,
}

/// Everything produced by one action step, each shaped `(env, agent, ...)`.
#[derive(Debug, Clone, Copy)]
pub struct ActStep<'a> {
    /// `(env, agent, recurrent_n, hidden)`
    pub rnn_states: ArrayView4<'a, f32>,
    pub critic_rnn_states: ArrayView4<'a, f32>,
    pub env_actions: ArrayView3<'a, f32>,
    pub env_log_probs: ArrayView3<'a, f32>,
    pub comm_actions: ArrayView3<'a, f32>,
    pub comm_log_probs: ArrayView3<'a, f32>,
    pub act_values: ArrayView2<'a, f32>,
    pub comm_values: ArrayView2<'a, f32>,
    pub act_rewards: ArrayView2<'a, f32>,
    pub comm_rewards: ArrayView2<'a, f32>,
    pub masks: ArrayView2<'a, f32>,
}

/// Policy inputs at the current step
#[derive(Debug, Clone, Copy)]
pub struct ActParams<'a> {
    pub policy_input: ArrayView3<'a, f32>,
    pub critic_input: ArrayView3<'a, f32>,
    pub rnn_states: ArrayView4<'a, f32>,
    pub critic_rnn_states: ArrayView4<'a, f32>,
    pub masks: ArrayView2<'a, f32>,
}

fn check_shape(what: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(AccError::shape_mismatch(what, expected, actual));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ExperienceBuffer {
    episode_length: usize,
    n_parallel_envs: usize,
    hidden_dim: usize,
    recurrent_n: usize,
    gamma: f32,
    gae_lambda: f32,
    n_mini_batch: usize,
    comm_reward_shift: CommRewardShift,
    lang_capt_batch_size: usize,
    lang_clip_batch_size: usize,
    lang_clip_n_mini_batch: usize,
    dims: BufferDims,
    layout: Box<dyn BatchLayout>,

    policy_input: Array4<f32>,
    critic_input: Array4<f32>,
    obs: Array4<f32>,
    parsed_obs: Vec<Option<ParsedObs>>,
    rnn_states: Array5<f32>,
    critic_rnn_states: Array5<f32>,

    env_actions: Array4<f32>,
    env_action_log_probs: Array4<f32>,
    comm_actions: Array4<f32>,
    comm_action_log_probs: Array4<f32>,

    act_value_preds: Array3<f32>,
    comm_value_preds: Array3<f32>,
    act_returns: Array3<f32>,
    comm_returns: Array3<f32>,
    act_rewards: Array3<f32>,
    comm_rewards: Array3<f32>,
    masks: Array3<f32>,

    step: usize,
    /// Whether slot `step` holds an observation from this episode
    obs_ready: bool,
    phase: BufferPhase,
}

impl ExperienceBuffer {
    pub fn new(config: &AccConfig, dims: BufferDims) -> Result<Self> {
        config.validate()?;
        if dims.n_agents == 0 {
            return Err(AccError::invalid_parameter("n_agents", "must be greater than 0"));
        }

        let l = config.episode_length;
        let e = config.n_parallel_envs;
        let a = dims.n_agents;
        let n = config.policy_recurrent_n;
        let h = config.hidden_dim;

        Ok(ExperienceBuffer {
            episode_length: l,
            n_parallel_envs: e,
            hidden_dim: h,
            recurrent_n: n,
            gamma: config.gamma,
            gae_lambda: config.gae_lambda,
            n_mini_batch: config.n_mini_batch,
            comm_reward_shift: config.comm_reward_shift,
            lang_capt_batch_size: config.lang_capt_batch_size,
            lang_clip_batch_size: config.lang_clip_batch_size,
            lang_clip_n_mini_batch: config.lang_clip_n_mini_batch,
            dims,
            layout: layout_for(config.share_params),

            policy_input: Array4::zeros((l + 1, e, a, dims.policy_input_dim)),
            critic_input: Array4::zeros((l + 1, e, a, dims.critic_input_dim)),
            obs: Array4::zeros((l + 1, e, a, dims.obs_dim)),
            parsed_obs: vec![None; l + 1],
            rnn_states: Array5::zeros((l + 1, e, a, n, h)),
            critic_rnn_states: Array5::zeros((l + 1, e, a, n, h)),

            env_actions: Array4::zeros((l, e, a, dims.env_act_dim)),
            env_action_log_probs: Array4::zeros((l, e, a, dims.env_act_dim)),
            comm_actions: Array4::zeros((l, e, a, dims.comm_act_dim)),
            comm_action_log_probs: Array4::zeros((l, e, a, dims.comm_act_dim)),

            act_value_preds: Array3::zeros((l + 1, e, a)),
            comm_value_preds: Array3::zeros((l + 1, e, a)),
            act_returns: Array3::zeros((l + 1, e, a)),
            comm_returns: Array3::zeros((l + 1, e, a)),
            act_rewards: Array3::zeros((l, e, a)),
            comm_rewards: Array3::zeros((l, e, a)),
            masks: Array3::ones((l + 1, e, a)),

            step: 0,
            obs_ready: false,
            phase: BufferPhase::Filling,
        })
    }

    fn expect_phase(&self, expected: BufferPhase, operation: &'static str) -> Result<()> {
        if self.phase != expected {
            return Err(AccError::InvalidPhase {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn agent_shape(&self) -> [usize; 2] {
        [self.n_parallel_envs, self.dims.n_agents]
    }

    fn features_shape(&self, dim: usize) -> [usize; 3] {
        [self.n_parallel_envs, self.dims.n_agents, dim]
    }

    fn state_shape(&self) -> [usize; 4] {
        [
            self.n_parallel_envs,
            self.dims.n_agents,
            self.recurrent_n,
            self.hidden_dim,
        ]
    }

    /// Stores the observation-derived inputs for the current step.
    ///
    /// Does not advance the step counter. Writing at step `L` fills the
    /// bootstrap slot.
    pub fn insert_obs(
        &mut self,
        policy_input: ArrayView3<f32>,
        critic_input: ArrayView3<f32>,
        obs: ArrayView3<f32>,
        parsed_obs: ParsedObs,
    ) -> Result<()> {
        self.expect_phase(BufferPhase::Filling, "insert observations")?;
        check_shape(
            "policy_input",
            &self.features_shape(self.dims.policy_input_dim),
            policy_input.shape(),
        )?;
        check_shape(
            "critic_input",
            &self.features_shape(self.dims.critic_input_dim),
            critic_input.shape(),
        )?;
        check_shape("obs", &self.features_shape(self.dims.obs_dim), obs.shape())?;
        let parsed_agents = parsed_obs.first().map_or(0, |env| env.len());
        if parsed_obs.len() != self.n_parallel_envs
            || parsed_obs.iter().any(|env| env.len() != self.dims.n_agents)
        {
            return Err(AccError::shape_mismatch(
                "parsed_obs",
                &self.agent_shape(),
                &[parsed_obs.len(), parsed_agents],
            ));
        }

        let t = self.step;
        self.policy_input.index_axis_mut(Axis(0), t).assign(&policy_input);
        self.critic_input.index_axis_mut(Axis(0), t).assign(&critic_input);
        self.obs.index_axis_mut(Axis(0), t).assign(&obs);
        self.parsed_obs[t] = Some(parsed_obs);
        self.obs_ready = true;
        Ok(())
    }

    /// Stores the outcome of one action step and advances the step counter.
    ///
    /// Recurrent states and masks describe the state after the action and go
    /// to slot `step + 1`; everything else goes to slot `step`.
    pub fn insert_act(&mut self, act: ActStep<'_>) -> Result<()> {
        self.expect_phase(BufferPhase::Filling, "insert actions")?;
        if self.step >= self.episode_length {
            return Err(AccError::BufferOverrun {
                horizon: self.episode_length,
            });
        }
        if !self.obs_ready {
            return Err(AccError::InvalidPhase {
                operation: "insert actions before observing the step",
                phase: self.phase,
            });
        }

        let state = self.state_shape();
        let scalar = self.agent_shape();
        check_shape("rnn_states", &state, act.rnn_states.shape())?;
        check_shape("critic_rnn_states", &state, act.critic_rnn_states.shape())?;
        let env_act = self.features_shape(self.dims.env_act_dim);
        let comm_act = self.features_shape(self.dims.comm_act_dim);
        check_shape("env_actions", &env_act, act.env_actions.shape())?;
        check_shape("env_log_probs", &env_act, act.env_log_probs.shape())?;
        check_shape("comm_actions", &comm_act, act.comm_actions.shape())?;
        check_shape("comm_log_probs", &comm_act, act.comm_log_probs.shape())?;
        check_shape("act_values", &scalar, act.act_values.shape())?;
        check_shape("comm_values", &scalar, act.comm_values.shape())?;
        check_shape("act_rewards", &scalar, act.act_rewards.shape())?;
        check_shape("comm_rewards", &scalar, act.comm_rewards.shape())?;
        check_shape("masks", &scalar, act.masks.shape())?;

        let t = self.step;
        self.rnn_states.index_axis_mut(Axis(0), t + 1).assign(&act.rnn_states);
        self.critic_rnn_states
            .index_axis_mut(Axis(0), t + 1)
            .assign(&act.critic_rnn_states);
        self.env_actions.index_axis_mut(Axis(0), t).assign(&act.env_actions);
        self.env_action_log_probs
            .index_axis_mut(Axis(0), t)
            .assign(&act.env_log_probs);
        self.comm_actions.index_axis_mut(Axis(0), t).assign(&act.comm_actions);
        self.comm_action_log_probs
            .index_axis_mut(Axis(0), t)
            .assign(&act.comm_log_probs);
        self.act_value_preds.index_axis_mut(Axis(0), t).assign(&act.act_values);
        self.comm_value_preds.index_axis_mut(Axis(0), t).assign(&act.comm_values);
        self.act_rewards.index_axis_mut(Axis(0), t).assign(&act.act_rewards);
        self.comm_rewards.index_axis_mut(Axis(0), t).assign(&act.comm_rewards);
        self.masks.index_axis_mut(Axis(0), t + 1).assign(&act.masks);

        self.step += 1;
        self.obs_ready = false;
        Ok(())
    }

    /// Inputs the rollout loop feeds the policy to choose the next action
    pub fn get_act_params(&self) -> ActParams<'_> {
        let t = self.step;
        ActParams {
            policy_input: self.policy_input.index_axis(Axis(0), t),
            critic_input: self.critic_input.index_axis(Axis(0), t),
            rnn_states: self.rnn_states.index_axis(Axis(0), t),
            critic_rnn_states: self.critic_rnn_states.index_axis(Axis(0), t),
            masks: self.masks.index_axis(Axis(0), t),
        }
    }

    /// Computes return targets for both reward streams.
    ///
    /// `next_act_value` and `next_comm_value` are the critic outputs for the
    /// bootstrap state, shaped `(env, agent)` and expressed in the normalized
    /// space like every stored value prediction. The communication rewards are
    /// credited with the next step's environment reward before the GAE pass.
    pub fn compute_returns<N: ValueNormalizer>(
        &mut self,
        next_act_value: ArrayView2<f32>,
        next_comm_value: ArrayView2<f32>,
        act_normalizer: &N,
        comm_normalizer: &N,
    ) -> Result<()> {
        self.expect_phase(BufferPhase::Filling, "compute returns")?;
        if self.step != self.episode_length {
            return Err(AccError::IncompleteEpisode {
                step: self.step,
                horizon: self.episode_length,
            });
        }
        if !self.obs_ready {
            return Err(AccError::InvalidPhase {
                operation: "compute returns before observing the bootstrap step",
                phase: self.phase,
            });
        }
        let scalar = self.agent_shape();
        check_shape("next_act_value", &scalar, next_act_value.shape())?;
        check_shape("next_comm_value", &scalar, next_comm_value.shape())?;

        let l = self.episode_length;
        self.act_value_preds.index_axis_mut(Axis(0), l).assign(&next_act_value);
        self.comm_value_preds
            .index_axis_mut(Axis(0), l)
            .assign(&next_comm_value);

        returns::shift_comm_rewards(
            self.comm_rewards.view_mut(),
            self.act_rewards.view(),
            self.masks.view(),
            self.comm_reward_shift,
        );

        let act_values = act_normalizer.denormalize(&self.act_value_preds);
        let comm_values = comm_normalizer.denormalize(&self.comm_value_preds);
        self.act_returns = returns::gae_returns(
            self.act_rewards.view(),
            act_values.view(),
            self.masks.view(),
            self.gamma,
            self.gae_lambda,
        );
        self.comm_returns = returns::gae_returns(
            self.comm_rewards.view(),
            comm_values.view(),
            self.masks.view(),
            self.gamma,
            self.gae_lambda,
        );

        debug!(
            horizon = l,
            shift = ?self.comm_reward_shift,
            "computed returns for both reward streams"
        );
        self.phase = BufferPhase::ReturnsComputed;
        Ok(())
    }

    /// Zeroes every array, sets masks to 1 and forgets parsed observations.
    pub fn reset_episode(&mut self) {
        self.policy_input.fill(0.0);
        self.critic_input.fill(0.0);
        self.obs.fill(0.0);
        self.parsed_obs.iter_mut().for_each(|p| *p = None);
        self.rnn_states.fill(0.0);
        self.critic_rnn_states.fill(0.0);
        self.env_actions.fill(0.0);
        self.env_action_log_probs.fill(0.0);
        self.comm_actions.fill(0.0);
        self.comm_action_log_probs.fill(0.0);
        self.act_value_preds.fill(0.0);
        self.comm_value_preds.fill(0.0);
        self.act_returns.fill(0.0);
        self.comm_returns.fill(0.0);
        self.act_rewards.fill(0.0);
        self.comm_rewards.fill(0.0);
        self.masks.fill(1.0);
        self.step = 0;
        self.obs_ready = false;
        self.phase = BufferPhase::Filling;
    }

    /// Carries the bootstrap slot over to slot 0 and rewinds the step counter.
    ///
    /// Only a trained episode can be rolled over. Use
    /// [`ExperienceBuffer::reset_episode`] to discard one instead.
    pub fn start_new_episode(&mut self) -> Result<()> {
        if self.step != self.episode_length {
            return Err(AccError::IncompleteEpisode {
                step: self.step,
                horizon: self.episode_length,
            });
        }
        self.expect_phase(BufferPhase::Consumed, "start a new episode")?;
        let l = self.episode_length;

        fn carry<D: Dimension + ndarray::RemoveAxis>(a: &mut ndarray::Array<f32, D>, l: usize) {
            let last = a.index_axis(Axis(0), l).to_owned();
            a.index_axis_mut(Axis(0), 0).assign(&last);
        }
        carry(&mut self.policy_input, l);
        carry(&mut self.critic_input, l);
        carry(&mut self.obs, l);
        carry(&mut self.rnn_states, l);
        carry(&mut self.critic_rnn_states, l);
        carry(&mut self.masks, l);

        let last_parsed = self.parsed_obs[l].take();
        self.parsed_obs.iter_mut().for_each(|p| *p = None);
        self.parsed_obs[0] = last_parsed;

        self.step = 0;
        self.obs_ready = true;
        self.phase = BufferPhase::Filling;
        Ok(())
    }

    /// Lazily yields minibatches of whole environments.
    ///
    /// Environment indices are shuffled and split into `n_mini_batch` groups;
    /// advantages are `(L, env, agent)` and `train_comm_mask` has one flag per
    /// environment.
    pub fn recurrent_minibatch_generator<'a, R: Rng + ?Sized>(
        &'a self,
        act_advantages: &'a Array3<f32>,
        comm_advantages: &'a Array3<f32>,
        train_comm_mask: &'a Array1<bool>,
        rng: &mut R,
    ) -> Result<RecurrentMiniBatches<'a>> {
        self.expect_phase(BufferPhase::ReturnsComputed, "sample minibatches")?;
        let adv_shape = [self.episode_length, self.n_parallel_envs, self.dims.n_agents];
        check_shape("act_advantages", &adv_shape, act_advantages.shape())?;
        check_shape("comm_advantages", &adv_shape, comm_advantages.shape())?;
        check_shape(
            "train_comm_mask",
            &[self.n_parallel_envs],
            train_comm_mask.shape(),
        )?;

        let mut env_ids: Vec<usize> = (0..self.n_parallel_envs).collect();
        env_ids.shuffle(rng);
        let groups = partition_envs(&env_ids, self.n_mini_batch);

        Ok(RecurrentMiniBatches::new(
            self,
            act_advantages,
            comm_advantages,
            train_comm_mask,
            groups,
        ))
    }

    /// Samples environments for language training and lays them out per module
    pub fn language_batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<LanguageBatch>> {
        let sample = self.sample_language(rng)?;
        self.layout.split_language(&sample)
    }

    pub(crate) fn mark_consumed(&mut self) {
        self.phase = BufferPhase::Consumed;
    }

    pub fn phase(&self) -> BufferPhase {
        self.phase
    }

    /// Number of action steps inserted so far
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn episode_length(&self) -> usize {
        self.episode_length
    }

    pub fn n_parallel_envs(&self) -> usize {
        self.n_parallel_envs
    }

    pub fn n_agents(&self) -> usize {
        self.dims.n_agents
    }

    pub fn recurrent_n(&self) -> usize {
        self.recurrent_n
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn dims(&self) -> BufferDims {
        self.dims
    }

    pub fn layout(&self) -> &dyn BatchLayout {
        self.layout.as_ref()
    }

    pub fn act_value_preds(&self) -> &Array3<f32> {
        &self.act_value_preds
    }

    pub fn comm_value_preds(&self) -> &Array3<f32> {
        &self.comm_value_preds
    }

    pub fn act_returns(&self) -> &Array3<f32> {
        &self.act_returns
    }

    pub fn comm_returns(&self) -> &Array3<f32> {
        &self.comm_returns
    }

    pub fn act_rewards(&self) -> &Array3<f32> {
        &self.act_rewards
    }

    /// Communication rewards, including the next-step credit once returns are computed
    pub fn comm_rewards(&self) -> &Array3<f32> {
        &self.comm_rewards
    }

    pub fn masks(&self) -> &Array3<f32> {
        &self.masks
    }

    pub fn policy_input(&self) -> &Array4<f32> {
        &self.policy_input
    }

    pub fn obs(&self) -> &Array4<f32> {
        &self.obs
    }

    pub fn rnn_states(&self) -> &Array5<f32> {
        &self.rnn_states
    }

    pub fn parsed_obs(&self, t: usize) -> Option<&ParsedObs> {
        self.parsed_obs.get(t).and_then(|p| p.as_ref())
    }

    /// Stored value predictions for steps `[0, L)`
    pub(crate) fn value_preds_in_horizon(&self) -> (ArrayView3<'_, f32>, ArrayView3<'_, f32>) {
        let l = self.episode_length;
        (
            self.act_value_preds.slice(s![..l, .., ..]),
            self.comm_value_preds.slice(s![..l, .., ..]),
        )
    }

    /// Return targets for steps `[0, L)`
    pub(crate) fn returns_in_horizon(&self) -> (ArrayView3<'_, f32>, ArrayView3<'_, f32>) {
        let l = self.episode_length;
        (
            self.act_returns.slice(s![..l, .., ..]),
            self.comm_returns.slice(s![..l, .., ..]),
        )
    }
}
