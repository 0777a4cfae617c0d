pub mod test_trainer;

use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3};

use crate::buffer::{ActStep, AgentBatch, BufferDims, ExperienceBuffer, LanguageBatch, ParsedObs};
use crate::config::AccConfig;
use crate::error::Result;
use crate::policy::{
    ActionEvaluation, CommPolicy, EvaluationGradients, LanguageLearner, LanguageLosses,
};

pub fn config(episode_length: usize, n_envs: usize, share_params: bool) -> AccConfig {
    AccConfig {
        episode_length,
        n_parallel_envs: n_envs,
        hidden_dim: 2,
        ppo_epoch: 2,
        n_mini_batch: 2,
        share_params,
        lang_capt_batch_size: 2,
        lang_clip_batch_size: 4,
        seed: Some(11),
        ..AccConfig::default()
    }
}

pub fn dims(n_agents: usize) -> BufferDims {
    BufferDims {
        n_agents,
        policy_input_dim: 2,
        critic_input_dim: 3,
        env_act_dim: 1,
        comm_act_dim: 1,
        obs_dim: 2,
    }
}

pub fn parsed(n_envs: usize, n_agents: usize, t: usize) -> ParsedObs {
    (0..n_envs)
        .map(|e| {
            (0..n_agents)
                .map(|a| vec![format!("t{}", t), format!("e{}", e), format!("a{}", a)])
                .collect()
        })
        .collect()
}

/// Per-step data for [`fill_episode`], each shaped `(L, env, agent)`
pub struct Episode {
    pub act_rewards: Array3<f32>,
    pub comm_rewards: Array3<f32>,
    pub act_values: Array3<f32>,
    pub comm_values: Array3<f32>,
    /// Mask written after step `t`, i.e. `masks[t + 1]` in the buffer
    pub next_masks: Array3<f32>,
}

impl Episode {
    pub fn constant(buffer: &ExperienceBuffer, reward: f32) -> Self {
        let shape = (buffer.episode_length(), buffer.n_parallel_envs(), buffer.n_agents());
        Episode {
            act_rewards: Array3::from_elem(shape, reward),
            comm_rewards: Array3::zeros(shape),
            act_values: Array3::zeros(shape),
            comm_values: Array3::zeros(shape),
            next_masks: Array3::ones(shape),
        }
    }
}

/// Inserts a full horizon of observations and actions, plus the bootstrap observation
/// Inserts the synthetic observation `fill_episode` uses for step `t`
pub fn observe(buffer: &mut ExperienceBuffer, t: usize) -> Result<()> {
    let (e, a) = (buffer.n_parallel_envs(), buffer.n_agents());
    let d = buffer.dims();
    let policy_input = Array3::from_shape_fn((e, a, d.policy_input_dim), |(ei, ai, k)| {
        (t as f32 * 0.1) + ei as f32 * 0.01 - ai as f32 * 0.02 + k as f32 * 0.05
    });
    let critic_input = Array3::from_shape_fn((e, a, d.critic_input_dim), |(ei, _, k)| {
        (t + ei + k) as f32 * 0.1
    });
    let obs = Array3::from_elem((e, a, d.obs_dim), t as f32);
    buffer.insert_obs(policy_input.view(), critic_input.view(), obs.view(), parsed(e, a, t))
}

/// Inserts an all-zero action step with correctly shaped arrays
pub fn insert_zero_act(buffer: &mut ExperienceBuffer) -> Result<()> {
    let (e, a) = (buffer.n_parallel_envs(), buffer.n_agents());
    let d = buffer.dims();
    let states = Array4::zeros((e, a, buffer.recurrent_n(), buffer.hidden_dim()));
    let env_act = Array3::zeros((e, a, d.env_act_dim));
    let comm_act = Array3::zeros((e, a, d.comm_act_dim));
    let scalar = Array2::zeros((e, a));
    let masks = Array2::ones((e, a));
    buffer.insert_act(ActStep {
        rnn_states: states.view(),
        critic_rnn_states: states.view(),
        env_actions: env_act.view(),
        env_log_probs: env_act.view(),
        comm_actions: comm_act.view(),
        comm_log_probs: comm_act.view(),
        act_values: scalar.view(),
        comm_values: scalar.view(),
        act_rewards: scalar.view(),
        comm_rewards: scalar.view(),
        masks: masks.view(),
    })
}

pub fn fill_episode(buffer: &mut ExperienceBuffer, episode: &Episode) {
    let (l, e, a) = (buffer.episode_length(), buffer.n_parallel_envs(), buffer.n_agents());
    for t in 0..=l {
        observe(buffer, t).unwrap();
        if t == l {
            break;
        }

        let states = Array4::from_elem((e, a, buffer.recurrent_n(), buffer.hidden_dim()), t as f32);
        let actions = Array3::from_shape_fn((e, a, 1), |(ei, ai, _)| ((t + ei + ai) % 2) as f32);
        let log_probs = Array3::from_elem((e, a, 1), (0.5f32).ln());
        buffer
            .insert_act(ActStep {
                rnn_states: states.view(),
                critic_rnn_states: states.view(),
                env_actions: actions.view(),
                env_log_probs: log_probs.view(),
                comm_actions: actions.view(),
                comm_log_probs: log_probs.view(),
                act_values: episode.act_values.index_axis(ndarray::Axis(0), t),
                comm_values: episode.comm_values.index_axis(ndarray::Axis(0), t),
                act_rewards: episode.act_rewards.index_axis(ndarray::Axis(0), t),
                comm_rewards: episode.comm_rewards.index_axis(ndarray::Axis(0), t),
                masks: episode.next_masks.index_axis(ndarray::Axis(0), t),
            })
            .unwrap();
    }
}

/// Policy that reproduces the stored log probabilities and records what it is asked to do
#[derive(Debug, Default)]
pub struct RecordingPolicy {
    pub evaluated_rows: Vec<usize>,
    pub comm_rows: Vec<usize>,
    pub warmup: Option<bool>,
    pub steps: usize,
    pub last_grads: Option<EvaluationGradients>,
    pub value: f32,
}

impl CommPolicy for RecordingPolicy {
    fn evaluate_actions(&mut self, batch: &AgentBatch, _train_comm_head: bool) -> Result<ActionEvaluation> {
        let rows = batch.len();
        self.evaluated_rows.push(rows);
        self.comm_rows.push(batch.comm_rows());
        Ok(ActionEvaluation {
            env_values: Array1::from_elem(rows, self.value),
            comm_values: Array1::from_elem(rows, self.value),
            env_log_probs: batch.old_env_log_probs.clone(),
            env_entropy: Array1::from_elem(rows, 0.5),
            comm_log_probs: batch.old_comm_log_probs.clone(),
            comm_entropy: Array1::from_elem(rows, 0.5),
        })
    }

    fn get_comm_actions(
        &mut self,
        policy_input: ArrayView2<f32>,
        _rnn_states: ArrayView3<f32>,
        _masks: ArrayView1<f32>,
        _n_steps: usize,
    ) -> Result<Array2<f32>> {
        Ok(policy_input.to_owned())
    }

    fn warmup_lr(&mut self, warmup: bool) {
        self.warmup = Some(warmup);
    }

    fn zero_grad(&mut self) {
        self.last_grads = None;
    }

    fn backward(&mut self, grads: &EvaluationGradients) -> Result<()> {
        self.last_grads = Some(grads.clone());
        Ok(())
    }

    fn step(&mut self, _max_grad_norm: f32) {
        self.steps += 1;
    }
}

/// Language learner returning fixed losses and remembering batch sizes
#[derive(Debug, Default)]
pub struct CountingLearner {
    pub batches: std::rc::Rc<std::cell::RefCell<Vec<(usize, usize)>>>,
}

impl<P: CommPolicy> LanguageLearner<P> for CountingLearner {
    fn train_language(&mut self, policy: &mut P, batch: &LanguageBatch) -> Result<LanguageLosses> {
        let comm = policy.get_comm_actions(
            batch.policy_input.view(),
            batch.rnn_states.view(),
            batch.masks.view(),
            batch.n_steps,
        )?;
        self.batches.borrow_mut().push((batch.module, comm.nrows()));
        assert_eq!(batch.sentences.len(), comm.nrows());
        Ok(LanguageLosses {
            capt_loss: 2.0,
            clip_loss: 1.0,
            mean_sim: 0.5,
        })
    }
}
