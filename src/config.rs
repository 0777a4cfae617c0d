use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AccError, Result};

/// How the communication reward is credited with the next step's environment reward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommRewardShift {
    /// `comm_reward[t] += env_reward[t+1]` regardless of termination
    #[default]
    Unmasked,
    /// `comm_reward[t] += env_reward[t+1] * mask[t+1]`
    Masked,
}

/// Hyperparameters shared by the experience buffer and the dual-head trainer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccConfig {
    /// Number of action steps stored per episode (`L`)
    pub episode_length: usize,
    /// Number of environments stepped in lockstep
    pub n_parallel_envs: usize,
    /// Hidden size of the recurrent policy and critic
    pub hidden_dim: usize,
    /// Number of stacked recurrent layers
    pub policy_recurrent_n: usize,
    /// Discount factor
    pub gamma: f32,
    /// GAE lambda parameter
    pub gae_lambda: f32,
    /// Clipping parameter for both the PPO ratio and the value prediction
    pub clip_param: f32,
    /// Number of passes over the buffer per training call
    pub ppo_epoch: usize,
    /// Number of minibatches per pass
    pub n_mini_batch: usize,
    /// Weight of the value losses in the combined loss
    pub value_loss_coef: f32,
    /// Entropy bonus coefficient
    pub entropy_coef: f32,
    /// Maximum global gradient norm handed to the policy's optimizer step
    pub max_grad_norm: f32,
    /// Huber loss threshold for the value losses
    pub huber_delta: f32,
    /// Train one module on all agents instead of one module per agent
    pub share_params: bool,
    /// Number of language updates per training call
    pub lang_n_epochs: usize,
    /// Number of environments sampled for captioning batches
    pub lang_capt_batch_size: usize,
    /// Rows per contrastive minibatch
    pub lang_clip_batch_size: usize,
    /// Maximum number of contrastive minibatches
    pub lang_clip_n_mini_batch: usize,
    /// Credit rule for communication rewards
    pub comm_reward_shift: CommRewardShift,
    /// Seed for minibatch shuffling and language sampling
    pub seed: Option<u64>,
}

impl Default for AccConfig {
    fn default() -> Self {
        AccConfig {
            episode_length: 100,
            n_parallel_envs: 8,
            hidden_dim: 64,
            policy_recurrent_n: 1,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip_param: 0.2,
            ppo_epoch: 15,
            n_mini_batch: 2,
            value_loss_coef: 1.0,
            entropy_coef: 0.01,
            max_grad_norm: 10.0,
            huber_delta: 10.0,
            share_params: true,
            lang_n_epochs: 1,
            lang_capt_batch_size: 100,
            lang_clip_batch_size: 256,
            lang_clip_n_mini_batch: 2,
            comm_reward_shift: CommRewardShift::Unmasked,
            seed: None,
        }
    }
}

impl AccConfig {
    /// Check every value the buffer and trainer rely on
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("episode_length", self.episode_length),
            ("n_parallel_envs", self.n_parallel_envs),
            ("hidden_dim", self.hidden_dim),
            ("policy_recurrent_n", self.policy_recurrent_n),
            ("ppo_epoch", self.ppo_epoch),
            ("n_mini_batch", self.n_mini_batch),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AccError::invalid_parameter(name, "must be greater than 0"));
            }
        }

        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(AccError::invalid_parameter("gamma", "must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(AccError::invalid_parameter("gae_lambda", "must lie in [0, 1]"));
        }
        if self.clip_param <= 0.0 {
            return Err(AccError::invalid_parameter("clip_param", "must be positive"));
        }
        if self.huber_delta <= 0.0 {
            return Err(AccError::invalid_parameter("huber_delta", "must be positive"));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(AccError::invalid_parameter("max_grad_norm", "must be positive"));
        }
        if self.value_loss_coef < 0.0 || self.entropy_coef < 0.0 {
            return Err(AccError::invalid_parameter(
                "loss coefficients",
                "must be non-negative",
            ));
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields fall back to their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AccConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

/// Builder for [`AccConfig`]
pub struct AccConfigBuilder {
    config: AccConfig,
}

impl AccConfigBuilder {
    pub fn new() -> Self {
        AccConfigBuilder {
            config: AccConfig::default(),
        }
    }

    pub fn episode_length(mut self, length: usize) -> Self {
        self.config.episode_length = length;
        self
    }

    pub fn n_parallel_envs(mut self, n: usize) -> Self {
        self.config.n_parallel_envs = n;
        self
    }

    pub fn hidden_dim(mut self, dim: usize) -> Self {
        self.config.hidden_dim = dim;
        self
    }

    pub fn policy_recurrent_n(mut self, n: usize) -> Self {
        self.config.policy_recurrent_n = n;
        self
    }

    pub fn gamma(mut self, gamma: f32) -> Self {
        self.config.gamma = gamma;
        self
    }

    pub fn gae_lambda(mut self, lambda: f32) -> Self {
        self.config.gae_lambda = lambda;
        self
    }

    pub fn clip_param(mut self, clip: f32) -> Self {
        self.config.clip_param = clip;
        self
    }

    pub fn ppo_epoch(mut self, epochs: usize) -> Self {
        self.config.ppo_epoch = epochs;
        self
    }

    pub fn n_mini_batch(mut self, n: usize) -> Self {
        self.config.n_mini_batch = n;
        self
    }

    pub fn value_loss_coef(mut self, coef: f32) -> Self {
        self.config.value_loss_coef = coef;
        self
    }

    pub fn entropy_coef(mut self, coef: f32) -> Self {
        self.config.entropy_coef = coef;
        self
    }

    pub fn max_grad_norm(mut self, norm: f32) -> Self {
        self.config.max_grad_norm = norm;
        self
    }

    pub fn huber_delta(mut self, delta: f32) -> Self {
        self.config.huber_delta = delta;
        self
    }

    pub fn share_params(mut self, share: bool) -> Self {
        self.config.share_params = share;
        self
    }

    pub fn lang_n_epochs(mut self, epochs: usize) -> Self {
        self.config.lang_n_epochs = epochs;
        self
    }

    pub fn lang_capt_batch_size(mut self, size: usize) -> Self {
        self.config.lang_capt_batch_size = size;
        self
    }

    pub fn lang_clip_batch_size(mut self, size: usize) -> Self {
        self.config.lang_clip_batch_size = size;
        self
    }

    pub fn lang_clip_n_mini_batch(mut self, n: usize) -> Self {
        self.config.lang_clip_n_mini_batch = n;
        self
    }

    pub fn comm_reward_shift(mut self, shift: CommRewardShift) -> Self {
        self.config.comm_reward_shift = shift;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<AccConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for AccConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
