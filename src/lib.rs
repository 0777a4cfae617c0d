//! # acc-marl - Experience Buffer and Dual-Head PPO Trainer for Communicating Agents
//!
//! acc-marl stores recurrent multi-agent rollouts and trains policies that carry
//! two action heads: one acting in the environment and one emitting messages to
//! the other agents. Each head has its own critic, reward stream, return targets
//! and value normalizer.
//!
//! ## Key Features
//!
//! - **Experience buffer**: fixed-horizon storage over `(time, env, agent)` with an
//!   explicit fill / returns / consumed lifecycle
//! - **Two reward streams**: communication steps are credited with the next
//!   step's environment reward, then both streams go through GAE
//! - **Recurrent minibatches**: whole environments per minibatch so recurrent
//!   state can be replayed from the first step
//! - **Parameter sharing**: one module for all agents or one module per agent,
//!   selected through a [`buffer::BatchLayout`]
//! - **Masked communication training**: only environments that actually used
//!   learned communication train the communication head
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use acc_marl::buffer::{BufferDims, ExperienceBuffer};
//! use acc_marl::config::AccConfigBuilder;
//! use acc_marl::policy::linear::{LinearCommPolicy, LinearPolicyConfig};
//! use acc_marl::trainer::DualHeadTrainer;
//! use rand::SeedableRng;
//!
//! let config = AccConfigBuilder::new()
//!     .episode_length(32)
//!     .n_parallel_envs(4)
//!     .seed(0)
//!     .build()
//!     .unwrap();
//! let dims = BufferDims {
//!     n_agents: 2,
//!     policy_input_dim: 8,
//!     critic_input_dim: 16,
//!     env_act_dim: 1,
//!     comm_act_dim: 1,
//!     obs_dim: 8,
//! };
//! let mut buffer = ExperienceBuffer::new(&config, dims).unwrap();
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let policy = LinearCommPolicy::new(
//!     LinearPolicyConfig {
//!         policy_input_dim: 8,
//!         critic_input_dim: 16,
//!         ..LinearPolicyConfig::default()
//!     },
//!     &mut rng,
//! )
//! .unwrap();
//! let mut trainer = DualHeadTrainer::new(config, vec![policy]).unwrap();
//!
//! // ... insert_obs / insert_act for every step, then:
//! // trainer.compute_returns(&mut buffer, next_act_value, next_comm_value)?;
//! // let losses = trainer.train(&mut buffer, false, true, false, None)?;
//! ```
//!
//! ## Module Organization
//!
//! - [`buffer`] - Experience storage, return computation and minibatch generation
//! - [`config`] - Hyperparameters, builder and JSON loading
//! - [`error`] - Error types and result handling
//! - [`loss`] - Clipped PPO policy and value losses with their gradients
//! - [`normalizer`] - Streaming value normalization
//! - [`optimizer`] - SGD and gradient clipping used by the reference policy
//! - [`policy`] - Policy and language learner interfaces, plus a linear reference policy
//! - [`stats`] - NaN-aware statistics and advantage standardization
//! - [`trainer`] - The dual-head PPO trainer

pub mod buffer;
pub mod config;
pub mod error;
pub mod loss;
pub mod normalizer;
pub mod optimizer;
pub mod policy;
pub mod stats;
pub mod trainer;

pub use buffer::{ActStep, BufferDims, BufferPhase, ExperienceBuffer};
pub use config::{AccConfig, AccConfigBuilder, CommRewardShift};
pub use error::{AccError, Result};
pub use trainer::{DualHeadTrainer, TrainLosses};

#[cfg(test)]
mod tests;
