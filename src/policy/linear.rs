//! Memoryless linear-softmax policy with linear critics.
//!
//! Each head is a single dense layer, so gradients are exact and cheap. The
//! recurrent states handed in by the buffer are accepted and ignored. Both
//! action heads are categorical and store the chosen index as a single `f32`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};

use super::{ActionEvaluation, CommPolicy, EvaluationGradients};
use crate::buffer::AgentBatch;
use crate::error::{AccError, Result};
use crate::optimizer::{GradientClipper, Optimizer, Sgd};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearPolicyConfig {
    pub policy_input_dim: usize,
    pub critic_input_dim: usize,
    pub n_env_actions: usize,
    pub n_comm_actions: usize,
    /// Learning rate of both action heads
    pub lr: f32,
    pub critic_lr: f32,
    /// Multiplier applied to both learning rates during warmup
    pub warmup_factor: f32,
}

impl Default for LinearPolicyConfig {
    fn default() -> Self {
        LinearPolicyConfig {
            policy_input_dim: 1,
            critic_input_dim: 1,
            n_env_actions: 2,
            n_comm_actions: 2,
            lr: 5e-3,
            critic_lr: 5e-3,
            warmup_factor: 0.1,
        }
    }
}

/// A dense layer with its accumulated gradients
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenseHead {
    weights: Array2<f32>,
    bias: Array1<f32>,
    grad_weights: Array2<f32>,
    grad_bias: Array1<f32>,
}

impl DenseHead {
    fn new<R: Rng + ?Sized>(input: usize, output: usize, rng: &mut R) -> Self {
        // Xavier uniform
        let limit = (6.0 / (input + output) as f32).sqrt();
        DenseHead {
            weights: Array2::random_using((input, output), Uniform::new(-limit, limit), rng),
            bias: Array1::zeros(output),
            grad_weights: Array2::zeros((input, output)),
            grad_bias: Array1::zeros(output),
        }
    }

    fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weights) + &self.bias
    }

    fn accumulate(&mut self, x: ArrayView2<f32>, d_out: &Array2<f32>) {
        self.grad_weights += &x.t().dot(d_out);
        self.grad_bias += &d_out.sum_axis(Axis(0));
    }

    fn zero_grad(&mut self) {
        self.grad_weights.fill(0.0);
        self.grad_bias.fill(0.0);
    }
}

fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let lse = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - lse);
    }
    out
}

fn entropy(log_probs: &Array2<f32>) -> Array1<f32> {
    log_probs.map_axis(Axis(1), |row| -row.iter().map(|&lp| lp.exp() * lp).sum::<f32>())
}

/// Forward results of one categorical head kept for the backward pass
#[derive(Debug, Clone)]
struct CategoricalCache {
    log_probs: Array2<f32>,
    entropy: Array1<f32>,
    actions: Vec<usize>,
}

impl CategoricalCache {
    fn evaluate(logits: &Array2<f32>, actions: ArrayView2<f32>, head: &str) -> Result<Self> {
        let log_probs = log_softmax(logits);
        let n_choices = log_probs.ncols();
        let actions = actions
            .column(0)
            .iter()
            .map(|&a| {
                if !a.is_finite() || a.fract() != 0.0 {
                    return Err(AccError::Policy(format!(
                        "{} action {} is not a category index",
                        head, a
                    )));
                }
                let idx = a as usize;
                if a < 0.0 || idx >= n_choices {
                    Err(AccError::Policy(format!(
                        "{} action {} outside [0, {})",
                        head, a, n_choices
                    )))
                } else {
                    Ok(idx)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CategoricalCache {
            entropy: entropy(&log_probs),
            log_probs,
            actions,
        })
    }

    fn chosen_log_probs(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.actions.len(), 1), |(i, _)| {
            self.log_probs[[i, self.actions[i]]]
        })
    }

    /// Gradient with respect to the logits given gradients on the chosen
    /// log probability and on the entropy of every row
    fn logits_grad(&self, grad_log_prob: ArrayView1<f32>, grad_entropy: ArrayView1<f32>) -> Array2<f32> {
        let mut d_logits = Array2::zeros(self.log_probs.raw_dim());
        for (i, mut row) in d_logits.rows_mut().into_iter().enumerate() {
            let g = grad_log_prob[i];
            let h = grad_entropy[i];
            let ent = self.entropy[i];
            for (k, d) in row.iter_mut().enumerate() {
                let lp = self.log_probs[[i, k]];
                let p = lp.exp();
                let indicator = if k == self.actions[i] { 1.0 } else { 0.0 };
                *d = g * (indicator - p) - h * p * (lp + ent);
            }
        }
        d_logits
    }
}

#[derive(Debug, Clone)]
struct ForwardCache {
    policy_input: Array2<f32>,
    critic_input: Array2<f32>,
    env: CategoricalCache,
    comm: Option<CategoricalCache>,
}

/// Reference [`CommPolicy`]: one dense layer per head, trained with SGD.
#[derive(Debug, Clone)]
pub struct LinearCommPolicy {
    config: LinearPolicyConfig,
    env_actor: DenseHead,
    comm_actor: DenseHead,
    act_critic: DenseHead,
    comm_critic: DenseHead,
    optimizer: Sgd,
    warming_up: bool,
    last_grad_norm: f32,
    cache: Option<ForwardCache>,
}

impl LinearCommPolicy {
    pub fn new<R: Rng + ?Sized>(config: LinearPolicyConfig, rng: &mut R) -> Result<Self> {
        let sizes = [
            ("policy_input_dim", config.policy_input_dim),
            ("critic_input_dim", config.critic_input_dim),
            ("n_env_actions", config.n_env_actions),
            ("n_comm_actions", config.n_comm_actions),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(AccError::invalid_parameter(name, "must be greater than 0"));
            }
        }
        if config.lr <= 0.0 || config.critic_lr <= 0.0 {
            return Err(AccError::invalid_parameter("lr", "must be positive"));
        }

        Ok(LinearCommPolicy {
            env_actor: DenseHead::new(config.policy_input_dim, config.n_env_actions, rng),
            comm_actor: DenseHead::new(config.policy_input_dim, config.n_comm_actions, rng),
            act_critic: DenseHead::new(config.critic_input_dim, 1, rng),
            comm_critic: DenseHead::new(config.critic_input_dim, 1, rng),
            config,
            optimizer: Sgd::new(),
            warming_up: false,
            last_grad_norm: 0.0,
            cache: None,
        })
    }

    pub fn config(&self) -> &LinearPolicyConfig {
        &self.config
    }

    /// Global gradient norm seen by the last `step`, before clipping
    pub fn last_grad_norm(&self) -> f32 {
        self.last_grad_norm
    }

    fn lr_factor(&self) -> f32 {
        if self.warming_up {
            self.config.warmup_factor
        } else {
            1.0
        }
    }

    fn check_input(&self, what: &str, input: &ArrayView2<f32>, dim: usize) -> Result<()> {
        if input.ncols() != dim {
            return Err(AccError::shape_mismatch(what, &[input.nrows(), dim], input.shape()));
        }
        Ok(())
    }

    /// Samples both heads for a batch of rows.
    ///
    /// Returns `(env_actions, env_log_probs, comm_actions, comm_log_probs)`,
    /// each shaped `(rows, 1)`.
    pub fn act<R: Rng + ?Sized>(
        &self,
        policy_input: ArrayView2<f32>,
        rng: &mut R,
    ) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>, Array2<f32>)> {
        self.check_input("policy_input", &policy_input, self.config.policy_input_dim)?;
        let (env_actions, env_log_probs) =
            sample_categorical(&log_softmax(&self.env_actor.forward(policy_input)), rng)?;
        let (comm_actions, comm_log_probs) =
            sample_categorical(&log_softmax(&self.comm_actor.forward(policy_input)), rng)?;
        Ok((env_actions, env_log_probs, comm_actions, comm_log_probs))
    }

    /// Critic outputs `(act_values, comm_values)` for a batch of rows
    pub fn values(&self, critic_input: ArrayView2<f32>) -> Result<(Array1<f32>, Array1<f32>)> {
        self.check_input("critic_input", &critic_input, self.config.critic_input_dim)?;
        Ok((
            self.act_critic.forward(critic_input).column(0).to_owned(),
            self.comm_critic.forward(critic_input).column(0).to_owned(),
        ))
    }
}

fn sample_categorical<R: Rng + ?Sized>(
    log_probs: &Array2<f32>,
    rng: &mut R,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let rows = log_probs.nrows();
    let mut actions = Array2::zeros((rows, 1));
    let mut chosen = Array2::zeros((rows, 1));
    for (i, row) in log_probs.rows().into_iter().enumerate() {
        let dist = WeightedIndex::new(row.iter().map(|&lp| lp.exp()))
            .map_err(|e| AccError::Policy(format!("invalid action distribution: {}", e)))?;
        let a = dist.sample(rng);
        actions[[i, 0]] = a as f32;
        chosen[[i, 0]] = row[a];
    }
    Ok((actions, chosen))
}

impl CommPolicy for LinearCommPolicy {
    fn evaluate_actions(&mut self, batch: &AgentBatch, train_comm_head: bool) -> Result<ActionEvaluation> {
        let x = batch.policy_input.view();
        let xc = batch.critic_input.view();
        self.check_input("policy_input", &x, self.config.policy_input_dim)?;
        self.check_input("critic_input", &xc, self.config.critic_input_dim)?;
        let rows = x.nrows();

        let env = CategoricalCache::evaluate(&self.env_actor.forward(x), batch.env_actions.view(), "env")?;
        let comm = if train_comm_head {
            Some(CategoricalCache::evaluate(
                &self.comm_actor.forward(x),
                batch.comm_actions.view(),
                "comm",
            )?)
        } else {
            None
        };

        let (comm_log_probs, comm_entropy) = match &comm {
            Some(c) => (c.chosen_log_probs(), c.entropy.clone()),
            None => (Array2::zeros((rows, 1)), Array1::zeros(rows)),
        };
        let eval = ActionEvaluation {
            env_values: self.act_critic.forward(xc).column(0).to_owned(),
            comm_values: self.comm_critic.forward(xc).column(0).to_owned(),
            env_log_probs: env.chosen_log_probs(),
            env_entropy: env.entropy.clone(),
            comm_log_probs,
            comm_entropy,
        };

        self.cache = Some(ForwardCache {
            policy_input: x.to_owned(),
            critic_input: xc.to_owned(),
            env,
            comm,
        });
        Ok(eval)
    }

    fn get_comm_actions(
        &mut self,
        policy_input: ArrayView2<f32>,
        rnn_states: ArrayView3<f32>,
        masks: ArrayView1<f32>,
        n_steps: usize,
    ) -> Result<Array2<f32>> {
        self.check_input("policy_input", &policy_input, self.config.policy_input_dim)?;
        let expected = n_steps * rnn_states.len_of(Axis(0));
        if policy_input.nrows() != expected || masks.len() != expected {
            return Err(AccError::shape_mismatch(
                "comm_action_rows",
                &[expected],
                &[policy_input.nrows()],
            ));
        }
        Ok(log_softmax(&self.comm_actor.forward(policy_input)).mapv(f32::exp))
    }

    fn warmup_lr(&mut self, warmup: bool) {
        self.warming_up = warmup;
    }

    fn zero_grad(&mut self) {
        self.env_actor.zero_grad();
        self.comm_actor.zero_grad();
        self.act_critic.zero_grad();
        self.comm_critic.zero_grad();
    }

    fn backward(&mut self, grads: &EvaluationGradients) -> Result<()> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| AccError::Policy("backward called before evaluate_actions".to_string()))?;
        let rows = cache.policy_input.nrows();
        if grads.env_values.len() != rows || grads.env_log_probs.nrows() != rows {
            return Err(AccError::shape_mismatch(
                "gradient_rows",
                &[rows],
                &[grads.env_values.len()],
            ));
        }

        let d_env = cache
            .env
            .logits_grad(grads.env_log_probs.column(0), grads.env_entropy.view());
        self.env_actor.accumulate(cache.policy_input.view(), &d_env);

        if let Some(comm) = &cache.comm {
            let d_comm = comm.logits_grad(grads.comm_log_probs.column(0), grads.comm_entropy.view());
            self.comm_actor.accumulate(cache.policy_input.view(), &d_comm);
        }

        let d_act_value = grads.env_values.clone().insert_axis(Axis(1));
        let d_comm_value = grads.comm_values.clone().insert_axis(Axis(1));
        self.act_critic.accumulate(cache.critic_input.view(), &d_act_value);
        self.comm_critic.accumulate(cache.critic_input.view(), &d_comm_value);
        Ok(())
    }

    fn step(&mut self, max_grad_norm: f32) {
        let clipper = GradientClipper { max_norm: max_grad_norm };
        self.last_grad_norm = clipper.clip(
            &mut [
                &mut self.env_actor.grad_weights,
                &mut self.comm_actor.grad_weights,
                &mut self.act_critic.grad_weights,
                &mut self.comm_critic.grad_weights,
            ],
            &mut [
                &mut self.env_actor.grad_bias,
                &mut self.comm_actor.grad_bias,
                &mut self.act_critic.grad_bias,
                &mut self.comm_critic.grad_bias,
            ],
        );

        let factor = self.lr_factor();
        let actor_lr = self.config.lr * factor;
        let critic_lr = self.config.critic_lr * factor;
        for (head, lr) in [
            (&mut self.env_actor, actor_lr),
            (&mut self.comm_actor, actor_lr),
            (&mut self.act_critic, critic_lr),
            (&mut self.comm_critic, critic_lr),
        ] {
            self.optimizer.update_weights(&mut head.weights, &head.grad_weights, lr);
            self.optimizer.update_biases(&mut head.bias, &head.grad_bias, lr);
        }
    }
}
