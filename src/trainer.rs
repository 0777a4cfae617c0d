//! Dual-head PPO trainer.
//!
//! One `train` call runs `ppo_epoch` passes over the buffer. Every pass draws
//! fresh minibatches of whole environments, splits them per policy module
//! through the buffer's [`BatchLayout`](crate::buffer::BatchLayout), and
//! performs one optimizer step per module and minibatch.

use ndarray::{Array1, Array3, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::{AgentBatch, BufferPhase, ExperienceBuffer};
use crate::config::AccConfig;
use crate::error::{AccError, Result};
use crate::loss::{self, HuberLoss, PpoLossConfig};
use crate::normalizer::{ValueNorm, ValueNormalizer};
use crate::policy::{CommPolicy, EvaluationGradients, LanguageLearner, LanguageLosses};
use crate::stats::{count_non_finite, standardize};

/// Losses averaged over every module update of one `train` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainLosses {
    pub actor_loss: f32,
    pub act_value_loss: f32,
    /// Present when the communication head was trained
    pub comm_loss: Option<f32>,
    pub comm_value_loss: Option<f32>,
    /// Mean fraction of environment-head ratios outside the clip range
    pub actor_clip_fraction: f32,
    pub comm_clip_fraction: Option<f32>,
    /// Present when the language modules were trained
    pub clip_loss: Option<f32>,
    pub dec_loss: Option<f32>,
    pub mean_sim: Option<f32>,
    /// Number of module updates the PPO losses are averaged over
    pub n_updates: usize,
}

/// Losses of a single module update
#[derive(Debug, Clone, Copy, Default)]
struct UpdateLosses {
    actor: f32,
    act_value: f32,
    comm: f32,
    comm_value: f32,
    actor_clip: f32,
    comm_clip: f32,
}

pub struct DualHeadTrainer<P: CommPolicy, N: ValueNormalizer = ValueNorm> {
    config: AccConfig,
    policies: Vec<P>,
    act_value_normalizer: N,
    comm_value_normalizer: N,
    language_learner: Option<Box<dyn LanguageLearner<P>>>,
    loss_config: PpoLossConfig,
    rng: StdRng,
}

impl<P: CommPolicy> DualHeadTrainer<P, ValueNorm> {
    /// Trainer with fresh value normalizers.
    ///
    /// `policies` holds one module when parameters are shared, one per agent otherwise.
    pub fn new(config: AccConfig, policies: Vec<P>) -> Result<Self> {
        Self::with_normalizers(config, policies, ValueNorm::new(), ValueNorm::new())
    }
}

impl<P: CommPolicy, N: ValueNormalizer> DualHeadTrainer<P, N> {
    pub fn with_normalizers(
        config: AccConfig,
        policies: Vec<P>,
        act_value_normalizer: N,
        comm_value_normalizer: N,
    ) -> Result<Self> {
        config.validate()?;
        if policies.is_empty() {
            return Err(AccError::invalid_parameter(
                "policies",
                "at least one policy module is required",
            ));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let loss_config = PpoLossConfig {
            clip_param: config.clip_param,
            entropy_coef: config.entropy_coef,
            huber: HuberLoss::new(config.huber_delta),
        };

        Ok(DualHeadTrainer {
            config,
            policies,
            act_value_normalizer,
            comm_value_normalizer,
            language_learner: None,
            loss_config,
            rng,
        })
    }

    /// Attach the learner used when `train` is asked to train language
    pub fn with_language_learner(mut self, learner: Box<dyn LanguageLearner<P>>) -> Self {
        self.language_learner = Some(learner);
        self
    }

    pub fn config(&self) -> &AccConfig {
        &self.config
    }

    pub fn policies(&self) -> &[P] {
        &self.policies
    }

    pub fn policies_mut(&mut self) -> &mut [P] {
        &mut self.policies
    }

    pub fn act_value_normalizer(&self) -> &N {
        &self.act_value_normalizer
    }

    pub fn comm_value_normalizer(&self) -> &N {
        &self.comm_value_normalizer
    }

    /// Runs [`ExperienceBuffer::compute_returns`] with this trainer's normalizers
    pub fn compute_returns(
        &self,
        buffer: &mut ExperienceBuffer,
        next_act_value: ArrayView2<f32>,
        next_comm_value: ArrayView2<f32>,
    ) -> Result<()> {
        buffer.compute_returns(
            next_act_value,
            next_comm_value,
            &self.act_value_normalizer,
            &self.comm_value_normalizer,
        )
    }

    /// Standardized advantages `(L, env, agent)` for both streams
    pub fn compute_advantages(&self, buffer: &ExperienceBuffer) -> Result<(Array3<f32>, Array3<f32>)> {
        if buffer.phase() != BufferPhase::ReturnsComputed {
            return Err(AccError::InvalidPhase {
                operation: "compute advantages",
                phase: buffer.phase(),
            });
        }
        let (act_values, comm_values) = buffer.value_preds_in_horizon();
        let (act_returns, comm_returns) = buffer.returns_in_horizon();

        let act_raw = &act_returns - &self.act_value_normalizer.denormalize(&act_values);
        let comm_raw = &comm_returns - &self.comm_value_normalizer.denormalize(&comm_values);

        for (label, adv) in [("act", &act_raw), ("comm", &comm_raw)] {
            let (nan, inf) = count_non_finite(adv.iter());
            if nan + inf > 0 {
                warn!(stream = label, nan, inf, "non-finite advantages");
            }
        }

        Ok((
            standardize(&act_raw, "act_advantages"),
            standardize(&comm_raw, "comm_advantages"),
        ))
    }

    /// Trains every policy module on the buffer.
    ///
    /// `envs_train_comm` flags the environments whose rows may train the
    /// communication head; `None` means all of them. The buffer is marked
    /// consumed afterwards, even when an update fails.
    pub fn train(
        &mut self,
        buffer: &mut ExperienceBuffer,
        warmup: bool,
        train_comm_head: bool,
        train_lang: bool,
        envs_train_comm: Option<&Array1<bool>>,
    ) -> Result<TrainLosses> {
        if buffer.phase() != BufferPhase::ReturnsComputed {
            return Err(AccError::InvalidPhase {
                operation: "train",
                phase: buffer.phase(),
            });
        }
        let result = self.run_training(buffer, warmup, train_comm_head, train_lang, envs_train_comm);
        buffer.mark_consumed();
        result
    }

    fn run_training(
        &mut self,
        buffer: &ExperienceBuffer,
        warmup: bool,
        train_comm_head: bool,
        train_lang: bool,
        envs_train_comm: Option<&Array1<bool>>,
    ) -> Result<TrainLosses> {
        let n_modules = buffer.layout().module_count(buffer.n_agents());
        if self.policies.len() < n_modules {
            return Err(AccError::invalid_parameter(
                "policies",
                format!(
                    "{} layout needs {} modules, got {}",
                    buffer.layout().name(),
                    n_modules,
                    self.policies.len()
                ),
            ));
        }

        for policy in self.policies.iter_mut() {
            policy.warmup_lr(warmup);
        }

        let (act_advantages, comm_advantages) = self.compute_advantages(buffer)?;
        let train_comm_mask = match envs_train_comm {
            Some(mask) => mask.clone(),
            None => Array1::from_elem(buffer.n_parallel_envs(), true),
        };

        let mut totals = UpdateLosses::default();
        let mut n_updates = 0usize;
        for epoch in 0..self.config.ppo_epoch {
            let minibatches = buffer.recurrent_minibatch_generator(
                &act_advantages,
                &comm_advantages,
                &train_comm_mask,
                &mut self.rng,
            )?;
            for minibatch in minibatches {
                for batch in buffer.layout().split(&minibatch)? {
                    let update = self.update_module(&batch, train_comm_head)?;
                    debug!(
                        epoch,
                        module = batch.module,
                        rows = batch.len(),
                        comm_rows = batch.comm_rows(),
                        actor_loss = update.actor,
                        act_value_loss = update.act_value,
                        comm_loss = update.comm,
                        comm_value_loss = update.comm_value,
                        clip_fraction = update.actor_clip,
                        "module update"
                    );
                    totals.actor += update.actor;
                    totals.act_value += update.act_value;
                    totals.comm += update.comm;
                    totals.comm_value += update.comm_value;
                    totals.actor_clip += update.actor_clip;
                    totals.comm_clip += update.comm_clip;
                    n_updates += 1;
                }
            }
        }

        let scale = if n_updates > 0 { 1.0 / n_updates as f32 } else { 0.0 };
        let mut losses = TrainLosses {
            actor_loss: totals.actor * scale,
            act_value_loss: totals.act_value * scale,
            actor_clip_fraction: totals.actor_clip * scale,
            n_updates,
            ..TrainLosses::default()
        };
        if train_comm_head {
            losses.comm_loss = Some(totals.comm * scale);
            losses.comm_value_loss = Some(totals.comm_value * scale);
            losses.comm_clip_fraction = Some(totals.comm_clip * scale);
        }

        if train_lang {
            if let Some(lang) = self.train_language(buffer)? {
                losses.clip_loss = Some(lang.clip_loss);
                losses.dec_loss = Some(lang.capt_loss);
                losses.mean_sim = Some(lang.mean_sim);
            }
        }

        info!(
            n_updates,
            actor_loss = losses.actor_loss,
            act_value_loss = losses.act_value_loss,
            comm_loss = ?losses.comm_loss,
            comm_value_loss = ?losses.comm_value_loss,
            actor_clip_fraction = losses.actor_clip_fraction,
            comm_clip_fraction = ?losses.comm_clip_fraction,
            "training pass finished"
        );
        Ok(losses)
    }

    fn update_module(&mut self, batch: &AgentBatch, train_comm_head: bool) -> Result<UpdateLosses> {
        let cfg = self.loss_config;
        let value_coef = self.config.value_loss_coef;
        let policy = self.policies.get_mut(batch.module).ok_or_else(|| {
            AccError::invalid_parameter("module", format!("no policy module {}", batch.module))
        })?;

        let eval = policy.evaluate_actions(batch, train_comm_head)?;
        if eval.env_values.len() != batch.len() {
            return Err(AccError::shape_mismatch(
                "evaluated rows",
                &[batch.len()],
                &[eval.env_values.len()],
            ));
        }

        let actor = loss::policy_loss(
            &eval.env_log_probs,
            &batch.old_env_log_probs,
            &batch.act_advantages,
            &eval.env_entropy,
            &cfg,
        )?;
        let act_value = loss::value_loss(
            &eval.env_values,
            &batch.act_value_preds,
            &batch.act_returns,
            &mut self.act_value_normalizer,
            &cfg,
        )?;

        let mut grads = EvaluationGradients::zeros_like(&eval);
        grads.env_log_probs = actor.grad_log_probs;
        grads.env_entropy = actor.grad_entropy;
        grads.env_values = act_value.grad_values * value_coef;

        let mut losses = UpdateLosses {
            actor: actor.total,
            act_value: act_value.loss,
            actor_clip: actor.clip_fraction,
            ..UpdateLosses::default()
        };

        if train_comm_head {
            let comm = loss::masked_policy_loss(
                &eval.comm_log_probs,
                &batch.old_comm_log_probs,
                &batch.comm_advantages,
                &eval.comm_entropy,
                &batch.comm_mask,
                &cfg,
            )?;
            let comm_value = loss::masked_value_loss(
                &eval.comm_values,
                &batch.comm_value_preds,
                &batch.comm_returns,
                &batch.comm_mask,
                &mut self.comm_value_normalizer,
                &cfg,
            )?;
            grads.comm_log_probs = comm.grad_log_probs;
            grads.comm_entropy = comm.grad_entropy;
            grads.comm_values = comm_value.grad_values * value_coef;
            losses.comm = comm.total;
            losses.comm_value = comm_value.loss;
            losses.comm_clip = comm.clip_fraction;
        }

        let total = losses.actor + losses.comm + value_coef * (losses.act_value + losses.comm_value);
        debug!(module = batch.module, total, "combined loss");

        policy.zero_grad();
        policy.backward(&grads)?;
        policy.step(self.config.max_grad_norm);
        Ok(losses)
    }

    fn train_language(&mut self, buffer: &ExperienceBuffer) -> Result<Option<LanguageLosses>> {
        let Some(learner) = self.language_learner.as_mut() else {
            warn!("language training requested without a language learner");
            return Ok(None);
        };

        let mut totals = LanguageLosses::default();
        let mut n_updates = 0usize;
        for _ in 0..self.config.lang_n_epochs {
            for batch in buffer.language_batches(&mut self.rng)? {
                let policy = self.policies.get_mut(batch.module).ok_or_else(|| {
                    AccError::invalid_parameter("module", format!("no policy module {}", batch.module))
                })?;
                let losses = learner.train_language(policy, &batch)?;
                totals.capt_loss += losses.capt_loss;
                totals.clip_loss += losses.clip_loss;
                totals.mean_sim += losses.mean_sim;
                n_updates += 1;
            }
        }

        if n_updates == 0 {
            return Ok(Some(totals));
        }
        let n = n_updates as f32;
        Ok(Some(LanguageLosses {
            capt_loss: totals.capt_loss / n,
            clip_loss: totals.clip_loss / n,
            mean_sim: totals.mean_sim / n,
        }))
    }
}
