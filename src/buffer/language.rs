//! Samples for training the language modules.
//!
//! These draw on the observations and parsed sentences stored alongside the
//! rollout. The PPO update never reads them.

use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::seq::index;
use rand::Rng;

use super::ExperienceBuffer;
use crate::error::{AccError, Result};

/// A tokenized sentence
pub type Sentence = Vec<String>;

/// Sentences describing one step's observations, indexed `[env][agent]`
pub type ParsedObs = Vec<Vec<Sentence>>;

/// Whole-horizon slices of a random subset of environments.
#[derive(Debug, Clone)]
pub struct LanguageSample {
    pub env_ids: Vec<usize>,
    /// `(L+1, env, agent, policy_input_dim)`
    pub policy_input: Array4<f32>,
    /// `(L+1, env, agent)`
    pub masks: Array3<f32>,
    /// `(env, agent, recurrent_n, hidden)` at `t = 0`
    pub rnn_states: Array4<f32>,
    /// `[step][env][agent]`
    pub sentences: Vec<Vec<Vec<Sentence>>>,
}

/// Language training rows for one policy module, laid out like [`super::AgentBatch`].
#[derive(Debug, Clone)]
pub struct LanguageBatch {
    pub module: usize,
    pub n_steps: usize,
    pub n_sequences: usize,
    pub policy_input: Array2<f32>,
    pub masks: Array1<f32>,
    pub rnn_states: Array3<f32>,
    /// One sentence per row
    pub sentences: Vec<Sentence>,
}

/// Observation/sentence pairs for contrastive training.
#[derive(Debug, Clone)]
pub struct ContrastiveSample {
    /// `(n_mini_batch * batch_size, obs_dim)`
    pub obs: Array2<f32>,
    pub sentences: Vec<Sentence>,
    pub n_mini_batch: usize,
    pub batch_size: usize,
}

impl ContrastiveSample {
    /// Rows of minibatch `i`, or `None` past the last minibatch
    pub fn batch(&self, i: usize) -> Option<(ndarray::ArrayView2<'_, f32>, &[Sentence])> {
        if i >= self.n_mini_batch {
            return None;
        }
        let start = i * self.batch_size;
        let end = start + self.batch_size;
        let sentences = self.sentences.get(start..end)?;
        if end > self.obs.nrows() {
            return None;
        }
        Some((self.obs.slice(ndarray::s![start..end, ..]), sentences))
    }
}

impl ExperienceBuffer {
    fn stored_sentences(&self) -> Result<Vec<&Vec<Vec<Sentence>>>> {
        self.parsed_obs
            .iter()
            .enumerate()
            .map(|(t, step)| {
                step.as_ref().ok_or_else(|| {
                    AccError::invalid_parameter(
                        "parsed_obs",
                        format!("no parsed observation stored for step {}", t),
                    )
                })
            })
            .collect()
    }

    /// Samples up to `lang_capt_batch_size` environments without replacement and
    /// returns their whole horizon, including the bootstrap slot.
    pub fn sample_language<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<LanguageSample> {
        let stored = self.stored_sentences()?;
        let n_sample_envs = self.n_parallel_envs.min(self.lang_capt_batch_size);
        if n_sample_envs == 0 {
            return Err(AccError::invalid_parameter(
                "lang_capt_batch_size",
                "must be greater than 0",
            ));
        }
        let env_ids = index::sample(rng, self.n_parallel_envs, n_sample_envs).into_vec();

        let sentences = stored
            .iter()
            .map(|step| env_ids.iter().map(|&e| step[e].clone()).collect())
            .collect();

        Ok(LanguageSample {
            policy_input: self.policy_input.select(Axis(1), &env_ids),
            masks: self.masks.select(Axis(1), &env_ids),
            rnn_states: self
                .rnn_states
                .index_axis(Axis(0), 0)
                .select(Axis(0), &env_ids),
            sentences,
            env_ids,
        })
    }

    /// Samples rows of stored observations with their sentences, without replacement.
    ///
    /// All `(L+1) * E * A` rows are candidates. The number of minibatches is
    /// `lang_clip_n_mini_batch`, reduced when there are not enough rows.
    pub fn sample_contrastive<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ContrastiveSample> {
        let stored = self.stored_sentences()?;
        let batch_size = self.lang_clip_batch_size;
        let obs_dim = self.dims.obs_dim;
        let total = self.obs.len() / obs_dim.max(1);

        if batch_size == 0 || total < batch_size {
            return Err(AccError::invalid_parameter(
                "lang_clip_batch_size",
                format!("{} rows stored, need at least {}", total, batch_size),
            ));
        }
        let n_mini_batch = self.lang_clip_n_mini_batch.min(total / batch_size).max(1);

        let all_obs = self.obs.view().into_shape((total, obs_dim))?;
        let all_sentences: Vec<&Sentence> = stored
            .iter()
            .flat_map(|step| step.iter().flat_map(|env| env.iter()))
            .collect();

        let ids = index::sample(rng, total, n_mini_batch * batch_size).into_vec();
        Ok(ContrastiveSample {
            obs: all_obs.select(Axis(0), &ids),
            sentences: ids.iter().map(|&i| all_sentences[i].clone()).collect(),
            n_mini_batch,
            batch_size,
        })
    }
}
