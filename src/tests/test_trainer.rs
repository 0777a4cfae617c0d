use std::cell::RefCell;
use std::rc::Rc;

use ndarray::{Array1, Array2, Array3};

use super::{config, dims, fill_episode, CountingLearner, Episode, RecordingPolicy};
use crate::buffer::{BufferPhase, ExperienceBuffer};
use crate::error::AccError;
use crate::trainer::DualHeadTrainer;

fn ready_buffer(
    trainer: &DualHeadTrainer<RecordingPolicy>,
    l: usize,
    n_envs: usize,
    n_agents: usize,
    share: bool,
) -> ExperienceBuffer {
    let mut buffer = ExperienceBuffer::new(&config(l, n_envs, share), dims(n_agents)).unwrap();
    let mut episode = Episode::constant(&buffer, 0.0);
    episode.act_rewards =
        Array3::from_shape_fn((l, n_envs, n_agents), |(t, e, a)| (t as f32) - (e as f32) * 0.5 + a as f32);
    episode.comm_rewards = episode.act_rewards.mapv(|r| r * 0.25);
    fill_episode(&mut buffer, &episode);
    let next = Array2::zeros((n_envs, n_agents));
    trainer
        .compute_returns(&mut buffer, next.view(), next.view())
        .unwrap();
    buffer
}

fn trainer(modules: usize, share: bool) -> DualHeadTrainer<RecordingPolicy> {
    let policies = (0..modules).map(|_| RecordingPolicy::default()).collect();
    DualHeadTrainer::new(config(3, 4, share), policies).unwrap()
}

#[test]
fn test_update_count_shared() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 2, true);
    let losses = trainer.train(&mut buffer, false, true, false, None).unwrap();

    // ppo_epoch 2 x 2 minibatches x 1 module
    assert_eq!(losses.n_updates, 4);
    // Evaluation reuses the old log probabilities, so nothing is clipped
    assert_eq!(losses.actor_clip_fraction, 0.0);
    assert_eq!(losses.comm_clip_fraction, Some(0.0));
    let policy = &trainer.policies()[0];
    assert_eq!(policy.steps, 4);
    // 3 steps x 2 envs x 2 agents per minibatch
    assert!(policy.evaluated_rows.iter().all(|&rows| rows == 12));
    assert_eq!(buffer.phase(), BufferPhase::Consumed);
}

#[test]
fn test_update_count_per_agent() {
    let mut trainer = trainer(2, false);
    let mut buffer = ready_buffer(&trainer, 3, 4, 2, false);
    let losses = trainer.train(&mut buffer, false, true, false, None).unwrap();

    assert_eq!(losses.n_updates, 8);
    for policy in trainer.policies() {
        assert_eq!(policy.steps, 4);
        assert!(policy.evaluated_rows.iter().all(|&rows| rows == 6));
    }
}

#[test]
fn test_per_agent_needs_one_policy_per_agent() {
    let mut trainer = trainer(1, false);
    let mut buffer = ready_buffer(&trainer, 3, 4, 2, false);
    let err = trainer.train(&mut buffer, false, true, false, None).unwrap_err();
    assert!(matches!(err, AccError::InvalidParameter { ref name, .. } if name == "policies"));
    // A failed pass still uses up the returns
    assert_eq!(buffer.phase(), BufferPhase::Consumed);
}

#[test]
fn test_training_twice_is_rejected() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 1, true);
    trainer.train(&mut buffer, false, true, false, None).unwrap();
    let err = trainer.train(&mut buffer, false, true, false, None).unwrap_err();
    assert_eq!(
        err,
        AccError::InvalidPhase {
            operation: "train",
            phase: BufferPhase::Consumed,
        }
    );
}

#[test]
fn test_training_before_returns_is_rejected() {
    let mut trainer = trainer(1, true);
    let mut buffer = ExperienceBuffer::new(&config(3, 4, true), dims(1)).unwrap();
    let episode = Episode::constant(&buffer, 1.0);
    fill_episode(&mut buffer, &episode);

    let err = trainer.train(&mut buffer, false, true, false, None).unwrap_err();
    assert!(matches!(err, AccError::InvalidPhase { phase: BufferPhase::Filling, .. }));
    assert_eq!(buffer.phase(), BufferPhase::Filling);
}

#[test]
fn test_comm_head_skipped_when_not_trained() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 1, true);
    let losses = trainer.train(&mut buffer, true, false, false, None).unwrap();

    assert!(losses.comm_loss.is_none());
    assert!(losses.comm_value_loss.is_none());
    let policy = &trainer.policies()[0];
    assert_eq!(policy.warmup, Some(true));
    let grads = policy.last_grads.as_ref().unwrap();
    assert!(grads.comm_log_probs.iter().all(|&g| g == 0.0));
    assert!(grads.comm_values.iter().all(|&g| g == 0.0));
    // The comm normalizer never saw a batch
    let (mean, _) = trainer.comm_value_normalizer().running_mean_var();
    assert_eq!(mean, 0.0);
}

#[test]
fn test_all_false_comm_mask_zeroes_comm_head() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 2, true);
    let mask = Array1::from_elem(4, false);
    let losses = trainer.train(&mut buffer, false, true, false, Some(&mask)).unwrap();

    assert_eq!(losses.comm_loss, Some(0.0));
    assert_eq!(losses.comm_value_loss, Some(0.0));
    assert_eq!(losses.comm_clip_fraction, Some(0.0));
    // Only the entropy bonus survives at ratio 1 with standardized advantages
    assert!(losses.actor_loss != 0.0);
    assert!(losses.actor_loss.is_finite());
    assert!(losses.act_value_loss != 0.0);
    assert!(losses.act_value_loss > 0.0);
    let policy = &trainer.policies()[0];
    assert!(policy.comm_rows.iter().all(|&rows| rows == 0));
    let grads = policy.last_grads.as_ref().unwrap();
    assert!(grads.comm_log_probs.iter().all(|&g| g == 0.0));
    assert!(grads.comm_entropy.iter().all(|&g| g == 0.0));
    assert!(grads.comm_values.iter().all(|&g| g == 0.0));
    // The environment head still trains
    assert!(grads.env_log_probs.iter().any(|&g| g != 0.0));
}

#[test]
fn test_partial_comm_mask_counts_rows() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 2, true);
    let mask = Array1::from_vec(vec![true, false, false, false]);
    trainer.train(&mut buffer, false, true, false, Some(&mask)).unwrap();

    let policy = &trainer.policies()[0];
    let total: usize = policy.comm_rows.iter().sum();
    // Env 0 appears once per epoch: 3 steps x 2 agents x 2 epochs
    assert_eq!(total, 12);
}

#[test]
fn test_advantages_are_standardized() {
    let trainer = trainer(1, true);
    let buffer = ready_buffer(&trainer, 3, 4, 2, true);
    let (act, comm) = trainer.compute_advantages(&buffer).unwrap();
    assert_eq!(act.dim(), (3, 4, 2));

    for adv in [&act, &comm] {
        let n = adv.len() as f32;
        let mean = adv.sum() / n;
        let var = adv.mapv(|x| (x - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 1e-4);
        assert!((var.sqrt() - 1.0).abs() < 1e-3);
    }
}

#[test]
fn test_advantages_need_returns() {
    let trainer = trainer(1, true);
    let buffer = ExperienceBuffer::new(&config(3, 4, true), dims(1)).unwrap();
    assert!(matches!(
        trainer.compute_advantages(&buffer),
        Err(AccError::InvalidPhase { .. })
    ));
}

#[test]
fn test_language_losses_are_averaged() {
    let batches = Rc::new(RefCell::new(Vec::new()));
    let learner = CountingLearner {
        batches: Rc::clone(&batches),
    };
    let policies = vec![RecordingPolicy::default(), RecordingPolicy::default()];
    let mut trainer = DualHeadTrainer::new(config(3, 4, false), policies)
        .unwrap()
        .with_language_learner(Box::new(learner));
    let mut buffer = ExperienceBuffer::new(&config(3, 4, false), dims(2)).unwrap();
    let episode = Episode::constant(&buffer, 1.0);
    fill_episode(&mut buffer, &episode);
    let next = Array2::zeros((4, 2));
    trainer.compute_returns(&mut buffer, next.view(), next.view()).unwrap();

    let losses = trainer.train(&mut buffer, false, false, true, None).unwrap();
    assert_eq!(losses.dec_loss, Some(2.0));
    assert_eq!(losses.clip_loss, Some(1.0));
    assert_eq!(losses.mean_sim, Some(0.5));

    // One batch per agent; 4 slots x 2 sampled envs each
    let seen = batches.borrow();
    assert_eq!(seen.as_slice(), &[(0, 8), (1, 8)]);
}

#[test]
fn test_language_without_learner_is_skipped() {
    let mut trainer = trainer(1, true);
    let mut buffer = ready_buffer(&trainer, 3, 4, 1, true);
    let losses = trainer.train(&mut buffer, false, true, true, None).unwrap();
    assert!(losses.clip_loss.is_none());
    assert!(losses.dec_loss.is_none());
    assert!(losses.mean_sim.is_none());
}

#[test]
fn test_seeded_trainers_agree() {
    let run = || {
        let mut trainer = trainer(1, true);
        let mut buffer = ready_buffer(&trainer, 3, 4, 2, true);
        trainer.train(&mut buffer, false, true, false, None).unwrap()
    };
    assert_eq!(run(), run());
}
