#[cfg(test)]
mod property_tests {
    use acc_marl::buffer::partition_envs;
    use acc_marl::buffer::returns::{gae_returns, shift_comm_rewards};
    use acc_marl::config::CommRewardShift;
    use acc_marl::loss::{policy_loss, HuberLoss, PpoLossConfig};
    use acc_marl::normalizer::{ValueNorm, ValueNormalizer};
    use acc_marl::stats::standardize;
    use ndarray::{Array1, Array2, Array3};
    use proptest::prelude::*;

    fn loss_config(clip_param: f32) -> PpoLossConfig {
        PpoLossConfig {
            clip_param,
            entropy_coef: 0.0,
            huber: HuberLoss::new(10.0),
        }
    }

    // Strategy for a permutation of environment indices
    fn shuffled_envs() -> impl Strategy<Value = Vec<usize>> {
        (1usize..=40).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    }

    fn finite_vec(len: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0, len)
    }

    proptest! {
        #[test]
        fn test_partition_covers_every_env_once(envs in shuffled_envs(), n_mini_batch in 1usize..10) {
            let groups = partition_envs(&envs, n_mini_batch);
            prop_assert_eq!(groups.len(), n_mini_batch.min(envs.len()));

            let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..envs.len()).collect::<Vec<_>>());

            let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
            let min = *sizes.iter().min().unwrap();
            let max = *sizes.iter().max().unwrap();
            prop_assert!(max - min <= 1);
            prop_assert!(min >= 1);
        }

        #[test]
        fn test_standardized_values_have_zero_mean(values in finite_vec(32)) {
            let arr = Array1::from_vec(values);
            let out = standardize(&arr, "prop");
            let mean = out.sum() / out.len() as f32;
            prop_assert!(mean.abs() < 1e-3, "mean {}", mean);
        }

        #[test]
        fn test_policy_loss_flat_beyond_clip_for_positive_advantage(
            adv in 0.1f32..10.0,
            log_ratio in 0.2f32..2.0,
            extra in 0.0f32..1.0,
        ) {
            // Past 1 + clip, pushing the ratio further buys nothing
            let cfg = loss_config(0.2);
            let old = Array2::<f32>::zeros((1, 1));
            let near = Array2::from_elem((1, 1), log_ratio);
            let far = Array2::from_elem((1, 1), log_ratio + extra);
            let a = Array1::from_elem(1, adv);
            let h = Array1::<f32>::zeros(1);

            let l_near = policy_loss(&near, &old, &a, &h, &cfg).unwrap();
            let l_far = policy_loss(&far, &old, &a, &h, &cfg).unwrap();
            prop_assert!((l_near.surrogate - l_far.surrogate).abs() < 1e-4);
            prop_assert!(l_far.grad_log_probs[[0, 0]] == 0.0);
        }

        #[test]
        fn test_policy_loss_never_rewards_shrinking_ratio_for_positive_advantage(
            adv in 0.1f32..10.0,
            log_ratio in -3.0f32..0.0,
            extra in 0.0f32..1.0,
        ) {
            // Below 1, a smaller ratio is never better when the advantage is positive
            let cfg = loss_config(0.2);
            let old = Array2::<f32>::zeros((1, 1));
            let a = Array1::from_elem(1, adv);
            let h = Array1::<f32>::zeros(1);
            let higher = policy_loss(&Array2::from_elem((1, 1), log_ratio), &old, &a, &h, &cfg).unwrap();
            let lower = policy_loss(&Array2::from_elem((1, 1), log_ratio - extra), &old, &a, &h, &cfg).unwrap();
            prop_assert!(lower.surrogate >= higher.surrogate - 1e-5);
        }

        #[test]
        fn test_comm_shift_adds_next_reward(
            env in finite_vec(6),
            comm in finite_vec(6),
        ) {
            let env = Array3::from_shape_vec((6, 1, 1), env).unwrap();
            let mut shifted = Array3::from_shape_vec((6, 1, 1), comm.clone()).unwrap();
            let masks = Array3::<f32>::ones((7, 1, 1));
            shift_comm_rewards(shifted.view_mut(), env.view(), masks.view(), CommRewardShift::Unmasked);

            for t in 0..5 {
                prop_assert!((shifted[[t, 0, 0]] - (comm[t] + env[[t + 1, 0, 0]])).abs() < 1e-3);
            }
            prop_assert_eq!(shifted[[5, 0, 0]], comm[5]);
        }

        #[test]
        fn test_bellman_consistent_values_are_their_own_returns(
            v0 in 0.1f32..10.0,
            gamma in 0.5f32..1.0,
            lambda in 0.0f32..=1.0,
        ) {
            // Zero rewards and V(t) = gamma * V(t+1) leave every TD error at zero
            let values = Array3::from_shape_fn((6, 1, 1), |(t, _, _)| v0 * gamma.powi(-(t as i32)));
            let rewards = Array3::<f32>::zeros((5, 1, 1));
            let masks = Array3::<f32>::ones((6, 1, 1));
            let returns = gae_returns(rewards.view(), values.view(), masks.view(), gamma, lambda);
            for t in 0..5 {
                let v = values[[t, 0, 0]];
                prop_assert!((returns[[t, 0, 0]] - v).abs() <= 1e-4 * v.abs().max(1.0));
            }
        }

        #[test]
        fn test_value_norm_inverts(values in finite_vec(16)) {
            let mut norm = ValueNorm::new();
            let batch = Array1::from_vec(values);
            norm.update(&batch);
            let back = norm.denormalize(&norm.normalize(&batch));
            for (a, b) in batch.iter().zip(back.iter()) {
                prop_assert!((a - b).abs() < 1e-2 * a.abs().max(1.0));
            }
        }
    }
}
