//! Generalized Advantage Estimation (GAE-λ) over `(time, env, agent)` arrays.

use ndarray::{s, Array2, Array3, ArrayView3, ArrayViewMut3, Axis, Zip};

use crate::config::CommRewardShift;

/// Credits each communication step with the environment reward of the next step.
///
/// Applies `comm_rewards[t] += env_rewards[t+1]` for `t < L-1`; the last step
/// gets nothing because its successor lies outside the horizon. With
/// [`CommRewardShift::Masked`] the credit is multiplied by `masks[t+1]`, so a
/// reward collected after a termination is not attributed across the boundary.
pub fn shift_comm_rewards(
    mut comm_rewards: ArrayViewMut3<f32>,
    env_rewards: ArrayView3<f32>,
    masks: ArrayView3<f32>,
    shift: CommRewardShift,
) {
    let horizon = comm_rewards.len_of(Axis(0));
    if horizon < 2 {
        return;
    }

    let next_rewards = env_rewards.slice(s![1..horizon, .., ..]);
    let mut head = comm_rewards.slice_mut(s![..horizon - 1, .., ..]);
    match shift {
        CommRewardShift::Unmasked => head += &next_rewards,
        CommRewardShift::Masked => {
            let next_masks = masks.slice(s![1..horizon, .., ..]);
            Zip::from(&mut head)
                .and(&next_rewards)
                .and(&next_masks)
                .for_each(|c, &r, &m| *c += r * m);
        }
    }
}

/// Computes GAE returns for one reward stream.
///
/// * `rewards` - `(L, E, A)` immediate rewards
/// * `values` - `(L+1, E, A)` denormalized value estimates, slot `L` being the bootstrap
/// * `masks` - `(L+1, E, A)` alive indicators; `masks[t+1] = 0` cuts the bootstrap
///
/// Returns an `(L+1, E, A)` array whose first `L` slots hold the return targets.
/// The last slot is left at zero.
pub fn gae_returns(
    rewards: ArrayView3<f32>,
    values: ArrayView3<f32>,
    masks: ArrayView3<f32>,
    gamma: f32,
    gae_lambda: f32,
) -> Array3<f32> {
    let (horizon, n_envs, n_agents) = rewards.dim();
    let mut returns = Array3::zeros((horizon + 1, n_envs, n_agents));
    let mut gae = Array2::<f32>::zeros((n_envs, n_agents));

    for t in (0..horizon).rev() {
        let reward = rewards.index_axis(Axis(0), t);
        let value = values.index_axis(Axis(0), t);
        let next_value = values.index_axis(Axis(0), t + 1);
        let next_mask = masks.index_axis(Axis(0), t + 1);

        Zip::from(&mut gae)
            .and(&reward)
            .and(&value)
            .and(&next_value)
            .and(&next_mask)
            .for_each(|g, &r, &v, &nv, &m| {
                let delta = r + gamma * nv * m - v;
                *g = delta + gamma * gae_lambda * m * *g;
            });

        let mut slot = returns.index_axis_mut(Axis(0), t);
        Zip::from(&mut slot)
            .and(&gae)
            .and(&value)
            .for_each(|ret, &g, &v| *ret = g + v);
    }

    returns
}
