//! Rolling prediction of consensus-layer rewards per epoch, derived from
//! the rebase event history over the daemon-config prediction window.

use alloy_primitives::U256;

use lido_oracle_client::execution::contracts::RebaseEvent;
use lido_oracle_shared::types::{ChainConfig, Wei};

/// Average rewards per epoch over the supplied rebase history. Rewards of
/// one rebase are the CL balance growth net of deposits-free flows:
/// `post_cl + withdrawn - pre_cl + el_rewards`. Negative intervals drag the
/// average down but the result never goes below zero.
pub fn rewards_per_epoch(events: &[RebaseEvent], chain_config: &ChainConfig) -> Wei {
    if events.is_empty() {
        return Wei::ZERO;
    }

    let mut total_rewards = alloy_primitives::I256::ZERO;
    let mut total_time: u64 = 0;
    for event in events {
        let gained = alloy_primitives::I256::try_from(
            event.post_cl_balance + event.withdrawals_withdrawn + event.el_rewards,
        )
        .unwrap_or(alloy_primitives::I256::MAX);
        let pre = alloy_primitives::I256::try_from(event.pre_cl_balance).unwrap_or(alloy_primitives::I256::MAX);
        total_rewards += gained - pre;
        total_time += event.time_elapsed;
    }

    if total_time == 0 || total_rewards.is_negative() {
        return Wei::ZERO;
    }

    let seconds_per_epoch = chain_config.seconds_per_slot * chain_config.slots_per_epoch;
    let total_rewards = total_rewards.into_raw();
    total_rewards * U256::from(seconds_per_epoch) / U256::from(total_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ChainConfig {
        ChainConfig {
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            genesis_time: 0,
        }
    }

    fn rebase(pre: u64, post: u64, withdrawn: u64, el: u64, time: u64) -> RebaseEvent {
        RebaseEvent {
            pre_cl_balance: U256::from(pre),
            post_cl_balance: U256::from(post),
            withdrawals_withdrawn: U256::from(withdrawn),
            el_rewards: U256::from(el),
            time_elapsed: time,
        }
    }

    #[test]
    fn averages_rewards_over_elapsed_time() {
        // 1000 wei gained over one day: per-epoch = 1000 * 384 / 86400.
        let events = [rebase(1_000_000, 1_000_800, 100, 100, 86_400)];
        assert_eq!(rewards_per_epoch(&events, &chain()), U256::from(1000u64 * 384 / 86_400));
    }

    #[test]
    fn no_history_or_negative_rebase_predicts_zero() {
        assert_eq!(rewards_per_epoch(&[], &chain()), Wei::ZERO);

        let events = [rebase(1_000_000, 900_000, 0, 0, 86_400)];
        assert_eq!(rewards_per_epoch(&events, &chain()), Wei::ZERO);
    }
}
