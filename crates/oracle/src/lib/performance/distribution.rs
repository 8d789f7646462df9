//! Per-frame reward distribution and strikes computation for the
//! permissionless module's validators.

use std::collections::BTreeMap;

use alloy_primitives::U256;
use thiserror::Error;

use lido_oracle_client::execution::contracts::{CurveParams, KeyNumberValueInterval};
use lido_oracle_shared::duties::PerformanceCoefficients;
use lido_oracle_shared::eth_spec::TOTAL_BASIS_POINTS;
use lido_oracle_shared::strikes::{StrikesList, STRIKE_SENTINEL};
use lido_oracle_shared::types::{BlsPubkey, NodeOperatorId, ReferenceBlockStamp, ValidatorIndex};
use lido_oracle_shared::util::u64_to_usize;

use super::log::{FramePerfLog, OperatorFrameSummary};
use super::state::{Frame, State};

pub type StrikesKey = (NodeOperatorId, BlsPubkey);

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("Invalid distribution: distributed {distributed} + rebate {rebate} > distributable {distributable}")]
    InvalidDistribution {
        distributed: U256,
        rebate: U256,
        distributable: U256,
    },

    #[error("Invalid distribution: per-operator total {map_total} != accumulated total {accumulated}")]
    InconsistentRewards { map_total: U256, accumulated: U256 },

    #[error("Invalid rebate share for validator {validator}: participation exceeds assigned duties")]
    InvalidRebateShare { validator: ValidatorIndex },

    #[error("No curve parameters for node operator {0}")]
    MissingCurveParams(NodeOperatorId),

    #[error(transparent)]
    State(#[from] super::state::StateError),

    #[error(transparent)]
    Duties(#[from] lido_oracle_shared::duties::Error),
}

#[derive(Debug, Clone)]
pub struct OperatorValidator {
    pub index: ValidatorIndex,
    pub pubkey: BlsPubkey,
    pub slashed: bool,
}

/// Everything the engine needs about one frame, prefetched at the frame's
/// reference blockstamp.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub frame: Frame,
    pub blockstamp: ReferenceBlockStamp,
    pub operators_to_validators: BTreeMap<NodeOperatorId, Vec<OperatorValidator>>,
    /// Total reward shares available at the frame's reference block,
    /// including everything distributed by earlier frames of this report.
    pub total_rewards_to_distribute: U256,
    /// Curve parameters for every operator above plus every operator
    /// carrying accumulated strikes.
    pub curve_params: BTreeMap<NodeOperatorId, CurveParams>,
}

#[derive(Debug, Default)]
pub struct DistributionResult {
    pub total_rewards: U256,
    pub total_rebate: U256,
    pub total_rewards_map: BTreeMap<NodeOperatorId, U256>,
    pub strikes: BTreeMap<StrikesKey, StrikesList>,
    pub logs: Vec<FramePerfLog>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ValidatorDutiesOutcome {
    participation_share: u64,
    rebate_share: u64,
    strikes: u64,
}

/// Basis-point value of the interval covering `key_number`. Intervals are
/// keyed by their first key number; the match is the closest one below.
fn interval_value_for(intervals: &[KeyNumberValueInterval], key_number: u64) -> u64 {
    intervals
        .iter()
        .filter(|i| i.min_key_number <= key_number)
        .max_by_key(|i| i.min_key_number)
        .map(|i| i.value_bp)
        .unwrap_or(0)
}

fn ceil_share(assigned: u64, share_bp: u64) -> u64 {
    (assigned * share_bp).div_ceil(TOTAL_BASIS_POINTS)
}

/// Computes the distribution of reward shares and strikes over all frames of
/// the report, newest last. Mirrors the on-chain distribution exactly; any
/// disagreement with the available rewards is fatal.
pub fn calculate(
    state: &State,
    frame_inputs: &[FrameInput],
    last_report_rewards: &[(NodeOperatorId, U256)],
    last_report_strikes: &BTreeMap<StrikesKey, StrikesList>,
) -> Result<DistributionResult, DistributionError> {
    let mut result = DistributionResult {
        strikes: last_report_strikes.clone(),
        ..Default::default()
    };

    let mut distributed_so_far = U256::ZERO;
    for input in frame_inputs {
        let (from_epoch, to_epoch) = input.frame;
        tracing::info!(from_epoch, to_epoch, "Calculating distribution for frame");

        let rewards_to_distribute_in_frame = input.total_rewards_to_distribute - distributed_so_far;

        let mut frame_log = FramePerfLog::new(&input.blockstamp, input.frame);
        let frame_outcome = calculate_distribution_in_frame(
            state,
            input,
            rewards_to_distribute_in_frame,
            &mut frame_log,
        )?;

        if frame_outcome.distributed_rewards.is_zero() {
            tracing::info!(from_epoch, to_epoch, "No rewards distributed in frame");
        }
        if frame_outcome.strikes.is_empty() {
            tracing::info!(from_epoch, to_epoch, "No strikes in frame, just shifting current strikes");
        }

        result.strikes = process_strikes(&result.strikes, &frame_outcome.strikes, &input.curve_params)?;

        result.total_rewards += frame_outcome.distributed_rewards;
        result.total_rebate += frame_outcome.rebate_to_protocol;

        validate_distribution(result.total_rewards, result.total_rebate, input.total_rewards_to_distribute)?;
        distributed_so_far = result.total_rewards + result.total_rebate;

        for (operator, rewards) in frame_outcome.rewards_map {
            *result.total_rewards_map.entry(operator).or_default() += rewards;
        }

        result.logs.push(frame_log);
    }

    let map_total: U256 = result.total_rewards_map.values().copied().sum();
    if map_total != result.total_rewards {
        return Err(DistributionError::InconsistentRewards {
            map_total,
            accumulated: result.total_rewards,
        });
    }

    for (operator, rewards) in last_report_rewards {
        *result.total_rewards_map.entry(*operator).or_default() += *rewards;
    }

    Ok(result)
}

struct FrameOutcome {
    rewards_map: BTreeMap<NodeOperatorId, U256>,
    distributed_rewards: U256,
    rebate_to_protocol: U256,
    strikes: BTreeMap<StrikesKey, u64>,
}

fn calculate_distribution_in_frame(
    state: &State,
    input: &FrameInput,
    rewards_to_distribute: U256,
    log: &mut FramePerfLog,
) -> Result<FrameOutcome, DistributionError> {
    let mut total_rebate_share: u64 = 0;
    let mut participation_shares: BTreeMap<NodeOperatorId, u64> = BTreeMap::new();
    let mut frame_strikes: BTreeMap<StrikesKey, u64> = BTreeMap::new();

    let network_perf =
        PerformanceCoefficients::default().calc_performance(&state.get_network_duties(input.frame)?)?;

    for (operator, validators) in &input.operators_to_validators {
        let mut active_validators: Vec<&OperatorValidator> = validators
            .iter()
            .filter(|v| {
                state
                    .attestation_of(input.frame, v.index)
                    .is_some_and(|a| a.assigned > 0)
            })
            .collect();
        if active_validators.is_empty() {
            tracing::info!(operator, "No active validators for the operator in the frame, skipping");
            continue;
        }

        let curve_params = input
            .curve_params
            .get(operator)
            .ok_or(DistributionError::MissingCurveParams(*operator))?;

        let log_operator = log.operators.entry(*operator).or_default();
        log_operator.performance_coefficients = Some(curve_params.perf_coeffs);

        active_validators.sort_by_key(|v| v.index);
        for (position, validator) in active_validators.iter().enumerate() {
            let key_number = position as u64 + 1;
            let leeway_bp = interval_value_for(&curve_params.perf_leeway_data, key_number);
            let key_threshold = (network_perf - leeway_bp as f64 / TOTAL_BASIS_POINTS as f64).max(0.0);
            let key_reward_share_bp = interval_value_for(&curve_params.reward_share_data, key_number);

            let duties = state.get_validator_duties(input.frame, validator.index);
            let outcome = get_validator_duties_outcome(
                validator,
                &duties,
                key_threshold,
                key_reward_share_bp,
                &curve_params.perf_coeffs,
                log_operator,
            )?;

            if outcome.strikes > 0 {
                frame_strikes.insert((*operator, validator.pubkey), outcome.strikes);
                log_operator.validators.entry(validator.index).or_default().strikes = outcome.strikes;
            }
            *participation_shares.entry(*operator).or_default() += outcome.participation_share;
            total_rebate_share += outcome.rebate_share;
        }
    }

    let rewards_map = calc_rewards_distribution_in_frame(
        &participation_shares,
        total_rebate_share,
        rewards_to_distribute,
        log,
    );
    let distributed_rewards: U256 = rewards_map.values().copied().sum();
    // Nothing is rebated when no duties were assigned or every validator was
    // below its threshold - the whole pot stays distributable.
    let rebate_to_protocol = if distributed_rewards.is_zero() {
        U256::ZERO
    } else {
        rewards_to_distribute - distributed_rewards
    };

    for (operator, rewards) in &rewards_map {
        log.operators.entry(*operator).or_default().distributed_rewards = *rewards;
    }
    log.distributable = rewards_to_distribute;
    log.distributed_rewards = distributed_rewards;
    log.rebate_to_protocol = rebate_to_protocol;

    Ok(FrameOutcome {
        rewards_map,
        distributed_rewards,
        rebate_to_protocol,
        strikes: frame_strikes,
    })
}

fn get_validator_duties_outcome(
    validator: &OperatorValidator,
    duties: &lido_oracle_shared::duties::ValidatorDuties,
    threshold: f64,
    reward_share_bp: u64,
    perf_coeffs: &PerformanceCoefficients,
    log_operator: &mut OperatorFrameSummary,
) -> Result<ValidatorDutiesOutcome, DistributionError> {
    let Some(attestation) = duties.attestation.filter(|a| a.assigned > 0) else {
        // The validator had no attestation duty in the frame (e.g. exited or
        // pending activation). An exited validator can still sit in a sync
        // committee, but without assigned attestations there is no
        // participation share to count.
        return Ok(ValidatorDutiesOutcome::default());
    };

    let log_validator = log_operator.validators.entry(validator.index).or_default();

    if validator.slashed {
        // Active during the frame, slashed, and not yet past the exit epoch:
        // no share for the operator, one strike for the key.
        log_validator.slashed = true;
        return Ok(ValidatorDutiesOutcome {
            participation_share: 0,
            rebate_share: 0,
            strikes: 1,
        });
    }

    let performance = perf_coeffs.calc_performance(duties)?;

    log_validator.threshold = threshold;
    log_validator.reward_share_bp = reward_share_bp;
    log_validator.performance = performance;
    log_validator.attestation_duty = Some(attestation);
    log_validator.proposal_duty = duties.proposal;
    log_validator.sync_duty = duties.sync;

    if performance > threshold {
        // Assigned attestations measure how long the key was active in the
        // frame. The reward share can be below 1 (in basis points); the
        // operator's part is rounded up in its favour, the remainder goes to
        // the protocol rebate.
        let participation_share = ceil_share(attestation.assigned, reward_share_bp);
        let rebate_share = attestation
            .assigned
            .checked_sub(participation_share)
            .ok_or(DistributionError::InvalidRebateShare {
                validator: validator.index,
            })?;
        return Ok(ValidatorDutiesOutcome {
            participation_share,
            rebate_share,
            strikes: 0,
        });
    }

    // Below threshold: the key is striked and its assigned attestations are
    // counted for neither reward nor rebate, socializing the rewards across
    // the remaining operators.
    Ok(ValidatorDutiesOutcome {
        participation_share: 0,
        rebate_share: 0,
        strikes: 1,
    })
}

fn calc_rewards_distribution_in_frame(
    participation_shares: &BTreeMap<NodeOperatorId, u64>,
    rebate_share: u64,
    rewards_to_distribute: U256,
    log: &mut FramePerfLog,
) -> BTreeMap<NodeOperatorId, U256> {
    let mut rewards_distribution = BTreeMap::new();

    let operators_shares_sum: u64 = participation_shares.values().sum();
    let total_shares = rebate_share + operators_shares_sum;

    for (operator, participation_share) in participation_shares {
        if *participation_share == 0 {
            continue;
        }
        let rewards = rewards_to_distribute * U256::from(*participation_share) / U256::from(total_shares);
        rewards_distribution.insert(*operator, rewards);
        log.operators.entry(*operator).or_default().participation_share = *participation_share;
    }

    rewards_distribution
}

fn validate_distribution(
    total_distributed: U256,
    total_rebate: U256,
    total_rewards_to_distribute: U256,
) -> Result<(), DistributionError> {
    if total_distributed + total_rebate > total_rewards_to_distribute {
        return Err(DistributionError::InvalidDistribution {
            distributed: total_distributed,
            rebate: total_rebate,
            distributable: total_rewards_to_distribute,
        });
    }
    Ok(())
}

/// Merges the frame's strikes into the accumulated per-key histories: keys
/// striked this frame push their strike, everyone else ages by one sentinel.
/// Histories that carry no strikes anymore are dropped.
fn process_strikes(
    acc: &BTreeMap<StrikesKey, StrikesList>,
    strikes_in_frame: &BTreeMap<StrikesKey, u64>,
    curve_params: &BTreeMap<NodeOperatorId, CurveParams>,
) -> Result<BTreeMap<StrikesKey, StrikesList>, DistributionError> {
    let mut merged = acc.clone();

    for (key, strikes) in strikes_in_frame {
        merged.entry(key.clone()).or_default().push(*strikes);
    }

    let mut out = BTreeMap::new();
    for (key, mut list) in merged {
        let (operator, _) = &key;
        if !strikes_in_frame.contains_key(&key) {
            list.push(STRIKE_SENTINEL); // just shifting
        }
        let lifetime = curve_params
            .get(operator)
            .ok_or(DistributionError::MissingCurveParams(*operator))?
            .strikes_params
            .lifetime;
        list.resize(u64_to_usize(lifetime));
        if list.total() > 0 {
            out.insert(key, list);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EpochRecord;
    use lido_oracle_client::execution::contracts::StrikesParams;
    use lido_oracle_shared::types::Hash256;

    fn curve(leeway_bp: u64, reward_share_bp: u64, lifetime: u64) -> CurveParams {
        CurveParams {
            perf_coeffs: PerformanceCoefficients::default(),
            perf_leeway_data: vec![KeyNumberValueInterval {
                min_key_number: 1,
                value_bp: leeway_bp,
            }],
            reward_share_data: vec![KeyNumberValueInterval {
                min_key_number: 1,
                value_bp: reward_share_bp,
            }],
            strikes_params: StrikesParams { lifetime, threshold: 3 },
        }
    }

    fn blockstamp() -> ReferenceBlockStamp {
        ReferenceBlockStamp {
            state_root: Hash256::ZERO,
            slot_number: 1023,
            block_hash: Hash256::repeat_byte(0xbb),
            block_number: 900,
            block_timestamp: 0,
            ref_slot: 1023,
            ref_epoch: 31,
        }
    }

    fn pubkey(fill: u8) -> BlsPubkey {
        BlsPubkey::repeat_byte(fill)
    }

    fn validator(index: ValidatorIndex, fill: u8, slashed: bool) -> OperatorValidator {
        OperatorValidator {
            index,
            pubkey: pubkey(fill),
            slashed,
        }
    }

    /// State over frame [0; 31] where validator 1 attested perfectly for 10
    /// epochs and nobody else did anything.
    fn state_with_perfect_validator() -> State {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        for epoch in 0..10 {
            state
                .fold_epoch(
                    &EpochRecord {
                        epoch,
                        att_misses: Default::default(),
                        proposals: vec![],
                        syncs: vec![],
                    },
                    [1u64].into_iter(),
                    32,
                )
                .unwrap();
        }
        state
    }

    #[test]
    fn empty_frame_distributes_nothing() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::new(),
            total_rewards_to_distribute: U256::from(500),
            curve_params: BTreeMap::new(),
        };

        let result = calculate(&state, &[input], &[], &BTreeMap::new()).unwrap();
        assert!(result.total_rewards_map.is_empty());
        assert_eq!(result.total_rewards, U256::ZERO);
        assert_eq!(result.total_rebate, U256::ZERO);
        assert!(result.strikes.is_empty());
    }

    #[test]
    fn perfect_validator_takes_the_whole_pot() {
        let state = state_with_perfect_validator();

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::from([(1u64, vec![validator(1, 0x01, false)])]),
            total_rewards_to_distribute: U256::from(100),
            curve_params: BTreeMap::from([(1u64, curve(0, 10_000, 6))]),
        };

        let result = calculate(&state, &[input], &[], &BTreeMap::new()).unwrap();
        assert_eq!(result.total_rewards_map.get(&1), Some(&U256::from(100)));
        assert_eq!(result.total_rewards, U256::from(100));
        assert_eq!(result.total_rebate, U256::ZERO);
        assert!(result.strikes.is_empty());
    }

    #[test]
    fn partial_reward_share_produces_rebate() {
        let state = state_with_perfect_validator();

        // 85% reward share over 10 assigned: ceil(8.5) = 9 shares for the
        // operator, 1 for the rebate.
        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::from([(1u64, vec![validator(1, 0x01, false)])]),
            total_rewards_to_distribute: U256::from(100),
            curve_params: BTreeMap::from([(1u64, curve(0, 8_500, 6))]),
        };

        let result = calculate(&state, &[input], &[], &BTreeMap::new()).unwrap();
        assert_eq!(result.total_rewards_map.get(&1), Some(&U256::from(90)));
        assert_eq!(result.total_rewards, U256::from(90));
        assert_eq!(result.total_rebate, U256::from(10));
    }

    #[test]
    fn slashed_validator_gets_strike_and_no_share() {
        let state = state_with_perfect_validator();

        let prior_strikes =
            BTreeMap::from([((1u64, pubkey(0x02)), StrikesList::new([1, 0, 0, 0, 1, 1]))]);

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::from([(1u64, vec![validator(1, 0x02, true)])]),
            total_rewards_to_distribute: U256::from(100),
            curve_params: BTreeMap::from([(1u64, curve(0, 10_000, 6))]),
        };

        let result = calculate(&state, &[input], &[], &prior_strikes).unwrap();
        assert!(result.total_rewards_map.is_empty());
        assert_eq!(result.total_rewards, U256::ZERO);

        let strikes = result.strikes.get(&(1u64, pubkey(0x02))).unwrap();
        assert_eq!(strikes.to_vec(), vec![1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn untouched_strikes_age_out_and_empty_lists_are_pruned() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();

        let prior_strikes = BTreeMap::from([
            ((1u64, pubkey(0x03)), StrikesList::new([0, 0, 0, 0, 0, 1])),
            ((2u64, pubkey(0x04)), StrikesList::new([1, 1, 0, 0, 0, 0])),
        ]);

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::new(),
            total_rewards_to_distribute: U256::ZERO,
            curve_params: BTreeMap::from([(1u64, curve(0, 10_000, 6)), (2u64, curve(0, 10_000, 6))]),
        };

        let result = calculate(&state, &[input], &[], &prior_strikes).unwrap();
        // Operator 1's only strike fell off the end of the lifetime window.
        assert!(!result.strikes.contains_key(&(1u64, pubkey(0x03))));
        assert_eq!(
            result.strikes.get(&(2u64, pubkey(0x04))).unwrap().to_vec(),
            vec![0, 1, 1, 0, 0, 0]
        );
    }

    #[test]
    fn below_threshold_validator_is_striked_and_rewards_socialized() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        // Validator 1 perfect, validator 2 missing everything.
        for epoch in 0..10 {
            state
                .fold_epoch(
                    &EpochRecord {
                        epoch,
                        att_misses: [2u64].into(),
                        proposals: vec![],
                        syncs: vec![],
                    },
                    [1u64, 2].into_iter(),
                    32,
                )
                .unwrap();
        }

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::from([
                (1u64, vec![validator(1, 0x01, false)]),
                (2u64, vec![validator(2, 0x02, false)]),
            ]),
            total_rewards_to_distribute: U256::from(100),
            curve_params: BTreeMap::from([(1u64, curve(500, 10_000, 6)), (2u64, curve(500, 10_000, 6))]),
        };

        let result = calculate(&state, &[input], &[], &BTreeMap::new()).unwrap();
        // The good validator takes the whole pot; the bad one is striked.
        assert_eq!(result.total_rewards_map.get(&1), Some(&U256::from(100)));
        assert!(!result.total_rewards_map.contains_key(&2));
        assert_eq!(result.strikes.get(&(2u64, pubkey(0x02))).unwrap().total(), 1);
    }

    #[test]
    fn cumulative_rewards_merge_previous_report() {
        let state = state_with_perfect_validator();

        let input = FrameInput {
            frame: (0, 31),
            blockstamp: blockstamp(),
            operators_to_validators: BTreeMap::from([(1u64, vec![validator(1, 0x01, false)])]),
            total_rewards_to_distribute: U256::from(100),
            curve_params: BTreeMap::from([(1u64, curve(0, 10_000, 6))]),
        };

        let last_rewards = vec![(1u64, U256::from(40)), (7u64, U256::from(5))];
        let result = calculate(&state, &[input], &last_rewards, &BTreeMap::new()).unwrap();
        assert_eq!(result.total_rewards_map.get(&1), Some(&U256::from(140)));
        assert_eq!(result.total_rewards_map.get(&7), Some(&U256::from(5)));
        // Newly distributed stays at 100; previous cumulative is not re-counted.
        assert_eq!(result.total_rewards, U256::from(100));
    }

    proptest::proptest! {
        // P1: distributed + rebate never exceeds the distributable pot, and
        // exhausts it when someone participated.
        #[test]
        fn distribution_is_bounded(shares in proptest::collection::btree_map(0u64..20, 1u64..1000, 0..6), rebate in 0u64..500, pot in 0u64..10_000_000) {
            let mut log = FramePerfLog::new(&blockstamp(), (0, 31));
            let map = calc_rewards_distribution_in_frame(&shares, rebate, U256::from(pot), &mut log);
            let distributed: U256 = map.values().copied().sum();
            proptest::prop_assert!(distributed <= U256::from(pot));
        }
    }
}
