//! Safe border: the earliest epoch up to which withdrawal requests can be
//! finalized without socializing not-yet-accounted losses.
//!
//! In turbo mode there is a single border shifted back from the reference
//! epoch. In bunker mode the border also accounts for the negative-rebase
//! window and for associated slashings, taking the earliest of the three.
//! See the research: https://hackmd.io/@lido/r1Qkkiv3j

use thiserror::Error;

use lido_oracle_client::blockstamp::{self, get_blockstamp};
use lido_oracle_client::consensus as cl;
use lido_oracle_client::execution::contracts::daemon_config_keys;
use lido_oracle_client::execution::ContractError;
use lido_oracle_shared::converter::FrameConverter;
use lido_oracle_shared::eth_spec::{EPOCHS_PER_SLASHINGS_VECTOR, MIN_VALIDATOR_WITHDRAWABILITY_DELAY};
use lido_oracle_shared::types::{BlsPubkey, Epoch, FrameNumber, IndexedValidator, ReferenceBlockStamp};

use crate::lido_validators::{filter_non_withdrawable_validators, filter_slashed_validators};
use crate::Web3Context;

#[derive(Debug, Error)]
pub enum SafeBorderError {
    #[error("exit_epoch and withdrawable_epoch of validator {validator_index} are too close")]
    WrongExitPeriod { validator_index: u64 },

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Client(#[from] cl::Error),

    #[error(transparent)]
    Blockstamp(#[from] blockstamp::Error),
}

/// Epochs between a withdrawal request and the earliest report allowed to
/// finalize it, from the sanity checker's request timestamp margin.
pub fn finalization_default_shift(request_timestamp_margin: u64, slots_per_epoch: u64, seconds_per_slot: u64) -> u64 {
    request_timestamp_margin.div_ceil(slots_per_epoch * seconds_per_slot)
}

/// When detectable from the validator state alone, the slashing epoch is
/// `withdrawable_epoch - EPOCHS_PER_SLASHINGS_VECTOR`. An exit period equal
/// to the minimal withdrawability delay means the exit queue was so long
/// that the slashing moment is undetectable - `None` sends the caller to
/// the frame binary search.
pub fn predict_earliest_slashed_epoch(validator: &IndexedValidator) -> Result<Option<Epoch>, SafeBorderError> {
    let exit_epoch = validator.validator.exit_epoch;
    let withdrawable_epoch = validator.validator.withdrawable_epoch;
    let exited_period = withdrawable_epoch - exit_epoch;

    if exited_period < MIN_VALIDATOR_WITHDRAWABILITY_DELAY {
        return Err(SafeBorderError::WrongExitPeriod {
            validator_index: validator.index,
        });
    }
    if exited_period == MIN_VALIDATOR_WITHDRAWABILITY_DELAY {
        return Ok(None);
    }
    Ok(Some(withdrawable_epoch - EPOCHS_PER_SLASHINGS_VECTOR))
}

pub struct SafeBorder<'a> {
    ctx: &'a Web3Context,
    blockstamp: ReferenceBlockStamp,
    converter: FrameConverter,
    finalization_default_shift: u64,
}

impl<'a> SafeBorder<'a> {
    pub async fn init(
        ctx: &'a Web3Context,
        blockstamp: &ReferenceBlockStamp,
        converter: FrameConverter,
    ) -> Result<SafeBorder<'a>, SafeBorderError> {
        let margin = ctx
            .sanity_checker
            .get_request_timestamp_margin(blockstamp.block_hash)
            .await?;
        Ok(SafeBorder {
            ctx,
            blockstamp: *blockstamp,
            finalization_default_shift: finalization_default_shift(
                margin,
                converter.chain_config.slots_per_epoch,
                converter.chain_config.seconds_per_slot,
            ),
            converter,
        })
    }

    pub async fn get_safe_border_epoch(
        &self,
        is_bunker: bool,
        lido_validators: &[&IndexedValidator],
    ) -> Result<Epoch, SafeBorderError> {
        if !is_bunker {
            return Ok(self.default_border_epoch());
        }

        let negative_rebase_border = self.negative_rebase_border_epoch().await?;
        let associated_slashings_border = self.associated_slashings_border_epoch(lido_validators).await?;

        Ok(negative_rebase_border.min(associated_slashings_border))
    }

    /// The default border sits a fixed number of epochs before the report
    /// reference epoch.
    fn default_border_epoch(&self) -> Epoch {
        self.blockstamp.ref_epoch - self.finalization_default_shift
    }

    /// With a negative rebase the border is the last point known to be
    /// unaffected: the bunker activation moment (or the last successful
    /// report before it), clamped by the maximal negative-rebase lookback.
    async fn negative_rebase_border_epoch(&self) -> Result<Epoch, SafeBorderError> {
        let bunker_start_or_last_report = self.bunker_start_or_last_successful_report_epoch().await?;
        let latest_allowable_epoch = bunker_start_or_last_report.saturating_sub(self.finalization_default_shift);

        let max_negative_rebase_shift = self
            .ctx
            .daemon_config
            .get_u64(
                daemon_config_keys::FINALIZATION_MAX_NEGATIVE_REBASE_EPOCH_SHIFT,
                self.blockstamp.block_hash,
            )
            .await?;
        let earliest_allowable_epoch = self
            .converter
            .get_epoch_by_slot(self.blockstamp.ref_slot)
            .saturating_sub(max_negative_rebase_shift);

        Ok(earliest_allowable_epoch.max(latest_allowable_epoch))
    }

    async fn bunker_start_or_last_successful_report_epoch(&self) -> Result<Epoch, SafeBorderError> {
        let bunker_start_timestamp = self
            .ctx
            .withdrawal_queue
            .bunker_mode_since_timestamp(self.blockstamp.block_hash)
            .await?;
        // The contract returns a far-future sentinel while bunker mode is off.
        if bunker_start_timestamp <= self.blockstamp.block_timestamp {
            return Ok(self.converter.get_epoch_by_timestamp(bunker_start_timestamp));
        }

        let last_report_slot = self
            .ctx
            .accounting_oracle_base
            .get_last_processing_ref_slot(self.blockstamp.block_hash)
            .await?;
        if last_report_slot != 0 {
            return Ok(self.converter.get_epoch_by_slot(last_report_slot));
        }

        Ok(self.converter.frame_config.initial_epoch)
    }

    /// The latest epoch before any of the still-incomplete slashings could
    /// have started, rounded down to its frame.
    async fn associated_slashings_border_epoch(
        &self,
        lido_validators: &[&IndexedValidator],
    ) -> Result<Epoch, SafeBorderError> {
        let slashed = filter_slashed_validators(lido_validators.iter().copied());
        let non_withdrawable = filter_non_withdrawable_validators(slashed, self.blockstamp.ref_epoch);

        if non_withdrawable.is_empty() {
            return Ok(self.default_border_epoch());
        }

        let mut earliest_predicted: Option<Epoch> = None;
        for validator in &non_withdrawable {
            match predict_earliest_slashed_epoch(validator)? {
                // A prediction of epoch 0 carries no more information than
                // "undetectable"; both fall back to the frame binary search.
                None | Some(0) => {
                    let found = self.find_earliest_slashed_epoch_rounded_to_frame(&non_withdrawable).await?;
                    return Ok(self.border_by_earliest_slashed_epoch(found));
                }
                Some(epoch) => {
                    earliest_predicted = Some(earliest_predicted.map_or(epoch, |e: u64| e.min(epoch)));
                }
            }
        }

        let earliest = earliest_predicted.expect("non_withdrawable is non-empty");
        Ok(self.border_by_earliest_slashed_epoch(earliest))
    }

    /// An earliest slashed epoch of 0 means the slashings predate anything
    /// worth bordering on; the default border applies.
    fn border_by_earliest_slashed_epoch(&self, earliest_slashed_epoch: Epoch) -> Epoch {
        if earliest_slashed_epoch == 0 {
            return self.default_border_epoch();
        }
        self.converter
            .round_epoch_by_frame(earliest_slashed_epoch)
            .saturating_sub(self.finalization_default_shift)
    }

    /// Binary search by frame for the first frame with at least one of the
    /// candidates already slashed. The slashed flag can't be undone, so the
    /// predicate is monotone over frames and checking each frame's last slot
    /// is enough. O(log(frames)) validator-set fetches.
    async fn find_earliest_slashed_epoch_rounded_to_frame(
        &self,
        validators: &[&IndexedValidator],
    ) -> Result<Epoch, SafeBorderError> {
        let last_finalized_request_epoch = self.last_finalized_withdrawal_request_epoch().await?;
        let earliest_activation_epoch = validators
            .iter()
            .map(|v| v.validator.activation_epoch)
            .min()
            .expect("validators are non-empty");
        let start_epoch = last_finalized_request_epoch.max(earliest_activation_epoch);

        let min_withdrawable_epoch = validators
            .iter()
            .map(|v| v.validator.withdrawable_epoch)
            .min()
            .expect("validators are non-empty");
        let max_possible_earliest_slashed_epoch = min_withdrawable_epoch - EPOCHS_PER_SLASHINGS_VECTOR;
        let end_epoch = self.blockstamp.ref_epoch.min(max_possible_earliest_slashed_epoch);

        let mut start_frame = self.converter.get_frame_by_epoch(start_epoch);
        let mut end_frame = self.converter.get_frame_by_epoch(end_epoch);

        let slashed_pubkeys: std::collections::HashSet<BlsPubkey> =
            validators.iter().map(|v| v.validator.pubkey).collect();

        while start_frame < end_frame {
            let mid_frame = (start_frame + end_frame) / 2;
            if self.slashings_in_frame(mid_frame, &slashed_pubkeys).await? {
                end_frame = mid_frame;
            } else {
                start_frame = mid_frame + 1;
            }
        }

        let slot = self.converter.get_frame_first_slot(start_frame);
        Ok(self.converter.get_epoch_by_slot(slot))
    }

    async fn slashings_in_frame(
        &self,
        frame: FrameNumber,
        slashed_pubkeys: &std::collections::HashSet<BlsPubkey>,
    ) -> Result<bool, SafeBorderError> {
        let last_slot_in_frame = self.converter.get_frame_last_slot(frame);
        let frame_blockstamp = get_blockstamp(&self.ctx.cc, last_slot_in_frame, self.blockstamp.ref_slot).await?;

        let validators = self.ctx.cc.get_validators(&frame_blockstamp).await?;
        let any_slashed = validators
            .iter()
            .any(|v| v.validator.slashed && slashed_pubkeys.contains(&v.validator.pubkey));
        Ok(any_slashed)
    }

    async fn last_finalized_withdrawal_request_epoch(&self) -> Result<Epoch, SafeBorderError> {
        let request_id = self
            .ctx
            .withdrawal_queue
            .get_last_finalized_request_id(self.blockstamp.block_hash)
            .await?;
        // Request id 0 is reserved by the protocol: nothing was finalized.
        if request_id == 0 {
            return Ok(0);
        }
        let timestamp = self
            .ctx
            .withdrawal_queue
            .get_withdrawal_request_timestamp(request_id, self.blockstamp.block_hash)
            .await?;
        Ok(self.converter.get_epoch_by_timestamp(timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_oracle_shared::types::{Hash256, Validator};

    #[test]
    fn default_shift_from_mainnet_margin() {
        // One day margin over 12-second slots and 32-slot epochs.
        assert_eq!(finalization_default_shift(24 * 60 * 60, 32, 12), 225);
        // Rounds up on a non-divisible margin.
        assert_eq!(finalization_default_shift(24 * 60 * 60 + 1, 32, 12), 226);
    }

    fn slashed_validator(exit_epoch: Epoch, withdrawable_epoch: Epoch) -> IndexedValidator {
        IndexedValidator {
            index: 1,
            balance: 0,
            validator: Validator {
                pubkey: Default::default(),
                withdrawal_credentials: Hash256::ZERO,
                effective_balance: 0,
                slashed: true,
                activation_eligibility_epoch: 0,
                activation_epoch: 0,
                exit_epoch,
                withdrawable_epoch,
            },
        }
    }

    #[test]
    fn slashed_epoch_prediction() {
        // Normal exit period: directly computable.
        let v = slashed_validator(1000, 1000 + EPOCHS_PER_SLASHINGS_VECTOR);
        assert_eq!(
            predict_earliest_slashed_epoch(&v).unwrap(),
            Some(1000 + EPOCHS_PER_SLASHINGS_VECTOR - EPOCHS_PER_SLASHINGS_VECTOR)
        );

        // Exit period equal to the minimal delay: undetectable.
        let v = slashed_validator(1000, 1000 + MIN_VALIDATOR_WITHDRAWABILITY_DELAY);
        assert_eq!(predict_earliest_slashed_epoch(&v).unwrap(), None);

        // Shorter than the minimal delay is impossible on a sane chain.
        let v = slashed_validator(1000, 1000 + MIN_VALIDATOR_WITHDRAWABILITY_DELAY - 1);
        assert!(matches!(
            predict_earliest_slashed_epoch(&v),
            Err(SafeBorderError::WrongExitPeriod { .. })
        ));
    }
}
