//! Checkpoint pipeline: binds duty epochs to canonical history through the
//! `block_roots` ring of a later state, then checks attestation, proposal
//! and sync duties for each epoch and writes the outcome to the duty store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use lido_oracle_client::blockstamp::{self, build_blockstamp, get_prev_non_missed_slot};
use lido_oracle_client::consensus::types::{BlockAttestation, SyncAggregate};
use lido_oracle_client::consensus::{ConsensusClient, StateId};
use lido_oracle_shared::converter::ChainConverter;
use lido_oracle_shared::eth_spec::{EPOCHS_PER_SYNC_COMMITTEE_PERIOD, SLOTS_PER_HISTORICAL_ROOT};
use lido_oracle_shared::types::{BlockStamp, CommitteeIndex, Epoch, Hash256, Slot, ValidatorIndex, ZERO_HASH};
use lido_oracle_shared::util::u64_to_usize;

use crate::store::{DutyStore, EpochRecord, ProposalDuty, SyncDuty};

// Min checkpoint step is 10 because it's a reasonable number of epochs to
// process at once (~1 hour).
pub const MIN_CHECKPOINT_STEP: u64 = 10;
// Max checkpoint step is 255 epochs because the block_roots ring covers 8192
// slots (256 epochs), and every duty epoch needs its own 32 slots plus the
// next epoch's 32 for late inclusion.
pub const MAX_CHECKPOINT_STEP: u64 = 255;
// A duty epoch N is checkable once attestations of epoch N+1 are available;
// the block_roots of the state at the start of epoch N+2 cover both.
pub const CHECKPOINT_SLOT_DELAY_EPOCHS: u64 = 2;

type SlotBlockRoot = (Slot, Option<Hash256>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Minimum checkpoint step is not reached")]
    MinStepIsNotReached,

    #[error("Left border epoch should be less or equal right border epoch: {l_epoch} > {r_epoch}")]
    InvalidEpochRange { l_epoch: Epoch, r_epoch: Epoch },

    #[error("Slot {slot} is out of the state block roots range of checkpoint slot {checkpoint_slot}")]
    SlotOutOfRootsRange { slot: Slot, checkpoint_slot: Slot },

    #[error("Invalid bitstring: {0}")]
    InvalidBits(String),

    #[error("Duty epoch worker panicked: {0}")]
    WorkerPanic(String),

    #[error(transparent)]
    Client(#[from] lido_oracle_client::consensus::Error),

    #[error(transparent)]
    Blockstamp(#[from] blockstamp::Error),

    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCheckpoint {
    /// Slot of the state the trusted block roots come from.
    pub slot: Slot,
    /// At most MAX_CHECKPOINT_STEP epochs.
    pub duty_epochs: Vec<Epoch>,
}

/// Splits `[l_epoch, r_epoch]` into checkpoints, capped by what the
/// finalized epoch already allows checking.
pub struct FrameCheckpointsIterator {
    converter: ChainConverter,
    l_epoch: Epoch,
    max_available_epoch_to_check: Epoch,
}

impl FrameCheckpointsIterator {
    pub fn new(
        converter: ChainConverter,
        l_epoch: Epoch,
        r_epoch: Epoch,
        finalized_epoch: Epoch,
    ) -> Result<Self, Error> {
        if l_epoch > r_epoch {
            return Err(Error::InvalidEpochRange { l_epoch, r_epoch });
        }

        let max_available_epoch_to_check =
            r_epoch.min(finalized_epoch.saturating_sub(CHECKPOINT_SLOT_DELAY_EPOCHS));

        // The processing delay can be negative when the finalized epoch is
        // still behind the next epoch to check.
        if r_epoch > max_available_epoch_to_check {
            let min_step_reached = max_available_epoch_to_check >= l_epoch
                && max_available_epoch_to_check - l_epoch >= MIN_CHECKPOINT_STEP;
            if !min_step_reached {
                tracing::info!(
                    l_epoch,
                    r_epoch,
                    max_available_epoch_to_check,
                    "Minimum checkpoint step is not reached"
                );
                return Err(Error::MinStepIsNotReached);
            }
        }

        Ok(Self {
            converter,
            l_epoch,
            max_available_epoch_to_check,
        })
    }

    pub fn checkpoints(&self) -> Vec<FrameCheckpoint> {
        let mut out = Vec::new();
        let mut epoch = self.l_epoch;
        while epoch <= self.max_available_epoch_to_check {
            let last = (epoch + MAX_CHECKPOINT_STEP - 1).min(self.max_available_epoch_to_check);
            let duty_epochs: Vec<Epoch> = (epoch..=last).collect();
            let checkpoint_slot = self
                .converter
                .get_epoch_first_slot(last + CHECKPOINT_SLOT_DELAY_EPOCHS);
            tracing::info!(
                checkpoint_slot,
                duty_epochs = duty_epochs.len(),
                "Checkpoint prepared"
            );
            out.push(FrameCheckpoint {
                slot: checkpoint_slot,
                duty_epochs,
            });
            epoch = last + 1;
        }
        out
    }
}

/// Sync committees change once per period, so one entry serves up to 256
/// epochs. Bounded by the worker count to keep concurrent checkpoints from
/// evicting each other's entries.
struct SyncCommitteesCache {
    max_size: usize,
    entries: BTreeMap<u64, Vec<ValidatorIndex>>,
}

impl SyncCommitteesCache {
    fn new(concurrency: usize) -> Self {
        Self {
            max_size: concurrency.max(2),
            entries: BTreeMap::new(),
        }
    }

    fn get(&self, period: u64) -> Option<&Vec<ValidatorIndex>> {
        self.entries.get(&period)
    }

    fn insert(&mut self, period: u64, validators: Vec<ValidatorIndex>) {
        if self.entries.len() >= self.max_size {
            let oldest = *self.entries.keys().next().expect("cache is non-empty");
            self.entries.remove(&oldest);
        }
        self.entries.insert(period, validators);
    }
}

pub struct FrameCheckpointProcessor {
    cc: Arc<ConsensusClient>,
    store: Arc<DutyStore>,
    converter: ChainConverter,
    finalized_blockstamp: BlockStamp,
    concurrency: usize,
    sync_cache: Mutex<SyncCommitteesCache>,
}

impl FrameCheckpointProcessor {
    pub fn new(
        cc: Arc<ConsensusClient>,
        store: Arc<DutyStore>,
        converter: ChainConverter,
        finalized_blockstamp: BlockStamp,
        concurrency: usize,
    ) -> Self {
        Self {
            cc,
            store,
            converter,
            finalized_blockstamp,
            concurrency,
            sync_cache: Mutex::new(SyncCommitteesCache::new(concurrency)),
        }
    }

    /// Processes one checkpoint, returning the number of epochs written.
    /// Any worker failure aborts the whole checkpoint.
    pub async fn exec(self: Arc<Self>, checkpoint: &FrameCheckpoint) -> Result<u64, Error> {
        tracing::info!(
            checkpoint_slot = checkpoint.slot,
            epochs = checkpoint.duty_epochs.len(),
            "Processing checkpoint"
        );

        let unprocessed: Vec<Epoch> = checkpoint
            .duty_epochs
            .iter()
            .copied()
            .filter(|e| !self.store.has_epoch(*e))
            .collect();
        if unprocessed.is_empty() {
            tracing::info!("Nothing to process in the checkpoint");
            return Ok(0);
        }

        let block_roots = Arc::new(self.get_block_roots(checkpoint.slot).await?);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<Result<(), Error>> = JoinSet::new();

        for duty_epoch in unprocessed.iter().copied() {
            let (duty_epoch_roots, next_epoch_roots) =
                self.select_block_roots(&block_roots, duty_epoch, checkpoint.slot)?;

            let processor = Arc::clone(&self);
            let roots = Arc::clone(&block_roots);
            let semaphore = Arc::clone(&semaphore);
            let checkpoint_slot = checkpoint.slot;

            workers.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                processor
                    .check_duties(&roots, checkpoint_slot, duty_epoch, duty_epoch_roots, next_epoch_roots)
                    .await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| Error::WorkerPanic(e.to_string()))?;
            if let Err(error) = result {
                workers.abort_all();
                return Err(error);
            }
        }

        Ok(unprocessed.len() as u64)
    }

    /// Fetches the block_roots ring and marks missed slots as `None`: the
    /// ring repeats the previous root for a missed slot, and the pivot (the
    /// oldest entry, about to be overwritten) has to be checked against the
    /// header it claims to be.
    async fn get_block_roots(&self, checkpoint_slot: Slot) -> Result<Vec<Option<Hash256>>, Error> {
        tracing::info!(checkpoint_slot, "Get block roots");
        let roots = self.cc.get_state_block_roots(checkpoint_slot).await?;
        let len = roots.len();

        // `s % 8192` is where slot `s` lives; for s = checkpoint_slot the
        // entry still holds the oldest root, about to be overwritten next slot.
        let pivot_index = u64_to_usize(checkpoint_slot % SLOTS_PER_HISTORICAL_ROOT);

        let pivot_root = roots[pivot_index];
        let is_pivot_missing = if pivot_root == ZERO_HASH {
            true
        } else {
            let pivot_header = self.cc.get_block_header(&StateId::Root(pivot_root)).await?;
            let calculated_pivot_slot = checkpoint_slot.saturating_sub(SLOTS_PER_HISTORICAL_ROOT);
            pivot_header.data.header.message.slot != calculated_pivot_slot
        };

        let mut marked: Vec<Option<Hash256>> = Vec::with_capacity(len);
        for i in 0..len {
            let prev = roots[(i + len - 1) % len];
            let missed = roots[i] == ZERO_HASH || (i != pivot_index && roots[i] == prev);
            marked.push(if missed { None } else { Some(roots[i]) });
        }
        if is_pivot_missing {
            marked[pivot_index] = None;
        }

        Ok(marked)
    }

    /// A duty epoch needs its own 32 slots plus the next epoch's 32 slots,
    /// since attestation inclusion spans one extra epoch.
    fn select_block_roots(
        &self,
        block_roots: &[Option<Hash256>],
        duty_epoch: Epoch,
        checkpoint_slot: Slot,
    ) -> Result<(Vec<SlotBlockRoot>, Vec<SlotBlockRoot>), Error> {
        let first = self.converter.get_epoch_first_slot(duty_epoch);
        let last = self.converter.get_epoch_last_slot(duty_epoch + 1);

        let mut roots_to_check = Vec::with_capacity(u64_to_usize(last - first + 1));
        for slot in first..=last {
            roots_to_check.push((slot, select_block_root_by_slot(block_roots, checkpoint_slot, slot)?));
        }

        let slots_per_epoch = u64_to_usize(self.converter.chain_config.slots_per_epoch);
        let next_epoch_roots = roots_to_check.split_off(slots_per_epoch);
        Ok((roots_to_check, next_epoch_roots))
    }

    async fn check_duties(
        &self,
        checkpoint_block_roots: &[Option<Hash256>],
        checkpoint_slot: Slot,
        duty_epoch: Epoch,
        duty_epoch_roots: Vec<SlotBlockRoot>,
        next_epoch_roots: Vec<SlotBlockRoot>,
    ) -> Result<(), Error> {
        tracing::info!(duty_epoch, "Processing epoch");

        let mut propose_duties = self
            .prepare_propose_duties(duty_epoch, checkpoint_block_roots, checkpoint_slot)
            .await?;
        let (att_committees, mut att_misses) = self.prepare_attestation_duties(duty_epoch).await?;
        let mut sync_duties = self.prepare_sync_committee_duties(duty_epoch).await?;

        let duty_epoch_slots: BTreeSet<Slot> = duty_epoch_roots.iter().map(|(slot, _)| *slot).collect();

        for (slot, root) in duty_epoch_roots.iter().chain(next_epoch_roots.iter()) {
            let Some(root) = root else {
                continue; // missed slot
            };
            let (attestations, sync_aggregate) = self.cc.get_block_attestations_and_sync(*root).await?;
            if duty_epoch_slots.contains(slot) {
                if let Some(duty) = propose_duties.get_mut(slot) {
                    duty.is_proposed = true;
                }
                process_sync(&sync_aggregate, &mut sync_duties)?;
            }
            process_attestations(&attestations, &att_committees, &mut att_misses)?;
        }

        self.store.store_epoch(&EpochRecord {
            epoch: duty_epoch,
            att_misses,
            proposals: propose_duties.into_values().collect(),
            syncs: sync_duties,
        })?;
        Ok(())
    }

    /// Committees of the epoch, with every member seeded as an expected
    /// miss; inclusion processing removes the validators that showed up.
    async fn prepare_attestation_duties(
        &self,
        epoch: Epoch,
    ) -> Result<(HashMap<(Slot, CommitteeIndex), Vec<ValidatorIndex>>, BTreeSet<ValidatorIndex>), Error> {
        let mut committees = HashMap::new();
        let mut misses = BTreeSet::new();
        for committee in self
            .cc
            .get_attestation_committees(&self.finalized_blockstamp, epoch)
            .await?
        {
            misses.extend(committee.validators.iter().copied());
            committees.insert((committee.slot, committee.index), committee.validators);
        }
        Ok((committees, misses))
    }

    async fn prepare_sync_committee_duties(&self, epoch: Epoch) -> Result<Vec<SyncDuty>, Error> {
        let validators = self.get_sync_committee(epoch).await?;
        Ok(validators
            .into_iter()
            .map(|validator_index| SyncDuty {
                validator_index,
                missed_count: 0,
            })
            .collect())
    }

    async fn get_sync_committee(&self, epoch: Epoch) -> Result<Vec<ValidatorIndex>, Error> {
        let period = epoch / EPOCHS_PER_SYNC_COMMITTEE_PERIOD;

        let mut cache = self.sync_cache.lock().await;
        if let Some(validators) = cache.get(period) {
            return Ok(validators.clone());
        }

        let from_epoch = epoch - epoch % EPOCHS_PER_SYNC_COMMITTEE_PERIOD;
        let to_epoch = from_epoch + EPOCHS_PER_SYNC_COMMITTEE_PERIOD - 1;
        tracing::info!(from_epoch, to_epoch, "Preparing cached sync committee for the period");

        let state_details = get_prev_non_missed_slot(
            &self.cc,
            self.converter.get_epoch_first_slot(epoch),
            self.finalized_blockstamp.slot_number,
        )
        .await?;
        let state_blockstamp = build_blockstamp(&state_details);
        let committee = self.cc.get_sync_committee(&state_blockstamp, epoch).await?;

        cache.insert(period, committee.validators.clone());
        Ok(committee.validators)
    }

    async fn prepare_propose_duties(
        &self,
        epoch: Epoch,
        checkpoint_block_roots: &[Option<Hash256>],
        checkpoint_slot: Slot,
    ) -> Result<BTreeMap<Slot, ProposalDuty>, Error> {
        let dependent_root = self
            .get_dependent_root_for_proposer_duties(epoch, checkpoint_block_roots, checkpoint_slot)
            .await?;
        let mut duties = BTreeMap::new();
        for duty in self.cc.get_proposer_duties(epoch, dependent_root).await? {
            duties.insert(
                duty.slot,
                ProposalDuty {
                    slot: duty.slot,
                    validator_index: duty.validator_index,
                    is_proposed: false,
                },
            );
        }
        Ok(duties)
    }

    /// The proposer shuffle of an epoch depends on the last block before the
    /// epoch starts. Prefer the checkpoint's trusted roots; fall back to the
    /// CL once the slot walks out of the ring.
    async fn get_dependent_root_for_proposer_duties(
        &self,
        epoch: Epoch,
        checkpoint_block_roots: &[Option<Hash256>],
        checkpoint_slot: Slot,
    ) -> Result<Hash256, Error> {
        if epoch == 0 {
            return Ok(self.cc.get_block_root(&StateId::Slot(0)).await?);
        }

        let mut dependent_slot = self.converter.get_epoch_last_slot(epoch - 1);
        loop {
            match select_block_root_by_slot(checkpoint_block_roots, checkpoint_slot, dependent_slot) {
                Ok(Some(root)) => {
                    tracing::debug!(epoch, dependent_slot, root = %root, "Got dependent root from state block roots");
                    return Ok(root);
                }
                Ok(None) => {
                    if dependent_slot == 0 {
                        return Ok(self.cc.get_block_root(&StateId::Slot(0)).await?);
                    }
                    dependent_slot -= 1;
                }
                Err(Error::SlotOutOfRootsRange { .. }) => {
                    let details = get_prev_non_missed_slot(
                        &self.cc,
                        dependent_slot,
                        self.finalized_blockstamp.slot_number,
                    )
                    .await?;
                    let root = self.cc.get_block_root(&StateId::Slot(details.message.slot)).await?;
                    tracing::debug!(epoch, dependent_slot, root = %root, "Got dependent root from CL");
                    return Ok(root);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

// https://github.com/ethereum/consensus-specs/blob/dev/specs/phase0/beacon-chain.md#get_block_root_at_slot
fn select_block_root_by_slot(
    block_roots: &[Option<Hash256>],
    checkpoint_slot: Slot,
    root_slot: Slot,
) -> Result<Option<Hash256>, Error> {
    if !(root_slot < checkpoint_slot && checkpoint_slot <= root_slot + SLOTS_PER_HISTORICAL_ROOT) {
        return Err(Error::SlotOutOfRootsRange {
            slot: root_slot,
            checkpoint_slot,
        });
    }
    Ok(block_roots[u64_to_usize(root_slot % SLOTS_PER_HISTORICAL_ROOT)])
}

fn process_sync(sync_aggregate: &SyncAggregate, sync_duties: &mut [SyncDuty]) -> Result<(), Error> {
    // https://github.com/ethereum/consensus-specs/blob/dev/specs/altair/beacon-chain.md#syncaggregate
    let bits = hex_bitvector_to_bits(&sync_aggregate.sync_committee_bits)?;
    for (index_in_committee, bit) in bits.iter().enumerate().take(sync_duties.len()) {
        if !bit {
            sync_duties[index_in_committee].missed_count += 1;
        }
    }
    Ok(())
}

fn process_attestations(
    attestations: &[BlockAttestation],
    committees: &HashMap<(Slot, CommitteeIndex), Vec<ValidatorIndex>>,
    misses: &mut BTreeSet<ValidatorIndex>,
) -> Result<(), Error> {
    for attestation in attestations {
        let att_bits = hex_bitlist_to_bits(&attestation.aggregation_bits)?;
        let att_slot = attestation.data.slot;

        let committee_indices: Vec<CommitteeIndex> = match &attestation.committee_bits {
            Some(bits) => hex_bitvector_to_bits(bits)?
                .iter()
                .enumerate()
                .filter_map(|(i, bit)| bit.then_some(i as u64))
                .collect(),
            None => vec![attestation.data.index],
        };

        let mut committee_offset = 0usize;
        for committee_index in committee_indices {
            let Some(committee) = committees.get(&(att_slot, committee_index)) else {
                // Attestation from a previous or future epoch; it was (or
                // will be) accounted when that epoch is processed.
                continue;
            };
            let committee_bits = att_bits.iter().skip(committee_offset).take(committee.len());
            // Only SET bits matter: a committee can attest partially across
            // several blocks, so an unset bit here may be set in a later one.
            for (index_in_committee, bit) in committee_bits.enumerate() {
                if *bit {
                    misses.remove(&committee[index_in_committee]);
                }
            }
            committee_offset += committee.len();
        }
    }
    Ok(())
}

fn hex_to_bytes(value: &str) -> Result<Vec<u8>, Error> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(stripped).map_err(|e| Error::InvalidBits(format!("{value}: {e}")))
}

fn bytes_to_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| (bytes[i / 8] >> (i % 8)) & 1 == 1).collect()
}

/// SSZ bitvector: fixed length, one bit per member, little-endian per byte.
fn hex_bitvector_to_bits(value: &str) -> Result<Vec<bool>, Error> {
    let bytes = hex_to_bytes(value)?;
    let count = bytes.len() * 8;
    Ok(bytes_to_bits(&bytes, count))
}

/// SSZ bitlist: the highest set bit marks the length and is not a member.
fn hex_bitlist_to_bits(value: &str) -> Result<Vec<bool>, Error> {
    let bytes = hex_to_bytes(value)?;
    let Some(last) = bytes.last() else {
        return Err(Error::InvalidBits(format!("empty bitlist {value}")));
    };
    if *last == 0 {
        return Err(Error::InvalidBits(format!("bitlist without length bit: {value}")));
    }
    let bit_length = (bytes.len() - 1) * 8 + (8 - last.leading_zeros() as usize);
    Ok(bytes_to_bits(&bytes, bit_length - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_oracle_client::consensus::types::AttestationData;
    use lido_oracle_shared::types::ChainConfig;

    fn converter() -> ChainConverter {
        ChainConverter::new(ChainConfig {
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            genesis_time: 0,
        })
    }

    #[test]
    fn bitlist_decoding_strips_the_length_bit() {
        // 0b00001011: members [1,1,0], length bit at position 3.
        assert_eq!(hex_bitlist_to_bits("0x0b").unwrap(), vec![true, true, false]);
        // A single 0x01 byte is an empty bitlist.
        assert_eq!(hex_bitlist_to_bits("0x01").unwrap(), Vec::<bool>::new());
        assert!(hex_bitlist_to_bits("0x00").is_err());
        assert!(hex_bitlist_to_bits("0x").is_err());
    }

    #[test]
    fn bitvector_decoding_is_little_endian_per_byte() {
        let bits = hex_bitvector_to_bits("0x05").unwrap();
        assert_eq!(&bits[..4], &[true, false, true, false]);
        assert_eq!(bits.len(), 8);
    }

    #[test]
    fn iterator_splits_range_into_capped_checkpoints() {
        let iter = FrameCheckpointsIterator::new(converter(), 0, 254, 1000).unwrap();
        let checkpoints = iter.checkpoints();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].duty_epochs.len(), 255);
        // Checkpoint slot is the first slot of max(duty_epochs) + 2.
        assert_eq!(checkpoints[0].slot, (254 + 2) * 32);

        let iter = FrameCheckpointsIterator::new(converter(), 0, 255, 1000).unwrap();
        let checkpoints = iter.checkpoints();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[1].duty_epochs, vec![255]);
    }

    #[test]
    fn iterator_is_capped_by_finalized_epoch() {
        let iter = FrameCheckpointsIterator::new(converter(), 0, 1000, 102).unwrap();
        let checkpoints = iter.checkpoints();
        let last = checkpoints.last().unwrap();
        assert_eq!(*last.duty_epochs.last().unwrap(), 100);
    }

    #[test]
    fn iterator_requires_min_step_when_range_is_capped() {
        // Only 5 epochs available out of the demanded range.
        assert!(matches!(
            FrameCheckpointsIterator::new(converter(), 100, 1000, 107),
            Err(Error::MinStepIsNotReached)
        ));
        // Fully available ranges are processed no matter how small.
        assert!(FrameCheckpointsIterator::new(converter(), 100, 101, 1000).is_ok());
    }

    #[test]
    fn select_root_enforces_ring_bounds() {
        let roots: Vec<Option<Hash256>> = vec![Some(Hash256::repeat_byte(1)); 8192];
        assert!(select_block_root_by_slot(&roots, 10_000, 9_999).is_ok());
        assert!(select_block_root_by_slot(&roots, 10_000, 10_000).is_err());
        assert!(select_block_root_by_slot(&roots, 10_000, 10_000 - 8192 - 1).is_err());
    }

    #[test]
    fn attestation_processing_clears_included_validators() {
        let committees = HashMap::from([
            ((100u64, 0u64), vec![10u64, 11, 12]),
            ((100u64, 1u64), vec![20u64, 21]),
        ]);
        let mut misses: BTreeSet<u64> = [10, 11, 12, 20, 21].into();

        // committee_bits 0b11 = both committees; aggregation bits cover
        // committee 0 (members 0 and 2) and committee 1 (member 1):
        // bits [1,0,1, 0,1] -> 0b00010101 with length bit at 5 -> 0x35.
        let attestation = BlockAttestation {
            aggregation_bits: "0x35".to_owned(),
            committee_bits: Some("0x03".to_owned()),
            data: AttestationData { slot: 100, index: 0 },
        };

        process_attestations(std::slice::from_ref(&attestation), &committees, &mut misses).unwrap();
        assert_eq!(misses, [11, 20].into());

        // Same attestation seen in another block changes nothing.
        process_attestations(std::slice::from_ref(&attestation), &committees, &mut misses).unwrap();
        assert_eq!(misses, [11, 20].into());
    }

    #[test]
    fn attestations_for_unknown_committees_are_skipped() {
        let committees = HashMap::from([((100u64, 0u64), vec![1u64])]);
        let mut misses: BTreeSet<u64> = [1].into();
        let attestation = BlockAttestation {
            aggregation_bits: "0x03".to_owned(),
            committee_bits: None,
            data: AttestationData { slot: 999, index: 0 },
        };
        process_attestations(&[attestation], &committees, &mut misses).unwrap();
        assert_eq!(misses, [1].into());
    }

    #[test]
    fn sync_processing_counts_unset_bits() {
        let mut duties: Vec<SyncDuty> = (0..8)
            .map(|validator_index| SyncDuty {
                validator_index,
                missed_count: 0,
            })
            .collect();
        // 0b10100101: members 1, 3, 4, 6 missed.
        let aggregate = SyncAggregate {
            sync_committee_bits: "0xa5".to_owned(),
        };
        process_sync(&aggregate, &mut duties).unwrap();
        let missed: Vec<u64> = duties.iter().filter(|d| d.missed_count > 0).map(|d| d.validator_index).collect();
        assert_eq!(missed, vec![1, 3, 4, 6]);
    }
}
