//! Per-frame duty aggregates of the whole network, folded from the duty
//! store and snapshotted to disk between cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lido_oracle_shared::duties::{DutyAccumulator, ValidatorDuties};
use lido_oracle_shared::types::{Epoch, ValidatorIndex};

use crate::store::EpochRecord;

pub type Frame = (Epoch, Epoch);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("State is not fulfilled, unprocessed epochs remain: {0:?}")]
    NotFulfilled(Vec<Epoch>),

    #[error("Processed epoch {0} is out of the report range")]
    ProcessedEpochOutOfRange(Epoch),

    #[error("Epoch range [{l_epoch}; {r_epoch}] is not divisible into frames of {epochs_per_frame} epochs")]
    InvalidFrames {
        l_epoch: Epoch,
        r_epoch: Epoch,
        epochs_per_frame: u64,
    },

    #[error("Epoch {0} does not belong to any frame of the state")]
    EpochOutOfFrames(Epoch),

    #[error("Failed to persist state snapshot at {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error(transparent)]
    Duties(#[from] lido_oracle_shared::duties::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDuties {
    pub attestations: BTreeMap<ValidatorIndex, DutyAccumulator>,
    pub proposals: BTreeMap<ValidatorIndex, DutyAccumulator>,
    pub syncs: BTreeMap<ValidatorIndex, DutyAccumulator>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    pub frame: Frame,
    pub duties: NetworkDuties,
}

/// Processing state of one report's epoch range. Everything here is
/// recomputable from the duty store; the snapshot only saves the folding
/// work across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub data: Vec<FrameData>,
    pub epochs_to_process: BTreeSet<Epoch>,
    pub processed_epochs: BTreeSet<Epoch>,
    pub consensus_version: u64,
}

pub fn calculate_frames(l_epoch: Epoch, r_epoch: Epoch, epochs_per_frame: u64) -> Result<Vec<Frame>, StateError> {
    let total = r_epoch - l_epoch + 1;
    if total % epochs_per_frame != 0 {
        return Err(StateError::InvalidFrames {
            l_epoch,
            r_epoch,
            epochs_per_frame,
        });
    }
    Ok((0..total / epochs_per_frame)
        .map(|i| {
            let from = l_epoch + i * epochs_per_frame;
            (from, from + epochs_per_frame - 1)
        })
        .collect())
}

impl State {
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => {
                    tracing::info!(path = %path.display(), "State snapshot restored");
                    state
                }
                Err(error) => {
                    tracing::info!(path = %path.display(), %error, "Unable to restore state snapshot, starting empty");
                    State::default()
                }
            },
            Err(_) => State::default(),
        }
    }

    pub fn commit(&self, path: &Path) -> Result<(), StateError> {
        let buf_path = path.with_extension("buf");
        let persist_err = |reason: String| StateError::Persist {
            path: path.display().to_string(),
            reason,
        };

        let bytes = serde_json::to_vec(self).map_err(|e| persist_err(e.to_string()))?;
        fs::write(&buf_path, bytes).map_err(|e| persist_err(e.to_string()))?;
        fs::rename(&buf_path, path).map_err(|e| persist_err(e.to_string()))?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.epochs_to_process.is_empty() && self.processed_epochs.is_empty()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.data.iter().map(|fd| fd.frame).collect()
    }

    pub fn frame_of(&self, epoch: Epoch) -> Result<Frame, StateError> {
        self.data
            .iter()
            .map(|fd| fd.frame)
            .find(|(from, to)| (*from..=*to).contains(&epoch))
            .ok_or(StateError::EpochOutOfFrames(epoch))
    }

    /// Brings the state in line with the demanded range. Frames already
    /// folded stay; everything else is discarded and re-collected.
    pub fn init_or_migrate(
        &mut self,
        l_epoch: Epoch,
        r_epoch: Epoch,
        epochs_per_frame: u64,
        consensus_version: u64,
    ) -> Result<(), StateError> {
        let frames = calculate_frames(l_epoch, r_epoch, epochs_per_frame)?;

        if self.consensus_version != consensus_version {
            tracing::warn!(
                old = self.consensus_version,
                new = consensus_version,
                "Consensus version changed, discarding state"
            );
            *self = State::default();
        }

        let mut migrated = Vec::with_capacity(frames.len());
        let mut kept_epochs: BTreeSet<Epoch> = BTreeSet::new();
        for frame in &frames {
            match self.data.iter().find(|fd| fd.frame == *frame) {
                Some(existing) => {
                    kept_epochs.extend(
                        self.processed_epochs
                            .iter()
                            .copied()
                            .filter(|e| (frame.0..=frame.1).contains(e)),
                    );
                    migrated.push(existing.clone());
                }
                None => migrated.push(FrameData {
                    frame: *frame,
                    duties: NetworkDuties::default(),
                }),
            }
        }

        self.data = migrated;
        self.epochs_to_process = (l_epoch..=r_epoch).collect();
        self.processed_epochs = kept_epochs;
        self.consensus_version = consensus_version;
        Ok(())
    }

    /// Folds one epoch record into its frame. `assigned_validators` is the
    /// set of validators with an attestation duty in the epoch, i.e. the
    /// validators active at that epoch.
    pub fn fold_epoch(
        &mut self,
        record: &EpochRecord,
        assigned_validators: impl Iterator<Item = ValidatorIndex>,
        slots_per_epoch: u64,
    ) -> Result<(), StateError> {
        if self.processed_epochs.contains(&record.epoch) {
            return Ok(());
        }
        let frame = self.frame_of(record.epoch)?;
        let duties = &mut self
            .data
            .iter_mut()
            .find(|fd| fd.frame == frame)
            .expect("frame_of returned a frame of this state")
            .duties;

        for validator in assigned_validators {
            duties
                .attestations
                .entry(validator)
                .or_default()
                .add(!record.att_misses.contains(&validator));
        }
        for proposal in &record.proposals {
            duties
                .proposals
                .entry(proposal.validator_index)
                .or_default()
                .add(proposal.is_proposed);
        }
        for sync in &record.syncs {
            let acc = duties.syncs.entry(sync.validator_index).or_default();
            acc.assigned += slots_per_epoch;
            acc.included += slots_per_epoch - sync.missed_count.min(slots_per_epoch);
        }

        self.processed_epochs.insert(record.epoch);
        Ok(())
    }

    pub fn unprocessed_epochs(&self) -> Vec<Epoch> {
        self.epochs_to_process.difference(&self.processed_epochs).copied().collect()
    }

    pub fn validate_for_report(&self, l_epoch: Epoch, r_epoch: Epoch) -> Result<(), StateError> {
        let unprocessed = self.unprocessed_epochs();
        if !unprocessed.is_empty() {
            return Err(StateError::NotFulfilled(unprocessed));
        }
        for epoch in &self.processed_epochs {
            if !(l_epoch..=r_epoch).contains(epoch) {
                return Err(StateError::ProcessedEpochOutOfRange(*epoch));
            }
        }
        Ok(())
    }

    pub fn get_validator_duties(&self, frame: Frame, validator: ValidatorIndex) -> ValidatorDuties {
        let Some(duties) = self.data.iter().find(|fd| fd.frame == frame).map(|fd| &fd.duties) else {
            return ValidatorDuties::default();
        };
        ValidatorDuties {
            attestation: duties.attestations.get(&validator).copied(),
            proposal: duties.proposals.get(&validator).copied(),
            sync: duties.syncs.get(&validator).copied(),
        }
    }

    pub fn attestation_of(&self, frame: Frame, validator: ValidatorIndex) -> Option<DutyAccumulator> {
        self.data
            .iter()
            .find(|fd| fd.frame == frame)
            .and_then(|fd| fd.duties.attestations.get(&validator).copied())
    }

    fn network_aggr(
        accs: &BTreeMap<ValidatorIndex, DutyAccumulator>,
    ) -> Result<Option<DutyAccumulator>, StateError> {
        if accs.is_empty() {
            return Ok(None);
        }
        let mut total = DutyAccumulator::default();
        for acc in accs.values() {
            acc.validate()?;
            total.merge(*acc);
        }
        Ok(Some(total))
    }

    /// Network-wide aggregates of the frame, used for the performance
    /// threshold. Duty kinds with no data contribute no weight.
    pub fn get_network_duties(&self, frame: Frame) -> Result<ValidatorDuties, StateError> {
        let Some(duties) = self.data.iter().find(|fd| fd.frame == frame).map(|fd| &fd.duties) else {
            return Ok(ValidatorDuties::default());
        };
        Ok(ValidatorDuties {
            attestation: Self::network_aggr(&duties.attestations)?,
            proposal: Self::network_aggr(&duties.proposals)?,
            sync: Self::network_aggr(&duties.syncs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ProposalDuty, SyncDuty};

    fn record(epoch: Epoch, misses: &[ValidatorIndex]) -> EpochRecord {
        EpochRecord {
            epoch,
            att_misses: misses.iter().copied().collect(),
            proposals: vec![ProposalDuty {
                slot: epoch * 32,
                validator_index: 0,
                is_proposed: true,
            }],
            syncs: vec![SyncDuty {
                validator_index: 1,
                missed_count: 2,
            }],
        }
    }

    #[test]
    fn frames_split_evenly_or_error() {
        assert_eq!(calculate_frames(0, 31, 32).unwrap(), vec![(0, 31)]);
        assert_eq!(calculate_frames(0, 63, 32).unwrap(), vec![(0, 31), (32, 63)]);
        assert!(matches!(
            calculate_frames(0, 30, 32),
            Err(StateError::InvalidFrames { .. })
        ));
    }

    #[test]
    fn folding_accumulates_duties() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();

        state.fold_epoch(&record(0, &[2]), [0u64, 1, 2].into_iter(), 32).unwrap();
        state.fold_epoch(&record(1, &[]), [0u64, 1, 2].into_iter(), 32).unwrap();

        let duties = state.get_validator_duties((0, 31), 2);
        assert_eq!(duties.attestation.unwrap().assigned, 2);
        assert_eq!(duties.attestation.unwrap().included, 1);

        let proposer = state.get_validator_duties((0, 31), 0);
        assert_eq!(proposer.proposal.unwrap().assigned, 2);

        let syncer = state.get_validator_duties((0, 31), 1);
        assert_eq!(syncer.sync.unwrap().assigned, 64);
        assert_eq!(syncer.sync.unwrap().included, 60);
    }

    #[test]
    fn folding_same_epoch_twice_is_noop() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        state.fold_epoch(&record(0, &[]), [0u64].into_iter(), 32).unwrap();
        state.fold_epoch(&record(0, &[]), [0u64].into_iter(), 32).unwrap();
        assert_eq!(state.get_validator_duties((0, 31), 0).attestation.unwrap().assigned, 1);
    }

    #[test]
    fn validate_for_report_requires_full_range() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        assert!(matches!(
            state.validate_for_report(0, 31),
            Err(StateError::NotFulfilled(_))
        ));

        for epoch in 0..=31 {
            state.fold_epoch(&record(epoch, &[]), [0u64].into_iter(), 32).unwrap();
        }
        state.validate_for_report(0, 31).unwrap();
    }

    #[test]
    fn migration_keeps_matching_frames() {
        let mut state = State::default();
        state.init_or_migrate(0, 63, 32, 1).unwrap();
        for epoch in 0..=31 {
            state.fold_epoch(&record(epoch, &[]), [0u64].into_iter(), 32).unwrap();
        }

        // Range moves forward by one frame: (0,31) is dropped, (32,63) kept.
        state.init_or_migrate(32, 95, 32, 1).unwrap();
        assert_eq!(state.frames(), vec![(32, 63), (64, 95)]);
        assert!(state.processed_epochs.is_empty());

        // Same range again keeps the processed epochs.
        let mut state = State::default();
        state.init_or_migrate(0, 63, 32, 1).unwrap();
        for epoch in 0..=31 {
            state.fold_epoch(&record(epoch, &[]), [0u64].into_iter(), 32).unwrap();
        }
        state.init_or_migrate(0, 63, 32, 1).unwrap();
        assert_eq!(state.processed_epochs.len(), 32);
    }

    #[test]
    fn consensus_version_change_discards_state() {
        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        state.fold_epoch(&record(0, &[]), [0u64].into_iter(), 32).unwrap();

        state.init_or_migrate(0, 31, 32, 2).unwrap();
        assert!(state.processed_epochs.is_empty());
        assert_eq!(state.consensus_version, 2);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = State::default();
        state.init_or_migrate(0, 31, 32, 1).unwrap();
        state.fold_epoch(&record(3, &[5]), [5u64, 6].into_iter(), 32).unwrap();
        state.commit(&path).unwrap();

        let restored = State::load(&path);
        assert_eq!(restored, state);
        assert!(!path.with_extension("buf").exists());
    }
}
