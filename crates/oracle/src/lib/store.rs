//! Durable per-epoch duty store shared between the performance collector
//! (writer) and the performance oracle (reader).
//!
//! Layout: one JSON record per epoch under `<root>/epochs/`, plus a demand
//! register at `<root>/demand.json`. Records are written to a `.buf` file
//! and renamed into place, so a record either exists completely or not at
//! all; readers never observe partial writes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lido_oracle_shared::types::{Epoch, Slot, ValidatorIndex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Epoch {epoch} is already stored with a different payload")]
    ConflictingRewrite { epoch: Epoch },

    #[error("Duty store record for epoch {epoch} is corrupted: {reason}")]
    Corrupted { epoch: Epoch, reason: String },

    #[error("Demand register is corrupted: {0}")]
    DemandCorrupted(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDuty {
    pub slot: Slot,
    pub validator_index: ValidatorIndex,
    pub is_proposed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDuty {
    pub validator_index: ValidatorIndex,
    pub missed_count: u64,
}

/// Duty outcomes of one epoch. Append-only: an epoch record never changes
/// once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: Epoch,
    /// Validators that were assigned an attestation duty in the epoch and
    /// did not get it included by the end of the next epoch.
    pub att_misses: BTreeSet<ValidatorIndex>,
    /// One entry per slot of the epoch, in slot order.
    pub proposals: Vec<ProposalDuty>,
    /// One entry per sync-committee member.
    pub syncs: Vec<SyncDuty>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DemandRegister {
    demands: BTreeMap<String, (Epoch, Epoch)>,
    nonce: u64,
}

pub struct DutyStore {
    epochs_dir: PathBuf,
    demand_path: PathBuf,
    // Guards the write path only; reads go straight to the filesystem.
    write_lock: Mutex<()>,
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let buf_path = path.with_extension("buf");
    let io_err = |source| Error::Io {
        path: buf_path.clone(),
        source,
    };

    let mut file = fs::File::create(&buf_path).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    fs::rename(&buf_path, path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl DutyStore {
    pub fn open(root: &Path) -> Result<Self, Error> {
        let epochs_dir = root.join("epochs");
        fs::create_dir_all(&epochs_dir).map_err(|source| Error::Io {
            path: epochs_dir.clone(),
            source,
        })?;
        // Drop a leftover write buffer from a crashed run; the target record
        // was never visible, so the write simply did not happen.
        for entry in fs::read_dir(&epochs_dir).map_err(|source| Error::Io {
            path: epochs_dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| Error::Io {
                path: epochs_dir.clone(),
                source,
            })?;
            if entry.path().extension().is_some_and(|ext| ext == "buf") {
                tracing::warn!(path = %entry.path().display(), "Removing stale write buffer");
                let _ = fs::remove_file(entry.path());
            }
        }

        Ok(Self {
            demand_path: root.join("demand.json"),
            epochs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn epoch_path(&self, epoch: Epoch) -> PathBuf {
        self.epochs_dir.join(format!("{epoch}.json"))
    }

    /// Atomic and idempotent: a byte-identical rewrite is a no-op, anything
    /// else is rejected.
    pub fn store_epoch(&self, record: &EpochRecord) -> Result<(), Error> {
        let _guard = self.write_lock.lock().expect("no poisoned lock");

        let path = self.epoch_path(record.epoch);
        let bytes = serde_json::to_vec(record).expect("epoch record serialization is infallible");

        if path.exists() {
            let existing = fs::read(&path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?;
            if existing == bytes {
                return Ok(());
            }
            return Err(Error::ConflictingRewrite { epoch: record.epoch });
        }

        atomic_write(&path, &bytes)
    }

    pub fn get_epoch(&self, epoch: Epoch) -> Result<Option<EpochRecord>, Error> {
        let path = self.epoch_path(epoch);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Io { path, source }),
        };
        let record: EpochRecord = serde_json::from_slice(&bytes).map_err(|e| Error::Corrupted {
            epoch,
            reason: e.to_string(),
        })?;
        if record.epoch != epoch {
            return Err(Error::Corrupted {
                epoch,
                reason: format!("record claims epoch {}", record.epoch),
            });
        }
        Ok(Some(record))
    }

    pub fn has_epoch(&self, epoch: Epoch) -> bool {
        self.epoch_path(epoch).exists()
    }

    fn stored_epochs(&self) -> Result<BTreeSet<Epoch>, Error> {
        let mut epochs = BTreeSet::new();
        let entries = fs::read_dir(&self.epochs_dir).map_err(|source| Error::Io {
            path: self.epochs_dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                path: self.epochs_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(epoch) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                epochs.insert(epoch);
            }
        }
        Ok(epochs)
    }

    pub fn min_epoch(&self) -> Result<Option<Epoch>, Error> {
        Ok(self.stored_epochs()?.first().copied())
    }

    pub fn max_epoch(&self) -> Result<Option<Epoch>, Error> {
        Ok(self.stored_epochs()?.last().copied())
    }

    pub fn missing_epochs_in(&self, l_epoch: Epoch, r_epoch: Epoch) -> Result<Vec<Epoch>, Error> {
        let stored = self.stored_epochs()?;
        Ok((l_epoch..=r_epoch).filter(|e| !stored.contains(e)).collect())
    }

    pub fn is_range_available(&self, l_epoch: Epoch, r_epoch: Epoch) -> Result<bool, Error> {
        Ok(self.missing_epochs_in(l_epoch, r_epoch)?.is_empty())
    }

    fn read_demand(&self) -> Result<DemandRegister, Error> {
        let bytes = match fs::read(&self.demand_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(DemandRegister::default()),
            Err(source) => {
                return Err(Error::Io {
                    path: self.demand_path.clone(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| Error::DemandCorrupted(e.to_string()))
    }

    /// Registers (or updates) a consumer's required epoch range. The nonce
    /// moves only when the registered set actually changes, so pollers can
    /// compare nonces instead of ranges.
    pub fn set_epochs_demand(&self, consumer: &str, l_epoch: Epoch, r_epoch: Epoch) -> Result<(), Error> {
        let _guard = self.write_lock.lock().expect("no poisoned lock");

        let mut register = self.read_demand()?;
        if register.demands.get(consumer) == Some(&(l_epoch, r_epoch)) {
            return Ok(());
        }
        register.demands.insert(consumer.to_owned(), (l_epoch, r_epoch));
        register.nonce += 1;

        let bytes = serde_json::to_vec(&register).expect("demand register serialization is infallible");
        atomic_write(&self.demand_path, &bytes)
    }

    pub fn epochs_demand(&self) -> Result<BTreeMap<String, (Epoch, Epoch)>, Error> {
        Ok(self.read_demand()?.demands)
    }

    pub fn epochs_demand_nonce(&self) -> Result<u64, Error> {
        Ok(self.read_demand()?.nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: Epoch) -> EpochRecord {
        EpochRecord {
            epoch,
            att_misses: BTreeSet::from([7, 12]),
            proposals: vec![ProposalDuty {
                slot: epoch * 32,
                validator_index: 3,
                is_proposed: true,
            }],
            syncs: vec![SyncDuty {
                validator_index: 9,
                missed_count: 2,
            }],
        }
    }

    #[test]
    fn store_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = DutyStore::open(dir.path()).unwrap();

        store.store_epoch(&record(10)).unwrap();
        assert!(store.has_epoch(10));
        assert_eq!(store.get_epoch(10).unwrap().unwrap(), record(10));
        assert_eq!(store.get_epoch(11).unwrap(), None);
    }

    #[test]
    fn identical_rewrite_is_noop_conflicting_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DutyStore::open(dir.path()).unwrap();

        store.store_epoch(&record(10)).unwrap();
        store.store_epoch(&record(10)).unwrap();

        let mut conflicting = record(10);
        conflicting.att_misses.insert(99);
        assert!(matches!(
            store.store_epoch(&conflicting),
            Err(Error::ConflictingRewrite { epoch: 10 })
        ));
    }

    #[test]
    fn range_queries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DutyStore::open(dir.path()).unwrap();

        for epoch in [5, 6, 8] {
            store.store_epoch(&record(epoch)).unwrap();
        }

        assert_eq!(store.min_epoch().unwrap(), Some(5));
        assert_eq!(store.max_epoch().unwrap(), Some(8));
        assert_eq!(store.missing_epochs_in(5, 8).unwrap(), vec![7]);
        assert!(store.is_range_available(5, 6).unwrap());
        assert!(!store.is_range_available(5, 8).unwrap());
    }

    #[test]
    fn demand_nonce_moves_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = DutyStore::open(dir.path()).unwrap();

        assert_eq!(store.epochs_demand_nonce().unwrap(), 0);
        store.set_epochs_demand("performance", 100, 200).unwrap();
        assert_eq!(store.epochs_demand_nonce().unwrap(), 1);
        store.set_epochs_demand("performance", 100, 200).unwrap();
        assert_eq!(store.epochs_demand_nonce().unwrap(), 1);
        store.set_epochs_demand("performance", 100, 250).unwrap();
        assert_eq!(store.epochs_demand_nonce().unwrap(), 2);
        assert_eq!(
            store.epochs_demand().unwrap().get("performance"),
            Some(&(100, 250))
        );
    }

    #[test]
    fn corrupted_record_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DutyStore::open(dir.path()).unwrap();
        store.store_epoch(&record(10)).unwrap();

        std::fs::write(dir.path().join("epochs/10.json"), b"{not json").unwrap();
        assert!(matches!(store.get_epoch(10), Err(Error::Corrupted { epoch: 10, .. })));
    }

    #[test]
    fn stale_write_buffer_is_cleaned_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DutyStore::open(dir.path()).unwrap();
            store.store_epoch(&record(1)).unwrap();
        }
        std::fs::write(dir.path().join("epochs/2.buf"), b"partial").unwrap();

        let store = DutyStore::open(dir.path()).unwrap();
        assert!(store.has_epoch(1));
        assert!(!store.has_epoch(2));
        assert!(!dir.path().join("epochs/2.buf").exists());
    }
}
