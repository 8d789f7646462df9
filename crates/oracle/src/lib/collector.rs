//! Performance collector: continuously streams duty outcomes from the
//! consensus layer into the duty store for the epoch ranges consumers
//! demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lido_oracle_shared::converter::ChainConverter;
use lido_oracle_shared::types::{BlockStamp, ChainConfig, Epoch};

use crate::checkpoint::{
    Error as CheckpointError, FrameCheckpointProcessor, FrameCheckpointsIterator, CHECKPOINT_SLOT_DELAY_EPOCHS,
};
use crate::consensus::{Error, ModuleExecuteDelay};
use crate::store::DutyStore;
use crate::Web3Context;

/// How many epochs behind the head to backfill when the store is empty and
/// nobody registered a demand yet.
const DEFAULT_EPOCHS_STEP_TO_COLLECT: u64 = 10;

pub struct PerformanceCollector {
    ctx: Arc<Web3Context>,
    store: Arc<DutyStore>,
    last_epochs_demand_nonce: AtomicU64,
}

impl PerformanceCollector {
    pub fn new(ctx: Arc<Web3Context>, store: Arc<DutyStore>) -> Result<Self, Error> {
        let last_epochs_demand_nonce = AtomicU64::new(store.epochs_demand_nonce()?);
        Ok(Self {
            ctx,
            store,
            last_epochs_demand_nonce,
        })
    }

    async fn build_converter(&self) -> Result<ChainConverter, Error> {
        let cc_spec = self.ctx.cc.get_config_spec().await?;
        let genesis = self.ctx.cc.get_genesis().await?;
        Ok(ChainConverter::new(ChainConfig {
            slots_per_epoch: cc_spec.slots_per_epoch,
            seconds_per_slot: cc_spec.seconds_per_slot,
            genesis_time: genesis.genesis_time,
        }))
    }

    pub async fn execute_module(&self, last_finalized: &BlockStamp) -> Result<ModuleExecuteDelay, Error> {
        let converter = self.build_converter().await?;
        let finalized_epoch = converter
            .get_epoch_by_slot(last_finalized.slot_number)
            .saturating_sub(1);

        let Some((start_epoch, end_epoch)) = self.define_epochs_to_process_range(finalized_epoch)? else {
            return Ok(ModuleExecuteDelay::NextSlot);
        };

        let checkpoints = match FrameCheckpointsIterator::new(converter, start_epoch, end_epoch, finalized_epoch) {
            Ok(iterator) => iterator.checkpoints(),
            Err(CheckpointError::MinStepIsNotReached) => return Ok(ModuleExecuteDelay::NextSlot),
            Err(other) => return Err(other.into()),
        };

        let processor = Arc::new(FrameCheckpointProcessor::new(
            Arc::clone(&self.ctx.cc),
            Arc::clone(&self.store),
            converter,
            *last_finalized,
            self.ctx.max_concurrency,
        ));

        let mut checkpoint_count = 0u64;
        for checkpoint in &checkpoints {
            let processed_epochs = Arc::clone(&processor).exec(checkpoint).await?;
            checkpoint_count += 1;
            self.ctx.metrics.collector.processed_epochs.add(processed_epochs);
            tracing::info!(
                checkpoint_slot = checkpoint.slot,
                processed_epochs,
                "Checkpoint processing completed"
            );

            // A checkpoint in flight is still useful when the demand moves;
            // anything beyond it is planned against a stale range.
            if self.new_epochs_range_demand_appeared()? {
                tracing::info!("New epochs demand appeared during processing");
                return Ok(ModuleExecuteDelay::NextSlot);
            }
        }

        tracing::info!(checkpoint_count, "All checkpoints processing completed");
        Ok(ModuleExecuteDelay::NextSlot)
    }

    fn define_epochs_to_process_range(&self, finalized_epoch: Epoch) -> Result<Option<(Epoch, Epoch)>, Error> {
        let Some(max_available_epoch_to_check) = finalized_epoch.checked_sub(CHECKPOINT_SLOT_DELAY_EPOCHS) else {
            tracing::info!("No available epochs to process yet");
            return Ok(None);
        };

        let mut start_epoch = max_available_epoch_to_check.saturating_sub(DEFAULT_EPOCHS_STEP_TO_COLLECT);
        let end_epoch = max_available_epoch_to_check;

        let min_epoch_in_store = self.store.min_epoch()?;
        let max_epoch_in_store = self.store.max_epoch()?;

        if let (Some(min_stored), Some(max_stored)) = (min_epoch_in_store, max_epoch_in_store) {
            self.ctx.metrics.collector.min_stored_epoch.set(min_stored);
            self.ctx.metrics.collector.max_stored_epoch.set(max_stored);

            if max_available_epoch_to_check < min_stored {
                // The node serves epochs from before anything we collected -
                // it is either resyncing or pointed at another chain.
                return Err(Error::ClNodeNotSynced);
            }

            let gap = self.store.missing_epochs_in(min_stored, max_stored)?;
            start_epoch = match gap.first() {
                Some(first_missing) => *first_missing,
                None => max_stored + 1,
            };
        } else {
            tracing::info!(start_epoch, end_epoch, "Empty duty store, starting with the default range");
            return Ok(Some((start_epoch, end_epoch)));
        }

        let demands = self.store.epochs_demand()?;
        if demands.is_empty() {
            tracing::info!("No epochs demand found");
        }
        for (consumer, (l_epoch, r_epoch)) in demands {
            if self.store.is_range_available(l_epoch, r_epoch)? {
                tracing::info!(consumer, l_epoch, r_epoch, "Satisfied epochs demand");
                continue;
            }
            tracing::info!(consumer, l_epoch, r_epoch, "Unsatisfied epochs demand");
            start_epoch = start_epoch.min(l_epoch);
        }

        if start_epoch > max_available_epoch_to_check {
            tracing::info!(
                start_epoch,
                end_epoch,
                finalized_epoch,
                max_available_epoch_to_check,
                "No epochs range to process yet"
            );
            return Ok(None);
        }

        tracing::info!(start_epoch, end_epoch, finalized_epoch, "Epochs range to process is determined");
        Ok(Some((start_epoch, end_epoch)))
    }

    fn new_epochs_range_demand_appeared(&self) -> Result<bool, Error> {
        let nonce = self.store.epochs_demand_nonce()?;
        let changed = self.last_epochs_demand_nonce.swap(nonce, Ordering::Relaxed) != nonce;
        Ok(changed)
    }
}
