//! Arithmetic between slot/epoch/frame/timestamp coordinates. Pure integer
//! math over the chain and frame configuration, no I/O.

use crate::types::{ChainConfig, Epoch, FrameConfig, FrameNumber, Slot};

/// Conversions that only need chain timing (no reporting frames involved).
#[derive(Debug, Clone, Copy)]
pub struct ChainConverter {
    pub chain_config: ChainConfig,
}

impl ChainConverter {
    pub fn new(chain_config: ChainConfig) -> Self {
        Self { chain_config }
    }

    pub fn get_epoch_by_slot(&self, slot: Slot) -> Epoch {
        slot / self.chain_config.slots_per_epoch
    }

    pub fn get_epoch_first_slot(&self, epoch: Epoch) -> Slot {
        epoch * self.chain_config.slots_per_epoch
    }

    pub fn get_epoch_last_slot(&self, epoch: Epoch) -> Slot {
        self.get_epoch_first_slot(epoch + 1) - 1
    }

    pub fn get_slot_by_timestamp(&self, timestamp: u64) -> Slot {
        (timestamp - self.chain_config.genesis_time) / self.chain_config.seconds_per_slot
    }

    pub fn get_epoch_by_timestamp(&self, timestamp: u64) -> Epoch {
        self.get_epoch_by_slot(self.get_slot_by_timestamp(timestamp))
    }

    pub fn timestamp_of_slot(&self, slot: Slot) -> u64 {
        self.chain_config.genesis_time + slot * self.chain_config.seconds_per_slot
    }
}

/// Conversions between chain coordinates and reporting frames. A frame is
/// the distance between two oracle reports.
#[derive(Debug, Clone, Copy)]
pub struct FrameConverter {
    pub chain_config: ChainConfig,
    pub frame_config: FrameConfig,
}

impl FrameConverter {
    pub fn new(chain_config: ChainConfig, frame_config: FrameConfig) -> Self {
        Self {
            chain_config,
            frame_config,
        }
    }

    pub fn chain(&self) -> ChainConverter {
        ChainConverter::new(self.chain_config)
    }

    pub fn get_epoch_by_slot(&self, slot: Slot) -> Epoch {
        self.chain().get_epoch_by_slot(slot)
    }

    pub fn get_epoch_first_slot(&self, epoch: Epoch) -> Slot {
        self.chain().get_epoch_first_slot(epoch)
    }

    pub fn get_epoch_last_slot(&self, epoch: Epoch) -> Slot {
        self.chain().get_epoch_last_slot(epoch)
    }

    pub fn get_epoch_by_timestamp(&self, timestamp: u64) -> Epoch {
        self.chain().get_epoch_by_timestamp(timestamp)
    }

    pub fn get_slot_by_timestamp(&self, timestamp: u64) -> Slot {
        self.chain().get_slot_by_timestamp(timestamp)
    }

    pub fn get_frame_by_slot(&self, slot: Slot) -> FrameNumber {
        self.get_frame_by_epoch(self.get_epoch_by_slot(slot))
    }

    pub fn get_frame_by_epoch(&self, epoch: Epoch) -> FrameNumber {
        (epoch - self.frame_config.initial_epoch) / self.frame_config.epochs_per_frame
    }

    pub fn get_frame_first_slot(&self, frame: FrameNumber) -> Slot {
        (self.frame_config.initial_epoch + frame * self.frame_config.epochs_per_frame)
            * self.chain_config.slots_per_epoch
    }

    pub fn get_frame_last_slot(&self, frame: FrameNumber) -> Slot {
        self.get_frame_first_slot(frame + 1) - 1
    }

    /// Rounds an epoch down to the first epoch of the frame containing it.
    pub fn round_epoch_by_frame(&self, epoch: Epoch) -> Epoch {
        self.get_frame_by_epoch(epoch) * self.frame_config.epochs_per_frame + self.frame_config.initial_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mainnet_chain() -> ChainConfig {
        ChainConfig {
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            genesis_time: 1_606_824_023,
        }
    }

    fn converter(initial_epoch: Epoch, epochs_per_frame: u64) -> FrameConverter {
        FrameConverter::new(
            mainnet_chain(),
            FrameConfig {
                initial_epoch,
                epochs_per_frame,
                fast_lane_length_slots: 10,
            },
        )
    }

    #[test]
    fn epoch_slot_roundtrip_reference_points() {
        let c = ChainConverter::new(mainnet_chain());
        assert_eq!(c.get_epoch_by_slot(0), 0);
        assert_eq!(c.get_epoch_by_slot(31), 0);
        assert_eq!(c.get_epoch_by_slot(32), 1);
        assert_eq!(c.get_epoch_first_slot(8192), 8192 * 32);
        assert_eq!(c.get_epoch_last_slot(8191), 8192 * 32 - 1);
    }

    #[test]
    fn timestamp_conversions() {
        let c = ChainConverter::new(mainnet_chain());
        assert_eq!(c.get_slot_by_timestamp(c.timestamp_of_slot(12345)), 12345);
        // Mid-slot timestamps round down.
        assert_eq!(c.get_slot_by_timestamp(c.timestamp_of_slot(12345) + 11), 12345);
    }

    #[test]
    fn frame_boundaries() {
        let c = converter(100, 75);
        assert_eq!(c.get_frame_by_epoch(100), 0);
        assert_eq!(c.get_frame_by_epoch(174), 0);
        assert_eq!(c.get_frame_by_epoch(175), 1);
        assert_eq!(c.get_frame_first_slot(0), 100 * 32);
        assert_eq!(c.get_frame_last_slot(0), 175 * 32 - 1);
        assert_eq!(c.get_frame_by_slot(c.get_frame_last_slot(3)), 3);
        assert_eq!(c.round_epoch_by_frame(176), 175);
    }

    proptest! {
        // slot <-> (epoch, offset) is a bijection
        #[test]
        fn slot_epoch_bijection(slot in 0u64..=u64::MAX / 32) {
            let c = ChainConverter::new(mainnet_chain());
            let epoch = c.get_epoch_by_slot(slot);
            let first = c.get_epoch_first_slot(epoch);
            let last = c.get_epoch_last_slot(epoch);
            prop_assert!(first <= slot && slot <= last);
            prop_assert_eq!(last - first + 1, 32);
        }

        #[test]
        fn frame_mapping_is_monotone(epoch in 0u64..10_000_000, shift in 1u64..1000) {
            let c = converter(0, 75);
            let e2 = epoch + shift;
            prop_assert!(c.get_frame_by_epoch(epoch) <= c.get_frame_by_epoch(e2));
            let rounded = c.round_epoch_by_frame(epoch);
            prop_assert!(rounded <= epoch);
            prop_assert_eq!(c.get_frame_by_epoch(rounded), c.get_frame_by_epoch(epoch));
        }
    }
}
