use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Sentinel pushed for frames where the validator earned no strike. Keeps
/// the list aligned to the frame cadence while carrying no information.
pub const STRIKE_SENTINEL: u64 = 0;

/// Fixed-capacity history of per-frame strikes for one validator key. New
/// frames are pushed to the front, entries past the operator's strike
/// lifetime fall off the back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrikesList {
    entries: VecDeque<u64>,
}

impl StrikesList {
    pub fn new(entries: impl IntoIterator<Item = u64>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn push(&mut self, value: u64) {
        self.entries.push_front(value);
    }

    /// Trims the history to the operator's current strike lifetime. The
    /// lifetime can shrink between frames, so excess entries are dropped
    /// from the back.
    pub fn resize(&mut self, lifetime: usize) {
        self.entries.truncate(lifetime);
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<u64> {
        self.entries.iter().copied().collect()
    }
}

impl FromIterator<u64> for StrikesList {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_shifts_history_forward() {
        let mut list = StrikesList::new([1, 0, 0, 0, 1, 1]);
        list.push(1);
        list.resize(6);
        assert_eq!(list.to_vec(), vec![1, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn sentinel_ages_out_old_strikes() {
        let mut list = StrikesList::new([0, 0, 0, 0, 0, 1]);
        list.push(STRIKE_SENTINEL);
        list.resize(6);
        assert_eq!(list.to_vec(), vec![0, 0, 0, 0, 0, 0]);
        assert_eq!(list.total(), 0);
    }

    #[test]
    fn resize_can_shrink_below_current_length() {
        let mut list = StrikesList::new([1, 1, 1, 1]);
        list.resize(2);
        assert_eq!(list.to_vec(), vec![1, 1]);
    }
}
