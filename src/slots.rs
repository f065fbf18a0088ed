use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ChainConstants;

/// Pure slot-clock arithmetic. Every timestamp on the chain counts seconds
/// from the configured epoch; a slot is one `block_time` window and a round
/// is `active_delegates` consecutive slots of blocks.
#[derive(Clone, Debug)]
pub struct Slots {
    epoch_time_ms: u64,
    block_time: u64,
    active_delegates: u64,
}

impl Slots {
    pub fn new(constants: &ChainConstants) -> Self {
        Self {
            epoch_time_ms: constants.epoch_time_ms,
            block_time: constants.block_time,
            active_delegates: u64::from(constants.active_delegates),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Seconds elapsed since the chain epoch for the given unix
    /// milliseconds, or for the current time.
    pub fn epoch_time(&self, ms: Option<u64>) -> u64 {
        let ms = ms.unwrap_or_else(Self::now_ms);
        ms.saturating_sub(self.epoch_time_ms) / 1_000
    }

    pub fn time(&self, ms: Option<u64>) -> u64 {
        self.epoch_time(ms)
    }

    /// Unix milliseconds for an epoch-relative timestamp.
    pub fn real_time(&self, epoch_seconds: u64) -> u64 {
        self.epoch_time_ms + epoch_seconds * 1_000
    }

    pub fn slot_number(&self, epoch_time: Option<u64>) -> u64 {
        let seconds = epoch_time.unwrap_or_else(|| self.epoch_time(None));
        seconds / self.block_time
    }

    /// Epoch-relative start of a slot.
    pub fn slot_time(&self, slot: u64) -> u64 {
        slot * self.block_time
    }

    pub fn next_slot(&self) -> u64 {
        self.slot_number(None) + 1
    }

    pub fn last_slot(&self, next_slot: u64) -> u64 {
        next_slot + self.active_delegates
    }

    /// Round the height belongs to; heights 1..=active_delegates form
    /// round 1.
    pub fn calc_round(&self, height: u64) -> u64 {
        height.div_ceil(self.active_delegates)
    }

    /// First height of a round.
    pub fn round_start_height(&self, round: u64) -> u64 {
        (round.saturating_sub(1)) * self.active_delegates + 1
    }

    /// Last height of a round.
    pub fn round_end_height(&self, round: u64) -> u64 {
        round * self.active_delegates
    }

    /// Index of the delegate slot within the round schedule.
    pub fn delegate_slot_index(&self, slot: u64) -> usize {
        (slot % self.active_delegates) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Slots {
        let mut constants = ChainConstants::default();
        constants.epoch_time_ms = 1_000_000;
        constants.block_time = 10;
        constants.active_delegates = 101;
        Slots::new(&constants)
    }

    #[test]
    fn epoch_time_counts_seconds_from_epoch() {
        let slots = slots();
        assert_eq!(slots.epoch_time(Some(1_000_000)), 0);
        assert_eq!(slots.epoch_time(Some(1_021_000)), 21);
        assert_eq!(slots.epoch_time(Some(999_000)), 0);
    }

    #[test]
    fn real_time_inverts_epoch_time() {
        let slots = slots();
        let epoch_seconds = slots.epoch_time(Some(1_350_000));
        assert_eq!(slots.real_time(epoch_seconds), 1_350_000);
    }

    #[test]
    fn slot_number_and_slot_time_are_inverse() {
        let slots = slots();
        assert_eq!(slots.slot_number(Some(0)), 0);
        assert_eq!(slots.slot_number(Some(9)), 0);
        assert_eq!(slots.slot_number(Some(10)), 1);
        assert_eq!(slots.slot_time(7), 70);
        assert_eq!(slots.slot_number(Some(slots.slot_time(42))), 42);
    }

    #[test]
    fn last_slot_spans_one_round_of_slots() {
        let slots = slots();
        assert_eq!(slots.last_slot(5), 106);
    }

    #[test]
    fn round_boundaries() {
        let slots = slots();
        assert_eq!(slots.calc_round(1), 1);
        assert_eq!(slots.calc_round(101), 1);
        assert_eq!(slots.calc_round(102), 2);
        assert_eq!(slots.calc_round(202), 2);
        assert_eq!(slots.calc_round(203), 3);
        assert_eq!(slots.round_start_height(2), 102);
        assert_eq!(slots.round_end_height(2), 202);
    }

    #[test]
    fn delegate_slot_index_wraps_per_round() {
        let slots = slots();
        assert_eq!(slots.delegate_slot_index(0), 0);
        assert_eq!(slots.delegate_slot_index(100), 100);
        assert_eq!(slots.delegate_slot_index(101), 0);
    }
}
