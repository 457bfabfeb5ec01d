//! Reward-per-share accumulator math (§4.5 "reward accumulator math").
//!
//! Rewards credited to a validator are folded into a single monotonically
//! increasing `acc_reward_per_share` value, scaled by [`UNIT_BIAS`].
//! Each delegator's pending reward is `shares * (acc - checkpoint) /
//! UNIT_BIAS`, computed lazily rather than iterating every delegator on
//! every reward event.
//!
//! Per-epoch [`EpochAccumulatorRecord`]s let a delegator whose stake is
//! still pending activation (§4.5 "activation pipeline") start its
//! checkpoint from the accumulator value *at the epoch it activates*,
//! rather than the value at the moment it was registered — the two can
//! differ by several `syscall_reward`s. `retain_epoch` reserves a record
//! for a future activation epoch; `syscall_on_epoch_change` fills it in
//! with the real value via `finalize_epoch` once that epoch arrives, and
//! `release_epoch` hands the value back to the promoted delegator,
//! dropping the record once nothing references it anymore (§3.5: "refcount
//! equal to the number of delegators whose next-touch epoch is e").

use ahash::AHashMap;
use alloy_primitives::U256;

use super::types::{Epoch, EpochAccumulatorRecord, UNIT_BIAS};

/// Per-validator reward accumulator state.
#[derive(Debug, Default)]
pub struct RewardAccumulator {
    acc_reward_per_share: u128,
    records: AHashMap<Epoch, EpochAccumulatorRecord>,
}

impl RewardAccumulator {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current accumulator value, for checkpointing a newly deposited
    /// delegation.
    pub fn current(&self) -> u128 {
        self.acc_reward_per_share
    }

    /// Fold a reward payment into the accumulator (§4.5). A no-op if
    /// `total_stake` is zero, since there is nothing to distribute over
    /// (avoids a division by zero rather than panicking).
    pub fn accrue_reward(&mut self, reward: U256, total_stake: U256) {
        if total_stake.is_zero() {
            return;
        }
        let scaled = reward.saturating_mul(U256::from(UNIT_BIAS));
        let delta = scaled / total_stake;
        self.acc_reward_per_share = self.acc_reward_per_share.saturating_add(saturating_u256_to_u128(delta));
    }

    /// Reserve a record for `epoch`, bumping its refcount (creating it
    /// with a placeholder value if this is the first reservation). Called
    /// when a delegator registers a [`super::types::PendingDelta`]
    /// targeting `epoch` as its activation epoch.
    pub fn retain_epoch(&mut self, epoch: Epoch) {
        self.records
            .entry(epoch)
            .or_insert_with(|| EpochAccumulatorRecord {
                epoch,
                acc_reward_per_share: 0,
                total_stake: U256::ZERO,
                ref_count: 0,
            })
            .ref_count += 1;
    }

    /// Fill in `epoch`'s record with the accumulator's real value, if a
    /// delegator reserved it via `retain_epoch`. A no-op if nothing did
    /// (the common case: most epochs have no pending activations).
    pub fn finalize_epoch(&mut self, epoch: Epoch, total_stake: U256) {
        let value = self.acc_reward_per_share;
        if let Some(record) = self.records.get_mut(&epoch) {
            record.acc_reward_per_share = value;
            record.total_stake = total_stake;
        }
    }

    /// Release a delegator's reservation on `epoch`'s record, returning
    /// its finalized value if the record exists. Drops the record once
    /// its refcount reaches zero.
    pub fn release_epoch(&mut self, epoch: Epoch) -> Option<u128> {
        let Some(record) = self.records.get_mut(&epoch) else {
            return None;
        };
        let value = record.acc_reward_per_share;
        record.ref_count = record.ref_count.saturating_sub(1);
        if record.ref_count == 0 {
            self.records.remove(&epoch);
        }
        Some(value)
    }

    /// Drop any record older than `min_epoch` that nothing still
    /// references, bounding how much per-epoch history the accumulator
    /// retains (§4.5 "truncates the retained history of accumulator
    /// records").
    pub fn prune_before(&mut self, min_epoch: Epoch) {
        self.records.retain(|&epoch, record| epoch >= min_epoch || record.ref_count > 0);
    }

    /// Look up a retained epoch snapshot, if still live.
    pub fn record(&self, epoch: Epoch) -> Option<&EpochAccumulatorRecord> {
        self.records.get(&epoch)
    }

    /// Reward owed to `shares` of stake checkpointed at `checkpoint`,
    /// given the accumulator's current value.
    pub fn pending_reward(&self, shares: U256, checkpoint: u128) -> U256 {
        if self.acc_reward_per_share <= checkpoint {
            return U256::ZERO;
        }
        let delta = U256::from(self.acc_reward_per_share - checkpoint);
        shares.saturating_mul(delta) / U256::from(UNIT_BIAS)
    }
}

fn saturating_u256_to_u128(v: U256) -> u128 {
    if v > U256::from(u128::MAX) {
        u128::MAX
    } else {
        v.to::<u128>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_distributes_proportionally_to_shares() {
        let mut acc = RewardAccumulator::new();
        acc.accrue_reward(U256::from(1_000u64), U256::from(10_000u64));
        let checkpoint = 0u128;
        let reward_for_half_shares = acc.pending_reward(U256::from(5_000u64), checkpoint);
        assert_eq!(reward_for_half_shares, U256::from(500u64));
    }

    #[test]
    fn zero_total_stake_is_noop() {
        let mut acc = RewardAccumulator::new();
        acc.accrue_reward(U256::from(1_000u64), U256::ZERO);
        assert_eq!(acc.current(), 0);
    }

    #[test]
    fn monotonic_accumulator_across_multiple_reward_events() {
        let mut acc = RewardAccumulator::new();
        acc.accrue_reward(U256::from(100u64), U256::from(1_000u64));
        let first = acc.current();
        acc.accrue_reward(U256::from(50u64), U256::from(1_000u64));
        assert!(acc.current() > first);
    }

    #[test]
    fn retained_record_captures_value_at_finalize_not_at_retain() {
        let mut acc = RewardAccumulator::new();
        acc.retain_epoch(5);
        acc.accrue_reward(U256::from(1_000u64), U256::from(1_000u64));
        acc.finalize_epoch(5, U256::from(1_000u64));
        let value = acc.release_epoch(5).unwrap();
        assert_eq!(value, acc.current());
        assert!(acc.record(5).is_none(), "refcount should hit zero and drop the record");
    }

    #[test]
    fn refcount_keeps_record_alive_until_every_reservation_releases() {
        let mut acc = RewardAccumulator::new();
        acc.retain_epoch(5);
        acc.retain_epoch(5);
        acc.finalize_epoch(5, U256::ZERO);
        assert_eq!(acc.release_epoch(5), Some(0));
        assert!(acc.record(5).is_some(), "one reservation still outstanding");
        assert_eq!(acc.release_epoch(5), Some(0));
        assert!(acc.record(5).is_none());
    }

    #[test]
    fn prune_before_drops_unreferenced_stale_records_only() {
        let mut acc = RewardAccumulator::new();
        acc.retain_epoch(1);
        acc.retain_epoch(2);
        acc.release_epoch(1);
        acc.prune_before(3);
        assert!(acc.record(1).is_none());
        acc.retain_epoch(2);
        acc.prune_before(3);
        assert!(acc.record(2).is_some(), "still referenced, must survive pruning");
    }

    #[test]
    fn pending_reward_is_zero_once_checkpoint_catches_up() {
        let mut acc = RewardAccumulator::new();
        acc.accrue_reward(U256::from(1_000u64), U256::from(10_000u64));
        let current = acc.current();
        assert_eq!(acc.pending_reward(U256::from(5_000u64), current), U256::ZERO);
    }
}
