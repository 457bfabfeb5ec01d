//! Staking entities and the economic constants governing them (§3.5).

use alloy_primitives::{Address, U256};

/// Fixed-point scale used throughout reward-per-share accounting, matching
/// the original contract's `UNIT_BIAS` (10^18), large enough that integer
/// division never loses meaningful precision for realistic stake sizes.
pub const UNIT_BIAS: u128 = 1_000_000_000_000_000_000;

/// One MON, the native staking token's smallest-unit scale.
pub const MON: u128 = 1_000_000_000_000_000_000;

/// Minimum self-stake to register as a validator at all (distinct from
/// the much higher bar for consensus eligibility).
pub const MIN_VALIDATE_STAKE: u128 = MON;

/// Minimum total stake (self + delegated) for a validator to be eligible
/// for the active consensus validator set.
pub const ACTIVE_VALIDATOR_STAKE: u128 = 10_000 * MON;

/// Maximum size of the consensus-facing active validator set.
pub const ACTIVE_VALSET_SIZE: usize = 200;

/// An epoch identifier; epochs increase monotonically.
pub type Epoch = u64;

/// A registered validator (§3.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    /// The validator's on-chain identity, also its authorized-signer
    /// address; the validator's own stake is tracked as an ordinary
    /// [`Delegator`] position keyed `(id, id)` rather than a separate
    /// field (§4.5: "make self-stake a reward-earning position").
    pub id: Address,
    /// Sum of every delegator's *active* stake, including the
    /// validator's own self-delegation. Only stake whose [`PendingDelta`]
    /// has already been promoted by `syscall_on_epoch_change` counts here
    /// — this is deliberately not "self-stake + delegated stake" on
    /// registration, since neither starts active (§4.5 "activation
    /// pipeline", P8).
    pub active_stake: U256,
    /// Commission taken from delegator rewards, in basis points (0-10000).
    pub commission_bps: u16,
    /// Lifecycle flags.
    pub flags: ValidatorFlags,
}

impl Validator {
    /// Total stake backing this validator, the figure used for consensus
    /// valset ranking and the `ACTIVE_VALIDATOR_STAKE` threshold.
    pub fn total_stake(&self) -> U256 {
        self.active_stake
    }

    /// Whether this validator meets the bar to be considered for the
    /// active consensus set at all (§4.5).
    pub fn meets_active_threshold(&self) -> bool {
        !self.flags.jailed && !self.flags.withdrawn && self.active_stake >= U256::from(ACTIVE_VALIDATOR_STAKE)
    }
}

/// Lifecycle flags for a validator (§3.5, §4.5 "validator flag policy").
/// Kept as independent booleans rather than the `{Ok, StakeTooLow,
/// Withdrawn}` tri-state the distilled spec prose describes: a validator
/// can be `withdrawn` while its stake would otherwise still clear the
/// threshold, which a single three-way enum can't express without an
/// extra out-of-band transition flag. `StakeTooLow` isn't cached at all —
/// [`Validator::meets_active_threshold`] recomputes it live against
/// `active_stake` wherever it's needed (snapshot time), so there is no
/// separate flag to fall out of sync with the stake it derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidatorFlags {
    /// Slashed or otherwise barred from (re-)activation until cleared.
    pub jailed: bool,
    /// The authorized signer's own delegation (`Delegator` at key `(id,
    /// id)`) has fallen to zero active stake; removed from the execution
    /// valset regardless of total stake (§4.5 "validator flag policy").
    pub withdrawn: bool,
}

/// A pending stake increment awaiting activation (§3.5 "delta stake").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    /// Amount that will be added to [`Delegator::stake`] once active.
    pub amount: U256,
    /// Epoch at which `syscall_on_epoch_change` promotes this delta.
    pub activation_epoch: Epoch,
}

/// A delegator's position with a single validator (§3.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegator {
    /// The delegator's on-chain identity.
    pub id: Address,
    /// Validator this position is delegated to.
    pub validator: Address,
    /// Active stake currently earning rewards via the validator's
    /// accumulator. Does *not* include anything still sitting in
    /// `delta_stake`/`next_delta_stake` (§4.5 "activation pipeline").
    pub stake: U256,
    /// Claimable reward units settled so far (by `claim_rewards`,
    /// `compound`, or a commission credit), not yet paid out or
    /// compounded.
    pub rewards: U256,
    /// Accumulator value at the last touch (activation or claim), used to
    /// compute rewards accrued on `stake` since then.
    pub reward_checkpoint: u128,
    /// Pending stake increment with its scheduled activation epoch
    /// (§4.5 step 1).
    pub delta_stake: Option<PendingDelta>,
    /// A second pending increment registered while `delta_stake` is still
    /// outstanding; rolls into `delta_stake` once the first activates
    /// (§4.5 step 2).
    pub next_delta_stake: Option<PendingDelta>,
}

/// A snapshot of a validator's reward accumulator taken at epoch
/// boundaries, refcounted by delegators whose checkpoint references it
/// until they claim past it (§3.5, §4.5 "reward accumulator math").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochAccumulatorRecord {
    /// The epoch this snapshot was taken at.
    pub epoch: Epoch,
    /// Accumulated reward-per-share at this epoch, scaled by
    /// [`UNIT_BIAS`].
    pub acc_reward_per_share: u128,
    /// Total stake backing the validator when the snapshot was taken.
    pub total_stake: U256,
    /// Number of delegator checkpoints still referencing this record.
    pub ref_count: u32,
}

/// A pending withdrawal, unlockable only after its target epoch (§3.5,
/// §4.5 "withdrawal safety"). Keyed by `(validator, delegator, id)` so a
/// delegator may hold several concurrent withdrawals against the same
/// validator (§6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalRequest {
    /// Identifier unique among a (delegator, validator) pair's requests.
    pub id: u64,
    /// Delegator who requested the withdrawal.
    pub delegator: Address,
    /// Validator the stake was withdrawn from.
    pub validator: Address,
    /// Amount of stake being withdrawn.
    pub amount: U256,
    /// Epoch at or after which the withdrawal may be claimed.
    pub unlock_epoch: Epoch,
    /// Accumulator epoch snapshot this withdrawal's principal was valued
    /// against, retained for audit/reward-conservation bookkeeping.
    pub accumulator_snapshot: Epoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_stake_reports_active_stake_below_threshold() {
        let v = Validator {
            id: Address::ZERO,
            active_stake: U256::from(MIN_VALIDATE_STAKE),
            commission_bps: 500,
            flags: ValidatorFlags::default(),
        };
        assert_eq!(v.total_stake(), U256::from(MIN_VALIDATE_STAKE));
        assert!(!v.meets_active_threshold());
    }

    #[test]
    fn jailed_or_withdrawn_validator_never_meets_threshold() {
        let base = Validator {
            id: Address::ZERO,
            active_stake: U256::from(ACTIVE_VALIDATOR_STAKE),
            commission_bps: 0,
            flags: ValidatorFlags::default(),
        };
        assert!(base.meets_active_threshold());
        let mut jailed = base.clone();
        jailed.flags.jailed = true;
        assert!(!jailed.meets_active_threshold());
        let mut withdrawn = base;
        withdrawn.flags.withdrawn = true;
        assert!(!withdrawn.meets_active_threshold());
    }
}
