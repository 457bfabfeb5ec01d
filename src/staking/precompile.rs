//! The staking precompile: validator/delegator lifecycle, consensus
//! syscalls, and the activation pipeline (§4.5).

use ahash::AHashMap;
use alloy_primitives::{Address, U256};
use thiserror::Error;

use super::accumulator::RewardAccumulator;
use super::pagination::{paginate, Cursor, Page};
use super::types::{
    Delegator, Epoch, PendingDelta, Validator, ValidatorFlags, WithdrawalRequest, ACTIVE_VALIDATOR_STAKE,
    ACTIVE_VALSET_SIZE, MIN_VALIDATE_STAKE,
};

/// Errors raised by precompile entry points (§6.3, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakingError {
    /// `add_validator` for an id that is already registered.
    #[error("validator already exists")]
    ValidatorExists,
    /// Referenced a validator id with no registration.
    #[error("validator not found")]
    ValidatorNotFound,
    /// Referenced a delegator position that does not exist.
    #[error("delegator not found")]
    DelegatorNotFound,
    /// Stake below [`MIN_VALIDATE_STAKE`] at registration.
    #[error("stake below minimum validate stake")]
    BelowMinimumStake,
    /// Attempted to withdraw/undelegate more than is held.
    #[error("insufficient stake")]
    InsufficientStake,
    /// A withdrawal was claimed before its unlock epoch.
    #[error("withdrawal still locked")]
    WithdrawalLocked,
    /// Action attempted against a jailed validator.
    #[error("validator is jailed")]
    Jailed,
    /// Referenced a withdrawal id that doesn't exist for this pair.
    #[error("unknown withdrawal id")]
    UnknownWithdrawalId,
    /// The precompile's native balance cannot cover the requested payout
    /// (§7, P10 "staking solvency").
    #[error("insufficient native balance to cover payout")]
    SolvencyError,
    /// A block-author-derived validator lookup found no match.
    #[error("block author is not a registered validator")]
    BlockAuthorNotInSet,
    /// secp256k1 signature verification failed.
    #[error("secp256k1 signature verification failed")]
    SecpSignatureVerificationFailed,
    /// BLS signature verification failed.
    #[error("BLS signature verification failed")]
    BlsSignatureVerificationFailed,
    /// Dispatched selector has no matching entry point.
    #[error("method selector not supported")]
    MethodNotSupported,
    /// Malformed call data: wrong length, out-of-range numeric field, or a
    /// declared value that disagrees with the call frame (§6.3).
    #[error("invalid input")]
    InvalidInput,
}

/// A saved copy of mutable state, pushed before speculative execution and
/// either discarded (`pop_accept`) or restored (`pop_reject`) afterward
/// (§4.5 "state checkpoint push/pop_accept/pop_reject").
#[derive(Debug, Clone)]
struct Checkpoint {
    validators: AHashMap<Address, Validator>,
    delegators: AHashMap<(Address, Address), Delegator>,
    withdrawals: Vec<WithdrawalRequest>,
    current_epoch: Epoch,
    snapshot_taken_this_epoch: bool,
    native_balance: U256,
    next_withdrawal_id: u64,
    valset_snapshot: Vec<Address>,
    valset_consensus: Vec<Address>,
}

/// The staking precompile's full mutable state (§3.5, §4.5).
#[derive(Debug)]
pub struct StakingPrecompile {
    validators: AHashMap<Address, Validator>,
    delegators: AHashMap<(Address, Address), Delegator>,
    accumulators: AHashMap<Address, RewardAccumulator>,
    withdrawals: Vec<WithdrawalRequest>,
    current_epoch: Epoch,
    snapshot_taken_this_epoch: bool,
    checkpoints: Vec<Checkpoint>,
    /// Native token balance held by the precompile, debited on every
    /// payout; gates `claim_rewards`/`withdraw` against P10.
    native_balance: U256,
    next_withdrawal_id: u64,
    /// Execution-visible valset ranked at the last `syscall_snapshot`, not
    /// yet consensus-facing (§3.5 `valset_snapshot`).
    valset_snapshot: Vec<Address>,
    /// The valset consensus actually runs against, promoted from
    /// `valset_snapshot` one epoch boundary later (§3.5 `valset_consensus`,
    /// "consensus-timing invariant").
    valset_consensus: Vec<Address>,
}

impl Default for StakingPrecompile {
    fn default() -> Self {
        Self::new()
    }
}

impl StakingPrecompile {
    /// A fresh precompile with no validators, at epoch 0.
    pub fn new() -> Self {
        Self {
            validators: AHashMap::default(),
            delegators: AHashMap::default(),
            accumulators: AHashMap::default(),
            withdrawals: Vec::new(),
            current_epoch: 0,
            snapshot_taken_this_epoch: false,
            checkpoints: Vec::new(),
            native_balance: U256::ZERO,
            next_withdrawal_id: 0,
            valset_snapshot: Vec::new(),
            valset_consensus: Vec::new(),
        }
    }

    /// Credit the precompile's native balance, e.g. from delegation
    /// deposits or block rewards funneled into it by the host.
    pub fn fund(&mut self, amount: U256) {
        self.native_balance = self.native_balance.saturating_add(amount);
    }

    /// Current native balance backing payouts (§7, P10).
    pub fn native_balance(&self) -> U256 {
        self.native_balance
    }

    /// Save current state before speculative execution of a transaction.
    pub fn push_checkpoint(&mut self) {
        self.checkpoints.push(Checkpoint {
            validators: self.validators.clone(),
            delegators: self.delegators.clone(),
            withdrawals: self.withdrawals.clone(),
            current_epoch: self.current_epoch,
            snapshot_taken_this_epoch: self.snapshot_taken_this_epoch,
            native_balance: self.native_balance,
            next_withdrawal_id: self.next_withdrawal_id,
            valset_snapshot: self.valset_snapshot.clone(),
            valset_consensus: self.valset_consensus.clone(),
        });
    }

    /// Discard the most recent checkpoint, keeping current state.
    pub fn pop_accept(&mut self) {
        self.checkpoints.pop();
    }

    /// Roll back to the most recent checkpoint.
    pub fn pop_reject(&mut self) {
        if let Some(cp) = self.checkpoints.pop() {
            self.validators = cp.validators;
            self.delegators = cp.delegators;
            self.withdrawals = cp.withdrawals;
            self.current_epoch = cp.current_epoch;
            self.snapshot_taken_this_epoch = cp.snapshot_taken_this_epoch;
            self.native_balance = cp.native_balance;
            self.next_withdrawal_id = cp.next_withdrawal_id;
            self.valset_snapshot = cp.valset_snapshot;
            self.valset_consensus = cp.valset_consensus;
        }
    }

    /// The activation epoch a newly registered delta stake is scheduled
    /// for: current epoch + 2 if scheduled before this epoch's consensus
    /// snapshot has been taken, + 3 if scheduled after — the snapshot
    /// already captured the old valset and cannot retroactively include a
    /// late arrival (§4.5 "critical E+2/E+3 ordering").
    fn scheduled_activation_epoch(&self) -> Epoch {
        if self.snapshot_taken_this_epoch {
            self.current_epoch + 3
        } else {
            self.current_epoch + 2
        }
    }

    /// Register a pending stake increment for `(delegator, validator)`,
    /// rolling it into `next_delta_stake` if a delta is already
    /// outstanding (§4.5 "activation pipeline" steps 1-2). Reserves an
    /// accumulator record for the activation epoch so the delegator's
    /// eventual checkpoint reflects the accumulator value at the epoch it
    /// actually activates, not the value at registration time.
    fn register_delta_stake(&mut self, delegator: Address, validator: Address, amount: U256) {
        let activation_epoch = self.scheduled_activation_epoch();
        let checkpoint = self.accumulators.entry(validator).or_insert_with(RewardAccumulator::new).current();
        let slot = self.delegators.entry((delegator, validator)).or_insert_with(|| Delegator {
            id: delegator,
            validator,
            stake: U256::ZERO,
            rewards: U256::ZERO,
            reward_checkpoint: checkpoint,
            delta_stake: None,
            next_delta_stake: None,
        });
        match slot.delta_stake.as_mut() {
            None => slot.delta_stake = Some(PendingDelta { amount, activation_epoch }),
            Some(_) => match slot.next_delta_stake.as_mut() {
                Some(next) => {
                    next.amount += amount;
                    next.activation_epoch = activation_epoch;
                }
                None => slot.next_delta_stake = Some(PendingDelta { amount, activation_epoch }),
            },
        }
        if let Some(acc) = self.accumulators.get_mut(&validator) {
            acc.retain_epoch(activation_epoch);
        }
    }

    /// Settle a delegator's accrued reward since its last checkpoint into
    /// `rewards`, returning the full claimable balance (previously
    /// settled plus newly accrued). Shared by `claim_rewards` and
    /// `compound`.
    fn settle_pending_reward(&mut self, delegator: Address, validator: Address) -> Result<U256, StakingError> {
        let acc = self.accumulators.get(&validator).ok_or(StakingError::ValidatorNotFound)?;
        let current = acc.current();
        let pending = {
            let pos = self.delegators.get(&(delegator, validator)).ok_or(StakingError::DelegatorNotFound)?;
            acc.pending_reward(pos.stake, pos.reward_checkpoint)
        };
        let pos = self.delegators.get_mut(&(delegator, validator)).ok_or(StakingError::DelegatorNotFound)?;
        pos.rewards += pending;
        pos.reward_checkpoint = current;
        Ok(pos.rewards)
    }

    /// Recompute `withdrawn` from the validator's own self-delegation
    /// (§3.5, §4.5 "validator flag policy"): set once its active stake has
    /// fallen to zero, cleared again once re-delegation and activation
    /// bring it back above zero.
    fn refresh_withdrawn_flag(&mut self, validator: Address) {
        let self_stake_is_zero =
            self.delegators.get(&(validator, validator)).map(|d| d.stake.is_zero()).unwrap_or(true);
        if let Some(v) = self.validators.get_mut(&validator) {
            v.flags.withdrawn = self_stake_is_zero;
        }
    }

    /// Register a new validator with an initial self-stake. The self-stake
    /// is an ordinary pending delta, not yet counted toward `active_stake`
    /// or eligible for rewards until it clears the activation pipeline
    /// (§4.5, P8).
    pub fn add_validator(
        &mut self,
        id: Address,
        self_stake: U256,
        commission_bps: u16,
    ) -> Result<(), StakingError> {
        if self.validators.contains_key(&id) {
            return Err(StakingError::ValidatorExists);
        }
        if self_stake < U256::from(MIN_VALIDATE_STAKE) {
            return Err(StakingError::BelowMinimumStake);
        }
        self.validators.insert(
            id,
            Validator {
                id,
                active_stake: U256::ZERO,
                commission_bps,
                flags: ValidatorFlags::default(),
            },
        );
        self.accumulators.insert(id, RewardAccumulator::new());
        self.register_delta_stake(id, id, self_stake);
        Ok(())
    }

    /// Delegate `amount` of stake to `validator` as a pending delta,
    /// scheduled for activation at `scheduled_activation_epoch` (§4.5,
    /// P8: "never earns rewards for epoch E or E+1").
    pub fn delegate(&mut self, delegator: Address, validator: Address, amount: U256) -> Result<(), StakingError> {
        let v = self.validators.get(&validator).ok_or(StakingError::ValidatorNotFound)?;
        if v.flags.jailed {
            return Err(StakingError::Jailed);
        }
        self.register_delta_stake(delegator, validator, amount);
        Ok(())
    }

    /// Undelegate `amount` of stake from `validator`, returning the new
    /// withdrawal's id. `amount == 0` is treated as a successful no-op
    /// rather than an error, matching the original contract's tolerance
    /// for degenerate zero-value calls; the returned id is meaningless in
    /// that case since no withdrawal was created.
    ///
    /// Draws first from active `stake`, then `delta_stake`, then
    /// `next_delta_stake` — only the portion drawn from active stake ever
    /// reached `validator.active_stake`, so only that portion is
    /// subtracted back out. The withdrawal unlocks at the same scheduled
    /// epoch a fresh delta would activate at (§4.5 "on undelegate"), not
    /// one epoch later as a shorter lock would allow (P9).
    pub fn undelegate(&mut self, delegator: Address, validator: Address, amount: U256) -> Result<u64, StakingError> {
        if amount.is_zero() {
            return Ok(0);
        }
        let key = (delegator, validator);
        let pos = self.delegators.get_mut(&key).ok_or(StakingError::DelegatorNotFound)?;
        let delta_amount = pos.delta_stake.map(|d| d.amount).unwrap_or(U256::ZERO);
        let next_amount = pos.next_delta_stake.map(|d| d.amount).unwrap_or(U256::ZERO);
        if pos.stake + delta_amount + next_amount < amount {
            return Err(StakingError::InsufficientStake);
        }
        let mut remaining = amount;
        let from_active = remaining.min(pos.stake);
        pos.stake -= from_active;
        remaining -= from_active;
        if !remaining.is_zero() {
            if let Some(delta) = pos.delta_stake.as_mut() {
                let take = remaining.min(delta.amount);
                delta.amount -= take;
                remaining -= take;
                if delta.amount.is_zero() {
                    pos.delta_stake = None;
                }
            }
        }
        if !remaining.is_zero() {
            if let Some(next) = pos.next_delta_stake.as_mut() {
                let take = remaining.min(next.amount);
                next.amount -= take;
                remaining -= take;
                if next.amount.is_zero() {
                    pos.next_delta_stake = None;
                }
            }
        }
        let v = self.validators.get_mut(&validator).ok_or(StakingError::ValidatorNotFound)?;
        v.active_stake = v.active_stake.saturating_sub(from_active);
        let id = self.next_withdrawal_id;
        self.next_withdrawal_id += 1;
        self.withdrawals.push(WithdrawalRequest {
            id,
            delegator,
            validator,
            amount,
            unlock_epoch: self.scheduled_activation_epoch(),
            accumulator_snapshot: self.current_epoch,
        });
        if delegator == validator {
            self.refresh_withdrawn_flag(validator);
        }
        Ok(id)
    }

    /// Claim the oldest ready withdrawal for a (delegator, validator) pair
    /// (§4.5 "withdrawal safety"). Removes it from the pending list and
    /// debits the precompile's native balance on success.
    pub fn withdraw(&mut self, delegator: Address, validator: Address) -> Result<U256, StakingError> {
        let idx = self
            .withdrawals
            .iter()
            .position(|w| w.delegator == delegator && w.validator == validator)
            .ok_or(StakingError::DelegatorNotFound)?;
        self.withdraw_at_index(idx)
    }

    /// Claim a specific withdrawal by id, supporting multiple concurrent
    /// withdrawals per (delegator, validator) pair (§6.3).
    pub fn withdraw_by_id(&mut self, delegator: Address, validator: Address, id: u64) -> Result<U256, StakingError> {
        let idx = self
            .withdrawals
            .iter()
            .position(|w| w.delegator == delegator && w.validator == validator && w.id == id)
            .ok_or(StakingError::UnknownWithdrawalId)?;
        self.withdraw_at_index(idx)
    }

    fn withdraw_at_index(&mut self, idx: usize) -> Result<U256, StakingError> {
        if self.withdrawals[idx].unlock_epoch > self.current_epoch {
            return Err(StakingError::WithdrawalLocked);
        }
        if self.withdrawals[idx].amount > self.native_balance {
            return Err(StakingError::SolvencyError);
        }
        let req = self.withdrawals.remove(idx);
        self.native_balance -= req.amount;
        Ok(req.amount)
    }

    /// Fold a delegator's pending reward back into their stake instead of
    /// paying it out. The compounded amount re-enters the activation
    /// pipeline as a fresh delta stake rather than joining active stake
    /// immediately (§4.5, P8).
    pub fn compound(&mut self, delegator: Address, validator: Address) -> Result<U256, StakingError> {
        self.validators.get(&validator).ok_or(StakingError::ValidatorNotFound)?;
        let owed = self.settle_pending_reward(delegator, validator)?;
        let pos = self.delegators.get_mut(&(delegator, validator)).ok_or(StakingError::DelegatorNotFound)?;
        pos.rewards = U256::ZERO;
        self.register_delta_stake(delegator, validator, owed);
        Ok(owed)
    }

    /// Pay out a delegator's full settled reward balance. Commission has
    /// already been deducted at accrual time (`syscall_reward`), so
    /// nothing is subtracted here.
    pub fn claim_rewards(&mut self, delegator: Address, validator: Address) -> Result<U256, StakingError> {
        self.validators.get(&validator).ok_or(StakingError::ValidatorNotFound)?;
        let owed = self.settle_pending_reward(delegator, validator)?;
        if owed > self.native_balance {
            return Err(StakingError::SolvencyError);
        }
        let pos = self.delegators.get_mut(&(delegator, validator)).ok_or(StakingError::DelegatorNotFound)?;
        pos.rewards = U256::ZERO;
        self.native_balance -= owed;
        Ok(owed)
    }

    /// Consensus syscall: credit a reward to a validator. Commission is
    /// split off and credited directly to the validator's own
    /// self-delegation *before* the remainder is folded into the shared
    /// accumulator (§4.5 "commission splitting") — the self-delegation
    /// still participates in the shared split proportionally to its
    /// stake, so a validator earns both its commission cut and its
    /// ordinary delegator share of the rest.
    pub fn syscall_reward(&mut self, validator: Address, reward: U256) -> Result<(), StakingError> {
        let v = self.validators.get(&validator).ok_or(StakingError::ValidatorNotFound)?;
        let total = v.active_stake;
        let commission = reward * U256::from(v.commission_bps) / U256::from(10_000u32);
        let shared = reward - commission;
        let acc = self.accumulators.get_mut(&validator).ok_or(StakingError::ValidatorNotFound)?;
        acc.accrue_reward(shared, total);
        if !commission.is_zero() {
            if let Some(self_delegation) = self.delegators.get_mut(&(validator, validator)) {
                self_delegation.rewards += commission;
            }
        }
        Ok(())
    }

    /// Consensus syscall: rank the execution-visible valset into
    /// `valset_snapshot` and mark that any delta stake scheduled from now
    /// on belongs to the following epoch boundary (§4.5 "critical
    /// E+2/E+3 ordering"). `valset_snapshot` only becomes consensus-facing
    /// at the next `syscall_on_epoch_change` (§3.5 "consensus-timing
    /// invariant").
    pub fn syscall_snapshot(&mut self) {
        let mut eligible: Vec<&Validator> = self.validators.values().filter(|v| v.meets_active_threshold()).collect();
        eligible.sort_by(|a, b| b.active_stake.cmp(&a.active_stake).then_with(|| a.id.cmp(&b.id)));
        eligible.truncate(ACTIVE_VALSET_SIZE);
        self.valset_snapshot = eligible.into_iter().map(|v| v.id).collect();
        self.snapshot_taken_this_epoch = true;
    }

    /// Consensus syscall: promote the last snapshot to the consensus
    /// valset, advance the epoch counter, and apply any delta stake whose
    /// scheduled epoch has arrived (§4.5 "activation pipeline").
    pub fn syscall_on_epoch_change(&mut self) {
        self.valset_consensus = std::mem::take(&mut self.valset_snapshot);
        self.current_epoch += 1;
        self.snapshot_taken_this_epoch = false;
        let current_epoch = self.current_epoch;

        for (id, acc) in self.accumulators.iter_mut() {
            let total = self.validators.get(id).map(|v| v.active_stake).unwrap_or(U256::ZERO);
            acc.finalize_epoch(current_epoch, total);
        }

        let mut promoted: AHashMap<Address, U256> = AHashMap::default();
        for delegator in self.delegators.values_mut() {
            let Some(pending) = delegator.delta_stake else { continue };
            if pending.activation_epoch > current_epoch {
                continue;
            }
            let finalized = self.accumulators.get_mut(&delegator.validator).and_then(|acc| acc.release_epoch(pending.activation_epoch));
            if let Some(value) = finalized {
                delegator.reward_checkpoint = value;
            }
            delegator.stake += pending.amount;
            delegator.delta_stake = delegator.next_delta_stake.take();
            *promoted.entry(delegator.validator).or_insert(U256::ZERO) += pending.amount;
        }
        for (validator, amount) in promoted {
            if let Some(v) = self.validators.get_mut(&validator) {
                v.active_stake += amount;
            }
        }

        for acc in self.accumulators.values_mut() {
            acc.prune_before(current_epoch);
        }

        let validator_ids: Vec<Address> = self.validators.keys().copied().collect();
        for id in validator_ids {
            self.refresh_withdrawn_flag(id);
        }
    }

    /// The consensus-facing active validator set, as resolved by the last
    /// `syscall_on_epoch_change` from the snapshot taken one boundary
    /// earlier (§3.5 `valset_consensus`).
    pub fn get_consensus_valset(&self) -> Vec<Address> {
        self.valset_consensus.clone()
    }

    /// Paginated delegators for a given validator (§4.5 "pagination
    /// cursors").
    pub fn get_delegators_for_validator(&self, validator: Address, cursor: Cursor, page_size: usize) -> Page<Address> {
        let mut ids: Vec<Address> = self
            .delegators
            .values()
            .filter(|d| d.validator == validator)
            .map(|d| d.id)
            .collect();
        ids.sort();
        let page = paginate(&ids, |a| *a, cursor, page_size);
        Page {
            items: page.items.into_iter().copied().collect(),
            next: page.next,
        }
    }

    /// Paginated validators a given delegator has positions with.
    pub fn get_validators_for_delegator(&self, delegator: Address, cursor: Cursor, page_size: usize) -> Page<Address> {
        let mut ids: Vec<Address> = self
            .delegators
            .values()
            .filter(|d| d.id == delegator)
            .map(|d| d.validator)
            .collect();
        ids.sort();
        let page = paginate(&ids, |a| *a, cursor, page_size);
        Page {
            items: page.items.into_iter().copied().collect(),
            next: page.next,
        }
    }

    /// Read-only validator lookup.
    pub fn validator(&self, id: Address) -> Option<&Validator> {
        self.validators.get(&id)
    }

    /// Read-only delegator position lookup.
    pub fn delegator(&self, delegator: Address, validator: Address) -> Option<&Delegator> {
        self.delegators.get(&(delegator, validator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::types::MON;

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = n;
        Address::from(bytes)
    }

    #[test]
    fn add_validator_below_minimum_rejected() {
        let mut sp = StakingPrecompile::new();
        let err = sp.add_validator(addr(1), U256::ZERO, 500).unwrap_err();
        assert_eq!(err, StakingError::BelowMinimumStake);
    }

    #[test]
    fn duplicate_validator_rejected() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 500).unwrap();
        let err = sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 500).unwrap_err();
        assert_eq!(err, StakingError::ValidatorExists);
    }

    #[test]
    fn new_validator_self_stake_starts_as_pending_delta() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(ACTIVE_VALIDATOR_STAKE), 0).unwrap();
        let v = sp.validator(addr(1)).unwrap();
        assert_eq!(v.active_stake, U256::ZERO, "self-stake must not be active before the pipeline promotes it");
        let d = sp.delegator(addr(1), addr(1)).unwrap();
        assert_eq!(d.delta_stake.unwrap().amount, U256::from(ACTIVE_VALIDATOR_STAKE));
        assert_eq!(d.delta_stake.unwrap().activation_epoch, 2);
    }

    #[test]
    fn activation_delayed_an_extra_epoch_after_snapshot() {
        let mut sp = StakingPrecompile::new();
        sp.syscall_snapshot();
        sp.add_validator(addr(1), U256::from(ACTIVE_VALIDATOR_STAKE), 0).unwrap();
        let d = sp.delegator(addr(1), addr(1)).unwrap();
        assert_eq!(d.delta_stake.unwrap().activation_epoch, 3);
    }

    #[test]
    fn self_stake_becomes_active_once_scheduled_epoch_arrives() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(ACTIVE_VALIDATOR_STAKE), 0).unwrap();
        sp.syscall_on_epoch_change();
        assert_eq!(sp.validator(addr(1)).unwrap().active_stake, U256::ZERO);
        sp.syscall_on_epoch_change();
        assert_eq!(sp.validator(addr(1)).unwrap().active_stake, U256::from(ACTIVE_VALIDATOR_STAKE));
        assert!(sp.delegator(addr(1), addr(1)).unwrap().delta_stake.is_none());
    }

    #[test]
    fn delegate_is_pending_until_activation() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        assert_eq!(sp.validator(addr(1)).unwrap().active_stake, U256::ZERO);
        let d = sp.delegator(addr(2), addr(1)).unwrap();
        assert_eq!(d.delta_stake.unwrap().amount, U256::from(MON));
        assert_eq!(d.stake, U256::ZERO);
    }

    #[test]
    fn second_delegate_before_activation_rolls_into_next_delta_stake() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(2 * MON)).unwrap();
        let d = sp.delegator(addr(2), addr(1)).unwrap();
        assert_eq!(d.delta_stake.unwrap().amount, U256::from(MON));
        assert_eq!(d.next_delta_stake.unwrap().amount, U256::from(2 * MON));
    }

    #[test]
    fn reward_before_activation_does_not_count_pending_stake() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        assert!(sp.syscall_reward(addr(1), U256::from(100u64)).is_ok());
    }

    #[test]
    fn undelegate_zero_amount_is_noop_success() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        assert!(sp.undelegate(addr(2), addr(1), U256::ZERO).is_ok());
        assert_eq!(sp.delegator(addr(2), addr(1)).unwrap().delta_stake.unwrap().amount, U256::from(MON));
    }

    #[test]
    fn undelegate_more_than_held_fails() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        let err = sp.undelegate(addr(2), addr(1), U256::from(2 * MON)).unwrap_err();
        assert_eq!(err, StakingError::InsufficientStake);
    }

    #[test]
    fn undelegate_draws_from_pending_delta_before_erroring() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        assert!(sp.undelegate(addr(2), addr(1), U256::from(MON)).is_ok());
        assert!(sp.delegator(addr(2), addr(1)).unwrap().delta_stake.is_none());
    }

    #[test]
    fn undelegate_of_self_stake_sets_withdrawn_flag() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        assert!(!sp.validator(addr(1)).unwrap().flags.withdrawn);
        sp.undelegate(addr(1), addr(1), U256::from(MIN_VALIDATE_STAKE)).unwrap();
        assert!(sp.validator(addr(1)).unwrap().flags.withdrawn);
    }

    #[test]
    fn withdrawal_locked_until_scheduled_epoch() {
        let mut sp = StakingPrecompile::new();
        sp.fund(U256::from(MON));
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        sp.undelegate(addr(2), addr(1), U256::from(MON)).unwrap();
        let err = sp.withdraw(addr(2), addr(1)).unwrap_err();
        assert_eq!(err, StakingError::WithdrawalLocked);
        sp.syscall_on_epoch_change();
        let err = sp.withdraw(addr(2), addr(1)).unwrap_err();
        assert_eq!(err, StakingError::WithdrawalLocked);
        sp.syscall_on_epoch_change();
        assert!(sp.withdraw(addr(2), addr(1)).is_ok());
    }

    #[test]
    fn withdraw_without_funding_is_solvency_error() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        sp.undelegate(addr(2), addr(1), U256::from(MON)).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        let err = sp.withdraw(addr(2), addr(1)).unwrap_err();
        assert_eq!(err, StakingError::SolvencyError);
    }

    #[test]
    fn multiple_withdrawals_per_pair_are_claimed_independently() {
        let mut sp = StakingPrecompile::new();
        sp.fund(U256::from(2 * MON));
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(2 * MON)).unwrap();
        let id_a = sp.undelegate(addr(2), addr(1), U256::from(MON)).unwrap();
        let id_b = sp.undelegate(addr(2), addr(1), U256::from(MON)).unwrap();
        assert_ne!(id_a, id_b);
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        assert!(sp.withdraw_by_id(addr(2), addr(1), id_b).is_ok());
        assert!(sp.withdraw_by_id(addr(2), addr(1), id_b).is_err());
        assert!(sp.withdraw_by_id(addr(2), addr(1), id_a).is_ok());
    }

    /// Mirrors the spec scenario: validator A self-delegates and earns a
    /// 10% commission, delegator B delegates an equal amount. A reward R
    /// should split A=0.55R (0.45R proportional share + 0.10R commission),
    /// B=0.45R.
    #[test]
    fn syscall_reward_splits_commission_and_shared_accrual() {
        let mut sp = StakingPrecompile::new();
        sp.fund(U256::from(1_000u64));
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 1_000).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MIN_VALIDATE_STAKE)).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();

        sp.syscall_reward(addr(1), U256::from(1_000u64)).unwrap();

        let a = sp.claim_rewards(addr(1), addr(1)).unwrap();
        let b = sp.claim_rewards(addr(2), addr(1)).unwrap();
        assert_eq!(a, U256::from(550u64));
        assert_eq!(b, U256::from(450u64));
    }

    #[test]
    fn claim_rewards_without_funding_is_solvency_error() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 1_000).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MON)).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        sp.syscall_reward(addr(1), U256::from(100u64)).unwrap();
        let err = sp.claim_rewards(addr(2), addr(1)).unwrap_err();
        assert_eq!(err, StakingError::SolvencyError);
    }

    #[test]
    fn compound_re_enters_the_activation_pipeline() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.delegate(addr(2), addr(1), U256::from(MIN_VALIDATE_STAKE)).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        sp.syscall_reward(addr(1), U256::from(1_000u64)).unwrap();
        let compounded = sp.compound(addr(2), addr(1)).unwrap();
        assert!(!compounded.is_zero());
        let d = sp.delegator(addr(2), addr(1)).unwrap();
        assert_eq!(d.delta_stake.unwrap().amount, compounded);
        assert_eq!(d.rewards, U256::ZERO);
    }

    #[test]
    fn consensus_valset_caps_and_orders_by_stake() {
        let mut sp = StakingPrecompile::new();
        for i in 1..=3u8 {
            sp.add_validator(addr(i), U256::from(ACTIVE_VALIDATOR_STAKE) + U256::from(i), 0).unwrap();
        }
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        sp.syscall_snapshot();
        sp.syscall_on_epoch_change();
        let valset = sp.get_consensus_valset();
        assert_eq!(valset, vec![addr(3), addr(2), addr(1)]);
    }

    #[test]
    fn consensus_valset_lags_one_snapshot_behind_execution() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(ACTIVE_VALIDATOR_STAKE), 0).unwrap();
        sp.syscall_on_epoch_change();
        sp.syscall_on_epoch_change();
        assert!(sp.get_consensus_valset().is_empty(), "no snapshot has been taken yet");
        sp.syscall_snapshot();
        assert!(sp.get_consensus_valset().is_empty(), "snapshot is execution-visible only until the next epoch change");
        sp.syscall_on_epoch_change();
        assert_eq!(sp.get_consensus_valset(), vec![addr(1)]);
    }

    #[test]
    fn checkpoint_rollback_restores_state() {
        let mut sp = StakingPrecompile::new();
        sp.add_validator(addr(1), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.push_checkpoint();
        sp.add_validator(addr(2), U256::from(MIN_VALIDATE_STAKE), 0).unwrap();
        sp.pop_reject();
        assert!(sp.validator(addr(2)).is_none());
        assert!(sp.validator(addr(1)).is_some());
    }
}
