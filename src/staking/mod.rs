//! The staking precompile: validator/delegator lifecycle and consensus
//! integration (§1, §3.5, §4.5).

pub mod abi;
pub mod accumulator;
pub mod pagination;
pub mod precompile;
pub mod types;

pub use abi::{dispatch, Verifier};
pub use precompile::{StakingError, StakingPrecompile};
pub use types::{
    Delegator, Epoch, EpochAccumulatorRecord, PendingDelta, Validator, ValidatorFlags, WithdrawalRequest,
    ACTIVE_VALIDATOR_STAKE, ACTIVE_VALSET_SIZE, MIN_VALIDATE_STAKE, MON, UNIT_BIAS,
};
