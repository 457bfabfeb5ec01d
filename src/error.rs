//! Crate-wide error glue.
//!
//! Each subsystem keeps its own narrow error enum (`PoolError`, `MptError`,
//! `ArchiveError`, `CodegenError`, `StakingError`); this module only unifies
//! them for call sites that legitimately cross subsystem boundaries, such as
//! the CLI (§6.4).

use thiserror::Error;

use crate::evm::emitter::EmitError;
use crate::mpt::archive::ArchiveError;
use crate::mpt::engine::MptError;
use crate::mpt::pool::PoolError;
use crate::staking::precompile::StakingError;

/// Top-level error uniting the three subsystems' error kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Storage pool failure.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    /// Trie engine failure.
    #[error("mpt error: {0}")]
    Mpt(#[from] MptError),
    /// Archive/restore failure.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    /// Staking precompile failure.
    #[error("staking error: {0}")]
    Staking(#[from] StakingError),
    /// Code generator failure.
    #[error("codegen error: {0}")]
    Codegen(#[from] EmitError),
}
