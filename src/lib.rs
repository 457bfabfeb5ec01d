//! `monad-core`: the storage, code-generation, and staking subsystems of
//! an EVM-compatible execution client (§1 OVERVIEW).
//!
//! - [`mpt`] is the on-disk Merkle-Patricia trie: a chunked storage pool,
//!   the upsert/compaction engine built on top of it, and the
//!   archive/restore codec used to ship a database between machines.
//! - [`evm`] is the ahead-of-time EVM-to-x86-64 code generator: virtual
//!   stack modeling, register allocation, deferred comparisons, and the
//!   instruction emitter built on `iced-x86`.
//! - [`staking`] is the staking precompile: validator/delegator
//!   lifecycle, epoch-based activation, and reward accounting.
//! - [`context`] holds the execution context shared between generated
//!   code and the host (gas accounting, environment, memory, result).
//! - [`cli`] is the flag surface (§6.4) for driving the storage engine
//!   from a command line without shipping a binary target.

pub mod cli;
pub mod context;
pub mod error;
pub mod evm;
pub mod mpt;
pub mod staking;

pub use error::CoreError;
