//! The EVM-to-x86-64 ahead-of-time code generator (§1, §3.4, §4.4).

pub mod comparison;
pub mod contract;
pub mod emitter;
pub mod location;
pub mod regalloc;
pub mod vstack;

pub use contract::{CompiledContract, ContractAssembler, CtxLayout};
pub use emitter::{BlockEmitter, CompiledBlock, EmitError, Op};
