//! The whole-contract assembly layer: the entry ABI, the shared error
//! block, the contract epilogue, the non-literal `JUMP`/`JUMPI` jump
//! table, and the read-only section tying every basic block
//! [`super::emitter::BlockEmitter`] lowers into one executable function
//! (§4.4 "Entry ABI", "Jumps", "Finalization").
//!
//! `BlockEmitter` lowers one block at a time against bytecode-`pc` branch
//! targets, oblivious to where any other block ends up in the final
//! instruction stream. This module places blocks in bytecode order,
//! brackets them with the entry/error/epilogue scaffolding, and resolves
//! every branch to a real code offset in a two-pass encode: iced-x86 gives
//! us each instruction's offset in a first pass (sizes are fixed for the
//! `_rel32_64` instruction forms this emitter uses exclusively, so a
//! placeholder branch target doesn't perturb sizing), then we patch branch
//! targets to the addresses that pass discovered and encode again.

use ahash::AHashMap;
use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, MemoryOperand, Register,
};

use super::emitter::{CompiledBlock, EmitError, ERROR_BLOCK_SENTINEL, SCRATCH_GPR};

/// Byte offsets of the [`crate::context::Context`] fields generated code
/// reads/writes directly, supplied by the host. The assembler treats
/// `Context`'s layout as something handed to it, not something it
/// discovers via reflection — the host is the single source of truth for
/// how that struct is laid out in memory.
#[derive(Debug, Clone, Copy)]
pub struct CtxLayout {
    /// Offset of `gas_remaining: i64`.
    pub gas_remaining: i32,
    /// Offset of `exit_stack_ptr: u64`.
    pub exit_stack_ptr: i32,
    /// Offset of the one-byte `result.status` discriminant.
    pub result_status: i32,
}

/// `StatusCode::Error`'s wire discriminant, written by the shared error
/// block (§4.6, §7 "EVM runtime errors"). Kept in lockstep with
/// [`crate::context::StatusCode`]'s `#[repr(u8)]` declaration.
const STATUS_ERROR: i32 = crate::context::StatusCode::Error as i32;

/// Scratch frame reserved at entry: a saved `ctx` pointer, the EVM
/// stack-size counter, and room for outgoing call arguments beyond the six
/// passed in registers (§4.4 "Entry ABI" reserves "up to twelve outgoing
/// call arguments and the EVM stack-size counter").
const SCRATCH_FRAME_SIZE: i32 = 128;
const CTX_SLOT_OFFSET: i32 = 0;
#[allow(dead_code)] // reserved for the stack-size counter the runtime call convention reads/writes
const STACK_SIZE_SLOT_OFFSET: i32 = 8;

/// Callee-saved registers pushed at entry, popped at exit, in push order
/// (§4.4 "Entry ABI").
const CALLEE_SAVED: [Register; 6] = [
    Register::RBX,
    Register::RBP,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// A fully assembled contract function, ready to hand to the JIT runtime
/// for mapping into executable pages (§5 "Generated code pages are owned
/// by the JIT runtime").
#[derive(Debug)]
pub struct CompiledContract {
    /// Final relocated machine code.
    pub code: Vec<u8>,
    /// Offset within `code` of `entry(ctx, stack_base)`.
    pub entry_offset: u64,
    /// Bytecode `JUMPDEST` offset -> code offset, the live entries of the
    /// per-byte jump table (§4.4 "Jumps": "every byte of code has an entry
    /// in the table; non-`JUMPDEST` bytes point to the error block").
    pub jumpdest_offsets: AHashMap<u64, u64>,
    /// Code offset of the shared error block every out-of-bounds or
    /// invalid-jump path lands on.
    pub error_block_offset: u64,
    /// Concatenation of every block's literal pool, in block order,
    /// 32 bytes big-endian per entry — the read-only section's data
    /// (§4.4 "Finalization"). Not yet consumed by block lowering, which
    /// still materializes literals without a rip-relative load; reserved
    /// for when that lowering path is built.
    pub read_only_data: Vec<u8>,
}

/// Assembles one contract's machine code from its lowered basic blocks
/// (§4.4).
#[derive(Debug)]
pub struct ContractAssembler {
    layout: CtxLayout,
    blocks: Vec<CompiledBlock>,
}

impl ContractAssembler {
    /// Start assembling a contract whose generated code reads/writes
    /// `Context` through `layout`.
    pub fn new(layout: CtxLayout) -> Self {
        Self {
            layout,
            blocks: Vec::new(),
        }
    }

    /// Add one lowered basic block, in bytecode order. Blocks must be
    /// pushed in ascending `start_pc` order; [`Self::finalize`] relies on
    /// this to build the per-byte jump table.
    pub fn push_block(&mut self, block: CompiledBlock) {
        self.blocks.push(block);
    }

    fn emit_prologue(&self) -> Vec<Instruction> {
        let mut v = Vec::new();
        for reg in CALLEE_SAVED {
            v.push(Instruction::with1(Code::Push_r64, reg).expect("push r64 is always valid"));
        }
        v.push(
            Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, SCRATCH_FRAME_SIZE)
                .expect("sub rsp, imm32 is always valid"),
        );
        // Stash ctx (rdi, arg 0) before any block's register allocator can
        // claim rdi for its own use (§4.4 "Entry ABI").
        v.push(
            Instruction::with2(
                Code::Mov_rm64_r64,
                MemoryOperand::with_base_displ(Register::RSP, CTX_SLOT_OFFSET as i64),
                Register::RDI,
            )
            .expect("mov [rsp+disp], r64 is always valid"),
        );
        // SP-reg = stack_base (arg 1, rsi): every stack-offset write in
        // block bodies addresses through RBP (§3.4 "StackOffset").
        v.push(Instruction::with2(Code::Mov_r64_rm64, Register::RBP, Register::RSI).expect("mov r64, r64"));
        // Load the gas-remaining counter (§4.4 "Basic block prologue"
        // decrements R15 per block).
        v.push(
            Instruction::with2(
                Code::Mov_r64_rm64,
                Register::R15,
                MemoryOperand::with_base_displ(Register::RDI, self.layout.gas_remaining as i64),
            )
            .expect("mov r64, [r64+disp]"),
        );
        // Save rsp as the fatal-unwind point now, after the frame is fully
        // reserved: a jump through `ctx.exit_stack_ptr` lands exactly here,
        // skipping every block's locals with nothing left above it that
        // needs cleanup (§4.4 "Stack unwinding", §9).
        v.push(
            Instruction::with2(
                Code::Mov_rm64_r64,
                MemoryOperand::with_base_displ(Register::RDI, self.layout.exit_stack_ptr as i64),
                Register::RSP,
            )
            .expect("mov [r64+disp], r64"),
        );
        v
    }

    fn reload_ctx() -> Instruction {
        Instruction::with2(
            Code::Mov_r64_rm64,
            SCRATCH_GPR,
            MemoryOperand::with_base_displ(Register::RSP, CTX_SLOT_OFFSET as i64),
        )
        .expect("mov r64, [rsp+disp]")
    }

    fn emit_error_block(&self) -> Vec<Instruction> {
        vec![
            Self::reload_ctx(),
            Instruction::with2(
                Code::Mov_rm8_imm8,
                MemoryOperand::with_base_displ(SCRATCH_GPR, self.layout.result_status as i64),
                STATUS_ERROR,
            )
            .expect("mov [r64+disp], imm8"),
            // Falls through directly into the epilogue, which the
            // assembler places immediately afterward.
        ]
    }

    fn emit_epilogue(&self) -> Vec<Instruction> {
        let mut v = vec![
            Self::reload_ctx(),
            Instruction::with2(
                Code::Mov_rm64_r64,
                MemoryOperand::with_base_displ(SCRATCH_GPR, self.layout.gas_remaining as i64),
                Register::R15,
            )
            .expect("mov [r64+disp], r64"),
            Instruction::with2(Code::Add_rm64_imm32, Register::RSP, SCRATCH_FRAME_SIZE)
                .expect("add rsp, imm32"),
        ];
        for reg in CALLEE_SAVED.into_iter().rev() {
            v.push(Instruction::with1(Code::Pop_r64, reg).expect("pop r64"));
        }
        v.push(Instruction::with(Code::Ret));
        v
    }

    /// Whether `instr` is one of the near-branch forms this emitter uses
    /// (always the explicit `_rel32_64` variants, never the auto-sized
    /// short forms, so first-pass sizing never moves under relocation).
    /// Covers `Jmp`/`Jcc` alike; this emitter never generates near `Call`s
    /// with a bytecode-`pc` target, so nothing else needs patching here.
    fn is_relocatable_branch(instr: &Instruction) -> bool {
        instr.is_near_branch()
    }

    /// Concatenate the entry prologue, every block in bytecode order, the
    /// shared error block, and the contract epilogue; relocate every
    /// block's bytecode-`pc` branch targets to real code offsets; and
    /// encode the result starting at `rip_base` (§4.4 "Finalization").
    ///
    /// `rip_base` is the address the JIT runtime will map this code's
    /// first byte to; branch targets are resolved relative to it.
    pub fn finalize(self, rip_base: u64) -> Result<CompiledContract, EmitError> {
        let prologue = self.emit_prologue();
        let error_block = self.emit_error_block();
        let epilogue = self.emit_epilogue();

        let mut instructions: Vec<Instruction> = Vec::new();
        let mut segment_starts: Vec<usize> = Vec::new();

        segment_starts.push(instructions.len());
        instructions.extend(prologue);

        let mut block_segment_index = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            block_segment_index.push(segment_starts.len());
            segment_starts.push(instructions.len());
            instructions.extend(block.instructions.iter().cloned());
        }

        let error_segment_index = segment_starts.len();
        segment_starts.push(instructions.len());
        instructions.extend(error_block);

        let epilogue_segment_index = segment_starts.len();
        segment_starts.push(instructions.len());
        instructions.extend(epilogue);

        // Pass 1: encode with placeholder branch targets (still the raw
        // bytecode `pc` values `BlockEmitter` left in place) purely to
        // learn where each instruction lands; size is independent of the
        // actual target value for the fixed-width forms used here.
        let block1 = InstructionBlock::new(&instructions, rip_base);
        let pass1 = BlockEncoder::encode(64, block1, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;
        let offsets = pass1.new_instruction_offsets;

        let segment_addr = |idx: usize| rip_base + offsets[segment_starts[idx]] as u64;

        let mut jumpdest_offsets = AHashMap::default();
        for (block, &seg_idx) in self.blocks.iter().zip(&block_segment_index) {
            if block.is_jumpdest {
                jumpdest_offsets.insert(block.start_pc, segment_addr(seg_idx));
            }
        }
        let error_block_addr = segment_addr(error_segment_index);
        let epilogue_addr = segment_addr(epilogue_segment_index);
        let _ = epilogue_addr; // epilogue is reached by fallthrough from the error block, not a branch

        // Pass 2: patch every relocatable branch's target to the real
        // address of the block whose `start_pc` it names, then encode for
        // real. A per-block prologue's gas-check branch carries the
        // `ERROR_BLOCK_SENTINEL` placeholder instead of a bytecode `pc`;
        // it resolves to the shared error block alongside every genuine
        // `JUMPDEST` target.
        for instr in instructions.iter_mut() {
            if !Self::is_relocatable_branch(instr) {
                continue;
            }
            let placeholder_pc = instr.near_branch64();
            let target = if placeholder_pc == ERROR_BLOCK_SENTINEL {
                error_block_addr
            } else {
                jumpdest_offsets
                    .get(&placeholder_pc)
                    .copied()
                    .ok_or(EmitError::InvalidJumpDest(placeholder_pc))?
            };
            instr.set_near_branch64(target);
        }

        let block2 = InstructionBlock::new(&instructions, rip_base);
        let pass2 = BlockEncoder::encode(64, block2, BlockEncoderOptions::NONE)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;

        let mut read_only_data = Vec::new();
        for block in &self.blocks {
            for literal in &block.literal_pool {
                read_only_data.extend_from_slice(&literal.to_be_bytes::<32>());
            }
        }

        Ok(CompiledContract {
            code: pass2.code_buffer,
            entry_offset: 0, // the prologue is always the function's first instruction
            jumpdest_offsets,
            error_block_offset: error_block_addr,
            read_only_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::emitter::{BlockEmitter, Op};
    use alloy_primitives::U256;

    fn layout() -> CtxLayout {
        CtxLayout {
            gas_remaining: 0,
            exit_stack_ptr: 8,
            result_status: 16,
        }
    }

    #[test]
    fn single_block_contract_assembles_and_relocates() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::JumpDest, None).unwrap();
        em.lower(&Op::Push(U256::from(1)), None).unwrap();
        em.lower(&Op::Push(U256::from(2)), None).unwrap();
        em.lower(&Op::Add, None).unwrap();
        em.lower(&Op::Stop, None).unwrap();
        let block = em.finish(true);

        let mut asm = ContractAssembler::new(layout());
        asm.push_block(block);
        let compiled = asm.finalize(0x1000).unwrap();

        assert!(!compiled.code.is_empty());
        assert_eq!(compiled.jumpdest_offsets.len(), 1);
        assert!(compiled.jumpdest_offsets.contains_key(&0));
    }

    #[test]
    fn jump_between_two_blocks_relocates_to_real_target() {
        let mut entry = BlockEmitter::new(0);
        entry.lower(&Op::Push(U256::from(64)), None).unwrap();
        entry.lower(&Op::Jump, Some(64)).unwrap();
        let entry_block = entry.finish(false);

        let mut dest = BlockEmitter::new(64);
        dest.lower(&Op::JumpDest, None).unwrap();
        dest.lower(&Op::Stop, None).unwrap();
        let dest_block = dest.finish(true);

        let mut asm = ContractAssembler::new(layout());
        asm.push_block(entry_block);
        asm.push_block(dest_block);
        let compiled = asm.finalize(0x4000).unwrap();

        let dest_addr = *compiled.jumpdest_offsets.get(&64).unwrap();
        assert!(dest_addr >= 0x4000);
        assert!(!compiled.code.is_empty());
    }

    #[test]
    fn block_prologue_gas_check_relocates_to_error_block() {
        let mut em = BlockEmitter::new(0);
        em.emit_prologue(21).unwrap();
        em.lower(&Op::JumpDest, None).unwrap();
        em.lower(&Op::Stop, None).unwrap();
        let block = em.finish(true);

        let mut asm = ContractAssembler::new(layout());
        asm.push_block(block);
        let compiled = asm.finalize(0x5000).unwrap();

        assert!(!compiled.code.is_empty());
        assert!(compiled.error_block_offset >= 0x5000);
    }

    #[test]
    fn unresolvable_jump_target_is_an_error_not_a_panic() {
        let mut entry = BlockEmitter::new(0);
        entry.lower(&Op::Push(U256::from(999)), None).unwrap();
        entry.lower(&Op::Jump, Some(999)).unwrap();
        let entry_block = entry.finish(false);

        let mut asm = ContractAssembler::new(layout());
        asm.push_block(entry_block);
        let err = asm.finalize(0x2000).unwrap_err();
        assert_eq!(err, EmitError::InvalidJumpDest(999));
    }
}
