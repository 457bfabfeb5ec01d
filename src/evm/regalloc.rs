//! Instruction lowering policy: given an operation's operands, choose a
//! concrete `(dst, src)` location pair and materialize whatever is
//! missing (§4.4 "Instruction lowering policy").

use alloy_primitives::U256;

use super::location::{Location, LocationKind, COMMUTATIVE_BINOP_COMBINATIONS};
use super::vstack::{ElementId, SpillAction, VirtualStack};

/// Which binary operation a fold is being attempted for (§4.4 "literal
/// folding is applied aggressively at emission time").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// The result of successfully folding a binop away without emitting any
/// instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// The result is this compile-time constant.
    Literal(U256),
    /// The result is exactly `lhs`, unmodified.
    UseLhs,
    /// The result is exactly `rhs`, unmodified.
    UseRhs,
}

/// An element's value if (and only if) it is a bare compile-time literal
/// that has never been materialized into a register — folding a
/// materialized value would silently drop the side effect of freeing that
/// register's slot, so this intentionally excludes it.
fn literal_value(vs: &VirtualStack, id: ElementId) -> Option<U256> {
    match vs.locations(id) {
        [Location::Literal(v)] => Some(*v),
        _ => None,
    }
}

/// Try to resolve a binop at compile time, either by folding two literals
/// or by applying an algebraic identity (`x+0`, `x*1`, `x&x`, `x-x`, ...).
/// Returns `None` when the operation genuinely needs to be emitted.
pub fn try_fold_binop(op: FoldOp, vs: &VirtualStack, lhs: ElementId, rhs: ElementId) -> Option<FoldOutcome> {
    let lhs_lit = literal_value(vs, lhs);
    let rhs_lit = literal_value(vs, rhs);

    if let (Some(a), Some(b)) = (lhs_lit, rhs_lit) {
        let folded = match op {
            FoldOp::Add => a.wrapping_add(b),
            FoldOp::Sub => a.wrapping_sub(b),
            FoldOp::Mul => a.wrapping_mul(b),
            FoldOp::And => a & b,
            FoldOp::Or => a | b,
            FoldOp::Xor => a ^ b,
        };
        return Some(FoldOutcome::Literal(folded));
    }

    if lhs == rhs && matches!(op, FoldOp::Sub | FoldOp::Xor) {
        return Some(FoldOutcome::Literal(U256::ZERO));
    }

    match (op, rhs_lit) {
        (FoldOp::Add, Some(v)) | (FoldOp::Sub, Some(v)) if v.is_zero() => return Some(FoldOutcome::UseLhs),
        (FoldOp::Mul, Some(v)) if v == U256::from(1u8) => return Some(FoldOutcome::UseLhs),
        (FoldOp::Mul, Some(v)) if v.is_zero() => return Some(FoldOutcome::Literal(U256::ZERO)),
        (FoldOp::And, Some(v)) if v.is_zero() => return Some(FoldOutcome::Literal(U256::ZERO)),
        (FoldOp::And, Some(v)) if v == U256::MAX => return Some(FoldOutcome::UseLhs),
        (FoldOp::Or, Some(v)) if v.is_zero() => return Some(FoldOutcome::UseLhs),
        (FoldOp::Or, Some(v)) if v == U256::MAX => return Some(FoldOutcome::Literal(U256::MAX)),
        (FoldOp::Xor, Some(v)) if v.is_zero() => return Some(FoldOutcome::UseLhs),
        _ => {}
    }

    if let Some(v) = lhs_lit {
        match op {
            FoldOp::Add if v.is_zero() => return Some(FoldOutcome::UseRhs),
            FoldOp::Mul if v == U256::from(1u8) => return Some(FoldOutcome::UseRhs),
            FoldOp::Mul if v.is_zero() => return Some(FoldOutcome::Literal(U256::ZERO)),
            FoldOp::And if v.is_zero() => return Some(FoldOutcome::Literal(U256::ZERO)),
            FoldOp::And if v == U256::MAX => return Some(FoldOutcome::UseRhs),
            FoldOp::Or if v.is_zero() => return Some(FoldOutcome::UseRhs),
            FoldOp::Or if v == U256::MAX => return Some(FoldOutcome::Literal(U256::MAX)),
            FoldOp::Xor if v.is_zero() => return Some(FoldOutcome::UseRhs),
            _ => {}
        }
    }

    None
}

/// The chosen physical plan for a commutative binary operation. A pure
/// lookup over locations the operands already occupy: it never allocates a
/// register or emits a spill, since committing a fresh register without
/// also loading the operand's value into it would leave that register
/// holding garbage. When no existing combination matches, `dst_loc`/
/// `src_loc` fall back to the operands' current (non-register) locations
/// and the caller (the emitter, which alone may emit code) is responsible
/// for materializing both sides into real registers (§4.4.2).
#[derive(Debug, Clone)]
pub struct BinopPlan {
    /// Location the result is written into (and one of the two operand
    /// locations consumed).
    pub dst_loc: Location,
    /// The other operand's location.
    pub src_loc: Location,
    /// True if the operands were read in `(rhs, lhs)` order relative to
    /// the call (valid only because the operation is commutative).
    pub swapped: bool,
}

fn location_of_kind(vs: &VirtualStack, id: ElementId, kind: LocationKind) -> Option<Location> {
    vs.locations(id)
        .iter()
        .copied()
        .find(|l| LocationKind::from(l) == kind)
}

fn first_location(vs: &VirtualStack, id: ElementId) -> Location {
    vs.locations(id).first().copied().unwrap_or(Location::Literal(U256::ZERO))
}

/// Choose a `(dst, src)` pair for a commutative binop (`ADD`/`AND`/`OR`/
/// `XOR`/`EQ`/`MUL`) by walking `COMMUTATIVE_BINOP_COMBINATIONS` in
/// precedence order and testing both operand orders at each step, since
/// the operation is commutative (§4.4.2). Returns each operand's current
/// location verbatim when no entry matches, rather than allocating.
pub fn plan_commutative_binop(vs: &VirtualStack, lhs: ElementId, rhs: ElementId) -> BinopPlan {
    for (dst_kind, src_kind) in COMMUTATIVE_BINOP_COMBINATIONS {
        if let (Some(dst_loc), Some(src_loc)) = (
            location_of_kind(vs, lhs, dst_kind),
            location_of_kind(vs, rhs, src_kind),
        ) {
            return BinopPlan {
                dst_loc,
                src_loc,
                swapped: false,
            };
        }
        if let (Some(dst_loc), Some(src_loc)) = (
            location_of_kind(vs, rhs, dst_kind),
            location_of_kind(vs, lhs, src_kind),
        ) {
            return BinopPlan {
                dst_loc,
                src_loc,
                swapped: true,
            };
        }
    }
    BinopPlan {
        dst_loc: first_location(vs, lhs),
        src_loc: first_location(vs, rhs),
        swapped: false,
    }
}

/// Plan for a non-commutative binary op (`SUB`, `DIV`, comparisons): the
/// left operand must end up in a register since x86 subtract/compare
/// destinations can't be literals. A pure lookup like [`plan_commutative_binop`]:
/// `lhs_loc` reports lhs's existing register location if it has one, and
/// the emitter materializes it otherwise.
#[derive(Debug, Clone)]
pub struct OrderedBinopPlan {
    /// `lhs`'s existing register location, if it already has one.
    pub lhs_loc: Option<Location>,
    /// Location of `rhs`, used as the instruction's source operand.
    pub rhs_loc: Location,
}

/// Report whether `lhs` already occupies a register (general or AVX), and
/// `rhs`'s best available location, without mutating either.
pub fn plan_ordered_binop(vs: &VirtualStack, lhs: ElementId, rhs: ElementId) -> OrderedBinopPlan {
    let lhs_loc =
        location_of_kind(vs, lhs, LocationKind::GeneralReg).or_else(|| location_of_kind(vs, lhs, LocationKind::AvxReg));
    let rhs_loc = first_location(vs, rhs);
    OrderedBinopPlan { lhs_loc, rhs_loc }
}

/// Materialize `id` into a general register if it currently lives only as
/// a literal or stack offset (needed before instructions, like jump
/// targets, that require a register operand).
pub fn materialize_to_general_reg(vs: &mut VirtualStack, id: ElementId) -> (Location, Option<SpillAction>) {
    if let Some(loc) = location_of_kind(vs, id, LocationKind::GeneralReg) {
        return (loc, None);
    }
    let (bundle, spill) = vs.alloc_general_reg(id);
    (Location::GeneralReg(bundle), spill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commutative_prefers_register_register() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(1));
        let b = vs.push_literal(U256::from(2));
        vs.alloc_general_reg(a);
        vs.alloc_general_reg(b);
        let plan = plan_commutative_binop(&vs, a, b);
        assert!(matches!(plan.dst_loc, Location::GeneralReg(_)));
        assert!(matches!(plan.src_loc, Location::GeneralReg(_)));
    }

    #[test]
    fn commutative_without_a_register_operand_reports_existing_locations() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(1));
        let b = vs.push_literal(U256::from(2));
        let plan = plan_commutative_binop(&vs, a, b);
        assert!(matches!(plan.dst_loc, Location::Literal(_)));
        assert!(matches!(plan.src_loc, Location::Literal(_)));
    }

    #[test]
    fn folds_two_literals() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(3));
        let b = vs.push_literal(U256::from(4));
        let outcome = try_fold_binop(FoldOp::Add, &vs, a, b).unwrap();
        assert_eq!(outcome, FoldOutcome::Literal(U256::from(7)));
    }

    #[test]
    fn add_zero_identity_uses_lhs_unmodified() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(9));
        vs.alloc_general_reg(a);
        let zero = vs.push_literal(U256::ZERO);
        let outcome = try_fold_binop(FoldOp::Add, &vs, a, zero).unwrap();
        assert_eq!(outcome, FoldOutcome::UseLhs);
    }

    #[test]
    fn and_with_materialized_operand_is_not_folded() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(9));
        vs.alloc_general_reg(a);
        let all_ones = vs.push_literal(U256::MAX);
        assert!(try_fold_binop(FoldOp::And, &vs, a, all_ones).is_none());
    }

    #[test]
    fn sub_same_element_folds_to_zero() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(42));
        vs.alloc_general_reg(a);
        assert_eq!(try_fold_binop(FoldOp::Sub, &vs, a, a), Some(FoldOutcome::Literal(U256::ZERO)));
    }

    #[test]
    fn mul_by_zero_folds_regardless_of_side() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(42));
        vs.alloc_general_reg(a);
        let zero = vs.push_literal(U256::ZERO);
        assert_eq!(try_fold_binop(FoldOp::Mul, &vs, zero, a), Some(FoldOutcome::Literal(U256::ZERO)));
    }

    #[test]
    fn ordered_binop_reports_existing_lhs_register() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(10));
        vs.alloc_general_reg(a);
        let b = vs.push_literal(U256::from(20));
        let plan = plan_ordered_binop(&vs, a, b);
        assert!(matches!(plan.lhs_loc, Some(Location::GeneralReg(_))));
        assert!(matches!(plan.rhs_loc, Location::Literal(_)));
    }

    #[test]
    fn ordered_binop_reports_none_when_lhs_has_no_register_yet() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(10));
        let b = vs.push_literal(U256::from(20));
        let plan = plan_ordered_binop(&vs, a, b);
        assert!(plan.lhs_loc.is_none());
    }
}
