//! Concrete locations a virtual stack element can live in (§3.4, §4.4).

use alloy_primitives::U256;

/// One of the three general-purpose register bundles, each four GPRs
/// forming a 256-bit value (§4.4 "Virtual stack"). Bundle 0 is callee-save;
/// 1 and 2 are caller-save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneralRegBundle(pub u8);

impl GeneralRegBundle {
    /// Whether this bundle must be preserved across calls (saved/restored
    /// at contract entry/exit rather than spilled before every call).
    pub fn is_callee_save(self) -> bool {
        self.0 == 0
    }
}

/// One of the sixteen 256-bit vector register slots (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvxSlot(pub u8);

/// A slot in the in-memory EVM stack frame (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot(pub u32);

/// A concrete location a stack element may live in simultaneously with
/// others (§3.4). An element's full location set is the union of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Known at compile time; never occupies a register until forced to.
    Literal(U256),
    /// A general-register bundle.
    GeneralReg(GeneralRegBundle),
    /// A vector register.
    AvxReg(AvxSlot),
    /// A slot in the outgoing EVM stack memory.
    StackOffset(StackSlot),
}

impl Location {
    /// Whether this location costs a physical register (as opposed to a
    /// literal, which is free until materialized).
    pub fn is_register(&self) -> bool {
        matches!(self, Location::GeneralReg(_) | Location::AvxReg(_))
    }
}

/// Precedence-ranked `(dst, src)` location-kind combinations tried by the
/// commutative-binop lowering policy (§4.4 "Instruction lowering policy").
/// Earlier entries are preferred because they avoid spills/materialization
/// most often: operating register-on-register first, then register-on-
/// literal, register-on-memory, and finally falling back to combinations
/// that require a fresh allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Compile-time constant.
    Literal,
    /// General-purpose register bundle.
    GeneralReg,
    /// Vector register.
    AvxReg,
    /// In-memory stack slot.
    StackOffset,
}

impl From<&Location> for LocationKind {
    fn from(loc: &Location) -> Self {
        match loc {
            Location::Literal(_) => LocationKind::Literal,
            Location::GeneralReg(_) => LocationKind::GeneralReg,
            Location::AvxReg(_) => LocationKind::AvxReg,
            Location::StackOffset(_) => LocationKind::StackOffset,
        }
    }
}

/// The fifteen precedence-ranked `(dst, src)` combinations for commutative
/// binops (`ADD`, `AND`, `OR`, `XOR`, `EQ`, `MUL`), highest precedence
/// first (§4.4.2).
pub const COMMUTATIVE_BINOP_COMBINATIONS: [(LocationKind, LocationKind); 15] = [
    (LocationKind::GeneralReg, LocationKind::GeneralReg),
    (LocationKind::GeneralReg, LocationKind::Literal),
    (LocationKind::GeneralReg, LocationKind::StackOffset),
    (LocationKind::GeneralReg, LocationKind::AvxReg),
    (LocationKind::AvxReg, LocationKind::AvxReg),
    (LocationKind::AvxReg, LocationKind::GeneralReg),
    (LocationKind::AvxReg, LocationKind::Literal),
    (LocationKind::AvxReg, LocationKind::StackOffset),
    (LocationKind::StackOffset, LocationKind::GeneralReg),
    (LocationKind::StackOffset, LocationKind::Literal),
    (LocationKind::StackOffset, LocationKind::AvxReg),
    (LocationKind::StackOffset, LocationKind::StackOffset),
    (LocationKind::Literal, LocationKind::GeneralReg),
    (LocationKind::Literal, LocationKind::AvxReg),
    (LocationKind::Literal, LocationKind::StackOffset),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_zero_is_callee_save() {
        assert!(GeneralRegBundle(0).is_callee_save());
        assert!(!GeneralRegBundle(1).is_callee_save());
    }

    #[test]
    fn combination_table_has_fifteen_entries_register_register_first() {
        assert_eq!(COMMUTATIVE_BINOP_COMBINATIONS.len(), 15);
        assert_eq!(
            COMMUTATIVE_BINOP_COMBINATIONS[0],
            (LocationKind::GeneralReg, LocationKind::GeneralReg)
        );
    }
}
