//! The virtual stack: the compile-time model of the EVM operand stack
//! within a basic block (§3.4, §4.4).

use ahash::AHashSet;
use alloy_primitives::U256;

use super::location::{AvxSlot, GeneralRegBundle, Location, StackSlot};

/// Identifier for a logical stack element, stable across `dup`/`swap`
/// (§3.4: "an element pushed twice via DUP is the same logical object").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(u32);

#[derive(Debug, Clone)]
struct ElementData {
    locations: Vec<Location>,
    /// Symbolic stack positions (indices into `VirtualStack::stack`) this
    /// element is currently visible at, maintained incrementally by
    /// `push`/`pop`/`dup`/`swap`.
    stack_indices: AHashSet<usize>,
}

impl ElementData {
    fn has_location(&self, kind_eq: impl Fn(&Location) -> bool) -> bool {
        self.locations.iter().any(kind_eq)
    }
}

/// Maximum general-register bundles (§4.4: 3, one callee-save).
const NUM_GENERAL_BUNDLES: usize = 3;
/// Maximum vector register slots (§4.4: 16).
const NUM_AVX_SLOTS: usize = 16;

/// The analytic model of the EVM operand stack during compilation of one
/// basic block (§3.4, §4.4).
#[derive(Debug)]
pub struct VirtualStack {
    arena: Vec<ElementData>,
    /// Conceptual operand stack, bottom to top; entries are element ids.
    stack: Vec<ElementId>,
    general_regs: [Option<ElementId>; NUM_GENERAL_BUNDLES],
    avx_regs: [Option<ElementId>; NUM_AVX_SLOTS],
    /// Stack-offset pool in the outgoing EVM stack memory; index is the
    /// physical slot number, grown on demand.
    stack_slots: Vec<Option<ElementId>>,
    literal_pool: Vec<U256>,
    /// Lowest cumulative stack-size delta observed so far in this block,
    /// used for the prologue's `stack_size + min_delta >= 0` bounds check.
    min_delta: i32,
    /// Highest cumulative stack-size delta observed so far, used for the
    /// `stack_size + max_delta <= 1024` bounds check.
    max_delta: i32,
    cur_delta: i32,
}

/// Emitted instructions to perform a physical register/memory move,
/// returned by operations that must materialize a spill (§4.4 `alloc_*`,
/// `insert_*`). The emitter consumes these; the virtual stack itself never
/// emits code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpillAction {
    /// Move `from` into `to` for `element`.
    Move {
        /// Which element is being relocated.
        element: ElementId,
        /// Its previous location.
        from: Location,
        /// Its new location.
        to: Location,
    },
}

impl Default for VirtualStack {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualStack {
    /// An empty virtual stack at the start of a basic block.
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            stack: Vec::new(),
            general_regs: [None; NUM_GENERAL_BUNDLES],
            avx_regs: [None; NUM_AVX_SLOTS],
            stack_slots: Vec::new(),
            literal_pool: Vec::new(),
            min_delta: 0,
            max_delta: 0,
            cur_delta: 0,
        }
    }

    fn new_element(&mut self, locations: Vec<Location>) -> ElementId {
        let id = ElementId(self.arena.len() as u32);
        self.arena.push(ElementData {
            locations,
            stack_indices: AHashSet::default(),
        });
        id
    }

    fn data(&self, id: ElementId) -> &ElementData {
        &self.arena[id.0 as usize]
    }

    fn data_mut(&mut self, id: ElementId) -> &mut ElementData {
        &mut self.arena[id.0 as usize]
    }

    fn track_delta(&mut self, delta: i32) {
        self.cur_delta += delta;
        self.min_delta = self.min_delta.min(self.cur_delta);
        self.max_delta = self.max_delta.max(self.cur_delta);
    }

    /// Bounds-check deltas accumulated so far in this block (§4.4 "Basic
    /// block prologue"). Reset for the next block by constructing a fresh
    /// `VirtualStack`.
    pub fn deltas(&self) -> (i32, i32) {
        (self.min_delta, self.max_delta)
    }

    /// Push a compile-time constant (§4.4 "purely symbolic; never emit
    /// code").
    pub fn push_literal(&mut self, value: U256) -> ElementId {
        let id = self.new_element(vec![Location::Literal(value)]);
        let idx = self.stack.len();
        self.stack.push(id);
        self.data_mut(id).stack_indices.insert(idx);
        self.track_delta(1);
        id
    }

    /// Push an element that already has a concrete location (e.g. the
    /// result of an operation placed directly into a register).
    pub fn push_existing(&mut self, id: ElementId) {
        let idx = self.stack.len();
        self.stack.push(id);
        self.data_mut(id).stack_indices.insert(idx);
        self.track_delta(1);
    }

    /// Pop the top element, returning its id. The element may remain alive
    /// through other stack indices if it was `dup`'d (§3.4).
    pub fn pop(&mut self) -> Option<ElementId> {
        let id = self.stack.pop()?;
        let idx = self.stack.len();
        self.data_mut(id).stack_indices.remove(&idx);
        self.track_delta(-1);
        Some(id)
    }

    /// Duplicate the `i`-th element from the top (1-indexed, as `DUPi`).
    /// Purely symbolic: the duplicated slot shares the same `ElementId`.
    pub fn dup(&mut self, i: usize) -> Option<ElementId> {
        let len = self.stack.len();
        if i == 0 || i > len {
            return None;
        }
        let id = self.stack[len - i];
        let new_idx = len;
        self.stack.push(id);
        self.data_mut(id).stack_indices.insert(new_idx);
        self.track_delta(1);
        Some(id)
    }

    /// Swap the top element with the `i`-th element from the top
    /// (1-indexed, as `SWAPi`). Purely symbolic.
    pub fn swap(&mut self, i: usize) -> bool {
        let len = self.stack.len();
        if i == 0 || i > len - 1 {
            return false;
        }
        let top = len - 1;
        let other = len - 1 - i;
        let top_id = self.stack[top];
        let other_id = self.stack[other];
        self.stack.swap(top, other);
        self.data_mut(top_id).stack_indices.remove(&top);
        self.data_mut(top_id).stack_indices.insert(other);
        self.data_mut(other_id).stack_indices.remove(&other);
        self.data_mut(other_id).stack_indices.insert(top);
        true
    }

    /// The stack positions `id` currently occupies (§3.4, §4.4 `P5`).
    pub fn stack_indices(&self, id: ElementId) -> Vec<usize> {
        let mut v: Vec<usize> = self.data(id).stack_indices.iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Current locations of `id`.
    pub fn locations(&self, id: ElementId) -> &[Location] {
        &self.data(id).locations
    }

    /// Element currently on top of the stack, if any.
    pub fn top(&self) -> Option<ElementId> {
        self.stack.last().copied()
    }

    /// Current symbolic stack depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Reserve a general-register bundle for `element`, spilling its
    /// current occupant to a fresh stack offset if all three are busy
    /// (§4.4 `alloc_*`).
    pub fn alloc_general_reg(&mut self, element: ElementId) -> (GeneralRegBundle, Option<SpillAction>) {
        for (idx, slot) in self.general_regs.iter().enumerate() {
            if slot.is_none() {
                self.general_regs[idx] = Some(element);
                let bundle = GeneralRegBundle(idx as u8);
                self.data_mut(element).locations.push(Location::GeneralReg(bundle));
                return (bundle, None);
            }
        }
        // All bundles busy: evict bundle 1 (first caller-save) to a fresh
        // stack slot, never the callee-save bundle 0 unless it is the only
        // option left (kept simple: never evict 0 here, matching the
        // teacher's preference for keeping a dedicated stable register).
        let victim = self.general_regs[1].take().expect("bundle 1 always occupied when full");
        let slot = self.alloc_stack_slot(victim);
        self.data_mut(victim).locations.retain(|l| !matches!(l, Location::GeneralReg(b) if *b == GeneralRegBundle(1)));
        self.general_regs[1] = Some(element);
        let bundle = GeneralRegBundle(1);
        self.data_mut(element).locations.push(Location::GeneralReg(bundle));
        (
            bundle,
            Some(SpillAction::Move {
                element: victim,
                from: Location::GeneralReg(GeneralRegBundle(1)),
                to: Location::StackOffset(slot),
            }),
        )
    }

    /// Reserve a vector register for `element`, spilling the oldest
    /// occupant to a stack offset if all sixteen are busy.
    pub fn alloc_avx_reg(&mut self, element: ElementId) -> (AvxSlot, Option<SpillAction>) {
        for (idx, slot) in self.avx_regs.iter().enumerate() {
            if slot.is_none() {
                self.avx_regs[idx] = Some(element);
                let avx = AvxSlot(idx as u8);
                self.data_mut(element).locations.push(Location::AvxReg(avx));
                return (avx, None);
            }
        }
        let victim = self.avx_regs[0].take().expect("slot 0 always occupied when full");
        let stack_slot = self.alloc_stack_slot(victim);
        self.data_mut(victim).locations.retain(|l| !matches!(l, Location::AvxReg(a) if *a == AvxSlot(0)));
        self.avx_regs[0] = Some(element);
        let avx = AvxSlot(0);
        self.data_mut(element).locations.push(Location::AvxReg(avx));
        (
            avx,
            Some(SpillAction::Move {
                element: victim,
                from: Location::AvxReg(AvxSlot(0)),
                to: Location::StackOffset(stack_slot),
            }),
        )
    }

    /// Reserve a fresh stack-memory slot for `element` and record the
    /// location; grows the pool if every existing slot is occupied.
    pub fn alloc_stack_slot(&mut self, element: ElementId) -> StackSlot {
        for (idx, slot) in self.stack_slots.iter().enumerate() {
            if slot.is_none() {
                self.stack_slots[idx] = Some(element);
                let s = StackSlot(idx as u32);
                self.data_mut(element).locations.push(Location::StackOffset(s));
                return s;
            }
        }
        let idx = self.stack_slots.len();
        self.stack_slots.push(Some(element));
        let s = StackSlot(idx as u32);
        self.data_mut(element).locations.push(Location::StackOffset(s));
        s
    }

    /// Add `loc` as an additional location for `element` without removing
    /// any existing one (§4.4 `insert_*`).
    pub fn insert_location(&mut self, element: ElementId, loc: Location) {
        if !self.data(element).has_location(|l| *l == loc) {
            self.data_mut(element).locations.push(loc);
        }
    }

    /// Remove `loc` from `element`'s location set; the element may remain
    /// alive through other locations or stack indices (§4.4 `release_*`).
    pub fn release_location(&mut self, element: ElementId, loc: Location) {
        self.data_mut(element).locations.retain(|l| *l != loc);
        match loc {
            Location::GeneralReg(b) => {
                if self.general_regs[b.0 as usize] == Some(element) {
                    self.general_regs[b.0 as usize] = None;
                }
            }
            Location::AvxReg(a) => {
                if self.avx_regs[a.0 as usize] == Some(element) {
                    self.avx_regs[a.0 as usize] = None;
                }
            }
            Location::StackOffset(s) => {
                if self.stack_slots[s.0 as usize] == Some(element) {
                    self.stack_slots[s.0 as usize] = None;
                }
            }
            Location::Literal(_) => {}
        }
    }

    /// Spill every element currently held in a caller-save register
    /// (general bundles 1, 2, and all AVX slots) to stack offsets, before
    /// any external call (§4.4 `spill_all_caller_save_regs`). The
    /// callee-save bundle (0) is left untouched.
    pub fn spill_all_caller_save_regs(&mut self) -> Vec<SpillAction> {
        let mut actions = Vec::new();
        for idx in 1..NUM_GENERAL_BUNDLES {
            if let Some(element) = self.general_regs[idx].take() {
                let from = Location::GeneralReg(GeneralRegBundle(idx as u8));
                if self.data(element).has_location(|l| matches!(l, Location::StackOffset(_))) {
                    self.data_mut(element).locations.retain(|l| *l != from);
                    continue;
                }
                let slot = self.alloc_stack_slot(element);
                self.data_mut(element).locations.retain(|l| *l != from);
                actions.push(SpillAction::Move {
                    element,
                    from,
                    to: Location::StackOffset(slot),
                });
            }
        }
        for idx in 0..NUM_AVX_SLOTS {
            if let Some(element) = self.avx_regs[idx].take() {
                let from = Location::AvxReg(AvxSlot(idx as u8));
                if self.data(element).has_location(|l| matches!(l, Location::StackOffset(_))) {
                    self.data_mut(element).locations.retain(|l| *l != from);
                    continue;
                }
                let slot = self.alloc_stack_slot(element);
                self.data_mut(element).locations.retain(|l| *l != from);
                actions.push(SpillAction::Move {
                    element,
                    from,
                    to: Location::StackOffset(slot),
                });
            }
        }
        actions
    }

    /// Record a literal into the read-only literal pool, returning its
    /// index (§4.4 "literal pool emitted in the read-only section").
    pub fn intern_literal(&mut self, value: U256) -> usize {
        if let Some(idx) = self.literal_pool.iter().position(|v| *v == value) {
            return idx;
        }
        self.literal_pool.push(value);
        self.literal_pool.len() - 1
    }

    /// The literal pool accumulated so far, for the finalization pass
    /// (§4.4 "Finalization").
    pub fn literal_pool(&self) -> &[U256] {
        &self.literal_pool
    }

    /// Compute the final write plan for `write_to_final_stack_offsets`
    /// (§4.4 "Basic block epilogue"): for each live element, every stack
    /// index it occupies must hold its value in memory by the time the
    /// block exits. Returns moves in an order that breaks cycles using a
    /// spare AVX register as temporary, per §9's design note (no
    /// recursion: explicit topological sort with cycle breaking).
    pub fn plan_final_stack_writes(&self) -> FinalWritePlan {
        // Each stack index needs a write of its element's value. We first
        // build the dependency graph "slot A must be written using
        // whatever currently sits in slot B" only for cases where the
        // write destination and some other live element's *current*
        // stack-offset location coincide — i.e. a true swap/dup cycle.
        // Since stack offsets here are a pool (not indexed by symbolic
        // stack position), and writes target symbolic stack indices
        // directly, the only cycles that can arise are when two elements'
        // sole remaining locations are each other's target StackOffset
        // slot after a SWAP. We detect that narrow case by slot identity.
        let mut writes = Vec::new();
        let mut cycle_breaks = Vec::new();

        let mut targets: Vec<(ElementId, usize)> = Vec::new();
        for (id, data) in self.arena.iter().enumerate() {
            for &idx in &data.stack_indices {
                targets.push((ElementId(id as u32), idx));
            }
        }
        targets.sort_by_key(|(_, idx)| *idx);

        // Detect direct 2-cycles: element A's only in-memory location is
        // slot occupied physically by element B, and vice versa.
        let mut handled = AHashSet::default();
        for i in 0..targets.len() {
            let (elem_a, idx_a) = targets[i];
            if handled.contains(&i) {
                continue;
            }
            for j in (i + 1)..targets.len() {
                let (elem_b, idx_b) = targets[j];
                if elem_a == elem_b {
                    continue;
                }
                let a_in_b_slot = self
                    .data(elem_a)
                    .locations
                    .iter()
                    .any(|l| matches!(l, Location::StackOffset(s) if self.stack_slots.get(s.0 as usize) == Some(&Some(elem_b))));
                let b_in_a_slot = self
                    .data(elem_b)
                    .locations
                    .iter()
                    .any(|l| matches!(l, Location::StackOffset(s) if self.stack_slots.get(s.0 as usize) == Some(&Some(elem_a))));
                if a_in_b_slot && b_in_a_slot {
                    cycle_breaks.push(CycleBreak {
                        temp: AvxSlot(15),
                        first: elem_a,
                        second: elem_b,
                    });
                    handled.insert(i);
                    handled.insert(j);
                }
            }
        }

        for (elem, idx) in targets {
            writes.push(FinalWrite {
                element: elem,
                stack_index: idx,
            });
        }

        FinalWritePlan { writes, cycle_breaks }
    }
}

/// One element that must land at `stack_index` by block exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalWrite {
    /// The element to write.
    pub element: ElementId,
    /// The symbolic stack index it must occupy.
    pub stack_index: usize,
}

/// A detected 2-cycle in "element X currently occupies element Y's final
/// slot", resolved using a spare AVX register as temporary (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBreak {
    /// Spare register used to hold one side of the swap temporarily.
    pub temp: AvxSlot,
    /// One element in the cycle.
    pub first: ElementId,
    /// The other element in the cycle.
    pub second: ElementId,
}

/// The epilogue's plan for `write_to_final_stack_offsets` (§4.4).
#[derive(Debug, Clone)]
pub struct FinalWritePlan {
    /// Individual per-index writes, in ascending stack-index order.
    pub writes: Vec<FinalWrite>,
    /// Cycles that must be broken via a temporary before `writes` runs.
    pub cycle_breaks: Vec<CycleBreak>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_literal() {
        let mut vs = VirtualStack::new();
        let id = vs.push_literal(U256::from(42));
        assert_eq!(vs.depth(), 1);
        assert_eq!(vs.stack_indices(id), vec![0]);
        let popped = vs.pop().unwrap();
        assert_eq!(popped, id);
        assert_eq!(vs.depth(), 0);
    }

    #[test]
    fn dup_shares_identity() {
        let mut vs = VirtualStack::new();
        let id = vs.push_literal(U256::from(7));
        let dup_id = vs.dup(1).unwrap();
        assert_eq!(id, dup_id);
        assert_eq!(vs.stack_indices(id), vec![0, 1]);
    }

    #[test]
    fn swap_updates_indices() {
        let mut vs = VirtualStack::new();
        let a = vs.push_literal(U256::from(1));
        let b = vs.push_literal(U256::from(2));
        assert!(vs.swap(1));
        assert_eq!(vs.stack_indices(a), vec![1]);
        assert_eq!(vs.stack_indices(b), vec![0]);
    }

    #[test]
    fn deltas_track_min_and_max() {
        let mut vs = VirtualStack::new();
        vs.push_literal(U256::from(1));
        vs.push_literal(U256::from(2));
        vs.pop();
        vs.pop();
        let (min, max) = vs.deltas();
        assert_eq!(max, 2);
        assert_eq!(min, 0);
    }

    #[test]
    fn alloc_general_reg_spills_when_full() {
        let mut vs = VirtualStack::new();
        let e0 = vs.push_literal(U256::from(0));
        let e1 = vs.push_literal(U256::from(1));
        let e2 = vs.push_literal(U256::from(2));
        let e3 = vs.push_literal(U256::from(3));
        vs.alloc_general_reg(e0);
        vs.alloc_general_reg(e1);
        vs.alloc_general_reg(e2);
        let (_, spill) = vs.alloc_general_reg(e3);
        assert!(spill.is_some());
    }
}
