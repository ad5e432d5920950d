//! Parent intervals and the interval store.
//!
//! Splitting an interval leaves several siblings that all carry the same
//! original value. The parent groups them: it answers "which child holds
//! the value at position p", remembers the shared spill slot all spilled
//! children store to, and tracks whether that slot is already written at
//! the value's definition.

use smallvec::SmallVec;

use crate::arena::{Arena, Id, SecondaryMap};
use crate::interval::{Interval, IntervalId};
use crate::lir::{CodePos, Function, Location, StackSlot, ValueKind, VarId, Variable};

pub type ParentId = Id<ParentInterval>;

// =============================================================================
// Parent Interval
// =============================================================================

/// The split family of one original variable.
#[derive(Debug, Clone)]
pub struct ParentInterval {
    /// All intervals carrying this value, in creation order. The first
    /// entry is the original unsplit interval.
    pub children: SmallVec<[IntervalId; 2]>,
    pub kind: ValueKind,
    /// Shared spill-slot variable, created on first spill.
    slot_var: Option<VarId>,
    /// The slot already holds the value from its definition onward, so
    /// edge resolution may skip stack-to-stack reloads into it.
    pub spill_slot_defined: bool,
}

// =============================================================================
// Interval Store
// =============================================================================

/// Arena of intervals plus their parent grouping and the variable
/// back-reference.
#[derive(Debug, Default)]
pub struct Intervals {
    pub arena: Arena<Interval>,
    pub parents: Arena<ParentInterval>,
    by_var: SecondaryMap<Variable, Option<IntervalId>>,
}

impl Intervals {
    pub fn new() -> Self {
        Intervals::default()
    }

    /// Creates the interval for a variable not seen before, with a fresh
    /// single-child parent.
    pub fn create(&mut self, var: VarId, kind: ValueKind, fixed: bool) -> IntervalId {
        let parent = self.parents.alloc(ParentInterval {
            children: SmallVec::new(),
            kind,
            slot_var: None,
            spill_slot_defined: false,
        });
        let id = self.arena.alloc(Interval::new(var, parent, kind, fixed));
        self.parents[parent].children.push(id);
        self.by_var.set(var, Some(id));
        id
    }

    /// Registers a split child produced by [`Interval::split`] under its
    /// parent and its fresh variable.
    pub fn adopt(&mut self, child: Interval) -> IntervalId {
        let parent = child.parent;
        let var = child.var;
        let id = self.arena.alloc(child);
        self.parents[parent].children.push(id);
        self.by_var.set(var, Some(id));
        id
    }

    /// The interval currently registered for a variable.
    #[inline]
    pub fn of_var(&self, var: VarId) -> Option<IntervalId> {
        self.by_var.get(var).copied().flatten()
    }

    /// The child of `parent` live at `pos`: a strict cover wins, else a
    /// child whose interval ends exactly at `pos` (values flowing out of
    /// a block are read at the block's end position).
    pub fn child_at(&self, parent: ParentId, pos: CodePos) -> Option<IntervalId> {
        let children = &self.parents[parent].children;
        children
            .iter()
            .copied()
            .find(|&c| self.arena[c].covers(pos))
            .or_else(|| {
                children
                    .iter()
                    .copied()
                    .find(|&c| self.arena[c].covers_end_inclusive(pos))
            })
    }

    /// The sibling that held the value immediately before `child`
    /// begins; source of the split move inserted when `child` activates.
    pub fn previous_child(&self, parent: ParentId, child: IntervalId) -> Option<IntervalId> {
        let start = self.arena[child].first_range_start();
        self.parents[parent]
            .children
            .iter()
            .copied()
            .filter(|&c| c != child && self.arena[c].first_range_start() < start)
            .max_by_key(|&c| self.arena[c].first_range_start())
    }

    /// The parent's shared spill-slot variable, creating it (and its
    /// slot) on first request.
    pub fn slot_variable(
        &mut self,
        parent: ParentId,
        func: &mut Function,
        next_slot: &mut u32,
    ) -> VarId {
        if let Some(var) = self.parents[parent].slot_var {
            return var;
        }
        let slot = StackSlot(*next_slot);
        *next_slot += 1;
        let kind = self.parents[parent].kind;
        let var = func.new_fixed_var(kind, Location::Stack(slot));
        self.parents[parent].slot_var = Some(var);
        var
    }

    /// The shared slot variable, if one was ever created.
    #[inline]
    pub fn slot_var(&self, parent: ParentId) -> Option<VarId> {
        self.parents[parent].slot_var
    }
}

// =============================================================================
// Tests
// =============================================================================
