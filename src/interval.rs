//! Live Interval Representation
//!
//! An interval records where one variable is live as an ordered list of
//! disjoint half-open ranges, plus the positions where instructions use
//! the variable and how strongly those uses want a register.
//!
//! # Invariants
//!
//! - Ranges are ascending and separated: for neighbors `a`, `b` it holds
//!   that `a.to < b.from`. Touching ranges are merged on insertion.
//! - Use positions are ascending; inserting a duplicate position keeps
//!   the stronger kind.
//! - All positions are even (instruction numbers).
//!
//! The `*_incremental` queries carry a cursor that only moves forward,
//! so a whole allocation walk over monotonically increasing positions
//! costs amortized O(ranges) per interval instead of O(ranges) per query.

use crate::arena::Id;
use crate::error::{fatal_check, FatalError};
use crate::lir::{CodePos, Location, Reg, RegClass, StackSlot, ValueKind, VarId, NO_POS};

use crate::parent::ParentId;

pub type IntervalId = Id<Interval>;

// =============================================================================
// Range
// =============================================================================

/// A contiguous half-open span `[from, to)` where the variable is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub from: CodePos,
    pub to: CodePos,
}

impl Range {
    #[inline]
    pub const fn new(from: CodePos, to: CodePos) -> Self {
        Range { from, to }
    }

    #[inline]
    pub const fn contains(&self, pos: CodePos) -> bool {
        self.from <= pos && pos < self.to
    }

    #[inline]
    pub const fn intersects(&self, other: &Range) -> bool {
        self.from < other.to && other.from < self.to
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

// =============================================================================
// Use Positions
// =============================================================================

/// How strongly a use position wants a register, weakest first.
///
/// The derived order is load-bearing: a duplicate insertion keeps the
/// `max`, and the split heuristics search for uses at or above a
/// threshold kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UseKind {
    /// Position is referenced but tolerates any location.
    None,
    /// Pseudo-use marking a loop end, so spill decisions see the whole
    /// loop as one region.
    LoopEndMarker,
    /// Register strongly preferred, stack tolerated.
    ShouldHaveRegister,
    /// Register required; allocation may not leave this on the stack.
    MustHaveRegister,
}

/// A recorded use of the variable at an (even) instruction position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsePos {
    pub pos: CodePos,
    pub kind: UseKind,
}

// =============================================================================
// Interval State
// =============================================================================

/// Position of an interval in the allocation walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Not yet queued.
    #[default]
    None,
    /// Queued, start position not yet reached.
    Unhandled,
    /// Covers the current position and holds its location.
    Active,
    /// Current position is in a lifetime hole.
    Inactive,
    /// Walk has passed the interval's end.
    Handled,
}

// =============================================================================
// Interval
// =============================================================================

/// The live interval of one variable (or of one split child of one).
#[derive(Debug, Clone)]
pub struct Interval {
    /// Variable whose liveness this interval describes. Split children
    /// get fresh variables so operand rewriting is a rename.
    pub var: VarId,
    /// Group of all intervals split from the same original variable.
    pub parent: ParentId,
    pub kind: ValueKind,
    /// Pinned to a preassigned location; never split or spilled.
    pub fixed: bool,
    pub state: State,
    ranges: Vec<Range>,
    uses: Vec<UsePos>,
    register: Option<Reg>,
    stack_slot: Option<StackSlot>,
    /// Set on a split child created mid-lifetime: when the walk
    /// activates it, a move from the previous sibling must be inserted.
    pub insert_move_when_activated: bool,
    cover_cursor: usize,
    intersect_cursor: usize,
}

impl Interval {
    pub fn new(var: VarId, parent: ParentId, kind: ValueKind, fixed: bool) -> Self {
        Interval {
            var,
            parent,
            kind,
            fixed,
            state: State::None,
            ranges: Vec::new(),
            uses: Vec::new(),
            register: None,
            stack_slot: None,
            insert_move_when_activated: false,
            cover_cursor: 0,
            intersect_cursor: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn reg_class(&self) -> RegClass {
        self.kind.reg_class()
    }

    #[inline]
    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    #[inline]
    pub fn uses(&self) -> &[UsePos] {
        &self.uses
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Start of the first range; `NO_POS` when empty.
    #[inline]
    pub fn first_range_start(&self) -> CodePos {
        self.ranges.first().map_or(NO_POS, |r| r.from)
    }

    /// End of the last range; `NO_POS` when empty.
    #[inline]
    pub fn last_range_end(&self) -> CodePos {
        self.ranges.last().map_or(NO_POS, |r| r.to)
    }

    #[inline]
    pub fn register(&self) -> Option<Reg> {
        self.register
    }

    #[inline]
    pub fn stack_slot(&self) -> Option<StackSlot> {
        self.stack_slot
    }

    /// The location allocation chose, if any.
    #[inline]
    pub fn location(&self) -> Option<Location> {
        self.register
            .map(Location::Reg)
            .or(self.stack_slot.map(Location::Stack))
    }

    /// True when both intervals resolved to the same location.
    pub fn same_location(&self, other: &Interval) -> bool {
        match (self.location(), other.location()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Total order on resolved locations, for deterministic resolution
    /// and diagnostics: registers before stack slots, registers by class
    /// then ordinal, slots by index. Unassigned intervals sort last.
    pub fn compare_location(&self, other: &Interval) -> std::cmp::Ordering {
        match (self.location(), other.location()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    }

    // -------------------------------------------------------------------------
    // Range construction
    // -------------------------------------------------------------------------

    /// Prepends `[from, to)`. Interval construction walks the code
    /// backwards, so the new range must not start after the current
    /// first range; a touching or overlapping head range is merged.
    pub fn prepend_range(&mut self, from: CodePos, to: CodePos) -> Result<(), FatalError> {
        fatal_check!(
            from < to,
            "build-intervals",
            "empty range [{from}, {to}) for {}",
            self.var
        );
        match self.ranges.first_mut() {
            None => self.ranges.push(Range::new(from, to)),
            Some(head) => {
                fatal_check!(
                    from <= head.from,
                    "build-intervals",
                    "range [{from}, {to}) prepended after existing [{}, {}) of {}",
                    head.from,
                    head.to,
                    self.var
                );
                if to >= head.from {
                    head.from = from;
                    head.to = head.to.max(to);
                } else {
                    self.ranges.insert(0, Range::new(from, to));
                }
            }
        }
        Ok(())
    }

    /// Truncates the first range to start at `pos` (a definition kills
    /// whatever the backward walk assumed live from the block start).
    pub fn set_first_range_from(&mut self, pos: CodePos) -> Result<(), FatalError> {
        let var = self.var;
        let head = self.ranges.first_mut().ok_or_else(|| {
            FatalError::new("build-intervals", format!("{var} defined but never live"))
        })?;
        fatal_check!(
            pos < head.to,
            "build-intervals",
            "definition at {pos} outside first range [{}, {}) of {var}",
            head.from,
            head.to
        );
        head.from = pos;
        Ok(())
    }

    /// Records a use at `pos`. A duplicate position keeps the stronger
    /// kind.
    pub fn add_use(&mut self, pos: CodePos, kind: UseKind) {
        match self.uses.binary_search_by(|u| u.pos.cmp(&pos)) {
            Ok(i) => self.uses[i].kind = self.uses[i].kind.max(kind),
            Err(i) => self.uses.insert(i, UsePos { pos, kind }),
        }
    }

    // -------------------------------------------------------------------------
    // Coverage and intersection
    // -------------------------------------------------------------------------

    /// True when some range contains `pos`.
    pub fn covers(&self, pos: CodePos) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.to <= pos {
                    std::cmp::Ordering::Less
                } else if r.from > pos {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Coverage with the interval end treated as inclusive; used to find
    /// the child holding a value at a block's outgoing edge.
    pub fn covers_end_inclusive(&self, pos: CodePos) -> bool {
        self.covers(pos) || self.last_range_end() == pos
    }

    /// Cursor-backed [`Interval::covers`]; query positions must be
    /// non-decreasing over the interval's lifetime in one walk.
    pub fn covers_incremental(&mut self, pos: CodePos) -> bool {
        while self.cover_cursor < self.ranges.len() && self.ranges[self.cover_cursor].to <= pos {
            self.cover_cursor += 1;
        }
        self.cover_cursor < self.ranges.len() && self.ranges[self.cover_cursor].from <= pos
    }

    /// Earliest position at or after `from` covered by both intervals;
    /// `NO_POS` when they never overlap.
    pub fn first_intersection(&self, from: CodePos, other: &Interval) -> CodePos {
        Self::intersection_scan(&self.ranges, &other.ranges, from, 0)
    }

    /// Cursor-backed [`Interval::first_intersection`]; `from` must be
    /// non-decreasing across calls on `self`.
    pub fn first_intersection_incremental(&mut self, from: CodePos, other: &Interval) -> CodePos {
        while self.intersect_cursor < self.ranges.len()
            && self.ranges[self.intersect_cursor].to <= from
        {
            self.intersect_cursor += 1;
        }
        Self::intersection_scan(&self.ranges, &other.ranges, from, self.intersect_cursor)
    }

    fn intersection_scan(a: &[Range], b: &[Range], from: CodePos, mut i: usize) -> CodePos {
        let mut j = 0;
        while i < a.len() && j < b.len() {
            let (ra, rb) = (a[i], b[j]);
            if ra.intersects(&rb) {
                let lo = ra.from.max(rb.from).max(from);
                if lo < ra.to && lo < rb.to {
                    return lo;
                }
            }
            if ra.to <= rb.to {
                i += 1;
            } else {
                j += 1;
            }
        }
        NO_POS
    }

    // -------------------------------------------------------------------------
    // Use queries
    // -------------------------------------------------------------------------

    /// Position of the first use with at least `min_kind`.
    pub fn first_usage(&self, min_kind: UseKind) -> CodePos {
        self.uses
            .iter()
            .find(|u| u.kind >= min_kind)
            .map_or(NO_POS, |u| u.pos)
    }

    /// Position of the first use at or after `from` with at least
    /// `min_kind`.
    pub fn next_usage(&self, min_kind: UseKind, from: CodePos) -> CodePos {
        self.uses
            .iter()
            .find(|u| u.pos >= from && u.kind >= min_kind)
            .map_or(NO_POS, |u| u.pos)
    }

    /// Position of the last use strictly before `before` with at least
    /// `min_kind`.
    pub fn previous_usage(&self, min_kind: UseKind, before: CodePos) -> CodePos {
        self.uses
            .iter()
            .rev()
            .find(|u| u.pos < before && u.kind >= min_kind)
            .map_or(NO_POS, |u| u.pos)
    }

    /// Position of the next use that cannot live on the stack.
    #[inline]
    pub fn next_must_have_register(&self, from: CodePos) -> CodePos {
        self.next_usage(UseKind::MustHaveRegister, from)
    }

    // -------------------------------------------------------------------------
    // Splitting and assignment
    // -------------------------------------------------------------------------

    /// Splits off everything at or after `pos` into a new interval for
    /// `new_var`. The position must be strictly inside the interval.
    pub fn split(&mut self, pos: CodePos, new_var: VarId) -> Result<Interval, FatalError> {
        fatal_check!(
            self.first_range_start() < pos && pos < self.last_range_end(),
            "split",
            "split position {pos} not strictly inside [{}, {}) of {}",
            self.first_range_start(),
            self.last_range_end(),
            self.var
        );

        let mut child = Interval::new(new_var, self.parent, self.kind, false);

        let idx = match self.ranges.iter().position(|r| r.to > pos) {
            Some(i) => i,
            // Unreachable given the bounds check, but keep split total.
            None => self.ranges.len(),
        };
        if idx < self.ranges.len() && self.ranges[idx].from < pos {
            // Position is inside a range: cut it in two.
            let tail_to = self.ranges[idx].to;
            self.ranges[idx].to = pos;
            child.ranges.push(Range::new(pos, tail_to));
            child.ranges.extend(self.ranges.drain(idx + 1..));
        } else {
            // Position is in a hole: whole ranges move over.
            child.ranges.extend(self.ranges.drain(idx..));
        }

        let use_idx = self
            .uses
            .iter()
            .position(|u| u.pos >= pos)
            .unwrap_or(self.uses.len());
        child.uses.extend(self.uses.drain(use_idx..));

        Ok(child)
    }

    /// Places the interval in `reg`. Intervals are placed exactly once;
    /// a value that changes location gets a fresh split child instead.
    pub fn assign_register(&mut self, reg: Reg) -> Result<(), FatalError> {
        fatal_check!(
            self.register.is_none() && self.stack_slot.is_none(),
            "split",
            "{} assigned {reg} but is already placed at {}",
            self.var,
            self.location().map_or_else(String::new, |l| l.to_string())
        );
        self.register = Some(reg);
        Ok(())
    }

    pub fn assign_stack_slot(&mut self, slot: StackSlot) -> Result<(), FatalError> {
        fatal_check!(
            self.register.is_none() && self.stack_slot.is_none(),
            "split",
            "{} spilled to {slot} but is already placed at {}",
            self.var,
            self.location().map_or_else(String::new, |l| l.to_string())
        );
        fatal_check!(
            self.next_must_have_register(0) == NO_POS,
            "split",
            "{} spilled but still has a must-have-register use at {}",
            self.var,
            self.next_must_have_register(0)
        );
        self.stack_slot = Some(slot);
        Ok(())
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.var)?;
        for range in &self.ranges {
            write!(f, " {range}")?;
        }
        if let Some(loc) = self.location() {
            write!(f, " @{loc}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn interval() -> Interval {
        Interval::new(Id::new(0), Id::new(0), ValueKind::Int, false)
    }

    #[test]
    fn test_prepend_merges_touching_ranges() {
        let mut it = interval();
        it.prepend_range(10, 20).unwrap();
        it.prepend_range(4, 10).unwrap();
        assert_eq!(it.ranges(), &[Range::new(4, 20)]);

        it.prepend_range(0, 2).unwrap();
        assert_eq!(it.ranges(), &[Range::new(0, 2), Range::new(4, 20)]);
    }

    #[test]
    fn test_prepend_rejects_out_of_order() {
        let mut it = interval();
        it.prepend_range(4, 10).unwrap();
        assert!(it.prepend_range(6, 12).is_err());
        assert!(it.prepend_range(2, 2).is_err());
    }

    #[test]
    fn test_range_gap_invariant_after_construction() {
        let mut it = interval();
        it.prepend_range(20, 30).unwrap();
        it.prepend_range(10, 14).unwrap();
        it.prepend_range(0, 10).unwrap();
        for pair in it.ranges().windows(2) {
            assert!(pair[0].to < pair[1].from);
        }
    }

    #[test]
    fn test_set_first_range_from() {
        let mut it = interval();
        it.prepend_range(0, 20).unwrap();
        it.set_first_range_from(6).unwrap();
        assert_eq!(it.first_range_start(), 6);
        assert!(it.set_first_range_from(20).is_err());
    }

    #[test]
    fn test_add_use_keeps_stronger_kind() {
        let mut it = interval();
        it.add_use(8, UseKind::ShouldHaveRegister);
        it.add_use(4, UseKind::MustHaveRegister);
        it.add_use(8, UseKind::MustHaveRegister);
        it.add_use(8, UseKind::None);

        assert_eq!(it.uses().len(), 2);
        assert_eq!(it.uses()[0], UsePos { pos: 4, kind: UseKind::MustHaveRegister });
        assert_eq!(it.uses()[1], UsePos { pos: 8, kind: UseKind::MustHaveRegister });
    }

    #[test]
    fn test_covers_and_incremental_agree() {
        let mut it = interval();
        it.prepend_range(20, 30).unwrap();
        it.prepend_range(4, 10).unwrap();

        let mut inc = it.clone();
        for pos in 0..34 {
            assert_eq!(it.covers(pos), inc.covers_incremental(pos), "pos {pos}");
        }
    }

    #[test]
    fn test_covers_end_inclusive() {
        let mut it = interval();
        it.prepend_range(4, 10).unwrap();
        assert!(!it.covers(10));
        assert!(it.covers_end_inclusive(10));
        assert!(!it.covers_end_inclusive(11));
    }

    #[test]
    fn test_first_intersection_symmetry() {
        let mut a = interval();
        a.prepend_range(20, 30).unwrap();
        a.prepend_range(0, 10).unwrap();
        let mut b = interval();
        b.prepend_range(24, 40).unwrap();
        b.prepend_range(8, 12).unwrap();

        assert_eq!(a.first_intersection(0, &b), 8);
        assert_eq!(b.first_intersection(0, &a), 8);
        assert_eq!(a.first_intersection(10, &b), 24);
        assert_eq!(a.first_intersection_incremental(10, &b), 24);
    }

    #[test]
    fn test_first_intersection_disjoint() {
        let mut a = interval();
        a.prepend_range(0, 10).unwrap();
        let mut b = interval();
        b.prepend_range(10, 20).unwrap();
        assert_eq!(a.first_intersection(0, &b), NO_POS);
    }

    #[test]
    fn test_use_queries() {
        let mut it = interval();
        it.add_use(4, UseKind::ShouldHaveRegister);
        it.add_use(10, UseKind::MustHaveRegister);
        it.add_use(16, UseKind::LoopEndMarker);

        assert_eq!(it.first_usage(UseKind::MustHaveRegister), 10);
        assert_eq!(it.next_usage(UseKind::ShouldHaveRegister, 6), 10);
        assert_eq!(it.next_must_have_register(12), NO_POS);
        assert_eq!(it.previous_usage(UseKind::ShouldHaveRegister, 10), 4);
        assert_eq!(it.previous_usage(UseKind::MustHaveRegister, 10), NO_POS);
    }

    #[test]
    fn test_compare_location_order() {
        use std::cmp::Ordering;

        let mut in_reg = interval();
        in_reg.assign_register(Reg::int(1)).unwrap();
        let mut in_lower_reg = interval();
        in_lower_reg.assign_register(Reg::int(0)).unwrap();
        let mut on_stack = interval();
        on_stack.prepend_range(0, 10).unwrap();
        on_stack.assign_stack_slot(StackSlot(0)).unwrap();
        let unassigned = interval();

        assert_eq!(in_lower_reg.compare_location(&in_reg), Ordering::Less);
        assert_eq!(in_reg.compare_location(&on_stack), Ordering::Less);
        assert_eq!(on_stack.compare_location(&unassigned), Ordering::Less);
        assert_eq!(unassigned.compare_location(&unassigned), Ordering::Equal);
    }

    #[test]
    fn test_split_inside_range() {
        let mut it = interval();
        it.prepend_range(0, 20).unwrap();
        it.add_use(2, UseKind::MustHaveRegister);
        it.add_use(14, UseKind::ShouldHaveRegister);

        let child = it.split(10, Id::new(1)).unwrap();

        assert_eq!(it.ranges(), &[Range::new(0, 10)]);
        assert_eq!(child.ranges(), &[Range::new(10, 20)]);
        assert_eq!(it.uses().len(), 1);
        assert_eq!(child.uses().len(), 1);
        assert_eq!(child.uses()[0].pos, 14);
        assert_eq!(child.var, Id::new(1));
        assert_eq!(child.parent, it.parent);
    }

    #[test]
    fn test_split_in_hole() {
        let mut it = interval();
        it.prepend_range(20, 30).unwrap();
        it.prepend_range(0, 10).unwrap();

        let child = it.split(14, Id::new(1)).unwrap();
        assert_eq!(it.ranges(), &[Range::new(0, 10)]);
        assert_eq!(child.ranges(), &[Range::new(20, 30)]);
    }

    #[test]
    fn test_split_rejects_boundaries() {
        let mut it = interval();
        it.prepend_range(4, 20).unwrap();
        assert!(it.split(4, Id::new(1)).is_err());
        assert!(it.split(20, Id::new(1)).is_err());
        assert!(it.split(2, Id::new(1)).is_err());
    }

    #[test]
    fn test_split_use_conservation() {
        let mut it = interval();
        it.prepend_range(0, 40).unwrap();
        for pos in [0u32, 8, 16, 24, 32] {
            it.add_use(pos, UseKind::ShouldHaveRegister);
        }
        let before: Vec<_> = it.uses().to_vec();

        let child = it.split(16, Id::new(1)).unwrap();
        let mut after: Vec<_> = it.uses().to_vec();
        after.extend_from_slice(child.uses());
        assert_eq!(before, after);
    }

    #[test]
    fn test_assign_rejects_second_location() {
        let mut it = interval();
        it.prepend_range(0, 10).unwrap();
        it.assign_register(Reg::int(0)).unwrap();
        assert!(it.assign_register(Reg::int(1)).is_err());
        assert!(it.assign_stack_slot(StackSlot(0)).is_err());
        assert_eq!(it.location(), Some(Location::Reg(Reg::int(0))));

        let mut spilled = interval();
        spilled.prepend_range(0, 10).unwrap();
        spilled.assign_stack_slot(StackSlot(0)).unwrap();
        assert!(spilled.assign_register(Reg::int(0)).is_err());
        assert_eq!(spilled.location(), Some(Location::Stack(StackSlot(0))));
    }

    #[test]
    fn test_assign_stack_slot_rejects_register_uses() {
        let mut it = interval();
        it.prepend_range(0, 10).unwrap();
        it.add_use(4, UseKind::MustHaveRegister);
        assert!(it.assign_stack_slot(StackSlot(0)).is_err());

        let mut ok = interval();
        ok.prepend_range(0, 10).unwrap();
        ok.add_use(4, UseKind::ShouldHaveRegister);
        ok.assign_stack_slot(StackSlot(3)).unwrap();
        assert_eq!(ok.location(), Some(Location::Stack(StackSlot(3))));
    }
}
