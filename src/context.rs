//! The per-run allocation context.
//!
//! One `AllocationContext` is built for every function the allocator
//! processes and dropped when the run finishes. It owns deep copies of
//! everything mutable (register pools included) so concurrent
//! compilations share nothing.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::interval::IntervalId;
use crate::lir::{BlockId, CodePos, Function, InstId, RegisterSet, VarId};
use crate::parent::Intervals;
use crate::phases::verify::VerificationRunResult;
use crate::{AllocatorConfig, AllocatorStats};

// =============================================================================
// Operand Sites
// =============================================================================

/// Back-reference from a variable to one operand that names it.
///
/// Instructions are addressed by stable id, not index, so sites survive
/// the instruction insertions done by later phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandSite {
    pub block: BlockId,
    pub inst: InstId,
    pub operand: usize,
}

// =============================================================================
// Allocation Context
// =============================================================================

/// All mutable state of one allocation run, threaded through the phases.
pub struct AllocationContext<'a> {
    pub func: &'a mut Function,
    pub config: &'a AllocatorConfig,
    /// Per-run copy of the target's allocatable registers.
    pub registers: RegisterSet,
    /// Blocks in linear-scan order.
    pub block_order: Vec<BlockId>,
    /// Loop back edges found by loop detection, as `(source, header)`.
    pub back_edges: FxHashSet<(BlockId, BlockId)>,
    pub intervals: Intervals,
    /// Interval ids sorted ascending by first range start.
    pub sorted: Vec<IntervalId>,
    /// Split moves to materialize, keyed by their odd insert position.
    /// `BTreeMap` so resolution emits them in position order.
    pub split_moves: BTreeMap<CodePos, Vec<(IntervalId, IntervalId)>>,
    /// Variable -> operand sites, built with the intervals and kept
    /// current through split renaming.
    pub var_operands: FxHashMap<VarId, Vec<OperandSite>>,
    /// Block start numbers in linear-scan order, for position lookups.
    pub block_starts: Vec<(CodePos, BlockId)>,
    pub next_stack_slot: u32,
    pub stats: AllocatorStats,
    /// Value-flow snapshot taken before allocation, compared after.
    pub recorded: Option<VerificationRunResult>,
}

impl<'a> AllocationContext<'a> {
    pub fn new(func: &'a mut Function, config: &'a AllocatorConfig) -> Self {
        AllocationContext {
            func,
            config,
            registers: config.registers.clone(),
            block_order: Vec::new(),
            back_edges: FxHashSet::default(),
            intervals: Intervals::new(),
            sorted: Vec::new(),
            split_moves: BTreeMap::new(),
            var_operands: FxHashMap::default(),
            block_starts: Vec::new(),
            next_stack_slot: 0,
            stats: AllocatorStats::default(),
            recorded: None,
        }
    }

    // -------------------------------------------------------------------------
    // Position lookups
    // -------------------------------------------------------------------------

    /// The block whose number range contains `pos`.
    pub fn block_containing(&self, pos: CodePos) -> Option<BlockId> {
        match self.block_starts.binary_search_by(|&(start, _)| start.cmp(&pos)) {
            Ok(i) => Some(self.block_starts[i].1),
            Err(0) => None,
            Err(i) => {
                let (_, block) = self.block_starts[i - 1];
                (pos < self.func.blocks[block].end_number).then_some(block)
            }
        }
    }

    /// True when `pos` is the begin slot of some block. Splits landing
    /// there need no move of their own; block-edge resolution carries
    /// the value across.
    pub fn is_block_begin(&self, pos: CodePos) -> bool {
        self.block_starts
            .binary_search_by(|&(start, _)| start.cmp(&pos))
            .is_ok()
    }

    // -------------------------------------------------------------------------
    // Operand bookkeeping
    // -------------------------------------------------------------------------

    pub fn record_operand(&mut self, var: VarId, site: OperandSite) {
        self.var_operands.entry(var).or_default().push(site);
    }

    /// Number of the instruction a site refers to.
    fn site_number(&self, site: OperandSite) -> CodePos {
        self.func.blocks[site.block]
            .insts
            .iter()
            .find(|i| i.id == site.inst)
            .map_or(crate::lir::NO_POS, |i| i.number)
    }

    /// Moves every operand of `old` at positions `>= from` over to
    /// `new`, in both the instruction stream and the site table. Used
    /// when a split renames the tail of a variable's lifetime.
    pub fn rename_operands(&mut self, old: VarId, new: VarId, from: CodePos) {
        let sites = match self.var_operands.remove(&old) {
            Some(sites) => sites,
            None => return,
        };
        let (moved, kept): (Vec<_>, Vec<_>) = sites
            .into_iter()
            .partition(|&s| self.site_number(s) >= from);

        for &site in &moved {
            let block = &mut self.func.blocks[site.block];
            if let Some(inst) = block.insts.iter_mut().find(|i| i.id == site.inst) {
                inst.operands[site.operand].var = new;
            }
        }

        if !kept.is_empty() {
            self.var_operands.insert(old, kept);
        }
        if !moved.is_empty() {
            self.var_operands.entry(new).or_default().extend(moved);
        }
    }

    // -------------------------------------------------------------------------
    // Split moves
    // -------------------------------------------------------------------------

    /// Queues a move from `from` to `to` at the odd position `pos`,
    /// materialized during data-flow resolution.
    pub fn queue_split_move(&mut self, pos: CodePos, from: IntervalId, to: IntervalId) {
        debug_assert!(pos % 2 == 1);
        debug_assert!(from != to);
        self.split_moves.entry(pos).or_default().push((from, to));
    }

    /// Fresh variable carrying the same kind as `var`, for a split
    /// child.
    pub fn split_variable(&mut self, var: VarId) -> VarId {
        let kind = self.func.vars[var].kind;
        self.func.new_var(kind)
    }

    /// Convenience for tests and diagnostics.
    pub fn interval_of(&self, var: VarId) -> Option<IntervalId> {
        self.intervals.of_var(var)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::ValueKind;

    #[test]
    fn test_block_containing() {
        let mut func = Function::new();
        let entry = func.entry;
        let b1 = func.new_block();
        func.blocks[entry].begin_number = 0;
        func.blocks[entry].end_number = 6;
        func.blocks[b1].begin_number = 6;
        func.blocks[b1].end_number = 10;

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.block_starts = vec![(0, entry), (6, b1)];
        ctx.block_order = vec![entry, b1];

        assert_eq!(ctx.block_containing(0), Some(entry));
        assert_eq!(ctx.block_containing(5), Some(entry));
        assert_eq!(ctx.block_containing(6), Some(b1));
        assert_eq!(ctx.block_containing(9), Some(b1));
        assert_eq!(ctx.block_containing(10), None);

        assert!(ctx.is_block_begin(0));
        assert!(ctx.is_block_begin(6));
        assert!(!ctx.is_block_begin(4));
        assert!(!ctx.is_block_begin(10));
    }

    #[test]
    #[should_panic]
    fn test_split_move_rejects_identical_intervals() {
        let mut func = Function::new();
        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        let id = crate::arena::Id::new(0);
        ctx.queue_split_move(1, id, id);
    }

    #[test]
    #[should_panic]
    fn test_split_move_rejects_even_position() {
        let mut func = Function::new();
        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        let a = crate::arena::Id::new(0);
        let b = crate::arena::Id::new(1);
        ctx.queue_split_move(2, a, b);
    }

    #[test]
    fn test_rename_operands_respects_position() {
        let mut func = Function::new();
        let entry = func.entry;
        let v = func.new_var(ValueKind::Int);
        let a = func.push_def(entry, v);
        let b = func.push_op(entry, &[v], &[]);
        func.blocks[entry].insts[0].number = 0;
        func.blocks[entry].insts[1].number = 2;

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.record_operand(v, OperandSite { block: entry, inst: a, operand: 0 });
        ctx.record_operand(v, OperandSite { block: entry, inst: b, operand: 0 });

        let w = ctx.split_variable(v);
        ctx.rename_operands(v, w, 2);

        assert_eq!(ctx.func.blocks[entry].insts[0].operands[0].var, v);
        assert_eq!(ctx.func.blocks[entry].insts[1].operands[0].var, w);
        assert_eq!(ctx.var_operands[&v].len(), 1);
        assert_eq!(ctx.var_operands[&w].len(), 1);
    }
}
