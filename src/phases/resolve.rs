//! Data-flow resolution.
//!
//! The walk decided locations and queued the moves splitting requires;
//! this phase materializes them and reconnects values across control
//! flow. Three kinds of moves come out of it:
//!
//! - split moves at odd positions inside a block, connecting two
//!   children of the same parent interval,
//! - edge moves where a value leaves a block in one location and its
//!   successor expects another; on a critical edge these go into a fresh
//!   block spliced onto the edge,
//! - spill-slot-definition stores, written once at a value's single
//!   definition when that makes every later reload's slot current.
//!
//! Moves scheduled for one insertion point are ordered so no move
//! overwrites a location another still reads; a cyclic dependency is
//! broken by parking one value in its parent's spill slot.
//!
//! Afterwards, variables that resolved to the same location are merged
//! into one, which exposes the now-redundant moves to the cleanup pass.

use rustc_hash::FxHashMap;

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::interval::IntervalId;
use crate::lir::{
    BlockId, CodePos, Constraint, Effect, Inst, InstId, InstKind, Location, MoveKind, Operand,
    VarId, NO_POS,
};
use crate::parent::ParentId;
use crate::phase::Phase;

pub struct ResolveDataFlow;

// =============================================================================
// Edges
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct MovePair {
    from: IntervalId,
    to: IntervalId,
}

/// The moves of one insertion point, in a safe execution order.
#[derive(Debug, Default)]
struct Edge {
    pairs: Vec<MovePair>,
    /// Pairs in a cyclic dependency; routed through their parent's
    /// spill slot instead.
    spilled: Vec<MovePair>,
}

impl Edge {
    fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.spilled.is_empty()
    }

    fn location(ctx: &AllocationContext, id: IntervalId) -> Result<Location, FatalError> {
        ctx.intervals.arena[id].location().ok_or_else(|| {
            FatalError::new(
                "resolve",
                format!("interval of {} has no location", ctx.intervals.arena[id].var),
            )
        })
    }

    /// Schedules one move, keeping the order overwrite-free: it may not
    /// run before a move that still reads its destination, nor after one
    /// that overwrites its source. An unsatisfiable window is a cycle.
    fn add(&mut self, ctx: &AllocationContext, pair: MovePair) -> Result<(), FatalError> {
        let from_iv = &ctx.intervals.arena[pair.from];
        let to_iv = &ctx.intervals.arena[pair.to];
        if from_iv.parent == to_iv.parent
            && ctx.intervals.slot_var(from_iv.parent).is_some()
            && ctx.intervals.parents[from_iv.parent].spill_slot_defined
            && to_iv.location().is_some_and(Location::is_stack)
        {
            // The shared slot was stored at the definition; it already
            // holds the value.
            return Ok(());
        }

        let from_loc = Self::location(ctx, pair.from)?;
        let to_loc = Self::location(ctx, pair.to)?;

        let mut min = 0;
        let mut max = self.pairs.len();
        for (z, other) in self.pairs.iter().enumerate() {
            if Self::location(ctx, other.from)? == to_loc {
                min = min.max(z + 1);
            }
            if Self::location(ctx, other.to)? == from_loc {
                max = max.min(z);
            }
        }
        if min > max {
            self.spilled.push(pair);
            return Ok(());
        }

        // Within the legal window, keep a deterministic location order.
        let mut at = max;
        for i in min..max {
            let other = self.pairs[i];
            let ord = ctx.intervals.arena[other.from]
                .compare_location(&ctx.intervals.arena[pair.from])
                .then_with(|| {
                    ctx.intervals.arena[other.to].compare_location(&ctx.intervals.arena[pair.to])
                });
            if ord != std::cmp::Ordering::Less {
                at = i;
                break;
            }
        }
        self.pairs.insert(at, pair);
        Ok(())
    }

    /// Emits the scheduled moves before `index` in `block`.
    fn resolve(
        &self,
        ctx: &mut AllocationContext,
        block: BlockId,
        mut index: usize,
        number: CodePos,
        kind: MoveKind,
    ) {
        for pair in &self.spilled {
            let parent = ctx.intervals.arena[pair.from].parent;
            let slot_var = ctx
                .intervals
                .slot_variable(parent, ctx.func, &mut ctx.next_stack_slot);
            let src = ctx.intervals.arena[pair.from].var;
            insert_move(ctx, block, index, number, kind, src, slot_var);
            index += 1;
        }
        for pair in &self.pairs {
            let src = ctx.intervals.arena[pair.from].var;
            let dst = ctx.intervals.arena[pair.to].var;
            insert_move(ctx, block, index, number, kind, src, dst);
            index += 1;
        }
        for pair in &self.spilled {
            let parent = ctx.intervals.arena[pair.to].parent;
            let slot_var = ctx
                .intervals
                .slot_variable(parent, ctx.func, &mut ctx.next_stack_slot);
            let dst = ctx.intervals.arena[pair.to].var;
            insert_move(ctx, block, index, number, kind, slot_var, dst);
            index += 1;
        }
    }
}

fn insert_move(
    ctx: &mut AllocationContext,
    block: BlockId,
    index: usize,
    number: CodePos,
    kind: MoveKind,
    src: VarId,
    dst: VarId,
) {
    let mut inst = ctx.func.make_inst(
        InstKind::Move(kind),
        [
            Operand::new(src, Effect::Use, Constraint::Any),
            Operand::new(dst, Effect::Def, Constraint::Any),
        ],
    );
    inst.number = number;
    ctx.func.blocks[block].insts.insert(index, inst);
    ctx.stats.num_moves_inserted += 1;
}

// =============================================================================
// Insertion points
// =============================================================================

/// Block and instruction index for moves at an odd split position.
fn position_insert_point(
    ctx: &AllocationContext,
    pos: CodePos,
) -> Result<(BlockId, usize), FatalError> {
    let block = ctx
        .block_containing(pos)
        .ok_or_else(|| FatalError::new("resolve", format!("no block contains position {pos}")))?;
    for (i, inst) in ctx.func.blocks[block].insts.iter().enumerate() {
        if inst.number != NO_POS && inst.number >> 1 == pos >> 1 {
            // After the instruction the odd slot follows, before it when
            // the position belongs to an already-inserted move.
            let index = if inst.number < pos { i + 1 } else { i };
            return Ok((block, index));
        }
    }
    Ok((block, 0))
}

/// Insertion point for the moves of the edge `from -> to`. Splices a
/// move-resolver block onto critical edges.
fn block_edge_insert_point(
    ctx: &mut AllocationContext,
    from: BlockId,
    to: BlockId,
) -> Result<(BlockId, usize), FatalError> {
    if ctx.func.blocks[to].preds.len() == 1 {
        return Ok((to, 0));
    }
    if let Some(inst) = ctx.func.blocks[from].insts.last() {
        if matches!(inst.kind, InstKind::Jump { target } if target == to) {
            return Ok((from, ctx.func.blocks[from].insts.len() - 1));
        }
    }

    // Critical edge: `from` branches, `to` has other predecessors.
    let resolver = ctx.func.new_block();
    ctx.func.blocks[resolver].move_resolver = true;
    ctx.func.push_jump(resolver, to);
    ctx.func.retarget(from, to, resolver);
    for pred in &mut ctx.func.blocks[to].preds {
        if *pred == from {
            *pred = resolver;
        }
    }
    ctx.func.blocks[resolver].preds.push(from);
    ctx.stats.num_resolver_blocks += 1;
    Ok((resolver, 0))
}

// =============================================================================
// Spill-slot definitions
// =============================================================================

/// Finds split families whose value is defined exactly once and marks
/// their spill slot as definition-written. Returns where to put each
/// store.
fn mark_spill_slot_definitions(
    ctx: &mut AllocationContext,
) -> Vec<(ParentId, (BlockId, InstId, VarId))> {
    let mut stores = Vec::new();
    let parents: Vec<ParentId> = ctx.intervals.parents.ids().collect();
    for parent in parents {
        if ctx.intervals.slot_var(parent).is_none() {
            continue;
        }
        let mut def: Option<(BlockId, InstId, VarId)> = None;
        let mut defs = 0;
        for child in ctx.intervals.parents[parent].children.clone() {
            let var = ctx.intervals.arena[child].var;
            let sites = match ctx.var_operands.get(&var) {
                Some(sites) => sites,
                None => continue,
            };
            for site in sites {
                let is_def = ctx.func.blocks[site.block]
                    .insts
                    .iter()
                    .find(|i| i.id == site.inst)
                    .is_some_and(|i| i.operands[site.operand].is_def());
                if is_def {
                    defs += 1;
                    def = Some((site.block, site.inst, var));
                }
            }
        }
        if defs == 1 {
            if let Some(site) = def {
                ctx.intervals.parents[parent].spill_slot_defined = true;
                stores.push((parent, site));
            }
        }
    }
    stores
}

// =============================================================================
// Variable merging
// =============================================================================

/// Rewrites every operand to one canonical variable per location. Fixed
/// variables win their location; otherwise the lowest-numbered variable
/// does.
fn merge_by_location(ctx: &mut AllocationContext) -> Result<(), FatalError> {
    let mut canonical: FxHashMap<Location, VarId> = FxHashMap::default();
    for (id, var) in ctx.func.vars.iter() {
        if let Some(loc) = var.location {
            if var.fixed {
                canonical.insert(loc, id);
            } else {
                canonical.entry(loc).or_insert(id);
            }
        }
    }

    let func = &mut *ctx.func;
    for block in func.blocks.ids().collect::<Vec<_>>() {
        for inst in &mut func.blocks[block].insts {
            for op in &mut inst.operands {
                let loc = func.vars[op.var].location.ok_or_else(|| {
                    FatalError::new(
                        "resolve",
                        format!("{} has no location when merging", op.var),
                    )
                })?;
                op.var = *canonical.get(&loc).ok_or_else(|| {
                    FatalError::new("resolve", format!("no canonical variable for {loc}"))
                })?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Phase
// =============================================================================

impl Phase for ResolveDataFlow {
    fn name(&self) -> &'static str {
        "resolve"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let slot_stores = mark_spill_slot_definitions(ctx);

        // Split moves inside blocks, in ascending position order.
        let split_moves: Vec<(CodePos, Vec<(IntervalId, IntervalId)>)> = ctx
            .split_moves
            .iter()
            .map(|(&pos, pairs)| (pos, pairs.clone()))
            .collect();
        for (pos, pairs) in split_moves {
            let mut edge = Edge::default();
            for (from, to) in pairs {
                edge.add(ctx, MovePair { from, to })?;
            }
            if edge.is_empty() {
                continue;
            }
            let (block, index) = position_insert_point(ctx, pos)?;
            edge.resolve(ctx, block, index, pos, MoveKind::IntervalSplit);
        }

        // Block edges: wherever a live value changes location across an
        // edge, reconcile with a move on that edge.
        for order_idx in 0..ctx.block_order.len() {
            let from = ctx.block_order[order_idx];
            let mut succs: Vec<BlockId> = ctx.func.blocks[from].successors().into_iter().collect();
            succs.dedup();
            for to in succs {
                let live: Vec<u32> = ctx.func.blocks[to]
                    .live_in
                    .iter()
                    .map(|i| i as u32)
                    .collect();
                let out_pos = ctx.func.blocks[from].end_number - 2;
                let in_pos = ctx.func.blocks[to].begin_number;

                let mut edge = Edge::default();
                for idx in live {
                    let var: VarId = crate::arena::Id::new(idx);
                    let interval = ctx.intervals.of_var(var).ok_or_else(|| {
                        FatalError::new("resolve", format!("live variable {var} has no interval"))
                    })?;
                    let parent = ctx.intervals.arena[interval].parent;
                    let from_child = ctx.intervals.child_at(parent, out_pos).ok_or_else(|| {
                        FatalError::new(
                            "resolve",
                            format!("{var} live out of {from} but uncovered at {out_pos}"),
                        )
                    })?;
                    let to_child = ctx.intervals.child_at(parent, in_pos).ok_or_else(|| {
                        FatalError::new(
                            "resolve",
                            format!("{var} live into {to} but uncovered at {in_pos}"),
                        )
                    })?;
                    if from_child == to_child {
                        continue;
                    }
                    if ctx.intervals.arena[from_child]
                        .same_location(&ctx.intervals.arena[to_child])
                    {
                        continue;
                    }
                    edge.add(
                        ctx,
                        MovePair {
                            from: from_child,
                            to: to_child,
                        },
                    )?;
                }
                if edge.is_empty() {
                    continue;
                }
                let (block, index) = block_edge_insert_point(ctx, from, to)?;
                edge.resolve(ctx, block, index, NO_POS, MoveKind::DataFlowResolved);
            }
        }

        // Definition-time spill stores, after the one defining
        // instruction of each marked family.
        for (parent, (block, inst_id, var)) in slot_stores {
            let slot_var = ctx
                .intervals
                .slot_variable(parent, ctx.func, &mut ctx.next_stack_slot);
            let index = ctx.func.blocks[block]
                .insts
                .iter()
                .position(|i| i.id == inst_id)
                .ok_or_else(|| {
                    FatalError::new("resolve", format!("defining instruction {inst_id} vanished"))
                })?;
            insert_move(
                ctx,
                block,
                index + 1,
                NO_POS,
                MoveKind::SpillSlotDefinition,
                var,
                slot_var,
            );
        }

        merge_by_location(ctx)?;
        ctx.func.compute_preds();
        ctx.stats.num_spill_slots = ctx.next_stack_slot;
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for (id, block) in ctx.func.blocks.iter() {
            if block.insts.is_empty() {
                continue;
            }
            fatal_check!(
                block.terminator().is_some(),
                "resolve",
                "block {id} lost its terminator"
            );
            if block.move_resolver {
                let inner_moves = block.insts[..block.insts.len() - 1]
                    .iter()
                    .all(Inst::is_move);
                fatal_check!(
                    inner_moves,
                    "resolve",
                    "resolver block {id} holds non-move instructions"
                );
            }
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
    use crate::lir::{Function, Reg, ValueKind};
    use crate::AllocatorConfig;

    fn interval_at(
        ctx: &mut AllocationContext,
        reg: Option<Reg>,
    ) -> IntervalId {
        let var = ctx.func.new_var(ValueKind::Int);
        let id = ctx.intervals.create(var, ValueKind::Int, false);
        ctx.intervals.arena[id].prepend_range(0, 10).unwrap();
        if let Some(reg) = reg {
            ctx.intervals.arena[id].assign_register(reg).unwrap();
            ctx.func.vars[var].location = Some(Location::Reg(reg));
        }
        id
    }

    #[test]
    fn test_edge_orders_reader_before_writer() {
        let mut func = Function::new();
        let entry = func.entry;
        func.push_ret(entry, &[]);
        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);

        let a0 = interval_at(&mut ctx, Some(Reg::int(0)));
        let a1 = interval_at(&mut ctx, Some(Reg::int(1)));
        let b1 = interval_at(&mut ctx, Some(Reg::int(1)));
        let b2 = interval_at(&mut ctx, Some(Reg::int(2)));

        let mut edge = Edge::default();
        // r0 -> r1 first, then r1 -> r2: the second must run first or
        // its source is overwritten.
        edge.add(&ctx, MovePair { from: a0, to: a1 }).unwrap();
        edge.add(&ctx, MovePair { from: b1, to: b2 }).unwrap();

        assert!(edge.spilled.is_empty());
        assert_eq!(edge.pairs.len(), 2);
        assert_eq!(edge.pairs[0].from, b1);
        assert_eq!(edge.pairs[1].from, a0);
    }

    #[test]
    fn test_edge_cycle_is_spilled() {
        let mut func = Function::new();
        let entry = func.entry;
        func.push_ret(entry, &[]);
        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);

        let a0 = interval_at(&mut ctx, Some(Reg::int(0)));
        let a1 = interval_at(&mut ctx, Some(Reg::int(1)));
        let b1 = interval_at(&mut ctx, Some(Reg::int(1)));
        let b0 = interval_at(&mut ctx, Some(Reg::int(0)));

        let mut edge = Edge::default();
        edge.add(&ctx, MovePair { from: a0, to: a1 }).unwrap();
        // r1 -> r0 closes the cycle with r0 -> r1.
        edge.add(&ctx, MovePair { from: b1, to: b0 }).unwrap();

        assert_eq!(edge.pairs.len(), 1);
        assert_eq!(edge.spilled.len(), 1);

        edge.resolve(&mut ctx, entry, 0, NO_POS, MoveKind::DataFlowResolved);
        // Store to slot, direct move, reload from slot; before the ret.
        assert_eq!(ctx.func.blocks[entry].insts.len(), 4);
        assert_eq!(ctx.stats.num_moves_inserted, 3);
        assert!(ctx.next_stack_slot > 0);
    }

    #[test]
    fn test_critical_edge_gets_resolver_block() {
        let mut func = Function::new();
        let entry = func.entry;
        let side = func.new_block();
        let join = func.new_block();

        let c = func.new_var(ValueKind::Int);
        func.push_def(entry, c);
        func.push_branch(entry, c, side, join); // entry -> join is critical
        func.push_jump(side, join);
        func.push_ret(join, &[]);
        func.compute_preds();

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);

        let (block, index) = block_edge_insert_point(&mut ctx, entry, join).unwrap();
        assert_ne!(block, entry);
        assert_ne!(block, join);
        assert_eq!(index, 0);
        assert!(ctx.func.blocks[block].move_resolver);
        assert_eq!(ctx.func.blocks[block].successors().as_slice(), &[join]);
        assert!(ctx.func.blocks[entry].successors().contains(&block));
        assert_eq!(ctx.stats.num_resolver_blocks, 1);
    }

    #[test]
    fn test_uncritical_edges_insert_in_place() {
        let mut func = Function::new();
        let entry = func.entry;
        let side = func.new_block();
        let join = func.new_block();

        let c = func.new_var(ValueKind::Int);
        func.push_def(entry, c);
        func.push_branch(entry, c, side, join);
        func.push_jump(side, join);
        func.push_ret(join, &[]);
        func.compute_preds();

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);

        // side has the single successor edge: moves go before its jump.
        let (block, index) = block_edge_insert_point(&mut ctx, side, join).unwrap();
        assert_eq!(block, side);
        assert_eq!(index, 0);

        // entry -> side: side has one predecessor, moves go to its head.
        let (block, index) = block_edge_insert_point(&mut ctx, entry, side).unwrap();
        assert_eq!(block, side);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_merge_prefers_fixed_variables() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        let f = func.new_fixed_var(ValueKind::Int, Location::Reg(Reg::int(0)));
        func.vars[a].location = Some(Location::Reg(Reg::int(0)));
        func.push_def(entry, a);
        func.push_move(entry, MoveKind::FixedConstraint, a, f);
        func.push_ret(entry, &[]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        merge_by_location(&mut ctx).unwrap();

        for inst in &ctx.func.blocks[entry].insts {
            for op in &inst.operands {
                assert_eq!(op.var, f);
            }
        }
    }
}
