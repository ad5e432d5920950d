//! The allocation walk.
//!
//! Intervals are visited in order of ascending start position, one walk
//! per register class. At each start position the active and inactive
//! lists are brought up to date, then the starting interval gets a
//! register: a free one when some register is unclaimed long enough,
//! otherwise the register whose competing intervals can be split and
//! spilled most cheaply. Splitting produces child intervals that carry
//! fresh variables; the tail of the split lifetime is renamed to the
//! child's variable and the child is queued back into the walk. Split
//! positions are odd, between two instructions, with one exception: a
//! split landing on a block's begin slot stays there, and the connecting
//! move is carried by block-edge resolution instead of a queued move.
//! Odd-position moves are queued here but materialized later by
//! data-flow resolution.

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::interval::{IntervalId, State, UseKind};
use crate::lir::{CodePos, Location, Reg, RegClass, NO_POS};
use crate::phase::Phase;

pub struct WalkIntervals;

impl WalkIntervals {
    pub fn new() -> Self {
        WalkIntervals
    }
}

impl Default for WalkIntervals {
    fn default() -> Self {
        WalkIntervals::new()
    }
}

// =============================================================================
// Per-class walk state
// =============================================================================

struct ClassWalk {
    registers: Vec<Reg>,
    /// Ascending by start position.
    unhandled: Vec<IntervalId>,
    active: Vec<IntervalId>,
    inactive: Vec<IntervalId>,
}

impl ClassWalk {
    /// Index of `reg` in this walk's pool, if it belongs to it.
    fn pool_index(&self, reg: Reg) -> Option<usize> {
        let idx = reg.ordinal as usize;
        (idx < self.registers.len() && self.registers[idx] == reg).then_some(idx)
    }

    /// Sorted insert, after existing intervals with the same start so
    /// earlier splits keep priority.
    fn add_to_unhandled(&mut self, ctx: &AllocationContext, id: IntervalId) {
        let start = ctx.intervals.arena[id].first_range_start();
        let idx = self
            .unhandled
            .partition_point(|&x| ctx.intervals.arena[x].first_range_start() <= start);
        self.unhandled.insert(idx, id);
    }

    fn remove_from_lists(&mut self, id: IntervalId) {
        self.active.retain(|&x| x != id);
        self.inactive.retain(|&x| x != id);
    }
}

// =============================================================================
// Phase
// =============================================================================

impl Phase for WalkIntervals {
    fn name(&self) -> &'static str {
        "walk-intervals"
    }

    fn check_preconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        fatal_check!(
            ctx.sorted.len() == ctx.intervals.arena.len(),
            "walk-intervals",
            "intervals not sorted"
        );
        Ok(())
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        walk_class(ctx, RegClass::Int)?;
        walk_class(ctx, RegClass::Float)?;
        ctx.stats.num_spill_slots = ctx.next_stack_slot;
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for (id, interval) in ctx.intervals.arena.iter() {
            fatal_check!(
                interval.location().is_some(),
                "walk-intervals",
                "interval {id} for {} left without a location",
                interval.var
            );
            fatal_check!(
                ctx.func.vars[interval.var].location == interval.location(),
                "walk-intervals",
                "variable {} disagrees with its interval's location",
                interval.var
            );
        }
        Ok(())
    }
}

fn walk_class(ctx: &mut AllocationContext, class: RegClass) -> Result<(), FatalError> {
    let mut walk = ClassWalk {
        registers: ctx.registers.pool(class).to_vec(),
        unhandled: Vec::new(),
        active: Vec::new(),
        inactive: Vec::new(),
    };

    for i in 0..ctx.sorted.len() {
        let id = ctx.sorted[i];
        let interval = &ctx.intervals.arena[id];
        if interval.reg_class() != class {
            continue;
        }
        if interval.fixed {
            // Preassigned pool registers participate as blockers; other
            // pinned locations are outside this walk's concern.
            let in_pool = interval
                .register()
                .and_then(|r| walk.pool_index(r))
                .is_some();
            if in_pool {
                ctx.intervals.arena[id].state = State::Active;
                walk.active.push(id);
            } else {
                ctx.intervals.arena[id].state = State::Handled;
            }
        } else {
            ctx.intervals.arena[id].state = State::Unhandled;
            walk.unhandled.push(id);
        }
    }

    while !walk.unhandled.is_empty() {
        let current = walk.unhandled.remove(0);
        let position = ctx.intervals.arena[current].first_range_start();

        // Retire and demote what the walk has passed.
        let mut i = 0;
        while i < walk.active.len() {
            let id = walk.active[i];
            let interval = &mut ctx.intervals.arena[id];
            if interval.last_range_end() <= position {
                interval.state = State::Handled;
                walk.active.swap_remove(i);
            } else if !interval.covers_incremental(position) {
                interval.state = State::Inactive;
                walk.active.swap_remove(i);
                walk.inactive.push(id);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < walk.inactive.len() {
            let id = walk.inactive[i];
            let interval = &mut ctx.intervals.arena[id];
            if interval.last_range_end() <= position {
                interval.state = State::Handled;
                walk.inactive.swap_remove(i);
            } else if interval.covers_incremental(position) {
                interval.state = State::Active;
                walk.inactive.swap_remove(i);
                walk.active.push(id);
            } else {
                i += 1;
            }
        }

        // A split child starting mid-lifetime needs a move from its
        // previous sibling. Children split at a block begin never carry
        // the flag; edge resolution moves their value.
        if ctx.intervals.arena[current].insert_move_when_activated {
            let parent = ctx.intervals.arena[current].parent;
            if let Some(prev) = ctx.intervals.previous_child(parent, current) {
                ctx.queue_split_move(position, prev, current);
            }
        }

        // Variables barred from registers go straight to the stack.
        let var = ctx.intervals.arena[current].var;
        if ctx.func.vars[var].needs_stack_slot() {
            assign_slot(ctx, current)?;
            ctx.intervals.arena[current].state = State::Handled;
            continue;
        }

        if !allocate_free_register(ctx, &mut walk, current, position)? {
            allocate_blocked_register(ctx, &mut walk, current, position)?;
        }

        if ctx.intervals.arena[current].register().is_some() {
            ctx.intervals.arena[current].state = State::Active;
            walk.active.push(current);
        } else {
            // Spilled in place by the blocked-register path.
            ctx.intervals.arena[current].state = State::Handled;
        }
    }

    Ok(())
}

// =============================================================================
// Register selection
// =============================================================================

/// Tries to place `current` in a register no other interval claims for
/// long enough. Returns false when every register is taken at or right
/// after `position`, leaving the blocked-register path to decide.
fn allocate_free_register(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    current: IntervalId,
    position: CodePos,
) -> Result<bool, FatalError> {
    let n = walk.registers.len();
    if n == 0 {
        return Ok(false);
    }

    // Per register, the position it stays free until.
    let mut free_pos = vec![NO_POS; n];
    for &id in &walk.active {
        if let Some(idx) = ctx.intervals.arena[id].register().and_then(|r| walk.pool_index(r)) {
            free_pos[idx] = 0;
        }
    }
    for &id in &walk.inactive {
        let idx = match ctx.intervals.arena[id].register().and_then(|r| walk.pool_index(r)) {
            Some(idx) => idx,
            None => continue,
        };
        let (interval, cur) = ctx.intervals.arena.pair_mut(id, current);
        let isect = interval.first_intersection_incremental(position, cur);
        if isect != NO_POS {
            free_pos[idx] = free_pos[idx].min(isect);
        }
    }

    let mut best = 0;
    for idx in 1..n {
        if free_pos[idx] > free_pos[best] {
            best = idx;
        }
    }
    // A register already holding a sibling (or the partner of a move)
    // wins when it is free long enough to save the connecting move.
    if let Some(preferred) = find_preferred_register(ctx, walk, current) {
        if free_pos[preferred] > position + 1 {
            best = preferred;
        }
    }

    let highest = free_pos[best];
    if highest == 0 || highest == position || highest == position + 1 {
        return Ok(false);
    }

    if highest < ctx.intervals.arena[current].last_range_end() {
        // Free only for a prefix: take it and requeue the rest.
        split_before(ctx, walk, current, position + 1, highest)?;
    }
    assign_register(ctx, current, walk.registers[best])?;
    Ok(true)
}

/// Every register is taken. Picks the one whose holders can wait longest
/// for their next use; either `current` itself spills (when even the
/// best register is needed before `current`'s first use) or the holders
/// are split and spilled around `current`.
fn allocate_blocked_register(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    current: IntervalId,
    position: CodePos,
) -> Result<(), FatalError> {
    let n = walk.registers.len();
    if n == 0 {
        return split_and_spill(ctx, walk, position, current);
    }

    // Per register: the next position a holder really needs it, and the
    // position a fixed interval makes it unusable.
    let mut use_pos = vec![NO_POS; n];
    let mut block_pos = vec![NO_POS; n];

    for &id in &walk.active {
        let idx = match ctx.intervals.arena[id].register().and_then(|r| walk.pool_index(r)) {
            Some(idx) => idx,
            None => continue,
        };
        if ctx.intervals.arena[id].fixed {
            block_pos[idx] = 0;
        } else {
            let interval = &ctx.intervals.arena[id];
            let usage = interval
                .next_usage(UseKind::LoopEndMarker, position)
                .min(interval.last_range_end());
            use_pos[idx] = use_pos[idx].min(usage);
        }
    }
    for &id in &walk.inactive {
        let idx = match ctx.intervals.arena[id].register().and_then(|r| walk.pool_index(r)) {
            Some(idx) => idx,
            None => continue,
        };
        let (interval, cur) = ctx.intervals.arena.pair_mut(id, current);
        let isect = interval.first_intersection_incremental(position, cur);
        if isect == NO_POS {
            continue;
        }
        if ctx.intervals.arena[id].fixed {
            block_pos[idx] = block_pos[idx].min(isect);
        } else {
            let interval = &ctx.intervals.arena[id];
            let usage = interval
                .next_usage(UseKind::LoopEndMarker, position)
                .min(interval.last_range_end());
            use_pos[idx] = use_pos[idx].min(usage);
        }
    }
    for idx in 0..n {
        use_pos[idx] = use_pos[idx].min(block_pos[idx]);
    }

    let mut best = 0;
    for idx in 1..n {
        if use_pos[idx] > use_pos[best] {
            best = idx;
        }
    }

    let first_must = ctx.intervals.arena[current].first_usage(UseKind::MustHaveRegister);
    if use_pos[best] <= first_must {
        // Every register is wanted again before current's first hard
        // demand; current itself is the cheapest to keep on the stack.
        let start = ctx.intervals.arena[current].first_range_start();
        fatal_check!(
            first_must > start + 1,
            "walk-intervals",
            "{} needs a register at {first_must} but none can be freed",
            ctx.intervals.arena[current].var
        );
        return split_and_spill(ctx, walk, position, current);
    }

    if block_pos[best] <= ctx.intervals.arena[current].last_range_end() {
        // A fixed interval reclaims the register mid-lifetime; the part
        // behind it is requeued.
        split_before(ctx, walk, current, position + 1, block_pos[best])?;
    }

    let reg = walk.registers[best];
    for id in walk.active.clone() {
        let interval = &ctx.intervals.arena[id];
        if !interval.fixed && interval.register() == Some(reg) {
            split_and_spill(ctx, walk, position, id)?;
        }
    }
    for id in walk.inactive.clone() {
        let interval = &ctx.intervals.arena[id];
        if !interval.fixed && interval.register() == Some(reg) {
            let isect = interval.first_intersection(position, &ctx.intervals.arena[current]);
            if isect != NO_POS {
                split_and_spill(ctx, walk, position, id)?;
            }
        }
    }

    assign_register(ctx, current, reg)
}

/// The register of a sibling interval or of the other side of a move
/// involving `current`'s variable, when one exists in this pool.
fn find_preferred_register(
    ctx: &AllocationContext,
    walk: &ClassWalk,
    current: IntervalId,
) -> Option<usize> {
    let var = ctx.intervals.arena[current].var;
    if let Some(sites) = ctx.var_operands.get(&var) {
        for site in sites {
            let inst = ctx.func.blocks[site.block]
                .insts
                .iter()
                .find(|i| i.id == site.inst);
            let inst = match inst {
                Some(inst) if inst.is_move() => inst,
                _ => continue,
            };
            let partner = if inst.move_src().var == var {
                inst.move_dst().var
            } else {
                inst.move_src().var
            };
            if let Some(Location::Reg(r)) = ctx.func.vars[partner].location {
                if let Some(idx) = walk.pool_index(r) {
                    return Some(idx);
                }
            }
        }
    }

    let parent = ctx.intervals.arena[current].parent;
    for &child in &ctx.intervals.parents[parent].children {
        if child == current {
            continue;
        }
        if let Some(idx) = ctx.intervals.arena[child]
            .register()
            .and_then(|r| walk.pool_index(r))
        {
            return Some(idx);
        }
    }
    None
}

// =============================================================================
// Splitting
// =============================================================================

/// Splits `interval` somewhere in `[current_position, boundary]` so its
/// head can keep (or take) a register up to `boundary`. The tail is
/// requeued as unhandled.
fn split_before(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    interval: IntervalId,
    current_position: CodePos,
    boundary: CodePos,
) -> Result<(), FatalError> {
    let prev = ctx.intervals.arena[interval].previous_usage(UseKind::ShouldHaveRegister, boundary);
    let min_split = if prev == NO_POS {
        current_position
    } else {
        prev.max(current_position)
    };
    split_and_schedule(ctx, walk, interval, min_split, boundary)
}

/// Splits `interval` at the best position in `[min_split, max_split]`
/// and queues the tail. Does nothing when the best position is the
/// interval's end and no later use demands a register: the tail a split
/// would carve off is empty.
fn split_and_schedule(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    interval: IntervalId,
    min_split: CodePos,
    max_split: CodePos,
) -> Result<(), FatalError> {
    let optimal = find_optimal_split_pos(ctx, min_split, max_split);

    {
        let iv = &ctx.intervals.arena[interval];
        if optimal >= iv.last_range_end()
            && iv.next_must_have_register(min_split) == NO_POS
        {
            return Ok(());
        }
    }

    // A split on a block's begin slot needs no move of its own, the
    // edge carries the value. Anywhere else the split takes the odd
    // slot before the chosen instruction, clamped back into the window.
    let (pos, needs_move) = if ctx.is_block_begin(optimal) {
        (optimal, false)
    } else {
        let pos = ((optimal - 1) | 1).max(min_split | 1);
        (pos, ctx.intervals.arena[interval].covers(pos))
    };

    let old_var = ctx.intervals.arena[interval].var;
    let new_var = ctx.split_variable(old_var);
    let child = ctx.intervals.arena[interval].split(pos, new_var)?;
    ctx.rename_operands(old_var, new_var, pos);

    let child_id = ctx.intervals.adopt(child);
    ctx.intervals.arena[child_id].insert_move_when_activated = needs_move;
    ctx.intervals.arena[child_id].state = State::Unhandled;
    walk.add_to_unhandled(ctx, child_id);
    ctx.stats.num_splits += 1;
    Ok(())
}

/// Evicts `interval` from its register at `position`: the part from the
/// next must-have-register use (or the best block begin before it) is
/// requeued, and the part in between goes to the parent's spill slot.
fn split_and_spill(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    position: CodePos,
    interval: IntervalId,
) -> Result<(), FatalError> {
    if ctx.intervals.arena[interval].covers(position) {
        let boundary = {
            let iv = &ctx.intervals.arena[interval];
            iv.next_must_have_register(position + 1).min(iv.last_range_end())
        };
        split_before(ctx, walk, interval, position + 1, boundary)?;
        split_for_spilling(ctx, walk, interval, position)
    } else {
        // Position is in a lifetime hole: no value to spill, the part
        // after the hole simply competes again.
        split_before(ctx, walk, interval, position + 1, position + 1)
    }
}

fn split_for_spilling(
    ctx: &mut AllocationContext,
    walk: &mut ClassWalk,
    interval: IntervalId,
    position: CodePos,
) -> Result<(), FatalError> {
    let start = ctx.intervals.arena[interval].first_range_start();

    if position == start || (position % 2 == 0 && position == start + 1) {
        // Nothing lived in the register yet; the whole remaining
        // interval goes to the stack.
        assign_slot(ctx, interval)?;
        walk.remove_from_lists(interval);
        ctx.intervals.arena[interval].state = State::Handled;
        return Ok(());
    }

    let prev = ctx.intervals.arena[interval].previous_usage(UseKind::ShouldHaveRegister, position);
    let min_split = if prev == NO_POS {
        start + 1
    } else {
        (prev + 1).max(start + 1)
    };
    let optimal = find_optimal_split_pos(ctx, min_split, position);
    let pos = if ctx.is_block_begin(optimal) {
        optimal
    } else {
        ((optimal - 1) | 1).max(min_split | 1)
    };

    let old_var = ctx.intervals.arena[interval].var;
    let new_var = ctx.split_variable(old_var);
    let spilled = ctx.intervals.arena[interval].split(pos, new_var)?;
    ctx.rename_operands(old_var, new_var, pos);

    let spilled_id = ctx.intervals.adopt(spilled);
    assign_slot(ctx, spilled_id)?;
    ctx.intervals.arena[spilled_id].state = State::Handled;
    if !ctx.is_block_begin(pos) {
        ctx.queue_split_move(pos, interval, spilled_id);
    }
    ctx.stats.num_splits += 1;
    Ok(())
}

/// The cheapest split position in `[min_pos, max_pos]`: the start of the
/// latest block boundary in the window with minimal loop depth, or
/// `max_pos` when the window stays inside one block.
fn find_optimal_split_pos(ctx: &AllocationContext, min_pos: CodePos, max_pos: CodePos) -> CodePos {
    if min_pos >= max_pos {
        return max_pos;
    }
    let mut optimal = max_pos;
    let mut min_depth = u32::MAX;
    for (i, &block_id) in ctx.block_order.iter().enumerate() {
        let begin = ctx.func.blocks[block_id].begin_number;
        if begin < min_pos || begin > max_pos {
            continue;
        }
        // Depth of the edge is the shallower of the two sides.
        let mut depth = ctx.func.blocks[block_id].loop_depth;
        if i > 0 {
            depth = depth.min(ctx.func.blocks[ctx.block_order[i - 1]].loop_depth);
        }
        if depth <= min_depth {
            min_depth = depth;
            optimal = begin;
        }
    }
    optimal
}

// =============================================================================
// Assignment
// =============================================================================

fn assign_register(
    ctx: &mut AllocationContext,
    interval: IntervalId,
    reg: Reg,
) -> Result<(), FatalError> {
    ctx.intervals.arena[interval].assign_register(reg)?;
    let var = ctx.intervals.arena[interval].var;
    ctx.func.vars[var].location = Some(Location::Reg(reg));
    Ok(())
}

/// Puts `interval` into its parent's shared spill slot, creating the
/// slot (and its carrier variable) on first spill of the family.
fn assign_slot(ctx: &mut AllocationContext, interval: IntervalId) -> Result<(), FatalError> {
    let parent = ctx.intervals.arena[interval].parent;
    let slot_var = ctx
        .intervals
        .slot_variable(parent, ctx.func, &mut ctx.next_stack_slot);
    let slot = match ctx.func.vars[slot_var].location {
        Some(Location::Stack(slot)) => slot,
        _ => {
            return Err(FatalError::new(
                "walk-intervals",
                format!("slot variable {slot_var} has no stack location"),
            ))
        }
    };
    ctx.intervals.arena[interval].assign_stack_slot(slot)?;
    let var = ctx.intervals.arena[interval].var;
    ctx.func.vars[var].location = Some(Location::Stack(slot));
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
