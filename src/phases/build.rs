//! Interval construction.
//!
//! One backward pass over the blocks in reverse linear-scan order.
//! Variables live out of a block are assumed live through all of it;
//! a definition then truncates that assumption to start at the defining
//! instruction, and a use extends liveness from the block start to the
//! using instruction. Loop-end blocks add a pseudo-use for everything
//! live across the back edge, so the spill heuristics treat the loop as
//! one region. The pass also builds the variable-to-operand table that
//! split renaming and preferred-location search rely on.

use crate::arena::Id;
use crate::context::{AllocationContext, OperandSite};
use crate::error::{fatal_check, FatalError};
use crate::interval::{IntervalId, UseKind};
use crate::lir::{Constraint, Location, VarId};
use crate::phase::Phase;

pub struct BuildIntervals;

fn use_kind(constraint: Constraint) -> UseKind {
    match constraint {
        Constraint::Register | Constraint::Fixed(_) => UseKind::MustHaveRegister,
        Constraint::Any => UseKind::ShouldHaveRegister,
    }
}

/// Interval for `var`, created on first sight. Fixed variables come in
/// with a preassigned register that the interval inherits.
fn ensure(ctx: &mut AllocationContext, var: VarId) -> Result<IntervalId, FatalError> {
    if let Some(id) = ctx.intervals.of_var(var) {
        return Ok(id);
    }
    let (kind, fixed, location) = {
        let v = &ctx.func.vars[var];
        (v.kind, v.fixed, v.location)
    };
    let id = ctx.intervals.create(var, kind, fixed);
    if let Some(Location::Reg(reg)) = location {
        ctx.intervals.arena[id].assign_register(reg)?;
    }
    Ok(id)
}

impl Phase for BuildIntervals {
    fn name(&self) -> &'static str {
        "build-intervals"
    }

    fn check_preconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        fatal_check!(
            !ctx.block_starts.is_empty(),
            "build-intervals",
            "instructions not numbered"
        );
        Ok(())
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        ctx.var_operands.clear();

        for order_idx in (0..ctx.block_order.len()).rev() {
            let block_id = ctx.block_order[order_idx];
            let (block_from, block_to, loop_end) = {
                let block = &ctx.func.blocks[block_id];
                (block.begin_number, block.end_number, block.loop_end)
            };

            // Everything live out survives the whole block until a
            // definition below proves otherwise.
            let live_out: Vec<VarId> = ctx.func.blocks[block_id]
                .live_out
                .iter()
                .map(|i| Id::new(i as u32))
                .collect();
            for var in live_out {
                let id = ensure(ctx, var)?;
                let interval = &mut ctx.intervals.arena[id];
                interval.prepend_range(block_from, block_to)?;
                if loop_end {
                    interval.add_use(block_to - 1, UseKind::LoopEndMarker);
                }
            }

            for inst_idx in (0..ctx.func.blocks[block_id].insts.len()).rev() {
                let (inst_id, number, operands) = {
                    let inst = &ctx.func.blocks[block_id].insts[inst_idx];
                    (inst.id, inst.number, inst.operands.clone())
                };

                for (op_idx, op) in operands.iter().enumerate() {
                    ctx.record_operand(
                        op.var,
                        OperandSite {
                            block: block_id,
                            inst: inst_id,
                            operand: op_idx,
                        },
                    );
                }

                // Definitions before uses: an update reads the old value
                // at the same position its write takes effect.
                for op in operands.iter().filter(|op| op.is_def()) {
                    let id = ensure(ctx, op.var)?;
                    let interval = &mut ctx.intervals.arena[id];
                    if interval.is_empty() || interval.first_range_start() > number {
                        // Dead definition: the value is never read.
                        interval.prepend_range(number, number + 1)?;
                    } else {
                        interval.set_first_range_from(number)?;
                    }
                    interval.add_use(number, use_kind(op.constraint));
                }

                for op in operands.iter().filter(|op| op.is_use()) {
                    let id = ensure(ctx, op.var)?;
                    let interval = &mut ctx.intervals.arena[id];
                    if number > block_from {
                        interval.prepend_range(block_from, number)?;
                    }
                    interval.add_use(number, use_kind(op.constraint));
                }
            }
        }

        ctx.stats.num_intervals = ctx.intervals.arena.len();
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for (id, interval) in ctx.intervals.arena.iter() {
            fatal_check!(
                !interval.is_empty(),
                "build-intervals",
                "interval {id} for {} has no ranges",
                interval.var
            );
            for pair in interval.ranges().windows(2) {
                fatal_check!(
                    pair[0].to < pair[1].from,
                    "build-intervals",
                    "ranges {} and {} of {} touch or overlap",
                    pair[0],
                    pair[1],
                    interval.var
                );
            }
            for pair in interval.uses().windows(2) {
                fatal_check!(
                    pair[0].pos < pair[1].pos,
                    "build-intervals",
                    "use positions of {} out of order",
                    interval.var
                );
            }
        }
        Ok(())
    }
}

// =============================================================================
// Sorting
// =============================================================================

/// Orders the built intervals ascending by start position for the walk.
pub struct SortIntervals;

impl Phase for SortIntervals {
    fn name(&self) -> &'static str {
        "sort-intervals"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let mut sorted: Vec<IntervalId> = ctx.intervals.arena.ids().collect();
        sorted.sort_by_key(|&id| (ctx.intervals.arena[id].first_range_start(), id.index()));
        ctx.sorted = sorted;
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for pair in ctx.sorted.windows(2) {
            fatal_check!(
                ctx.intervals.arena[pair[0]].first_range_start()
                    <= ctx.intervals.arena[pair[1]].first_range_start(),
                "sort-intervals",
                "interval order is not ascending"
            );
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
    use crate::interval::Range;
    use crate::lir::{Function, ValueKind};
    use crate::phase::Phase;
    use crate::phases::liveness::ComputeLiveSets;
    use crate::phases::loops::DetectLoops;
    use crate::phases::number::NumberInstructions;
    use crate::phases::order::ComputeBlockOrder;
    use crate::AllocatorConfig;

    fn prepare<'a>(func: &'a mut Function, config: &'a AllocatorConfig) -> AllocationContext<'a> {
        let mut ctx = AllocationContext::new(func, config);
        DetectLoops.run(&mut ctx).unwrap();
        ComputeBlockOrder.run(&mut ctx).unwrap();
        NumberInstructions.run(&mut ctx).unwrap();
        ComputeLiveSets::compute().run(&mut ctx).unwrap();
        BuildIntervals.run(&mut ctx).unwrap();
        SortIntervals.run(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_straight_line_intervals() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        let b = func.new_var(ValueKind::Int);
        func.push_def(entry, a); // 2
        func.push_op(entry, &[a], &[b]); // 4
        func.push_ret(entry, &[b]); // 6

        let config = AllocatorConfig::default();
        let ctx = prepare(&mut func, &config);

        let ia = ctx.interval_of(a).unwrap();
        let ib = ctx.interval_of(b).unwrap();
        assert_eq!(ctx.intervals.arena[ia].ranges(), &[Range::new(2, 4)]);
        assert_eq!(ctx.intervals.arena[ib].ranges(), &[Range::new(4, 6)]);
        // The def tolerates any location, the operation read does not.
        assert_eq!(
            ctx.intervals.arena[ia].first_usage(UseKind::ShouldHaveRegister),
            2
        );
        assert_eq!(
            ctx.intervals.arena[ia].first_usage(UseKind::MustHaveRegister),
            4
        );
        assert_eq!(ctx.sorted.len(), 2);
        assert_eq!(ctx.sorted[0], ia);
    }

    #[test]
    fn test_live_across_block_boundary() {
        let mut func = Function::new();
        let entry = func.entry;
        let next = func.new_block();
        let a = func.new_var(ValueKind::Int);
        func.push_def(entry, a); // 2
        func.push_jump(entry, next); // 4, entry spans [0, 6)
        func.push_op(next, &[a], &[a]); // 8
        func.push_ret(next, &[a]); // 10

        let config = AllocatorConfig::default();
        let ctx = prepare(&mut func, &config);

        let ia = ctx.interval_of(a).unwrap();
        // Live out of entry from its def, updated at 8 and read at 10:
        // one merged range from the def to the final use.
        assert_eq!(ctx.intervals.arena[ia].ranges(), &[Range::new(2, 10)]);
    }

    #[test]
    fn test_loop_end_marker_added() {
        let mut func = Function::new();
        let entry = func.entry;
        let header = func.new_block();
        let body = func.new_block();
        let exit = func.new_block();

        let i = func.new_var(ValueKind::Int);
        let c = func.new_var(ValueKind::Int);
        func.push_def(entry, i);
        func.push_jump(entry, header);
        func.push_op(header, &[i], &[c]);
        func.push_branch(header, c, body, exit);
        func.push_op(body, &[i], &[i]);
        func.push_jump(body, header);
        func.push_ret(exit, &[]);

        let config = AllocatorConfig::default();
        let ctx = prepare(&mut func, &config);

        let ii = ctx.interval_of(i).unwrap();
        let marker = ctx.intervals.arena[ii]
            .uses()
            .iter()
            .any(|u| u.kind == UseKind::LoopEndMarker);
        assert!(marker, "loop-carried interval should carry an end marker");
    }

    #[test]
    fn test_dead_def_gets_single_position_range() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        let b = func.new_var(ValueKind::Int);
        func.push_def(entry, a); // 2, never read
        func.push_def(entry, b); // 4
        func.push_ret(entry, &[b]); // 6

        let config = AllocatorConfig::default();
        let ctx = prepare(&mut func, &config);

        let ia = ctx.interval_of(a).unwrap();
        assert_eq!(ctx.intervals.arena[ia].ranges(), &[Range::new(2, 3)]);
    }

    #[test]
    fn test_operand_sites_recorded() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        func.push_def(entry, a);
        func.push_op(entry, &[a], &[a]);
        func.push_ret(entry, &[a]);

        let config = AllocatorConfig::default();
        let ctx = prepare(&mut func, &config);

        // def, op use, op def, ret use.
        assert_eq!(ctx.var_operands[&a].len(), 4);
    }
}
