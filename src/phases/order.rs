//! Linear-scan block order.
//!
//! Topological order over the forward CFG (back edges ignored): a block
//! becomes ready once all its forward predecessors are emitted, and
//! among ready blocks the deepest loop nesting is emitted first so loop
//! bodies stay contiguous in the numbering. Ties fall to the lowest
//! block id, which keeps the order deterministic.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::lir::BlockId;
use crate::phase::Phase;

pub struct ComputeBlockOrder;

impl Phase for ComputeBlockOrder {
    fn name(&self) -> &'static str {
        "block-order"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        // Reachable set.
        let mut reachable: FxHashSet<BlockId> = FxHashSet::default();
        let mut worklist = vec![ctx.func.entry];
        while let Some(block) = worklist.pop() {
            if reachable.insert(block) {
                worklist.extend(ctx.func.blocks[block].successors());
            }
        }

        // Forward predecessor counts.
        let mut pending: FxHashMap<BlockId, usize> = FxHashMap::default();
        for &block in &reachable {
            let count = ctx.func.blocks[block]
                .preds
                .iter()
                .filter(|&&p| reachable.contains(&p) && !ctx.back_edges.contains(&(p, block)))
                .count();
            pending.insert(block, count);
        }

        let mut ready: Vec<BlockId> = vec![ctx.func.entry];
        let mut order: Vec<BlockId> = Vec::with_capacity(reachable.len());

        while !ready.is_empty() {
            // Deepest loop first; lowest id on ties.
            let mut best = 0;
            for i in 1..ready.len() {
                let (a, b) = (ready[i], ready[best]);
                let (da, db) = (
                    ctx.func.blocks[a].loop_depth,
                    ctx.func.blocks[b].loop_depth,
                );
                if da > db || (da == db && a < b) {
                    best = i;
                }
            }
            let block = ready.swap_remove(best);
            order.push(block);

            for succ in ctx.func.blocks[block].successors() {
                if ctx.back_edges.contains(&(block, succ)) {
                    continue;
                }
                let count = pending.get_mut(&succ).ok_or_else(|| {
                    FatalError::new("block-order", format!("successor {succ} unreachable"))
                })?;
                *count -= 1;
                if *count == 0 {
                    ready.push(succ);
                }
            }
        }

        fatal_check!(
            order.len() == reachable.len(),
            "block-order",
            "emitted {} of {} reachable blocks; irreducible control flow",
            order.len(),
            reachable.len()
        );
        ctx.block_order = order;
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        fatal_check!(
            ctx.block_order.first() == Some(&ctx.func.entry),
            "block-order",
            "entry block is not first in the linear-scan order"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Function, ValueKind};
    use crate::phases::loops::DetectLoops;
    use crate::AllocatorConfig;

    #[test]
    fn test_loop_body_ordered_before_exit() {
        let mut func = Function::new();
        let entry = func.entry;
        let header = func.new_block();
        let body = func.new_block();
        let exit = func.new_block();

        let c = func.new_var(ValueKind::Int);
        func.push_def(entry, c);
        func.push_jump(entry, header);
        func.push_branch(header, c, exit, body);
        func.push_jump(body, header);
        func.push_ret(exit, &[]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        DetectLoops.doit(&mut ctx).unwrap();
        ComputeBlockOrder.doit(&mut ctx).unwrap();
        ComputeBlockOrder.check_postconditions(&ctx).unwrap();

        // The loop body (depth 1) beats the exit (depth 0) even though
        // the branch names the exit first.
        assert_eq!(ctx.block_order, vec![entry, header, body, exit]);
    }

    #[test]
    fn test_diamond_is_topological() {
        let mut func = Function::new();
        let entry = func.entry;
        let left = func.new_block();
        let right = func.new_block();
        let join = func.new_block();

        let c = func.new_var(ValueKind::Int);
        func.push_def(entry, c);
        func.push_branch(entry, c, left, right);
        func.push_jump(left, join);
        func.push_jump(right, join);
        func.push_ret(join, &[]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        DetectLoops.doit(&mut ctx).unwrap();
        ComputeBlockOrder.doit(&mut ctx).unwrap();

        assert_eq!(ctx.block_order.len(), 4);
        assert_eq!(ctx.block_order[0], entry);
        assert_eq!(ctx.block_order[3], join);
    }
}
