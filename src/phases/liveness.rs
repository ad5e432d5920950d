//! Live-set computation.
//!
//! Backward bit-set data flow: per block, `gen` holds variables read
//! before any write in the block and `kill` holds variables written.
//! The fixed point gives `live_in`/`live_out` per block. The phase runs
//! twice per allocation: once to drive interval construction, and once
//! after allocation in validate mode, where a variable live into the
//! entry block means the allocator broke a value's def-use chain.

use crate::arena::{BitSet, SecondaryMap};
use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::lir::{Block, BlockId};
use crate::phase::Phase;

pub struct ComputeLiveSets {
    validate: bool,
}

impl ComputeLiveSets {
    /// Initial computation over the linear-scan order.
    pub fn compute() -> Self {
        ComputeLiveSets { validate: false }
    }

    /// Post-allocation recomputation over the final CFG, move-resolver
    /// blocks included, with the entry-liveness check.
    pub fn validate() -> Self {
        ComputeLiveSets { validate: true }
    }

    /// Reverse postorder over the final CFG, covering blocks the
    /// resolver added after the linear-scan order was fixed.
    fn final_order(ctx: &AllocationContext) -> Vec<BlockId> {
        let mut postorder = Vec::new();
        let mut visited: SecondaryMap<Block, bool> =
            SecondaryMap::with_capacity(ctx.func.blocks.len());
        let mut stack = vec![(ctx.func.entry, false)];
        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                postorder.push(block);
                continue;
            }
            if visited[block] {
                continue;
            }
            visited.set(block, true);
            stack.push((block, true));
            for succ in ctx.func.blocks[block].successors() {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }
}

impl Phase for ComputeLiveSets {
    fn name(&self) -> &'static str {
        if self.validate {
            "liveness-validate"
        } else {
            "liveness"
        }
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let order = if self.validate {
            Self::final_order(ctx)
        } else {
            ctx.block_order.clone()
        };

        // Local gen/kill sets.
        let mut gens: Vec<BitSet> = Vec::with_capacity(order.len());
        let mut kills: Vec<BitSet> = Vec::with_capacity(order.len());
        for &block_id in &order {
            let mut gen = BitSet::with_capacity(ctx.func.vars.len());
            let mut kill = BitSet::with_capacity(ctx.func.vars.len());
            for inst in &ctx.func.blocks[block_id].insts {
                for op in &inst.operands {
                    let idx = op.var.as_usize();
                    if op.is_use() && !kill.contains(idx) {
                        gen.insert(idx);
                    }
                }
                for op in &inst.operands {
                    if op.is_def() {
                        kill.insert(op.var.as_usize());
                    }
                }
            }
            gens.push(gen);
            kills.push(kill);
        }

        for &block_id in &order {
            let block = &mut ctx.func.blocks[block_id];
            block.live_in.clear();
            block.live_out.clear();
        }

        // Backward fixed point.
        let mut changed = true;
        while changed {
            changed = false;
            for (i, &block_id) in order.iter().enumerate().rev() {
                let mut live_out = BitSet::with_capacity(ctx.func.vars.len());
                for succ in ctx.func.blocks[block_id].successors() {
                    live_out.union_with(&ctx.func.blocks[succ].live_in);
                }

                let mut live_in = live_out.clone();
                live_in.difference_with(&kills[i]);
                live_in.union_with(&gens[i]);

                let block = &mut ctx.func.blocks[block_id];
                if live_in != block.live_in {
                    block.live_in = live_in;
                    changed = true;
                }
                block.live_out = live_out;
            }
        }
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        let entry_live = &ctx.func.blocks[ctx.func.entry].live_in;
        fatal_check!(
            entry_live.is_empty(),
            self.name(),
            "variables live into the entry block: {:?}",
            entry_live.iter().collect::<Vec<_>>()
        );

        if !self.validate {
            // Fixed-register variables are materialized next to their
            // single use and must stay block-local.
            for &block_id in &ctx.block_order {
                for idx in ctx.func.blocks[block_id].live_in.iter() {
                    let var = crate::arena::Id::new(idx as u32);
                    fatal_check!(
                        !ctx.func.vars[var].fixed,
                        "liveness",
                        "fixed variable {var} is live across a block boundary"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Function, ValueKind};
    use crate::AllocatorConfig;

    #[test]
    fn test_liveness_across_blocks() {
        let mut func = Function::new();
        let entry = func.entry;
        let next = func.new_block();
        let a = func.new_var(ValueKind::Int);
        let b = func.new_var(ValueKind::Int);
        func.push_def(entry, a);
        func.push_jump(entry, next);
        func.push_op(next, &[a], &[b]);
        func.push_ret(next, &[b]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.block_order = vec![entry, next];
        let mut phase = ComputeLiveSets::compute();
        phase.doit(&mut ctx).unwrap();
        phase.check_postconditions(&ctx).unwrap();

        assert!(ctx.func.blocks[entry].live_out.contains(a.as_usize()));
        assert!(ctx.func.blocks[next].live_in.contains(a.as_usize()));
        assert!(!ctx.func.blocks[next].live_in.contains(b.as_usize()));
        assert!(ctx.func.blocks[entry].live_in.is_empty());
    }

    #[test]
    fn test_loop_carried_liveness() {
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
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.block_order = vec![entry, header, body, exit];
        ComputeLiveSets::compute().doit(&mut ctx).unwrap();

        // The loop-carried counter is live around the whole loop.
        assert!(ctx.func.blocks[header].live_in.contains(i.as_usize()));
        assert!(ctx.func.blocks[body].live_out.contains(i.as_usize()));
        assert!(!ctx.func.blocks[exit].live_in.contains(i.as_usize()));
    }

    #[test]
    fn test_use_before_def_in_same_block_is_live_in() {
        let mut func = Function::new();
        let entry = func.entry;
        let loop_b = func.new_block();
        let v = func.new_var(ValueKind::Int);
        func.push_def(entry, v);
        func.push_jump(entry, loop_b);
        func.push_op(loop_b, &[v], &[v]);
        func.push_jump(loop_b, loop_b);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.block_order = vec![entry, loop_b];
        ComputeLiveSets::compute().doit(&mut ctx).unwrap();

        assert!(ctx.func.blocks[loop_b].live_in.contains(v.as_usize()));
    }
}
