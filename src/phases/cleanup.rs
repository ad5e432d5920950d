//! Redundant-move removal.
//!
//! After variable merging a move whose source and destination are the
//! same variable copies a location onto itself. That covers both the
//! allocator's own moves that ended up with matching locations and user
//! moves the merge collapsed; verification treats moves as transparent,
//! so deleting either kind never changes observable value flow.

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::phase::Phase;

pub struct RemoveRedundantMoves;

impl Phase for RemoveRedundantMoves {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let mut removed = 0;
        for block in ctx.func.blocks.ids().collect::<Vec<_>>() {
            ctx.func.blocks[block].insts.retain(|inst| {
                let redundant = inst.is_move() && inst.move_src().var == inst.move_dst().var;
                if redundant {
                    removed += 1;
                }
                !redundant
            });
        }
        ctx.stats.num_moves_removed = removed;
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for (id, block) in ctx.func.blocks.iter() {
            for inst in &block.insts {
                fatal_check!(
                    !(inst.is_move() && inst.move_src().var == inst.move_dst().var),
                    "cleanup",
                    "self-move survived in block {id}"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Function, MoveKind, ValueKind};
    use crate::AllocatorConfig;

    #[test]
    fn test_self_moves_removed_others_kept() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        let b = func.new_var(ValueKind::Int);
        func.push_def(entry, a);
        func.push_move(entry, MoveKind::IntervalSplit, a, a);
        func.push_move(entry, MoveKind::User, a, b);
        func.push_move(entry, MoveKind::User, b, b);
        func.push_ret(entry, &[b]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        let mut phase = RemoveRedundantMoves;
        phase.doit(&mut ctx).unwrap();
        phase.check_postconditions(&ctx).unwrap();

        assert_eq!(ctx.stats.num_moves_removed, 2);
        assert_eq!(ctx.func.blocks[entry].insts.len(), 3);
    }
}
