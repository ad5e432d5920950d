//! Instruction numbering.
//!
//! Instructions get strictly increasing even numbers in linear-scan
//! block order; the odd slot between two instructions is reserved for
//! split moves. Every block additionally owns an even begin slot that
//! carries no instruction: intervals of values live across the block
//! entry extend back to that slot, so split children placed at a block
//! begin interfere with everything live in. Blocks are contiguous: a
//! block's end number equals the next block's begin number.

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::phase::Phase;

pub struct NumberInstructions;

impl Phase for NumberInstructions {
    fn name(&self) -> &'static str {
        "numbering"
    }

    fn check_preconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        fatal_check!(
            !ctx.block_order.is_empty(),
            "numbering",
            "block order not computed"
        );
        for &block in &ctx.block_order {
            fatal_check!(
                !ctx.func.blocks[block].insts.is_empty(),
                "numbering",
                "block {block} has no instructions"
            );
        }
        Ok(())
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let mut pos = 0;
        ctx.block_starts.clear();
        for &block_id in &ctx.block_order {
            let block = &mut ctx.func.blocks[block_id];
            block.begin_number = pos;
            ctx.block_starts.push((pos, block_id));
            pos += 2;
            for inst in &mut block.insts {
                inst.number = pos;
                pos += 2;
            }
            block.end_number = pos;
        }
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        let mut expected = 0;
        for &block_id in &ctx.block_order {
            let block = &ctx.func.blocks[block_id];
            fatal_check!(
                block.begin_number == expected,
                "numbering",
                "block {block_id} begins at {} instead of {expected}",
                block.begin_number
            );
            fatal_check!(
                block.insts[0].number == block.begin_number + 2,
                "numbering",
                "block {block_id} has an instruction on its begin slot"
            );
            for inst in &block.insts {
                fatal_check!(
                    inst.number % 2 == 0,
                    "numbering",
                    "instruction {} got odd number {}",
                    inst.id,
                    inst.number
                );
            }
            expected = block.end_number;
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
    fn test_numbers_are_even_and_contiguous() {
        let mut func = Function::new();
        let entry = func.entry;
        let next = func.new_block();
        let v = func.new_var(ValueKind::Int);
        func.push_def(entry, v);
        func.push_jump(entry, next);
        func.push_op(next, &[v], &[v]);
        func.push_ret(next, &[v]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        ctx.block_order = vec![entry, next];
        NumberInstructions.doit(&mut ctx).unwrap();
        NumberInstructions.check_postconditions(&ctx).unwrap();

        let b0 = &ctx.func.blocks[entry];
        assert_eq!(b0.begin_number, 0);
        assert_eq!(b0.insts[0].number, 2);
        assert_eq!(b0.insts[1].number, 4);
        assert_eq!(b0.end_number, 6);

        let b1 = &ctx.func.blocks[next];
        assert_eq!(b1.begin_number, 6);
        assert_eq!(b1.insts[0].number, 8);
        assert_eq!(b1.end_number, 12);
        assert_eq!(ctx.block_starts, vec![(0, entry), (6, next)]);
    }
}
