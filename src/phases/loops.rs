//! Loop detection.
//!
//! A DFS over the CFG classifies back edges; each back-edge target is a
//! loop header and the loop body is collected by walking predecessors
//! backwards from the back-edge sources. Nesting depth is the number of
//! loop bodies a block belongs to. Depths steer both the block order
//! and the split-position heuristic, which prefers splitting where
//! nesting is shallowest.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::arena::SecondaryMap;
use crate::context::AllocationContext;
use crate::error::FatalError;
use crate::lir::{Block, BlockId};
use crate::phase::Phase;

pub struct DetectLoops;

#[derive(Clone, Copy, PartialEq, Default)]
enum Color {
    #[default]
    White,
    Gray,
    Black,
}

impl Phase for DetectLoops {
    fn name(&self) -> &'static str {
        "detect-loops"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        ctx.func.compute_preds();
        ctx.back_edges.clear();
        for id in ctx.func.blocks.ids() {
            ctx.func.blocks[id].loop_depth = 0;
            ctx.func.blocks[id].loop_end = false;
        }

        // DFS back-edge classification.
        let mut color: SecondaryMap<Block, Color> =
            SecondaryMap::with_capacity(ctx.func.blocks.len());
        let mut stack: Vec<(BlockId, SmallVec<[BlockId; 2]>, usize)> = Vec::new();
        color.set(ctx.func.entry, Color::Gray);
        stack.push((ctx.func.entry, ctx.func.blocks[ctx.func.entry].successors(), 0));

        loop {
            let next = match stack.last_mut() {
                Some((block, succs, idx)) if *idx < succs.len() => {
                    let succ = succs[*idx];
                    *idx += 1;
                    Some((*block, succ))
                }
                Some(_) => None,
                None => break,
            };
            match next {
                Some((block, succ)) => match color[succ] {
                    Color::White => {
                        color.set(succ, Color::Gray);
                        stack.push((succ, ctx.func.blocks[succ].successors(), 0));
                    }
                    Color::Gray => {
                        ctx.back_edges.insert((block, succ));
                        ctx.func.blocks[block].loop_end = true;
                    }
                    Color::Black => {}
                },
                None => {
                    if let Some((block, _, _)) = stack.pop() {
                        color.set(block, Color::Black);
                    }
                }
            }
        }

        // Loop bodies: backward walk from the back-edge sources, bounded
        // by the header. One body per header even with several back edges.
        let mut headers: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &(src, header) in &ctx.back_edges {
            headers.entry(header).or_default().push(src);
        }

        for (header, sources) in headers {
            let mut body: Vec<BlockId> = vec![header];
            let mut worklist = sources;
            while let Some(block) = worklist.pop() {
                if block == header || body.contains(&block) {
                    continue;
                }
                body.push(block);
                worklist.extend(ctx.func.blocks[block].preds.iter().copied());
            }
            for block in body {
                ctx.func.blocks[block].loop_depth += 1;
            }
        }

        Ok(())
    }
}
