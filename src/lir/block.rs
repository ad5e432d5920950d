//! Basic blocks and the function container.
//!
//! Control flow is carried by block terminators; predecessor lists are
//! derived and recomputed after the move resolver rewrites edges.

use smallvec::SmallVec;

use super::inst::{Constraint, Effect, Inst, InstId, InstKind, MoveKind, Operand};
use super::value::{Location, ValueKind, VarId, Variable};
use super::{CodePos, NO_POS};
use crate::arena::{Arena, BitSet, Id};

pub type BlockId = Id<Block>;

// =============================================================================
// Block
// =============================================================================

/// A basic block: straight-line instructions ending in a terminator.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub insts: Vec<Inst>,
    /// Derived from terminators; see [`Function::compute_preds`].
    pub preds: Vec<BlockId>,
    /// Number of the block's first instruction.
    pub begin_number: CodePos,
    /// One past the block's last instruction number plus one, i.e. the
    /// first number of the next block in linear-scan order.
    pub end_number: CodePos,
    /// Loop nesting depth; zero outside any loop.
    pub loop_depth: u32,
    /// Block is the source of a loop back edge.
    pub loop_end: bool,
    /// Variables live on entry / exit, indexed by variable id.
    pub live_in: BitSet,
    pub live_out: BitSet,
    /// Block was synthesized by data-flow resolution to hold edge moves.
    pub move_resolver: bool,
}

impl Block {
    /// Successor blocks, in terminator edge order. Empty for a block
    /// ending in a return.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        self.insts.last().map(Inst::targets).unwrap_or_default()
    }

    #[inline]
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|i| i.is_terminator())
    }
}

// =============================================================================
// Function
// =============================================================================

/// The unit of compilation handed to the allocator.
#[derive(Debug, Clone)]
pub struct Function {
    pub blocks: Arena<Block>,
    pub vars: Arena<Variable>,
    pub entry: BlockId,
    next_inst_id: u32,
}

impl Function {
    pub fn new() -> Self {
        let mut blocks = Arena::new();
        let entry = blocks.alloc(Block {
            begin_number: NO_POS,
            end_number: NO_POS,
            ..Block::default()
        });
        Function {
            blocks,
            vars: Arena::new(),
            entry,
            next_inst_id: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Builders
    // -------------------------------------------------------------------------

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.alloc(Block {
            begin_number: NO_POS,
            end_number: NO_POS,
            ..Block::default()
        })
    }

    pub fn new_var(&mut self, kind: ValueKind) -> VarId {
        self.vars.alloc(Variable::new(kind))
    }

    pub fn new_fixed_var(&mut self, kind: ValueKind, location: Location) -> VarId {
        self.vars.alloc(Variable::fixed_at(kind, location))
    }

    /// Builds an instruction with a fresh stable id, unnumbered.
    pub fn make_inst(
        &mut self,
        kind: InstKind,
        operands: impl IntoIterator<Item = Operand>,
    ) -> Inst {
        let id = InstId(self.next_inst_id);
        self.next_inst_id += 1;
        Inst {
            id,
            number: NO_POS,
            kind,
            operands: operands.into_iter().collect(),
        }
    }

    /// Appends an instruction to a block.
    pub fn push_inst(
        &mut self,
        block: BlockId,
        kind: InstKind,
        operands: impl IntoIterator<Item = Operand>,
    ) -> InstId {
        let inst = self.make_inst(kind, operands);
        let id = inst.id;
        self.blocks[block].insts.push(inst);
        id
    }

    /// Appends `var = def`.
    pub fn push_def(&mut self, block: BlockId, var: VarId) -> InstId {
        self.push_inst(
            block,
            InstKind::Def,
            [Operand::new(var, Effect::Def, Constraint::Any)],
        )
    }

    /// Appends an operation reading `uses` and writing `defs`, all with
    /// must-have-register constraints.
    pub fn push_op(&mut self, block: BlockId, uses: &[VarId], defs: &[VarId]) -> InstId {
        let operands: Vec<Operand> = uses
            .iter()
            .map(|&v| Operand::new(v, Effect::Use, Constraint::Register))
            .chain(
                defs.iter()
                    .map(|&v| Operand::new(v, Effect::Def, Constraint::Register)),
            )
            .collect();
        self.push_inst(block, InstKind::Op, operands)
    }

    /// Appends `dst = src`.
    pub fn push_move(&mut self, block: BlockId, kind: MoveKind, src: VarId, dst: VarId) -> InstId {
        self.push_inst(
            block,
            InstKind::Move(kind),
            [
                Operand::new(src, Effect::Use, Constraint::Any),
                Operand::new(dst, Effect::Def, Constraint::Any),
            ],
        )
    }

    pub fn push_jump(&mut self, block: BlockId, target: BlockId) -> InstId {
        self.push_inst(block, InstKind::Jump { target }, [])
    }

    pub fn push_branch(
        &mut self,
        block: BlockId,
        cond: VarId,
        then_target: BlockId,
        else_target: BlockId,
    ) -> InstId {
        self.push_inst(
            block,
            InstKind::Branch {
                then_target,
                else_target,
            },
            [Operand::new(cond, Effect::Use, Constraint::Register)],
        )
    }

    pub fn push_ret(&mut self, block: BlockId, values: &[VarId]) -> InstId {
        let operands: Vec<Operand> = values
            .iter()
            .map(|&v| Operand::new(v, Effect::Use, Constraint::Register))
            .collect();
        self.push_inst(block, InstKind::Ret, operands)
    }

    // -------------------------------------------------------------------------
    // CFG maintenance
    // -------------------------------------------------------------------------

    /// Recomputes every block's predecessor list from the terminators.
    pub fn compute_preds(&mut self) {
        for id in self.blocks.ids() {
            self.blocks[id].preds.clear();
        }
        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .flat_map(|(id, block)| block.successors().into_iter().map(move |s| (id, s)))
            .collect();
        for (from, to) in edges {
            self.blocks[to].preds.push(from);
        }
    }

    /// Redirects the `from -> old` edge of `from`'s terminator to `new`.
    /// Predecessor lists are left stale; callers recompute them.
    pub fn retarget(&mut self, from: BlockId, old: BlockId, new: BlockId) {
        if let Some(inst) = self.blocks[from].insts.last_mut() {
            match &mut inst.kind {
                InstKind::Jump { target } if *target == old => *target = new,
                InstKind::Branch {
                    then_target,
                    else_target,
                } => {
                    if *then_target == old {
                        *then_target = new;
                    }
                    if *else_target == old {
                        *else_target = new;
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::ValueKind;

    #[test]
    fn test_successors_and_preds() {
        let mut func = Function::new();
        let entry = func.entry;
        let then_b = func.new_block();
        let else_b = func.new_block();
        let exit = func.new_block();

        let cond = func.new_var(ValueKind::Int);
        func.push_def(entry, cond);
        func.push_branch(entry, cond, then_b, else_b);
        func.push_jump(then_b, exit);
        func.push_jump(else_b, exit);
        func.push_ret(exit, &[]);

        func.compute_preds();

        assert_eq!(
            func.blocks[entry].successors().as_slice(),
            &[then_b, else_b]
        );
        assert!(func.blocks[exit].successors().is_empty());
        assert_eq!(func.blocks[exit].preds, vec![then_b, else_b]);
        assert!(func.blocks[entry].preds.is_empty());
    }

    #[test]
    fn test_retarget_edge() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_block();
        let b = func.new_block();

        func.push_jump(entry, a);
        func.push_ret(a, &[]);
        func.push_ret(b, &[]);

        func.retarget(entry, a, b);
        assert_eq!(func.blocks[entry].successors().as_slice(), &[b]);
    }

    #[test]
    fn test_inst_ids_are_unique() {
        let mut func = Function::new();
        let entry = func.entry;
        let v = func.new_var(ValueKind::Int);
        let a = func.push_def(entry, v);
        let b = func.push_op(entry, &[v], &[v]);
        assert_ne!(a, b);
    }
}
