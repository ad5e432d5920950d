//! Fixed-register constraint lowering.
//!
//! An operand pinned to a specific register would force its variable's
//! whole interval into that register. Instead, each pinned operand gets
//! a fresh variable fixed at the required register, connected to the
//! original variable by a move directly before (uses) or after (defs)
//! the instruction. The fixed variable's interval is then only one
//! instruction long and the original interval stays freely allocatable.

use smallvec::SmallVec;

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::lir::{Constraint, Effect, Inst, InstKind, Location, MoveKind, Operand, RegClass};
use crate::phase::Phase;

pub struct Prologue;

impl Phase for Prologue {
    fn name(&self) -> &'static str {
        "prologue"
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        for block_id in ctx.func.blocks.ids().collect::<Vec<_>>() {
            let insts = std::mem::take(&mut ctx.func.blocks[block_id].insts);
            let mut out: Vec<Inst> = Vec::with_capacity(insts.len());

            for mut inst in insts {
                let mut after: SmallVec<[Inst; 2]> = SmallVec::new();

                for idx in 0..inst.operands.len() {
                    let op = inst.operands[idx];
                    let reg = match op.constraint {
                        Constraint::Fixed(reg) => reg,
                        _ => continue,
                    };
                    let kind = ctx.func.vars[op.var].kind;
                    let class_ok = match reg.class {
                        RegClass::Int => ctx.func.vars[op.var].needs_integer_register(),
                        RegClass::Float => ctx.func.vars[op.var].needs_float_register(),
                    };
                    fatal_check!(
                        class_ok,
                        "prologue",
                        "operand {} of {} pinned to {} its variable cannot occupy",
                        idx,
                        inst.id,
                        reg
                    );

                    let fixed = ctx.func.new_fixed_var(kind, Location::Reg(reg));
                    if op.is_use() {
                        out.push(ctx.func.make_inst(
                            InstKind::Move(MoveKind::FixedConstraint),
                            [
                                Operand::new(op.var, Effect::Use, Constraint::Any),
                                Operand::new(fixed, Effect::Def, Constraint::Any),
                            ],
                        ));
                    }
                    if op.is_def() {
                        after.push(ctx.func.make_inst(
                            InstKind::Move(MoveKind::FixedConstraint),
                            [
                                Operand::new(fixed, Effect::Use, Constraint::Any),
                                Operand::new(op.var, Effect::Def, Constraint::Any),
                            ],
                        ));
                    }
                    inst.operands[idx] = Operand::new(fixed, op.effect, Constraint::Register);
                }

                fatal_check!(
                    after.is_empty() || !inst.is_terminator(),
                    "prologue",
                    "terminator {} defines a fixed-register operand",
                    inst.id
                );
                out.push(inst);
                out.extend(after);
            }

            ctx.func.blocks[block_id].insts = out;
        }
        Ok(())
    }

    fn check_postconditions(&self, ctx: &AllocationContext) -> Result<(), FatalError> {
        for (_, block) in ctx.func.blocks.iter() {
            for inst in &block.insts {
                for op in &inst.operands {
                    fatal_check!(
                        !matches!(op.constraint, Constraint::Fixed(_)),
                        "prologue",
                        "fixed constraint survived lowering at {}",
                        inst.id
                    );
                }
            }
        }
        Ok(())
    }
}
