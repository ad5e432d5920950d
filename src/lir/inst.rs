//! Instructions and operands.
//!
//! Operands declare how an instruction touches a variable (effect) and
//! what locations the touching tolerates (constraint). That declaration
//! is the whole interface between instructions and the allocator.

use smallvec::SmallVec;

use super::block::BlockId;
use super::reg::Reg;
use super::value::VarId;
use super::CodePos;

// =============================================================================
// Operands
// =============================================================================

/// How an instruction affects an operand's variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Reads the variable.
    Use,
    /// Writes the variable, killing the previous value.
    Def,
    /// Reads and writes the variable in place.
    Update,
}

/// Location constraint an operand imposes at its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Any legal location, including a stack slot.
    Any,
    /// Must be in a register of the variable's class.
    Register,
    /// Must be in this specific register (calling conventions, shifts on
    /// targets with an implicit count register, ...). Lowered away by the
    /// prologue before interval construction.
    Fixed(Reg),
}

/// One variable reference of an instruction.
#[derive(Debug, Clone, Copy)]
pub struct Operand {
    pub var: VarId,
    pub effect: Effect,
    pub constraint: Constraint,
}

impl Operand {
    #[inline]
    pub fn new(var: VarId, effect: Effect, constraint: Constraint) -> Self {
        Operand {
            var,
            effect,
            constraint,
        }
    }

    #[inline]
    pub fn is_def(&self) -> bool {
        matches!(self.effect, Effect::Def | Effect::Update)
    }

    #[inline]
    pub fn is_use(&self) -> bool {
        matches!(self.effect, Effect::Use | Effect::Update)
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// Stable instruction identity.
///
/// Survives renumbering and instruction insertion, so verification
/// results recorded before allocation stay comparable after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl std::fmt::Display for InstId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Why a move instruction exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// Present in the input program.
    User,
    /// Materialized fixed-register constraint.
    FixedConstraint,
    /// Connects two children of a split interval.
    IntervalSplit,
    /// Inserted on a control-flow edge by data-flow resolution.
    DataFlowResolved,
    /// Stores a value to its parent's shared spill slot at the
    /// definition, so edge resolution can assume the slot is current.
    SpillSlotDefinition,
}

impl MoveKind {
    /// Moves the allocator itself inserted may be deleted again when
    /// source and destination coincide after variable merging.
    #[inline]
    pub fn allocator_inserted(self) -> bool {
        !matches!(self, MoveKind::User)
    }
}

#[derive(Debug, Clone)]
pub enum InstKind {
    /// Produces a fresh value (constant load, parameter, ...). Exactly
    /// the def operands, no control flow.
    Def,
    /// An ordinary computation over its operands.
    Op,
    /// Copies operand 0 (use) into operand 1 (def).
    Move(MoveKind),
    /// Unconditional jump.
    Jump { target: BlockId },
    /// Two-way branch; the taken edge is data-dependent (modeled as
    /// random during verification).
    Branch {
        then_target: BlockId,
        else_target: BlockId,
    },
    /// Function return.
    Ret,
}

/// A machine-level instruction.
#[derive(Debug, Clone)]
pub struct Inst {
    pub id: InstId,
    /// Position in the linear-scan numbering; `NO_POS` until numbered.
    pub number: CodePos,
    pub kind: InstKind,
    pub operands: SmallVec<[Operand; 4]>,
}

impl Inst {
    #[inline]
    pub fn is_move(&self) -> bool {
        matches!(self.kind, InstKind::Move(_))
    }

    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Jump { .. } | InstKind::Branch { .. } | InstKind::Ret
        )
    }

    /// Successor blocks named by this instruction, in edge order.
    pub fn targets(&self) -> SmallVec<[BlockId; 2]> {
        match self.kind {
            InstKind::Jump { target } => SmallVec::from_slice(&[target]),
            InstKind::Branch {
                then_target,
                else_target,
            } => SmallVec::from_slice(&[then_target, else_target]),
            _ => SmallVec::new(),
        }
    }

    /// Source operand of a move.
    #[inline]
    pub fn move_src(&self) -> &Operand {
        debug_assert!(self.is_move());
        &self.operands[0]
    }

    /// Destination operand of a move.
    #[inline]
    pub fn move_dst(&self) -> &Operand {
        debug_assert!(self.is_move());
        &self.operands[1]
    }
}
