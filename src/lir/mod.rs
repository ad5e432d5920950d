//! Machine-Level IR Containers
//!
//! The allocator operates on a low-level IR that already went through
//! instruction selection: operations reference variables through operands,
//! and the allocator's only job is to rewrite each variable's location.
//!
//! # Layout
//!
//! - `reg.rs`: register classes, physical registers, register sets
//! - `value.rs`: value kinds, locations, stack slots, variables
//! - `inst.rs`: operands, instructions, move kinds
//! - `block.rs`: basic blocks and the function container

pub mod block;
pub mod inst;
pub mod reg;
pub mod value;

pub use block::{Block, BlockId, Function};
pub use inst::{Constraint, Effect, Inst, InstId, InstKind, MoveKind, Operand};
pub use reg::{Reg, RegClass, RegisterSet};
pub use value::{Location, LocationKinds, StackSlot, ValueKind, VarId, Variable};

/// A position in the numbered instruction stream.
///
/// Instructions carry even numbers; odd numbers are reserved for moves
/// inserted between instructions by interval splitting.
pub type CodePos = u32;

/// Sentinel for "no position".
pub const NO_POS: CodePos = u32::MAX;
