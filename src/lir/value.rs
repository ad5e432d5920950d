//! Values, locations and variables.
//!
//! A variable is the allocator's unit of work: it carries a value kind,
//! the set of location kinds it may legally occupy, and (after
//! allocation) the concrete location the allocator chose.

use super::reg::{Reg, RegClass};
use crate::arena::Id;

// =============================================================================
// Value Kind
// =============================================================================

/// The kind of value a variable holds.
///
/// `Reference` and `Word` are integer-sized; the distinction matters to
/// the garbage collector's stack maps, not to this stage, but it must be
/// preserved through splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Float,
    Reference,
    Word,
}

impl ValueKind {
    /// Register class values of this kind allocate from.
    #[inline]
    pub fn reg_class(self) -> RegClass {
        match self {
            ValueKind::Float => RegClass::Float,
            ValueKind::Int | ValueKind::Reference | ValueKind::Word => RegClass::Int,
        }
    }
}

// =============================================================================
// Location Kinds
// =============================================================================

/// Bit set of location categories a variable may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKinds(u8);

impl LocationKinds {
    pub const INTEGER_REGISTER: LocationKinds = LocationKinds(0b001);
    pub const FLOAT_REGISTER: LocationKinds = LocationKinds(0b010);
    pub const STACK_SLOT: LocationKinds = LocationKinds(0b100);

    pub const INTEGER_REGISTER_OR_STACK: LocationKinds = LocationKinds(0b101);
    pub const FLOAT_REGISTER_OR_STACK: LocationKinds = LocationKinds(0b110);

    #[inline]
    pub fn contains(self, kind: LocationKinds) -> bool {
        self.0 & kind.0 == kind.0
    }

    /// Default allowed kinds for a value kind: its register class or a
    /// stack slot.
    #[inline]
    pub fn for_value(kind: ValueKind) -> Self {
        match kind.reg_class() {
            RegClass::Int => Self::INTEGER_REGISTER_OR_STACK,
            RegClass::Float => Self::FLOAT_REGISTER_OR_STACK,
        }
    }
}

// =============================================================================
// Locations
// =============================================================================

/// A stack slot in the frame's spill area, identified by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(pub u32);

impl std::fmt::Display for StackSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A concrete storage location.
///
/// The derived order (registers before slots, within each by ordinal)
/// gives the move resolver a deterministic scheduling key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Reg(Reg),
    Stack(StackSlot),
}

impl Location {
    #[inline]
    pub fn is_stack(self) -> bool {
        matches!(self, Location::Stack(_))
    }

    #[inline]
    pub fn as_reg(self) -> Option<Reg> {
        match self {
            Location::Reg(r) => Some(r),
            Location::Stack(_) => None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "{}", r),
            Location::Stack(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Variable
// =============================================================================

pub type VarId = Id<Variable>;

/// A virtual value the allocator assigns a location to.
///
/// Fixed variables are pre-pinned to one location (calling-convention
/// registers materialized by the prologue, shared spill slots); the
/// allocator honors their location instead of choosing one.
#[derive(Debug, Clone)]
pub struct Variable {
    pub kind: ValueKind,
    pub allowed: LocationKinds,
    pub location: Option<Location>,
    pub fixed: bool,
}

impl Variable {
    pub fn new(kind: ValueKind) -> Self {
        Variable {
            kind,
            allowed: LocationKinds::for_value(kind),
            location: None,
            fixed: false,
        }
    }

    pub fn fixed_at(kind: ValueKind, location: Location) -> Self {
        Variable {
            kind,
            allowed: LocationKinds::for_value(kind),
            location: Some(location),
            fixed: true,
        }
    }

    /// True when the variable may take an integer register.
    #[inline]
    pub fn needs_integer_register(&self) -> bool {
        self.kind.reg_class() == RegClass::Int
            && self.allowed.contains(LocationKinds::INTEGER_REGISTER)
    }

    /// True when the variable may take a floating-point register.
    #[inline]
    pub fn needs_float_register(&self) -> bool {
        self.kind.reg_class() == RegClass::Float
            && self.allowed.contains(LocationKinds::FLOAT_REGISTER)
    }

    /// True when a stack slot is the only location category left, so the
    /// allocation walk skips the register search entirely.
    #[inline]
    pub fn needs_stack_slot(&self) -> bool {
        !self.needs_integer_register() && !self.needs_float_register()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_kinds() {
        let int = LocationKinds::for_value(ValueKind::Reference);
        assert!(int.contains(LocationKinds::INTEGER_REGISTER));
        assert!(int.contains(LocationKinds::STACK_SLOT));
        assert!(!int.contains(LocationKinds::FLOAT_REGISTER));
    }

    #[test]
    fn test_location_order() {
        let a = Location::Reg(Reg::int(0));
        let b = Location::Reg(Reg::int(3));
        let c = Location::Stack(StackSlot(0));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_needed_location_categories() {
        let int = Variable::new(ValueKind::Word);
        assert!(int.needs_integer_register());
        assert!(!int.needs_float_register());
        assert!(!int.needs_stack_slot());

        let mut pinned = Variable::new(ValueKind::Float);
        pinned.allowed = LocationKinds::STACK_SLOT;
        assert!(!pinned.needs_float_register());
        assert!(pinned.needs_stack_slot());
    }

    #[test]
    fn test_fixed_variable() {
        let v = Variable::fixed_at(ValueKind::Int, Location::Reg(Reg::int(2)));
        assert!(v.fixed);
        assert_eq!(v.location, Some(Location::Reg(Reg::int(2))));
    }
}
