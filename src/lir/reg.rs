//! Physical registers and register sets.
//!
//! The target's register file is opaque to the allocator: a register is a
//! class plus an ordinal, and the target hands over one pool per class.

// =============================================================================
// Register Class
// =============================================================================

/// Register class an interval allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    /// General-purpose integer registers.
    Int,
    /// Floating-point registers.
    Float,
}

// =============================================================================
// Physical Register
// =============================================================================

/// A physical machine register: a class and an ordinal within that class.
///
/// Ordinals are dense (0..pool size) so per-register walk state can live
/// in plain arrays indexed by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub class: RegClass,
    pub ordinal: u8,
}

impl Reg {
    #[inline]
    pub const fn int(ordinal: u8) -> Self {
        Reg {
            class: RegClass::Int,
            ordinal,
        }
    }

    #[inline]
    pub const fn float(ordinal: u8) -> Self {
        Reg {
            class: RegClass::Float,
            ordinal,
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.class {
            RegClass::Int => write!(f, "r{}", self.ordinal),
            RegClass::Float => write!(f, "f{}", self.ordinal),
        }
    }
}

// =============================================================================
// Register Set
// =============================================================================

/// The allocatable registers of the target, partitioned by class.
///
/// Each run deep-copies these pools into its own context so concurrent
/// compilations never share mutable allocation state.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    int: Vec<Reg>,
    float: Vec<Reg>,
}

impl RegisterSet {
    /// Builds a set with `num_int` integer and `num_float` float registers,
    /// ordinals dense from zero.
    pub fn new(num_int: u8, num_float: u8) -> Self {
        RegisterSet {
            int: (0..num_int).map(Reg::int).collect(),
            float: (0..num_float).map(Reg::float).collect(),
        }
    }

    #[inline]
    pub fn pool(&self, class: RegClass) -> &[Reg] {
        match class {
            RegClass::Int => &self.int,
            RegClass::Float => &self.float,
        }
    }

    #[inline]
    pub fn count(&self, class: RegClass) -> usize {
        self.pool(class).len()
    }
}
