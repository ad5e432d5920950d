//! Linear Scan Register Allocation
//!
//! This crate implements the register-allocation stage of the Corvus
//! JIT backend. It assigns every variable of a machine-level IR function
//! a physical register or stack slot, splitting live intervals on
//! register pressure and inserting the moves that stitch the split
//! pieces back together across control flow.
//!
//! # Pipeline
//!
//! Allocation runs as a fixed sequence of phases over a per-run
//! [`context`](crate::context) that owns deep copies of all mutable
//! state:
//!
//! 1. Prologue: lower fixed-register operand constraints to moves
//! 2. Loop detection and loop-aware block ordering
//! 3. Instruction numbering (even positions; odd reserved for moves)
//! 4. Liveness analysis
//! 5. Interval construction (backward walk)
//! 6. The linear-scan walk: allocate, split, spill
//! 7. Data-flow resolution across split positions and block edges
//! 8. Redundant-move removal
//!
//! With verification enabled, a simulated random execution is recorded
//! before allocation and replayed after it; any difference in observed
//! value flow is a fatal error.
//!
//! # Usage
//!
//! ```
//! use corvus_regalloc::{AllocatorConfig, LinearScanAllocator};
//! use corvus_regalloc::lir::{Function, ValueKind};
//!
//! let mut func = Function::new();
//! let v = func.new_var(ValueKind::Int);
//! let entry = func.entry;
//! func.push_def(entry, v);
//! func.push_ret(entry, &[v]);
//!
//! let allocator = LinearScanAllocator::new(AllocatorConfig::default());
//! let stats = allocator.allocate(&mut func).unwrap();
//! assert_eq!(stats.num_spill_slots, 0);
//! ```

pub mod arena;
pub mod interval;
pub mod lir;
pub mod parent;

mod context;
mod error;
mod phase;
mod phases;

pub use context::{AllocationContext, OperandSite};
pub use error::FatalError;
pub use phases::verify::VerificationRunResult;

use lir::RegisterSet;

// =============================================================================
// Allocator Configuration
// =============================================================================

/// Configuration for one allocator instance.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Allocatable registers of the target; deep-copied per run.
    pub registers: RegisterSet,
    /// Record and check value flow around the allocation.
    pub verify: bool,
    /// Seed for the verification runs' simulated execution. Both runs
    /// use the same seed so they take the same branches.
    pub verify_seed: u64,
    /// Upper bound on executed blocks per verification run, so looping
    /// programs terminate.
    pub verify_max_steps: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            registers: RegisterSet::new(8, 8),
            verify: true,
            verify_seed: 0x1ea5_c0de,
            verify_max_steps: 1000,
        }
    }
}

// =============================================================================
// Allocation Statistics
// =============================================================================

/// Counters and timings from one allocation run.
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Intervals built, split children included.
    pub num_intervals: usize,
    /// Interval splits performed by the walk.
    pub num_splits: usize,
    /// Stack slots handed out.
    pub num_spill_slots: u32,
    /// Moves inserted by splitting and resolution.
    pub num_moves_inserted: usize,
    /// Allocator moves deleted again as redundant.
    pub num_moves_removed: usize,
    /// Blocks synthesized to hold edge moves.
    pub num_resolver_blocks: usize,
    /// Per-phase wall time in microseconds.
    pub phase_times: Vec<(&'static str, u64)>,
}

// =============================================================================
// Entry Point
// =============================================================================

/// The linear-scan register allocator.
pub struct LinearScanAllocator {
    config: AllocatorConfig,
}

impl LinearScanAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        LinearScanAllocator { config }
    }

    /// Allocates locations for every variable of `func`, rewriting the
    /// function in place. On success every variable referenced by an
    /// operand has a location; on error the function must be discarded.
    pub fn allocate(&self, func: &mut lir::Function) -> Result<AllocatorStats, FatalError> {
        let mut ctx = AllocationContext::new(func, &self.config);
        phase::run_pipeline(&mut ctx)?;
        Ok(ctx.stats)
    }
}
