//! Phase trait and the fixed allocation pipeline.
//!
//! Every step of the allocator is a phase with explicit pre- and
//! postconditions. Condition checks are not debug-only: a violated
//! invariant aborts the method's compilation with a `FatalError` in
//! release builds too, because continuing would emit wrong code.

use std::time::Instant;

use log::debug;

use crate::context::AllocationContext;
use crate::error::FatalError;
use crate::phases::build::{BuildIntervals, SortIntervals};
use crate::phases::cleanup::RemoveRedundantMoves;
use crate::phases::liveness::ComputeLiveSets;
use crate::phases::loops::DetectLoops;
use crate::phases::number::NumberInstructions;
use crate::phases::order::ComputeBlockOrder;
use crate::phases::prologue::Prologue;
use crate::phases::resolve::ResolveDataFlow;
use crate::phases::verify::VerifyAllocation;
use crate::phases::walk::WalkIntervals;

// =============================================================================
// Phase Trait
// =============================================================================

/// One step of the allocation pipeline.
pub trait Phase {
    fn name(&self) -> &'static str;

    fn check_preconditions(&self, _ctx: &AllocationContext) -> Result<(), FatalError> {
        Ok(())
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError>;

    fn check_postconditions(&self, _ctx: &AllocationContext) -> Result<(), FatalError> {
        Ok(())
    }

    /// Runs the phase with timing; not meant to be overridden.
    fn run(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let start = Instant::now();
        self.check_preconditions(ctx)?;
        self.doit(ctx)?;
        self.check_postconditions(ctx)?;
        let elapsed = start.elapsed();
        debug!("phase `{}` done in {}us", self.name(), elapsed.as_micros());
        ctx.stats
            .phase_times
            .push((self.name(), elapsed.as_micros() as u64));
        Ok(())
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs the full allocation pipeline over a context. The order is
/// fixed; verification phases drop out when disabled in the config.
pub fn run_pipeline(ctx: &mut AllocationContext) -> Result<(), FatalError> {
    let verify = ctx.config.verify;

    let mut phases: Vec<Box<dyn Phase>> = vec![
        Box::new(Prologue),
        Box::new(DetectLoops),
        Box::new(ComputeBlockOrder),
        Box::new(NumberInstructions),
        Box::new(ComputeLiveSets::compute()),
    ];
    if verify {
        phases.push(Box::new(VerifyAllocation::record()));
    }
    phases.push(Box::new(BuildIntervals));
    phases.push(Box::new(SortIntervals));
    phases.push(Box::new(WalkIntervals::new()));
    phases.push(Box::new(ResolveDataFlow));
    phases.push(Box::new(RemoveRedundantMoves));
    phases.push(Box::new(ComputeLiveSets::validate()));
    if verify {
        phases.push(Box::new(VerifyAllocation::check()));
    }

    for phase in &mut phases {
        phase.run(ctx)?;
    }
    Ok(())
}
