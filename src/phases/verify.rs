//! Allocation verification by simulated execution.
//!
//! The allocator's output is hard to eyeball, so it is checked
//! dynamically: a pseudo-random execution walks the CFG from the entry
//! block, tracking for every variable a token naming the instruction
//! that produced its current value. Ordinary instructions record the
//! producer tokens they consume; moves forward tokens silently, so the
//! moves the allocator inserts are invisible to the recording. The walk
//! runs once before interval construction and once after resolution
//! with the same seed; both runs must observe the identical value flow
//! and the identical trace of non-resolver blocks.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::context::AllocationContext;
use crate::error::{fatal_check, FatalError};
use crate::lir::{BlockId, InstId, InstKind, VarId};
use crate::phase::Phase;

// =============================================================================
// Run Result
// =============================================================================

/// Observed value flow of one simulated execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerificationRunResult {
    /// Per consumer instruction, the producer tokens it read on each
    /// executed visit, in visit order.
    pub observed: FxHashMap<InstId, Vec<Vec<InstId>>>,
    /// Executed blocks in order, move-resolver blocks excluded.
    pub trace: Vec<BlockId>,
}

// =============================================================================
// Phase
// =============================================================================

enum Mode {
    Record,
    Check,
}

pub struct VerifyAllocation {
    mode: Mode,
}

impl VerifyAllocation {
    pub fn record() -> Self {
        VerifyAllocation { mode: Mode::Record }
    }

    pub fn check() -> Self {
        VerifyAllocation { mode: Mode::Check }
    }
}

impl Phase for VerifyAllocation {
    fn name(&self) -> &'static str {
        match self.mode {
            Mode::Record => "verify-record",
            Mode::Check => "verify-check",
        }
    }

    fn doit(&mut self, ctx: &mut AllocationContext) -> Result<(), FatalError> {
        let result = simulate(ctx)?;
        match self.mode {
            Mode::Record => {
                ctx.recorded = Some(result);
                Ok(())
            }
            Mode::Check => {
                let recorded = ctx.recorded.as_ref().ok_or_else(|| {
                    FatalError::new("verify-check", "no recorded run to compare against")
                })?;
                fatal_check!(
                    recorded.trace == result.trace,
                    "verify-check",
                    "block trace diverged after allocation: {} vs {} executed blocks",
                    recorded.trace.len(),
                    result.trace.len()
                );
                if recorded.observed != result.observed {
                    let culprit = recorded
                        .observed
                        .iter()
                        .find(|(id, flows)| result.observed.get(id) != Some(flows))
                        .map(|(id, _)| *id);
                    return Err(FatalError::new(
                        "verify-check",
                        format!(
                            "value flow changed by allocation, first difference at {}",
                            culprit.map_or_else(|| "<new consumer>".into(), |id| id.to_string())
                        ),
                    ));
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Simulation
// =============================================================================

fn simulate(ctx: &AllocationContext) -> Result<VerificationRunResult, FatalError> {
    let mut rng = SmallRng::seed_from_u64(ctx.config.verify_seed);
    let mut env: FxHashMap<VarId, InstId> = FxHashMap::default();
    let mut result = VerificationRunResult::default();

    let mut current = ctx.func.entry;
    'execution: loop {
        let block = &ctx.func.blocks[current];
        if !block.move_resolver {
            if result.trace.len() >= ctx.config.verify_max_steps {
                break;
            }
            result.trace.push(current);
        }

        let mut next: Option<BlockId> = None;
        for inst in &block.insts {
            if inst.is_move() {
                // Moves forward the producer token unchanged.
                let token = read(&env, inst.move_src().var, inst.id)?;
                env.insert(inst.move_dst().var, token);
            } else {
                let mut producers = Vec::new();
                for op in &inst.operands {
                    if op.is_use() {
                        producers.push(read(&env, op.var, inst.id)?);
                    }
                }
                if !producers.is_empty() {
                    result.observed.entry(inst.id).or_default().push(producers);
                }
                for op in &inst.operands {
                    if op.is_def() {
                        env.insert(op.var, inst.id);
                    }
                }
            }

            match inst.kind {
                InstKind::Jump { target } => next = Some(target),
                InstKind::Branch {
                    then_target,
                    else_target,
                } => {
                    next = Some(if rng.gen_bool(0.5) {
                        then_target
                    } else {
                        else_target
                    });
                }
                InstKind::Ret => break 'execution,
                _ => {}
            }
        }

        current = next.ok_or_else(|| {
            FatalError::new(
                "verify",
                format!("block {current} does not end in a terminator"),
            )
        })?;
    }

    Ok(result)
}

fn read(env: &FxHashMap<VarId, InstId>, var: VarId, at: InstId) -> Result<InstId, FatalError> {
    env.get(&var).copied().ok_or_else(|| {
        FatalError::new(
            "verify",
            format!("{at} reads {var} before any definition reached it"),
        )
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Function, MoveKind, ValueKind};
    use crate::AllocatorConfig;

    #[test]
    fn test_moves_are_transparent() {
        let mut func = Function::new();
        let entry = func.entry;
        let a = func.new_var(ValueKind::Int);
        let b = func.new_var(ValueKind::Int);
        let def = func.push_def(entry, a);
        func.push_move(entry, MoveKind::User, a, b);
        let user = func.push_op(entry, &[b], &[]);
        func.push_ret(entry, &[]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        let result = simulate(&mut ctx).unwrap();

        // The consumer sees the def as producer, not the move.
        assert_eq!(result.observed[&user], vec![vec![def]]);
        assert!(!result.observed.contains_key(&def));
        assert_eq!(result.trace, vec![entry]);
    }

    #[test]
    fn test_identical_runs_record_identically() {
        let mut func = Function::new();
        let entry = func.entry;
        let a_blk = func.new_block();
        let b_blk = func.new_block();
        let join = func.new_block();

        let c = func.new_var(ValueKind::Int);
        let v = func.new_var(ValueKind::Int);
        func.push_def(entry, c);
        func.push_def(entry, v);
        func.push_branch(entry, c, a_blk, b_blk);
        func.push_op(a_blk, &[v], &[v]);
        func.push_jump(a_blk, join);
        func.push_jump(b_blk, join);
        func.push_ret(join, &[v]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        let first = simulate(&mut ctx).unwrap();
        let second = simulate(&mut ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_loop_terminates_via_step_budget() {
        let mut func = Function::new();
        let entry = func.entry;
        let v = func.new_var(ValueKind::Int);
        func.push_def(entry, v);
        func.push_jump(entry, entry);

        let config = AllocatorConfig {
            verify_max_steps: 25,
            ..AllocatorConfig::default()
        };
        let mut ctx = AllocationContext::new(&mut func, &config);
        let result = simulate(&mut ctx).unwrap();
        assert_eq!(result.trace.len(), 25);
    }

    #[test]
    fn test_undefined_read_is_fatal() {
        let mut func = Function::new();
        let entry = func.entry;
        let v = func.new_var(ValueKind::Int);
        func.push_op(entry, &[v], &[]);
        func.push_ret(entry, &[]);

        let config = AllocatorConfig::default();
        let mut ctx = AllocationContext::new(&mut func, &config);
        assert!(simulate(&mut ctx).is_err());
    }
}
