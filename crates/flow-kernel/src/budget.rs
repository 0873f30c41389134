//! Controller budgets (spec §4.6): hop/token/deadline accounting applied to
//! `WorkingMemory` payloads before a controller node's output is routed.
//!
//! Generalizes the donor kernel's `BudgetEnforcer`
//! (`mofa-kernel/src/budget.rs`), which tracks session/day-scoped cost and
//! token usage, to the spec's narrower per-envelope hop/token accounting.
//! This is intentionally the *only* place the core inspects payload
//! semantics (spec §4.6): a non-controller graph never runs this code.

use crate::payload::{FinalAnswer, WorkingMemory};

/// The outcome of applying budgets to one controller iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetOutcome {
    /// Budgets are not exhausted; continue around the back-edge with the
    /// (hop-incremented) working memory.
    Continue(WorkingMemory),
    /// A budget was exhausted or the deadline passed; route this final
    /// answer to the egress instead of looping.
    Terminate(FinalAnswer),
}

/// Apply the controller-cycle rule to `wm` given the current time and the
/// envelope's optional deadline. Order matches spec §4.6: hop increment,
/// then hop budget, then token budget, then deadline.
pub fn apply_budgets(mut wm: WorkingMemory, now: f64, deadline_s: Option<f64>) -> BudgetOutcome {
    wm.hops += 1;

    if wm.hops >= wm.budget_hops {
        return BudgetOutcome::Terminate(FinalAnswer::new("Hop budget exhausted"));
    }
    if wm.tokens_used >= wm.budget_tokens {
        return BudgetOutcome::Terminate(FinalAnswer::new("Token budget exhausted"));
    }
    if let Some(deadline) = deadline_s {
        if now >= deadline {
            return BudgetOutcome::Terminate(FinalAnswer::new("Deadline exceeded"));
        }
    }

    BudgetOutcome::Continue(wm)
}
