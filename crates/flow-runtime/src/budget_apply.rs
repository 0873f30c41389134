//! Wires [`flow_kernel::budget::apply_budgets`] into the worker's routing
//! step for controller nodes (spec §4.6). Kept as its own thin module
//! rather than inlined in `worker.rs` because it is "the only place the
//! core inspects payload semantics" and is worth being able to point at in
//! isolation.

use flow_kernel::budget::{apply_budgets, BudgetOutcome};
use flow_kernel::trace::now_secs;
use flow_kernel::Message;

/// What the worker should do with a controller node's output once budgets
/// have been applied.
pub enum ControllerRoute {
    /// Budgets allow another hop; route through the node's normal
    /// successors (including the back-edge) as usual.
    Continue(Message),
    /// A budget or the deadline was exhausted; route straight to the
    /// egress instead, skipping the back-edge.
    Terminate(Message),
}

/// Applies the controller-cycle rule to `output` if its payload is a
/// `WorkingMemory`. Non-controller payloads pass through unchanged as
/// `Continue` so that a node with `allow_cycle = true` can still emit
/// ordinary messages without budget interpretation kicking in.
pub fn route_controller_output(output: Message) -> ControllerRoute {
    let Some(wm) = output.payload.as_working_memory().cloned() else {
        return ControllerRoute::Continue(output);
    };

    match apply_budgets(wm, now_secs(), output.deadline_s) {
        BudgetOutcome::Continue(wm) => ControllerRoute::Continue(output.with_payload(wm)),
        BudgetOutcome::Terminate(final_answer) => {
            ControllerRoute::Terminate(output.with_payload(final_answer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_kernel::payload::{Payload, WorkingMemory};

    #[test]
    fn non_working_memory_payload_passes_through_as_continue() {
        let msg = Message::new("t1", Payload::user(serde_json::json!("x")));
        match route_controller_output(msg) {
            ControllerRoute::Continue(_) => {}
            ControllerRoute::Terminate(_) => panic!("expected continue"),
        }
    }

    #[test]
    fn exhausted_hop_budget_terminates() {
        let wm = WorkingMemory::new("q", 1, 1_000_000);
        let msg = Message::new("t1", Payload::WorkingMemory(wm));
        match route_controller_output(msg) {
            ControllerRoute::Terminate(m) => {
                assert_eq!(
                    m.payload.as_final_answer().unwrap().text,
                    "Hop budget exhausted"
                );
            }
            ControllerRoute::Continue(_) => panic!("expected terminate"),
        }
    }

    #[test]
    fn under_budget_continues_with_incremented_hops() {
        let wm = WorkingMemory::new("q", 5, 1_000_000);
        let msg = Message::new("t1", Payload::WorkingMemory(wm));
        match route_controller_output(msg) {
            ControllerRoute::Continue(m) => {
                assert_eq!(m.payload.as_working_memory().unwrap().hops, 1);
            }
            ControllerRoute::Terminate(_) => panic!("expected continue"),
        }
    }
}
