//! The Agent Status state machine (spec §4.7).
//!
//! States: spawning -> idle -> working -> {blocked, waiting_review} ->
//! done; error is reachable from any non-terminal state. Transitions are
//! caused only by tool calls (`update_status`, `report_completion`) or by
//! a Session Supervisor's exit handler -- no other component may write
//! `status`, so this module only validates edges; the caller still owns
//! committing the new value to the State Store.

use crate::model::AgentStatus;

/// Check whether `from -> to` is a legal edge in the agent status graph.
pub fn is_valid_transition(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;

    if to == Error {
        // Reachable from any non-terminal state.
        return !from.is_terminal();
    }

    matches!(
        (from, to),
        (Spawning, Idle)
            | (Idle, Working)
            | (Working, Idle)
            | (Working, Blocked)
            | (Working, WaitingReview)
            | (Blocked, Working)
            | (WaitingReview, Working)
            | (Working, Done)
            | (Idle, Done)
            | (Blocked, Done)
            | (WaitingReview, Done)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentStatus::*;

    #[test]
    fn spawning_to_idle_is_valid() {
        assert!(is_valid_transition(Spawning, Idle));
    }

    #[test]
    fn error_reachable_from_any_nonterminal_state() {
        for from in [Spawning, Idle, Working, Blocked, WaitingReview] {
            assert!(is_valid_transition(from, Error), "{from:?} -> Error should be valid");
        }
    }

    #[test]
    fn error_not_reachable_from_terminal_states() {
        assert!(!is_valid_transition(Done, Error));
        assert!(!is_valid_transition(Error, Error));
    }

    #[test]
    fn done_not_reachable_from_spawning_directly() {
        assert!(!is_valid_transition(Spawning, Done));
    }

    #[test]
    fn working_can_return_to_idle() {
        assert!(is_valid_transition(Working, Idle));
    }
}
