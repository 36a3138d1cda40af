//! Decision state machine (§6 transition table).
//!
//! ```text
//! DRAFT     --VALIDATE-->      VALIDATED
//! VALIDATED --SIMULATE-->      SIMULATED
//! SIMULATED --APPROVE-->       APPROVED
//! *         --REJECT-->        REJECTED
//! APPROVED  --PUBLISH-->       PUBLISHED
//! *         --ENTER_DISPUTE--> DISPUTE
//! DISPUTE   --EXIT_DISPUTE-->  <prior state>
//! ```
//!
//! Every other event type leaves `state` untouched. `EXIT_DISPUTE` restores
//! whatever state the decision was in immediately before `ENTER_DISPUTE`;
//! that state is carried on the Decision itself (`pre_dispute_state_helper`)
//! because replay is a pure function over `(Decision, [Event])` with no
//! side channel to remember it.

use crate::error::ReplayError;
use crate::model::{DecisionState, EventType};
use std::collections::HashSet;

/// A single state's worth of FSM output: the new `state` plus the updated
/// dispute-recovery slot.
pub struct TransitionResult {
    pub state: DecisionState,
    pub pre_dispute_state: Option<DecisionState>,
}

/// Apply one event's FSM transition.
///
/// `locked_state_allowlist` lets the immutability-window gate (§4.9) permit
/// specific event types to pass through a locked terminal state without
/// tripping `INVALID_TRANSITION` — those events still don't mutate `state`.
pub fn transition(
    current: DecisionState,
    pre_dispute_state: Option<DecisionState>,
    event_type: EventType,
    locked_state_allowlist: &HashSet<EventType>,
) -> Result<TransitionResult, ReplayError> {
    use DecisionState::*;
    use EventType::*;

    if !event_type.is_state_mutating() {
        return Ok(TransitionResult {
            state: current,
            pre_dispute_state,
        });
    }

    let result = match (current, event_type) {
        (Draft, Validate) => Some(Validated),
        (Validated, Simulate) => Some(Simulated),
        (Simulated, Approve) => Some(Approved),
        (_, Reject) => Some(Rejected),
        (Approved, Publish) => Some(Published),
        (_, EnterDispute) => Some(Dispute),
        (Dispute, ExitDispute) => pre_dispute_state.or(Some(Draft)),
        _ => None,
    };

    match result {
        Some(next) if event_type == EnterDispute => Ok(TransitionResult {
            state: next,
            pre_dispute_state: Some(current),
        }),
        Some(next) if current == Dispute && event_type == ExitDispute => Ok(TransitionResult {
            state: next,
            pre_dispute_state: None,
        }),
        Some(next) => Ok(TransitionResult {
            state: next,
            pre_dispute_state,
        }),
        None if locked_state_allowlist.contains(&event_type) => Ok(TransitionResult {
            state: current,
            pre_dispute_state,
        }),
        None => Err(ReplayError::InvalidTransition {
            event_type: format!("{event_type:?}"),
            from_state: format!("{current}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DecisionState::*;
    use EventType::*;

    fn t(current: DecisionState, pre: Option<DecisionState>, ev: EventType) -> Result<TransitionResult, ReplayError> {
        transition(current, pre, ev, &HashSet::new())
    }

    #[test]
    fn happy_path_validate_simulate_approve_publish() {
        let r = t(Draft, None, Validate).unwrap();
        assert_eq!(r.state, Validated);
        let r = t(Validated, None, Simulate).unwrap();
        assert_eq!(r.state, Simulated);
        let r = t(Simulated, None, Approve).unwrap();
        assert_eq!(r.state, Approved);
        let r = t(Approved, None, Publish).unwrap();
        assert_eq!(r.state, Published);
    }

    #[test]
    fn reject_from_any_state() {
        for s in [Draft, Validated, Simulated, Approved] {
            assert_eq!(t(s, None, Reject).unwrap().state, Rejected);
        }
    }

    #[test]
    fn approve_without_simulate_is_invalid() {
        assert!(t(Validated, None, Approve).is_err());
    }

    #[test]
    fn dispute_round_trip_restores_prior_state() {
        let entered = t(Simulated, None, EnterDispute).unwrap();
        assert_eq!(entered.state, Dispute);
        assert_eq!(entered.pre_dispute_state, Some(Simulated));
        let exited = t(Dispute, entered.pre_dispute_state, ExitDispute).unwrap();
        assert_eq!(exited.state, Simulated);
        assert_eq!(exited.pre_dispute_state, None);
    }

    #[test]
    fn non_mutating_event_leaves_state_untouched() {
        let r = t(Simulated, None, AttachArtifacts).unwrap();
        assert_eq!(r.state, Simulated);
    }

    #[test]
    fn locked_allowlist_bypasses_invalid_transition() {
        let mut allow = HashSet::new();
        allow.insert(Validate);
        let r = transition(Approved, None, Validate, &allow).unwrap();
        assert_eq!(r.state, Approved);
    }

    #[test]
    fn invalid_transition_without_allowlist_errs() {
        assert!(t(Approved, None, Validate).is_err());
    }
}
