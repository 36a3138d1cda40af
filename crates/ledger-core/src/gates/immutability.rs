//! Immutability window (§4.9): locks a decision against further mutation
//! once it reaches a terminal state, after a configurable grace period.

use crate::config::{ImmutabilityPolicy, LedgerConfig};
use crate::error::{Violation, ViolationCode};
use crate::model::{Decision, Event};
use chrono::{DateTime, Utc};

fn last_lock_transition_time(decision: &Decision) -> Option<DateTime<Utc>> {
    decision
        .history
        .iter()
        .rev()
        .find(|entry| entry.event_type.is_state_mutating())
        .map(|entry| entry.at)
}

pub fn check(decision: &Decision, event: &Event, config: &LedgerConfig, now: DateTime<Utc>) -> Vec<Violation> {
    check_policy(decision, event, &config.immutability, now)
}

fn check_policy(decision: &Decision, event: &Event, policy: &ImmutabilityPolicy, now: DateTime<Utc>) -> Vec<Violation> {
    if !policy.enabled {
        return Vec::new();
    }
    if !policy.locked_states.contains(&decision.state) {
        return Vec::new();
    }
    if policy.allow_event_types.contains(&event.event_type) {
        return Vec::new();
    }

    let Some(lock_time) = last_lock_transition_time(decision) else {
        // No recorded transition into this terminal state — fail closed
        // rather than silently letting the event through (§4.9).
        return vec![Violation::block(
            ViolationCode::ImmutableWindowLocked,
            "decision is in a locked terminal state with no recorded lock transition time",
        )];
    };

    let elapsed = (now - lock_time).num_seconds();
    if elapsed >= policy.lock_after_seconds {
        vec![Violation::block(
            ViolationCode::ImmutableWindowLocked,
            format!("decision has been locked in {:?} for {elapsed}s", decision.state),
        )]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecisionState, EventType, HistoryEntry};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn locked_decision() -> Decision {
        let mut d = Decision::new_draft("dec1", serde_json::json!({}), now());
        d.state = DecisionState::Approved;
        d.history.push(HistoryEntry {
            seq: 1,
            event_type: EventType::Approve,
            actor_id: "alice".into(),
            at: now(),
        });
        d
    }

    #[test]
    fn non_allowlisted_event_on_locked_state_blocks() {
        let policy = ImmutabilityPolicy::default();
        let decision = locked_decision();
        let event = Event::new(EventType::Validate, "alice");
        let violations = check_policy(&decision, &event, &policy, now());
        assert!(violations.iter().any(|v| v.code == ViolationCode::ImmutableWindowLocked));
    }

    #[test]
    fn allowlisted_event_passes() {
        let policy = ImmutabilityPolicy::default();
        let decision = locked_decision();
        let event = Event::new(EventType::AttachArtifacts, "alice");
        assert!(check_policy(&decision, &event, &policy, now()).is_empty());
    }

    #[test]
    fn grace_period_delays_the_lock() {
        let mut policy = ImmutabilityPolicy::default();
        policy.lock_after_seconds = 3600;
        let decision = locked_decision();
        let event = Event::new(EventType::Validate, "alice");
        assert!(check_policy(&decision, &event, &policy, now()).is_empty());
        let later = now() + chrono::Duration::seconds(3601);
        assert!(!check_policy(&decision, &event, &policy, later).is_empty());
    }

    #[test]
    fn unlocked_state_is_never_blocked() {
        let policy = ImmutabilityPolicy::default();
        let decision = Decision::new_draft("dec1", serde_json::json!({}), now());
        let event = Event::new(EventType::Validate, "alice");
        assert!(check_policy(&decision, &event, &policy, now()).is_empty());
    }
}
