//! Replay engine (C6): the pure function `(Decision, [Event]) -> Decision`.
//!
//! `apply_one` is the single-event step the apply pipeline (C7) reuses both
//! for the delta-replay stage and for the post-append re-replay stage.
//! `replay` folds a whole event list over a base decision. Both are pure:
//! no I/O, no randomness, no wall-clock reads — the only input that can
//! vary `at`/`updated_at` is the injected `now` closure, which is what
//! makes replay byte-identical across repeated calls with the same inputs
//! (§8 property 2).

use crate::error::{ReplayError, Violation, ViolationCode};
use crate::fsm;
use crate::model::{Decision, Event, EventType, HistoryEntry};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Deterministic clock plus the immutability window's event-type allowlist,
/// threaded through every replay call.
#[derive(Clone)]
pub struct ReplayOptions {
    pub now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    pub locked_state_allowlist: HashSet<EventType>,
}

impl ReplayOptions {
    pub fn with_fixed_clock(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(move || now),
            locked_state_allowlist: HashSet::new(),
        }
    }
}

/// Outcome of folding one event over a decision.
pub struct StepOutcome {
    pub decision: Decision,
    pub violations: Vec<Violation>,
}

fn default_policies(event: &Event) -> Vec<Violation> {
    let mut violations = Vec::new();
    if event.actor_id.trim().is_empty() {
        violations.push(Violation::block(
            ViolationCode::MissingRequiredFields,
            "event.actor_id is required",
        ));
    }
    violations
}

/// Shallow merge of `patch` into `target`, recursing into nested objects.
/// Arrays and scalars in `patch` replace the corresponding key in `target`.
fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let (serde_json::Value::Object(t), serde_json::Value::Object(p)) = (&mut *target, patch) {
        for (key, value) in p {
            match t.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    merge_json(existing, value);
                }
                _ => {
                    t.insert(key.clone(), value.clone());
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn artifacts_obj(decision: &mut Decision) -> &mut serde_json::Map<String, serde_json::Value> {
    if !decision.artifacts.is_object() {
        decision.artifacts = serde_json::json!({});
    }
    decision.artifacts.as_object_mut().unwrap()
}

fn push_into_array(decision: &mut Decision, path: &str, item: serde_json::Value) {
    let artifacts = artifacts_obj(decision);
    let entry = artifacts
        .entry(path.to_string())
        .or_insert_with(|| serde_json::json!([]));
    if let serde_json::Value::Array(arr) = entry {
        arr.push(item);
    }
}

/// Apply the event-type-specific artifact merge (§4.6 step 3). Pure FSM
/// events (`VALIDATE`/`SIMULATE`/`APPROVE`/`REJECT`/`PUBLISH`, dispute
/// entry/exit) and `EXPLAIN`/`COMMIT_COUNTERFACTUAL`/`LOCK` carry their
/// payload for gates and receipts to read directly off the `Event` and
/// don't need a persisted artifacts copy.
fn merge_event_payload(decision: &mut Decision, event: &Event) {
    let payload = serde_json::Value::Object(event.payload.clone());
    match event.event_type {
        EventType::AttachArtifacts => merge_json(&mut decision.artifacts, &payload),
        EventType::Sign => {
            decision.signatures.push(crate::model::SignatureDescriptor {
                event_seq: decision.version + 1,
                signer_id: event.meta_str("signer_id").unwrap_or(&event.actor_id).to_string(),
                alg: event.payload_str("alg").unwrap_or("ed25519").to_string(),
                verified: false,
            });
        }
        EventType::IngestRecords => push_into_array(decision, "records", payload),
        EventType::LinkDecisions => push_into_array(decision, "links", payload),
        EventType::AttestExternal => push_into_array(decision, "attestations", payload),
        EventType::AttestExecution => {
            let artifacts = artifacts_obj(decision);
            let execution = artifacts
                .entry("execution".to_string())
                .or_insert_with(|| serde_json::json!({}));
            if let serde_json::Value::Object(exec) = execution {
                let attestations = exec
                    .entry("attestations".to_string())
                    .or_insert_with(|| serde_json::json!([]));
                if let serde_json::Value::Array(arr) = attestations {
                    arr.push(payload);
                }
            }
        }
        EventType::SetRisk => merge_json(&mut decision.artifacts, &serde_json::json!({ "risk": payload })),
        EventType::AddBlastRadius => push_into_array(decision, "blast_radius", payload),
        EventType::AddImpactedSystem => push_into_array(decision, "impacted_systems", payload),
        EventType::SetRollbackPlan => {
            merge_json(&mut decision.artifacts, &serde_json::json!({ "rollback_plan": payload }))
        }
        EventType::AssignResponsibility => {
            merge_json(&mut decision.artifacts, &serde_json::json!({ "responsibility": payload }))
        }
        EventType::AcceptRisk => {
            merge_json(&mut decision.artifacts, &serde_json::json!({ "risk_accepted": true }))
        }
        EventType::AddObligation | EventType::FulfillObligation | EventType::WaiveObligation => {
            let artifacts = artifacts_obj(decision);
            let execution = artifacts
                .entry("execution".to_string())
                .or_insert_with(|| serde_json::json!({}));
            if let serde_json::Value::Object(exec) = execution {
                let obligations = exec
                    .entry("obligations".to_string())
                    .or_insert_with(|| serde_json::json!([]));
                if let serde_json::Value::Array(arr) = obligations {
                    match event.event_type {
                        EventType::AddObligation => arr.push(payload),
                        EventType::FulfillObligation | EventType::WaiveObligation => {
                            let target_id = event.payload_str("obligation_id").map(str::to_string);
                            let status = if event.event_type == EventType::FulfillObligation {
                                "fulfilled"
                            } else {
                                "waived"
                            };
                            for item in arr.iter_mut() {
                                if item.get("obligation_id").and_then(|v| v.as_str()).map(str::to_string)
                                    == target_id
                                {
                                    if let serde_json::Value::Object(obj) = item {
                                        obj.insert("status".to_string(), serde_json::json!(status));
                                    }
                                }
                            }
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
        _ => {}
    }
}

/// Apply a single event to `decision` at an explicit timestamp. The apply
/// pipeline (C7) uses this directly during delta/re-replay so each
/// historical event stamps `updated_at`/`history[].at` with its own
/// persisted `at` rather than a single call-time clock reading.
pub fn apply_one_at(
    decision: &Decision,
    event: &Event,
    at: DateTime<Utc>,
    locked_state_allowlist: &HashSet<EventType>,
) -> StepOutcome {
    let mut violations = default_policies(event);
    if violations.iter().any(Violation::is_block) {
        return StepOutcome {
            decision: decision.clone(),
            violations,
        };
    }

    let transition = fsm::transition(
        decision.state,
        decision.pre_dispute_state_helper,
        event.event_type,
        locked_state_allowlist,
    );
    let transition = match transition {
        Ok(t) => t,
        Err(ReplayError::InvalidTransition { event_type, from_state }) => {
            violations.push(Violation::block(
                ViolationCode::InvalidTransition,
                format!("cannot apply {event_type} from state {from_state}"),
            ));
            return StepOutcome {
                decision: decision.clone(),
                violations,
            };
        }
        Err(_) => unreachable!("fsm::transition only returns InvalidTransition"),
    };

    let mut next = decision.clone();
    next.state = transition.state;
    next.pre_dispute_state_helper = transition.pre_dispute_state;
    next.version += 1;
    next.updated_at = at;
    next.history.push(HistoryEntry {
        seq: next.version,
        event_type: event.event_type,
        actor_id: event.actor_id.clone(),
        at,
    });
    merge_event_payload(&mut next, event);

    StepOutcome {
        decision: next,
        violations,
    }
}

/// Apply a single event to `decision`, producing a new decision plus any
/// violations. On a BLOCK violation the returned decision is the unmodified
/// input (the caller must not persist it).
pub fn apply_one(
    decision: &Decision,
    event: &Event,
    options: &ReplayOptions,
) -> StepOutcome {
    apply_one_at(decision, event, (options.now)(), &options.locked_state_allowlist)
}

pub enum ReplayResult {
    Ok {
        decision: Decision,
        warnings: Vec<Violation>,
    },
    Blocked {
        decision: Decision,
        violations: Vec<Violation>,
    },
}

/// Fold `events` over `base` in order, stopping at the first BLOCK.
pub fn replay(base: &Decision, events: &[Event], options: &ReplayOptions) -> ReplayResult {
    let mut current = base.clone();
    let mut warnings = Vec::new();
    for event in events {
        let outcome = apply_one(&current, event, options);
        if outcome.violations.iter().any(Violation::is_block) {
            return ReplayResult::Blocked {
                decision: current,
                violations: outcome.violations,
            };
        }
        warnings.extend(outcome.violations);
        current = outcome.decision;
    }
    ReplayResult::Ok {
        decision: current,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DecisionState;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn base() -> Decision {
        Decision::new_draft("dec1", serde_json::json!({"title": "t"}), now())
    }

    #[test]
    fn replay_validate_simulate_approve_is_deterministic() {
        let options = ReplayOptions::with_fixed_clock(now());
        let events = vec![
            Event::new(EventType::Validate, "alice"),
            Event::new(EventType::Simulate, "alice"),
            Event::new(EventType::Approve, "alice"),
        ];
        let r1 = match replay(&base(), &events, &options) {
            ReplayResult::Ok { decision, .. } => decision,
            ReplayResult::Blocked { .. } => panic!("expected ok"),
        };
        let r2 = match replay(&base(), &events, &options) {
            ReplayResult::Ok { decision, .. } => decision,
            ReplayResult::Blocked { .. } => panic!("expected ok"),
        };
        assert_eq!(r1.state, DecisionState::Approved);
        assert_eq!(
            ledger_enc::canonical_bytes(&r1).unwrap(),
            ledger_enc::canonical_bytes(&r2).unwrap()
        );
    }

    #[test]
    fn approve_without_simulate_blocks() {
        let options = ReplayOptions::with_fixed_clock(now());
        let events = vec![
            Event::new(EventType::Validate, "alice"),
            Event::new(EventType::Approve, "alice"),
        ];
        match replay(&base(), &events, &options) {
            ReplayResult::Blocked { violations, .. } => {
                assert!(violations.iter().any(|v| v.code == ViolationCode::InvalidTransition));
            }
            ReplayResult::Ok { .. } => panic!("expected block"),
        }
    }

    #[test]
    fn attach_artifacts_merges_into_decision() {
        let options = ReplayOptions::with_fixed_clock(now());
        let event = Event::new(EventType::AttachArtifacts, "alice")
            .with_payload("report_url", serde_json::json!("https://x"));
        let outcome = apply_one(&base(), &event, &options);
        assert_eq!(
            outcome.decision.artifacts.get("report_url").unwrap(),
            "https://x"
        );
    }

    #[test]
    fn obligation_lifecycle_tracks_status() {
        let options = ReplayOptions::with_fixed_clock(now());
        let add = Event::new(EventType::AddObligation, "alice")
            .with_payload("obligation_id", serde_json::json!("ob1"));
        let after_add = apply_one(&base(), &add, &options).decision;
        let fulfill = Event::new(EventType::FulfillObligation, "alice")
            .with_payload("obligation_id", serde_json::json!("ob1"));
        let after_fulfill = apply_one(&after_add, &fulfill, &options).decision;
        let obligations = after_fulfill.artifacts["execution"]["obligations"].as_array().unwrap();
        assert_eq!(obligations[0]["status"], "fulfilled");
    }

    #[test]
    fn empty_actor_id_is_blocked() {
        let options = ReplayOptions::with_fixed_clock(now());
        let event = Event::new(EventType::Validate, "");
        let outcome = apply_one(&base(), &event, &options);
        assert!(outcome.violations.iter().any(|v| v.is_block()));
    }

    #[test]
    fn version_and_history_advance_on_state_mutating_event() {
        let options = ReplayOptions::with_fixed_clock(now());
        let event = Event::new(EventType::Validate, "alice");
        let outcome = apply_one(&base(), &event, &options);
        assert_eq!(outcome.decision.version, 1);
        assert_eq!(outcome.decision.history.len(), 1);
    }
}
