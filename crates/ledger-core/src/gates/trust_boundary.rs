//! Trust boundary gate (§4.9): origin zone allow/deny lists, evidence trust
//! minimums, attestation and federation-proof requirements.

use crate::config::TrustBoundaryPolicy;
use crate::error::{Violation, ViolationCode};
use crate::model::{ActorType, Event};

pub fn check(event: &Event, policy: &TrustBoundaryPolicy, origin_zone: Option<&str>) -> Vec<Violation> {
    let mut violations = Vec::new();

    if event.actor_type == Some(ActorType::Agent) && event.event_type.is_finalize() {
        violations.push(Violation::block(
            ViolationCode::TbAgentCannotFinalize,
            "agent actors cannot execute APPROVE, REJECT, or PUBLISH",
        ));
    }

    if let Some(zone) = origin_zone {
        if let Some(denied) = policy.denied_origin_zones.get(&event.event_type) {
            if denied.iter().any(|z| z == zone) {
                violations.push(Violation::block(
                    ViolationCode::TbOriginZoneDenied,
                    format!("origin zone {zone} is denied for this event type"),
                ));
            }
        }
        if let Some(allowed) = policy.allowed_origin_zones.get(&event.event_type) {
            if !allowed.is_empty() && !allowed.iter().any(|z| z == zone) {
                violations.push(Violation::block(
                    ViolationCode::TbOriginZoneNotAllowed,
                    format!("origin zone {zone} is not in the allowlist for this event type"),
                ));
            }
        }
    }

    if event.event_type == crate::model::EventType::AttestExternal {
        match event.payload_f64("evidence_trust") {
            None => violations.push(Violation::block(
                ViolationCode::TbEvidenceRequired,
                "ATTEST_EXTERNAL requires payload.evidence_trust",
            )),
            Some(trust) if trust < policy.min_evidence_trust => {
                violations.push(Violation::block(
                    ViolationCode::TbEvidenceTrustTooLow,
                    format!("evidence_trust {trust} is below the minimum {}", policy.min_evidence_trust),
                ));
            }
            _ => {}
        }
    }

    if policy.require_attestation_event_types.contains(&event.event_type)
        && event.payload.get("attestation").is_none()
        && event.meta_str("attestation").is_none()
    {
        violations.push(Violation::block(
            ViolationCode::TbAttestationRequired,
            "this event type requires an attestation",
        ));
    }

    if policy.require_federation_proof_event_types.contains(&event.event_type)
        && event.payload.get("federation_proof").is_none()
    {
        violations.push(Violation::block(
            ViolationCode::TbFederationProofRequired,
            "this event type requires a federation proof bundle",
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    #[test]
    fn agent_cannot_approve() {
        let policy = TrustBoundaryPolicy::default();
        let event = Event::new(EventType::Approve, "bot").with_actor_type(ActorType::Agent);
        let violations = check(&event, &policy, None);
        assert!(violations.iter().any(|v| v.code == ViolationCode::TbAgentCannotFinalize));
    }

    #[test]
    fn denied_zone_blocks() {
        let mut policy = TrustBoundaryPolicy::default();
        policy
            .denied_origin_zones
            .insert(EventType::Approve, vec!["external".to_string()]);
        let event = Event::new(EventType::Approve, "alice");
        let violations = check(&event, &policy, Some("external"));
        assert!(violations.iter().any(|v| v.code == ViolationCode::TbOriginZoneDenied));
    }

    #[test]
    fn allowlist_rejects_unlisted_zone() {
        let mut policy = TrustBoundaryPolicy::default();
        policy
            .allowed_origin_zones
            .insert(EventType::Approve, vec!["internal".to_string()]);
        let event = Event::new(EventType::Approve, "alice");
        assert!(!check(&event, &policy, Some("external")).is_empty());
        assert!(check(&event, &policy, Some("internal")).is_empty());
    }

    #[test]
    fn attestation_required_event_type_without_attestation_blocks() {
        let mut policy = TrustBoundaryPolicy::default();
        policy.require_attestation_event_types.push(EventType::Publish);
        let event = Event::new(EventType::Publish, "alice");
        let violations = check(&event, &policy, None);
        assert!(violations.iter().any(|v| v.code == ViolationCode::TbAttestationRequired));
    }

    #[test]
    fn low_evidence_trust_is_blocked() {
        let mut policy = TrustBoundaryPolicy::default();
        policy.min_evidence_trust = 0.5;
        let event = Event::new(EventType::AttestExternal, "alice")
            .with_payload("evidence_trust", serde_json::json!(0.2));
        let violations = check(&event, &policy, None);
        assert!(violations.iter().any(|v| v.code == ViolationCode::TbEvidenceTrustTooLow));
    }
}
