//! Approval gate policy (§4.9): simulation/artifact prerequisites and role
//! requirements for `APPROVE`/`REJECT`.

use crate::config::ApprovalGatePolicy;
use crate::error::{Violation, ViolationCode};
use crate::model::{Decision, DecisionState, Event, EventType};

fn has_role(actor_roles: &[String], required: &Option<String>) -> bool {
    match required {
        None => true,
        Some(role) => actor_roles.iter().any(|r| r == role),
    }
}

fn risk_score(decision: &Decision, event: &Event) -> Option<f64> {
    event
        .payload_f64("risk_score")
        .or_else(|| decision.artifacts.get("risk")?.get("score")?.as_f64())
}

pub fn check(decision: &Decision, event: &Event, policy: &ApprovalGatePolicy, actor_roles: &[String]) -> Vec<Violation> {
    let mut violations = Vec::new();
    match event.event_type {
        EventType::Approve => {
            if policy.require_simulated_for_approve && decision.state != DecisionState::Simulated {
                violations.push(Violation::block(
                    ViolationCode::GateApproveRequiresSimulation,
                    "APPROVE requires the decision to be in SIMULATED",
                ));
            }
            if policy.require_artifacts_for_approve
                && (!decision.artifacts.is_object() || decision.artifacts.as_object().unwrap().is_empty())
            {
                violations.push(Violation::block(
                    ViolationCode::GateApproveRequiresArtifacts,
                    "APPROVE requires artifacts to be attached first",
                ));
            }
            if !has_role(actor_roles, &policy.required_role_approve) {
                violations.push(Violation::block(
                    ViolationCode::GateApproveRequiresRole,
                    format!("actor lacks required approval role {:?}", policy.required_role_approve),
                ));
            }
            if let Some(score) = risk_score(decision, event) {
                if score >= policy.high_risk_threshold && !has_role(actor_roles, &policy.required_role_high_risk) {
                    violations.push(Violation::block(
                        ViolationCode::GateHighRiskRequiresRole,
                        format!("risk_score {score} >= {} requires an elevated role", policy.high_risk_threshold),
                    ));
                }
            }
        }
        EventType::Reject => {
            if !has_role(actor_roles, &policy.required_role_reject) {
                violations.push(Violation::block(
                    ViolationCode::GateRejectRequiresRole,
                    format!("actor lacks required rejection role {:?}", policy.required_role_reject),
                ));
            }
        }
        _ => {}
    }
    violations
}
