//! RBAC / policy engine (§4.9, §7 RBAC taxonomy).

use crate::config::RbacPolicy;
use crate::error::{Violation, ViolationCode};
use crate::model::{ActorType, Event};

pub fn check(event: &Event, policy: &RbacPolicy, actor_roles: &[String]) -> Vec<Violation> {
    if !event.event_type.is_privileged() {
        return Vec::new();
    }

    if event.actor_type == Some(ActorType::System) {
        return Vec::new();
    }

    if event.actor_type == Some(ActorType::Agent) {
        return vec![Violation::block(
            ViolationCode::AgentPrivilegedDenied,
            "agent actors cannot execute privileged events",
        )];
    }

    match policy.privileged_roles.get(&event.event_type) {
        Some(required) if !required.is_empty() => {
            if required.iter().any(|r| actor_roles.contains(r)) {
                Vec::new()
            } else {
                vec![Violation::block(
                    ViolationCode::RbacRoleRequired,
                    format!("event requires one of roles {required:?}"),
                )]
            }
        }
        _ if policy.default_deny => vec![Violation::block(
            ViolationCode::PolicyDenyDefault,
            "no role policy configured for this privileged event and default_deny is set",
        )],
        _ => Vec::new(),
    }
}
