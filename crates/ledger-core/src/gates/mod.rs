//! Immutability & gate engine (C9).
//!
//! Each sub-gate is a plain function returning the violations it finds;
//! `run_gates` runs them in the order §4.7 stage 6 lists and short-circuits
//! nothing itself — callers filter for `is_block()` after collecting all of
//! them, the same way `replay::apply_one` accumulates violations.

pub mod approval;
pub mod consequence;
pub mod immutability;
pub mod rbac;
pub mod trust_boundary;

pub use consequence::{consequence_preview, ConsequencePreview};

use crate::config::LedgerConfig;
use crate::error::Violation;
use crate::model::{Decision, Event};
use chrono::{DateTime, Utc};

pub struct GateContext<'a> {
    pub config: &'a LedgerConfig,
    pub actor_roles: &'a [String],
    pub origin_zone: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Run every non-signer gate (signer binding and liability shield are run
/// separately by the pipeline since they need a directory/receipt).
pub fn run_gates(head_before: &Decision, event: &Event, ctx: &GateContext) -> Vec<Violation> {
    let mut violations = Vec::new();
    violations.extend(immutability::check(head_before, event, ctx.config, ctx.now));
    violations.extend(approval::check(head_before, event, &ctx.config.approval, ctx.actor_roles));
    violations.extend(rbac::check(event, &ctx.config.rbac, ctx.actor_roles));
    violations.extend(trust_boundary::check(
        event,
        &ctx.config.trust_boundary,
        ctx.origin_zone,
    ));
    violations
}
