//! Ledger configuration (ambient stack): layered defaults + environment
//! overrides via the `config` crate, the same layering style used
//! throughout this workspace's services.

use crate::model::{DecisionState, EventType};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImmutabilityPolicy {
    pub enabled: bool,
    pub locked_states: Vec<DecisionState>,
    pub lock_after_seconds: i64,
    pub allow_event_types: Vec<EventType>,
}

impl Default for ImmutabilityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            locked_states: vec![DecisionState::Approved, DecisionState::Rejected],
            lock_after_seconds: 0,
            allow_event_types: vec![
                EventType::AttachArtifacts,
                EventType::AttestExecution,
                EventType::AddObligation,
                EventType::FulfillObligation,
                EventType::WaiveObligation,
                EventType::EnterDispute,
                EventType::ExitDispute,
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalGatePolicy {
    pub require_simulated_for_approve: bool,
    pub require_artifacts_for_approve: bool,
    pub required_role_approve: Option<String>,
    pub required_role_reject: Option<String>,
    pub high_risk_threshold: f64,
    pub required_role_high_risk: Option<String>,
}

impl Default for ApprovalGatePolicy {
    fn default() -> Self {
        Self {
            require_simulated_for_approve: true,
            require_artifacts_for_approve: false,
            required_role_approve: None,
            required_role_reject: None,
            high_risk_threshold: 0.8,
            required_role_high_risk: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrustBoundaryPolicy {
    pub allowed_origin_zones: HashMap<EventType, Vec<String>>,
    pub denied_origin_zones: HashMap<EventType, Vec<String>>,
    pub min_evidence_trust: f64,
    pub require_attestation_event_types: Vec<EventType>,
    pub require_federation_proof_event_types: Vec<EventType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RbacPolicy {
    pub privileged_roles: HashMap<EventType, Vec<String>>,
    pub default_deny: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub every_n_events: u64,
    pub keep_last_n_snapshots: usize,
    pub prune_events_up_to_latest_snapshot: bool,
    pub anchoring_enabled: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_n_events: 50,
            keep_last_n_snapshots: 5,
            prune_events_up_to_latest_snapshot: false,
            anchoring_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiptPolicy {
    pub require_risk_liability_signature: bool,
    pub require_liability_shield_for_events: Vec<EventType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub immutability: ImmutabilityPolicy,
    pub approval: ApprovalGatePolicy,
    pub trust_boundary: TrustBoundaryPolicy,
    pub rbac: RbacPolicy,
    pub snapshot: SnapshotPolicy,
    pub receipts: ReceiptPolicy,
    pub require_signer_identity_binding: bool,
    pub block_on_consequence_block: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            immutability: ImmutabilityPolicy::default(),
            approval: ApprovalGatePolicy::default(),
            trust_boundary: TrustBoundaryPolicy::default(),
            rbac: RbacPolicy::default(),
            snapshot: SnapshotPolicy::default(),
            receipts: ReceiptPolicy::default(),
            require_signer_identity_binding: false,
            block_on_consequence_block: false,
        }
    }
}

impl LedgerConfig {
    /// Event types allowed to bypass the immutability window, as a set for
    /// `fsm::transition`'s `locked_state_allowlist` parameter.
    pub fn immutability_allowlist(&self) -> HashSet<EventType> {
        self.immutability.allow_event_types.iter().copied().collect()
    }

    /// Load defaults overridden by a config file (if present) and `LEDGER_*`
    /// environment variables, e.g. `LEDGER__APPROVAL__HIGH_RISK_THRESHOLD`.
    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("LEDGER")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}
