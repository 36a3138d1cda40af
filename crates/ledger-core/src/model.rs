//! The persisted data model (§3): `Decision`, `Event`, `EventRecord`,
//! `Snapshot`, `Anchor`, the receipt/signature rows, and `ProvenanceNode`.
//!
//! Event payloads are kept as a `serde_json::Map` rather than one Rust
//! variant per event type with its own field list. The replay engine and
//! gates only ever consult a handful of well-known keys per event type
//! (`risk_score`, `signer_id`, `owner_id`, ...), the same way the rest of
//! the Decision (`meta`, `artifacts`) is an open map — closing the payload
//! over 23 one-off structs would duplicate the event-type list without
//! adding type safety the reader code actually uses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionState {
    Draft,
    Validated,
    Simulated,
    Approved,
    Rejected,
    Published,
    Dispute,
}

impl fmt::Display for DecisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "DRAFT",
            Self::Validated => "VALIDATED",
            Self::Simulated => "SIMULATED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Published => "PUBLISHED",
            Self::Dispute => "DISPUTE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    Human,
    Service,
    System,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Validate,
    Simulate,
    Explain,
    Approve,
    Reject,
    AttachArtifacts,
    Sign,
    IngestRecords,
    LinkDecisions,
    AttestExternal,
    EnterDispute,
    ExitDispute,
    AddObligation,
    FulfillObligation,
    WaiveObligation,
    AttestExecution,
    SetRisk,
    AddBlastRadius,
    AddImpactedSystem,
    SetRollbackPlan,
    AssignResponsibility,
    AcceptRisk,
    Publish,
    Lock,
    CommitCounterfactual,
}

impl EventType {
    /// Events for which the replay engine advances `Decision.state`.
    pub fn is_state_mutating(self) -> bool {
        matches!(
            self,
            Self::Validate
                | Self::Simulate
                | Self::Approve
                | Self::Reject
                | Self::Publish
                | Self::EnterDispute
                | Self::ExitDispute
        )
    }

    /// Finalize-class events: privileged (§4.9 RBAC), subject to signer
    /// binding and liability-shield gates.
    pub fn is_finalize(self) -> bool {
        matches!(self, Self::Approve | Self::Reject | Self::Publish)
    }

    pub fn is_privileged(self) -> bool {
        self.is_finalize() || matches!(self, Self::CommitCounterfactual)
    }
}

/// A caller-supplied event, prior to being assigned a `seq`/hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub actor_id: String,
    pub actor_type: Option<ActorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Type-specific fields, e.g. `risk_score`, `signer_id`,
    /// `signer_state_hash`, `owner_id`, `approver_id`, `obligation_id`.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, actor_id: impl Into<String>) -> Self {
        Self {
            event_type,
            actor_id: actor_id.into(),
            actor_type: None,
            meta: None,
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = Some(actor_type);
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key)?.as_str()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key)?.as_str()
    }

    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key)?.as_f64()
    }
}

/// A persisted, hashed, chained event (§3 `EventRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub decision_id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: Event,
    pub idempotency_key: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// The fields that feed `EventRecord.hash` (§6: event hash).
#[derive(Serialize)]
pub(crate) struct EventHashInput<'a> {
    pub decision_id: &'a str,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub idempotency_key: Option<&'a str>,
    pub prev_hash: Option<&'a str>,
    pub event: &'a Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub event_type: EventType,
    pub actor_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureDescriptor {
    pub event_seq: u64,
    pub signer_id: String,
    pub alg: String,
    pub verified: bool,
}

/// Root entity (§3 `Decision`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub state: DecisionState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub artifacts: serde_json::Value,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub accountability: serde_json::Value,
    #[serde(default)]
    pub signatures: Vec<SignatureDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_decision_id: Option<String>,
    /// State the decision was in before entering `DISPUTE`, restored on
    /// `EXIT_DISPUTE`. Not part of the hash-family strip list's concern —
    /// it is internal bookkeeping the strip step already removes via the
    /// `*_helper` pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_dispute_state_helper: Option<DecisionState>,
}

impl Decision {
    pub fn new_draft(decision_id: impl Into<String>, meta: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            decision_id: decision_id.into(),
            state: DecisionState::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
            meta,
            artifacts: serde_json::json!({}),
            history: Vec::new(),
            accountability: serde_json::json!({}),
            signatures: Vec::new(),
            parent_decision_id: None,
            pre_dispute_state_helper: None,
        }
    }
}

/// Materialized state at `up_to_seq` (§3 `Snapshot`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub decision_id: String,
    pub up_to_seq: u64,
    pub decision: Decision,
    pub created_at: DateTime<Utc>,
    pub checkpoint_hash: Option<String>,
    pub state_hash: String,
    pub provenance_tail_hash: Option<String>,
    pub root_hash: Option<String>,
}

/// Cross-decision integrity spine entry (§3 `Anchor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub decision_id: String,
    pub snapshot_up_to_seq: u64,
    pub checkpoint_hash: Option<String>,
    pub root_hash: Option<String>,
    pub state_hash: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

#[derive(Serialize)]
pub(crate) struct AnchorHashInput<'a> {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub decision_id: &'a str,
    pub snapshot_up_to_seq: u64,
    pub checkpoint_hash: Option<&'a str>,
    pub root_hash: Option<&'a str>,
    pub state_hash: Option<&'a str>,
    pub prev_hash: Option<&'a str>,
}

/// Per-event liability attestation (§3 `LiabilityReceipt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiabilityReceipt {
    pub decision_id: String,
    pub event_seq: u64,
    pub receipt_id: uuid::Uuid,
    pub kind: String,
    pub receipt_hash: String,
    pub event_type: EventType,
    pub actor_id: String,
    pub actor_type: Option<ActorType>,
    pub trust_score: f64,
    pub trust_reason: String,
    pub state_before_hash: String,
    pub state_after_hash: String,
    pub public_state_before_hash: String,
    pub public_state_after_hash: String,
    pub obligations_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub(crate) struct ReceiptHashInput<'a> {
    pub decision_id: &'a str,
    pub event_seq: u64,
    pub receipt_id: uuid::Uuid,
    pub kind: &'a str,
    pub event_type: EventType,
    pub actor_id: &'a str,
    pub actor_type: Option<ActorType>,
    pub trust_score: f64,
    pub trust_reason: &'a str,
    pub state_before_hash: &'a str,
    pub state_after_hash: &'a str,
    pub public_state_before_hash: &'a str,
    pub public_state_after_hash: &'a str,
    pub obligations_hash: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Per-finalize-event signature row (§3 `RiskLiabilitySignature`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLiabilitySignature {
    pub decision_id: String,
    pub event_seq: u64,
    pub receipt_hash: String,
    pub payload: serde_json::Value,
    pub signature_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Liability-shield row for approvals requiring one (§3 `PLSShield`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlsShield {
    pub decision_id: String,
    pub event_seq: u64,
    pub event_type: EventType,
    pub owner_id: String,
    pub approver_id: String,
    pub signer_state_hash: String,
    pub payload_json: serde_json::Value,
    pub shield_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Hash-linked node inside `decision.artifacts.provenance.nodes` (§3
/// `ProvenanceNode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceNode {
    pub node_id: uuid::Uuid,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub decision_id: String,
    pub event_type: EventType,
    pub actor_id: String,
    pub event_hash: String,
    pub prev_node_id: Option<uuid::Uuid>,
    pub prev_node_hash: Option<String>,
    pub state_before_hash: String,
    pub state_after_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub node_hash: String,
}

#[derive(Serialize)]
pub(crate) struct ProvenanceHashInput<'a> {
    pub node_id: uuid::Uuid,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub decision_id: &'a str,
    pub event_type: EventType,
    pub actor_id: &'a str,
    pub event_hash: &'a str,
    pub prev_node_id: Option<uuid::Uuid>,
    pub prev_node_hash: Option<&'a str>,
    pub state_before_hash: &'a str,
    pub state_after_hash: &'a str,
    pub meta: Option<&'a serde_json::Value>,
}
