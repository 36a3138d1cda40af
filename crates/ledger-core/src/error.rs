//! Violation taxonomy (§7) and the crate's typed internal errors.
//!
//! A `Violation` is never thrown across the apply pipeline's transaction
//! boundary — it is collected and returned as part of an `ApplyOutcome`
//! after any in-flight transaction has rolled back. `BLOCK` severity fails
//! the apply; `WARN`/`INFO` accompany a successful one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::enum_variant_names)]
pub enum ViolationCode {
    // Structural
    InvalidTransition,
    UnsupportedChangeType,
    MissingRequiredFields,
    // Concurrency
    ConcurrentModification,
    // Integrity
    DecisionTampered,
    DecisionPublicHashMismatch,
    SnapshotStateHashMismatch,
    SnapshotProvenanceTailMismatch,
    AnchorHashMismatch,
    AnchorPrevHashMismatch,
    ProvenanceTampered,
    ProvPrevHashMismatch,
    ProvMissingParent,
    SignatureTampered,
    PlsShieldTampered,
    // Gate
    ImmutableWindowLocked,
    GateApproveRequiresSimulation,
    GateApproveRequiresArtifacts,
    GateApproveRequiresRole,
    GateHighRiskRequiresRole,
    GateRejectRequiresRole,
    ConsequenceBlocked,
    // Signer / liability
    SignerIdRequired,
    SignerStateHashRequired,
    SignerSignatureRequired,
    SignerStateHashMismatch,
    SignerActorMismatch,
    SignerUnknown,
    SignerSignatureInvalid,
    PlsOwnerRequired,
    PlsApproverMismatch,
    PlsStateHashMismatch,
    // Trust boundary
    TbOriginZoneNotAllowed,
    TbOriginZoneDenied,
    TbEvidenceRequired,
    TbEvidenceTrustTooLow,
    TbAttestationRequired,
    TbAgentCannotFinalize,
    TbFederationProofRequired,
    // RBAC
    RbacRoleRequired,
    AgentPrivilegedDenied,
    PolicyDenyDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub severity: Severity,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl Violation {
    pub fn block(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Block,
            message: message.into(),
            details: None,
        }
    }

    pub fn warn(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Warn,
            message: message.into(),
            details: None,
        }
    }

    pub fn info(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Info,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_block(&self) -> bool {
        self.severity == Severity::Block
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error(transparent)]
    Storage(#[from] ledger_store::StorageError),
    #[error(transparent)]
    Encoding(#[from] ledger_enc::EncodingError),
    #[error(transparent)]
    Merkle(#[from] ledger_merkle::MerkleError),
    #[error("event seq {seq} not found for decision {decision_id}")]
    EventNotFound { decision_id: String, seq: u64 },
    #[error("hash chain broken at seq {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("invalid transition: {event_type} from state {from_state:?}")]
    InvalidTransition { event_type: String, from_state: String },
    #[error(transparent)]
    Encoding(#[from] ledger_enc::EncodingError),
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate blocked: {0:?}")]
    Blocked(Vec<Violation>),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] EventStoreError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Merkle(#[from] ledger_merkle::MerkleError),
    #[error("internal: {0}")]
    Internal(String),
}
