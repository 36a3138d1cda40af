//! Domain model, replay engine, gates, apply pipeline, and storage traits
//! for the tamper-evident decision ledger.

pub mod config;
pub mod error;
pub mod fsm;
pub mod gates;
pub mod model;
pub mod pipeline;
pub mod provenance;
pub mod receipts;
pub mod replay;
pub mod signer;
pub mod state_hash;
pub mod store;

pub use config::LedgerConfig;
pub use error::{Severity, Violation, ViolationCode};
pub use model::{
    ActorType, Anchor, Decision, DecisionState, Event, EventRecord, EventType, LiabilityReceipt,
    PlsShield, ProvenanceNode, RiskLiabilitySignature, Snapshot,
};
pub use pipeline::{apply_event, ApplyInput, ApplyOutcome};
pub use store::{ChainVerification, DecisionStore, MemoryDecisionStore};
