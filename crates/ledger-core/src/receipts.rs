//! Receipt/signature ledger (C8): per-event liability receipts, finalize-
//! event risk-liability signatures, and PLS shield rows.

use crate::error::{EventStoreError, Violation, ViolationCode};
use crate::model::{
    ActorType, Decision, Event, EventType, LiabilityReceipt, PlsShield, ReceiptHashInput,
    RiskLiabilitySignature,
};
use chrono::{DateTime, Utc};
use ledger_enc::canonical_hash;
use serde::Serialize;

fn obligations_artifact(decision: &Decision) -> serde_json::Value {
    decision
        .artifacts
        .get("execution")
        .and_then(|e| e.get("obligations"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!([]))
}

/// `trust_score in [0,1]` plus a human-readable reason, from actor type,
/// event type, and whether this event carries a destabilizing state jump.
fn trust(event: &Event) -> (f64, String) {
    match event.actor_type {
        Some(ActorType::System) => (1.0, "system actor".to_string()),
        Some(ActorType::Human) => {
            if event.event_type.is_finalize() {
                (0.9, "human actor on a finalize event".to_string())
            } else {
                (0.85, "human actor".to_string())
            }
        }
        Some(ActorType::Service) => (0.7, "service actor".to_string()),
        Some(ActorType::Agent) => (0.4, "agent actor, lower trust by policy".to_string()),
        None => (0.5, "actor_type not declared".to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_receipt(
    decision_id: &str,
    event_seq: u64,
    event: &Event,
    head_before: &Decision,
    head_after: &Decision,
    created_at: DateTime<Utc>,
) -> Result<LiabilityReceipt, EventStoreError> {
    let state_before_hash = crate::state_hash::tamper_hash(head_before)?;
    let state_after_hash = crate::state_hash::tamper_hash(head_after)?;
    let public_state_before_hash = crate::state_hash::public_hash(head_before)?;
    let public_state_after_hash = crate::state_hash::public_hash(head_after)?;

    let obligations_hash = canonical_hash(&serde_json::json!({
        "obligations": obligations_artifact(head_after),
        "violations": Vec::<Violation>::new(),
    }))?;

    let (trust_score, trust_reason) = trust(event);
    let receipt_id = uuid::Uuid::new_v4();
    let kind = format!("{:?}", event.event_type).to_uppercase();

    let receipt_hash = canonical_hash(&ReceiptHashInput {
        decision_id,
        event_seq,
        receipt_id,
        kind: &kind,
        event_type: event.event_type,
        actor_id: &event.actor_id,
        actor_type: event.actor_type,
        trust_score,
        trust_reason: &trust_reason,
        state_before_hash: &state_before_hash,
        state_after_hash: &state_after_hash,
        public_state_before_hash: &public_state_before_hash,
        public_state_after_hash: &public_state_after_hash,
        obligations_hash: &obligations_hash,
        created_at,
    })?;

    Ok(LiabilityReceipt {
        decision_id: decision_id.to_string(),
        event_seq,
        receipt_id,
        kind,
        receipt_hash,
        event_type: event.event_type,
        actor_id: event.actor_id.clone(),
        actor_type: event.actor_type,
        trust_score,
        trust_reason,
        state_before_hash,
        state_after_hash,
        public_state_before_hash,
        public_state_after_hash,
        obligations_hash,
        created_at,
    })
}

/// Verify a receipt already in storage still hashes to its stored value
/// (§8 property 9: tamper detection).
pub fn verify_receipt_not_tampered(receipt: &LiabilityReceipt) -> Result<(), Violation> {
    let recomputed = crate::store::recompute_receipt_hash(receipt)
        .map_err(|e| Violation::block(ViolationCode::DecisionTampered, e.to_string()))?;
    if recomputed != receipt.receipt_hash {
        return Err(Violation::block(
            ViolationCode::SignatureTampered,
            "stored receipt_hash does not match its recomputed fields",
        ));
    }
    Ok(())
}

#[derive(Serialize)]
struct SignaturePayload<'a> {
    receipt_hash: &'a str,
    state_before_hash: &'a str,
    state_after_hash: &'a str,
    actor_id: &'a str,
    event_type: EventType,
    responsibility: &'a serde_json::Value,
}

pub fn build_signature(
    decision_id: &str,
    event_seq: u64,
    receipt: &LiabilityReceipt,
    head_after: &Decision,
    created_at: DateTime<Utc>,
) -> Result<RiskLiabilitySignature, EventStoreError> {
    let responsibility = head_after
        .artifacts
        .get("responsibility")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let payload = serde_json::to_value(SignaturePayload {
        receipt_hash: &receipt.receipt_hash,
        state_before_hash: &receipt.state_before_hash,
        state_after_hash: &receipt.state_after_hash,
        actor_id: &receipt.actor_id,
        event_type: receipt.event_type,
        responsibility: &responsibility,
    })
    .map_err(ledger_enc::EncodingError::from)?;
    let signature_hash = canonical_hash(&payload)?;
    Ok(RiskLiabilitySignature {
        decision_id: decision_id.to_string(),
        event_seq,
        receipt_hash: receipt.receipt_hash.clone(),
        payload,
        signature_hash,
        created_at,
    })
}

/// If `existing` is `Some`, its `signature_hash` must match the recomputed
/// one (tamper check); otherwise this is a fresh row to persist.
pub fn verify_or_accept_signature(
    existing: Option<&RiskLiabilitySignature>,
    fresh: &RiskLiabilitySignature,
) -> Result<(), Violation> {
    if let Some(existing) = existing {
        if existing.signature_hash != fresh.signature_hash {
            return Err(Violation::block(
                ViolationCode::SignatureTampered,
                "stored risk-liability signature does not match recomputed hash",
            ));
        }
    }
    Ok(())
}

pub fn build_pls_shield(
    decision_id: &str,
    event_seq: u64,
    event: &Event,
    receipt: &LiabilityReceipt,
    signer_state_hash: &str,
    created_at: DateTime<Utc>,
) -> Result<PlsShield, EventStoreError> {
    let owner_id = event
        .payload_str("owner_id")
        .or_else(|| event.meta_str("owner_id"))
        .unwrap_or_default()
        .to_string();
    let approver_id = event.actor_id.clone();
    let payload_json = serde_json::json!({
        "receipt_hash": receipt.receipt_hash,
        "owner_id": owner_id,
        "approver_id": approver_id,
        "signer_state_hash": signer_state_hash,
    });
    let shield_hash = canonical_hash(&payload_json)?;
    Ok(PlsShield {
        decision_id: decision_id.to_string(),
        event_seq,
        event_type: event.event_type,
        owner_id,
        approver_id,
        signer_state_hash: signer_state_hash.to_string(),
        payload_json,
        shield_hash,
        created_at,
    })
}

pub fn verify_or_accept_shield(existing: Option<&PlsShield>, fresh: &PlsShield) -> Result<(), Violation> {
    if let Some(existing) = existing {
        if existing.shield_hash != fresh.shield_hash {
            return Err(Violation::block(
                ViolationCode::PlsShieldTampered,
                "stored PLS shield does not match recomputed hash",
            ));
        }
    }
    Ok(())
}
