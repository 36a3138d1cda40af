//! Cross-tenant federation protocol (C12).
//!
//! A federation event moves `PROPOSED -> CO_SIGNED`, with either state able
//! to transition to the terminal `DISPUTED` via a challenge. The protocol
//! is expressed entirely as a sequence of entries in the global ledger
//! (`ledger-audit`), partitioned by `federation_id` rather than by tenant —
//! the two participating tenants are recorded inside each entry's payload
//! instead. A `FederationState` is a fold over that partition's entries,
//! last-entry-wins, so it can be reconstructed offline from an exported
//! proof bundle with no access to the live ledger.

use chrono::{DateTime, Utc};
use ledger_audit::{
    AppendInput, AuditError, GlobalLedger, LedgerEntry, LedgerEntryType, LedgerSigner,
    SignatureVerifierResolver, SignaturePolicy,
};
use ledger_enc::canonical_hash;
use ledger_store::StorageBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PROOF_BUNDLE_KIND: &str = "VERITASCALE_FEDERATION_PROOF_BUNDLE_V1";

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Encoding(#[from] ledger_enc::EncodingError),
    #[error("federation {0} already exists")]
    AlreadyExists(String),
    #[error("federation {0} was not found")]
    NotFound(String),
    #[error("federation {federation_id} is not in PROPOSED state")]
    NotProposed { federation_id: String },
    #[error("federation {federation_id} is already DISPUTED")]
    AlreadyDisputed { federation_id: String },
    #[error("tenant {given} does not match the federation's tenant_b {expected}")]
    TenantMismatch { given: String, expected: String },
    #[error("proof bundle kind {0:?} is not a recognized federation proof bundle")]
    BundleKindInvalid(String),
    #[error("proof bundle contains no ledger entries")]
    BundleEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederationStatus {
    Proposed,
    CoSigned,
    Disputed,
}

/// The payload recorded in a `FEDERATION_EVENT_PROPOSED` ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProposedPayload {
    federation_id: String,
    purpose: String,
    payload: serde_json::Value,
    payload_hash: String,
    tenant_a: String,
    tenant_b: String,
    event_hash: String,
}

#[derive(Serialize)]
struct CreateEventHashInput<'a> {
    federation_id: &'a str,
    at: DateTime<Utc>,
    purpose: &'a str,
    payload_hash: &'a str,
    tenant_a: &'a str,
    tenant_b: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CosignedPayload {
    federation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChallengedPayload {
    federation_id: String,
    by_tenant: String,
    reason: String,
    status: FederationStatus,
}

/// Reconstructed view of one federation, derived by folding its ledger
/// entries in order (§4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationEvent {
    pub federation_id: String,
    pub at: DateTime<Utc>,
    pub purpose: String,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub tenant_a: String,
    pub tenant_b: String,
    pub status: FederationStatus,
    pub a_sig: Option<String>,
    pub b_sig: Option<String>,
    pub challenged: bool,
}

/// Self-contained slice of the global ledger for one federation, exported
/// for offline verification (§4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofBundle {
    pub kind: String,
    pub federation_id: String,
    pub from_seq: u64,
    pub to_seq: u64,
    pub ledger_entries: Vec<LedgerEntry>,
}

/// One verification failure, carrying the fixed §4.12 offline-verification
/// code (`CHAIN_BREAK` / `NO_VERIFIER` / `BAD_SIGNATURE`).
pub type ProofBundleError = ledger_audit::AuditChainError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofBundleVerification {
    pub ok: bool,
    pub errors: Vec<ProofBundleError>,
    pub reconstructed_state: Option<FederationEvent>,
}

fn tenant_key(federation_id: &str) -> String {
    federation_id.to_string()
}

/// Fold a federation's ledger entries into its current state, applying
/// last-entry-wins semantics (§4.12).
pub fn reconstruct(entries: &[LedgerEntry]) -> Option<FederationEvent> {
    let mut state: Option<FederationEvent> = None;

    for entry in entries {
        let Some(payload) = &entry.payload else { continue };
        match entry.entry_type {
            LedgerEntryType::FederationEventProposed => {
                if let Ok(proposed) = serde_json::from_value::<ProposedPayload>(payload.clone()) {
                    state = Some(FederationEvent {
                        federation_id: proposed.federation_id,
                        at: entry.at,
                        purpose: proposed.purpose,
                        payload: proposed.payload,
                        payload_hash: proposed.payload_hash,
                        tenant_a: proposed.tenant_a,
                        tenant_b: proposed.tenant_b,
                        status: FederationStatus::Proposed,
                        a_sig: entry.signature.as_ref().map(|s| s.sig.clone()),
                        b_sig: None,
                        challenged: false,
                    });
                }
            }
            LedgerEntryType::FederationEventCosigned => {
                if let Some(existing) = state.as_mut() {
                    existing.status = FederationStatus::CoSigned;
                    existing.b_sig = entry.signature.as_ref().map(|s| s.sig.clone());
                }
            }
            LedgerEntryType::FederationEventChallenged => {
                if let Some(existing) = state.as_mut() {
                    existing.status = FederationStatus::Disputed;
                    existing.challenged = true;
                }
            }
            _ => {}
        }
    }
    state
}

pub struct FederationProtocol<B: StorageBackend> {
    ledger: Arc<GlobalLedger<B>>,
}

impl<B: StorageBackend> FederationProtocol<B> {
    pub fn new(ledger: Arc<GlobalLedger<B>>) -> Self {
        Self { ledger }
    }

    async fn entries(&self, federation_id: &str) -> Result<Vec<LedgerEntry>, FederationError> {
        Ok(self.ledger.list(Some(&tenant_key(federation_id))).await?)
    }

    pub async fn current_state(&self, federation_id: &str) -> Result<Option<FederationEvent>, FederationError> {
        Ok(reconstruct(&self.entries(federation_id).await?))
    }

    pub async fn create(
        &self,
        federation_id: &str,
        purpose: &str,
        payload: serde_json::Value,
        tenant_a: &str,
        tenant_b: &str,
        signer_a: &dyn LedgerSigner,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, FederationError> {
        if !self.entries(federation_id).await?.is_empty() {
            return Err(FederationError::AlreadyExists(federation_id.to_string()));
        }

        let payload_hash = canonical_hash(&payload)?;
        let event_hash = canonical_hash(&CreateEventHashInput {
            federation_id,
            at,
            purpose,
            payload_hash: &payload_hash,
            tenant_a,
            tenant_b,
        })?;

        let proposed = ProposedPayload {
            federation_id: federation_id.to_string(),
            purpose: purpose.to_string(),
            payload,
            payload_hash,
            tenant_a: tenant_a.to_string(),
            tenant_b: tenant_b.to_string(),
            event_hash,
        };

        let input = AppendInput {
            tenant_id: Some(tenant_key(federation_id)),
            payload: Some(serde_json::to_value(&proposed).map_err(ledger_enc::EncodingError::from)?),
            ..AppendInput::new()
        };

        let entry = self
            .ledger
            .append(LedgerEntryType::FederationEventProposed, input, at, Some(signer_a), &SignaturePolicy::none())
            .await?;
        tracing::info!(federation_id, tenant_a, tenant_b, "federation proposed");
        Ok(entry)
    }

    pub async fn cosign(
        &self,
        federation_id: &str,
        tenant_b: &str,
        signer_b: &dyn LedgerSigner,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, FederationError> {
        let state = self
            .current_state(federation_id)
            .await?
            .ok_or_else(|| FederationError::NotFound(federation_id.to_string()))?;

        match state.status {
            FederationStatus::Disputed => {
                return Err(FederationError::AlreadyDisputed { federation_id: federation_id.to_string() })
            }
            FederationStatus::CoSigned => {
                return Err(FederationError::NotProposed { federation_id: federation_id.to_string() })
            }
            FederationStatus::Proposed => {}
        }
        if state.tenant_b != tenant_b {
            return Err(FederationError::TenantMismatch { given: tenant_b.to_string(), expected: state.tenant_b });
        }

        let payload = CosignedPayload { federation_id: federation_id.to_string() };
        let input = AppendInput {
            tenant_id: Some(tenant_key(federation_id)),
            payload: Some(serde_json::to_value(&payload).map_err(ledger_enc::EncodingError::from)?),
            ..AppendInput::new()
        };

        let entry = self
            .ledger
            .append(LedgerEntryType::FederationEventCosigned, input, at, Some(signer_b), &SignaturePolicy::none())
            .await?;
        tracing::info!(federation_id, tenant_b, "federation co-signed");
        Ok(entry)
    }

    pub async fn challenge(
        &self,
        federation_id: &str,
        by_tenant: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<LedgerEntry, FederationError> {
        let state = self
            .current_state(federation_id)
            .await?
            .ok_or_else(|| FederationError::NotFound(federation_id.to_string()))?;

        if state.status == FederationStatus::Disputed {
            return Err(FederationError::AlreadyDisputed { federation_id: federation_id.to_string() });
        }

        let payload = ChallengedPayload {
            federation_id: federation_id.to_string(),
            by_tenant: by_tenant.to_string(),
            reason: reason.to_string(),
            status: FederationStatus::Disputed,
        };
        let input = AppendInput {
            tenant_id: Some(tenant_key(federation_id)),
            payload: Some(serde_json::to_value(&payload).map_err(ledger_enc::EncodingError::from)?),
            ..AppendInput::new()
        };

        let entry = self
            .ledger
            .append(LedgerEntryType::FederationEventChallenged, input, at, None, &SignaturePolicy::none())
            .await?;
        tracing::warn!(federation_id, by_tenant, reason, "federation challenged");
        Ok(entry)
    }

    pub async fn export_proof_bundle(
        &self,
        federation_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<ProofBundle, FederationError> {
        let ledger_entries = self
            .ledger
            .list_range(Some(&tenant_key(federation_id)), from_seq, to_seq)
            .await?;
        Ok(ProofBundle { kind: PROOF_BUNDLE_KIND.to_string(), federation_id: federation_id.to_string(), from_seq, to_seq, ledger_entries })
    }
}

/// Offline verification of an exported bundle: no ledger access, just the
/// bundle and a key resolver (§4.12).
pub fn verify_proof_bundle(
    bundle: &ProofBundle,
    resolver: &dyn SignatureVerifierResolver,
) -> Result<ProofBundleVerification, FederationError> {
    if bundle.kind != PROOF_BUNDLE_KIND {
        return Err(FederationError::BundleKindInvalid(bundle.kind.clone()));
    }
    if bundle.ledger_entries.is_empty() {
        return Err(FederationError::BundleEmpty);
    }

    let chain = ledger_audit::verify_chain_slice(&bundle.ledger_entries, resolver);
    let errors = chain.errors;

    let reconstructed_state = reconstruct(&bundle.ledger_entries);
    Ok(ProofBundleVerification { ok: errors.is_empty(), errors, reconstructed_state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ledger_audit::{Ed25519LedgerSigner, VerifierKey};
    use ledger_crypto::Ed25519KeyPair;
    use std::collections::HashMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    struct StaticResolver(HashMap<String, VerifierKey>);
    impl SignatureVerifierResolver for StaticResolver {
        fn resolve(&self, _tenant_id: Option<&str>, _alg: ledger_audit::SigAlg, key_id: &str) -> Option<VerifierKey> {
            self.0.get(key_id).cloned()
        }
    }

    fn setup() -> (FederationProtocol<ledger_store::MemoryStorage>, Ed25519LedgerSigner, Ed25519LedgerSigner, StaticResolver) {
        let ledger = Arc::new(GlobalLedger::new(ledger_store::MemoryStorage::new()));
        let protocol = FederationProtocol::new(ledger);
        let key_a = Ed25519KeyPair::generate();
        let key_b = Ed25519KeyPair::generate();
        let public_a = ledger_crypto::Ed25519PublicKey::from_bytes(&key_a.public_key_bytes()).unwrap();
        let public_b = ledger_crypto::Ed25519PublicKey::from_bytes(&key_b.public_key_bytes()).unwrap();
        let signer_a = Ed25519LedgerSigner::new("signer-a", key_a);
        let signer_b = Ed25519LedgerSigner::new("signer-b", key_b);
        let mut keys = HashMap::new();
        keys.insert("signer-a".to_string(), VerifierKey::Ed25519(public_a));
        keys.insert("signer-b".to_string(), VerifierKey::Ed25519(public_b));
        (protocol, signer_a, signer_b, StaticResolver(keys))
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_disputed_and_bundle_verifies() {
        let (protocol, signer_a, signer_b, resolver) = setup();

        protocol
            .create("F1", "CHARGEBACK", serde_json::json!({"amount": 199}), "A", "B", &signer_a, now())
            .await
            .unwrap();
        protocol.cosign("F1", "B", &signer_b, now()).await.unwrap();
        protocol.challenge("F1", "B", "fraud", now()).await.unwrap();

        let state = protocol.current_state("F1").await.unwrap().unwrap();
        assert_eq!(state.status, FederationStatus::Disputed);
        assert!(state.challenged);

        let bundle = protocol.export_proof_bundle("F1", 1, 3).await.unwrap();
        let verification = verify_proof_bundle(&bundle, &resolver).unwrap();
        assert!(verification.ok, "errors: {:?}", verification.errors);
        assert_eq!(verification.reconstructed_state.unwrap().status, FederationStatus::Disputed);
    }

    #[tokio::test]
    async fn cosign_rejects_tenant_mismatch() {
        let (protocol, signer_a, signer_b, _resolver) = setup();
        protocol
            .create("F2", "PAYOUT", serde_json::json!({}), "A", "B", &signer_a, now())
            .await
            .unwrap();
        let result = protocol.cosign("F2", "C", &signer_b, now()).await;
        assert!(matches!(result, Err(FederationError::TenantMismatch { .. })));
    }

    #[tokio::test]
    async fn challenge_then_cosign_is_rejected() {
        let (protocol, signer_a, signer_b, _resolver) = setup();
        protocol
            .create("F3", "PAYOUT", serde_json::json!({}), "A", "B", &signer_a, now())
            .await
            .unwrap();
        protocol.challenge("F3", "A", "dispute reason", now()).await.unwrap();
        let result = protocol.cosign("F3", "B", &signer_b, now()).await;
        assert!(matches!(result, Err(FederationError::AlreadyDisputed { .. })));
    }

    #[tokio::test]
    async fn tampered_bundle_entry_fails_verification() {
        let (protocol, signer_a, signer_b, resolver) = setup();
        protocol
            .create("F4", "PAYOUT", serde_json::json!({"amount": 5}), "A", "B", &signer_a, now())
            .await
            .unwrap();
        protocol.cosign("F4", "B", &signer_b, now()).await.unwrap();

        let mut bundle = protocol.export_proof_bundle("F4", 1, 2).await.unwrap();
        bundle.ledger_entries[0].payload = Some(serde_json::json!({"tampered": true}));

        let verification = verify_proof_bundle(&bundle, &resolver).unwrap();
        assert!(!verification.ok);
        assert!(verification
            .errors
            .iter()
            .any(|e| e.code == ledger_audit::AuditErrorCode::ChainBreak));
    }

    #[tokio::test]
    async fn unresolvable_signer_is_reported_as_no_verifier() {
        let (protocol, signer_a, _signer_b, _resolver) = setup();
        protocol
            .create("F6", "PAYOUT", serde_json::json!({"amount": 1}), "A", "B", &signer_a, now())
            .await
            .unwrap();
        let bundle = protocol.export_proof_bundle("F6", 1, 1).await.unwrap();
        let empty_resolver = StaticResolver(HashMap::new());
        let verification = verify_proof_bundle(&bundle, &empty_resolver).unwrap();
        assert!(!verification.ok);
        assert!(verification
            .errors
            .iter()
            .any(|e| e.code == ledger_audit::AuditErrorCode::NoVerifier));
    }

    #[test]
    fn bundle_with_wrong_kind_is_rejected() {
        let bundle = ProofBundle {
            kind: "SOMETHING_ELSE".to_string(),
            federation_id: "F5".to_string(),
            from_seq: 1,
            to_seq: 1,
            ledger_entries: vec![],
        };
        let resolver = StaticResolver(HashMap::new());
        let result = verify_proof_bundle(&bundle, &resolver);
        assert!(matches!(result, Err(FederationError::BundleKindInvalid(_))));
    }
}
