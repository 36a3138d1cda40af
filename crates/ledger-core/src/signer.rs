//! Signer identity binding (C10).
//!
//! Finalize events (`APPROVE|REJECT|PUBLISH`) carry `meta.signer_id` and
//! `meta.signer_state_hash`. The binding gate checks the state hash matches
//! the decision's tamper hash immediately before the event, then verifies an
//! asymmetric signature over the canonical `SIGNER_BINDING_V1` payload.

use crate::error::{Violation, ViolationCode};
use crate::model::{Decision, Event, EventType};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier};
use ledger_crypto::Ed25519PublicKey;
use ledger_enc::canonical_bytes;
use ring::signature as ring_signature;
use serde::Serialize;

/// Resolves a `signer_id` to the public key material needed to verify its
/// signature. Implementations must be local caches (§5: no network I/O
/// inside the apply transaction).
pub trait SignerDirectory: Send + Sync {
    fn resolve(&self, signer_id: &str) -> Option<SignerKey>;
}

/// `signer_id → public_key` material, per key type (§4.10). Ed25519 verifies
/// raw over `canonical_bytes(payload)`; RSA and ECDSA verify the SHA-256
/// digest of that payload, per their named algorithm.
#[derive(Debug, Clone)]
pub enum SignerKey {
    Ed25519(Ed25519PublicKey),
    /// DER-encoded PKCS#1 `RSAPublicKey`, verified with
    /// `RSA_PKCS1_2048_8192_SHA256`.
    Rsa(Vec<u8>),
    /// Uncompressed SEC1 P-256 point (`0x04 || X || Y`), verified with
    /// `ECDSA_P256_SHA256_ASN1`.
    Ecdsa(Vec<u8>),
}

#[derive(Serialize)]
struct SignerBindingPayload<'a> {
    kind: &'static str,
    decision_id: &'a str,
    event_type: EventType,
    signer_id: &'a str,
    signer_state_hash: &'a str,
    at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin_zone: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin_system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

pub struct SignerBindingContext<'a> {
    pub decision_id: &'a str,
    pub at: DateTime<Utc>,
    pub tenant_id: Option<&'a str>,
    pub origin_zone: Option<&'a str>,
    pub origin_system: Option<&'a str>,
    pub channel: Option<&'a str>,
}

/// Verify the signer binding for a finalize event. `head_before` is the
/// decision state immediately before this event is applied.
pub fn verify_signer_binding(
    head_before: &Decision,
    event: &Event,
    ctx: &SignerBindingContext,
    directory: &dyn SignerDirectory,
) -> Result<(), Violation> {
    let signer_id = event
        .meta_str("signer_id")
        .ok_or_else(|| Violation::block(ViolationCode::SignerIdRequired, "meta.signer_id is required"))?;

    if signer_id != event.actor_id {
        return Err(Violation::block(
            ViolationCode::SignerActorMismatch,
            "meta.signer_id does not match event.actor_id",
        ));
    }

    let signer_state_hash = event.meta_str("signer_state_hash").ok_or_else(|| {
        Violation::block(ViolationCode::SignerStateHashRequired, "meta.signer_state_hash is required")
    })?;

    let current_tamper_hash = crate::state_hash::tamper_hash(head_before)
        .map_err(|e| Violation::block(ViolationCode::SignerStateHashMismatch, e.to_string()))?;
    if signer_state_hash != current_tamper_hash {
        return Err(Violation::block(
            ViolationCode::SignerStateHashMismatch,
            "signer_state_hash does not match the decision's pre-event tamper hash",
        ));
    }

    let signature_hex = event.meta_str("signature").ok_or_else(|| {
        Violation::block(ViolationCode::SignerSignatureRequired, "meta.signature is required")
    })?;

    let key = directory
        .resolve(signer_id)
        .ok_or_else(|| Violation::block(ViolationCode::SignerUnknown, format!("unknown signer_id {signer_id}")))?;

    let payload = SignerBindingPayload {
        kind: "SIGNER_BINDING_V1",
        decision_id: ctx.decision_id,
        event_type: event.event_type,
        signer_id,
        signer_state_hash,
        at: ctx.at,
        tenant_id: ctx.tenant_id,
        origin_zone: ctx.origin_zone,
        origin_system: ctx.origin_system,
        channel: ctx.channel,
    };
    let bytes = canonical_bytes(&payload)
        .map_err(|e| Violation::block(ViolationCode::SignerSignatureInvalid, e.to_string()))?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|_| Violation::block(ViolationCode::SignerSignatureInvalid, "signature is not valid hex"))?;

    match key {
        SignerKey::Ed25519(public_key) => {
            let verifying_key = public_key
                .verifying_key()
                .map_err(|e| Violation::block(ViolationCode::SignerSignatureInvalid, e.to_string()))?;
            let signature = Signature::from_slice(&sig_bytes)
                .map_err(|_| Violation::block(ViolationCode::SignerSignatureInvalid, "malformed signature"))?;
            verifying_key
                .verify(&bytes, &signature)
                .map_err(|_| Violation::block(ViolationCode::SignerSignatureInvalid, "signature does not verify"))?;
        }
        SignerKey::Rsa(public_key_bytes) => {
            let verifying_key =
                ring_signature::UnparsedPublicKey::new(&ring_signature::RSA_PKCS1_2048_8192_SHA256, &public_key_bytes);
            verifying_key
                .verify(&bytes, &sig_bytes)
                .map_err(|_| Violation::block(ViolationCode::SignerSignatureInvalid, "signature does not verify"))?;
        }
        SignerKey::Ecdsa(public_key_bytes) => {
            let verifying_key =
                ring_signature::UnparsedPublicKey::new(&ring_signature::ECDSA_P256_SHA256_ASN1, &public_key_bytes);
            verifying_key
                .verify(&bytes, &sig_bytes)
                .map_err(|_| Violation::block(ViolationCode::SignerSignatureInvalid, "signature does not verify"))?;
        }
    }

    Ok(())
}

/// A directory backed by a fixed in-memory map; the typical deployment
/// loads this once at startup from an operator-managed key store.
pub struct StaticSignerDirectory {
    keys: std::collections::HashMap<String, SignerKey>,
}

impl StaticSignerDirectory {
    pub fn new() -> Self {
        Self {
            keys: std::collections::HashMap::new(),
        }
    }

    pub fn with_ed25519(mut self, signer_id: impl Into<String>, public_key: Ed25519PublicKey) -> Self {
        self.keys.insert(signer_id.into(), SignerKey::Ed25519(public_key));
        self
    }

    /// `public_key_der` is a DER-encoded PKCS#1 `RSAPublicKey`.
    pub fn with_rsa(mut self, signer_id: impl Into<String>, public_key_der: Vec<u8>) -> Self {
        self.keys.insert(signer_id.into(), SignerKey::Rsa(public_key_der));
        self
    }

    /// `public_key_bytes` is an uncompressed SEC1 P-256 point.
    pub fn with_ecdsa(mut self, signer_id: impl Into<String>, public_key_bytes: Vec<u8>) -> Self {
        self.keys.insert(signer_id.into(), SignerKey::Ecdsa(public_key_bytes));
        self
    }
}

impl Default for StaticSignerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerDirectory for StaticSignerDirectory {
    fn resolve(&self, signer_id: &str) -> Option<SignerKey> {
        self.keys.get(signer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActorType;
    use chrono::TimeZone;
    use ed25519_dalek::Signer as _;
    use ledger_crypto::Ed25519KeyPair;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn signed_event(
        keypair: &Ed25519KeyPair,
        decision_id: &str,
        event_type: EventType,
        signer_state_hash: &str,
        at: DateTime<Utc>,
    ) -> Event {
        let payload = SignerBindingPayload {
            kind: "SIGNER_BINDING_V1",
            decision_id,
            event_type,
            signer_id: "alice",
            signer_state_hash,
            at,
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let bytes = canonical_bytes(&payload).unwrap();
        let sig = keypair.sign(&bytes);
        Event::new(event_type, "alice")
            .with_actor_type(ActorType::Human)
            .with_meta(serde_json::json!({
                "signer_id": "alice",
                "signer_state_hash": signer_state_hash,
                "signature": hex::encode(sig),
            }))
    }

    #[test]
    fn valid_signature_and_state_hash_verifies() {
        let keypair = Ed25519KeyPair::generate();
        let public_key = Ed25519PublicKey::from_bytes(&keypair.public_key_bytes()).unwrap();
        let directory = StaticSignerDirectory::new().with_ed25519("alice", public_key);

        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let state_hash = crate::state_hash::tamper_hash(&head).unwrap();
        let event = signed_event(&keypair, "dec1", EventType::Approve, &state_hash, now());
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        assert!(verify_signer_binding(&head, &event, &ctx, &directory).is_ok());
    }

    #[test]
    fn wrong_state_hash_is_rejected() {
        let keypair = Ed25519KeyPair::generate();
        let public_key = Ed25519PublicKey::from_bytes(&keypair.public_key_bytes()).unwrap();
        let directory = StaticSignerDirectory::new().with_ed25519("alice", public_key);

        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let wrong_hash = format!("00{}", &crate::state_hash::tamper_hash(&head).unwrap()[2..]);
        let event = signed_event(&keypair, "dec1", EventType::Approve, &wrong_hash, now());
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let err = verify_signer_binding(&head, &event, &ctx, &directory).unwrap_err();
        assert_eq!(err.code, ViolationCode::SignerStateHashMismatch);
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let directory = StaticSignerDirectory::new();
        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let state_hash = crate::state_hash::tamper_hash(&head).unwrap();
        let event = Event::new(EventType::Approve, "mallory").with_meta(serde_json::json!({
            "signer_id": "mallory",
            "signer_state_hash": state_hash,
            "signature": "00",
        }));
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let err = verify_signer_binding(&head, &event, &ctx, &directory).unwrap_err();
        assert_eq!(err.code, ViolationCode::SignerUnknown);
    }

    #[test]
    fn valid_ecdsa_signature_verifies() {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::EcdsaKeyPair::generate_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            &rng,
        )
        .unwrap();
        let keypair = ring::signature::EcdsaKeyPair::from_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let public_key_bytes = keypair.public_key().as_ref().to_vec();
        let directory = StaticSignerDirectory::new().with_ecdsa("alice", public_key_bytes);

        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let state_hash = crate::state_hash::tamper_hash(&head).unwrap();
        let payload = SignerBindingPayload {
            kind: "SIGNER_BINDING_V1",
            decision_id: "dec1",
            event_type: EventType::Approve,
            signer_id: "alice",
            signer_state_hash: &state_hash,
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let bytes = canonical_bytes(&payload).unwrap();
        let signature = keypair.sign(&rng, &bytes).unwrap();
        let event = Event::new(EventType::Approve, "alice")
            .with_actor_type(ActorType::Human)
            .with_meta(serde_json::json!({
                "signer_id": "alice",
                "signer_state_hash": state_hash,
                "signature": hex::encode(signature.as_ref()),
            }));
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        assert!(verify_signer_binding(&head, &event, &ctx, &directory).is_ok());
    }

    #[test]
    fn ecdsa_signature_from_wrong_key_is_rejected() {
        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = ring::signature::EcdsaKeyPair::generate_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            &rng,
        )
        .unwrap();
        let signing_key = ring::signature::EcdsaKeyPair::from_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let other_pkcs8 = ring::signature::EcdsaKeyPair::generate_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            &rng,
        )
        .unwrap();
        let other_key = ring::signature::EcdsaKeyPair::from_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            other_pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let directory =
            StaticSignerDirectory::new().with_ecdsa("alice", other_key.public_key().as_ref().to_vec());

        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let state_hash = crate::state_hash::tamper_hash(&head).unwrap();
        let payload = SignerBindingPayload {
            kind: "SIGNER_BINDING_V1",
            decision_id: "dec1",
            event_type: EventType::Approve,
            signer_id: "alice",
            signer_state_hash: &state_hash,
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let bytes = canonical_bytes(&payload).unwrap();
        let signature = signing_key.sign(&rng, &bytes).unwrap();
        let event = Event::new(EventType::Approve, "alice")
            .with_actor_type(ActorType::Human)
            .with_meta(serde_json::json!({
                "signer_id": "alice",
                "signer_state_hash": state_hash,
                "signature": hex::encode(signature.as_ref()),
            }));
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let err = verify_signer_binding(&head, &event, &ctx, &directory).unwrap_err();
        assert_eq!(err.code, ViolationCode::SignerSignatureInvalid);
    }

    #[test]
    fn missing_signer_id_is_rejected() {
        let directory = StaticSignerDirectory::new();
        let head = Decision::new_draft("dec1", serde_json::json!({}), now());
        let event = Event::new(EventType::Approve, "alice");
        let ctx = SignerBindingContext {
            decision_id: "dec1",
            at: now(),
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        };
        let err = verify_signer_binding(&head, &event, &ctx, &directory).unwrap_err();
        assert_eq!(err.code, ViolationCode::SignerIdRequired);
    }
}
