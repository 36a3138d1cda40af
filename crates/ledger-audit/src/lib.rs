//! Global tamper-evident ledger (C11).
//!
//! A per-tenant (or global, when `tenant_id` is `None`) append-only, hash-
//! chained log of high-level events: `DECISION_EVENT_APPENDED`,
//! `SNAPSHOT_CREATED`, `ANCHOR_APPENDED`, and the three federation event
//! types `ledger-federation` appends through this crate. Each entry may
//! carry an HMAC or Ed25519 signature; a `SignaturePolicy` can make one
//! mandatory per entry type.

use chrono::{DateTime, Utc};
use ledger_crypto::{Ed25519PublicKey, HmacKey};
use ledger_enc::canonical_hash;
use ledger_store::{StorageBackend, StorageManager};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error(transparent)]
    Storage(#[from] ledger_store::StorageError),
    #[error(transparent)]
    Encoding(#[from] ledger_enc::EncodingError),
    #[error("signature is required for entry type {entry_type:?} but none was provided")]
    SignatureRequired { entry_type: LedgerEntryType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEntryType {
    DecisionEventAppended,
    SnapshotCreated,
    AnchorAppended,
    FederationEventProposed,
    FederationEventCosigned,
    FederationEventChallenged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigAlg {
    HmacSha256,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSignature {
    pub sig_alg: SigAlg,
    pub key_id: String,
    pub sig: String,
}

/// Fields that feed `LedgerEntry.hash` (§6: ledger entry hash), excluding
/// the signature itself — the signature is computed over the hex of this
/// hash, not folded into it.
#[derive(Serialize)]
struct LedgerHashInput<'a> {
    seq: u64,
    at: DateTime<Utc>,
    tenant_id: Option<&'a str>,
    #[serde(rename = "type")]
    entry_type: LedgerEntryType,
    decision_id: Option<&'a str>,
    event_seq: Option<u64>,
    snapshot_up_to_seq: Option<u64>,
    anchor_seq: Option<u64>,
    payload: Option<&'a serde_json::Value>,
    prev_hash: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub entry_type: LedgerEntryType,
    pub decision_id: Option<String>,
    pub event_seq: Option<u64>,
    pub snapshot_up_to_seq: Option<u64>,
    pub anchor_seq: Option<u64>,
    pub payload: Option<serde_json::Value>,
    pub prev_hash: Option<String>,
    pub hash: String,
    pub signature: Option<LedgerSignature>,
}

/// A caller-supplied request to append one entry.
#[derive(Default)]
pub struct AppendInput {
    pub tenant_id: Option<String>,
    pub decision_id: Option<String>,
    pub event_seq: Option<u64>,
    pub snapshot_up_to_seq: Option<u64>,
    pub anchor_seq: Option<u64>,
    pub payload: Option<serde_json::Value>,
}

impl AppendInput {
    pub fn new() -> Self {
        Self::default()
    }
}

pub trait LedgerSigner: Send + Sync {
    fn key_id(&self) -> &str;
    fn alg(&self) -> SigAlg;
    /// Sign the lowercase hex of the entry hash.
    fn sign(&self, hash_hex: &str) -> String;
}

pub struct HmacLedgerSigner {
    key_id: String,
    key: HmacKey,
}

impl HmacLedgerSigner {
    pub fn new(key_id: impl Into<String>, key: HmacKey) -> Self {
        Self { key_id: key_id.into(), key }
    }
}

impl LedgerSigner for HmacLedgerSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }
    fn alg(&self) -> SigAlg {
        SigAlg::HmacSha256
    }
    fn sign(&self, hash_hex: &str) -> String {
        hex::encode(self.key.sign(hash_hex.as_bytes()))
    }
}

pub struct Ed25519LedgerSigner {
    key_id: String,
    keypair: ledger_crypto::Ed25519KeyPair,
}

impl Ed25519LedgerSigner {
    pub fn new(key_id: impl Into<String>, keypair: ledger_crypto::Ed25519KeyPair) -> Self {
        Self { key_id: key_id.into(), keypair }
    }
}

impl LedgerSigner for Ed25519LedgerSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }
    fn alg(&self) -> SigAlg {
        SigAlg::Ed25519
    }
    fn sign(&self, hash_hex: &str) -> String {
        hex::encode(self.keypair.sign(hash_hex.as_bytes()))
    }
}

/// Which entry types require a signature at append time.
#[derive(Default)]
pub struct SignaturePolicy {
    pub require_globally: bool,
    pub require_for_types: HashSet<LedgerEntryType>,
}

impl SignaturePolicy {
    pub fn none() -> Self {
        Self::default()
    }

    fn requires(&self, entry_type: LedgerEntryType) -> bool {
        self.require_globally || self.require_for_types.contains(&entry_type)
    }
}

#[derive(Debug, Clone)]
pub enum VerifierKey {
    Hmac(HmacKey),
    Ed25519(Ed25519PublicKey),
}

/// Resolves `(tenant_id, alg, key_id)` to verifying key material. Per §5,
/// implementations must be local caches — no network I/O during verify.
pub trait SignatureVerifierResolver: Send + Sync {
    fn resolve(&self, tenant_id: Option<&str>, alg: SigAlg, key_id: &str) -> Option<VerifierKey>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    Unsigned,
    SignedUnverified,
    SignedVerified,
    StrongVerified,
}

/// Fixed offline-verification error codes (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditErrorCode {
    /// A hash failed to recompute, or an entry's `prev_hash` doesn't match
    /// the prior entry's hash — the chain is broken at this entry.
    ChainBreak,
    /// The entry carries a signature but no verifier key resolved for its
    /// `(tenant_id, alg, key_id)`.
    NoVerifier,
    /// A verifier key resolved but the signature does not verify.
    BadSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditChainError {
    pub seq: u64,
    pub code: AuditErrorCode,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerVerification {
    pub verified: bool,
    pub errors: Vec<AuditChainError>,
    pub trust_counts: BTreeMap<TrustLevel, usize>,
    pub min_trust_level: Option<TrustLevel>,
}

fn tenant_key(tenant_id: Option<&str>) -> String {
    tenant_id.unwrap_or("_global").to_string()
}

fn seq_key(tenant_id: Option<&str>, seq: u64) -> String {
    format!("ledger:{}:{seq:020}", tenant_key(tenant_id))
}

fn hash_input(entry: &LedgerEntry) -> LedgerHashInput<'_> {
    LedgerHashInput {
        seq: entry.seq,
        at: entry.at,
        tenant_id: entry.tenant_id.as_deref(),
        entry_type: entry.entry_type,
        decision_id: entry.decision_id.as_deref(),
        event_seq: entry.event_seq,
        snapshot_up_to_seq: entry.snapshot_up_to_seq,
        anchor_seq: entry.anchor_seq,
        payload: entry.payload.as_ref(),
        prev_hash: entry.prev_hash.as_deref(),
    }
}

pub struct GlobalLedger<B: StorageBackend> {
    manager: StorageManager<B>,
}

impl<B: StorageBackend> GlobalLedger<B> {
    pub fn new(backend: B) -> Self {
        Self { manager: StorageManager::new(backend) }
    }

    async fn last_seq(&self, tenant_id: Option<&str>) -> Result<u64, AuditError> {
        let prefix = format!("ledger:{}:", tenant_key(tenant_id));
        let keys = self.manager.list_keys(&prefix).await?;
        Ok(keys.iter().filter_map(|k| k.rsplit(':').next()?.parse::<u64>().ok()).max().unwrap_or(0))
    }

    pub async fn append(
        &self,
        entry_type: LedgerEntryType,
        input: AppendInput,
        at: DateTime<Utc>,
        signer: Option<&dyn LedgerSigner>,
        policy: &SignaturePolicy,
    ) -> Result<LedgerEntry, AuditError> {
        if policy.requires(entry_type) && signer.is_none() {
            return Err(AuditError::SignatureRequired { entry_type });
        }

        let tenant_id = input.tenant_id.clone();
        let last_seq = self.last_seq(tenant_id.as_deref()).await?;
        let seq = last_seq + 1;
        let prev_hash = if last_seq == 0 {
            None
        } else {
            self.get(tenant_id.as_deref(), last_seq).await?.map(|e| e.hash)
        };

        let mut entry = LedgerEntry {
            seq,
            at,
            tenant_id,
            entry_type,
            decision_id: input.decision_id,
            event_seq: input.event_seq,
            snapshot_up_to_seq: input.snapshot_up_to_seq,
            anchor_seq: input.anchor_seq,
            payload: input.payload,
            prev_hash,
            hash: String::new(),
            signature: None,
        };
        entry.hash = canonical_hash(&hash_input(&entry))?;

        if let Some(signer) = signer {
            entry.signature = Some(LedgerSignature {
                sig_alg: signer.alg(),
                key_id: signer.key_id().to_string(),
                sig: signer.sign(&entry.hash),
            });
        }

        self.manager.store_json(&seq_key(entry.tenant_id.as_deref(), seq), &entry).await?;
        tracing::info!(seq, tenant_id = ?entry.tenant_id, entry_type = ?entry_type, "appended ledger entry");
        Ok(entry)
    }

    pub async fn get(&self, tenant_id: Option<&str>, seq: u64) -> Result<Option<LedgerEntry>, AuditError> {
        Ok(self.manager.load_json(&seq_key(tenant_id, seq)).await?)
    }

    pub async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<LedgerEntry>, AuditError> {
        let prefix = format!("ledger:{}:", tenant_key(tenant_id));
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.manager.load_json(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn list_range(
        &self,
        tenant_id: Option<&str>,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<LedgerEntry>, AuditError> {
        Ok(self
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|e| e.seq >= from_seq && e.seq <= to_seq)
            .collect())
    }

    /// Recompute hashes, linkage, and signature trust level across the
    /// whole per-tenant log (§4.11).
    pub async fn verify(
        &self,
        tenant_id: Option<&str>,
        resolver: &dyn SignatureVerifierResolver,
    ) -> Result<LedgerVerification, AuditError> {
        let entries = self.list(tenant_id).await?;
        let verification = verify_entries(&entries, resolver);
        Ok(verification)
    }
}

/// Verify a slice known to start at the log's genesis (`prev_hash` of the
/// first entry must be `None`) — `GlobalLedger::verify`'s case.
pub fn verify_entries(entries: &[LedgerEntry], resolver: &dyn SignatureVerifierResolver) -> LedgerVerification {
    verify_chain(entries, None, resolver)
}

/// Verify an arbitrary contiguous slice of a chain, such as a federation
/// proof bundle that doesn't start at seq 1 — the first entry's `prev_hash`
/// is trusted as given rather than required to be `None`, and linkage is
/// only checked from the second entry onward.
pub fn verify_chain_slice(entries: &[LedgerEntry], resolver: &dyn SignatureVerifierResolver) -> LedgerVerification {
    match entries.first() {
        Some(first) => verify_chain(entries, first.prev_hash.clone(), resolver),
        None => LedgerVerification {
            verified: true,
            errors: Vec::new(),
            trust_counts: BTreeMap::new(),
            min_trust_level: None,
        },
    }
}

fn verify_chain(
    entries: &[LedgerEntry],
    starting_prev_hash: Option<String>,
    resolver: &dyn SignatureVerifierResolver,
) -> LedgerVerification {
    let mut errors = Vec::new();
    let mut trust_counts: BTreeMap<TrustLevel, usize> = BTreeMap::new();
    let mut prev_hash = starting_prev_hash;

    for entry in entries {
        let recomputed = match canonical_hash(&hash_input(entry)) {
            Ok(h) => h,
            Err(e) => {
                errors.push(AuditChainError { seq: entry.seq, code: AuditErrorCode::ChainBreak, reason: e.to_string() });
                continue;
            }
        };
        if recomputed != entry.hash {
            errors.push(AuditChainError {
                seq: entry.seq,
                code: AuditErrorCode::ChainBreak,
                reason: "hash does not recompute".to_string(),
            });
        }
        if entry.prev_hash != prev_hash {
            errors.push(AuditChainError {
                seq: entry.seq,
                code: AuditErrorCode::ChainBreak,
                reason: "prev_hash does not match prior entry".to_string(),
            });
        }
        prev_hash = Some(entry.hash.clone());

        let trust = trust_level(entry, resolver, &mut errors);
        *trust_counts.entry(trust).or_insert(0) += 1;
    }

    let min_trust_level = trust_counts.keys().min().copied();
    LedgerVerification {
        verified: errors.is_empty(),
        errors,
        trust_counts,
        min_trust_level,
    }
}

fn trust_level(
    entry: &LedgerEntry,
    resolver: &dyn SignatureVerifierResolver,
    errors: &mut Vec<AuditChainError>,
) -> TrustLevel {
    let Some(signature) = &entry.signature else {
        return TrustLevel::Unsigned;
    };
    let Some(key) = resolver.resolve(entry.tenant_id.as_deref(), signature.sig_alg, &signature.key_id) else {
        errors.push(AuditChainError {
            seq: entry.seq,
            code: AuditErrorCode::NoVerifier,
            reason: format!("no verifier registered for key_id {}", signature.key_id),
        });
        return TrustLevel::SignedUnverified;
    };
    let Ok(sig_bytes) = hex::decode(&signature.sig) else {
        errors.push(AuditChainError {
            seq: entry.seq,
            code: AuditErrorCode::BadSignature,
            reason: "signature is not valid hex".to_string(),
        });
        return TrustLevel::SignedUnverified;
    };

    match key {
        VerifierKey::Hmac(hmac_key) => {
            if hmac_key.verify(entry.hash.as_bytes(), &sig_bytes) {
                TrustLevel::SignedVerified
            } else {
                errors.push(AuditChainError {
                    seq: entry.seq,
                    code: AuditErrorCode::BadSignature,
                    reason: "HMAC signature does not verify".to_string(),
                });
                TrustLevel::SignedUnverified
            }
        }
        VerifierKey::Ed25519(public_key) => {
            let verified = public_key
                .verifying_key()
                .ok()
                .zip(ed25519_dalek::Signature::from_slice(&sig_bytes).ok())
                .map(|(vk, sig)| {
                    use ed25519_dalek::Verifier;
                    vk.verify(entry.hash.as_bytes(), &sig).is_ok()
                })
                .unwrap_or(false);
            if verified {
                TrustLevel::StrongVerified
            } else {
                errors.push(AuditChainError {
                    seq: entry.seq,
                    code: AuditErrorCode::BadSignature,
                    reason: "Ed25519 signature does not verify".to_string(),
                });
                TrustLevel::SignedUnverified
            }
        }
    }
}

pub type MemoryGlobalLedger = GlobalLedger<ledger_store::MemoryStorage>;

impl MemoryGlobalLedger {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(ledger_store::MemoryStorage::new()))
    }
}

struct NoopResolver;
impl SignatureVerifierResolver for NoopResolver {
    fn resolve(&self, _tenant_id: Option<&str>, _alg: SigAlg, _key_id: &str) -> Option<VerifierKey> {
        None
    }
}

/// A resolver with no registered keys, for callers that only need hash-chain
/// verification and don't care about signature trust.
pub fn no_signature_resolver() -> &'static dyn SignatureVerifierResolver {
    &NoopResolver
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    struct StaticResolver(std::collections::HashMap<(Option<String>, String), VerifierKey>);
    impl SignatureVerifierResolver for StaticResolver {
        fn resolve(&self, tenant_id: Option<&str>, _alg: SigAlg, key_id: &str) -> Option<VerifierKey> {
            self.0.get(&(tenant_id.map(str::to_string), key_id.to_string())).cloned()
        }
    }

    #[tokio::test]
    async fn append_builds_hash_chain_per_tenant() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        let e1 = ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), None, &policy)
            .await
            .unwrap();
        let e2 = ledger
            .append(LedgerEntryType::SnapshotCreated, AppendInput::new(), now(), None, &policy)
            .await
            .unwrap();
        assert_eq!(e2.prev_hash, Some(e1.hash.clone()));
        let verification = ledger.verify(None, no_signature_resolver()).await.unwrap();
        assert!(verification.verified);
        assert_eq!(verification.trust_counts.get(&TrustLevel::Unsigned), Some(&2));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        let mut input_a = AppendInput::new();
        input_a.tenant_id = Some("tenant-a".to_string());
        ledger
            .append(LedgerEntryType::DecisionEventAppended, input_a, now(), None, &policy)
            .await
            .unwrap();
        let mut input_b = AppendInput::new();
        input_b.tenant_id = Some("tenant-b".to_string());
        ledger
            .append(LedgerEntryType::DecisionEventAppended, input_b, now(), None, &policy)
            .await
            .unwrap();
        assert_eq!(ledger.list(Some("tenant-a")).await.unwrap().len(), 1);
        assert_eq!(ledger.list(Some("tenant-b")).await.unwrap().len(), 1);
        assert!(ledger.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_required_signature_is_rejected() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy { require_globally: true, require_for_types: HashSet::new() };
        let result = ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), None, &policy)
            .await;
        assert!(matches!(result, Err(AuditError::SignatureRequired { .. })));
    }

    #[tokio::test]
    async fn hmac_signature_verifies_as_signed_verified() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        let key = HmacKey::generate().unwrap();
        let signer = HmacLedgerSigner::new("key-1", key.clone());
        ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), Some(&signer), &policy)
            .await
            .unwrap();
        let mut keys = std::collections::HashMap::new();
        keys.insert((None, "key-1".to_string()), VerifierKey::Hmac(key));
        let resolver = StaticResolver(keys);
        let verification = ledger.verify(None, &resolver).await.unwrap();
        assert!(verification.verified);
        assert_eq!(verification.min_trust_level, Some(TrustLevel::SignedVerified));
    }

    #[tokio::test]
    async fn tampered_entry_breaks_chain() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), None, &policy)
            .await
            .unwrap();
        let mut entries = ledger.list(None).await.unwrap();
        entries[0].decision_id = Some("tampered".to_string());
        let verification = verify_entries(&entries, no_signature_resolver());
        assert!(!verification.verified);
        assert!(verification.errors.iter().all(|e| e.code == AuditErrorCode::ChainBreak));
    }

    #[tokio::test]
    async fn unresolved_signer_is_reported_as_no_verifier() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        let key = HmacKey::generate().unwrap();
        let signer = HmacLedgerSigner::new("key-1", key);
        ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), Some(&signer), &policy)
            .await
            .unwrap();
        let resolver = StaticResolver(std::collections::HashMap::new());
        let verification = ledger.verify(None, &resolver).await.unwrap();
        assert!(!verification.verified);
        assert_eq!(verification.errors[0].code, AuditErrorCode::NoVerifier);
    }

    #[tokio::test]
    async fn wrong_key_is_reported_as_bad_signature() {
        let ledger = GlobalLedger::new(ledger_store::MemoryStorage::new());
        let policy = SignaturePolicy::none();
        let key = HmacKey::generate().unwrap();
        let other_key = HmacKey::generate().unwrap();
        let signer = HmacLedgerSigner::new("key-1", key);
        ledger
            .append(LedgerEntryType::DecisionEventAppended, AppendInput::new(), now(), Some(&signer), &policy)
            .await
            .unwrap();
        let mut keys = std::collections::HashMap::new();
        keys.insert((None, "key-1".to_string()), VerifierKey::Hmac(other_key));
        let resolver = StaticResolver(keys);
        let verification = ledger.verify(None, &resolver).await.unwrap();
        assert!(!verification.verified);
        assert_eq!(verification.errors[0].code, AuditErrorCode::BadSignature);
    }
}
