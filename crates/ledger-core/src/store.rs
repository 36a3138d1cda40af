//! Event, snapshot and anchor stores (C3/C4/C5), built on one
//! `ledger_store::StorageBackend`.
//!
//! Per §5, "the event store, snapshot store, anchor store ... all share a
//! single transactional backend in the typical deployment" — so this is one
//! `DecisionStore<B>` rather than three separate types each owning their
//! own backend handle. Keys are prefixed by record kind and zero-padded on
//! `seq` so lexicographic key order matches numeric seq order for
//! `list_keys`-based range scans.

use crate::error::EventStoreError;
use crate::model::{Anchor, AnchorHashInput, Decision, Event, EventHashInput, EventRecord, LiabilityReceipt, ReceiptHashInput, PlsShield, RiskLiabilitySignature, Snapshot};
use chrono::{DateTime, Utc};
use ledger_enc::canonical_hash;
use ledger_merkle::MerkleProof;
use ledger_store::{StorageBackend, StorageManager, TransactionGuard};
use std::sync::Arc;

fn seq_key(prefix: &str, id: &str, seq: u64) -> String {
    format!("{prefix}:{id}:{seq:020}")
}

fn global_seq_key(prefix: &str, seq: u64) -> String {
    format!("{prefix}:{seq:020}")
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainError {
    pub seq: u64,
    pub reason: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainVerification {
    pub verified: bool,
    pub errors: Vec<ChainError>,
}

pub struct DecisionStore<B: StorageBackend> {
    manager: StorageManager<B>,
}

impl<B: StorageBackend> DecisionStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            manager: StorageManager::new(backend),
        }
    }

    pub async fn begin_transaction(&self) -> TransactionGuard {
        self.manager.begin_transaction().await
    }

    // ---- decision root / head --------------------------------------

    /// First-write-wins insert of the root decision.
    pub async fn create_decision(&self, decision: &Decision) -> Result<(), EventStoreError> {
        let key = format!("decision:root:{}", decision.decision_id);
        if !self.manager.exists(&key).await? {
            self.manager.store_json(&key, decision).await?;
            self.put_decision(decision).await?;
        }
        Ok(())
    }

    pub async fn put_decision(&self, decision: &Decision) -> Result<(), EventStoreError> {
        let key = format!("decision:head:{}", decision.decision_id);
        self.manager.store_json(&key, decision).await?;
        Ok(())
    }

    pub async fn get_decision(&self, id: &str) -> Result<Option<Decision>, EventStoreError> {
        Ok(self.manager.load_json(&format!("decision:head:{id}")).await?)
    }

    pub async fn get_root_decision(&self, id: &str) -> Result<Option<Decision>, EventStoreError> {
        Ok(self.manager.load_json(&format!("decision:root:{id}")).await?)
    }

    // ---- events (C3) -------------------------------------------------

    async fn last_seq(&self, id: &str) -> Result<u64, EventStoreError> {
        let prefix = format!("event:{id}:");
        let keys = self.manager.list_keys(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.rsplit(':').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    /// Append a new event, computing `seq`/`prev_hash`/`hash`. Caller is
    /// expected to hold the backend's transaction guard across this call
    /// plus any receipt/snapshot writes for the same apply.
    pub async fn append_event(
        &self,
        decision_id: &str,
        event: Event,
        idempotency_key: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<EventRecord, EventStoreError> {
        let last_seq = self.last_seq(decision_id).await?;
        let seq = last_seq + 1;
        let prev_hash = if last_seq == 0 {
            None
        } else {
            self.get_event_by_seq(decision_id, last_seq)
                .await?
                .map(|r| r.hash)
        };

        let hash = canonical_hash(&EventHashInput {
            decision_id,
            seq,
            at,
            idempotency_key: idempotency_key.as_deref(),
            prev_hash: prev_hash.as_deref(),
            event: &event,
        })?;

        let record = EventRecord {
            decision_id: decision_id.to_string(),
            seq,
            at,
            event,
            idempotency_key: idempotency_key.clone(),
            prev_hash,
            hash,
        };

        self.manager
            .store_json(&seq_key("event", decision_id, seq), &record)
            .await?;
        if let Some(key) = &idempotency_key {
            self.manager
                .store_json(&format!("idempotency:{decision_id}:{key}"), &seq)
                .await?;
        }
        tracing::info!(decision_id, seq, "appended event");
        Ok(record)
    }

    pub async fn list_events(&self, id: &str) -> Result<Vec<EventRecord>, EventStoreError> {
        self.list_events_from(id, 0).await
    }

    pub async fn list_events_from(
        &self,
        id: &str,
        after_seq: u64,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let prefix = format!("event:{id}:");
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.manager.load_json::<EventRecord>(&key).await? {
                if record.seq > after_seq {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    pub async fn get_event_by_seq(
        &self,
        id: &str,
        seq: u64,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        Ok(self.manager.load_json(&seq_key("event", id, seq)).await?)
    }

    pub async fn get_last_event(&self, id: &str) -> Result<Option<EventRecord>, EventStoreError> {
        let seq = self.last_seq(id).await?;
        if seq == 0 {
            return Ok(None);
        }
        self.get_event_by_seq(id, seq).await
    }

    pub async fn list_events_tail(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let all = self.list_events(id).await?;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    pub async fn find_event_by_idempotency_key(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        let seq: Option<u64> = self
            .manager
            .load_json(&format!("idempotency:{id}:{key}"))
            .await?;
        match seq {
            Some(seq) => self.get_event_by_seq(id, seq).await,
            None => Ok(None),
        }
    }

    /// Recompute every event's hash and linkage (§8 property 1, §8 S4).
    pub async fn verify_hash_chain(&self, id: &str) -> Result<ChainVerification, EventStoreError> {
        let records = self.list_events(id).await?;
        let mut errors = Vec::new();
        let mut prev_hash: Option<String> = None;
        for record in &records {
            let recomputed = canonical_hash(&EventHashInput {
                decision_id: &record.decision_id,
                seq: record.seq,
                at: record.at,
                idempotency_key: record.idempotency_key.as_deref(),
                prev_hash: record.prev_hash.as_deref(),
                event: &record.event,
            })?;
            if recomputed != record.hash {
                errors.push(ChainError {
                    seq: record.seq,
                    reason: "hash does not recompute".to_string(),
                });
            }
            if record.prev_hash != prev_hash {
                errors.push(ChainError {
                    seq: record.seq,
                    reason: "prev_hash does not match prior record's hash".to_string(),
                });
            }
            prev_hash = Some(record.hash.clone());
        }
        Ok(ChainVerification {
            verified: errors.is_empty(),
            errors,
        })
    }

    /// §4.3/§4.14: Merkle proof for `seq` against a tree over `1..=up_to_seq`.
    pub async fn get_merkle_proof(
        &self,
        id: &str,
        seq: u64,
        up_to_seq: u64,
    ) -> Result<Option<MerkleProof>, EventStoreError> {
        if seq == 0 || seq > up_to_seq {
            return Ok(None);
        }
        let records = self.list_events_from(id, 0).await?;
        let hashes: Vec<String> = records
            .iter()
            .filter(|r| r.seq <= up_to_seq)
            .map(|r| r.hash.clone())
            .collect();
        if hashes.is_empty() {
            return Ok(None);
        }
        let tree = ledger_merkle::MerkleTree::new(hashes)?;
        Ok(Some(tree.proof((seq - 1) as usize)?))
    }

    // ---- snapshots (C4) ----------------------------------------------

    pub async fn get_latest_snapshot(&self, id: &str) -> Result<Option<Snapshot>, EventStoreError> {
        let prefix = format!("snapshot:{id}:");
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        match keys.last() {
            Some(key) => Ok(self.manager.load_json(key).await?),
            None => Ok(None),
        }
    }

    pub async fn get_snapshot_at_or_before(
        &self,
        id: &str,
        up_to_seq: u64,
    ) -> Result<Option<Snapshot>, EventStoreError> {
        let prefix = format!("snapshot:{id}:");
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        for key in keys.into_iter().rev() {
            if let Some(snapshot) = self.manager.load_json::<Snapshot>(&key).await? {
                if snapshot.up_to_seq <= up_to_seq {
                    return Ok(Some(snapshot));
                }
            }
        }
        Ok(None)
    }

    pub async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<(), EventStoreError> {
        let key = seq_key("snapshot", &snapshot.decision_id, snapshot.up_to_seq);
        self.manager.store_json(&key, snapshot).await?;
        tracing::info!(decision_id = %snapshot.decision_id, up_to_seq = snapshot.up_to_seq, "created snapshot");
        Ok(())
    }

    pub async fn prune_snapshots(&self, id: &str, keep_last_n: usize) -> Result<(), EventStoreError> {
        let prefix = format!("snapshot:{id}:");
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        if keys.len() > keep_last_n {
            for key in &keys[..keys.len() - keep_last_n] {
                self.manager.delete(key).await?;
            }
        }
        Ok(())
    }

    pub async fn prune_events_up_to_seq(&self, id: &str, up_to_seq: u64) -> Result<(), EventStoreError> {
        let records = self.list_events(id).await?;
        for record in records.iter().filter(|r| r.seq <= up_to_seq) {
            self.manager.delete(&seq_key("event", id, record.seq)).await?;
        }
        Ok(())
    }

    // ---- anchors (C5) --------------------------------------------------

    async fn last_anchor_seq(&self) -> Result<u64, EventStoreError> {
        let keys = self.manager.list_keys("anchor:").await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.rsplit(':').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    pub async fn get_anchor_for_snapshot(
        &self,
        decision_id: &str,
        up_to_seq: u64,
    ) -> Result<Option<Anchor>, EventStoreError> {
        let keys = self.manager.list_keys("anchor:").await?;
        for key in keys {
            if let Some(anchor) = self.manager.load_json::<Anchor>(&key).await? {
                if anchor.decision_id == decision_id && anchor.snapshot_up_to_seq == up_to_seq {
                    return Ok(Some(anchor));
                }
            }
        }
        Ok(None)
    }

    pub async fn append_anchor(
        &self,
        decision_id: &str,
        snapshot_up_to_seq: u64,
        checkpoint_hash: Option<String>,
        root_hash: Option<String>,
        state_hash: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Anchor, EventStoreError> {
        if let Some(existing) = self.get_anchor_for_snapshot(decision_id, snapshot_up_to_seq).await? {
            return Ok(existing);
        }
        let last_seq = self.last_anchor_seq().await?;
        let seq = last_seq + 1;
        let prev_hash = if last_seq == 0 {
            None
        } else {
            self.get_anchor(last_seq).await?.map(|a| a.hash)
        };
        let hash = canonical_hash(&AnchorHashInput {
            seq,
            at,
            decision_id,
            snapshot_up_to_seq,
            checkpoint_hash: checkpoint_hash.as_deref(),
            root_hash: root_hash.as_deref(),
            state_hash: state_hash.as_deref(),
            prev_hash: prev_hash.as_deref(),
        })?;
        let anchor = Anchor {
            seq,
            at,
            decision_id: decision_id.to_string(),
            snapshot_up_to_seq,
            checkpoint_hash,
            root_hash,
            state_hash,
            prev_hash,
            hash,
        };
        self.manager
            .store_json(&global_seq_key("anchor", seq), &anchor)
            .await?;
        tracing::info!(decision_id, seq, "appended anchor");
        Ok(anchor)
    }

    pub async fn get_anchor(&self, seq: u64) -> Result<Option<Anchor>, EventStoreError> {
        Ok(self.manager.load_json(&global_seq_key("anchor", seq)).await?)
    }

    pub async fn list_anchors(&self) -> Result<Vec<Anchor>, EventStoreError> {
        let mut keys = self.manager.list_keys("anchor:").await?;
        keys.sort();
        let mut anchors = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(anchor) = self.manager.load_json(&key).await? {
                anchors.push(anchor);
            }
        }
        Ok(anchors)
    }

    pub async fn verify_anchor_chain(&self) -> Result<ChainVerification, EventStoreError> {
        let anchors = self.list_anchors().await?;
        let mut errors = Vec::new();
        let mut prev_seq = 0u64;
        let mut prev_hash: Option<String> = None;
        for anchor in &anchors {
            if anchor.seq != prev_seq + 1 {
                errors.push(ChainError {
                    seq: anchor.seq,
                    reason: "anchor seq is not strictly monotonic".to_string(),
                });
            }
            if anchor.prev_hash != prev_hash {
                errors.push(ChainError {
                    seq: anchor.seq,
                    reason: "anchor prev_hash mismatch".to_string(),
                });
            }
            let recomputed = canonical_hash(&AnchorHashInput {
                seq: anchor.seq,
                at: anchor.at,
                decision_id: &anchor.decision_id,
                snapshot_up_to_seq: anchor.snapshot_up_to_seq,
                checkpoint_hash: anchor.checkpoint_hash.as_deref(),
                root_hash: anchor.root_hash.as_deref(),
                state_hash: anchor.state_hash.as_deref(),
                prev_hash: anchor.prev_hash.as_deref(),
            })?;
            if recomputed != anchor.hash {
                errors.push(ChainError {
                    seq: anchor.seq,
                    reason: "anchor hash does not recompute".to_string(),
                });
            }
            prev_seq = anchor.seq;
            prev_hash = Some(anchor.hash.clone());
        }
        Ok(ChainVerification {
            verified: errors.is_empty(),
            errors,
        })
    }

    // ---- receipts / signatures / PLS (C8) ------------------------------

    pub async fn put_receipt(&self, receipt: &LiabilityReceipt) -> Result<(), EventStoreError> {
        let key = seq_key("receipt", &receipt.decision_id, receipt.event_seq);
        self.manager.store_json(&key, receipt).await?;
        Ok(())
    }

    pub async fn get_receipt(
        &self,
        decision_id: &str,
        event_seq: u64,
    ) -> Result<Option<LiabilityReceipt>, EventStoreError> {
        Ok(self
            .manager
            .load_json(&seq_key("receipt", decision_id, event_seq))
            .await?)
    }

    pub async fn get_last_receipt(&self, decision_id: &str) -> Result<Option<LiabilityReceipt>, EventStoreError> {
        let prefix = format!("receipt:{decision_id}:");
        let mut keys = self.manager.list_keys(&prefix).await?;
        keys.sort();
        match keys.last() {
            Some(key) => Ok(self.manager.load_json(key).await?),
            None => Ok(None),
        }
    }

    pub async fn put_signature(&self, signature: &RiskLiabilitySignature) -> Result<(), EventStoreError> {
        let key = seq_key("signature", &signature.decision_id, signature.event_seq);
        self.manager.store_json(&key, signature).await?;
        Ok(())
    }

    pub async fn get_signature(
        &self,
        decision_id: &str,
        event_seq: u64,
    ) -> Result<Option<RiskLiabilitySignature>, EventStoreError> {
        Ok(self
            .manager
            .load_json(&seq_key("signature", decision_id, event_seq))
            .await?)
    }

    pub async fn put_pls_shield(&self, shield: &PlsShield) -> Result<(), EventStoreError> {
        let key = seq_key("pls", &shield.decision_id, shield.event_seq);
        self.manager.store_json(&key, shield).await?;
        Ok(())
    }

    pub async fn get_pls_shield(
        &self,
        decision_id: &str,
        event_seq: u64,
    ) -> Result<Option<PlsShield>, EventStoreError> {
        Ok(self.manager.load_json(&seq_key("pls", decision_id, event_seq)).await?)
    }
}

/// Recompute the receipt's `receipt_hash` over all its fields (§8 property 5).
pub fn recompute_receipt_hash(receipt: &LiabilityReceipt) -> Result<String, EventStoreError> {
    Ok(canonical_hash(&ReceiptHashInput {
        decision_id: &receipt.decision_id,
        event_seq: receipt.event_seq,
        receipt_id: receipt.receipt_id,
        kind: &receipt.kind,
        event_type: receipt.event_type,
        actor_id: &receipt.actor_id,
        actor_type: receipt.actor_type,
        trust_score: receipt.trust_score,
        trust_reason: &receipt.trust_reason,
        state_before_hash: &receipt.state_before_hash,
        state_after_hash: &receipt.state_after_hash,
        public_state_before_hash: &receipt.public_state_before_hash,
        public_state_after_hash: &receipt.public_state_after_hash,
        obligations_hash: &receipt.obligations_hash,
        created_at: receipt.created_at,
    })?)
}

pub type MemoryDecisionStore = DecisionStore<ledger_store::MemoryStorage>;

impl MemoryDecisionStore {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(ledger_store::MemoryStorage::new()))
    }
}
