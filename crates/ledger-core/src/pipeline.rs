//! Apply pipeline (C7, §4.7): the single entry point that turns one
//! incoming `Event` into a persisted, receipted, gated state transition.
//!
//! Stages, in order: root bootstrap, load+verify snapshot, replay delta to
//! head, pre-apply receipt verification, consequence preview, gates
//! (including signer binding), idempotency shortcut, append, re-replay,
//! receipts/signatures/PLS, snapshot+anchor policy. Stages 8-10 run inside
//! one storage transaction — a gate or verification failure before stage 8
//! never touches storage, so there's nothing to roll back.

use crate::config::LedgerConfig;
use crate::error::{EventStoreError, PipelineError, Violation, ViolationCode};
use crate::gates::{self, ConsequencePreview, GateContext};
use crate::model::{Decision, Event, EventRecord, EventType, ProvenanceNode, Snapshot};
use crate::receipts;
use crate::replay;
use crate::signer::{self, SignerBindingContext, SignerDirectory};
use crate::state_hash;
use crate::store::DecisionStore;
use chrono::{DateTime, Utc};
use ledger_audit::{AppendInput as LedgerAppendInput, GlobalLedger, LedgerEntryType, SignaturePolicy};
use ledger_store::StorageBackend;
use std::collections::HashSet;
use std::sync::Arc;

/// Caller-supplied request to apply one event against a decision.
pub struct ApplyInput {
    pub decision_id: String,
    pub event: Event,
    /// Used to bootstrap a DRAFT root if `decision_id` has no history yet.
    pub meta_if_create: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub actor_roles: Vec<String>,
    pub expected_version: Option<u64>,
    pub tenant_id: Option<String>,
    pub origin_zone: Option<String>,
    pub origin_system: Option<String>,
    pub channel: Option<String>,
}

impl ApplyInput {
    pub fn new(decision_id: impl Into<String>, event: Event) -> Self {
        Self {
            decision_id: decision_id.into(),
            event,
            meta_if_create: serde_json::json!({}),
            idempotency_key: None,
            actor_roles: Vec::new(),
            expected_version: None,
            tenant_id: None,
            origin_zone: None,
            origin_system: None,
            channel: None,
        }
    }
}

/// Result of one `apply_event` call. `ok == false` means the event was
/// rejected and nothing was persisted; `violations` then holds the BLOCK
/// reasons. On success `violations` holds only WARN/INFO entries.
pub struct ApplyOutcome {
    pub ok: bool,
    pub decision: Decision,
    pub violations: Vec<Violation>,
    pub consequence_preview: ConsequencePreview,
}

pub struct PipelineOptions<'a, B: StorageBackend> {
    pub config: &'a LedgerConfig,
    pub now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    pub signer_directory: Option<&'a dyn SignerDirectory>,
    /// When set, stage 10/11 mirror `DECISION_EVENT_APPENDED`,
    /// `SNAPSHOT_CREATED`, and `ANCHOR_APPENDED` into the global ledger
    /// (§4.11). `None` is a valid deployment (e.g. single-tenant, no
    /// cross-decision audit trail needed).
    pub global_ledger: Option<&'a GlobalLedger<B>>,
}

fn rejected(decision: Decision, preview: ConsequencePreview, violations: Vec<Violation>) -> ApplyOutcome {
    ApplyOutcome {
        ok: false,
        decision,
        violations,
        consequence_preview: preview,
    }
}

fn empty_preview(decision: &Decision) -> ConsequencePreview {
    ConsequencePreview {
        predicted_next_state: decision.state,
        delta_summary: String::new(),
        warnings: Vec::new(),
    }
}

fn get_provenance_nodes(decision: &Decision) -> Vec<ProvenanceNode> {
    decision
        .artifacts
        .get("provenance")
        .and_then(|p| p.get("nodes"))
        .and_then(|n| serde_json::from_value(n.clone()).ok())
        .unwrap_or_default()
}

fn push_provenance_node(decision: &mut Decision, node: &ProvenanceNode) -> Result<(), EventStoreError> {
    if !decision.artifacts.is_object() {
        decision.artifacts = serde_json::json!({});
    }
    let artifacts = decision.artifacts.as_object_mut().expect("just ensured object");
    let provenance = artifacts
        .entry("provenance".to_string())
        .or_insert_with(|| serde_json::json!({ "nodes": [] }));
    if !provenance.is_object() {
        *provenance = serde_json::json!({ "nodes": [] });
    }
    let provenance = provenance.as_object_mut().expect("just ensured object");
    let nodes = provenance
        .entry("nodes".to_string())
        .or_insert_with(|| serde_json::json!([]));
    if !nodes.is_array() {
        *nodes = serde_json::json!([]);
    }
    let encoded = serde_json::to_value(node).map_err(ledger_enc::EncodingError::from)?;
    nodes.as_array_mut().expect("just ensured array").push(encoded);
    Ok(())
}

/// Fold `records` over `base`, stamping a provenance node per record. On a
/// BLOCK violation returns it directly rather than via `Result::Err` — this
/// is an expected outcome for already-persisted history, not an I/O error.
fn replay_with_provenance(
    decision_id: &str,
    base: &Decision,
    records: &[EventRecord],
    locked_allowlist: &HashSet<EventType>,
) -> Result<Result<(Decision, Vec<Violation>), Violation>, PipelineError> {
    let mut current = base.clone();
    let mut warnings = Vec::new();

    for record in records {
        let state_before_hash = state_hash::tamper_hash(&current).map_err(EventStoreError::from)?;
        let outcome = replay::apply_one_at(&current, &record.event, record.at, locked_allowlist);
        if let Some(block) = outcome.violations.iter().find(|v| v.is_block()).cloned() {
            return Ok(Err(block));
        }
        warnings.extend(outcome.violations);

        let mut next = outcome.decision;
        let state_after_hash = state_hash::tamper_hash(&next).map_err(EventStoreError::from)?;
        let prior_node = get_provenance_nodes(&current).last().cloned();
        let node = crate::provenance::next_node(
            decision_id,
            record.seq,
            record.at,
            &record.event,
            &record.hash,
            prior_node.as_ref(),
            &state_before_hash,
            &state_after_hash,
        )?;
        push_provenance_node(&mut next, &node)?;
        current = next;
    }

    Ok(Ok((current, warnings)))
}

async fn verify_snapshot_integrity<B: StorageBackend>(
    _store: &DecisionStore<B>,
    snapshot: &Snapshot,
) -> Result<Option<Violation>, PipelineError> {
    let recomputed_state_hash = state_hash::tamper_hash(&snapshot.decision).map_err(EventStoreError::from)?;
    if recomputed_state_hash != snapshot.state_hash {
        return Ok(Some(Violation::block(
            ViolationCode::SnapshotStateHashMismatch,
            "snapshot state_hash does not match its embedded decision",
        )));
    }

    if let Some(expected_tail) = &snapshot.provenance_tail_hash {
        let nodes = get_provenance_nodes(&snapshot.decision);
        let actual_tail = nodes.last().map(|n| n.node_hash.clone());
        if actual_tail.as_deref() != Some(expected_tail.as_str()) {
            return Ok(Some(Violation::block(
                ViolationCode::SnapshotProvenanceTailMismatch,
                "snapshot provenance_tail_hash does not match the embedded decision's provenance tail",
            )));
        }
        if crate::provenance::verify_chain(&nodes).is_err() {
            return Ok(Some(Violation::block(
                ViolationCode::ProvenanceTampered,
                "snapshot's embedded provenance chain does not verify",
            )));
        }
    }

    Ok(None)
}

/// Apply one event to `input.decision_id`, running the full pipeline.
pub async fn apply_event<B: StorageBackend>(
    store: &DecisionStore<B>,
    input: ApplyInput,
    options: &PipelineOptions<'_, B>,
) -> Result<ApplyOutcome, PipelineError> {
    let now = (options.now)();
    let locked_allowlist = options.config.immutability_allowlist();

    // Stage 1: root bootstrap.
    if store.get_root_decision(&input.decision_id).await?.is_none() {
        let root = Decision::new_draft(&input.decision_id, input.meta_if_create.clone(), now);
        store.create_decision(&root).await?;
    }

    // Stage 2: load latest snapshot and verify its integrity.
    let snapshot = store.get_latest_snapshot(&input.decision_id).await?;
    let (base_decision, base_seq) = match &snapshot {
        Some(snap) => {
            if let Some(violation) = verify_snapshot_integrity(store, snap).await? {
                let preview = empty_preview(&snap.decision);
                return Ok(rejected(snap.decision.clone(), preview, vec![violation]));
            }
            (snap.decision.clone(), snap.up_to_seq)
        }
        None => {
            let root = store
                .get_root_decision(&input.decision_id)
                .await?
                .expect("root was just bootstrapped in stage 1");
            (root, 0)
        }
    };

    // Stage 3: replay the delta from the snapshot (or root) to current head.
    let delta_records = store.list_events_from(&input.decision_id, base_seq).await?;
    let (head_before, mut warnings) =
        match replay_with_provenance(&input.decision_id, &base_decision, &delta_records, &locked_allowlist)? {
            Ok(pair) => pair,
            Err(violation) => {
                let preview = empty_preview(&base_decision);
                return Ok(rejected(base_decision, preview, vec![violation]));
            }
        };

    // Stage 4: pre-apply verification against the latest receipt's public hash.
    if let Some(last_receipt) = store.get_last_receipt(&input.decision_id).await? {
        let recomputed_public = state_hash::public_hash(&head_before).map_err(EventStoreError::from)?;
        if recomputed_public != last_receipt.public_state_after_hash {
            let violation = Violation::block(
                ViolationCode::DecisionPublicHashMismatch,
                "current head's public hash does not match the latest receipt's public_state_after_hash",
            );
            let preview = empty_preview(&head_before);
            return Ok(rejected(head_before, preview, vec![violation]));
        }
    }

    if let Some(expected) = input.expected_version {
        if expected != head_before.version {
            let violation = Violation::block(
                ViolationCode::ConcurrentModification,
                format!("expected version {expected}, found {}", head_before.version),
            );
            let preview = empty_preview(&head_before);
            return Ok(rejected(head_before, preview, vec![violation]));
        }
    }

    // Stage 5: consequence preview.
    let preview = gates::consequence_preview(&head_before, &input.event);
    if options.config.block_on_consequence_block && preview.has_block() {
        let violation = Violation::block(
            ViolationCode::ConsequenceBlocked,
            "consequence preview carries a BLOCK-severity warning",
        );
        return Ok(rejected(head_before, preview, vec![violation]));
    }

    // Stage 6: gates.
    let gate_ctx = GateContext {
        config: options.config,
        actor_roles: &input.actor_roles,
        origin_zone: input.origin_zone.as_deref(),
        now,
    };
    let mut gate_violations = gates::run_gates(&head_before, &input.event, &gate_ctx);

    if input.event.event_type.is_finalize() && options.config.require_signer_identity_binding {
        match options.signer_directory {
            Some(directory) => {
                let signer_ctx = SignerBindingContext {
                    decision_id: &input.decision_id,
                    at: now,
                    tenant_id: input.tenant_id.as_deref(),
                    origin_zone: input.origin_zone.as_deref(),
                    origin_system: input.origin_system.as_deref(),
                    channel: input.channel.as_deref(),
                };
                if let Err(violation) =
                    signer::verify_signer_binding(&head_before, &input.event, &signer_ctx, directory)
                {
                    gate_violations.push(violation);
                }
            }
            None => gate_violations.push(Violation::block(
                ViolationCode::SignerUnknown,
                "signer identity binding is required but no signer directory is configured",
            )),
        }
    }

    if gate_violations.iter().any(Violation::is_block) {
        return Ok(rejected(head_before, preview, gate_violations));
    }
    warnings.extend(gate_violations);

    // Stage 7: idempotency shortcut.
    if let Some(key) = &input.idempotency_key {
        if store.find_event_by_idempotency_key(&input.decision_id, key).await?.is_some() {
            return Ok(ApplyOutcome {
                ok: true,
                decision: head_before,
                violations: warnings,
                consequence_preview: preview,
            });
        }
    }

    // Stages 8-10 run under one transaction.
    let _guard = store.begin_transaction().await;

    // Stage 8: append.
    let record = store
        .append_event(&input.decision_id, input.event.clone(), input.idempotency_key.clone(), now)
        .await?;

    // Stage 9: re-replay including the freshly appended event.
    let (head_after, replay_warnings) = match replay_with_provenance(
        &input.decision_id,
        &head_before,
        std::slice::from_ref(&record),
        &locked_allowlist,
    )? {
        Ok(pair) => pair,
        Err(violation) => {
            // The event we just appended failed to replay against the head
            // we gated it against — the gates above should have caught this;
            // treat it as a hard pipeline error since storage now holds an
            // event that doesn't replay cleanly.
            return Err(PipelineError::Internal(format!(
                "appended event {} failed re-replay: {}",
                record.seq, violation.message
            )));
        }
    };
    warnings.extend(replay_warnings);

    let provenance_nodes = get_provenance_nodes(&head_after);
    crate::provenance::verify_chain(&provenance_nodes).map_err(EventStoreError::from)?;

    store.put_decision(&head_after).await?;

    // Stage 10: receipts, signatures, PLS shields.
    let receipt = receipts::build_receipt(&input.decision_id, record.seq, &record.event, &head_before, &head_after, now)?;
    store.put_receipt(&receipt).await?;

    if let Some(ledger) = options.global_ledger {
        let mut append_input = LedgerAppendInput::new();
        append_input.tenant_id = input.tenant_id.clone();
        append_input.decision_id = Some(input.decision_id.clone());
        append_input.event_seq = Some(record.seq);
        append_input.payload = Some(serde_json::json!({ "event_type": record.event.event_type }));
        ledger
            .append(LedgerEntryType::DecisionEventAppended, append_input, now, None, &SignaturePolicy::none())
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
    }

    if record.event.event_type.is_finalize() {
        if options.config.receipts.require_risk_liability_signature {
            let existing = store.get_signature(&input.decision_id, record.seq).await?;
            let fresh = receipts::build_signature(&input.decision_id, record.seq, &receipt, &head_after, now)?;
            receipts::verify_or_accept_signature(existing.as_ref(), &fresh)
                .map_err(|v| PipelineError::Internal(v.message))?;
            store.put_signature(&fresh).await?;
        }

        if options
            .config
            .receipts
            .require_liability_shield_for_events
            .contains(&record.event.event_type)
        {
            let signer_state_hash = record
                .event
                .meta_str("signer_state_hash")
                .unwrap_or_default()
                .to_string();
            let existing = store.get_pls_shield(&input.decision_id, record.seq).await?;
            let fresh = receipts::build_pls_shield(
                &input.decision_id,
                record.seq,
                &record.event,
                &receipt,
                &signer_state_hash,
                now,
            )?;
            receipts::verify_or_accept_shield(existing.as_ref(), &fresh)
                .map_err(|v| PipelineError::Internal(v.message))?;
            store.put_pls_shield(&fresh).await?;
        }
    }

    // Stage 11: snapshot + anchor policy.
    let last_snapshot_seq = snapshot.as_ref().map(|s| s.up_to_seq).unwrap_or(0);
    if record.seq - last_snapshot_seq >= options.config.snapshot.every_n_events {
        let all_events = store.list_events(&input.decision_id).await?;
        let hashes: Vec<String> = all_events.iter().map(|r| r.hash.clone()).collect();
        let root_hash = ledger_merkle::merkle_root(hashes)?;
        let snapshot_state_hash = state_hash::tamper_hash(&head_after).map_err(EventStoreError::from)?;
        let provenance_tail_hash = provenance_nodes.last().map(|n| n.node_hash.clone());

        let new_snapshot = Snapshot {
            decision_id: input.decision_id.clone(),
            up_to_seq: record.seq,
            decision: head_after.clone(),
            created_at: now,
            checkpoint_hash: Some(record.hash.clone()),
            state_hash: snapshot_state_hash.clone(),
            provenance_tail_hash,
            root_hash: Some(root_hash.clone()),
        };
        store.put_snapshot(&new_snapshot).await?;

        if let Some(ledger) = options.global_ledger {
            let mut append_input = LedgerAppendInput::new();
            append_input.tenant_id = input.tenant_id.clone();
            append_input.decision_id = Some(input.decision_id.clone());
            append_input.snapshot_up_to_seq = Some(record.seq);
            ledger
                .append(LedgerEntryType::SnapshotCreated, append_input, now, None, &SignaturePolicy::none())
                .await
                .map_err(|e| PipelineError::Internal(e.to_string()))?;
        }

        if options.config.snapshot.anchoring_enabled {
            let anchor = store
                .append_anchor(
                    &input.decision_id,
                    record.seq,
                    Some(record.hash.clone()),
                    Some(root_hash),
                    Some(snapshot_state_hash),
                    now,
                )
                .await?;

            if let Some(ledger) = options.global_ledger {
                let mut append_input = LedgerAppendInput::new();
                append_input.tenant_id = input.tenant_id.clone();
                append_input.decision_id = Some(input.decision_id.clone());
                append_input.anchor_seq = Some(anchor.seq);
                ledger
                    .append(LedgerEntryType::AnchorAppended, append_input, now, None, &SignaturePolicy::none())
                    .await
                    .map_err(|e| PipelineError::Internal(e.to_string()))?;
            }
        }

        store
            .prune_snapshots(&input.decision_id, options.config.snapshot.keep_last_n_snapshots)
            .await?;
        if options.config.snapshot.prune_events_up_to_latest_snapshot {
            store.prune_events_up_to_seq(&input.decision_id, record.seq).await?;
        }
    }

    drop(_guard);

    Ok(ApplyOutcome {
        ok: true,
        decision: head_after,
        violations: warnings,
        consequence_preview: preview,
    })
}
