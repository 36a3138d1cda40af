//! The state-hash family (C2): tamper hash and public hash.
//!
//! Both are SHA-256 of canonical JSON of a `Decision` with a fixed set of
//! volatile/derived fields stripped first. The tamper hash detects in-place
//! mutation of the stored decision; the public hash is the same minus a few
//! additional private-artifact fields, safe to hand to an external verifier.
//!
//! The `amount` field is deliberately excluded from both hashes regardless
//! of which of its four historical locations (`amount`, `fields.amount`,
//! `artifacts.amount`, `artifacts.extra.amount`) a caller populated — this
//! workspace standardizes the canonical write location as
//! `artifacts.amount` (see DESIGN.md), but the hash strip removes all four
//! so the hash never depends on which variant a particular writer used.

use crate::model::Decision;
use ledger_enc::{canonical_hash, EncodingError};
use serde_json::{Map, Value};

const TOP_LEVEL_STRIP: &[&str] = &[
    "updated_at",
    "created_at",
    "deleted_at",
    "archived_at",
    "version",
    "history",
    "accountability",
    "state",
    "signatures",
    "execution",
    "amount",
    "provenance",
    "snapshots",
    "anchors",
    "public_state_hash",
    "tamper_state_hash",
];

const ARTIFACTS_STRIP: &[&str] = &["amount", "execution", "workflow", "workflow_status"];

const ARTIFACTS_EXTRA_STRIP: &[&str] = &[
    "execution",
    "workflow",
    "workflow_status",
    "liability_shield",
    "pls",
    "trust",
    "provenance",
    "amount",
];

const PUBLIC_ARTIFACTS_STRIP: &[&str] = &["private", "internal"];
const PUBLIC_ARTIFACTS_EXTRA_STRIP: &[&str] = &["private_internal_only"];

fn is_patch_or_helper_key(key: &str) -> bool {
    key.ends_with("_patch") || key.ends_with("_helper") || key.starts_with("patch_") || key.starts_with("helper_")
}

fn remove_keys(map: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        map.remove(*key);
    }
}

fn remove_patch_helper_keys_recursive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let to_remove: Vec<String> = map
                .keys()
                .filter(|k| is_patch_or_helper_key(k))
                .cloned()
                .collect();
            for key in to_remove {
                map.remove(&key);
            }
            for v in map.values_mut() {
                remove_patch_helper_keys_recursive(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                remove_patch_helper_keys_recursive(item);
            }
        }
        _ => {}
    }
}

fn strip_decision_value(mut value: Value, public: bool) -> Value {
    if let Value::Object(map) = &mut value {
        remove_keys(map, TOP_LEVEL_STRIP);

        if let Some(Value::Object(fields)) = map.get_mut("fields") {
            fields.remove("amount");
        }

        if let Some(Value::Object(artifacts)) = map.get_mut("artifacts") {
            remove_keys(artifacts, ARTIFACTS_STRIP);
            if public {
                remove_keys(artifacts, PUBLIC_ARTIFACTS_STRIP);
            }
            if let Some(Value::Object(extra)) = artifacts.get_mut("extra") {
                remove_keys(extra, ARTIFACTS_EXTRA_STRIP);
                if public {
                    remove_keys(extra, PUBLIC_ARTIFACTS_EXTRA_STRIP);
                }
            }
        }
    }
    remove_patch_helper_keys_recursive(&mut value);
    value
}

fn hash_stripped(decision: &Decision, kind: &str, public: bool) -> Result<String, EncodingError> {
    let raw = serde_json::to_value(decision).map_err(EncodingError::from)?;
    let stripped = strip_decision_value(raw, public);
    canonical_hash(&serde_json::json!({ "kind": kind, "decision": stripped }))
}

/// Store-integrity hash: detects in-place mutation of the persisted row.
pub fn tamper_hash(decision: &Decision) -> Result<String, EncodingError> {
    hash_stripped(decision, "TAMPER_STATE_HASH_V1", false)
}

/// Portable identity hash: tamper hash minus private/internal artifacts.
pub fn public_hash(decision: &Decision) -> Result<String, EncodingError> {
    hash_stripped(decision, "PUBLIC_STATE_HASH_V1", true)
}
