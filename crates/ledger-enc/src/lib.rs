//! Canonical JSON serialization and SHA-256 hashing.
//!
//! Every hash in the decision ledger — event hashes, anchor hashes, receipt
//! hashes, provenance node hashes, ledger entry hashes — is `sha256_hex` over
//! `canonical_bytes` of some value. Two implementations of this crate that
//! disagree on a single byte produce two ledgers that can never verify
//! against each other, so the rules here are deliberately narrow and the
//! crate has no optional behavior.
//!
//! Canonicalization rules (see the top-level spec's canonical JSON section):
//! object keys are sorted, arrays preserve order, `null` is preserved, and a
//! pathological cyclic structure is replaced with the literal string
//! `"[Circular]"` rather than overflowing the stack. `serde_json::Value` as
//! built from owned Rust structs cannot actually contain a cycle, so the
//! guard below is a recursion-depth fence, not a visited-set; it exists so
//! the contract holds even against a hand-built `Value` fed in from outside
//! this crate.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Recursion depth past which a value is treated as circular.
///
/// No legitimate Decision/Event/Snapshot tree nests this deep; this is a
/// fence against accidental infinite recursion, not a realistic limit.
const MAX_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("value is not JSON-representable: {0}")]
    NotRepresentable(#[from] serde_json::Error),
}

/// Rebuild `value` with object keys sorted and recursion bounded.
///
/// `serde_json::Map` is backed by a `BTreeMap` in this workspace (the
/// `preserve_order` feature is never enabled), so a plain `serde_json::Value`
/// already serializes with sorted keys. This function exists anyway to make
/// the sort an explicit, tested contract rather than an incidental property
/// of a dependency's default feature set, and to fold in the depth guard.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    canonicalize_at_depth(value, 0)
}

fn canonicalize_at_depth(value: &serde_json::Value, depth: usize) -> serde_json::Value {
    if depth > MAX_DEPTH {
        return serde_json::Value::String("[Circular]".to_string());
    }
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(
                    key.clone(),
                    canonicalize_at_depth(&map[key], depth + 1),
                );
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| canonicalize_at_depth(item, depth + 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Serialize `value` to its canonical compact JSON byte representation.
///
/// `undefined`/absent fields have no representation in `serde_json::Value`
/// (a `#[serde(skip_serializing_if = "Option::is_none")]` field is simply
/// absent from the object), so that part of the canonicalization contract is
/// satisfied by how callers derive their types rather than by this function.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let raw = serde_json::to_value(value)?;
    let canon = canonicalize(&raw);
    Ok(serde_json::to_vec(&canon)?)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `sha256_hex(canonical_bytes(value))` — the hash primitive every
/// component in this workspace builds on.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, EncodingError> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let bytes = canonical_bytes(&value).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn preserves_array_order() {
        let value = json!([3, 1, 2]);
        let bytes = canonical_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "[3,1,2]");
    }

    #[test]
    fn preserves_null() {
        let value = json!({"a": null});
        let bytes = canonical_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":null}"#);
    }

    #[test]
    fn is_deterministic_across_calls() {
        let value = json!({"x": [1, 2, {"k": "v"}], "a": 1});
        let h1 = canonical_hash(&value).unwrap();
        let h2 = canonical_hash(&value).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_values_hash_differently() {
        let a = canonical_hash(&json!({"a": 1})).unwrap();
        let b = canonical_hash(&json!({"a": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = canonical_hash(&json!({"a": 1, "b": 2})).unwrap();
        let b = canonical_hash(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn deeply_nested_value_is_marked_circular_past_guard() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_DEPTH + 10) {
            value = json!([value]);
        }
        let canon = canonicalize(&value);
        // Walk down until we hit the guard's substitution.
        let mut cursor = &canon;
        let mut saw_circular = false;
        loop {
            match cursor {
                serde_json::Value::Array(items) if !items.is_empty() => cursor = &items[0],
                serde_json::Value::String(s) if s == "[Circular]" => {
                    saw_circular = true;
                    break;
                }
                _ => break,
            }
        }
        assert!(saw_circular);
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        // sha256("") per FIPS 180-4 test vectors.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    proptest::proptest! {
        #[test]
        fn canonicalization_is_idempotent(s in "[a-z]{1,8}", n in 0i64..1000) {
            let value = json!({"k": s, "n": n});
            let once = canonicalize(&value);
            let twice = canonicalize(&once);
            proptest::prop_assert_eq!(once, twice);
        }
    }
}
