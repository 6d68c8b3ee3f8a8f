//! Cache keys for guardrail decisions.
//!
//! Inputs that differ only in case or whitespace share a decision.

use serde_json::Value;
use sha2::{Digest, Sha256};

const PREFIX: &str = "decision:";

/// Trim, collapse whitespace runs to one space, lowercase.
pub fn normalize_input(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `decision:` + hex SHA-256 of `guardrail_id \0 normalized_input`.
pub fn fingerprint(guardrail_id: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(guardrail_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_input(input).as_bytes());
    format!("{PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Key for a composite evaluation. Object keys serialize sorted, so
/// equivalent graphs hash the same.
pub fn dag_fingerprint(dag: &Value, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"dag");
    hasher.update([0u8]);
    hasher.update(dag.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_input(input).as_bytes());
    format!("{PREFIX}dag:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_input("  Hello \t\n  WORLD  "), "hello world");
        assert_eq!(normalize_input(""), "");
    }

    #[test]
    fn test_equivalent_inputs_share_a_key() {
        let a = fingerprint("toxicity", "Is this OK?");
        let b = fingerprint("toxicity", "  is   this ok?\n");
        assert_eq!(a, b);
        assert!(a.starts_with("decision:"));
        assert_eq!(a.len(), PREFIX.len() + 64);
    }

    #[test]
    fn test_guardrail_id_is_part_of_the_key() {
        assert_ne!(fingerprint("toxicity", "x"), fingerprint("pii-leak", "x"));
        // the separator keeps id/input boundaries distinct
        assert_ne!(fingerprint("ab", "c"), fingerprint("a", "bc"));
    }

    #[test]
    fn test_dag_key_ignores_field_order() {
        let a = json!({"nodes": [{"id": "n1"}], "entry": "n1"});
        let b: Value = serde_json::from_str(r#"{"entry":"n1","nodes":[{"id":"n1"}]}"#).unwrap();
        assert_eq!(dag_fingerprint(&a, "x"), dag_fingerprint(&b, "X"));
        assert_ne!(dag_fingerprint(&a, "x"), fingerprint("dag", "x"));
    }
}
