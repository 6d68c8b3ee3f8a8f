//! JSON tree redaction.

use serde_json::Value;

use super::patterns::{PiiCounts, redact_text};

/// Replacement for always-redact fields and over-deep subtrees.
pub const REDACTED: &str = "[REDACTED]";

/// What a redaction pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedactionReport {
    pub pii: PiiCounts,
    /// Always-redact fields replaced.
    pub fields: usize,
    /// Subtrees below the depth limit replaced wholesale.
    pub truncated: usize,
}

impl RedactionReport {
    pub fn was_modified(&self) -> bool {
        self.pii.total() > 0 || self.fields > 0 || self.truncated > 0
    }
}

pub(crate) struct TreeRedactor<'a> {
    /// Lowercased field names.
    always_redact: &'a [String],
    max_depth: usize,
}

impl<'a> TreeRedactor<'a> {
    pub(crate) fn new(always_redact: &'a [String], max_depth: usize) -> Self {
        Self {
            always_redact,
            max_depth,
        }
    }

    pub(crate) fn redact(&self, value: &mut Value, report: &mut RedactionReport) {
        self.visit(value, 0, report);
    }

    fn is_sensitive(&self, key: &str) -> bool {
        self.always_redact
            .iter()
            .any(|field| field.eq_ignore_ascii_case(key))
    }

    fn visit(&self, value: &mut Value, depth: usize, report: &mut RedactionReport) {
        match value {
            Value::String(text) => {
                if let Some(redacted) = redact_text(text, &mut report.pii) {
                    *text = redacted;
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.visit_child(item, depth, report);
                }
            }
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.is_sensitive(key) {
                        if child.as_str() != Some(REDACTED) {
                            *child = Value::String(REDACTED.to_string());
                            report.fields += 1;
                        }
                        continue;
                    }
                    self.visit_child(child, depth, report);
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    fn visit_child(&self, child: &mut Value, parent_depth: usize, report: &mut RedactionReport) {
        let depth = parent_depth + 1;
        if depth >= self.max_depth && (child.is_object() || child.is_array()) {
            *child = Value::String(REDACTED.to_string());
            report.truncated += 1;
            return;
        }
        self.visit(child, depth, report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(value: &mut Value, fields: &[&str], max_depth: usize) -> RedactionReport {
        let fields: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
        let mut report = RedactionReport::default();
        TreeRedactor::new(&fields, max_depth).redact(value, &mut report);
        report
    }

    #[test]
    fn test_pattern_redaction_in_nested_values() {
        let mut body = json!({
            "email": "a@b.com",
            "notes": "call 555-123-4567",
            "history": [{"text": "ssn 123-45-6789"}, 42, null]
        });
        let report = run(&mut body, &[], 64);
        assert_eq!(
            body,
            json!({
                "email": "[REDACTED-EMAIL]",
                "notes": "call [REDACTED-PHONE]",
                "history": [{"text": "ssn [REDACTED-SSN]"}, 42, null]
            })
        );
        assert_eq!(report.pii.total(), 3);
        assert!(report.was_modified());
    }

    #[test]
    fn test_always_redact_is_case_insensitive_and_not_descended() {
        let mut body = json!({
            "Patient": {"name": "Jane", "dob": "1990-01-01"},
            "diagnosis": "flu"
        });
        let report = run(&mut body, &["patient"], 64);
        assert_eq!(body, json!({"Patient": "[REDACTED]", "diagnosis": "flu"}));
        assert_eq!(report.fields, 1);
        assert_eq!(report.pii.total(), 0);
    }

    #[test]
    fn test_already_redacted_field_is_not_counted() {
        let mut body = json!({"ssn": "[REDACTED]"});
        let report = run(&mut body, &["ssn"], 64);
        assert!(!report.was_modified());
    }

    #[test]
    fn test_depth_limit_replaces_deep_subtrees() {
        let mut body = json!({"a": {"b": {"c": {"d": "deep"}}}, "top": "ok"});
        let report = run(&mut body, &[], 3);
        assert_eq!(body, json!({"a": {"b": {"c": "[REDACTED]"}}, "top": "ok"}));
        assert_eq!(report.truncated, 1);

        let again = run(&mut body, &[], 3);
        assert!(!again.was_modified());
    }
}
