//! Response mitigation: grounding enforcement and PII redaction.
//!
//! [`MitigationEngine::apply_mitigation`] is the response-stage entry point.
//! It parses the body once, checks grounding first, then redacts, and
//! re-serializes only if something changed. Bodies that are not JSON take
//! the plain-text redaction path.

mod grounding;
mod patterns;
mod redact;

pub use grounding::{GroundingCheck, NOTICE_KEY};
pub use patterns::{PiiCounts, PiiKind, redact_text};
pub use redact::{REDACTED, RedactionReport};

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MitigationSection;
use crate::contract::{Contract, GroundingAction, GroundingThreshold, PiiPolicy};
use crate::telemetry::GatewayMetrics;

use redact::TreeRedactor;

pub const WARNING_LOW_GROUNDING: &str = "Low grounding confidence";
pub const WARNING_PII_REDACTED: &str = "PII redacted";

#[derive(Debug, Error)]
pub enum MitigationError {
    /// Grounding action is `block` and confidence is under the minimum.
    #[error("grounding confidence {confidence:.2} below required {threshold:.2}")]
    GroundingBelowThreshold { confidence: f64, threshold: f64 },

    /// The redacted body could not be re-encoded. No partial content is
    /// released.
    #[error("failed to re-encode mitigated body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of a successful mitigation pass.
#[derive(Debug, Clone)]
pub struct Mitigated {
    pub body: Vec<u8>,
    /// One entry per mitigation applied.
    pub warnings: Vec<String>,
    pub redaction: RedactionReport,
    pub grounding: GroundingCheck,
}

impl Mitigated {
    pub fn was_modified(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub struct MitigationEngine {
    max_depth: usize,
    require_grounding_metadata: bool,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl Default for MitigationEngine {
    fn default() -> Self {
        Self::new(&MitigationSection::default())
    }
}

impl MitigationEngine {
    pub fn new(config: &MitigationSection) -> Self {
        Self {
            max_depth: config.max_depth,
            require_grounding_metadata: config.grounding.require_metadata,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Redact PII from a JSON or plain-text body.
    ///
    /// Returns the original bytes untouched when nothing matched.
    pub fn redact_pii(&self, body: &[u8], policy: &PiiPolicy) -> (Vec<u8>, RedactionReport) {
        let mut report = RedactionReport::default();
        if !policy.enabled {
            return (body.to_vec(), report);
        }

        let redacted = match serde_json::from_slice::<Value>(body) {
            Ok(mut value) => {
                self.redact_tree(&mut value, policy, &mut report);
                if report.was_modified() {
                    serde_json::to_vec(&value).ok()
                } else {
                    None
                }
            }
            Err(_) => redact_plain(body, &mut report),
        };

        match redacted {
            Some(bytes) => (bytes, report),
            None if report.was_modified() => {
                // Re-encoding failed; never hand back the unredacted body.
                warn!("Redacted body could not be re-encoded, withholding content");
                (REDACTED.as_bytes().to_vec(), report)
            }
            None => (body.to_vec(), report),
        }
    }

    /// Grounding confidence of a body against a threshold.
    pub fn check_grounding(&self, body: &[u8], threshold: &GroundingThreshold) -> GroundingCheck {
        let parsed = serde_json::from_slice::<Value>(body).ok();
        grounding::evaluate(parsed.as_ref(), threshold, self.require_grounding_metadata)
    }

    /// Grounding then redaction, per the contract's thresholds.
    pub fn apply_mitigation(
        &self,
        body: &[u8],
        contract: &Contract,
    ) -> Result<Mitigated, MitigationError> {
        let thresholds = &contract.thresholds;
        let mut parsed = serde_json::from_slice::<Value>(body).ok();
        let mut warnings = Vec::new();
        let mut tree_changed = false;

        let check = grounding::evaluate(
            parsed.as_ref(),
            &thresholds.grounding,
            self.require_grounding_metadata,
        );
        if !check.meets_threshold {
            let min = thresholds.grounding.min_confidence;
            match thresholds.grounding.action {
                GroundingAction::Block => {
                    info!(
                        contract_id = %contract.contract_id,
                        confidence = check.confidence,
                        threshold = min,
                        "Response blocked for low grounding confidence"
                    );
                    self.record("grounding_block", 1);
                    return Err(MitigationError::GroundingBelowThreshold {
                        confidence: check.confidence,
                        threshold: min,
                    });
                }
                GroundingAction::InjectNotice => {
                    let injected = match parsed.as_mut() {
                        Some(value) => grounding::inject_notice(value, check.confidence, min),
                        None => false,
                    };
                    if injected {
                        tree_changed = true;
                    } else {
                        debug!("Body is not a JSON object, notice not attached");
                    }
                    self.record("grounding_notice", 1);
                    warnings.push(WARNING_LOW_GROUNDING.to_string());
                }
                GroundingAction::AllowWithWarning => {
                    self.record("grounding_warning", 1);
                    warnings.push(WARNING_LOW_GROUNDING.to_string());
                }
            }
        }

        let mut report = RedactionReport::default();
        let mut text_body = None;
        if thresholds.pii.enabled {
            match parsed.as_mut() {
                Some(value) => {
                    self.redact_tree(value, &thresholds.pii, &mut report);
                    tree_changed |= report.was_modified();
                }
                None => text_body = redact_plain(body, &mut report),
            }
            if report.was_modified() {
                self.record_redaction(&report);
                warnings.push(WARNING_PII_REDACTED.to_string());
            }
        }

        let body = match (parsed, text_body) {
            (Some(value), _) if tree_changed => serde_json::to_vec(&value)?,
            (_, Some(text)) => text,
            _ => body.to_vec(),
        };

        Ok(Mitigated {
            body,
            warnings,
            redaction: report,
            grounding: check,
        })
    }

    fn redact_tree(&self, value: &mut Value, policy: &PiiPolicy, report: &mut RedactionReport) {
        let fields: Vec<String> = policy
            .always_redact
            .iter()
            .map(|f| f.to_lowercase())
            .collect();
        TreeRedactor::new(&fields, self.max_depth).redact(value, report);
    }

    fn record(&self, action: &str, count: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.record_mitigation(action, count);
        }
    }

    fn record_redaction(&self, report: &RedactionReport) {
        for kind in PiiKind::ALL {
            let n = report.pii.get(kind);
            if n > 0 {
                self.record(&format!("pii_{}", kind.as_str()), n as u64);
            }
        }
        if report.fields > 0 {
            self.record("field_redacted", report.fields as u64);
        }
        if report.truncated > 0 {
            self.record("depth_truncated", report.truncated as u64);
        }
    }
}

/// Plain-text path. Non-UTF-8 bodies are passed through.
fn redact_plain(body: &[u8], report: &mut RedactionReport) -> Option<Vec<u8>> {
    let Ok(text) = std::str::from_utf8(body) else {
        debug!(len = body.len(), "Body is neither JSON nor UTF-8, skipping redaction");
        return None;
    };
    redact_text(text, &mut report.pii).map(String::into_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Thresholds;
    use proptest::prelude::*;
    use serde_json::json;

    fn contract(grounding: GroundingThreshold, always_redact: &[&str]) -> Contract {
        serde_json::from_value::<Contract>(json!({"contract_id": "dc-test"}))
            .map(|mut c| {
                c.thresholds = Thresholds {
                    grounding,
                    pii: PiiPolicy {
                        enabled: true,
                        always_redact: always_redact.iter().map(|s| s.to_string()).collect(),
                    },
                };
                c
            })
            .unwrap()
    }

    fn grounding(action: GroundingAction) -> GroundingThreshold {
        GroundingThreshold {
            enabled: true,
            min_confidence: 0.8,
            action,
        }
    }

    fn as_json(bytes: &[u8]) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_plain_text_ssn() {
        let engine = MitigationEngine::default();
        let (body, report) = engine.redact_pii(b"SSN: 123-45-6789", &PiiPolicy::default());
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("[REDACTED-SSN]"));
        assert!(!text.contains("123-45-6789"));
        assert!(report.was_modified());
    }

    #[test]
    fn test_json_fields_redacted_by_pattern() {
        let engine = MitigationEngine::default();
        let input = br#"{"email": "a@b.com", "notes": "call 555-123-4567"}"#;
        let (body, report) = engine.redact_pii(input, &PiiPolicy::default());
        assert_eq!(
            as_json(&body),
            json!({"email": "[REDACTED-EMAIL]", "notes": "call [REDACTED-PHONE]"})
        );
        assert_eq!(report.pii.email, 1);
        assert_eq!(report.pii.phone, 1);
    }

    #[test]
    fn test_unmodified_body_is_byte_identical() {
        let engine = MitigationEngine::default();
        let input = b"{ \"answer\" :  \"nothing sensitive\" }";
        let (body, report) = engine.redact_pii(input, &PiiPolicy::default());
        assert_eq!(body, input.to_vec());
        assert!(!report.was_modified());
    }

    #[test]
    fn test_disabled_pii_policy() {
        let engine = MitigationEngine::default();
        let policy = PiiPolicy {
            enabled: false,
            always_redact: vec![],
        };
        let (body, report) = engine.redact_pii(b"SSN: 123-45-6789", &policy);
        assert_eq!(body, b"SSN: 123-45-6789".to_vec());
        assert!(!report.was_modified());
    }

    #[test]
    fn test_check_grounding_disabled() {
        let engine = MitigationEngine::default();
        let mut threshold = grounding(GroundingAction::Block);
        threshold.enabled = false;
        let check = engine.check_grounding(br#"{"grounding": {"confidence": 0.1}}"#, &threshold);
        assert!(check.meets_threshold);
        assert_eq!(check.confidence, 1.0);
    }

    #[test]
    fn test_inject_notice_keeps_content() {
        let engine = MitigationEngine::default();
        let input = json!({"answer": "Take with food.", "grounding": {"confidence": 0.4}});
        let out = engine
            .apply_mitigation(
                &serde_json::to_vec(&input).unwrap(),
                &contract(grounding(GroundingAction::InjectNotice), &[]),
            )
            .unwrap();

        let mut body = as_json(&out.body);
        let notice = body
            .as_object_mut()
            .and_then(|m| m.remove(NOTICE_KEY))
            .expect("notice attached");
        assert_eq!(body, input);
        assert_eq!(notice["type"], "LOW_GROUNDING_CONFIDENCE");
        assert_eq!(notice["confidence"], 0.4);
        assert_eq!(notice["threshold"], 0.8);
        assert_eq!(out.warnings, vec![WARNING_LOW_GROUNDING]);
    }

    #[test]
    fn test_block_returns_error_without_body() {
        let engine = MitigationEngine::default();
        let input = br#"{"answer": "x", "grounding": {"confidence": 0.4}}"#;
        let err = engine
            .apply_mitigation(input, &contract(grounding(GroundingAction::Block), &[]))
            .unwrap_err();
        match err {
            MitigationError::GroundingBelowThreshold {
                confidence,
                threshold,
            } => {
                assert_eq!(confidence, 0.4);
                assert_eq!(threshold, 0.8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_with_warning_leaves_body() {
        let engine = MitigationEngine::default();
        let input = br#"{"answer": "x", "grounding": {"confidence": 0.4}}"#;
        let out = engine
            .apply_mitigation(
                input,
                &contract(grounding(GroundingAction::AllowWithWarning), &[]),
            )
            .unwrap();
        assert_eq!(out.body, input.to_vec());
        assert_eq!(out.warnings, vec![WARNING_LOW_GROUNDING]);
    }

    #[test]
    fn test_grounding_then_redaction_accumulates_warnings() {
        let engine = MitigationEngine::default();
        let input = br#"{"answer": "SSN 123-45-6789", "ssn": "123456789", "grounding": {"confidence": 0.5}}"#;
        let out = engine
            .apply_mitigation(
                input,
                &contract(grounding(GroundingAction::InjectNotice), &["SSN"]),
            )
            .unwrap();
        let body = as_json(&out.body);
        assert_eq!(body["answer"], "SSN [REDACTED-SSN]");
        assert_eq!(body["ssn"], REDACTED);
        assert!(body.get(NOTICE_KEY).is_some());
        assert_eq!(out.warnings, vec![WARNING_LOW_GROUNDING, WARNING_PII_REDACTED]);
        assert_eq!(out.redaction.fields, 1);
    }

    #[test]
    fn test_missing_grounding_metadata_policy() {
        let strict = MitigationEngine::new(&MitigationSection {
            grounding: crate::config::GroundingSection {
                require_metadata: true,
            },
            ..MitigationSection::default()
        });
        let input = br#"{"answer": "x"}"#;
        let c = contract(grounding(GroundingAction::Block), &[]);

        assert!(MitigationEngine::default().apply_mitigation(input, &c).is_ok());
        assert!(matches!(
            strict.apply_mitigation(input, &c),
            Err(MitigationError::GroundingBelowThreshold { confidence, .. }) if confidence == 0.0
        ));
    }

    #[test]
    fn test_plain_text_response_mitigation() {
        let engine = MitigationEngine::default();
        let out = engine
            .apply_mitigation(
                b"Reach me at a@b.com",
                &contract(grounding(GroundingAction::InjectNotice), &[]),
            )
            .unwrap();
        assert_eq!(out.body, b"Reach me at [REDACTED-EMAIL]".to_vec());
        assert_eq!(out.warnings, vec![WARNING_PII_REDACTED]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Idempotence
    // ─────────────────────────────────────────────────────────────────────────

    fn fragment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("123-45-6789".to_string()),
            Just("4111 1111 1111 1111".to_string()),
            Just("jane@example.com".to_string()),
            Just("555-123-4567".to_string()),
            Just("[REDACTED]".to_string()),
            "[a-z ]{0,8}",
            "[0-9 .@-]{0,14}",
        ]
    }

    fn text() -> impl Strategy<Value = String> {
        prop::collection::vec(fragment(), 0..6).prop_map(|parts| parts.concat())
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            text().prop_map(Value::String),
            any::<i64>().prop_map(Value::from),
            Just(Value::Null),
        ];
        leaf.prop_recursive(5, 48, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}|ssn|email", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_text_redaction_is_idempotent(input in text()) {
            let engine = MitigationEngine::default();
            let policy = PiiPolicy::default();
            let (once, _) = engine.redact_pii(input.as_bytes(), &policy);
            let (twice, report) = engine.redact_pii(&once, &policy);
            prop_assert_eq!(&once, &twice);
            prop_assert!(!report.was_modified());
        }

        #[test]
        fn prop_json_redaction_is_idempotent(value in json_value()) {
            let engine = MitigationEngine::new(&MitigationSection {
                max_depth: 3,
                ..MitigationSection::default()
            });
            let policy = PiiPolicy { enabled: true, always_redact: vec!["ssn".to_string()] };
            let input = serde_json::to_vec(&value).unwrap();
            let (once, _) = engine.redact_pii(&input, &policy);
            let (twice, _) = engine.redact_pii(&once, &policy);
            prop_assert_eq!(once, twice);
        }
    }
}
