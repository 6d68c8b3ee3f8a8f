//! Grounding confidence checks.

use serde_json::{Value, json};

use crate::contract::GroundingThreshold;

pub const NOTICE_KEY: &str = "_warning";
const NOTICE_TYPE: &str = "LOW_GROUNDING_CONFIDENCE";
const NOTICE_MESSAGE: &str = "This response may not be fully grounded in source data";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundingCheck {
    pub meets_threshold: bool,
    pub confidence: f64,
    /// Whether the body carried `grounding.confidence` at all.
    pub metadata_present: bool,
}

/// `grounding.confidence` from a response body, if present and numeric.
pub(crate) fn read_confidence(body: Option<&Value>) -> Option<f64> {
    body?.get("grounding")?.get("confidence")?.as_f64()
}

pub(crate) fn evaluate(
    body: Option<&Value>,
    threshold: &GroundingThreshold,
    require_metadata: bool,
) -> GroundingCheck {
    if !threshold.enabled {
        return GroundingCheck {
            meets_threshold: true,
            confidence: 1.0,
            metadata_present: read_confidence(body).is_some(),
        };
    }

    let found = read_confidence(body);
    let confidence = found.unwrap_or(if require_metadata { 0.0 } else { 1.0 });
    GroundingCheck {
        meets_threshold: confidence >= threshold.min_confidence,
        confidence,
        metadata_present: found.is_some(),
    }
}

/// Attach the low-grounding notice. Returns false if `body` is not an object.
pub(crate) fn inject_notice(body: &mut Value, confidence: f64, threshold: f64) -> bool {
    let Some(map) = body.as_object_mut() else {
        return false;
    };
    map.insert(
        NOTICE_KEY.to_string(),
        json!({
            "type": NOTICE_TYPE,
            "confidence": confidence,
            "threshold": threshold,
            "message": NOTICE_MESSAGE,
        }),
    );
    true
}
