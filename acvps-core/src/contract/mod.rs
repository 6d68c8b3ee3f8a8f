//! Contracts, certificates and the registry that resolves them.
//!
//! A contract is immutable once issued. The gateway only reads it: the
//! ordered guardrail list, the enforcement stages, and the mitigation
//! thresholds applied to responses.

mod registry;

pub use registry::{
    CachedContractRegistry, ContractRegistry, HttpContractRegistry, RegistryError,
    StaticContractRegistry, from_config as registry_from_config,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, versioned policy bundle.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Contract {
    pub contract_id: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// e.g. `patient-intake/healthcare/us/v1.0`
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Evaluated in order; the first block wins.
    #[serde(default)]
    pub guardrails: Vec<GuardrailRef>,
    /// Composite guardrail graph, evaluated in one evaluator call.
    #[serde(default)]
    pub dag: Option<serde_json::Value>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
    /// Overrides the gateway-wide evaluator failure policy.
    #[serde(default)]
    pub evaluator_failure: Option<FailurePolicy>,
    #[serde(default)]
    pub status: ContractStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_stages() -> Vec<Stage> {
    vec![Stage::Request, Stage::Response]
}

impl Contract {
    pub fn enforces(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn failure_policy(&self, gateway_default: FailurePolicy) -> FailurePolicy {
        self.evaluator_failure.unwrap_or(gateway_default)
    }

    pub fn guardrail_ids(&self) -> impl Iterator<Item = &str> {
        self.guardrails.iter().map(|g| g.id.as_str())
    }

    /// Whether the contract may be enforced at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ContractStatus::Active && self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuardrailRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl GuardrailRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    pub grounding: GroundingThreshold,
    pub pii: PiiPolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GroundingThreshold {
    pub enabled: bool,
    pub min_confidence: f64,
    pub action: GroundingAction,
}

impl Default for GroundingThreshold {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.8,
            action: GroundingAction::InjectNotice,
        }
    }
}

/// What to do with a response whose grounding confidence is below threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundingAction {
    Block,
    InjectNotice,
    AllowWithWarning,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PiiPolicy {
    pub enabled: bool,
    /// Map keys whose values are replaced wholesale (case-insensitive).
    pub always_redact: Vec<String>,
}

impl Default for PiiPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            always_redact: Vec::new(),
        }
    }
}

/// Where in the exchange a guardrail runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Prompt on its way to the LLM.
    Request,
    /// Answer on its way back to the application.
    Response,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Response => "response",
        }
    }
}

/// Behavior when the guardrail evaluator cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailClosed,
    FailOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    #[default]
    Active,
    Revoked,
    Expired,
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContractStatus::Draft => "draft",
            ContractStatus::Active => "active",
            ContractStatus::Revoked => "revoked",
            ContractStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Signed attestation binding a contract to an enforcement instance.
///
/// Passed through untouched; the gateway never verifies `signature`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Certificate {
    pub certificate_id: String,
    pub contract_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn contract(json: serde_json::Value) -> Contract {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_minimal_contract_defaults() {
        let c = contract(serde_json::json!({
            "contract_id": "dc-1",
            "guardrails": [{"id": "toxicity"}]
        }));
        assert_eq!(c.version, "1.0");
        assert!(c.enforces(Stage::Request));
        assert!(c.enforces(Stage::Response));
        assert_eq!(c.thresholds.grounding.action, GroundingAction::InjectNotice);
        assert_eq!(c.status, ContractStatus::Active);
        assert_eq!(c.failure_policy(FailurePolicy::FailOpen), FailurePolicy::FailOpen);
    }

    #[test]
    fn test_contract_override_failure_policy() {
        let c = contract(serde_json::json!({
            "contract_id": "dc-1",
            "evaluator_failure": "fail_closed",
            "stages": ["response"]
        }));
        assert_eq!(
            c.failure_policy(FailurePolicy::FailOpen),
            FailurePolicy::FailClosed
        );
        assert!(!c.enforces(Stage::Request));
    }

    #[test]
    fn test_contract_usability() {
        let now = Utc::now();
        let mut c = contract(serde_json::json!({"contract_id": "dc-1"}));
        assert!(c.is_usable_at(now));

        c.expires_at = Some(now - Duration::seconds(1));
        assert!(!c.is_usable_at(now));

        c.expires_at = Some(now + Duration::hours(1));
        c.status = ContractStatus::Revoked;
        assert!(!c.is_usable_at(now));
    }
}
