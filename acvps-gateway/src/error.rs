//! Refusals returned to callers of the enforcement proxy.
//!
//! Every error becomes a JSON body `{"error": CODE, ...}` with the request's
//! trace id. Guardrail blocks also carry the guardrail, stage and reason.

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use acvps_core::contract::RegistryError;
use acvps_core::guardrail::{Block, PipelineError};

use crate::backend::BackendError;

/// Response header carrying the request's trace id.
pub const TRACE_HEADER: &str = "x-dc-trace";

#[derive(Debug, Error)]
pub enum GatewayError {
    // ─────────────────────────────────────────────────────────────────────
    // Caller errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("request carries no contract reference (X-Contract-ID or X-Certificate-ID)")]
    ContractRequired,

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    InvalidBody(String),

    // ─────────────────────────────────────────────────────────────────────
    // Certificate resolution
    // ─────────────────────────────────────────────────────────────────────
    #[error("certificate '{id}' not found")]
    CertificateNotFound { id: String },

    #[error("certificate lookup failed: {0}")]
    CertificateLookupFailed(String),

    #[error(
        "certificate '{certificate_id}' is bound to contract '{bound_contract}', not '{requested_contract}'"
    )]
    CertificateMismatch {
        certificate_id: String,
        bound_contract: String,
        requested_contract: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Contract resolution
    // ─────────────────────────────────────────────────────────────────────
    #[error("contract '{id}' not found")]
    ContractNotFound { id: String },

    #[error("{0}")]
    ContractInvalid(String),

    #[error("contract registry unavailable: {0}")]
    RegistryUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Enforcement
    // ─────────────────────────────────────────────────────────────────────
    #[error("blocked by guardrail '{}': {}", .0.guardrail_id, .0.reason)]
    Blocked(Block),

    #[error("request cancelled: gateway shutting down")]
    Cancelled,

    // ─────────────────────────────────────────────────────────────────────
    // Backend
    // ─────────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::NotFound { id, .. } => GatewayError::ContractNotFound { id: id.clone() },
            RegistryError::Inactive { .. } | RegistryError::Expired { .. } => {
                GatewayError::ContractInvalid(err.to_string())
            }
            RegistryError::Unavailable(_)
            | RegistryError::Malformed(_)
            | RegistryError::Client(_) => GatewayError::RegistryUnavailable(err.to_string()),
        }
    }
}

impl From<PipelineError> for GatewayError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Cancelled => GatewayError::Cancelled,
        }
    }
}

impl GatewayError {
    /// Map a failed certificate lookup.
    pub fn from_certificate_lookup(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { id, .. } => GatewayError::CertificateNotFound { id },
            other => GatewayError::CertificateLookupFailed(other.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ContractRequired => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::CertificateNotFound { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::CertificateLookupFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::CertificateMismatch { .. } => StatusCode::FORBIDDEN,
            GatewayError::ContractNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ContractInvalid(_) => StatusCode::FORBIDDEN,
            GatewayError::RegistryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Blocked(_) => StatusCode::FORBIDDEN,
            GatewayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ContractRequired => "CONTRACT_REQUIRED",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::InvalidBody(_) => "INVALID_BODY",
            GatewayError::CertificateNotFound { .. } => "CERT_NOT_FOUND",
            GatewayError::CertificateLookupFailed(_) => "CERT_LOOKUP_FAILED",
            GatewayError::CertificateMismatch { .. } => "CERT_CONTRACT_MISMATCH",
            GatewayError::ContractNotFound { .. } => "CONTRACT_NOT_FOUND",
            GatewayError::ContractInvalid(_) => "CONTRACT_INVALID",
            GatewayError::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
            GatewayError::Blocked(block) if block.is_mitigation() => "MITIGATION_BLOCKED",
            GatewayError::Blocked(_) => "GUARDRAIL_BLOCKED",
            GatewayError::Cancelled => "REQUEST_CANCELLED",
            GatewayError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Label for the `acvps_requests_total{outcome}` series.
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Blocked(_) => "blocked",
            _ => "error",
        }
    }

    pub fn block(&self) -> Option<&Block> {
        match self {
            GatewayError::Blocked(block) => Some(block),
            _ => None,
        }
    }

    /// The refusal sent to the caller.
    pub fn to_response(&self, trace_id: &str) -> Response {
        let body = match self {
            GatewayError::Blocked(block) => json!({
                "error": self.code(),
                "guardrail_id": block.guardrail_id,
                "reason": block.reason,
                "stage": block.stage.as_str(),
                "trace_id": trace_id,
            }),
            _ => json!({
                "error": self.code(),
                "message": self.to_string(),
                "trace_id": trace_id,
            }),
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            response.headers_mut().insert(TRACE_HEADER, value);
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acvps_core::contract::{ContractStatus, Stage};
    use acvps_core::guardrail::BlockKind;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_block_refusal_shape() {
        let err = GatewayError::Blocked(Block {
            stage: Stage::Request,
            guardrail_id: "pii-leak".into(),
            reason: "contains an SSN".into(),
            kind: BlockKind::Guardrail { score: 0.97 },
        });
        let response = err.to_response("trace-1");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[TRACE_HEADER], "trace-1");

        let body = body_json(response).await;
        assert_eq!(body["error"], "GUARDRAIL_BLOCKED");
        assert_eq!(body["guardrail_id"], "pii-leak");
        assert_eq!(body["reason"], "contains an SSN");
        assert_eq!(body["stage"], "request");
        assert_eq!(body["trace_id"], "trace-1");
    }

    #[test]
    fn test_mitigation_block_code() {
        let err = GatewayError::Blocked(Block {
            stage: Stage::Response,
            guardrail_id: "grounding".into(),
            reason: "low".into(),
            kind: BlockKind::Grounding {
                confidence: 0.3,
                threshold: 0.8,
            },
        });
        assert_eq!(err.code(), "MITIGATION_BLOCKED");
        assert_eq!(err.outcome(), "blocked");
    }

    #[test]
    fn test_registry_error_mapping() {
        let not_found: GatewayError = RegistryError::NotFound {
            kind: "contract",
            id: "dc-x".into(),
        }
        .into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.code(), "CONTRACT_NOT_FOUND");

        let down: GatewayError = RegistryError::Unavailable("refused".into()).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.code(), "REGISTRY_UNAVAILABLE");

        let revoked: GatewayError = RegistryError::Inactive {
            id: "dc-1".into(),
            status: ContractStatus::Revoked,
        }
        .into();
        assert_eq!(revoked.status(), StatusCode::FORBIDDEN);
        assert_eq!(revoked.code(), "CONTRACT_INVALID");
    }

    #[test]
    fn test_certificate_error_mapping() {
        let missing = GatewayError::from_certificate_lookup(RegistryError::NotFound {
            kind: "certificate",
            id: "cert-x".into(),
        });
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.code(), "CERT_NOT_FOUND");

        let down = GatewayError::from_certificate_lookup(RegistryError::Unavailable("refused".into()));
        assert_eq!(down.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(down.code(), "CERT_LOOKUP_FAILED");

        let mismatch = GatewayError::CertificateMismatch {
            certificate_id: "cert-1".into(),
            bound_contract: "dc-chat".into(),
            requested_contract: "dc-other".into(),
        };
        assert_eq!(mismatch.status(), StatusCode::FORBIDDEN);
        assert_eq!(mismatch.code(), "CERT_CONTRACT_MISMATCH");
    }

    #[tokio::test]
    async fn test_generic_refusal_has_message() {
        let response = GatewayError::ContractRequired.to_response("trace-2");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "CONTRACT_REQUIRED");
        assert!(body["message"].as_str().unwrap().contains("X-Contract-ID"));
    }
}
