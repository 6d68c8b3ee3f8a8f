//! The enforcement proxy.
//!
//! Every request not owned by the admin routes is resolved to a contract,
//! checked by the request-stage guardrails, forwarded to the backend, and
//! checked and mitigated on the way back. Each request produces exactly one
//! request telemetry event, plus a violation event when it is blocked.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use http_body_util::LengthLimitError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use acvps_core::contract::{ContractRegistry, Stage};
use acvps_core::guardrail::{
    DecisionPipeline, RequestIdentity, ResponseOutcome, StageOutcome, extract_text,
};
use acvps_core::telemetry::GatewayMetrics;

use crate::backend::{BackendClient, BackendResponse};
use crate::error::{GatewayError, TRACE_HEADER};

pub const CONTRACT_HEADER: &str = "x-contract-id";
/// Older clients send the contract id here.
pub const LEGACY_CONTRACT_HEADER: &str = "x-dc-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CERTIFICATE_HEADER: &str = "x-certificate-id";
/// Non-blocking mitigation and review notices, `; `-separated.
pub const WARNINGS_HEADER: &str = "x-acvps-warnings";

pub struct ProxyState {
    pub registry: Arc<dyn ContractRegistry>,
    pub pipeline: Arc<DecisionPipeline>,
    pub backend: Arc<BackendClient>,
    pub metrics: Option<Arc<GatewayMetrics>>,
    pub require_contract: bool,
    pub max_body_bytes: usize,
    /// Cancelled when the gateway stops; outstanding guardrail waits end
    /// with 503.
    pub shutdown: CancellationToken,
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(enforce).with_state(state)
}

/// Contract references and caller identity carried in request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestRefs {
    contract_id: Option<String>,
    tenant_id: Option<String>,
    certificate_id: Option<String>,
    trace_id: String,
}

impl RequestRefs {
    fn parse(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            contract_id: get(CONTRACT_HEADER).or_else(|| get(LEGACY_CONTRACT_HEADER)),
            tenant_id: get(TENANT_HEADER),
            certificate_id: get(CERTIFICATE_HEADER),
            trace_id: get(TRACE_HEADER).unwrap_or_else(|| format!("trace-{}", Uuid::new_v4())),
        }
    }
}

/// A response cleared for release.
struct Passed {
    upstream: BackendResponse,
    warnings: Vec<String>,
    /// "allowed", "mitigated" or "unenforced"
    outcome: &'static str,
}

async fn enforce(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let mut refs = RequestRefs::parse(&parts.headers);
    let resolved = resolve_certificate(&state, &mut refs).await;
    let identity = RequestIdentity {
        trace_id: refs.trace_id.clone(),
        tenant_id: refs.tenant_id.clone().unwrap_or_default(),
        contract_id: refs.contract_id.clone().unwrap_or_default(),
        certificate_id: refs.certificate_id.clone().unwrap_or_default(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        ip_address: client_ip(&parts),
        user_agent: parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };

    let read = match resolved {
        Ok(()) => read_body(body, state.max_body_bytes).await,
        Err(err) => Err(err),
    };
    let (record, result) = match read {
        Ok(body) => {
            let record = state.pipeline.begin(identity, body.len() as u64);
            let result = handle(&state, &parts, &refs, body).await;
            (record, result)
        }
        Err(err) => (state.pipeline.begin(identity, 0), Err(err)),
    };

    let (response, outcome) = match &result {
        Ok(passed) => (
            release(&passed.upstream, &passed.warnings, &refs.trace_id),
            passed.outcome,
        ),
        Err(err) => {
            match err.block() {
                Some(block) => debug!(
                    trace_id = %refs.trace_id,
                    guardrail_id = %block.guardrail_id,
                    stage = block.stage.as_str(),
                    "Exchange blocked"
                ),
                None => warn!(trace_id = %refs.trace_id, error = %err, "Request refused"),
            }
            (err.to_response(&refs.trace_id), err.outcome())
        }
    };
    let block = result.as_ref().err().and_then(GatewayError::block);

    let status = response.status().as_u16();
    if let Some(metrics) = &state.metrics {
        metrics.record_request(outcome, status, record.elapsed().as_secs_f64());
    }
    record.finish(status, body_size(&response), block);
    response
}

async fn handle(
    state: &ProxyState,
    parts: &Parts,
    refs: &RequestRefs,
    body: Bytes,
) -> Result<Passed, GatewayError> {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let Some(contract_id) = refs.contract_id.as_deref() else {
        if state.require_contract {
            return Err(GatewayError::ContractRequired);
        }
        debug!(trace_id = %refs.trace_id, "No contract reference, forwarding unenforced");
        let upstream = state
            .backend
            .forward(&parts.method, target, &parts.headers, body)
            .await?;
        return Ok(Passed {
            upstream,
            warnings: Vec::new(),
            outcome: "unenforced",
        });
    };

    let contract = state.registry.enforceable(contract_id).await?;
    let cancel = state.shutdown.child_token();

    let prompt = extract_text(&body);
    let mut warnings = match state
        .pipeline
        .run_stage(&contract, Stage::Request, &prompt, &cancel)
        .await?
    {
        StageOutcome::Pass(pass) => pass.warnings,
        StageOutcome::Blocked(block) => return Err(GatewayError::Blocked(block)),
    };

    let mut upstream = state
        .backend
        .forward(&parts.method, target, &parts.headers, body)
        .await?;
    if !upstream.status.is_success() {
        debug!(
            trace_id = %refs.trace_id,
            status = upstream.status.as_u16(),
            "Backend returned an error status, response stage skipped"
        );
        return Ok(Passed {
            upstream,
            warnings,
            outcome: "allowed",
        });
    }

    match state
        .pipeline
        .enforce_response(&contract, &upstream.body, &cancel)
        .await?
    {
        ResponseOutcome::Blocked(block) => Err(GatewayError::Blocked(block)),
        ResponseOutcome::Pass(pass) => {
            let outcome = if pass.body.as_slice() == upstream.body.as_ref() {
                "allowed"
            } else {
                "mitigated"
            };
            warnings.extend(pass.warnings);
            upstream.body = Bytes::from(pass.body);
            Ok(Passed {
                upstream,
                warnings,
                outcome,
            })
        }
    }
}

/// Bind the request to the contract named by its certificate.
///
/// The certificate's contract and tenant replace whatever the headers
/// claimed; an explicit contract header that disagrees is refused.
async fn resolve_certificate(state: &ProxyState, refs: &mut RequestRefs) -> Result<(), GatewayError> {
    let Some(certificate_id) = refs.certificate_id.clone() else {
        return Ok(());
    };
    let certificate = state
        .registry
        .certificate(&certificate_id)
        .await
        .map_err(GatewayError::from_certificate_lookup)?;

    if let Some(requested) = refs.contract_id.as_deref()
        && requested != certificate.contract_id
    {
        return Err(GatewayError::CertificateMismatch {
            certificate_id,
            bound_contract: certificate.contract_id,
            requested_contract: requested.to_string(),
        });
    }

    debug!(
        trace_id = %refs.trace_id,
        certificate_id = %certificate_id,
        contract_id = %certificate.contract_id,
        "Contract resolved from certificate"
    );
    refs.contract_id = Some(certificate.contract_id);
    if let Some(tenant_id) = certificate.tenant_id {
        refs.tenant_id = Some(tenant_id);
    }
    Ok(())
}

/// Build the caller-facing response from a cleared backend response.
fn release(upstream: &BackendResponse, warnings: &[String], trace_id: &str) -> Response {
    let mut response = Response::new(Body::from(upstream.body.clone()));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers.clone();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(TRACE_HEADER, value);
    }
    if !warnings.is_empty()
        && let Ok(value) = HeaderValue::from_str(&header_safe(&warnings.join("; ")))
    {
        headers.insert(WARNINGS_HEADER, value);
    }
    response
}

/// Replace anything a header value cannot carry.
fn header_safe(text: &str) -> String {
    text.chars()
        .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { '?' })
        .collect()
}

fn body_size(response: &Response) -> u64 {
    use axum::body::HttpBody;
    response.body().size_hint().exact().unwrap_or(0)
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        if is_length_limit(&e) {
            GatewayError::PayloadTooLarge { limit }
        } else {
            GatewayError::InvalidBody(e.to_string())
        }
    })
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
fn client_ip(parts: &Parts) -> String {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default()
}
