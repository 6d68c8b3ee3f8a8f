//! Prometheus metrics using the prometheus-client crate.
//!
//! [`GatewayMetrics`] registers every series the gateway exports on the
//! admin `/metrics` endpoint (OpenMetrics text format). Components take an
//! optional `Arc<GatewayMetrics>` and call the `record_*` helpers.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use super::cardinality::CardinalityLimiter;

/// Distinct guardrail ids tracked before collapsing into `__other__`.
const MAX_GUARDRAIL_LABELS: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// "allowed", "blocked", "mitigated" or "error"
    pub outcome: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub guardrail_id: String,
    /// "allow", "block" or "review"
    pub decision: String,
    /// "cache" or "evaluator"
    pub source: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    /// "hit", "miss", or an error kind
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EvaluatorLabels {
    /// "ok" or "error"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MitigationLabels {
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlushLabels {
    /// "success" or "failure"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// "evicted" or "sink_failure"
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Buckets (seconds)
// ─────────────────────────────────────────────────────────────────────────────

const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const EVALUATOR_DURATION_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0];

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

pub struct GatewayMetrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Histogram,
    pub decisions_total: Family<DecisionLabels, Counter>,
    pub cache_lookups_total: Family<CacheLabels, Counter>,
    pub evaluator_calls_total: Family<EvaluatorLabels, Counter>,
    pub evaluator_duration_seconds: Histogram,
    pub mitigations_total: Family<MitigationLabels, Counter>,
    pub telemetry_flushes_total: Family<FlushLabels, Counter>,
    pub telemetry_dropped_total: Family<DropLabels, Counter>,
    pub telemetry_buffered: Gauge,
    guardrail_limiter: CardinalityLimiter,
}

impl GatewayMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "acvps_requests",
            "Enforced requests by outcome and status code",
            requests_total.clone(),
        );

        let request_duration_seconds = Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied());
        registry.register(
            "acvps_request_duration_seconds",
            "End-to-end enforced request latency",
            request_duration_seconds.clone(),
        );

        let decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "acvps_decisions",
            "Guardrail decisions by guardrail, verdict and source",
            decisions_total.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "acvps_cache_lookups",
            "Cache lookups by result",
            cache_lookups_total.clone(),
        );

        let evaluator_calls_total = Family::<EvaluatorLabels, Counter>::default();
        registry.register(
            "acvps_evaluator_calls",
            "Guardrail evaluator calls by outcome",
            evaluator_calls_total.clone(),
        );

        let evaluator_duration_seconds =
            Histogram::new(EVALUATOR_DURATION_BUCKETS.iter().copied());
        registry.register(
            "acvps_evaluator_duration_seconds",
            "Guardrail evaluator call latency",
            evaluator_duration_seconds.clone(),
        );

        let mitigations_total = Family::<MitigationLabels, Counter>::default();
        registry.register(
            "acvps_mitigations",
            "Mitigation actions applied to responses",
            mitigations_total.clone(),
        );

        let telemetry_flushes_total = Family::<FlushLabels, Counter>::default();
        registry.register(
            "acvps_telemetry_flushes",
            "Telemetry batch flushes by outcome",
            telemetry_flushes_total.clone(),
        );

        let telemetry_dropped_total = Family::<DropLabels, Counter>::default();
        registry.register(
            "acvps_telemetry_dropped",
            "Telemetry events dropped by reason",
            telemetry_dropped_total.clone(),
        );

        let telemetry_buffered = Gauge::default();
        registry.register(
            "acvps_telemetry_buffered_events",
            "Events waiting in the telemetry buffer",
            telemetry_buffered.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            decisions_total,
            cache_lookups_total,
            evaluator_calls_total,
            evaluator_duration_seconds,
            mitigations_total,
            telemetry_flushes_total,
            telemetry_dropped_total,
            telemetry_buffered,
            guardrail_limiter: CardinalityLimiter::new(MAX_GUARDRAIL_LABELS),
        }
    }

    pub fn record_request(&self, outcome: &str, status: u16, duration_secs: f64) {
        self.requests_total
            .get_or_create(&RequestLabels {
                outcome: outcome.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.request_duration_seconds.observe(duration_secs);
    }

    pub fn record_decision(&self, guardrail_id: &str, decision: &str, source: &str) {
        self.decisions_total
            .get_or_create(&DecisionLabels {
                guardrail_id: self.guardrail_limiter.admit(guardrail_id).to_string(),
                decision: decision.to_string(),
                source: source.to_string(),
            })
            .inc();
    }

    pub fn record_cache_lookup(&self, result: &str) {
        self.cache_lookups_total
            .get_or_create(&CacheLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_cache_error(&self, kind: &str) {
        self.record_cache_lookup(&format!("error_{kind}"));
    }

    pub fn record_evaluator_call(&self, ok: bool, duration_secs: f64) {
        self.evaluator_calls_total
            .get_or_create(&EvaluatorLabels {
                outcome: if ok { "ok" } else { "error" }.to_string(),
            })
            .inc();
        self.evaluator_duration_seconds.observe(duration_secs);
    }

    pub fn record_mitigation(&self, action: &str, count: u64) {
        self.mitigations_total
            .get_or_create(&MitigationLabels {
                action: action.to_string(),
            })
            .inc_by(count);
    }

    pub fn record_telemetry_flush(&self, success: bool) {
        self.telemetry_flushes_total
            .get_or_create(&FlushLabels {
                outcome: if success { "success" } else { "failure" }.to_string(),
            })
            .inc();
    }

    pub fn record_telemetry_dropped(&self, reason: &str, count: u64) {
        self.telemetry_dropped_total
            .get_or_create(&DropLabels {
                reason: reason.to_string(),
            })
            .inc_by(count);
    }
}
