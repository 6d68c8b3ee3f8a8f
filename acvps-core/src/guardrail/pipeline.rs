//! The guardrail decision pipeline.
//!
//! For one stage of one request the pipeline walks the contract's guardrails
//! in order:
//!
//! ```text
//! PENDING → (CACHE_HIT | EVALUATING) → DECIDED → (MITIGATING) → COMPLETE
//!                          └─────────→ FAILED ←──────┘
//! ```
//!
//! All decision keys are fetched from the cache in one round trip. Misses
//! go to the evaluator in a detached task that also writes the cache, so a
//! caller that gives up (cancellation, deadline) never leaves the cache
//! half-written and the work is not wasted. The first block wins.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decision::{Decision, DecisionSource, Verdict};
use super::evaluator::{EvaluatorError, GuardrailEvaluator};
use super::fingerprint::{dag_fingerprint, fingerprint};
use super::record::{RequestIdentity, RequestRecord};
use super::text::extract_text;
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::contract::{Contract, FailurePolicy, Stage};
use crate::mitigation::{MitigationEngine, MitigationError};
use crate::telemetry::{GatewayMetrics, Severity, TelemetryBuffer, ViolationEvent};

/// Reason given when the failure policy turns an evaluator outage into a block.
pub const EVALUATOR_UNAVAILABLE: &str = "guardrail evaluator unavailable";

/// Pseudo guardrail id reported for a composite evaluation.
pub const COMPOSITE_ID: &str = "dag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pending,
    CacheHit,
    Evaluating,
    Decided,
    Mitigating,
    Complete,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Pending => "pending",
            PipelineStage::CacheHit => "cache_hit",
            PipelineStage::Evaluating => "evaluating",
            PipelineStage::Decided => "decided",
            PipelineStage::Mitigating => "mitigating",
            PipelineStage::Complete => "complete",
            PipelineStage::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller went away while a decision was outstanding.
    #[error("request cancelled while awaiting guardrail evaluation")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub decision_ttl: Duration,
    /// Budget for all evaluator calls of one stage.
    pub deadline: Duration,
    /// Used when the contract does not choose its own.
    pub failure_policy: FailurePolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            decision_ttl: config.cache.decision_ttl,
            deadline: config.pipeline.deadline,
            failure_policy: config.evaluator.failure_policy,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// One guardrail's decision and how it was reached.
#[derive(Debug, Clone)]
pub struct GuardrailResult {
    pub guardrail_id: String,
    pub decision: Decision,
    pub source: DecisionSource,
    pub transitions: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    /// The evaluator said block.
    Guardrail { score: f64 },
    /// Fail-closed on an unreachable or slow evaluator.
    EvaluatorUnavailable,
    /// Response grounding confidence under a blocking threshold.
    Grounding { confidence: f64, threshold: f64 },
    /// The mitigated response could not be produced.
    MitigationFailed,
}

/// Why a request or response was refused.
#[derive(Debug, Clone)]
pub struct Block {
    pub stage: Stage,
    pub guardrail_id: String,
    pub reason: String,
    pub kind: BlockKind,
}

impl Block {
    pub fn is_mitigation(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::Grounding { .. } | BlockKind::MitigationFailed
        )
    }

    pub fn violation(&self, id: &RequestIdentity) -> ViolationEvent {
        let (violation_type, metric_name, metric_value, threshold_min, severity) = match self.kind
        {
            BlockKind::Guardrail { score } => (
                "guardrail_block",
                self.guardrail_id.clone(),
                score,
                None,
                Severity::High,
            ),
            BlockKind::EvaluatorUnavailable => (
                "evaluator_unavailable",
                self.guardrail_id.clone(),
                0.0,
                None,
                Severity::Medium,
            ),
            BlockKind::Grounding {
                confidence,
                threshold,
            } => (
                "low_grounding",
                "grounding_confidence".to_string(),
                confidence,
                Some(threshold),
                Severity::High,
            ),
            BlockKind::MitigationFailed => (
                "mitigation_failed",
                self.guardrail_id.clone(),
                0.0,
                None,
                Severity::Medium,
            ),
        };

        ViolationEvent {
            timestamp: chrono::Utc::now(),
            tenant_id: id.tenant_id.clone(),
            trace_id: id.trace_id.clone(),
            contract_id: id.contract_id.clone(),
            certificate_id: id.certificate_id.clone(),
            violation_type: violation_type.to_string(),
            metric_name,
            metric_value,
            threshold_min,
            threshold_max: None,
            severity,
            details: json!({
                "stage": self.stage.as_str(),
                "guardrail_id": self.guardrail_id,
                "reason": self.reason,
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StagePass {
    pub results: Vec<GuardrailResult>,
    /// Review flags and fail-open skips.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Pass(StagePass),
    Blocked(Block),
}

#[derive(Debug, Clone)]
pub struct ResponsePass {
    pub body: Vec<u8>,
    pub results: Vec<GuardrailResult>,
    pub warnings: Vec<String>,
    pub transitions: Vec<PipelineStage>,
}

#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Pass(ResponsePass),
    Blocked(Block),
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Check {
    Single(String),
    Composite(Value),
}

impl Check {
    fn for_contract(contract: &Contract) -> Vec<Check> {
        match &contract.dag {
            Some(dag) => vec![Check::Composite(dag.clone())],
            None => contract
                .guardrail_ids()
                .map(|id| Check::Single(id.to_string()))
                .collect(),
        }
    }

    fn id(&self) -> &str {
        match self {
            Check::Single(id) => id,
            Check::Composite(_) => COMPOSITE_ID,
        }
    }

    fn key(&self, input: &str) -> String {
        match self {
            Check::Single(id) => fingerprint(id, input),
            Check::Composite(dag) => dag_fingerprint(dag, input),
        }
    }
}

enum Interrupted {
    Cancelled,
    Deadline,
    Failed(EvaluatorError),
}

pub struct DecisionPipeline {
    cache: Arc<CacheLayer>,
    evaluator: Arc<dyn GuardrailEvaluator>,
    mitigation: Arc<MitigationEngine>,
    telemetry: Arc<TelemetryBuffer>,
    settings: PipelineSettings,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl DecisionPipeline {
    pub fn new(
        cache: Arc<CacheLayer>,
        evaluator: Arc<dyn GuardrailEvaluator>,
        mitigation: Arc<MitigationEngine>,
        telemetry: Arc<TelemetryBuffer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            cache,
            evaluator,
            mitigation,
            telemetry,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBuffer> {
        &self.telemetry
    }

    /// Start tracking a request. The record emits its request event once.
    pub fn begin(&self, identity: RequestIdentity, request_size_bytes: u64) -> RequestRecord {
        RequestRecord::new(self.telemetry.clone(), identity, request_size_bytes)
    }

    /// Run the contract's guardrails over `input` for one stage.
    pub async fn run_stage(
        &self,
        contract: &Contract,
        stage: Stage,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<StageOutcome, PipelineError> {
        if !contract.enforces(stage) {
            return Ok(StageOutcome::Pass(StagePass::default()));
        }
        let checks = Check::for_contract(contract);
        if checks.is_empty() {
            return Ok(StageOutcome::Pass(StagePass::default()));
        }

        let keys: Vec<String> = checks.iter().map(|c| c.key(input)).collect();
        let cached = self.cache.get_many(&keys).await;
        let deadline = Instant::now() + self.settings.deadline;
        let policy = contract.failure_policy(self.settings.failure_policy);

        let mut pass = StagePass::default();
        for (check, key) in checks.iter().zip(&keys) {
            let result = self
                .decide(check, key, input, &cached, policy, deadline, cancel)
                .await?;
            self.record_decision(&result);

            match result.decision.decision {
                Verdict::Block => {
                    info!(
                        contract_id = %contract.contract_id,
                        guardrail_id = %result.guardrail_id,
                        stage = stage.as_str(),
                        source = result.source.as_str(),
                        reason = %result.decision.reason,
                        "Guardrail blocked"
                    );
                    let kind = match result.source {
                        DecisionSource::FailurePolicy => BlockKind::EvaluatorUnavailable,
                        _ => BlockKind::Guardrail {
                            score: result.decision.score,
                        },
                    };
                    return Ok(StageOutcome::Blocked(Block {
                        stage,
                        guardrail_id: result.guardrail_id,
                        reason: result.decision.reason,
                        kind,
                    }));
                }
                Verdict::Review => pass.warnings.push(format!(
                    "Guardrail {} flagged for review: {}",
                    result.guardrail_id, result.decision.reason
                )),
                Verdict::Allow if result.source == DecisionSource::FailurePolicy => {
                    pass.warnings.push(format!(
                        "Guardrail {} not evaluated: evaluator unavailable",
                        result.guardrail_id
                    ))
                }
                Verdict::Allow => {}
            }
            pass.results.push(result);
        }

        Ok(StageOutcome::Pass(pass))
    }

    /// Response-stage guardrails over the answer text, then mitigation.
    pub async fn enforce_response(
        &self,
        contract: &Contract,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ResponseOutcome, PipelineError> {
        if !contract.enforces(Stage::Response) {
            return Ok(ResponseOutcome::Pass(ResponsePass {
                body: body.to_vec(),
                results: Vec::new(),
                warnings: Vec::new(),
                transitions: vec![PipelineStage::Complete],
            }));
        }

        let answer = extract_text(body);
        let pass = match self
            .run_stage(contract, Stage::Response, &answer, cancel)
            .await?
        {
            StageOutcome::Pass(pass) => pass,
            StageOutcome::Blocked(block) => return Ok(ResponseOutcome::Blocked(block)),
        };

        debug!(contract_id = %contract.contract_id, stage = PipelineStage::Mitigating.as_str(), "Applying mitigation");
        match self.mitigation.apply_mitigation(body, contract) {
            Ok(mitigated) => {
                let mut warnings = pass.warnings;
                warnings.extend(mitigated.warnings);
                Ok(ResponseOutcome::Pass(ResponsePass {
                    body: mitigated.body,
                    results: pass.results,
                    warnings,
                    transitions: vec![PipelineStage::Mitigating, PipelineStage::Complete],
                }))
            }
            Err(MitigationError::GroundingBelowThreshold {
                confidence,
                threshold,
            }) => Ok(ResponseOutcome::Blocked(Block {
                stage: Stage::Response,
                guardrail_id: "grounding".to_string(),
                reason: format!(
                    "grounding confidence {confidence:.2} below required {threshold:.2}"
                ),
                kind: BlockKind::Grounding {
                    confidence,
                    threshold,
                },
            })),
            Err(e) => {
                warn!(contract_id = %contract.contract_id, error = %e, "Mitigation failed, withholding response");
                Ok(ResponseOutcome::Blocked(Block {
                    stage: Stage::Response,
                    guardrail_id: "mitigation".to_string(),
                    reason: e.to_string(),
                    kind: BlockKind::MitigationFailed,
                }))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        check: &Check,
        key: &str,
        input: &str,
        cached: &HashMap<String, String>,
        policy: FailurePolicy,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<GuardrailResult, PipelineError> {
        let guardrail_id = check.id().to_string();
        let mut transitions = vec![PipelineStage::Pending];

        if let Some(raw) = cached.get(key) {
            match serde_json::from_str::<Decision>(raw) {
                Ok(decision) => {
                    transitions.extend([PipelineStage::CacheHit, PipelineStage::Decided]);
                    debug!(guardrail_id = %guardrail_id, stage = PipelineStage::CacheHit.as_str(), "Decision reused");
                    return Ok(GuardrailResult {
                        guardrail_id,
                        decision,
                        source: DecisionSource::Cache,
                        transitions,
                    });
                }
                Err(e) => {
                    warn!(guardrail_id = %guardrail_id, error = %e, "Discarding undecodable cached decision")
                }
            }
        }

        transitions.push(PipelineStage::Evaluating);
        debug!(guardrail_id = %guardrail_id, stage = PipelineStage::Evaluating.as_str(), "Calling evaluator");

        let failure = match self.evaluate_detached(check, key, input, deadline, cancel).await {
            Ok(decision) => {
                transitions.push(PipelineStage::Decided);
                return Ok(GuardrailResult {
                    guardrail_id,
                    decision,
                    source: DecisionSource::Evaluator,
                    transitions,
                });
            }
            Err(Interrupted::Cancelled) => return Err(PipelineError::Cancelled),
            Err(Interrupted::Deadline) => "pipeline deadline exceeded".to_string(),
            Err(Interrupted::Failed(e)) => e.to_string(),
        };

        let decision = match policy {
            FailurePolicy::FailClosed => {
                warn!(guardrail_id = %guardrail_id, error = %failure, "Evaluator unavailable, failing closed");
                transitions.push(PipelineStage::Failed);
                Decision::block(EVALUATOR_UNAVAILABLE, 1.0)
            }
            FailurePolicy::FailOpen => {
                warn!(guardrail_id = %guardrail_id, error = %failure, "Evaluator unavailable, failing open");
                transitions.push(PipelineStage::Decided);
                Decision::allow(format!("evaluator unavailable: {failure}"))
            }
        };
        Ok(GuardrailResult {
            guardrail_id,
            decision,
            source: DecisionSource::FailurePolicy,
            transitions,
        })
    }

    /// Evaluate in a spawned task that caches its own result, racing the
    /// caller's cancellation and the stage deadline. Nothing is spawned once
    /// the deadline has passed.
    async fn evaluate_detached(
        &self,
        check: &Check,
        key: &str,
        input: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Decision, Interrupted> {
        if Instant::now() >= deadline {
            debug!(guardrail_id = %check.id(), "Stage deadline already passed, evaluator not called");
            return Err(Interrupted::Deadline);
        }

        let evaluator = Arc::clone(&self.evaluator);
        let cache = Arc::clone(&self.cache);
        let metrics = self.metrics.clone();
        let ttl = self.settings.decision_ttl;
        let check = check.clone();
        let key = key.to_string();
        let input = input.to_string();

        let task = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let result = match &check {
                Check::Single(id) => evaluator.evaluate(id, &input).await,
                Check::Composite(dag) => evaluator.evaluate_dag(dag, &input).await,
            };
            if let Some(metrics) = &metrics {
                metrics.record_evaluator_call(result.is_ok(), started.elapsed().as_secs_f64());
            }
            if let Ok(decision) = &result {
                match serde_json::to_string(decision) {
                    Ok(raw) => cache.set(&key, &raw, ttl).await,
                    Err(e) => warn!(error = %e, "Failed to encode decision for cache"),
                }
            }
            result
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Interrupted::Deadline),
            joined = task => match joined {
                Ok(Ok(decision)) => Ok(decision),
                Ok(Err(e)) => Err(Interrupted::Failed(e)),
                Err(e) => Err(Interrupted::Failed(EvaluatorError::Task(e.to_string()))),
            },
        }
    }

    fn record_decision(&self, result: &GuardrailResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(
                &result.guardrail_id,
                result.decision.decision.as_str(),
                result.source.as_str(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::GroundingAction;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Returns a fixed decision per guardrail id and records every call.
    #[derive(Default)]
    struct ScriptedEvaluator {
        decisions: HashMap<String, Decision>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
        down: bool,
    }

    impl ScriptedEvaluator {
        fn with(decisions: &[(&str, Decision)]) -> Self {
            Self {
                decisions: decisions
                    .iter()
                    .map(|(id, d)| (id.to_string(), d.clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        async fn answer(&self, id: &str) -> Result<Decision, EvaluatorError> {
            self.calls.lock().push(id.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.down {
                return Err(EvaluatorError::Unreachable("connection refused".into()));
            }
            Ok(self
                .decisions
                .get(id)
                .cloned()
                .unwrap_or_else(|| Decision::allow("ok")))
        }
    }

    #[async_trait]
    impl GuardrailEvaluator for ScriptedEvaluator {
        async fn evaluate(&self, guardrail_id: &str, _input: &str) -> Result<Decision, EvaluatorError> {
            self.answer(guardrail_id).await
        }

        async fn evaluate_dag(&self, _dag: &Value, _input: &str) -> Result<Decision, EvaluatorError> {
            self.answer(COMPOSITE_ID).await
        }
    }

    fn contract(guardrails: &[&str]) -> Contract {
        serde_json::from_value(json!({
            "contract_id": "dc-1",
            "guardrails": guardrails.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    fn pipeline(evaluator: Arc<ScriptedEvaluator>) -> DecisionPipeline {
        pipeline_with(evaluator, PipelineSettings::default())
    }

    fn pipeline_with(evaluator: Arc<ScriptedEvaluator>, settings: PipelineSettings) -> DecisionPipeline {
        DecisionPipeline::new(
            Arc::new(CacheLayer::in_memory()),
            evaluator,
            Arc::new(MitigationEngine::default()),
            Arc::new(TelemetryBuffer::new(100, 10)),
            settings,
        )
    }

    fn passed(outcome: StageOutcome) -> StagePass {
        match outcome {
            StageOutcome::Pass(pass) => pass,
            StageOutcome::Blocked(block) => panic!("unexpected block: {block:?}"),
        }
    }

    fn blocked(outcome: StageOutcome) -> Block {
        match outcome {
            StageOutcome::Blocked(block) => block,
            StageOutcome::Pass(_) => panic!("expected a block"),
        }
    }

    #[tokio::test]
    async fn test_decisions_are_cached_per_guardrail() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let pipeline = pipeline(evaluator.clone());
        let contract = contract(&["pii-leak", "toxicity"]);
        let cancel = CancellationToken::new();

        let first = passed(
            pipeline
                .run_stage(&contract, Stage::Request, "Hello  World", &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(first.results.len(), 2);
        assert_eq!(
            first.results[0].transitions,
            vec![
                PipelineStage::Pending,
                PipelineStage::Evaluating,
                PipelineStage::Decided
            ]
        );

        let second = passed(
            pipeline
                .run_stage(&contract, Stage::Request, "hello world", &cancel)
                .await
                .unwrap(),
        );
        assert!(second.results.iter().all(|r| r.source == DecisionSource::Cache));
        assert_eq!(
            second.results[1].transitions,
            vec![
                PipelineStage::Pending,
                PipelineStage::CacheHit,
                PipelineStage::Decided
            ]
        );
        assert_eq!(evaluator.calls(), vec!["pii-leak", "toxicity"]);
        assert!(pipeline.cache().exists(&fingerprint("toxicity", "hello world")).await);
    }

    #[tokio::test]
    async fn test_first_block_wins() {
        let evaluator = Arc::new(ScriptedEvaluator::with(&[(
            "pii-leak",
            Decision::block("contains an SSN", 0.97),
        )]));
        let pipeline = pipeline(evaluator.clone());
        let cancel = CancellationToken::new();

        let block = blocked(
            pipeline
                .run_stage(&contract(&["pii-leak", "toxicity"]), Stage::Request, "x", &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(block.guardrail_id, "pii-leak");
        assert_eq!(block.reason, "contains an SSN");
        assert_eq!(block.kind, BlockKind::Guardrail { score: 0.97 });
        assert_eq!(evaluator.calls(), vec!["pii-leak"]);
    }

    #[tokio::test]
    async fn test_cached_block_short_circuits_without_evaluator() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let pipeline = pipeline(evaluator.clone());
        let raw = serde_json::to_string(&Decision::block("cached", 0.8)).unwrap();
        pipeline
            .cache()
            .set(&fingerprint("toxicity", "x"), &raw, Duration::from_secs(60))
            .await;

        let block = blocked(
            pipeline
                .run_stage(
                    &contract(&["toxicity", "pii-leak"]),
                    Stage::Request,
                    "x",
                    &CancellationToken::new(),
                )
                .await
                .unwrap(),
        );
        assert_eq!(block.reason, "cached");
        assert!(evaluator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_is_reevaluated() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let pipeline = pipeline(evaluator.clone());
        pipeline
            .cache()
            .set(&fingerprint("toxicity", "x"), "not json", Duration::from_secs(60))
            .await;

        let pass = passed(
            pipeline
                .run_stage(&contract(&["toxicity"]), Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(pass.results[0].source, DecisionSource::Evaluator);
        assert_eq!(evaluator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_review_is_a_warning() {
        let evaluator = Arc::new(ScriptedEvaluator::with(&[(
            "toxicity",
            Decision {
                decision: Verdict::Review,
                score: 0.5,
                reason: "borderline".into(),
            },
        )]));
        let pass = passed(
            pipeline(evaluator)
                .run_stage(&contract(&["toxicity"]), Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(pass.warnings, vec!["Guardrail toxicity flagged for review: borderline"]);
    }

    #[tokio::test]
    async fn test_fail_closed_blocks_when_evaluator_down() {
        let evaluator = Arc::new(ScriptedEvaluator {
            down: true,
            ..Default::default()
        });
        let pipeline = pipeline(evaluator.clone());

        let block = blocked(
            pipeline
                .run_stage(&contract(&["toxicity"]), Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(block.reason, EVALUATOR_UNAVAILABLE);
        assert_eq!(block.kind, BlockKind::EvaluatorUnavailable);
        assert!(!pipeline.cache().exists(&fingerprint("toxicity", "x")).await);
    }

    #[tokio::test]
    async fn test_contract_can_fail_open() {
        let evaluator = Arc::new(ScriptedEvaluator {
            down: true,
            ..Default::default()
        });
        let mut contract = contract(&["toxicity", "pii-leak"]);
        contract.evaluator_failure = Some(FailurePolicy::FailOpen);

        let pass = passed(
            pipeline(evaluator.clone())
                .run_stage(&contract, Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(pass.results.len(), 2);
        assert!(pass.results.iter().all(|r| r.source == DecisionSource::FailurePolicy));
        assert_eq!(pass.warnings.len(), 2);
        assert_eq!(evaluator.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_falls_back_to_failure_policy() {
        let evaluator = Arc::new(ScriptedEvaluator {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let settings = PipelineSettings {
            deadline: Duration::from_millis(100),
            ..Default::default()
        };
        let block = blocked(
            pipeline_with(evaluator, settings)
                .run_stage(&contract(&["toxicity"]), Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(block.kind, BlockKind::EvaluatorUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_evaluator_calls_after_deadline() {
        let evaluator = Arc::new(ScriptedEvaluator {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let settings = PipelineSettings {
            deadline: Duration::from_millis(100),
            failure_policy: FailurePolicy::FailOpen,
            ..Default::default()
        };
        let pass = passed(
            pipeline_with(evaluator.clone(), settings)
                .run_stage(
                    &contract(&["toxicity", "pii-leak", "jailbreak"]),
                    Stage::Request,
                    "x",
                    &CancellationToken::new(),
                )
                .await
                .unwrap(),
        );

        assert_eq!(pass.results.len(), 3);
        assert!(pass.results.iter().all(|r| r.source == DecisionSource::FailurePolicy));
        assert_eq!(evaluator.calls(), vec!["toxicity".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_still_caches_decision() {
        let evaluator = Arc::new(ScriptedEvaluator {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let pipeline = pipeline(evaluator);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline
            .run_stage(&contract(&["toxicity"]), Stage::Request, "x", &cancel)
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pipeline.cache().exists(&fingerprint("toxicity", "x")).await);
    }

    #[tokio::test]
    async fn test_unenforced_stage_is_skipped() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let mut contract = contract(&["toxicity"]);
        contract.stages = vec![Stage::Response];

        let pass = passed(
            pipeline(evaluator.clone())
                .run_stage(&contract, Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert!(pass.results.is_empty());
        assert!(evaluator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_composite_contract_makes_one_call() {
        let evaluator = Arc::new(ScriptedEvaluator::with(&[(
            COMPOSITE_ID,
            Decision::block("composite policy", 0.9),
        )]));
        let mut contract = contract(&["toxicity", "pii-leak"]);
        contract.dag = Some(json!({"nodes": ["toxicity", "pii-leak"], "op": "any"}));

        let block = blocked(
            pipeline(evaluator.clone())
                .run_stage(&contract, Stage::Request, "x", &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(block.guardrail_id, COMPOSITE_ID);
        assert_eq!(evaluator.calls(), vec![COMPOSITE_ID]);
    }

    #[tokio::test]
    async fn test_response_mitigation_redacts_and_warns() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let body = br#"{"answer":"reach me at a@b.com","grounding":{"confidence":0.95}}"#;

        let outcome = pipeline(evaluator.clone())
            .enforce_response(&contract(&["toxicity"]), body, &CancellationToken::new())
            .await
            .unwrap();
        let ResponseOutcome::Pass(pass) = outcome else {
            panic!("expected pass");
        };
        let value: Value = serde_json::from_slice(&pass.body).unwrap();
        assert_eq!(value["answer"], "reach me at [REDACTED-EMAIL]");
        assert_eq!(pass.warnings, vec!["PII redacted"]);
        assert_eq!(
            pass.transitions,
            vec![PipelineStage::Mitigating, PipelineStage::Complete]
        );
        assert_eq!(evaluator.calls(), vec!["toxicity"]);
    }

    #[tokio::test]
    async fn test_low_grounding_is_a_late_block() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let mut contract = contract(&["toxicity"]);
        contract.thresholds.grounding.action = GroundingAction::Block;
        let body = br#"{"answer":"maybe","grounding":{"confidence":0.3}}"#;

        let outcome = pipeline(evaluator)
            .enforce_response(&contract, body, &CancellationToken::new())
            .await
            .unwrap();
        let ResponseOutcome::Blocked(block) = outcome else {
            panic!("expected block");
        };
        assert!(block.is_mitigation());
        assert_eq!(
            block.kind,
            BlockKind::Grounding {
                confidence: 0.3,
                threshold: 0.8
            }
        );
        let violation = block.violation(&RequestIdentity::default());
        assert_eq!(violation.violation_type, "low_grounding");
        assert_eq!(violation.threshold_min, Some(0.8));
    }

    #[tokio::test]
    async fn test_response_passthrough_when_not_enforced() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let mut contract = contract(&["toxicity"]);
        contract.stages = vec![Stage::Request];
        let body = br#"{"answer":"ssn 123-45-6789"}"#;

        let outcome = pipeline(evaluator.clone())
            .enforce_response(&contract, body, &CancellationToken::new())
            .await
            .unwrap();
        let ResponseOutcome::Pass(pass) = outcome else {
            panic!("expected pass");
        };
        assert_eq!(pass.body, body.to_vec());
        assert!(evaluator.calls().is_empty());
    }
}
