//! Guardrail decisions: evaluator client, fingerprinting and the
//! per-request decision pipeline.

pub mod decision;
mod evaluator;
pub mod fingerprint;
mod pipeline;
mod record;
mod text;

pub use decision::{Decision, DecisionSource, Verdict};
pub use evaluator::{EvaluatorError, GuardrailEvaluator, HttpEvaluator};
pub use fingerprint::{fingerprint, normalize_input};
pub use pipeline::{
    Block, BlockKind, COMPOSITE_ID, DecisionPipeline, EVALUATOR_UNAVAILABLE, GuardrailResult,
    PipelineError, PipelineSettings, PipelineStage, ResponseOutcome, ResponsePass, StageOutcome,
    StagePass,
};
pub use record::{RequestIdentity, RequestRecord, STATUS_CLIENT_CLOSED};
pub use text::extract_text;
