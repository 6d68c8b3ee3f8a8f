//! Guardrail decisions as returned by the evaluator and stored in the cache.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
    /// Needs a human look. Does not block.
    Review,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Block => "block",
            Verdict::Review => "review",
        }
    }
}

/// Evaluator output for one guardrail over one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Verdict,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub reason: String,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Verdict::Allow,
            score: 0.0,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>, score: f64) -> Self {
        Self {
            decision: Verdict::Block,
            score,
            reason: reason.into(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.decision == Verdict::Block
    }

    /// Reject scores outside [0, 1] and non-finite values.
    pub fn validate(self) -> Result<Self, String> {
        if !self.score.is_finite() || !(0.0..=1.0).contains(&self.score) {
            return Err(format!("score {} outside [0, 1]", self.score));
        }
        Ok(self)
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Cache,
    Evaluator,
    /// Synthesized by the evaluator failure policy.
    FailurePolicy,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Cache => "cache",
            DecisionSource::Evaluator => "evaluator",
            DecisionSource::FailurePolicy => "failure_policy",
        }
    }
}
