//! Client for the guardrail evaluator service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::decision::Decision;
use crate::config::EvaluatorSection;

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator unreachable: {0}")]
    Unreachable(String),

    #[error("evaluator timed out")]
    Timeout,

    #[error("evaluator returned status {status}")]
    Status { status: u16 },

    #[error("evaluator returned an invalid decision: {0}")]
    InvalidResponse(String),

    #[error("evaluation task failed: {0}")]
    Task(String),

    #[error("failed to build evaluator client: {0}")]
    Client(String),
}

/// Scores one input against a guardrail.
#[async_trait]
pub trait GuardrailEvaluator: Send + Sync {
    async fn evaluate(&self, guardrail_id: &str, input: &str) -> Result<Decision, EvaluatorError>;

    /// Evaluate a composite guardrail graph in one call.
    async fn evaluate_dag(&self, dag: &Value, input: &str) -> Result<Decision, EvaluatorError>;
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    guardrail_id: &'a str,
    input: &'a str,
}

#[derive(Serialize)]
struct EvaluateDagRequest<'a> {
    dag: &'a Value,
    input: &'a str,
}

/// `POST /api/sg/evaluate` and `POST /api/sg/evaluate/dag`.
pub struct HttpEvaluator {
    client: Client,
    evaluate_url: String,
    dag_url: String,
}

impl HttpEvaluator {
    pub fn new(config: &EvaluatorSection) -> Result<Self, EvaluatorError> {
        Self::with_base_url(&config.url, config.timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self, EvaluatorError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| EvaluatorError::Client(e.to_string()))?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            evaluate_url: format!("{base}/api/sg/evaluate"),
            dag_url: format!("{base}/api/sg/evaluate/dag"),
        })
    }

    async fn post<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<Decision, EvaluatorError> {
        let response = self.client.post(url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                EvaluatorError::Timeout
            } else {
                EvaluatorError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvaluatorError::Status {
                status: status.as_u16(),
            });
        }

        let decision: Decision = response
            .json()
            .await
            .map_err(|e| EvaluatorError::InvalidResponse(e.to_string()))?;
        decision.validate().map_err(EvaluatorError::InvalidResponse)
    }
}

#[async_trait]
impl GuardrailEvaluator for HttpEvaluator {
    async fn evaluate(&self, guardrail_id: &str, input: &str) -> Result<Decision, EvaluatorError> {
        self.post(&self.evaluate_url, &EvaluateRequest { guardrail_id, input })
            .await
    }

    async fn evaluate_dag(&self, dag: &Value, input: &str) -> Result<Decision, EvaluatorError> {
        self.post(&self.dag_url, &EvaluateDagRequest { dag, input })
            .await
    }
}
