//! Configuration schema.
//!
//! Every section defaults, so an empty mapping is a valid file. Durations
//! use [`super::duration_format`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::contract::{Certificate, Contract, FailurePolicy};

use super::duration_format;

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewaySection,
    pub backend: BackendSection,
    pub cache: CacheSection,
    pub evaluator: EvaluatorSection,
    pub pipeline: PipelineSection,
    pub mitigation: MitigationSection,
    pub telemetry: TelemetrySection,
    pub contracts: ContractsSection,
    pub logging: LoggingSection,
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway / backend
// ─────────────────────────────────────────────────────────────────────────────

/// Listener settings for the enforcement proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind: String,
    pub port: u16,
    pub admin_port: u16,
    /// Reject requests that carry no contract reference.
    pub require_contract: bool,
    pub max_body_bytes: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            admin_port: 8081,
            require_contract: true,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// The LLM backend every enforced request is forwarded to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendSection {
    pub url: String,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    #[serde(with = "duration_format")]
    pub connect_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_idle_per_host: 32,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    pub backend: CacheBackendKind,
    pub redis_url: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    /// Number of multiplexed connections kept open to Redis.
    pub pool_size: usize,
    pub max_retries: usize,
    #[serde(with = "duration_format")]
    pub connect_timeout: Duration,
    /// Upper bound on any single cache round-trip.
    #[serde(with = "duration_format")]
    pub op_timeout: Duration,
    #[serde(with = "duration_format")]
    pub decision_ttl: Duration,
    /// How often the memory backend drops expired entries.
    #[serde(with = "duration_format")]
    pub purge_interval: Duration,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            redis_password: None,
            redis_db: 0,
            pool_size: 8,
            max_retries: 3,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_millis(50),
            decision_ttl: Duration::from_secs(600),
            purge_interval: Duration::from_secs(60),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluator / pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvaluatorSection {
    pub url: String,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(2),
            failure_policy: FailurePolicy::FailClosed,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Budget for all guardrail evaluations of one stage.
    #[serde(with = "duration_format")]
    pub deadline: Duration,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mitigation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MitigationSection {
    /// JSON nesting depth below which subtrees are redacted wholesale.
    pub max_depth: usize,
    pub grounding: GroundingSection,
}

impl Default for MitigationSection {
    fn default() -> Self {
        Self {
            max_depth: 64,
            grounding: GroundingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GroundingSection {
    /// Treat a response without `grounding.confidence` as ungrounded.
    pub require_metadata: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub enabled: bool,
    pub metrics_url: String,
    pub api_key: Option<String>,
    pub batch_size: usize,
    #[serde(with = "duration_format")]
    pub batch_interval: Duration,
    pub buffer_size: usize,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_url: "http://localhost:8090".to_string(),
            api_key: None,
            batch_size: 100,
            batch_interval: Duration::from_secs(5),
            buffer_size: 1000,
            timeout: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contracts / logging
// ─────────────────────────────────────────────────────────────────────────────

/// Where contracts come from.
///
/// With `control_plane_url` set, contracts are fetched over HTTP; otherwise
/// `definitions` and `certificates` are served as a static set.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContractsSection {
    pub control_plane_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(with = "duration_format")]
    pub cache_ttl: Duration,
    #[serde(with = "duration_format")]
    pub timeout: Duration,
    pub definitions: Vec<Contract>,
    pub certificates: Vec<Certificate>,
}

impl Default for ContractsSection {
    fn default() -> Self {
        Self {
            control_plane_url: None,
            api_key: None,
            cache_ttl: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
            definitions: Vec::new(),
            certificates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
