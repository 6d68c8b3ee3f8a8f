//! Core of the ACVPS enforcement gateway.
//!
//! - [`cache`]: fail-open decision cache over Redis or process memory
//! - [`config`]: YAML configuration with environment overrides
//! - [`contract`]: contracts, certificates and their registries
//! - [`guardrail`]: evaluator client and the decision pipeline
//! - [`mitigation`]: PII redaction and grounding checks on responses
//! - [`telemetry`]: request/violation events, batching and Prometheus metrics

pub mod cache;
pub mod config;
pub mod contract;
pub mod guardrail;
pub mod mitigation;
pub mod telemetry;
