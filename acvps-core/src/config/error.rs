//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading and validation errors.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Value validation
    // ─────────────────────────────────────────────────────────────────────────
    #[error("invalid URL '{url}' for {field}: {message}")]
    InvalidUrl {
        field: &'static str,
        url: String,
        message: String,
    },

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("telemetry.batch_size ({batch_size}) exceeds telemetry.buffer_size ({buffer_size})")]
    BatchLargerThanBuffer {
        batch_size: usize,
        buffer_size: usize,
    },

    #[error("invalid threshold {value} for {field} in contract '{contract_id}': must be in [0, 1]")]
    InvalidThreshold {
        contract_id: String,
        field: &'static str,
        value: f64,
    },

    #[error("duplicate contract ID: '{id}'")]
    DuplicateContractId { id: String },

    #[error("certificate '{certificate_id}' references unknown contract '{contract_id}'")]
    DanglingCertificate {
        certificate_id: String,
        contract_id: String,
    },

    #[error("contract '{id}' declares no guardrails and no dag")]
    EmptyContract { id: String },

    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing
    // ─────────────────────────────────────────────────────────────────────────
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    EmptyConfigFile,
}
