//! Gateway configuration.
//!
//! YAML file parsed with `serde-saphyr`, `${VAR}` substitution before parsing,
//! deployment environment variables applied after parsing.

pub mod duration_format;
mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{
    apply_env_overrides, default_config_paths, find_config_file, from_env, load_and_validate,
    load_config, substitute_env_vars, validate,
};
pub use schema::{
    BackendSection, CacheBackendKind, CacheSection, Config, ContractsSection, EvaluatorSection,
    GatewaySection, GroundingSection, LoggingSection, MitigationSection, PipelineSection,
    TelemetrySection,
};
