//! Configuration loading, environment overrides and validation.
//!
//! Loading flow: locate file → read → `${VAR}` substitution → YAML parse →
//! environment overrides → validation.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

use super::duration_format::parse_duration;
use super::error::ConfigError;
use super::schema::Config;

/// Configuration file search paths, in priority order after the CLI flag.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("ACVPS_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/acvps/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file.
///
/// An explicit path (from `--config`) must exist; it is never silently
/// replaced by a default location.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Read, substitute and parse a configuration file. No overrides, no validation.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;

    Ok(config)
}

/// Full loading flow used by the binary.
pub fn load_and_validate(path: &Path) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Defaults plus environment overrides, for running without a file.
pub fn from_env() -> Result<Config, ConfigError> {
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on a compile-time literal pattern, covered by tests.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute `${VAR}` (required) and `${VAR:-default}` (optional).
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply deployment environment variables on top of the parsed file.
///
/// Unparseable values keep the file value and log a warning.
pub fn apply_env_overrides(config: &mut Config) {
    let redis_host = std::env::var("REDIS_HOST").ok();
    let redis_port = std::env::var("REDIS_PORT").ok();
    if redis_host.is_some() || redis_port.is_some() {
        config.cache.redis_url = rebuild_redis_url(
            &config.cache.redis_url,
            redis_host.as_deref(),
            redis_port.as_deref(),
        );
    }
    if let Ok(password) = std::env::var("REDIS_PASSWORD") {
        config.cache.redis_password = Some(password);
    }

    if let Ok(url) = std::env::var("METRICS_SERVICE_URL") {
        config.telemetry.metrics_url = url;
    }
    if let Ok(key) = std::env::var("METRICS_API_KEY") {
        config.telemetry.api_key = Some(key);
    }
    config.telemetry.enabled = parse_env_warn("METRICS_ENABLED", config.telemetry.enabled);
    config.telemetry.batch_size = parse_env_warn("METRICS_BATCH_SIZE", config.telemetry.batch_size);
    config.telemetry.buffer_size =
        parse_env_warn("METRICS_BUFFER_SIZE", config.telemetry.buffer_size);
    config.telemetry.batch_interval =
        parse_env_duration_warn("METRICS_BATCH_INTERVAL", config.telemetry.batch_interval);

    if let Ok(url) = std::env::var("GUARDRAIL_EVALUATOR_URL") {
        config.evaluator.url = url;
    }
}

fn rebuild_redis_url(current: &str, host: Option<&str>, port: Option<&str>) -> String {
    let (cur_host, cur_port) = match url::Url::parse(current) {
        Ok(parsed) => (
            parsed.host_str().unwrap_or("localhost").to_string(),
            parsed.port().unwrap_or(6379).to_string(),
        ),
        Err(_) => ("localhost".to_string(), "6379".to_string()),
    };
    format!(
        "redis://{}:{}",
        host.unwrap_or(&cur_host),
        port.unwrap_or(&cur_port)
    )
}

fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_duration_warn(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(val) => match parse_duration(&val) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(
                    env_var = name,
                    value = %val,
                    reason = %reason,
                    "Invalid duration for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_url("backend.url", &config.backend.url)?;
    validate_url("evaluator.url", &config.evaluator.url)?;
    if config.telemetry.enabled {
        validate_url("telemetry.metrics_url", &config.telemetry.metrics_url)?;
    }
    if let Some(url) = &config.contracts.control_plane_url {
        validate_url("contracts.control_plane_url", url)?;
    }

    positive("cache.pool_size", config.cache.pool_size)?;
    positive("telemetry.batch_size", config.telemetry.batch_size)?;
    positive("telemetry.buffer_size", config.telemetry.buffer_size)?;
    positive("mitigation.max_depth", config.mitigation.max_depth)?;
    if config.telemetry.batch_interval.is_zero() {
        return Err(ConfigError::MustBePositive {
            field: "telemetry.batch_interval",
        });
    }
    if config.cache.purge_interval.is_zero() {
        return Err(ConfigError::MustBePositive {
            field: "cache.purge_interval",
        });
    }
    if config.cache.op_timeout.is_zero() {
        return Err(ConfigError::MustBePositive {
            field: "cache.op_timeout",
        });
    }
    if config.telemetry.batch_size > config.telemetry.buffer_size {
        return Err(ConfigError::BatchLargerThanBuffer {
            batch_size: config.telemetry.batch_size,
            buffer_size: config.telemetry.buffer_size,
        });
    }

    let mut seen = HashSet::new();
    for contract in &config.contracts.definitions {
        if !seen.insert(contract.contract_id.as_str()) {
            return Err(ConfigError::DuplicateContractId {
                id: contract.contract_id.clone(),
            });
        }
        if contract.guardrails.is_empty() && contract.dag.is_none() {
            return Err(ConfigError::EmptyContract {
                id: contract.contract_id.clone(),
            });
        }
        let min_confidence = contract.thresholds.grounding.min_confidence;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidThreshold {
                contract_id: contract.contract_id.clone(),
                field: "thresholds.grounding.min_confidence",
                value: min_confidence,
            });
        }
    }

    for cert in &config.contracts.certificates {
        if config.contracts.control_plane_url.is_none() && !seen.contains(cert.contract_id.as_str())
        {
            return Err(ConfigError::DanglingCertificate {
                certificate_id: cert.certificate_id.clone(),
                contract_id: cert.contract_id.clone(),
            });
        }
    }

    Ok(())
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidUrl {
            field,
            url: value.to_string(),
            message: e.to_string(),
        })
}

fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::MustBePositive { field });
    }
    Ok(())
}
