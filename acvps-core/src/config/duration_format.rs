//! Duration parsing for configuration files.
//!
//! Accepts two notations:
//! - `humantime`: `50ms`, `5s`, `1h 30m`
//! - ISO 8601: `PT5S`, `PT1H30M`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Parse a duration string, trying humantime before ISO 8601.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    if let Ok(d) = iso8601_duration::Duration::parse(s)
        && let Some(std_duration) = d.to_std()
    {
        return Ok(std_duration);
    }

    Err(format!(
        "invalid duration '{s}': expected humantime (5s) or ISO 8601 (PT5S)"
    ))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    humantime::format_duration(*duration)
        .to_string()
        .serialize(serializer)
}
