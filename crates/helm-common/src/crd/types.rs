//! Shared status types

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported by every kind this process writes status for
pub const READY_CONDITION: &str = "Ready";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Shorthand for a `Ready` condition
    pub fn ready(status: ConditionStatus, reason: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(READY_CONDITION, status, reason, msg)
    }
}

/// Parse a Go-style duration string such as `30s`, `1m30s`, `500ms` or `2h`.
///
/// A bare `0` is accepted as zero. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("negative duration {:?}", input));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {:?}", input))?;
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", input));
        }
        let number = &rest[..num_len];
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            other => return Err(format!("unknown unit {:?} in duration {:?}", other, input)),
        };
        rest = &rest[unit_len..];

        let nanos = if number.contains('.') {
            let value: f64 = number
                .parse()
                .map_err(|_| format!("invalid number in duration {:?}", input))?;
            (value * unit_nanos as f64).round() as u64
        } else {
            number
                .parse::<u64>()
                .ok()
                .and_then(|v| v.checked_mul(unit_nanos))
                .ok_or_else(|| format!("invalid number in duration {:?}", input))?
        };
        total = total
            .checked_add(Duration::from_nanos(nanos))
            .ok_or_else(|| format!("duration {:?} overflows", input))?;
    }
    Ok(total)
}
