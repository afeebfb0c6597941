//! Validation of raw flag values

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use cloudtail_types::Severity;

use crate::error::ValidationError;

const TERM: &str = r"([0-9]*)(?:\.([0-9]*))?(ns|us|µs|μs|ms|s|m|h)";

/// A whole duration expression: one or more `<number><unit>` terms
///
/// Digits are ASCII only.
static DURATION_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:ns|us|µs|μs|ms|s|m|h))+$")
        .expect("duration expression regex is valid")
});

static DURATION_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TERM).expect("duration term regex is valid"));

/// Largest representable duration, as a signed 64-bit nanosecond count
const MAX_NANOS: u128 = i64::MAX as u128;

/// Fraction digits beyond this cannot change the nanosecond result
const MAX_FRACTION_DIGITS: usize = 18;

/// Validate a `--severity` value (case-insensitive)
pub fn validate_severity(raw: &str) -> Result<Severity, ValidationError> {
    raw.parse().map_err(|_| ValidationError::InvalidSeverity {
        value: raw.to_string(),
    })
}

/// Validate a `--since` value such as `30m` or `1h15m30s`
pub fn validate_duration(raw: &str) -> Result<Duration, ValidationError> {
    let trimmed = raw.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let duration = parse_unsigned_duration(body).map_err(|reason| {
        ValidationError::InvalidDuration {
            value: raw.to_string(),
            reason,
        }
    })?;

    if negative {
        return Err(ValidationError::NegativeDuration {
            value: raw.to_string(),
        });
    }

    Ok(duration)
}

/// Validate a `--since-time` value (RFC3339, offset required)
pub fn validate_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ValidationError::InvalidTimestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        })
}

fn parse_unsigned_duration(body: &str) -> Result<Duration, String> {
    if body == "0" {
        return Ok(Duration::ZERO);
    }
    if body.is_empty() {
        return Err("empty duration".to_string());
    }
    if !DURATION_EXPR.is_match(body) {
        return Err("expected terms like 90s, 1.5h or 1h15m30s".to_string());
    }

    let mut total: u128 = 0;
    for caps in DURATION_TERM.captures_iter(body) {
        let unit = unit_nanos(&caps[3]);
        let whole: u128 = match &caps[1] {
            "" => 0,
            digits => digits.parse().map_err(|_| "duration out of range".to_string())?,
        };
        let mut nanos = whole
            .checked_mul(unit)
            .ok_or_else(|| "duration out of range".to_string())?;

        if let Some(fraction) = caps.get(2).map(|m| m.as_str()).filter(|f| !f.is_empty()) {
            let digits = &fraction[..fraction.len().min(MAX_FRACTION_DIGITS)];
            let scale = 10u128.pow(digits.len() as u32);
            let value: u128 = digits.parse().map_err(|_| "invalid fraction".to_string())?;
            nanos = nanos
                .checked_add(value * unit / scale)
                .ok_or_else(|| "duration out of range".to_string())?;
        }

        total = total
            .checked_add(nanos)
            .filter(|t| *t <= MAX_NANOS)
            .ok_or_else(|| "duration out of range".to_string())?;
    }

    Ok(Duration::from_nanos(total as u64))
}

fn unit_nanos(unit: &str) -> u128 {
    match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        _ => 60 * 60 * 1_000_000_000,
    }
}
