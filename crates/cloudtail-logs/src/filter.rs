use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use cloudtail_types::Severity;

use crate::error::ValidationError;
use crate::validate::{validate_duration, validate_severity, validate_timestamp};

/// Lookback applied when neither `since` nor `since_time` is given
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

/// Raw filter flag values, exactly as the user typed them
#[derive(Clone, Debug, Default)]
pub struct FilterArgs {
    pub log_name: String,
    pub resource_type: String,
    pub severity: String,
    pub since: String,
    pub since_time: String,
}

/// Oldest entries a query may return
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LowerBound {
    /// Relative to the moment the tail starts
    Relative(Duration),
    /// Fixed point in time
    Absolute(DateTime<Utc>),
}

/// Validated query intent
///
/// Built once per invocation and never changed afterwards. Relative bounds
/// are turned into timestamps by [`Filter::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    log_name: Option<String>,
    resource_type: Option<String>,
    severity: Option<Severity>,
    lower_bound: Option<LowerBound>,
}

impl Filter {
    /// Create an unconstrained filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate raw flag values in a single pass
    ///
    /// Blank values count as unset. Conflicting `since` and `since_time` are
    /// rejected before either value is parsed. Without either, the lower
    /// bound is [`DEFAULT_LOOKBACK`] before now.
    pub fn from_args(args: &FilterArgs) -> Result<Self, ValidationError> {
        let log_name = non_blank(&args.log_name);
        let resource_type = non_blank(&args.resource_type);
        let severity = non_blank(&args.severity);
        let since = non_blank(&args.since);
        let since_time = non_blank(&args.since_time);

        if since.is_some() && since_time.is_some() {
            return Err(ValidationError::ConflictingSince);
        }

        let severity = severity.as_deref().map(validate_severity).transpose()?;

        let lower_bound = match (since, since_time) {
            (Some(since), _) => LowerBound::Relative(validate_duration(&since)?),
            (None, Some(since_time)) => LowerBound::Absolute(validate_timestamp(&since_time)?),
            (None, None) => LowerBound::Relative(DEFAULT_LOOKBACK),
        };

        Ok(Self {
            log_name,
            resource_type,
            severity,
            lower_bound: Some(lower_bound),
        })
    }

    pub fn with_log_name(mut self, log_name: impl Into<String>) -> Self {
        self.log_name = Some(log_name.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Set the lower bound, replacing any previous one
    pub fn with_lower_bound(mut self, lower_bound: LowerBound) -> Self {
        self.lower_bound = Some(lower_bound);
        self
    }

    pub fn log_name(&self) -> Option<&str> {
        self.log_name.as_deref()
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    pub fn lower_bound(&self) -> Option<LowerBound> {
        self.lower_bound
    }

    /// Fix a relative lower bound against `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> ResolvedFilter {
        let since = self.lower_bound.map(|bound| match bound {
            LowerBound::Absolute(ts) => ts,
            LowerBound::Relative(ago) => TimeDelta::from_std(ago)
                .ok()
                .and_then(|delta| now.checked_sub_signed(delta))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        });

        ResolvedFilter {
            log_name: self.log_name.clone(),
            resource_type: self.resource_type.clone(),
            severity: self.severity,
            since,
        }
    }

    /// Render the backend query, resolving a relative bound against `now`
    pub fn compile(&self, now: DateTime<Utc>) -> String {
        self.resolve(now).compile()
    }
}

/// A [`Filter`] whose lower bound is an absolute timestamp
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFilter {
    log_name: Option<String>,
    resource_type: Option<String>,
    severity: Option<Severity>,
    since: Option<DateTime<Utc>>,
}

impl ResolvedFilter {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// Copy of this filter with the lower bound moved to `since`
    pub fn with_lower_bound(&self, since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..self.clone()
        }
    }

    /// Render as a query expression, one clause per set field
    pub fn compile(&self) -> String {
        let mut clauses = Vec::with_capacity(4);

        if let Some(log_name) = &self.log_name {
            clauses.push(format!("logName={}", quote(log_name)));
        }
        if let Some(resource_type) = &self.resource_type {
            clauses.push(format!("resource.type={}", quote(resource_type)));
        }
        if let Some(severity) = self.severity {
            clauses.push(format!("severity>={}", quote(severity.as_str())));
        }
        if let Some(since) = self.since {
            clauses.push(format!("timestamp>={}", quote(&format_timestamp(since))));
        }

        clauses.join(" AND ")
    }
}

impl fmt::Display for ResolvedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compile())
    }
}

/// RFC3339 in UTC; fractional seconds only when present
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Double-quoted string literal with `\` and `"` escaped
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
