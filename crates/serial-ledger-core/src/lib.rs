use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub mod identity;
pub mod rate_limit;
pub mod serial;

pub use identity::{
    is_public_address, resolve_client_identity, DEFAULT_FORWARDED_HEADERS, UNKNOWN_CLIENT,
};
pub use rate_limit::{
    InMemoryRateLimitStore, RateLimitRecord, RateLimitStore, RateLimiter,
    DEFAULT_MAX_REQUESTS_PER_WINDOW, RATE_LIMIT_WINDOW,
};
pub use serial::{
    extract_serial_candidate, is_winning_serial, normalize_serial, sanitize_serial_input,
    validate_serial_number, SerialNumber, WINNING_SERIALS,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// One logged lookup. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryEvent {
    pub id: i64,
    pub serial_number: SerialNumber,
    pub is_winner: bool,
    pub client_identity: String,
    pub query_time: String,
    pub user_agent: String,
}

/// A lookup about to be appended. The store assigns `id` and `query_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuery {
    pub serial_number: SerialNumber,
    pub is_winner: bool,
    pub client_identity: String,
    pub user_agent: String,
}

/// Privacy-filtered summary of earlier lookups of one serial.
///
/// Never carries the identities behind those lookups; `queried_by_same_user`
/// only says whether any of them shared both the caller's address and user
/// agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disclosure {
    pub first_query_time: String,
    pub query_count: usize,
    pub all_timestamps: Vec<String>,
    pub queried_by_same_user: bool,
    pub first_query_was_winner: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EarliestQuery {
    pub client_identity: String,
    pub query_time: String,
    pub is_winner: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryStats {
    pub total_queries: u64,
    pub unique_serials: u64,
    pub unique_clients: u64,
    pub winner_queries: u64,
}

/// Outcome of the combined disclosure read and event append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedQuery {
    pub event_id: i64,
    pub previous_queries: Option<Disclosure>,
}

/// Request verbs accepted by the endpoint, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    LogQuery {
        serial_number: String,
        is_winner: bool,
    },
    GetStats,
    HealthCheck,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Action parameter required")]
    Missing,
    #[error("Unknown action")]
    Unknown(String),
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogQuery { .. } => "log_query",
            Self::GetStats => "get_stats",
            Self::HealthCheck => "health_check",
        }
    }

    /// Decodes a request body.
    ///
    /// An absent, null or empty `action` is [`ActionError::Missing`]; any
    /// other value that is not a known verb is [`ActionError::Unknown`].
    /// The serial is passed through raw, normalization happens in the handler.
    ///
    /// # Errors
    /// Returns [`ActionError`] when the action cannot be decoded.
    pub fn decode(body: &Value) -> Result<Self, ActionError> {
        let action = match body.get("action") {
            None | Some(Value::Null) => return Err(ActionError::Missing),
            Some(Value::String(raw)) if raw.is_empty() => return Err(ActionError::Missing),
            Some(Value::String(raw)) => raw.clone(),
            Some(other) => return Err(ActionError::Unknown(other.to_string())),
        };

        match action.as_str() {
            "log_query" => Ok(Self::LogQuery {
                serial_number: lenient_string(body.get("serial_number")),
                is_winner: lenient_flag(body.get("is_winner")),
            }),
            "get_stats" => Ok(Self::GetStats),
            "health_check" => Ok(Self::HealthCheck),
            _ => Err(ActionError::Unknown(action)),
        }
    }
}

fn lenient_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    }
}

// Clients send 0|1; booleans and numeric strings are tolerated.
fn lenient_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|raw| raw != 0.0),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().is_ok_and(|raw| raw != 0),
        _ => false,
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Current time at whole-second resolution, the granularity query events
/// are stamped with.
#[must_use]
pub fn now_utc_seconds() -> OffsetDateTime {
    let now = now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}
