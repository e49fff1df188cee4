use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequest, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Form, Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use serial_ledger_core::{
    format_rfc3339, now_utc_seconds, resolve_client_identity, Action, ActionError, Disclosure,
    LedgerError, NewQuery, QueryStats, RateLimiter, SerialNumber,
};
use serial_ledger_store_sqlite::{
    diagnose_location, LocationDiagnostics, SqliteQueryStore, WriteCutoff,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod config;

use config::{Args, ServiceConfig};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_BODY_BYTES: usize = 64 * 1024;
const CORS_MAX_AGE_SECS: u64 = 3600;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone)]
struct ServiceState {
    config: Arc<ServiceConfig>,
    limiter: RateLimiter,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope {
    success: bool,
    timestamp: String,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// A request refused before or instead of reaching the store.
#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
}

/// Why a blocking store call produced no value.
#[derive(Debug)]
enum CallFailure {
    Store(LedgerError),
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
struct LogQueryData {
    logged: bool,
    log_id: Option<i64>,
    serial_number: String,
    is_winner: bool,
    previous_queries: Option<Disclosure>,
}

#[derive(Debug, Clone, Serialize)]
struct DegradedData {
    logged: bool,
    message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HealthData {
    database: bool,
    database_type: &'static str,
    database_path: String,
    version: &'static str,
    timestamp: String,
    server: String,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct DebugData {
    #[serde(flatten)]
    location: LocationDiagnostics,
    version: &'static str,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    client_error_total: AtomicU64,
    rate_limited_total: AtomicU64,
    degraded_total: AtomicU64,
    timeout_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    client_error_total: u64,
    rate_limited_total: u64,
    degraded_total: u64,
    timeout_total: u64,
    internal_error_total: u64,
}

impl ServiceFailure {
    fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            code: "method_not_allowed",
            message: "Only POST requests allowed",
        }
    }

    fn rate_limited() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rate_limited",
            message: "Rate limit exceeded. Please try again later.",
        }
    }

    fn invalid_action(err: &ActionError) -> Self {
        let message = match err {
            ActionError::Missing => "Action parameter required",
            ActionError::Unknown(_) => "Unknown action",
        };
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_action",
            message,
        }
    }

    fn invalid_serial() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_serial",
            message: "Invalid serial number format",
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: "Internal server error",
        }
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceEnvelope {
            success: false,
            timestamp: response_timestamp(),
            data: Value::Null,
            message: Some(self.message.to_string()),
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
            limiter: RateLimiter::in_memory(),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn reject(&self, failure: ServiceFailure) -> ServiceFailure {
        if failure.status == StatusCode::INTERNAL_SERVER_ERROR {
            self.telemetry.internal_error_total.fetch_add(1, Ordering::Relaxed);
        } else if failure.status == StatusCode::TOO_MANY_REQUESTS {
            self.telemetry.rate_limited_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.telemetry.client_error_total.fetch_add(1, Ordering::Relaxed);
        }
        debug!(code = failure.code, status = failure.status.as_u16(), "request rejected");
        failure
    }

    /// Opens the store on a blocking thread and runs `op` against it, giving
    /// up after the configured operation timeout.
    ///
    /// Writes made by `op` commit only while the caller is still waiting. A
    /// timeout therefore means nothing was written, unless a commit had
    /// already started, in which case the call waits for it to finish.
    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, CallFailure>
    where
        T: Send + 'static,
        F: FnOnce(SqliteQueryStore) -> anyhow::Result<T> + Send + 'static,
    {
        let db_path = self.config.db_path.clone();
        let timeout = self.config.operation_timeout;
        let cutoff = WriteCutoff::with_deadline(Instant::now() + timeout);
        let task_cutoff = cutoff.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let mut store = SqliteQueryStore::open_with_busy_timeout(&db_path, timeout)?;
            store.set_write_cutoff(task_cutoff);
            store.migrate()?;
            op(store)
        });

        let waited = tokio::time::timeout(timeout, &mut handle).await;
        let join_result = match waited {
            Ok(join_result) => join_result,
            Err(_) if cutoff.abandon() => {
                self.telemetry.timeout_total.fetch_add(1, Ordering::Relaxed);
                return Err(CallFailure::Store(LedgerError::StoreUnavailable(format!(
                    "{operation_label} timed out after {} ms",
                    timeout.as_millis()
                ))));
            }
            Err(_) => {
                debug!(operation = operation_label, "commit in flight at timeout, waiting");
                handle.await
            }
        };

        let op_result = join_result
            .map_err(|err| CallFailure::Internal(format!("{operation_label} join failure: {err}")))?;

        op_result.map_err(|err| CallFailure::Store(LedgerError::StoreUnavailable(format!("{err:#}"))))
    }

    /// Maps a failed store call to the degraded success response, or to a
    /// generic 500 when the failure was not a store fault.
    fn degrade(&self, operation_label: &'static str, failure: CallFailure) -> Response {
        match failure {
            CallFailure::Store(err) => {
                warn!(operation = operation_label, error = %err, "store unavailable, degrading");
                self.telemetry.degraded_total.fetch_add(1, Ordering::Relaxed);
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                respond(
                    StatusCode::OK,
                    &DegradedData {
                        logged: false,
                        message: "Query logging temporarily unavailable",
                    },
                    "Database connection failed",
                )
            }
            CallFailure::Internal(detail) => {
                error!(operation = operation_label, detail = %detail, "internal failure");
                self.reject(ServiceFailure::internal()).into_response()
            }
        }
    }

    fn succeed<T: Serialize>(&self, data: &T, message: &str) -> Response {
        self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
        respond(StatusCode::OK, data, message)
    }
}

impl ServiceTelemetry {
    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            client_error_total: self.client_error_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            degraded_total: self.degraded_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn response_timestamp() -> String {
    format_rfc3339(now_utc_seconds()).unwrap_or_default()
}

fn respond<T: Serialize>(status: StatusCode, data: &T, message: &str) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => {
            let payload = ServiceEnvelope {
                success: true,
                timestamp: response_timestamp(),
                data,
                message: Some(message.to_string()),
            };
            (status, Json(payload)).into_response()
        }
        Err(err) => {
            error!(error = %err, "failed to serialize response data");
            ServiceFailure::internal().into_response()
        }
    }
}

fn cors_layer(config: &ServiceConfig) -> CorsLayer {
    let origins = if config.allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(config.allowed_origins.clone())
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
        .max_age(std::time::Duration::from_secs(CORS_MAX_AGE_SECS))
}

fn app(state: ServiceState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/", any(handle))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServiceConfig::try_from(args)?;
    let bind = config.bind;

    info!(
        db = %config.db_path.display(),
        %bind,
        timeout_ms = u64::try_from(config.operation_timeout.as_millis()).unwrap_or(u64::MAX),
        max_requests_per_hour = config.max_requests_per_hour,
        debug = config.enable_debug,
        "starting serial ledger service"
    );

    let state = ServiceState::new(config);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn handle(State(state): State<ServiceState>, request: Request) -> Response {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);

    if request.method() == Method::OPTIONS {
        state.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
        return StatusCode::OK.into_response();
    }

    if request.method() == Method::GET && state.config.enable_debug && wants_debug(&request) {
        let diagnostics = DebugData {
            location: diagnose_location(&state.config.db_path),
            version: SERVICE_VERSION,
        };
        return state.succeed(&diagnostics, "Debug information");
    }

    if request.method() != Method::POST {
        debug!(method = %request.method(), "rejected non-POST request");
        return state.reject(ServiceFailure::method_not_allowed()).into_response();
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let headers = request.headers();
    let client_identity = resolve_client_identity(
        &state.config.forwarded_headers,
        |name| headers.get(name).and_then(|value| value.to_str().ok()),
        peer,
    );
    let user_agent = headers
        .get(header::USER_AGENT)
        .map(user_agent_text)
        .unwrap_or_default();

    if !state
        .limiter
        .allow(&client_identity, state.config.max_requests_per_hour)
    {
        warn!(client = %client_identity, "rate limit exceeded");
        return state.reject(ServiceFailure::rate_limited()).into_response();
    }

    let body = decode_body(request).await;

    let action = match Action::decode(&body) {
        Ok(action) => action,
        Err(err) => {
            debug!(error = %err, "rejected request action");
            return state.reject(ServiceFailure::invalid_action(&err)).into_response();
        }
    };

    match action {
        Action::LogQuery {
            serial_number,
            is_winner,
        } => log_query(&state, &serial_number, is_winner, client_identity, user_agent).await,
        Action::GetStats => get_stats(&state).await,
        Action::HealthCheck => health_check(&state).await,
    }
}

/// Reads the action payload. Form posts become an object of string fields;
/// unreadable or non-JSON bodies decode as having no action.
async fn decode_body(request: Request) -> Value {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with(FORM_CONTENT_TYPE)
        });

    if is_form {
        return match Form::<HashMap<String, String>>::from_request(request, &()).await {
            Ok(Form(fields)) => Value::Object(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, Value::String(value)))
                    .collect(),
            ),
            Err(err) => {
                debug!(error = %err, "failed to decode form body");
                Value::Null
            }
        };
    }

    match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null),
        Err(err) => {
            debug!(error = %err, "failed to read request body");
            Value::Null
        }
    }
}

/// Header bytes as text. Agents that are not valid UTF-8 keep their raw
/// bytes as escapes so distinct agents stay distinct.
fn user_agent_text(value: &HeaderValue) -> String {
    match std::str::from_utf8(value.as_bytes()) {
        Ok(text) => text.to_string(),
        Err(_) => value.as_bytes().escape_ascii().to_string(),
    }
}

fn wants_debug(request: &Request) -> bool {
    request.uri().query().is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some("debug"))
    })
}

async fn log_query(
    state: &ServiceState,
    raw_serial: &str,
    is_winner: bool,
    client_identity: String,
    user_agent: String,
) -> Response {
    let Ok(serial_number) = SerialNumber::parse(raw_serial) else {
        debug!(serial = raw_serial, "rejected invalid serial");
        return state.reject(ServiceFailure::invalid_serial()).into_response();
    };

    let query = NewQuery {
        serial_number: serial_number.clone(),
        is_winner,
        client_identity,
        user_agent,
    };

    let outcome = state
        .run_blocking("log_query", move |mut store| {
            match store.record_query(&query) {
                Ok(recorded) => Ok(LogQueryData {
                    logged: true,
                    log_id: Some(recorded.event_id),
                    serial_number: query.serial_number.to_string(),
                    is_winner: query.is_winner,
                    previous_queries: recorded.previous_queries,
                }),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to record query");
                    let previous_queries = store
                        .previous_query_info(
                            &query.serial_number,
                            &query.client_identity,
                            &query.user_agent,
                        )
                        .unwrap_or_else(|read_err| {
                            warn!(error = %format!("{read_err:#}"), "failed to read previous queries");
                            None
                        });
                    Ok(LogQueryData {
                        logged: false,
                        log_id: None,
                        serial_number: query.serial_number.to_string(),
                        is_winner: query.is_winner,
                        previous_queries,
                    })
                }
            }
        })
        .await;

    match outcome {
        Ok(data) => {
            info!(
                serial = %serial_number,
                logged = data.logged,
                repeat = data.previous_queries.is_some(),
                "serial query handled"
            );
            state.succeed(&data, "Query logged successfully")
        }
        Err(failure) => state.degrade("log_query", failure),
    }
}

async fn get_stats(state: &ServiceState) -> Response {
    match state.run_blocking("get_stats", |store| store.stats()).await {
        Ok(stats) => state.succeed::<QueryStats>(&stats, "Statistics retrieved"),
        Err(failure) => state.degrade("get_stats", failure),
    }
}

async fn health_check(state: &ServiceState) -> Response {
    let database = match state.run_blocking("health_check", |store| store.ping()).await {
        Ok(()) => true,
        Err(CallFailure::Store(err)) => {
            warn!(error = %err, "health check found store unreachable");
            false
        }
        Err(CallFailure::Internal(detail)) => {
            error!(detail = %detail, "health check store call failed");
            false
        }
    };

    let data = HealthData {
        database,
        database_type: "SQLite3",
        database_path: state.config.db_path.display().to_string(),
        version: SERVICE_VERSION,
        timestamp: response_timestamp(),
        server: state.config.server_name.clone(),
        telemetry: state.telemetry.snapshot(),
    };
    state.succeed(&data, "API is healthy")
}
